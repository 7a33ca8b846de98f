//! Bump-pointer arena backing the model weights and filter scratch
//!
//! One contiguous region is reserved at startup and never grows. Allocation
//! is an 8-byte-aligned bump with no per-object free. Two consumers:
//!
//! - The model loader places every weight slab here, contiguously, so that a
//!   slab's [`Slab::offset_f32`] doubles as the float offset into the
//!   device-resident copy of the same region (the matmul kernel addresses
//!   weights by integer offset).
//! - The filter engine allocates per-pass scratch strings here and releases
//!   them wholesale with [`Arena::mark`] / [`Arena::rewind`].
//!
//! Handles ([`Slab`], [`StrRef`]) are plain `(offset, len)` pairs rather
//! than references, so holding one never borrows the arena.

use thiserror::Error;

const ALIGN: usize = 8;

#[derive(Error, Debug)]
pub enum ArenaError {
    #[error("arena exhausted: used {used} of {capacity} bytes, requested {requested}")]
    Exhausted {
        used: usize,
        capacity: usize,
        requested: usize,
    },
}

/// Handle to a float slab allocated from the arena.
///
/// `offset_f32` is the element offset from the arena base, which is also the
/// offset the GPU matmul kernel uses into the uploaded weights buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slab {
    pub offset_f32: u32,
    pub len: usize,
}

/// Handle to a byte string placed in the arena's scratch region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrRef {
    offset: usize,
    len: usize,
}

impl StrRef {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

/// Opaque snapshot of the arena's high-water mark.
#[derive(Debug, Clone, Copy)]
pub struct ArenaMark(usize);

pub struct Arena {
    /// u64 storage guarantees 8-byte alignment for the f32 slab views.
    buf: Vec<u64>,
    used: usize,
}

impl Arena {
    /// Reserve a region of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u64; capacity.div_ceil(ALIGN)],
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len() * ALIGN
    }

    pub fn used(&self) -> usize {
        self.used
    }

    fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.buf)
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.buf)
    }

    fn bump(&mut self, size: usize) -> Result<usize, ArenaError> {
        let padding = (ALIGN - self.used % ALIGN) % ALIGN;
        let start = self.used + padding;
        if start + size > self.capacity() {
            return Err(ArenaError::Exhausted {
                used: self.used,
                capacity: self.capacity(),
                requested: size,
            });
        }
        self.used = start + size;
        Ok(start)
    }

    /// Allocate `count` zeroed floats. The slab's offset is stable for the
    /// lifetime of the arena.
    pub fn alloc_f32s(&mut self, count: usize) -> Result<Slab, ArenaError> {
        let start = self.bump(count * std::mem::size_of::<f32>())?;
        debug_assert_eq!(start % std::mem::size_of::<f32>(), 0);
        Ok(Slab {
            offset_f32: (start / std::mem::size_of::<f32>()) as u32,
            len: count,
        })
    }

    pub fn f32s(&self, slab: Slab) -> &[f32] {
        let start = slab.offset_f32 as usize * std::mem::size_of::<f32>();
        let bytes = &self.bytes()[start..start + slab.len * std::mem::size_of::<f32>()];
        bytemuck::cast_slice(bytes)
    }

    pub fn f32s_mut(&mut self, slab: Slab) -> &mut [f32] {
        let start = slab.offset_f32 as usize * std::mem::size_of::<f32>();
        let end = start + slab.len * std::mem::size_of::<f32>();
        bytemuck::cast_slice_mut(&mut self.bytes_mut()[start..end])
    }

    /// The occupied prefix of the region, as raw bytes. This is what gets
    /// uploaded to the device after the weight slabs are loaded.
    pub fn occupied_bytes(&self) -> &[u8] {
        &self.bytes()[..self.used]
    }

    /// Copy a byte string into the arena and return its handle.
    pub fn push_str(&mut self, s: &str) -> Result<StrRef, ArenaError> {
        let start = self.bump(s.len())?;
        self.bytes_mut()[start..start + s.len()].copy_from_slice(s.as_bytes());
        Ok(StrRef {
            offset: start,
            len: s.len(),
        })
    }

    pub fn str_of(&self, r: StrRef) -> &str {
        // push_str only ever stores whole &str contents, so the bytes are
        // valid UTF-8.
        std::str::from_utf8(&self.bytes()[r.offset..r.offset + r.len]).unwrap_or("")
    }

    /// Snapshot the current offset.
    pub fn mark(&self) -> ArenaMark {
        ArenaMark(self.used)
    }

    /// Roll back to a prior snapshot, releasing everything allocated since.
    pub fn rewind(&mut self, mark: ArenaMark) {
        debug_assert!(mark.0 <= self.used);
        self.used = mark.0;
    }

    /// Release everything.
    pub fn reset(&mut self) {
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_eight_byte_aligned() {
        let mut arena = Arena::with_capacity(1024);
        arena.push_str("abc").unwrap();
        let slab = arena.alloc_f32s(4).unwrap();
        assert_eq!((slab.offset_f32 as usize * 4) % 8, 0);
    }

    #[test]
    fn slabs_are_contiguous_in_allocation_order() {
        let mut arena = Arena::with_capacity(1024);
        let a = arena.alloc_f32s(16).unwrap();
        let b = arena.alloc_f32s(8).unwrap();
        assert_eq!(b.offset_f32, a.offset_f32 + 16);
    }

    #[test]
    fn exhaustion_is_an_error_not_a_panic() {
        let mut arena = Arena::with_capacity(64);
        let result = arena.alloc_f32s(1024);
        assert!(matches!(result, Err(ArenaError::Exhausted { .. })));
    }

    #[test]
    fn rewind_restores_high_water_mark() {
        let mut arena = Arena::with_capacity(1024);
        arena.alloc_f32s(8).unwrap();
        let mark = arena.mark();
        let before = arena.used();

        arena.push_str("scratch string one").unwrap();
        arena.push_str("scratch string two").unwrap();
        assert!(arena.used() > before);

        arena.rewind(mark);
        assert_eq!(arena.used(), before);
    }

    #[test]
    fn str_roundtrip() {
        let mut arena = Arena::with_capacity(256);
        let r = arena.push_str("priority").unwrap();
        assert_eq!(arena.str_of(r), "priority");
    }

    #[test]
    fn f32_slab_write_read() {
        let mut arena = Arena::with_capacity(256);
        let slab = arena.alloc_f32s(3).unwrap();
        arena.f32s_mut(slab).copy_from_slice(&[1.0, 2.0, 3.0]);
        assert_eq!(arena.f32s(slab), &[1.0, 2.0, 3.0]);
    }
}
