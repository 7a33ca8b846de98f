//! Packed model file parsing and arena weight layout
//!
//! # File format
//!
//! ```text
//! Offset  Size         Description
//! ─────────────────────────────────────────────────────────────
//! 0x00    7 × i32 LE   Config: dim, hidden_dim, n_layers,
//!                      n_heads, n_kv_heads, vocab_size, seq_len
//! 0x1C    f32 slabs    token_embedding  (vocab, dim)
//!                      rms_att          (layers, dim)
//!                      wq               (layers, dim, dim)
//!                      wk               (layers, kv_dim, dim)
//!                      wv               (layers, kv_dim, dim)
//!                      wo               (layers, dim, dim)
//!                      rms_ffn          (layers, dim)
//!                      w1               (layers, hidden, dim)
//!                      w2               (layers, dim, hidden)
//!                      w3               (layers, hidden, dim)
//!                      rms_final        (dim,)
//!                      wcls             (vocab, dim)  optional
//! ```
//!
//! Slabs are copied into the arena in file order so that each slab's float
//! offset is also its offset into the device-resident weights buffer. When
//! the classifier slab is absent the classifier aliases the token embedding
//! table (tied weights).

use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;

use crate::arena::{Arena, ArenaError, Slab};

pub const CONFIG_SIZE: usize = 7 * std::mem::size_of::<i32>();

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to read model file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid model: {0}")]
    Invalid(String),

    #[error("model does not fit in the arena: {0}")]
    Arena(#[from] ArenaError),
}

/// Transformer dimensions, read verbatim from the model header.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub dim: i32,
    pub hidden_dim: i32,
    pub n_layers: i32,
    pub n_heads: i32,
    pub n_kv_heads: i32,
    pub vocab_size: i32,
    pub seq_len: i32,
}

impl Config {
    fn from_bytes(bytes: &[u8]) -> Self {
        let mut vals = [0i32; 7];
        for (i, v) in vals.iter_mut().enumerate() {
            *v = i32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        }
        Self {
            dim: vals[0],
            hidden_dim: vals[1],
            n_layers: vals[2],
            n_heads: vals[3],
            n_kv_heads: vals[4],
            vocab_size: vals[5],
            seq_len: vals[6],
        }
    }

    fn validate(&self) -> Result<(), ModelError> {
        let all = [
            self.dim,
            self.hidden_dim,
            self.n_layers,
            self.n_heads,
            self.n_kv_heads,
            self.vocab_size,
            self.seq_len,
        ];
        if all.iter().any(|&v| v <= 0) {
            return Err(ModelError::Invalid(format!(
                "non-positive dimension in header: {self:?}"
            )));
        }
        if self.dim % self.n_heads != 0 {
            return Err(ModelError::Invalid(format!(
                "dim {} not divisible by n_heads {}",
                self.dim, self.n_heads
            )));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(ModelError::Invalid(format!(
                "n_heads {} not divisible by n_kv_heads {}",
                self.n_heads, self.n_kv_heads
            )));
        }
        Ok(())
    }

    pub fn head_size(&self) -> usize {
        (self.dim / self.n_heads) as usize
    }

    pub fn kv_dim(&self) -> usize {
        (self.dim * self.n_kv_heads / self.n_heads) as usize
    }

    /// How many query heads share each key/value head.
    pub fn kv_mul(&self) -> usize {
        (self.n_heads / self.n_kv_heads) as usize
    }
}

/// Arena handles for every weight slab. Immutable once loaded.
#[derive(Debug, Clone, Copy)]
pub struct Weights {
    pub token_embedding: Slab,
    pub rms_att: Slab,
    pub wq: Slab,
    pub wk: Slab,
    pub wv: Slab,
    pub wo: Slab,
    pub rms_ffn: Slab,
    pub w1: Slab,
    pub w2: Slab,
    pub w3: Slab,
    pub rms_final: Slab,
    /// Classifier; aliases `token_embedding` when the file carries no
    /// classifier slab.
    pub wcls: Slab,
    pub tied: bool,
}

/// Copy the next `count` floats of the file into a fresh arena slab.
fn read_slab(
    arena: &mut Arena,
    bytes: &[u8],
    cursor: &mut usize,
    count: usize,
    name: &str,
) -> Result<Slab, ModelError> {
    let byte_len = count * std::mem::size_of::<f32>();
    let end = *cursor + byte_len;
    if end > bytes.len() {
        return Err(ModelError::Invalid(format!(
            "short read for {name}: need {byte_len} bytes at offset {cursor}, file has {}",
            bytes.len()
        )));
    }
    let slab = arena.alloc_f32s(count)?;
    let src: &[f32] = bytemuck::try_cast_slice(&bytes[*cursor..end])
        .map_err(|_| ModelError::Invalid(format!("misaligned slab {name}")))?;
    arena.f32s_mut(slab).copy_from_slice(src);
    *cursor = end;
    Ok(slab)
}

/// Parse the model file and lay its weights out in the arena.
///
/// # Safety
///
/// This uses memory mapping which is inherently unsafe:
/// - If the file is truncated while mapped, reads may cause SIGBUS
/// - The file should not be modified while the loader is reading it
///
/// The mapping lives only for the duration of this call; every slab is
/// copied into the arena before it returns. `bytemuck` handles the
/// byte-to-float conversion with alignment checks.
pub fn load<P: AsRef<Path>>(path: P, arena: &mut Arena) -> Result<(Config, Weights), ModelError> {
    let file = std::fs::File::open(path.as_ref())?;
    let mmap = unsafe { Mmap::map(&file)? };

    if mmap.len() < CONFIG_SIZE {
        return Err(ModelError::Invalid(format!(
            "file too small for config header: {} bytes",
            mmap.len()
        )));
    }
    let config = Config::from_bytes(&mmap[..CONFIG_SIZE]);
    config.validate()?;

    let dim = config.dim as usize;
    let hidden = config.hidden_dim as usize;
    let layers = config.n_layers as usize;
    let vocab = config.vocab_size as usize;
    let kv_dim = config.kv_dim();

    let mut cursor = CONFIG_SIZE;
    let token_embedding = read_slab(arena, &mmap, &mut cursor, vocab * dim, "token_embedding")?;
    let rms_att = read_slab(arena, &mmap, &mut cursor, layers * dim, "rms_att")?;
    let wq = read_slab(arena, &mmap, &mut cursor, layers * dim * dim, "wq")?;
    let wk = read_slab(arena, &mmap, &mut cursor, layers * dim * kv_dim, "wk")?;
    let wv = read_slab(arena, &mmap, &mut cursor, layers * dim * kv_dim, "wv")?;
    let wo = read_slab(arena, &mmap, &mut cursor, layers * dim * dim, "wo")?;
    let rms_ffn = read_slab(arena, &mmap, &mut cursor, layers * dim, "rms_ffn")?;
    let w1 = read_slab(arena, &mmap, &mut cursor, layers * hidden * dim, "w1")?;
    let w2 = read_slab(arena, &mmap, &mut cursor, layers * dim * hidden, "w2")?;
    let w3 = read_slab(arena, &mmap, &mut cursor, layers * hidden * dim, "w3")?;
    let rms_final = read_slab(arena, &mmap, &mut cursor, dim, "rms_final")?;

    let remaining = mmap.len() - cursor;
    let wcls_bytes = vocab * dim * std::mem::size_of::<f32>();
    let (wcls, tied) = if remaining >= wcls_bytes {
        (read_slab(arena, &mmap, &mut cursor, vocab * dim, "wcls")?, false)
    } else {
        tracing::debug!(remaining, wcls_bytes, "no classifier slab, tying to embedding");
        (token_embedding, true)
    };

    tracing::debug!(
        dim,
        hidden,
        layers,
        heads = config.n_heads,
        kv_heads = config.n_kv_heads,
        vocab,
        seq_len = config.seq_len,
        tied,
        "model loaded"
    );

    Ok((
        config,
        Weights {
            token_embedding,
            rms_att,
            wq,
            wk,
            wv,
            wo,
            rms_ffn,
            w1,
            w2,
            w3,
            rms_final,
            wcls,
            tied,
        },
    ))
}
