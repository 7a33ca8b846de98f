//! Little-endian primitives shared by the sidecar formats
//!
//! All three sidecars (`.memo`, `.txt`, `.meta`) and the model/tokenizer
//! readers use the same conventions: `i32`/`u64`/`f32` little-endian, string
//! payloads length-prefixed with an `i32`.

use std::io::{self, Read, Write};

pub fn read_i32<R: Read>(r: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn read_f32<R: Read>(r: &mut R) -> io::Result<f32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_i32<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f32<W: Write>(w: &mut W, v: f32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// Read a length-prefixed byte string. A negative length is corrupt input.
pub fn read_lp_bytes<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = read_i32(r)?;
    if len < 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("negative string length {len}"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn write_lp_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_i32(w, bytes.len() as i32)?;
    w.write_all(bytes)
}
