//! Length-prefixed framing used by every TCP message between nodes.
//!
//! The vocabulary is three primitives over a reliable byte stream:
//! big-endian fixed-width integers, strings with a u16 length prefix
//! followed by UTF-8 bytes, and raw blobs of a known size. There are no
//! delimiters and no self-describing types; both sides must follow the
//! same wire script. EOF in the middle of a frame fails the connection.

use std::io::{self, Read, Write};

/// Sentinel a server sends in place of a file length when the file is
/// not shared (the two's-complement rendering of -1).
pub const NO_SUCH_FILE: u64 = u64::MAX;
/// Sentinel a server sends in place of a chunk id when it cannot serve
/// the requested chunk.
pub const NO_SUCH_CHUNK: u32 = u32::MAX;

pub fn write_u32<W: Write>(w: &mut W, value: u32) -> io::Result<()> {
    w.write_all(&value.to_be_bytes())
}

pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

pub fn write_u64<W: Write>(w: &mut W, value: u64) -> io::Result<()> {
    w.write_all(&value.to_be_bytes())
}

pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// u16 length prefix, then that many bytes of UTF-8.
pub fn write_string<W: Write>(w: &mut W, value: &str) -> io::Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "string too long for u16 length prefix",
        ));
    }
    w.write_all(&(bytes.len() as u16).to_be_bytes())?;
    w.write_all(bytes)
}

pub fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let mut prefix = [0u8; 2];
    r.read_exact(&mut prefix)?;
    let len = u16::from_be_bytes(prefix) as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "string is not valid UTF-8"))
}

/// Exactly `len` bytes of raw payload.
pub fn read_blob<R: Read>(r: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    Ok(bytes)
}
