//! Sync-mode framing: 4-byte tags followed by u32 little-endian integers.
//!
//! Entered by sending `sync:` on a transport-bound connection. Unlike host
//! mode, lengths here are binary little-endian, never hex. Requests are
//! `TAG | LEN(u32-LE) | PAYLOAD`; `STAT` responses carry a 12-byte
//! mode/size/mtime triple, `RECV` streams `DATA` chunks ended by `DONE`,
//! and `SEND` ends with a `DONE` trailer carrying the modification time.

use std::io::{Read, Write};

use crate::codec::{read_full, FAIL, OKAY};
use crate::{Error, Result};

/// Sync request: file metadata for a path.
pub const STAT: [u8; 4] = *b"STAT";
/// Sync request: directory listing for a path.
pub const LIST: [u8; 4] = *b"LIST";
/// Sync request: stream a file's contents to the host.
pub const RECV: [u8; 4] = *b"RECV";
/// Sync request: stream a file's contents to the device.
pub const SEND: [u8; 4] = *b"SEND";
/// Sync chunk: `len` bytes of file content follow.
pub const DATA: [u8; 4] = *b"DATA";
/// Sync chunk: end of stream (or, in `SEND`, the mtime trailer).
pub const DONE: [u8; 4] = *b"DONE";
/// Sync chunk: one directory entry in a `LIST` response.
pub const DENT: [u8; 4] = *b"DENT";

/// Sync chunks cannot be longer than 64 KiB; larger payloads are split by
/// the writer.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Writes a sync request: `tag | len(u32-LE) | payload`.
///
/// The payload is a device path (or `path,mode` for [`SEND`]) and shares
/// the chunk bound.
pub fn write_request<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_CHUNK_SIZE {
        return Err(Error::MessageTooLong(payload.len()));
    }
    w.write_all(&tag)?;
    write_u32_le(w, payload.len() as u32)?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

/// Reads a 4-byte sync tag.
pub fn read_tag<R: Read>(r: &mut R) -> Result<[u8; 4]> {
    let mut tag = [0u8; 4];
    read_full(r, &mut tag, "sync tag")?;
    Ok(tag)
}

/// Reads the next tag, requiring it to be `want`.
///
/// A `FAIL` consumes its message and maps it; any other word is an
/// unexpected status.
pub fn expect_tag<R: Read>(r: &mut R, want: [u8; 4]) -> Result<()> {
    let tag = read_tag(r)?;
    if tag == want {
        Ok(())
    } else if tag == FAIL {
        Err(read_fail(r))
    } else {
        Err(Error::unexpected_status(&[want], tag))
    }
}

/// Reads exactly `len` bytes.
pub fn read_bytes<R: Read>(r: &mut R, len: usize, what: &'static str) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    read_full(r, &mut buf, what)?;
    Ok(buf)
}

/// Reads a little-endian u32.
pub fn read_u32_le<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_full(r, &mut buf, "sync integer")?;
    Ok(u32::from_le_bytes(buf))
}

/// Writes a little-endian u32.
pub fn write_u32_le<W: Write>(w: &mut W, n: u32) -> Result<()> {
    w.write_all(&n.to_le_bytes())?;
    Ok(())
}

/// One frame of a `RECV` stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    /// `DATA`: this many bytes of file content follow.
    Data(u32),
    /// `DONE`: end of stream. The trailing integer is discarded.
    Done,
}

/// Reads the header of the next `DATA`/`DONE` chunk.
///
/// A `FAIL` tag consumes its little-endian message and returns the mapped
/// server error.
pub fn read_chunk_header<R: Read>(r: &mut R) -> Result<Chunk> {
    let tag = read_tag(r)?;
    if tag == DATA {
        Ok(Chunk::Data(read_u32_le(r)?))
    } else if tag == DONE {
        read_u32_le(r)?;
        Ok(Chunk::Done)
    } else if tag == FAIL {
        Err(read_fail(r))
    } else {
        Err(Error::unexpected_status(&[DATA, DONE], tag))
    }
}

/// Writes one `DATA` chunk. `data` must already be within the chunk bound.
pub fn write_chunk<W: Write>(w: &mut W, data: &[u8]) -> Result<()> {
    debug_assert!(data.len() <= MAX_CHUNK_SIZE);
    w.write_all(&DATA)?;
    write_u32_le(w, data.len() as u32)?;
    w.write_all(data)?;
    Ok(())
}

/// Writes the `DONE` trailer ending a `SEND` stream, carrying the file
/// modification time as Unix seconds.
pub fn write_done<W: Write>(w: &mut W, mtime: u32) -> Result<()> {
    w.write_all(&DONE)?;
    write_u32_le(w, mtime)?;
    w.flush()?;
    Ok(())
}

/// Reads the final status of a `SEND` exchange.
///
/// This is sync mode: a `FAIL` here is followed by a little-endian length,
/// not a hex one.
pub fn read_status<R: Read>(r: &mut R) -> Result<()> {
    let tag = read_tag(r)?;
    if tag == OKAY {
        // OKAY carries a placeholder length of zero.
        read_u32_le(r)?;
        Ok(())
    } else if tag == FAIL {
        Err(read_fail(r))
    } else {
        Err(Error::unexpected_status(&[OKAY], tag))
    }
}

/// The raw mode/size/mtime triple in a `STAT` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawStat {
    /// POSIX file mode bits.
    pub mode: u32,
    /// File size in bytes, truncated to 32 bits.
    pub size: u32,
    /// Modification time, Unix seconds UTC.
    pub mtime: u32,
}

impl RawStat {
    /// adb reports a missing path as an all-zero triple rather than an
    /// error. Theoretically a real file could match, but that would be an
    /// empty file from the epoch with no mode bits.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        self.mode == 0 && self.size == 0 && self.mtime == 0
    }
}

/// Reads the 12-byte body of a `STAT` response.
pub fn read_stat<R: Read>(r: &mut R) -> Result<RawStat> {
    Ok(RawStat {
        mode: read_u32_le(r)?,
        size: read_u32_le(r)?,
        mtime: read_u32_le(r)?,
    })
}

/// Consumes the little-endian message following a sync-mode `FAIL` and
/// maps it to the matching error kind.
pub fn read_fail<R: Read>(r: &mut R) -> Error {
    let msg = read_u32_le(r).and_then(|len| {
        let mut msg = vec![0u8; len as usize];
        read_full(r, &mut msg, "failure message")?;
        Ok(msg)
    });
    match msg {
        Ok(msg) => Error::from_server_message(String::from_utf8_lossy(&msg).into_owned()),
        Err(e) => e,
    }
}
