//! Host-mode framing: `HHHH` hex length prefixes and 4-byte status words.
//!
//! Every request to the server is the payload length as exactly four
//! lowercase hex digits followed by the payload. Responses open with a
//! 4-byte status word; `OKAY` may be followed by a reply frame, `FAIL` is
//! always followed by one carrying the error message.

use std::io::{self, Read, Write};

use crate::{Error, Result};

/// Status word opening every successful server response.
pub const OKAY: [u8; 4] = *b"OKAY";
/// Status word for a failed request; a length-prefixed message follows.
pub const FAIL: [u8; 4] = *b"FAIL";

/// Maximum payload of a host-mode frame. The length field is four hex
/// digits, so anything longer cannot be framed.
pub const MAX_MESSAGE_LENGTH: usize = 0xFFFF;

/// Encodes `payload` as a `HHHH`-prefixed frame.
pub fn encode_message(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_MESSAGE_LENGTH {
        return Err(Error::MessageTooLong(payload.len()));
    }
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(format!("{:04x}", payload.len()).as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Encodes `payload` and writes the frame to `w`.
pub fn write_message<W: Write>(w: &mut W, payload: &[u8]) -> Result<()> {
    w.write_all(&encode_message(payload)?)?;
    w.flush()?;
    Ok(())
}

/// Reads one `HHHH`-prefixed frame and returns its payload.
pub fn read_message<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_length(r)?;
    let mut payload = vec![0u8; len];
    read_full(r, &mut payload, "message data")?;
    Ok(payload)
}

/// Reads the 4-byte status word, consuming nothing past it on success.
///
/// An empty `accept` set means only [`OKAY`] passes. `FAIL` always consumes
/// the trailing message frame and surfaces it through
/// [`Error::from_server_message`]; any other word outside `accept` is
/// [`Error::UnexpectedStatus`].
pub fn read_status<R: Read>(r: &mut R, accept: &[[u8; 4]]) -> Result<[u8; 4]> {
    let mut status = [0u8; 4];
    read_full(r, &mut status, "status")?;
    if status == FAIL {
        let msg = read_message(r)?;
        return Err(Error::from_server_message(
            String::from_utf8_lossy(&msg).into_owned(),
        ));
    }
    let accepted = if accept.is_empty() {
        status == OKAY
    } else {
        accept.contains(&status)
    };
    if accepted {
        Ok(status)
    } else if accept.is_empty() {
        Err(Error::unexpected_status(&[OKAY], status))
    } else {
        Err(Error::unexpected_status(accept, status))
    }
}

/// Reads exactly `buf.len()` bytes, reporting exact counts on a short read.
pub(crate) fn read_full<R: Read>(r: &mut R, buf: &mut [u8], what: &'static str) -> Result<()> {
    let want = buf.len();
    let mut got = 0;
    while got < want {
        match r.read(&mut buf[got..]) {
            Ok(0) => return Err(Error::IncompleteMessage { what, got, want }),
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn read_length<R: Read>(r: &mut R) -> Result<usize> {
    let mut hex = [0u8; 4];
    read_full(r, &mut hex, "length")?;
    let digits = std::str::from_utf8(&hex)
        .map_err(|_| Error::Parse(format!("length field is not ASCII: {hex:?}")))?;
    usize::from_str_radix(digits, 16)
        .map_err(|_| Error::Parse(format!("invalid hex length: {digits:?}")))
}
