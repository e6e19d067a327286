//! Transient TCP connections to the ADB server.
//!
//! Host commands are one request, one status word, at most one reply, on a
//! connection of their own. A connection lives longer only after being
//! promoted to a shell, sync, or track stream, at which point the default
//! deadline comes off and the caller owns its lifetime.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use adbx_proto::codec;
use adbx_proto::Result;

/// Deadline applied to single-exchange host commands.
pub(crate) const HOST_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection to the ADB server.
///
/// Implements [`Read`]/[`Write`] so the wire-layer functions (and callers
/// holding a promoted shell stream) can drive it directly.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    /// Dials the server with the host-command deadline applied.
    pub(crate) fn dial(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address)?;
        stream.set_read_timeout(Some(HOST_COMMAND_TIMEOUT))?;
        stream.set_write_timeout(Some(HOST_COMMAND_TIMEOUT))?;
        Ok(Self { stream })
    }

    /// Removes the deadlines. Streaming modes (shell, sync, track) block
    /// indefinitely; callers impose their own timeout policy if they need
    /// one.
    pub(crate) fn clear_timeouts(&self) -> Result<()> {
        self.stream.set_read_timeout(None)?;
        self.stream.set_write_timeout(None)?;
        Ok(())
    }

    /// Writes one length-prefixed request.
    pub(crate) fn send(&mut self, request: &str) -> Result<()> {
        codec::write_message(&mut self.stream, request.as_bytes())
    }

    /// Reads the status word, requiring `OKAY`.
    pub(crate) fn expect_ok(&mut self) -> Result<()> {
        codec::read_status(&mut self.stream, &[])?;
        Ok(())
    }

    /// Reads one length-prefixed reply.
    pub(crate) fn read_message(&mut self) -> Result<Vec<u8>> {
        codec::read_message(&mut self.stream)
    }

    /// Reads until the peer closes the connection (shell streams carry no
    /// length header).
    pub(crate) fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.stream.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// A second handle to the socket, used to shut it down from another
    /// thread (watcher close, upload cancel).
    pub(crate) fn shutdown_handle(&self) -> Result<TcpStream> {
        Ok(self.stream.try_clone()?)
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// Shuts down a cloned socket handle, waking any blocked read on it.
pub(crate) fn shutdown_socket(socket: &TcpStream) {
    let _ = socket.shutdown(Shutdown::Both);
}

/// Dials, sends `request`, requires `OKAY`, reads one reply, closes.
pub(crate) fn request_response(address: &str, request: &str) -> Result<Vec<u8>> {
    let mut conn = Connection::dial(address)?;
    conn.send(request)?;
    conn.expect_ok()?;
    conn.read_message()
}

/// Dials, sends `request`, requires `OKAY`, closes.
pub(crate) fn send(address: &str, request: &str) -> Result<()> {
    let mut conn = Connection::dial(address)?;
    conn.send(request)?;
    conn.expect_ok()
}
