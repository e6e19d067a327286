//! The sync channel: file metadata, directory listings, and chunked
//! transfers.
//!
//! A transport-bound connection is promoted with `sync:`; everything after
//! that is the binary sub-protocol from `adbx-proto::sync`. Each operation
//! here owns its connection for its whole lifetime.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use adbx_proto::sync::{self, Chunk, RawStat};
use adbx_proto::{Error, Result};

use crate::device::Device;
use crate::transport::Connection;

/// POSIX file-type bits as the device reports them.
pub mod file_mode {
    /// Directory.
    pub const DIR: u32 = 0o040_000;
    /// Symbolic link.
    pub const SYMLINK: u32 = 0o120_000;
    /// Unix socket.
    pub const SOCKET: u32 = 0o140_000;
    /// Named pipe.
    pub const FIFO: u32 = 0o010_000;
    /// Character device.
    pub const CHAR_DEVICE: u32 = 0o020_000;
}

/// Mask selecting the file-type bits of a mode.
const TYPE_MASK: u32 = 0o170_000;

/// Metadata for one file or directory entry on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name. Empty for `stat` results, which carry no name.
    pub name: String,
    /// POSIX mode bits.
    pub mode: u32,
    /// Size in bytes, truncated to 32 bits.
    pub size: u32,
    /// Modification time (Unix seconds, UTC).
    pub mtime: SystemTime,
}

impl DirEntry {
    fn from_raw(name: String, raw: RawStat) -> Self {
        DirEntry {
            name,
            mode: raw.mode,
            size: raw.size,
            mtime: UNIX_EPOCH + Duration::from_secs(u64::from(raw.mtime)),
        }
    }

    /// Whether the entry is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & TYPE_MASK == file_mode::DIR
    }

    /// Whether the entry is a symbolic link.
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & TYPE_MASK == file_mode::SYMLINK
    }

    /// The permission bits of the mode.
    #[must_use]
    pub fn permissions(&self) -> u32 {
        self.mode & 0o777
    }
}

impl Device {
    /// Opens a connection and promotes it into sync mode.
    fn open_sync(&self) -> Result<Connection> {
        let mut conn = self.attach()?;
        conn.send("sync:")?;
        conn.expect_ok()?;
        conn.clear_timeouts()?;
        Ok(conn)
    }

    /// Stats `path` on the device.
    ///
    /// The server reports a missing path as an all-zero stat; that comes
    /// back as [`Error::FileNotExist`].
    pub fn stat(&self, path: &str) -> Result<DirEntry> {
        let mut conn = self.open_sync()?;
        sync::write_request(&mut conn, sync::STAT, path.as_bytes())?;
        sync::expect_tag(&mut conn, sync::STAT)?;
        let raw = sync::read_stat(&mut conn)?;
        if raw.is_missing() {
            return Err(Error::FileNotExist);
        }
        Ok(DirEntry::from_raw(String::new(), raw))
    }

    /// Lists the entries of the directory at `path`.
    pub fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let mut conn = self.open_sync()?;
        sync::write_request(&mut conn, sync::LIST, path.as_bytes())?;
        let mut entries = Vec::new();
        loop {
            let tag = sync::read_tag(&mut conn)?;
            if tag == sync::DENT {
                let raw = sync::read_stat(&mut conn)?;
                let name_len = sync::read_u32_le(&mut conn)? as usize;
                let name = sync::read_bytes(&mut conn, name_len, "entry name")?;
                entries.push(DirEntry::from_raw(
                    String::from_utf8_lossy(&name).into_owned(),
                    raw,
                ));
            } else if tag == sync::DONE {
                // DONE carries a full, meaningless entry header.
                sync::read_bytes(&mut conn, 16, "list trailer")?;
                return Ok(entries);
            } else if tag == adbx_proto::codec::FAIL {
                return Err(sync::read_fail(&mut conn));
            } else {
                return Err(Error::unexpected_status(&[sync::DENT, sync::DONE], tag));
            }
        }
    }

    /// Opens `path` on the device for reading.
    ///
    /// A missing file surfaces here (not on first read) as
    /// [`Error::FileNotExist`].
    pub fn open_read(&self, path: &str) -> Result<FileReader> {
        let mut conn = self.open_sync()?;
        sync::write_request(&mut conn, sync::RECV, path.as_bytes())?;
        FileReader::new(conn)
    }

    /// Opens `path` on the device for writing, creating it with the
    /// permission bits of `mode`.
    ///
    /// `mtime` becomes the file's modification time; `None` means the time
    /// [`FileWriter::finish`] is called.
    pub fn open_write(
        &self,
        path: &str,
        mode: u32,
        mtime: Option<SystemTime>,
    ) -> Result<FileWriter> {
        let mut conn = self.open_sync()?;
        let request = format!("{path},{}", mode & 0o777);
        sync::write_request(&mut conn, sync::SEND, request.as_bytes())?;
        Ok(FileWriter::new(conn, mtime))
    }

    /// Copies the file at `path` into `w` and returns the byte count.
    pub fn pull(&self, path: &str, w: &mut impl Write) -> Result<u64> {
        let mut reader = self.open_read(path)?;
        io::copy(&mut reader, w).map_err(unwrap_io)
    }

    /// Copies `r` to `path` on the device and returns the byte count.
    pub fn push(
        &self,
        r: &mut impl Read,
        path: &str,
        mode: u32,
        mtime: Option<SystemTime>,
    ) -> Result<u64> {
        let mut writer = self.open_write(path, mode, mtime)?;
        let written = io::copy(r, &mut writer).map_err(unwrap_io)?;
        writer.finish()?;
        Ok(written)
    }
}

/// Recovers a typed error that a `Read`/`Write` impl had to smuggle
/// through `io::Error`.
pub(crate) fn unwrap_io(e: io::Error) -> Error {
    match e.downcast::<Error>() {
        Ok(inner) => inner,
        Err(e) => Error::Io(e),
    }
}

/// Streams a file off the device as chunked `DATA` frames.
///
/// Created by [`Device::open_read`]. Dropping the reader closes its
/// connection; any unread tail is abandoned.
#[derive(Debug)]
pub struct FileReader {
    conn: Connection,
    /// Bytes left in the current `DATA` chunk.
    remaining: usize,
    eof: bool,
}

impl FileReader {
    fn new(conn: Connection) -> Result<Self> {
        let mut reader = FileReader {
            conn,
            remaining: 0,
            eof: false,
        };
        // Consume the first chunk header now so open-time errors (missing
        // file, permission) surface at open time.
        reader.next_chunk()?;
        Ok(reader)
    }

    /// Advances to the next non-empty chunk or end of stream.
    fn next_chunk(&mut self) -> Result<()> {
        while !self.eof && self.remaining == 0 {
            match sync::read_chunk_header(&mut self.conn)? {
                Chunk::Data(len) => self.remaining = len as usize,
                Chunk::Done => self.eof = true,
            }
        }
        Ok(())
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            self.next_chunk().map_err(io::Error::other)?;
            if self.eof {
                return Ok(0);
            }
        }
        let want = buf.len().min(self.remaining);
        let n = self.conn.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file stream ended mid-chunk",
            ));
        }
        self.remaining -= n;
        Ok(n)
    }
}

/// Writes a file onto the device as chunked `DATA` frames.
///
/// Data is split into chunks of at most 64 KiB regardless of how large the
/// buffers handed to [`Write::write`] are. Call [`FileWriter::finish`] to
/// send the `DONE` trailer and collect the server's verdict; dropping the
/// writer without finishing closes the connection and abandons the
/// transfer (nothing already sent is rolled back).
#[derive(Debug)]
pub struct FileWriter {
    conn: Connection,
    mtime: Option<SystemTime>,
    bytes_written: u64,
}

impl FileWriter {
    fn new(conn: Connection, mtime: Option<SystemTime>) -> Self {
        FileWriter {
            conn,
            mtime,
            bytes_written: 0,
        }
    }

    /// Total bytes handed to the stream so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// A second handle to the socket for out-of-band cancellation.
    pub(crate) fn shutdown_handle(&self) -> Result<TcpStream> {
        self.conn.shutdown_handle()
    }

    /// Sends the `DONE` trailer carrying the modification time and reads
    /// the final status.
    pub fn finish(mut self) -> Result<()> {
        let mtime = self.mtime.unwrap_or_else(SystemTime::now);
        let secs = mtime
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        #[allow(clippy::cast_possible_truncation)]
        sync::write_done(&mut self.conn, secs as u32)?;
        sync::read_status(&mut self.conn)
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for chunk in buf.chunks(sync::MAX_CHUNK_SIZE) {
            sync::write_chunk(&mut self.conn, chunk).map_err(io::Error::other)?;
        }
        self.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.flush()
    }
}
