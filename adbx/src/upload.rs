//! Background uploads with progress reporting and cancellation.
//!
//! Progress is measured strictly from bytes handed to the `SEND` stream;
//! there is no device-side polling. Cancellation closes the underlying
//! connection; bytes already on the device stay there, and nothing is
//! retried.

use std::io::{Read, Write as _};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use adbx_proto::sync::MAX_CHUNK_SIZE;
use adbx_proto::{Error, Result};

use crate::device::Device;
use crate::sync::{unwrap_io, FileWriter};
use crate::transport::shutdown_socket;

impl Device {
    /// Starts copying `source` to `path` on the device in a background
    /// thread and returns a progress handle.
    ///
    /// The sync connection is opened on the calling thread, so setup
    /// failures surface here rather than on the handle. `total_size` only
    /// feeds [`Upload::progress`]; pass 0 when unknown.
    pub fn start_upload<R>(
        &self,
        mut source: R,
        path: &str,
        mode: u32,
        mtime: Option<SystemTime>,
        total_size: u64,
    ) -> Result<Upload>
    where
        R: Read + Send + 'static,
    {
        let writer = self.open_write(path, mode, mtime)?;
        let socket = writer.shutdown_handle()?;
        let shared = Arc::new(UploadShared {
            bytes_completed: AtomicU64::new(0),
            total_size,
            cancelled: AtomicBool::new(false),
            error: Mutex::new(None),
            socket: Mutex::new(Some(socket)),
        });
        let thread = thread::spawn({
            let shared = Arc::clone(&shared);
            move || {
                if let Err(err) = copy_chunks(&mut source, writer, &shared) {
                    // A cancelled transfer reports through cancel, not the
                    // error slot; the reset it causes is expected.
                    if !shared.cancelled.load(Ordering::SeqCst) {
                        *shared.error.lock().unwrap() = Some(err);
                    }
                }
                shared.socket.lock().unwrap().take();
            }
        });
        Ok(Upload {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }
}

fn copy_chunks(
    source: &mut impl Read,
    mut writer: FileWriter,
    shared: &UploadShared,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    loop {
        if shared.cancelled.load(Ordering::SeqCst) {
            // Dropping the writer abandons the stream.
            return Ok(());
        }
        let n = source.read(&mut buf)?;
        if n == 0 {
            return writer.finish();
        }
        writer.write_all(&buf[..n]).map_err(unwrap_io)?;
        shared.bytes_completed.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Handle to an in-flight upload started by [`Device::start_upload`].
#[derive(Debug)]
pub struct Upload {
    shared: Arc<UploadShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct UploadShared {
    bytes_completed: AtomicU64,
    total_size: u64,
    cancelled: AtomicBool,
    error: Mutex<Option<Error>>,
    socket: Mutex<Option<TcpStream>>,
}

impl Upload {
    /// Bytes successfully handed to the `SEND` stream so far. Monotonic.
    pub fn bytes_completed(&self) -> u64 {
        self.shared.bytes_completed.load(Ordering::Relaxed)
    }

    /// Completion ratio in `0.0..=1.0`, or 0 when the total is unknown.
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        if self.shared.total_size == 0 {
            return 0.0;
        }
        self.bytes_completed() as f64 / self.shared.total_size as f64
    }

    /// Aborts the transfer by closing its connection; any in-flight write
    /// returns promptly. Bytes already on the device are not rolled back.
    /// Idempotent, and a no-op once the copy has finished.
    pub fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(socket) = self.shared.socket.lock().unwrap().take() {
            shutdown_socket(&socket);
        }
    }

    /// Blocks until the copy finishes or the cancellation takes effect,
    /// then returns the terminal result. Later calls return `Ok`.
    pub fn wait(&self) -> Result<()> {
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
        match self.shared.error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write as _};
    use std::sync::mpsc;
    use std::time::Duration;

    use adbx_proto::sync::{self, Chunk};

    use super::*;
    use crate::sync::tests::{fake_sync_server, read_sync_request, test_device};

    #[test]
    fn upload_reports_progress_and_completion() {
        let payload = b"hello upload".to_vec();
        let total = payload.len() as u64;
        let (address, server) = fake_sync_server(move |mut conn| {
            let (tag, request) = read_sync_request(&mut conn);
            assert_eq!(tag, sync::SEND);
            assert_eq!(request, b"/data/up,420");
            let mut received = 0u64;
            loop {
                match sync::read_chunk_header(&mut conn).unwrap() {
                    Chunk::Data(len) => {
                        sync::read_bytes(&mut conn, len as usize, "chunk").unwrap();
                        received += u64::from(len);
                    }
                    Chunk::Done => break,
                }
            }
            assert_eq!(received, total);
            conn.write_all(b"OKAY").unwrap();
            sync::write_u32_le(&mut conn, 0).unwrap();
        });

        let upload = test_device(address)
            .start_upload(Cursor::new(payload), "/data/up", 0o644, None, total)
            .unwrap();
        upload.wait().unwrap();
        assert_eq!(upload.bytes_completed(), total);
        assert!((upload.progress() - 1.0).abs() < f64::EPSILON);
        // wait() after completion stays Ok.
        upload.wait().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn progress_is_zero_when_total_unknown() {
        let (address, server) = fake_sync_server(|mut conn| {
            read_sync_request(&mut conn);
            loop {
                match sync::read_chunk_header(&mut conn).unwrap() {
                    Chunk::Data(len) => {
                        sync::read_bytes(&mut conn, len as usize, "chunk").unwrap();
                    }
                    Chunk::Done => break,
                }
            }
            conn.write_all(b"OKAY").unwrap();
            sync::write_u32_le(&mut conn, 0).unwrap();
        });
        let upload = test_device(address)
            .start_upload(Cursor::new(b"x".to_vec()), "/f", 0o644, None, 0)
            .unwrap();
        upload.wait().unwrap();
        assert!(upload.progress().abs() < f64::EPSILON);
        server.join().unwrap();
    }

    /// A reader that yields one chunk, then blocks until dropped.
    struct StallingReader {
        first: bool,
        hold: mpsc::Receiver<()>,
    }

    impl Read for StallingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.first {
                self.first = false;
                buf[0] = b'x';
                return Ok(1);
            }
            // Blocks until the sender is dropped, then reports EOF.
            let _ = self.hold.recv();
            Ok(0)
        }
    }

    #[test]
    fn cancel_is_idempotent_and_unblocks_wait() {
        let (address, server) = fake_sync_server(|mut conn| {
            read_sync_request(&mut conn);
            // Swallow whatever arrives until the client closes.
            let mut sink = Vec::new();
            let _ = std::io::Read::read_to_end(&mut conn, &mut sink);
        });

        let (hold_tx, hold_rx) = mpsc::channel();
        let upload = test_device(address)
            .start_upload(
                StallingReader {
                    first: true,
                    hold: hold_rx,
                },
                "/f",
                0o644,
                None,
                10,
            )
            .unwrap();

        // Let the first chunk through before cancelling.
        while upload.bytes_completed() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        upload.cancel();
        upload.cancel();
        drop(hold_tx);

        upload.wait().unwrap();
        assert_eq!(upload.bytes_completed(), 1);
        server.join().unwrap();
    }
}
