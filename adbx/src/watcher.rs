//! Long-lived device tracking with automatic server restart.
//!
//! `host:track-devices` keeps one connection open and pushes a full device
//! table whenever anything changes. The watcher diffs successive tables
//! into transition events. When the server dies mid-stream it is the one
//! error the watcher recovers from: it restarts the server and
//! resubscribes; everything else closes the stream.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use adbx_proto::{Error, Result};

use crate::server::Server;
use crate::state::DeviceState;
use crate::transport::{shutdown_socket, Connection};

/// One device state transition observed on the `track-devices` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStateChangedEvent {
    /// Serial of the device that changed.
    pub serial: String,
    /// State before the change. A device appearing for the first time
    /// comes from [`DeviceState::Disconnected`].
    pub old_state: DeviceState,
    /// State after the change. A device vanishing from the table goes to
    /// [`DeviceState::Disconnected`].
    pub new_state: DeviceState,
}

impl DeviceStateChangedEvent {
    /// Whether this transition brought the device online.
    #[must_use]
    pub fn came_online(&self) -> bool {
        self.old_state != DeviceState::Online && self.new_state == DeviceState::Online
    }

    /// Whether this transition took the device away from online.
    #[must_use]
    pub fn went_offline(&self) -> bool {
        self.old_state == DeviceState::Online && self.new_state != DeviceState::Online
    }
}

/// Publishes device state transitions from a `host:track-devices`
/// subscription running on its own thread.
///
/// The tracking loop moves through
/// `Running → (Reconnecting → Running)* → Closed`: only a connection reset
/// (server death) enters `Reconnecting`, where the watcher restarts the
/// server, waits a random 0-500 ms so concurrent watchers don't hit it at
/// once, and
/// resubscribes with a fresh snapshot (the next table re-announces every
/// device). Any other error goes straight to `Closed` and is parked in
/// [`DeviceWatcher::take_last_error`].
#[derive(Debug)]
pub struct DeviceWatcher {
    events: Receiver<DeviceStateChangedEvent>,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Shared {
    closed: AtomicBool,
    last_error: Mutex<Option<Error>>,
    /// Clone of the current track socket, kept to interrupt blocking
    /// reads on shutdown.
    socket: Mutex<Option<TcpStream>>,
}

impl DeviceWatcher {
    pub(crate) fn spawn(server: &Server) -> Result<Self> {
        // Subscribe on the caller's thread so setup failures surface here.
        let conn = subscribe(&server.address)?;
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            last_error: Mutex::new(None),
            socket: Mutex::new(Some(conn.shutdown_handle()?)),
        });
        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn({
            let shared = Arc::clone(&shared);
            let server = server.clone();
            move || run(&server, conn, &shared, &tx)
        });
        Ok(DeviceWatcher {
            events: rx,
            shared,
            thread: Some(thread),
        })
    }

    /// The stream of state transitions.
    ///
    /// The channel disconnects when the watcher is shut down or hits an
    /// unrecoverable error; check [`DeviceWatcher::take_last_error`] to
    /// tell the two apart.
    pub fn events(&self) -> &Receiver<DeviceStateChangedEvent> {
        &self.events
    }

    /// The error that terminated the stream, if any.
    pub fn take_last_error(&self) -> Option<Error> {
        self.shared.last_error.lock().unwrap().take()
    }

    /// Stops tracking and closes the event stream. Calling this twice is
    /// a no-op.
    pub fn shutdown(&mut self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(socket) = self.shared.socket.lock().unwrap().take() {
            shutdown_socket(&socket);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Dials the server and subscribes to the device table stream.
fn subscribe(address: &str) -> Result<Connection> {
    let mut conn = Connection::dial(address)?;
    conn.send("host:track-devices")?;
    conn.expect_ok()?;
    conn.clear_timeouts()?;
    Ok(conn)
}

/// The tracking loop, iterative rather than recursively restarting.
fn run(
    server: &Server,
    mut conn: Connection,
    shared: &Shared,
    events: &Sender<DeviceStateChangedEvent>,
) {
    let mut snapshot = HashMap::new();
    loop {
        // Running: publish diffs until something breaks.
        let err = match track(&mut conn, &mut snapshot, events, shared) {
            Ok(()) => return, // shutdown requested or receiver dropped
            Err(err) => err,
        };
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        if !err.is_connection_reset() {
            *shared.last_error.lock().unwrap() = Some(err);
            return;
        }

        // Reconnecting: the server died under us. Delay by a random
        // 0-500 ms so several watchers don't all restart it at once.
        let delay = Duration::from_millis(rand::rng().random_range(0..500));
        debug!(delay_ms = delay.as_millis() as u64, "track stream reset, restarting server");
        thread::sleep(delay);

        match server.bootstrap().and_then(|()| subscribe(&server.address)) {
            Ok(new_conn) => {
                let handle = new_conn.shutdown_handle().ok();
                let mut socket = shared.socket.lock().unwrap();
                if shared.closed.load(Ordering::SeqCst) {
                    return;
                }
                *socket = handle;
                drop(socket);
                conn = new_conn;
                // Fresh snapshot: the first diff re-announces all devices.
                snapshot.clear();
            }
            Err(err) => {
                warn!(error = %err, "failed to restart adb server, closing watcher");
                *shared.last_error.lock().unwrap() = Some(err);
                return;
            }
        }
    }
}

/// Reads device tables and publishes diffs until an error, a shutdown, or
/// the receiver going away.
fn track(
    conn: &mut Connection,
    snapshot: &mut HashMap<String, DeviceState>,
    events: &Sender<DeviceStateChangedEvent>,
    shared: &Shared,
) -> Result<()> {
    loop {
        let table = match conn.read_message() {
            Ok(table) => table,
            Err(_) if shared.closed.load(Ordering::SeqCst) => return Ok(()),
            Err(err) => return Err(err),
        };
        let next = parse_device_table(&String::from_utf8_lossy(&table));
        for event in diff_snapshots(snapshot, &next) {
            if events.send(event).is_err() {
                return Ok(());
            }
        }
        *snapshot = next;
    }
}

/// Parses `serial\tstate` lines, skipping malformed ones.
fn parse_device_table(table: &str) -> HashMap<String, DeviceState> {
    table
        .lines()
        .filter_map(|line| {
            let (serial, state) = line.split_once('\t')?;
            if serial.is_empty() {
                return None;
            }
            Some((serial.to_string(), DeviceState::parse(state.trim())))
        })
        .collect()
}

/// Computes transition events between two snapshots, ordered by serial.
///
/// A serial missing from `next` is reported as going
/// [`DeviceState::Disconnected`]; an event never has equal old and new
/// states.
fn diff_snapshots(
    prev: &HashMap<String, DeviceState>,
    next: &HashMap<String, DeviceState>,
) -> Vec<DeviceStateChangedEvent> {
    let mut out = Vec::new();
    for (serial, &new_state) in next {
        let old_state = prev
            .get(serial)
            .copied()
            .unwrap_or(DeviceState::Disconnected);
        if old_state != new_state {
            out.push(DeviceStateChangedEvent {
                serial: serial.clone(),
                old_state,
                new_state,
            });
        }
    }
    for (serial, &old_state) in prev {
        if !next.contains_key(serial) && old_state != DeviceState::Disconnected {
            out.push(DeviceStateChangedEvent {
                serial: serial.clone(),
                old_state,
                new_state: DeviceState::Disconnected,
            });
        }
    }
    out.sort_by(|a, b| a.serial.cmp(&b.serial));
    out
}

#[cfg(test)]
mod tests {
    use std::io::{Read as _, Write as _};
    use std::path::PathBuf;

    use super::*;
    use crate::server::tests::{fake_server_with, frame, read_request};

    fn snapshot(entries: &[(&str, DeviceState)]) -> HashMap<String, DeviceState> {
        entries
            .iter()
            .map(|(serial, state)| ((*serial).to_string(), *state))
            .collect()
    }

    #[test]
    fn diff_announces_new_devices_from_disconnected() {
        let events = diff_snapshots(
            &HashMap::new(),
            &snapshot(&[("A", DeviceState::Online)]),
        );
        assert_eq!(
            events,
            [DeviceStateChangedEvent {
                serial: "A".into(),
                old_state: DeviceState::Disconnected,
                new_state: DeviceState::Online,
            }]
        );
        assert!(events[0].came_online());
    }

    #[test]
    fn diff_reports_disappearance_as_disconnected() {
        let events = diff_snapshots(
            &snapshot(&[("A", DeviceState::Online)]),
            &HashMap::new(),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new_state, DeviceState::Disconnected);
        assert!(events[0].went_offline());
    }

    #[test]
    fn diff_never_emits_unchanged_states() {
        let prev = snapshot(&[("A", DeviceState::Online), ("B", DeviceState::Offline)]);
        assert!(diff_snapshots(&prev, &prev).is_empty());
    }

    #[test]
    fn diff_is_sorted_by_serial() {
        let events = diff_snapshots(
            &HashMap::new(),
            &snapshot(&[("B", DeviceState::Online), ("A", DeviceState::Offline)]),
        );
        assert_eq!(events[0].serial, "A");
        assert_eq!(events[1].serial, "B");
    }

    #[test]
    fn table_parsing_skips_malformed_lines() {
        let table = "A\tdevice\nmalformed\nB\toffline\n";
        let parsed = parse_device_table(table);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["A"], DeviceState::Online);
        assert_eq!(parsed["B"], DeviceState::Offline);
    }

    #[test]
    fn watcher_publishes_transitions_until_stream_ends() {
        let (address, server) = fake_server_with(|listener| {
            let (mut conn, _) = listener.accept().unwrap();
            assert_eq!(read_request(&mut conn), "host:track-devices");
            conn.write_all(b"OKAY").unwrap();
            conn.write_all(&frame("A\tdevice\n")).unwrap();
            conn.write_all(&frame("A\toffline\nB\tdevice\n")).unwrap();
            // Dropping the connection simulates server death; the watcher
            // will fail to restart the nonexistent executable and close.
        });

        let watcher = DeviceWatcher::spawn(&Server {
            address,
            executable: PathBuf::from("/nonexistent/adbx-test-adb"),
        })
        .unwrap();

        let events: Vec<_> = watcher.events().iter().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            DeviceStateChangedEvent {
                serial: "A".into(),
                old_state: DeviceState::Disconnected,
                new_state: DeviceState::Online,
            }
        );
        assert_eq!(events[1].serial, "A");
        assert_eq!(events[1].new_state, DeviceState::Offline);
        assert_eq!(events[2].serial, "B");
        assert!(events[2].came_online());

        // The reset path tried to restart the server and failed.
        assert!(watcher.take_last_error().is_some());
        server.join().unwrap();
    }

    #[test]
    fn shutdown_is_idempotent_and_interrupts_the_stream() {
        let (address, server) = fake_server_with(|listener| {
            let (mut conn, _) = listener.accept().unwrap();
            assert_eq!(read_request(&mut conn), "host:track-devices");
            conn.write_all(b"OKAY").unwrap();
            conn.write_all(&frame("A\tdevice\n")).unwrap();
            // Block until the watcher closes its end.
            let mut buf = [0u8; 1];
            let _ = conn.read(&mut buf);
        });

        let mut watcher = DeviceWatcher::spawn(&Server {
            address,
            executable: PathBuf::from("/nonexistent/adbx-test-adb"),
        })
        .unwrap();

        let first = watcher.events().recv().unwrap();
        assert!(first.came_online());

        watcher.shutdown();
        watcher.shutdown();
        assert!(watcher.events().recv().is_err());
        assert!(watcher.take_last_error().is_none());
        server.join().unwrap();
    }
}
