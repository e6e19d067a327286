//! Host-side client for the Android Debug Bridge (ADB) server.
//!
//! Talks the documented ADB wire protocol to the server process that
//! multiplexes attached Android devices (by default on `127.0.0.1:5037`):
//! enumerating devices, tracking their state transitions, running shell
//! commands, forwarding TCP ports, and transferring files over the sync
//! sub-protocol.
//!
//! Every logical operation opens its own short-lived TCP connection;
//! nothing is shared or pooled, so a [`Server`] or [`Device`] handle can
//! be cloned freely across threads.
//!
//! # Quick start
//!
//! ```no_run
//! use adbx::{DeviceDescriptor, Server};
//!
//! let server = Server::start_default()?;
//! for info in server.list_devices()? {
//!     println!("{} {:?}", info.serial, info.model);
//! }
//!
//! let device = server.device(DeviceDescriptor::Any);
//! let output = device.run_command("getprop", &["ro.product.model"])?;
//! print!("{}", String::from_utf8_lossy(&output));
//! # Ok::<(), adbx::Error>(())
//! ```

mod device;
mod forward;
mod server;
pub mod shell;
mod state;
mod sync;
mod transport;
mod upload;
mod watcher;

pub use adbx_proto::{Error, Result};
pub use device::{Device, DeviceDescriptor};
pub use forward::{ForwardProtocol, ForwardSpec};
pub use server::{Server, DEFAULT_EXECUTABLE};
pub use state::{DeviceInfo, DeviceState};
pub use sync::{file_mode, DirEntry, FileReader, FileWriter};
pub use transport::Connection;
pub use upload::Upload;
pub use watcher::{DeviceStateChangedEvent, DeviceWatcher};
