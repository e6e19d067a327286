//! The host session: single-shot `host:*` commands and server bootstrap.

use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use adbx_proto::{Error, Result};

use crate::device::{Device, DeviceDescriptor};
use crate::state::{parse_device_list_long, parse_device_list_short, DeviceInfo};
use crate::transport::{request_response, send};
use crate::watcher::DeviceWatcher;

/// Name of the adb executable used to bootstrap a server.
pub const DEFAULT_EXECUTABLE: &str = "adb";
/// Host the server listens on by default.
const DEFAULT_HOST: &str = "127.0.0.1";
/// Port the server listens on by default.
const DEFAULT_PORT: u16 = 5037;

/// Handle to an ADB server: its TCP address plus the executable used to
/// (re)start it.
///
/// Cheap to clone and holds no connection; every operation dials its own.
#[derive(Debug, Clone)]
pub struct Server {
    pub(crate) address: String,
    pub(crate) executable: PathBuf,
}

impl Server {
    /// Boots the default server: `adb start-server` on `127.0.0.1:5037`.
    pub fn start_default() -> Result<Self> {
        Self::start(DEFAULT_EXECUTABLE, DEFAULT_HOST, DEFAULT_PORT)
    }

    /// Boots a server via `<executable> start-server`, listening on
    /// `host:port`. Starting an already-running server is a no-op on the
    /// adb side, so this is safe to call repeatedly.
    pub fn start(executable: impl Into<PathBuf>, host: &str, port: u16) -> Result<Self> {
        let server = Server {
            address: format!("{host}:{port}"),
            executable: executable.into(),
        };
        server.bootstrap()?;
        Ok(server)
    }

    /// Runs `<executable> start-server`, capturing combined output. The
    /// output is not parsed; a non-zero exit carries it in the error.
    pub(crate) fn bootstrap(&self) -> Result<()> {
        debug!(executable = %self.executable.display(), "starting adb server");
        let out = Command::new(&self.executable).arg("start-server").output()?;
        if out.status.success() {
            return Ok(());
        }
        let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&out.stderr));
        Err(Error::Server(format!(
            "{} start-server exited with {}: {}",
            self.executable.display(),
            out.status,
            combined.trim()
        )))
    }

    /// Asks the server for its internal protocol version.
    pub fn version(&self) -> Result<u32> {
        let reply = request_response(&self.address, "host:version")?;
        let digits = String::from_utf8_lossy(&reply).into_owned();
        u32::from_str_radix(&digits, 16)
            .map_err(|_| Error::Parse(format!("invalid server version: {digits:?}")))
    }

    /// Tells the server to quit immediately.
    ///
    /// Corresponds to `adb kill-server`.
    pub fn kill(&self) -> Result<()> {
        send(&self.address, "host:kill")
    }

    /// Lists attached devices with their long-form attributes.
    ///
    /// Corresponds to `adb devices -l`.
    pub fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let reply = request_response(&self.address, "host:devices-l")?;
        parse_device_list_long(&String::from_utf8_lossy(&reply))
    }

    /// Lists the serial numbers of attached devices.
    ///
    /// Corresponds to `adb devices`.
    pub fn list_device_serials(&self) -> Result<Vec<String>> {
        let reply = request_response(&self.address, "host:devices")?;
        let devices = parse_device_list_short(&String::from_utf8_lossy(&reply))?;
        Ok(devices.into_iter().map(|d| d.serial).collect())
    }

    /// Returns a handle to the device selected by `descriptor`.
    pub fn device(&self, descriptor: DeviceDescriptor) -> Device {
        Device::new(self.address.clone(), descriptor)
    }

    /// Subscribes to device state transitions via `host:track-devices`.
    pub fn track_devices(&self) -> Result<DeviceWatcher> {
        DeviceWatcher::spawn(self)
    }
}
