//! Device states, device info, and the device-table parsers.

use std::fmt;

use serde::Serialize;

use adbx_proto::{Error, Result};

/// Connection state of a device, as the server reports it.
///
/// A device can be talked to only when it is [`Online`]. A USB device
/// makes the following transitions:
///
/// - plugged in: `Disconnected → Offline → Online`
/// - unplugged: `Online → Disconnected`
///
/// [`Online`]: DeviceState::Online
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// The server sent a state string this client does not know.
    Invalid,
    /// Attached, but USB debugging has not been authorized.
    Unauthorized,
    /// Not attached.
    Disconnected,
    /// Attached but not yet ready to accept commands.
    Offline,
    /// Ready.
    Online,
}

impl DeviceState {
    /// Parses the server's state string. Unknown strings map to
    /// [`DeviceState::Invalid`] rather than failing.
    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "" => DeviceState::Disconnected,
            "offline" => DeviceState::Offline,
            "device" => DeviceState::Online,
            "unauthorized" => DeviceState::Unauthorized,
            _ => DeviceState::Invalid,
        }
    }

    /// Whether the device accepts commands in this state.
    #[must_use]
    pub fn is_online(self) -> bool {
        self == DeviceState::Online
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Invalid => "invalid",
            DeviceState::Unauthorized => "unauthorized",
            DeviceState::Disconnected => "disconnected",
            DeviceState::Offline => "offline",
            DeviceState::Online => "online",
        };
        f.write_str(name)
    }
}

/// One row of the server's device list.
///
/// Only `serial` is guaranteed; the remaining attributes appear in the
/// long listing (`adb devices -l`) and only when the server knows them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Device serial number.
    pub serial: String,
    /// Product name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    /// Model name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Device codename.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// USB bus path; only set for devices attached over USB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usb: Option<String>,
}

impl DeviceInfo {
    /// Whether the device is attached over USB.
    #[must_use]
    pub fn is_usb(&self) -> bool {
        self.usb.is_some()
    }

    fn with_serial(serial: &str) -> Self {
        DeviceInfo {
            serial: serial.to_string(),
            product: None,
            model: None,
            device: None,
            usb: None,
        }
    }
}

/// Parses the short device table (`host:devices`): `serial\tstate` lines.
pub(crate) fn parse_device_list_short(table: &str) -> Result<Vec<DeviceInfo>> {
    parse_device_list(table, parse_short_line)
}

/// Parses the long device table (`host:devices-l`).
pub(crate) fn parse_device_list_long(table: &str) -> Result<Vec<DeviceInfo>> {
    parse_device_list(table, parse_long_line)
}

fn parse_device_list(
    table: &str,
    line_parser: fn(&str) -> Result<DeviceInfo>,
) -> Result<Vec<DeviceInfo>> {
    table
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(line_parser)
        .collect()
}

fn parse_short_line(line: &str) -> Result<DeviceInfo> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 2 {
        return Err(Error::Parse(format!(
            "malformed device line, expected 2 fields but found {}: {line:?}",
            fields.len()
        )));
    }
    Ok(DeviceInfo::with_serial(fields[0]))
}

/// Long lines are `serial state key:value…` with at least five fields.
/// Field 1 (the state) is skipped; unknown keys and fields without a `:`
/// are ignored.
fn parse_long_line(line: &str) -> Result<DeviceInfo> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return Err(Error::Parse(format!(
            "malformed device line, expected at least 5 fields but found {}: {line:?}",
            fields.len()
        )));
    }
    let mut info = DeviceInfo::with_serial(fields[0]);
    for field in &fields[2..] {
        let Some((key, value)) = field.split_once(':') else {
            continue;
        };
        let value = Some(value.to_string());
        match key {
            "product" => info.product = value,
            "model" => info.model = value,
            "device" => info.device = value,
            "usb" => info.usb = value,
            _ => {}
        }
    }
    Ok(info)
}
