//! Devices: descriptors, transport attachment, attributes, and shell
//! commands.

use std::fmt;

use adbx_proto::{Error, Result};

use crate::shell;
use crate::state::{parse_device_list_long, DeviceInfo, DeviceState};
use crate::transport::{request_response, Connection};

/// Selects which device a request addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceDescriptor {
    /// The single attached device; the server rejects this when several
    /// are attached.
    Any,
    /// Any device attached over USB.
    AnyUsb,
    /// Any locally attached device (emulator).
    AnyLocal,
    /// The device with this serial number. The serial is opaque to the
    /// client.
    Serial(String),
}

impl DeviceDescriptor {
    /// The per-request addressing prefix: `host`, `host-usb`,
    /// `host-local`, or `host-serial:<serial>`.
    pub(crate) fn host_prefix(&self) -> String {
        match self {
            DeviceDescriptor::Any => "host".into(),
            DeviceDescriptor::AnyUsb => "host-usb".into(),
            DeviceDescriptor::AnyLocal => "host-local".into(),
            DeviceDescriptor::Serial(serial) => format!("host-serial:{serial}"),
        }
    }

    /// The directive that binds a connection to the device's transport.
    pub(crate) fn transport_directive(&self) -> String {
        match self {
            DeviceDescriptor::Any => "transport-any".into(),
            DeviceDescriptor::AnyUsb => "transport-usb".into(),
            DeviceDescriptor::AnyLocal => "transport-local".into(),
            DeviceDescriptor::Serial(serial) => format!("transport:{serial}"),
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceDescriptor::Any => f.write_str("any"),
            DeviceDescriptor::AnyUsb => f.write_str("any-usb"),
            DeviceDescriptor::AnyLocal => f.write_str("any-local"),
            DeviceDescriptor::Serial(serial) => f.write_str(serial),
        }
    }
}

/// A specific Android device reachable through an ADB server.
///
/// This is a value object: the server address plus a descriptor. Every
/// operation opens and closes its own connection, so a `Device` can be
/// cloned and used from several threads at once.
#[derive(Debug, Clone)]
pub struct Device {
    address: String,
    descriptor: DeviceDescriptor,
}

impl Device {
    pub(crate) fn new(address: String, descriptor: DeviceDescriptor) -> Self {
        Device {
            address,
            descriptor,
        }
    }

    /// The descriptor this device was selected by.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    /// Opens a connection and binds it to this device's transport.
    pub(crate) fn attach(&self) -> Result<Connection> {
        let mut conn = Connection::dial(&self.address)?;
        conn.send(&format!("host:{}", self.descriptor.transport_directive()))?;
        conn.expect_ok()?;
        Ok(conn)
    }

    fn get_attribute(&self, attr: &str) -> Result<String> {
        let request = format!("{}:{attr}", self.descriptor.host_prefix());
        let reply = request_response(&self.address, &request)?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    /// The device's serial number.
    pub fn serial(&self) -> Result<String> {
        self.get_attribute("get-serialno")
    }

    /// The device path (e.g. `usb:1-1.2`).
    pub fn device_path(&self) -> Result<String> {
        self.get_attribute("get-devpath")
    }

    /// The product name. Documented, but many servers never implement it.
    pub fn product(&self) -> Result<String> {
        self.get_attribute("get-product")
    }

    /// The device's current connection state.
    pub fn state(&self) -> Result<DeviceState> {
        Ok(DeviceState::parse(&self.get_attribute("get-state")?))
    }

    /// Long-form info for this device.
    ///
    /// The server has no per-device query for this, so the device lists
    /// all devices and finds itself by serial.
    pub fn device_info(&self) -> Result<DeviceInfo> {
        let serial = self.serial()?;
        let reply = request_response(&self.address, "host:devices-l")?;
        let devices = parse_device_list_long(&String::from_utf8_lossy(&reply))?;
        devices
            .into_iter()
            .find(|d| d.serial == serial)
            .ok_or_else(|| Error::DeviceNotFound(format!("device '{serial}' not found")))
    }

    /// Starts `cmd` in a shell and returns the connection streaming its
    /// merged stdout/stderr until the device closes it.
    ///
    /// Arguments containing whitespace are double-quoted; arguments
    /// containing `"` are rejected, as the protocol cannot escape them.
    pub fn open_shell(&self, cmd: &str, args: &[&str]) -> Result<Connection> {
        let line = shell::prepare_command_line(cmd, args)?;
        self.open_shell_raw(&line)
    }

    fn open_shell_raw(&self, line: &str) -> Result<Connection> {
        let mut conn = self.attach()?;
        conn.send(&format!("shell:{line}"))?;
        conn.expect_ok()?;
        // Shell replies carry no length header; the stream runs to EOF.
        conn.clear_timeouts()?;
        Ok(conn)
    }

    /// Runs `cmd` and returns its merged output verbatim.
    ///
    /// The device shell rewrites `\n` to `\r\n`; text consumers can undo
    /// that with [`shell::normalize_newlines`], binary consumers must not.
    pub fn run_command(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
        let mut conn = self.open_shell(cmd, args)?;
        conn.read_to_end()
    }

    /// Runs `cmd` and recovers its exit code via a `; echo :$?` sentinel.
    ///
    /// The sentinel is a host-side trick, not part of the protocol: a
    /// command whose own output ends in `:<something>` can defeat the
    /// split, in which case the code is reported as -1 and the payload
    /// returned whole. Use [`Device::run_command`] when the output may be
    /// binary.
    pub fn run_command_with_exit_code(
        &self,
        cmd: &str,
        args: &[&str],
    ) -> Result<(Vec<u8>, i32)> {
        let line = shell::prepare_command_line(cmd, args)?;
        let mut conn = self.open_shell_raw(&format!("{line}; echo :$?"))?;
        let payload = conn.read_to_end()?;
        Ok(shell::split_exit_code(payload))
    }

    /// Like [`Device::run_command_with_exit_code`], but a non-zero exit
    /// code becomes [`Error::CommandExit`].
    pub fn run_command_checked(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
        let (output, code) = self.run_command_with_exit_code(cmd, args)?;
        if code == 0 {
            Ok(output)
        } else {
            Err(Error::CommandExit {
                cmd: cmd.to_string(),
                code,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::server::tests::{fake_server, fake_server_with, okay_reply, read_request};

    fn test_device(address: String) -> Device {
        Device::new(address, DeviceDescriptor::Serial("SERIAL1".into()))
    }

    #[test]
    fn descriptor_rendering() {
        let cases = [
            (DeviceDescriptor::Any, "host", "transport-any"),
            (DeviceDescriptor::AnyUsb, "host-usb", "transport-usb"),
            (DeviceDescriptor::AnyLocal, "host-local", "transport-local"),
            (
                DeviceDescriptor::Serial("abc".into()),
                "host-serial:abc",
                "transport:abc",
            ),
        ];
        for (descriptor, host, transport) in cases {
            assert_eq!(descriptor.host_prefix(), host);
            assert_eq!(descriptor.transport_directive(), transport);
        }
    }

    #[test]
    fn attribute_query() {
        let (address, server) = fake_server(vec![(
            "host-serial:SERIAL1:get-state".into(),
            okay_reply("device"),
        )]);
        let state = test_device(address).state().unwrap();
        assert!(state.is_online());
        server.join().unwrap();
    }

    #[test]
    fn attribute_query_device_not_found() {
        let body = "device 'SERIAL1' not found";
        let mut reply = format!("FAIL{:04x}", body.len()).into_bytes();
        reply.extend_from_slice(body.as_bytes());
        let (address, server) = fake_server(vec![(
            "host-serial:SERIAL1:get-serialno".into(),
            reply,
        )]);
        assert!(matches!(
            test_device(address).serial(),
            Err(Error::DeviceNotFound(_))
        ));
        server.join().unwrap();
    }

    #[test]
    fn shell_streams_until_eof() {
        let (address, server) = fake_server_with(|listener| {
            let (mut conn, _) = listener.accept().unwrap();
            assert_eq!(read_request(&mut conn), "host:transport:SERIAL1");
            conn.write_all(b"OKAY").unwrap();
            assert_eq!(read_request(&mut conn), "shell:echo hi");
            conn.write_all(b"OKAY").unwrap();
            conn.write_all(b"hi\r\n").unwrap();
            // Dropping the connection ends the stream.
        });
        let output = test_device(address).run_command("echo", &["hi"]).unwrap();
        assert_eq!(output, b"hi\r\n");
        server.join().unwrap();
    }

    #[test]
    fn shell_exit_code_recovery() {
        let (address, server) = fake_server_with(|listener| {
            let (mut conn, _) = listener.accept().unwrap();
            assert_eq!(read_request(&mut conn), "host:transport:SERIAL1");
            conn.write_all(b"OKAY").unwrap();
            assert_eq!(read_request(&mut conn), "shell:false; echo :$?");
            conn.write_all(b"OKAY").unwrap();
            conn.write_all(b":1\r\n").unwrap();
        });
        let (output, code) = test_device(address)
            .run_command_with_exit_code("false", &[])
            .unwrap();
        assert_eq!(output, b"");
        assert_eq!(code, 1);
        server.join().unwrap();
    }

    #[test]
    fn checked_command_maps_nonzero_exit() {
        let (address, server) = fake_server_with(|listener| {
            let (mut conn, _) = listener.accept().unwrap();
            read_request(&mut conn);
            conn.write_all(b"OKAY").unwrap();
            read_request(&mut conn);
            conn.write_all(b"OKAY").unwrap();
            conn.write_all(b"denied\r\n:77\r\n").unwrap();
        });
        assert!(matches!(
            test_device(address).run_command_checked("rm", &["/system"]),
            Err(Error::CommandExit { code: 77, .. })
        ));
        server.join().unwrap();
    }

    #[test]
    fn invalid_arguments_fail_before_dialing() {
        // No server behind this address; validation must reject first.
        let device = test_device("127.0.0.1:1".into());
        assert!(matches!(
            device.run_command("", &[]),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            device.run_command("echo", &["a\"b"]),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn device_info_finds_self() {
        let (address, server) = fake_server(vec![
            (
                "host-serial:SERIAL1:get-serialno".into(),
                okay_reply("SERIAL1"),
            ),
            (
                "host:devices-l".into(),
                okay_reply("SERIAL1 device product:p model:m device:d\n"),
            ),
        ]);
        let info = test_device(address).device_info().unwrap();
        assert_eq!(info.serial, "SERIAL1");
        assert_eq!(info.model.as_deref(), Some("m"));
        server.join().unwrap();
    }
}
