//! Port forwarding: endpoint specs, the forward table, and free-port
//! allocation.

use std::fmt;
use std::net::TcpListener;
use std::str::FromStr;

use adbx_proto::{Error, Result};

use crate::device::{Device, DeviceDescriptor};
use crate::transport::{request_response, send};

/// Transport protocols a forward endpoint can use.
///
/// Only `tcp` endpoints carry a numeric port; the rest are opaque names
/// (or a pid, for `jdwp`) that the client passes through unparsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardProtocol {
    /// TCP port.
    Tcp,
    /// Abstract Unix socket.
    LocalAbstract,
    /// Reserved Unix socket.
    LocalReserved,
    /// Filesystem Unix socket.
    LocalFilesystem,
    /// JDWP debugging channel of a process.
    Jdwp,
    /// Legacy alias some servers report for Unix sockets.
    Local,
}

impl ForwardProtocol {
    fn as_str(self) -> &'static str {
        match self {
            ForwardProtocol::Tcp => "tcp",
            ForwardProtocol::LocalAbstract => "localabstract",
            ForwardProtocol::LocalReserved => "localreserved",
            ForwardProtocol::LocalFilesystem => "localfilesystem",
            ForwardProtocol::Jdwp => "jdwp",
            ForwardProtocol::Local => "local",
        }
    }
}

impl fmt::Display for ForwardProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForwardProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(ForwardProtocol::Tcp),
            "localabstract" => Ok(ForwardProtocol::LocalAbstract),
            "localreserved" => Ok(ForwardProtocol::LocalReserved),
            "localfilesystem" => Ok(ForwardProtocol::LocalFilesystem),
            "jdwp" => Ok(ForwardProtocol::Jdwp),
            "local" => Ok(ForwardProtocol::Local),
            other => Err(Error::Parse(format!("unknown forward protocol: {other:?}"))),
        }
    }
}

/// One endpoint of a forward, rendered `protocol:port_or_name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardSpec {
    /// Endpoint protocol.
    pub protocol: ForwardProtocol,
    /// TCP port, socket name, or JDWP pid, depending on the protocol.
    pub port_or_name: String,
}

impl ForwardSpec {
    /// A `tcp:<port>` endpoint.
    #[must_use]
    pub fn tcp(port: u16) -> Self {
        ForwardSpec {
            protocol: ForwardProtocol::Tcp,
            port_or_name: port.to_string(),
        }
    }

    /// The TCP port, when the protocol is `tcp` and the value parses.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        if self.protocol != ForwardProtocol::Tcp {
            return None;
        }
        self.port_or_name.parse().ok()
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.port_or_name)
    }
}

impl FromStr for ForwardSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((protocol, port_or_name)) = s.split_once(':') else {
            return Err(Error::Parse(format!(
                "forward spec needs a ':' separator: {s:?}"
            )));
        };
        Ok(ForwardSpec {
            protocol: protocol.parse()?,
            port_or_name: port_or_name.to_string(),
        })
    }
}

impl Device {
    /// The server's forward table, filtered to this device.
    ///
    /// The table is whitespace-separated `serial local remote` triples;
    /// entries belonging to other serials are dropped.
    pub fn forward_list(&self) -> Result<Vec<(ForwardSpec, ForwardSpec)>> {
        let request = format!("{}:list-forward", self.descriptor().host_prefix());
        let reply = request_response(self.address(), &request)?;
        let text = String::from_utf8_lossy(&reply);
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() % 3 != 0 {
            return Err(Error::Parse(format!(
                "forward table has {} fields, expected triples",
                fields.len()
            )));
        }
        let mut pairs = Vec::new();
        for triple in fields.chunks(3) {
            if let DeviceDescriptor::Serial(serial) = self.descriptor() {
                if triple[0] != serial.as_str() {
                    continue;
                }
            }
            pairs.push((triple[1].parse()?, triple[2].parse()?));
        }
        Ok(pairs)
    }

    /// Installs a forward from `local` on the host to `remote` on the
    /// device.
    pub fn forward(&self, local: &ForwardSpec, remote: &ForwardSpec) -> Result<()> {
        let request = format!(
            "{}:forward:{local};{remote}",
            self.descriptor().host_prefix()
        );
        send(self.address(), &request)
    }

    /// Removes the forward bound to `local`.
    pub fn forward_remove(&self, local: &ForwardSpec) -> Result<()> {
        let request = format!("{}:killforward:{local}", self.descriptor().host_prefix());
        send(self.address(), &request)
    }

    /// Removes every forward for this device.
    pub fn forward_remove_all(&self) -> Result<()> {
        let request = format!("{}:killforward-all", self.descriptor().host_prefix());
        send(self.address(), &request)
    }

    /// Ensures a local tcp forward to `remote` exists and returns its
    /// port.
    ///
    /// An existing forward to the same remote is reused; otherwise the OS
    /// assigns a free loopback port and a forward is installed on it. Not
    /// atomic against concurrent callers targeting the same remote; the
    /// caller serializes those.
    pub fn forward_to_free_port(&self, remote: &ForwardSpec) -> Result<u16> {
        for (local, existing_remote) in self.forward_list()? {
            if existing_remote == *remote {
                return local.port().ok_or_else(|| {
                    Error::Parse(format!("existing forward {local} has no tcp port"))
                });
            }
        }
        let port = free_local_port()?;
        self.forward(&ForwardSpec::tcp(port), remote)?;
        Ok(port)
    }
}

/// Asks the OS for a currently free loopback TCP port.
fn free_local_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::server::tests::{fake_server, fake_server_with, okay_reply, read_request};

    fn test_device(address: String) -> Device {
        Device::new(address, DeviceDescriptor::Serial("SERIAL1".into()))
    }

    #[test]
    fn spec_rendering_and_parsing() {
        let spec = ForwardSpec::tcp(8080);
        assert_eq!(spec.to_string(), "tcp:8080");
        assert_eq!(spec.port(), Some(8080));
        assert_eq!("tcp:8080".parse::<ForwardSpec>().unwrap(), spec);

        let spec: ForwardSpec = "localabstract:chrome_devtools_remote".parse().unwrap();
        assert_eq!(spec.protocol, ForwardProtocol::LocalAbstract);
        assert_eq!(spec.port(), None);

        assert!(matches!(
            "8080".parse::<ForwardSpec>(),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            "udp:53".parse::<ForwardSpec>(),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn non_numeric_tcp_port_is_none() {
        let spec = ForwardSpec {
            protocol: ForwardProtocol::Tcp,
            port_or_name: "http".into(),
        };
        assert_eq!(spec.port(), None);
    }

    #[test]
    fn forward_list_filters_foreign_serials() {
        let table = "SERIAL1 tcp:6100 tcp:7100\nOTHER tcp:6200 tcp:7200\nSERIAL1 tcp:6300 localabstract:scrcpy\n";
        let (address, server) = fake_server(vec![(
            "host-serial:SERIAL1:list-forward".into(),
            okay_reply(table),
        )]);
        let pairs = test_device(address).forward_list().unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0.port(), Some(6100));
        assert_eq!(pairs[1].1.protocol, ForwardProtocol::LocalAbstract);
        server.join().unwrap();
    }

    #[test]
    fn forward_list_rejects_ragged_tables() {
        let (address, server) = fake_server(vec![(
            "host-serial:SERIAL1:list-forward".into(),
            okay_reply("SERIAL1 tcp:6100\n"),
        )]);
        assert!(matches!(
            test_device(address).forward_list(),
            Err(Error::Parse(_))
        ));
        server.join().unwrap();
    }

    #[test]
    fn forward_and_remove_requests() {
        let (address, server) = fake_server(vec![
            (
                "host-serial:SERIAL1:forward:tcp:6100;tcp:7100".into(),
                b"OKAY".to_vec(),
            ),
            (
                "host-serial:SERIAL1:killforward:tcp:6100".into(),
                b"OKAY".to_vec(),
            ),
            ("host-serial:SERIAL1:killforward-all".into(), b"OKAY".to_vec()),
        ]);
        let device = test_device(address);
        device
            .forward(&ForwardSpec::tcp(6100), &ForwardSpec::tcp(7100))
            .unwrap();
        device.forward_remove(&ForwardSpec::tcp(6100)).unwrap();
        device.forward_remove_all().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn forward_to_free_port_installs_new_forward() {
        let (address, server) = fake_server_with(|listener| {
            let (mut conn, _) = listener.accept().unwrap();
            assert_eq!(read_request(&mut conn), "host-serial:SERIAL1:list-forward");
            conn.write_all(&okay_reply("")).unwrap();
            drop(conn);

            let (mut conn, _) = listener.accept().unwrap();
            let request = read_request(&mut conn);
            let suffix = request
                .strip_prefix("host-serial:SERIAL1:forward:tcp:")
                .expect("unexpected forward request");
            let (port, remote) = suffix.split_once(';').unwrap();
            assert!(port.parse::<u16>().unwrap() > 0);
            assert_eq!(remote, "tcp:8080");
            conn.write_all(b"OKAY").unwrap();
        });
        let port = test_device(address)
            .forward_to_free_port(&ForwardSpec::tcp(8080))
            .unwrap();
        assert!(port > 0);
        server.join().unwrap();
    }

    #[test]
    fn forward_to_free_port_reuses_existing() {
        let (address, server) = fake_server(vec![(
            "host-serial:SERIAL1:list-forward".into(),
            okay_reply("SERIAL1 tcp:6100 tcp:8080\n"),
        )]);
        let port = test_device(address)
            .forward_to_free_port(&ForwardSpec::tcp(8080))
            .unwrap();
        assert_eq!(port, 6100);
        server.join().unwrap();
    }

    #[test]
    fn forward_to_free_port_rejects_portless_local() {
        let (address, server) = fake_server(vec![(
            "host-serial:SERIAL1:list-forward".into(),
            okay_reply("SERIAL1 localabstract:sock tcp:8080\n"),
        )]);
        assert!(matches!(
            test_device(address).forward_to_free_port(&ForwardSpec::tcp(8080)),
            Err(Error::Parse(_))
        ));
        server.join().unwrap();
    }
}
