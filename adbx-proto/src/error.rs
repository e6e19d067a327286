//! Error taxonomy shared by the wire layer and the client library.

use std::io;

/// Alias for `Result<T, adbx_proto::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by ADB protocol and client operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error on the underlying socket or stream.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The peer closed the connection mid-protocol. The server probably
    /// died; only the device watcher recovers from this.
    #[error("connection reset by server")]
    ConnectionReset,

    /// The server answered with a status word outside the accepted set.
    #[error("unexpected status: want {want}, got {got:?}")]
    UnexpectedStatus {
        /// The accepted status words, `|`-joined.
        want: String,
        /// The status word actually read.
        got: String,
    },

    /// The server answered `FAIL` with the given message.
    #[error("server error: {0}")]
    Server(String),

    /// An outbound frame would not fit the four-hex-digit length field.
    #[error("message length {0} exceeds maximum 65535")]
    MessageTooLong(usize),

    /// A short read on a length, header, or payload.
    #[error("incomplete {what}: read {got} of {want} bytes")]
    IncompleteMessage {
        /// Which part of the exchange came up short.
        what: &'static str,
        /// Bytes actually read.
        got: usize,
        /// Bytes required.
        want: usize,
    },

    /// The path does not exist on the device.
    #[error("file does not exist on device")]
    FileNotExist,

    /// The server reported that no device matched the request.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Malformed device list, forward list, or command line.
    #[error("parse error: {0}")]
    Parse(String),

    /// A shell command finished with a non-zero exit code.
    #[error("command {cmd:?} exited with code {code}")]
    CommandExit {
        /// The command line that was run.
        cmd: String,
        /// The recovered exit code.
        code: i32,
    },
}

impl Error {
    /// Maps a `FAIL` message to the matching error kind.
    ///
    /// Old servers report `device not found`, newer ones
    /// `device '<serial>' not found`; the sync service reports missing
    /// paths as `No such file or directory`.
    pub fn from_server_message(msg: String) -> Self {
        if msg.starts_with("device") && msg.ends_with("not found") {
            Error::DeviceNotFound(msg)
        } else if msg.contains("No such file or directory") {
            Error::FileNotExist
        } else {
            Error::Server(msg)
        }
    }

    /// Builds an [`Error::UnexpectedStatus`] from raw status words.
    #[must_use]
    pub fn unexpected_status(want: &[[u8; 4]], got: [u8; 4]) -> Self {
        let want = want
            .iter()
            .map(|t| String::from_utf8_lossy(t).into_owned())
            .collect::<Vec<_>>()
            .join("|");
        Error::UnexpectedStatus {
            want,
            got: String::from_utf8_lossy(&got).into_owned(),
        }
    }

    /// Whether this error means the server went away mid-exchange.
    #[must_use]
    pub fn is_connection_reset(&self) -> bool {
        match self {
            Error::ConnectionReset => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            // EOF exactly on a frame boundary: the peer closed under us.
            Error::IncompleteMessage { got: 0, .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_message_mapping() {
        assert!(matches!(
            Error::from_server_message("device not found".into()),
            Error::DeviceNotFound(_)
        ));
        assert!(matches!(
            Error::from_server_message("device 'emulator-5554' not found".into()),
            Error::DeviceNotFound(_)
        ));
        assert!(matches!(
            Error::from_server_message("open failed: No such file or directory".into()),
            Error::FileNotExist
        ));
        assert!(matches!(
            Error::from_server_message("closed".into()),
            Error::Server(_)
        ));
    }

    #[test]
    fn reset_classification() {
        assert!(Error::ConnectionReset.is_connection_reset());
        assert!(Error::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_connection_reset());
        assert!(Error::IncompleteMessage {
            what: "length",
            got: 0,
            want: 4
        }
        .is_connection_reset());
        assert!(!Error::IncompleteMessage {
            what: "length",
            got: 2,
            want: 4
        }
        .is_connection_reset());
        assert!(!Error::FileNotExist.is_connection_reset());
    }
}
