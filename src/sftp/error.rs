//! SFTP error types
//!
//! Every failure leaving the public API is an [`SftpError`]: a stable
//! [`ErrorCode`], the [`ErrorKind`] derived from it, a message, and the name
//! of the operation that raised it. Raw errors coming out of the channel or
//! the transport carry no operation name yet; the first public operation they
//! pass through tags them and later tags are ignored.

use std::fmt;
use std::io;

use russh_sftp::protocol::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::session::TransportEvent;
use crate::ssh::SshError;

/// Error categories callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Transport unreachable, refused, lost, or a duplicate connect
    Connection,
    /// SFTP subsystem negotiation failed
    Channel,
    /// Remote object absent
    NotExist,
    /// Wrong object type, permission denied, invalid local path
    BadPath,
    /// Any other failure reported by the server or the I/O layer
    Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    Eof,
    NoSuchFile,
    PermissionDenied,
    Failure,
    BadMessage,
    NoConnection,
    ConnectionLost,
    OpUnsupported,
    HostNotFound,
    ConnectionRefused,
    BadPort,
    Timeout,
    AuthFailed,
    HandshakeFailed,
    ChannelOpenFailed,
    AlreadyConnected,
    NotConnected,
    BadPath,
    NotDirectory,
    IsDirectory,
    Io,
    Terminated,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Eof => "EOF",
            ErrorCode::NoSuchFile => "ENOENT",
            ErrorCode::PermissionDenied => "EACCES",
            ErrorCode::Failure => "EFAILURE",
            ErrorCode::BadMessage => "EBADMSG",
            ErrorCode::NoConnection => "ENOTCONN",
            ErrorCode::ConnectionLost => "ECONNRESET",
            ErrorCode::OpUnsupported => "EOPNOTSUPP",
            ErrorCode::HostNotFound => "ENOTFOUND",
            ErrorCode::ConnectionRefused => "ECONNREFUSED",
            ErrorCode::BadPort => "ERR_SOCKET_BAD_PORT",
            ErrorCode::Timeout => "ETIMEDOUT",
            ErrorCode::AuthFailed => "ERR_AUTH_FAILED",
            ErrorCode::HandshakeFailed => "ERR_HANDSHAKE",
            ErrorCode::ChannelOpenFailed => "ERR_CHANNEL_OPEN",
            ErrorCode::AlreadyConnected => "ERR_ALREADY_CONNECTED",
            ErrorCode::NotConnected => "ERR_NOT_CONNECTED",
            ErrorCode::BadPath => "ERR_BAD_PATH",
            ErrorCode::NotDirectory => "ENOTDIR",
            ErrorCode::IsDirectory => "EISDIR",
            ErrorCode::Io => "EIO",
            ErrorCode::Terminated => "ERR_CONNECTION_TERMINATED",
            ErrorCode::Unknown => "ERR_GENERIC_CLIENT",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorCode::HostNotFound
            | ErrorCode::ConnectionRefused
            | ErrorCode::BadPort
            | ErrorCode::Timeout
            | ErrorCode::AuthFailed
            | ErrorCode::HandshakeFailed
            | ErrorCode::AlreadyConnected
            | ErrorCode::NotConnected
            | ErrorCode::NoConnection
            | ErrorCode::ConnectionLost
            | ErrorCode::Terminated => ErrorKind::Connection,
            ErrorCode::ChannelOpenFailed => ErrorKind::Channel,
            ErrorCode::NoSuchFile => ErrorKind::NotExist,
            ErrorCode::BadPath
            | ErrorCode::NotDirectory
            | ErrorCode::IsDirectory
            | ErrorCode::PermissionDenied => ErrorKind::BadPath,
            ErrorCode::Eof
            | ErrorCode::Failure
            | ErrorCode::BadMessage
            | ErrorCode::OpUnsupported
            | ErrorCode::Io
            | ErrorCode::Unknown => ErrorKind::Protocol,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}{} ({})", op_prefix(.op), .message, .code)]
pub struct SftpError {
    code: ErrorCode,
    message: String,
    op: Option<&'static str>,
}

fn op_prefix(op: &Option<&'static str>) -> String {
    op.map(|op| format!("{}: ", op)).unwrap_or_default()
}

impl SftpError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            op: None,
        }
    }

    pub fn bad_path(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadPath, message)
    }

    pub fn not_exist(path: &str) -> Self {
        Self::new(ErrorCode::NoSuchFile, format!("No such file: {}", path))
    }

    pub fn not_connected() -> Self {
        Self::new(ErrorCode::NotConnected, "No SFTP connection available")
    }

    pub fn already_connected() -> Self {
        Self::new(
            ErrorCode::AlreadyConnected,
            "An SFTP connection is already established or in progress",
        )
    }

    /// The transport went away while `op` was pending.
    pub fn terminated(op: &'static str, event: &TransportEvent) -> Self {
        let message = match event {
            TransportEvent::Close => "Connection closed unexpectedly".to_string(),
            TransportEvent::End => "Connection ended unexpectedly".to_string(),
            TransportEvent::Error(msg) => format!("Connection error: {}", msg),
            TransportEvent::Ready => "Unexpected ready signal".to_string(),
        };
        Self::new(ErrorCode::Terminated, message).with_op(op)
    }

    /// A reader or writer failed mid-transfer; `at` names the path or `<stream>`.
    pub fn io_at(err: &io::Error, at: &str) -> Self {
        Self::new(io_code(err), format!("{}: {}", at, err))
    }

    /// Tag with the operation name unless already tagged.
    pub fn with_op(mut self, op: &'static str) -> Self {
        if self.op.is_none() {
            self.op = Some(op);
        }
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn op(&self) -> Option<&'static str> {
        self.op
    }

    /// True once a public operation has tagged this error.
    pub fn is_normalized(&self) -> bool {
        self.op.is_some()
    }

    pub fn is_not_exist(&self) -> bool {
        self.code == ErrorCode::NoSuchFile
    }
}

fn io_code(err: &io::Error) -> ErrorCode {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorCode::NoSuchFile,
        io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
        io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
            ErrorCode::ConnectionLost
        }
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => ErrorCode::NoConnection,
        io::ErrorKind::TimedOut => ErrorCode::Timeout,
        io::ErrorKind::UnexpectedEof => ErrorCode::Eof,
        io::ErrorKind::Unsupported => ErrorCode::OpUnsupported,
        _ => ErrorCode::Io,
    }
}

impl From<io::Error> for SftpError {
    fn from(err: io::Error) -> Self {
        Self::new(io_code(&err), err.to_string())
    }
}

impl From<russh_sftp::client::error::Error> for SftpError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        use russh_sftp::client::error::Error;

        match err {
            Error::Status(status) => {
                let code = match status.status_code {
                    StatusCode::Eof => ErrorCode::Eof,
                    StatusCode::NoSuchFile => ErrorCode::NoSuchFile,
                    StatusCode::PermissionDenied => ErrorCode::PermissionDenied,
                    StatusCode::Failure => ErrorCode::Failure,
                    StatusCode::BadMessage => ErrorCode::BadMessage,
                    StatusCode::NoConnection => ErrorCode::NoConnection,
                    StatusCode::ConnectionLost => ErrorCode::ConnectionLost,
                    StatusCode::OpUnsupported => ErrorCode::OpUnsupported,
                    _ => ErrorCode::Unknown,
                };
                let message = if status.error_message.is_empty() {
                    format!("{:?}", status.status_code)
                } else {
                    status.error_message
                };
                Self::new(code, message)
            }
            Error::Timeout => Self::new(ErrorCode::Timeout, "SFTP request timed out"),
            Error::IO(msg) => Self::new(ErrorCode::Io, msg),
            other => Self::new(ErrorCode::BadMessage, other.to_string()),
        }
    }
}

impl From<SshError> for SftpError {
    fn from(err: SshError) -> Self {
        let code = match &err {
            SshError::HostNotFound(_) => ErrorCode::HostNotFound,
            SshError::ConnectionRefused(_) => ErrorCode::ConnectionRefused,
            SshError::BadPort(_) => ErrorCode::BadPort,
            SshError::Timeout(_) => ErrorCode::Timeout,
            SshError::AuthenticationFailed(_) | SshError::KeyError(_) => ErrorCode::AuthFailed,
            SshError::HostKeyRejected(_) | SshError::ProtocolError(_) => {
                ErrorCode::HandshakeFailed
            }
            SshError::ChannelError(_) => ErrorCode::ChannelOpenFailed,
            SshError::ConnectionFailed(_) => ErrorCode::NoConnection,
            SshError::Abandoned => ErrorCode::ConnectionLost,
            SshError::IoError(e) => io_code(e),
        };
        Self::new(code, err.to_string())
    }
}
