//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Invalid port: {0}")]
    BadPort(u16),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection attempt abandoned")]
    Abandoned,
}

impl SshError {
    /// Failures that another attempt cannot fix: the target cannot be
    /// resolved, refuses connections, or the port is invalid. An abandoned
    /// attempt is not retried either.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SshError::HostNotFound(_)
                | SshError::ConnectionRefused(_)
                | SshError::BadPort(_)
                | SshError::Abandoned
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => SshError::from_connect_io(e),
            russh::Error::KeyChanged { line } => SshError::HostKeyRejected(format!(
                "server key does not match known_hosts entry on line {}",
                line
            )),
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl SshError {
    /// Classify a socket-level failure raised while dialing the server.
    pub fn from_connect_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => SshError::ConnectionRefused(err.to_string()),
            std::io::ErrorKind::TimedOut => SshError::Timeout(err.to_string()),
            _ => SshError::IoError(err),
        }
    }
}
