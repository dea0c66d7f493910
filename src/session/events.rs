//! Events published by the client

use std::path::PathBuf;

/// Lifecycle signal raised by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Ready,
    Close,
    End,
    Error(String),
}

impl TransportEvent {
    pub fn is_termination(&self) -> bool {
        !matches!(self, TransportEvent::Ready)
    }
}

/// Everything a `subscribe()` receiver sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// One regular file uploaded by `upload_dir`
    Upload { source: PathBuf, destination: String },
    /// One regular file downloaded by `download_dir`
    Download { source: String, destination: PathBuf },
    Transport(TransportEvent),
}
