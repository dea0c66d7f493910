//! SSH module - the transport under the SFTP channel
//!
//! Connection configuration, error classification, and the russh-backed
//! [`SshConnector`].

mod client;
mod config;
mod error;

pub use client::{ClientHandler, SshConnector, SshTransport};
pub use config::{AuthMethod, ConnectConfig, DebugSink};
pub use error::SshError;
