//! oxide-sftp - a session-oriented SFTP client
//!
//! [`SftpClient`] wraps one SSH connection and its SFTP channel. It connects
//! with retry and backoff, turns transport failures during a call into a
//! rejected call, and offers file operations, transfers and directory sync
//! on top of the channel.
//!
//! ```no_run
//! use oxide_sftp::{AuthMethod, ConnectConfig, GetTarget, ReadOptions, SftpClient};
//!
//! # async fn run() -> Result<(), oxide_sftp::SftpError> {
//! let client = SftpClient::new();
//! client
//!     .connect(&ConnectConfig::new("example.com", "deploy", AuthMethod::password("secret")))
//!     .await?;
//! let listing = client.list("/var/www", None).await?;
//! let index = client.get("/var/www/index.html", GetTarget::Buffer, ReadOptions::default()).await?;
//! client.end().await?;
//! # let _ = (listing, index);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod session;
pub mod sftp;
pub mod ssh;

#[cfg(test)]
pub(crate) mod testing;

pub use client::SftpClient;
pub use session::{ClientEvent, SessionState, TerminationHandling, TransportEvent};
pub use sftp::{
    EntryType, ErrorCode, ErrorKind, FastTransferOptions, FileStats, GetOutcome, GetTarget,
    MkdirOutcome, PutSource, ReadOptions, RemoteEntry, SftpError, SyncOptions, WriteMode,
    WriteOptions,
};
pub use ssh::{AuthMethod, ConnectConfig, SshError};

use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

/// Install a stderr `tracing` subscriber filtered by `RUST_LOG` (default
/// `info`). Fails, without side effects, if a global subscriber is already set.
pub fn init_logging() -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
}
