//! SFTP operations module
//!
//! Remote path handling, metadata and listing, transfers, directory sync,
//! and the error taxonomy every public operation reports through.

pub mod channel;
pub mod error;
pub(crate) mod local;
mod ops;
pub mod path_utils;
pub mod retry;
mod sync;
mod transfer;
pub mod types;

pub use channel::{RemoteChannel, RemoteReader, RemoteWriter, RusshChannel};
pub use error::{ErrorCode, ErrorKind, SftpError};
pub use retry::{calculate_backoff, retry_with_backoff, RetryConfig};
pub use types::*;
