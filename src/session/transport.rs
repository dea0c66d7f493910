//! Transport seam
//!
//! A [`Connector`] dials one transport per attempt. The transport reports its
//! lifecycle through the [`EventSink`] it was handed; events are stamped with
//! the attempt's generation so stragglers from abandoned attempts can be told
//! apart from the live session.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use super::events::TransportEvent;
use super::lifecycle::Lifecycle;
use crate::sftp::channel::RemoteChannel;
use crate::ssh::{ConnectConfig, SshError};

#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish and authenticate one transport.
    async fn connect(
        &self,
        config: &ConnectConfig,
        sink: EventSink,
    ) -> Result<Arc<dyn Transport>, SshError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Negotiate the SFTP subsystem.
    async fn open_channel(&self) -> Result<Arc<dyn RemoteChannel>, SshError>;

    /// Tear the connection down. Implementations emit `Close` once done.
    async fn shutdown(&self);
}

/// Handle a transport uses to report lifecycle signals.
#[derive(Clone)]
pub struct EventSink {
    generation: u64,
    lifecycle: Weak<Lifecycle>,
}

impl EventSink {
    pub(crate) fn new(generation: u64, lifecycle: Weak<Lifecycle>) -> Self {
        Self {
            generation,
            lifecycle,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(lifecycle) = self.lifecycle.upgrade() {
            lifecycle.dispatch(self.generation, event);
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("generation", &self.generation)
            .finish()
    }
}
