//! SFTP client facade
//!
//! [`SftpClient`] owns one session. `connect` establishes it with retry and
//! backoff, `end` tears it down, and every other public operation runs under
//! an [`OperationScope`](crate::session::OperationScope) so a transport
//! failure mid-call rejects that call instead of leaving it hanging.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::session::{ClientEvent, Connector, EndStep, Lifecycle, SessionState};
use crate::sftp::channel::RemoteChannel;
use crate::sftp::constants::{CONNECT_SETTLE_DELAY, END_TIMEOUT};
use crate::sftp::error::{ErrorCode, SftpError};
use crate::sftp::retry::{retry_with_backoff, RetryConfig};
use crate::ssh::{ConnectConfig, SshConnector, SshError};

pub struct SftpClient {
    pub(crate) lifecycle: Arc<Lifecycle>,
    connector: Arc<dyn Connector>,
}

impl Default for SftpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SftpClient {
    /// Client that dials real SSH servers.
    pub fn new() -> Self {
        Self::with_connector(Arc::new(SshConnector))
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            connector,
        }
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle.is_connected()
    }

    /// Progress and transport signals. Drop the receiver to stop listening.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.lifecycle.subscribe()
    }

    pub(crate) fn channel(&self) -> Result<Arc<dyn RemoteChannel>, SftpError> {
        self.lifecycle.channel()
    }

    /// Run `fut` as operation `op`: errors are tagged with `op`, and a
    /// termination signal arriving first rejects the call.
    pub(crate) async fn guarded<T, F>(&self, op: &'static str, fut: F) -> Result<T, SftpError>
    where
        F: Future<Output = Result<T, SftpError>>,
    {
        let mut scope = self.lifecycle.begin_operation(op);
        tokio::select! {
            result = fut => result.map_err(|e| e.with_op(op)),
            event = scope.terminated() => Err(SftpError::terminated(op, &event)),
        }
    }

    /// Open the transport and negotiate the SFTP channel.
    ///
    /// Fails immediately if a session already exists or is being set up.
    pub async fn connect(&self, config: &ConnectConfig) -> Result<(), SftpError> {
        const OP: &str = "connect";

        let attempt = self
            .lifecycle
            .begin_connect(config.debug.clone())
            .map_err(|e| e.with_op(OP))?;
        let mut scope = self.lifecycle.begin_operation(OP);
        self.lifecycle
            .debug_msg(&format!("Connecting to {}:{}", config.host, config.port));

        let result = self.establish(attempt, config).await;

        // A termination right behind the result still belongs to this attempt
        let result = tokio::select! {
            _ = tokio::time::sleep(CONNECT_SETTLE_DELAY) => result,
            event = scope.terminated() => result.and(Err(SftpError::terminated(OP, &event))),
        };

        match result {
            Ok(()) => {
                info!(
                    "SFTP connection established to {}:{}",
                    config.host, config.port
                );
                Ok(())
            }
            Err(e) => {
                if let Some(transport) = self.lifecycle.abort_connect(attempt) {
                    transport.shutdown().await;
                }
                self.lifecycle.debug_msg(&format!("Connect failed: {}", e));
                Err(e.with_op(OP))
            }
        }
    }

    async fn establish(&self, attempt: u64, config: &ConnectConfig) -> Result<(), SftpError> {
        let retry = RetryConfig::from(config);
        let lifecycle = &self.lifecycle;
        let connector = &self.connector;

        let (generation, transport) =
            retry_with_backoff(&retry, "SFTP connect", SshError::is_fatal, |n| async move {
                // end() may have run while we were backing off
                if !lifecycle.attempt_live(attempt) {
                    return Err(SshError::Abandoned);
                }
                let sink = lifecycle.next_sink();
                let generation = sink.generation();
                lifecycle.debug_msg(&format!("Connection attempt {}", n + 1));
                connector
                    .connect(config, sink)
                    .await
                    .map(|transport| (generation, transport))
            })
            .await?;

        if let Err(e) = self
            .lifecycle
            .attach_transport(attempt, generation, transport.clone())
        {
            transport.shutdown().await;
            return Err(e);
        }

        match transport.open_channel().await {
            Ok(channel) => self.lifecycle.attach_channel(generation, channel),
            Err(e) => {
                if let Some(transport) = self.lifecycle.abort_connect(attempt) {
                    transport.shutdown().await;
                }
                Err(SftpError::new(ErrorCode::ChannelOpenFailed, e.to_string()))
            }
        }
    }

    /// Close the session. Resolves once the transport reports closure.
    ///
    /// Calling it on a closed session is a no-op.
    pub async fn end(&self) -> Result<(), SftpError> {
        let rx = match self.lifecycle.begin_end() {
            EndStep::AlreadyClosed => {
                debug!("end() on a closed session");
                return Ok(());
            }
            EndStep::Shutdown(transport, rx) => {
                self.lifecycle.debug_msg("Ending SFTP session");
                transport.shutdown().await;
                rx
            }
            EndStep::Wait(rx) => rx,
        };

        match tokio::time::timeout(END_TIMEOUT, rx).await {
            Ok(Ok(())) => {}
            _ => self.lifecycle.force_closed(),
        }
        Ok(())
    }
}
