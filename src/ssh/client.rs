//! SSH transport implementation using russh

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::{self, DisconnectReason};
use russh::keys::known_hosts::known_host_keys_path;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelId, Disconnect};
use russh_sftp::client::{RawSftpSession, SftpSession};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, ConnectConfig};
use super::error::SshError;
use crate::session::{Connector, EventSink, Transport, TransportEvent};
use crate::sftp::channel::{RemoteChannel, RusshChannel};

/// Dials SSH servers with russh.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        config: &ConnectConfig,
        sink: EventSink,
    ) -> Result<Arc<dyn Transport>, SshError> {
        if config.port == 0 {
            return Err(SshError::BadPort(config.port));
        }

        let addrs = resolve(&config.host, config.port).await?;
        info!(
            "Connecting to SSH server at {}:{} ({} address(es))",
            config.host,
            config.port,
            addrs.len()
        );

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let primary = PrimaryChannel::default();
        let handler = ClientHandler {
            host: config.host.clone(),
            port: config.port,
            strict: config.strict_host_key_checking,
            known_hosts: config.effective_known_hosts_path(),
            sink: sink.clone(),
            primary: primary.clone(),
        };

        let mut handle = tokio::time::timeout(Duration::from_secs(config.timeout_secs), async {
            let stream = dial(&addrs).await?;
            client::connect_stream(Arc::new(ssh_config), stream, handler).await
        })
        .await
        .map_err(|_| {
            SshError::Timeout(format!(
                "Handshake with {}:{} timed out",
                config.host, config.port
            ))
        })??;

        debug!("SSH handshake completed");

        let username = config.effective_username();
        let authenticated = match &config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                authenticate_key(&mut handle, &username, key).await?
            }
            AuthMethod::KeyData {
                private_key,
                passphrase,
            } => {
                let key = russh::keys::decode_secret_key(private_key, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                authenticate_key(&mut handle, &username, key).await?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}", username);
        sink.emit(TransportEvent::Ready);

        Ok(Arc::new(SshTransport {
            handle,
            sink,
            primary,
        }))
    }
}

async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, SshError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| SshError::HostNotFound(format!("{}: {}", host, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(SshError::HostNotFound(format!("{}: no address found", host)));
    }
    Ok(addrs)
}

/// Try each resolved address in order. The last failure is reported only
/// once every address has been tried.
async fn dial(addrs: &[SocketAddr]) -> Result<TcpStream, SshError> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!("TCP connection established to {}", addr);
                return Ok(stream);
            }
            Err(e) => {
                debug!("Dialing {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => SshError::from_connect_io(e),
        None => SshError::HostNotFound("no address to dial".to_string()),
    })
}

async fn authenticate_key(
    handle: &mut client::Handle<ClientHandler>,
    username: &str,
    key: PrivateKey,
) -> Result<client::AuthResult, SshError> {
    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        .flatten();

    handle
        .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await
        .map_err(|e| SshError::AuthenticationFailed(e.to_string()))
}

/// Live SSH connection carrying the SFTP channel.
pub struct SshTransport {
    handle: client::Handle<ClientHandler>,
    sink: EventSink,
    primary: PrimaryChannel,
}

impl SshTransport {
    async fn sftp_stream(
        &self,
    ) -> Result<(ChannelId, impl AsyncRead + AsyncWrite + Unpin + Send + 'static), SshError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to open channel: {}", e)))?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to request SFTP subsystem: {}", e)))?;

        Ok((channel.id(), channel.into_stream()))
    }

    /// A second SFTP channel for extension requests the high-level session
    /// cannot send, with the extensions the server announced. Losing it only
    /// disables those extensions.
    async fn extension_session(&self) -> Option<(RawSftpSession, HashMap<String, String>)> {
        let stream = match self.sftp_stream().await {
            Ok((_, stream)) => stream,
            Err(e) => {
                warn!("SFTP extension channel unavailable: {}", e);
                return None;
            }
        };
        let raw = RawSftpSession::new(stream);
        match raw.init().await {
            Ok(version) => {
                debug!("SFTP server extensions: {:?}", version.extensions.keys());
                Some((raw, version.extensions))
            }
            Err(e) => {
                warn!("SFTP extension channel failed to initialize: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_channel(&self) -> Result<Arc<dyn RemoteChannel>, SshError> {
        let (id, stream) = self.sftp_stream().await?;
        *self.primary.lock() = Some(id);
        let sftp = SftpSession::new(stream)
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to initialize SFTP session: {}", e)))?;

        info!("SFTP subsystem ready");
        let channel = match self.extension_session().await {
            Some((raw, extensions)) => RusshChannel::with_extensions(sftp, raw, &extensions),
            None => RusshChannel::new(sftp),
        };
        Ok(Arc::new(channel))
    }

    async fn shutdown(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "Session closed", "en")
            .await
        {
            debug!("Disconnect returned an error: {}", e);
        }
        self.sink.emit(TransportEvent::Close);
    }
}

/// Client handler for russh callbacks
///
/// Verifies the server key and turns connection teardown into
/// [`TransportEvent`]s.
pub struct ClientHandler {
    host: String,
    port: u16,
    /// Require the key to be present in known_hosts
    strict: bool,
    known_hosts: PathBuf,
    sink: EventSink,
    primary: PrimaryChannel,
}

/// Id of the channel carrying the main SFTP session. Only its EOF or close
/// ends the session; side channels come and go.
type PrimaryChannel = Arc<Mutex<Option<ChannelId>>>;

impl ClientHandler {
    fn is_primary(&self, channel: ChannelId) -> bool {
        *self.primary.lock() == Some(channel)
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if !self.strict {
            debug!("Accepting host key for {}:{}", self.host, self.port);
            return Ok(true);
        }

        let known = known_host_keys_path(&self.host, self.port, &self.known_hosts)?;
        if known.iter().any(|(_, key)| key == server_public_key) {
            info!("Host key verified for {}:{}", self.host, self.port);
            return Ok(true);
        }

        match known.first() {
            None => {
                warn!(
                    "Unknown host key for {}:{}. Strict mode enabled, rejecting.",
                    self.host, self.port
                );
                Err(SshError::HostKeyRejected(format!(
                    "{}:{} is not present in {}",
                    self.host,
                    self.port,
                    self.known_hosts.display()
                )))
            }
            Some((line, _)) => {
                warn!(
                    "HOST KEY CHANGED for {}:{} (known_hosts line {})",
                    self.host, self.port, line
                );
                Err(SshError::HostKeyRejected(format!(
                    "Key for {}:{} does not match known_hosts line {}",
                    self.host, self.port, line
                )))
            }
        }
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel {:?} reached EOF", channel);
        if self.is_primary(channel) {
            self.sink.emit(TransportEvent::End);
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel {:?} closed", channel);
        if self.is_primary(channel) {
            self.sink.emit(TransportEvent::Close);
        }
        Ok(())
    }

    async fn disconnected(
        &mut self,
        reason: DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        match reason {
            DisconnectReason::ReceivedDisconnect(_) => {
                info!("Server closed the SSH connection for {}:{}", self.host, self.port);
                self.sink.emit(TransportEvent::End);
            }
            DisconnectReason::Error(e) => {
                warn!("SSH connection lost: {}", e);
                self.sink.emit(TransportEvent::Error(e.to_string()));
            }
        }
        self.sink.emit(TransportEvent::Close);
        Ok(())
    }
}
