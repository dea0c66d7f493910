//! Connection configuration

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Everything `SftpClient::connect` needs: where to go, how to log in, and
/// how hard to retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication (empty: current OS user)
    #[serde(default)]
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Timeout for one connection attempt, in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Additional attempts after the first failed one
    #[serde(default = "default_retries")]
    pub retries: usize,

    /// Backoff multiplier applied per retry
    #[serde(default = "default_retry_factor")]
    pub retry_factor: f64,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_retry_min_timeout")]
    pub retry_min_timeout_ms: u64,

    /// Upper bound for any single retry delay, in milliseconds
    #[serde(default = "default_retry_max_timeout")]
    pub retry_max_timeout_ms: u64,

    /// Strict host key checking (default: false)
    /// - true: the server key must already be present in known_hosts
    /// - false: accept any server key
    #[serde(default)]
    pub strict_host_key_checking: bool,

    /// known_hosts file used for strict checking (default: ~/.ssh/known_hosts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,

    /// Receives diagnostic text about the session lifecycle
    #[serde(skip)]
    pub debug: Option<DebugSink>,
}

/// Authentication methods supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },

    /// In-memory private key (OpenSSH or PEM text)
    KeyData {
        private_key: String,
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    pub fn key_data(private_key: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::KeyData {
            private_key: private_key.into(),
            passphrase,
        }
    }
}

/// Callback receiving debug text.
#[derive(Clone)]
pub struct DebugSink(Arc<dyn Fn(&str) + Send + Sync>);

impl DebugSink {
    pub fn new(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn emit(&self, msg: &str) {
        (self.0)(msg)
    }
}

impl fmt::Debug for DebugSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DebugSink")
    }
}

impl ConnectConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            auth,
            ..Default::default()
        }
    }

    /// Username to log in with, falling back to the local user.
    pub fn effective_username(&self) -> String {
        if self.username.is_empty() {
            whoami::username()
        } else {
            self.username.clone()
        }
    }

    pub fn effective_known_hosts_path(&self) -> PathBuf {
        self.known_hosts_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".ssh").join("known_hosts"))
                .unwrap_or_else(|| PathBuf::from("~/.ssh/known_hosts"))
        })
    }

    pub fn with_debug(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.debug = Some(DebugSink::new(f));
        self
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

fn default_retries() -> usize {
    1
}

fn default_retry_factor() -> f64 {
    2.0
}

fn default_retry_min_timeout() -> u64 {
    1000
}

fn default_retry_max_timeout() -> u64 {
    30_000
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            auth: AuthMethod::Password {
                password: String::new(),
            },
            timeout_secs: default_timeout(),
            retries: default_retries(),
            retry_factor: default_retry_factor(),
            retry_min_timeout_ms: default_retry_min_timeout(),
            retry_max_timeout_ms: default_retry_max_timeout(),
            strict_host_key_checking: false,
            known_hosts_path: None,
            debug: None,
        }
    }
}
