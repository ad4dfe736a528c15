//! Session configuration.
//!
//! Built once, either through the builder methods or from YAML, and handed
//! to [`crate::ssh::Session::new`]. Nothing here is mutated after that.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// SSH session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    #[serde(default)]
    pub auth: AuthMethod,

    /// Bound on handshake plus authentication, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,

    #[serde(default = "default_keepalive_secs")]
    pub keepalive_interval_secs: u64,

    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,

    /// Overrides the identification string sent to the server (`SSH-2.0-...`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
}

fn default_port() -> u16 {
    22
}

fn default_keepalive_secs() -> u64 {
    15
}

/// How the session authenticates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    Password {
        password: String,
    },
    KeyFile {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    /// Keys offered by the running SSH agent (`SSH_AUTH_SOCK`).
    #[default]
    Agent,
}

/// Host key verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any host key (insecure, but matches OpenSSH StrictHostKeyChecking=no).
    #[default]
    AcceptAny,

    /// Meant to accept new keys and reject changed ones
    /// (StrictHostKeyChecking=accept-new). No known-hosts store is kept,
    /// so there is nothing to compare against and every key is accepted,
    /// same as `AcceptAny`.
    AcceptNew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Socks4,
    Socks5,
}

/// Proxy the TCP connection is tunneled through before the SSH handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn new(kind: ProxyKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

impl SessionConfig {
    /// Create a configuration that authenticates through the SSH agent.
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth: AuthMethod::Agent,
            connect_timeout_ms: None,
            keepalive_interval_secs: default_keepalive_secs(),
            host_key_policy: HostKeyPolicy::AcceptAny,
            proxy: None,
            client_version: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.auth = AuthMethod::Password {
            password: password.into(),
        };
        self
    }

    pub fn with_key_file(mut self, path: impl AsRef<str>, passphrase: Option<String>) -> Self {
        self.auth = AuthMethod::KeyFile {
            path: expand_path(path.as_ref()),
            passphrase,
        };
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = Some(version.into());
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        if self.keepalive_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.keepalive_interval_secs))
        }
    }

    /// Parse a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let mut config: SessionConfig = serde_yaml::from_str(content)
            .map_err(|e| SessionError::Config(format!("Invalid config: {}", e)))?;

        if let AuthMethod::KeyFile { path, .. } = &mut config.auth {
            *path = expand_path(&path.to_string_lossy());
        }

        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SessionError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(SessionError::Config("host must not be empty".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(SessionError::Config("username must not be empty".to_string()));
        }
        if let Some(proxy) = &self.proxy {
            if proxy.password.is_some() && proxy.username.is_none() {
                return Err(SessionError::Config(
                    "proxy password given without a username".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}
