//! SSH session over russh.
//!
//! A [`Session`] owns one authenticated connection and hands out executors,
//! each on its own channel. Executors are built without I/O; failures show up
//! when they are connected.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use encoding_rs::Encoding;
use russh::client::{self, Handle};
use tokio::net::UnixStream;

use crate::config::{AuthMethod, HostKeyPolicy, SessionConfig};
use crate::error::{Result, SessionError};
use crate::ssh::channel::{ChannelRequest, RusshChannel};
use crate::ssh::exec::CommandExecutor;
use crate::ssh::proxy;
use crate::ssh::pty::ShellExecutor;
use crate::ssh::sftp::{RusshSftp, SftpExecutor};

/// Shared handle to an authenticated russh connection.
pub(crate) type SessionHandle = Arc<Handle<ClientHandler>>;

const SSH_VERSION_PREFIX: &str = "SSH-2.0-";

/// Caller-owned SSH connection.
pub struct Session {
    config: SessionConfig,
    handle: Option<SessionHandle>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            handle: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Connect and authenticate, bounded by the configured connect timeout.
    pub async fn connect(&mut self) -> Result<()> {
        let timeout = self.config.connect_timeout();
        self.connect_with(timeout).await
    }

    /// Connect and authenticate within `timeout`.
    pub async fn connect_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.connect_with(Some(timeout)).await
    }

    async fn connect_with(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.is_connected() {
            return Err(SessionError::State("session is already connected".to_string()));
        }
        self.config.validate()?;

        let establish = Self::establish(&self.config);
        let handle = match timeout {
            Some(limit) => tokio::time::timeout(limit, establish).await.map_err(|_| {
                SessionError::Timeout(format!(
                    "connecting to {}:{} after {:?}",
                    self.config.host, self.config.port, limit
                ))
            })??,
            None => establish.await?,
        };

        self.handle = Some(Arc::new(handle));
        tracing::info!(
            "Connected to {}@{}:{}",
            self.config.username,
            self.config.host,
            self.config.port
        );
        Ok(())
    }

    async fn establish(config: &SessionConfig) -> Result<Handle<ClientHandler>> {
        let mut russh_config = client::Config {
            // No inactivity timeout - keepalives detect dead peers instead
            inactivity_timeout: None,
            keepalive_interval: config.keepalive_interval(),
            // Allow up to 4 missed keep-alives before disconnect
            keepalive_max: 4,
            ..Default::default()
        };
        if let Some(version) = &config.client_version {
            russh_config.client_id = russh::SshId::Standard(client_id(version));
        }
        let russh_config = Arc::new(russh_config);

        let handler = ClientHandler {
            host_key_policy: config.host_key_policy,
        };

        let connected = match &config.proxy {
            Some(proxy_config) => {
                let stream = proxy::open_tunnel(proxy_config, &config.host, config.port).await?;
                client::connect_stream(russh_config, stream, handler).await
            }
            None => {
                client::connect(russh_config, (config.host.as_str(), config.port), handler).await
            }
        };

        let mut handle = connected.map_err(|e| {
            SessionError::classify_connect(format!(
                "Connection to {}:{} failed: {}",
                config.host, config.port, e
            ))
        })?;

        tracing::debug!("SSH handshake with {} completed", config.host);
        Self::authenticate(&mut handle, config).await?;
        Ok(handle)
    }

    async fn authenticate(handle: &mut Handle<ClientHandler>, config: &SessionConfig) -> Result<()> {
        let user = config.username.as_str();

        let accepted = match &config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(user, password)
                .await
                .map_err(|e| {
                    SessionError::classify_connect(format!("Password authentication failed: {}", e))
                })?,
            AuthMethod::KeyFile { path, passphrase } => {
                let key = russh_keys::load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                    SessionError::Authentication(format!(
                        "Failed to load key {}: {}",
                        path.display(),
                        e
                    ))
                })?;

                handle
                    .authenticate_publickey(user, Arc::new(key))
                    .await
                    .map_err(|e| {
                        SessionError::classify_connect(format!("Authentication failed: {}", e))
                    })?
            }
            AuthMethod::Agent => Self::auth_with_agent(handle, user).await?,
        };

        if !accepted {
            return Err(SessionError::classify_connect(format!(
                "Auth fail for {}@{}",
                user, config.host
            )));
        }

        tracing::debug!("Authenticated as {}", user);
        Ok(())
    }

    /// Try every identity the agent holds. `Ok(false)` means all were rejected.
    async fn auth_with_agent(handle: &mut Handle<ClientHandler>, user: &str) -> Result<bool> {
        let socket_path = std::env::var("SSH_AUTH_SOCK")
            .map_err(|_| SessionError::Authentication("SSH_AUTH_SOCK not set".to_string()))?;

        let stream = UnixStream::connect(&socket_path).await.map_err(|e| {
            SessionError::Authentication(format!("Failed to connect to agent: {}", e))
        })?;

        let mut agent = russh_keys::agent::client::AgentClient::connect(stream);

        let identities = agent.request_identities().await.map_err(|e| {
            SessionError::Authentication(format!("Failed to get agent identities: {}", e))
        })?;

        tracing::debug!("Agent has {} identities", identities.len());

        for identity in identities {
            tracing::debug!(
                "Trying agent key: comment='{}', algo='{}'",
                identity.comment(),
                identity.algorithm()
            );

            match handle
                .authenticate_publickey_with(user, identity, &mut agent)
                .await
            {
                Ok(true) => return Ok(true),
                Ok(false) => continue,
                Err(e) => {
                    tracing::debug!("Agent auth error: {}", e);
                    continue;
                }
            }
        }

        Ok(false)
    }

    pub fn is_connected(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_closed())
    }

    /// Close the connection. Calling it again, or before connecting, does nothing.
    pub async fn disconnect(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        if let Err(e) = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::warn!("Failed to disconnect cleanly from {}: {}", self.config.host, e);
        }
        tracing::info!("Disconnected from {}", self.config.host);
        Ok(())
    }

    /// Executor for one non-interactive command on a new channel.
    pub fn command_executor(&self, command: impl Into<String>) -> CommandExecutor {
        let command = command.into();
        let channel = RusshChannel::new(
            self.handle.clone(),
            ChannelRequest::Exec {
                command: command.clone(),
            },
        );
        CommandExecutor::new(command, Box::new(channel))
    }

    /// Executor for an interactive shell on a new channel.
    pub fn shell_executor(&self) -> ShellExecutor {
        ShellExecutor::new(Box::new(RusshChannel::new(
            self.handle.clone(),
            ChannelRequest::Shell,
        )))
    }

    /// SFTP executor on a new channel; `encoding` decodes text reads.
    pub fn sftp_executor(&self, encoding: &'static Encoding) -> SftpExecutor {
        SftpExecutor::new(Box::new(RusshSftp::new(self.handle.clone())), encoding)
    }
}

/// Full identification string for a client version override.
fn client_id(version: &str) -> String {
    if version.starts_with(SSH_VERSION_PREFIX) {
        version.to_string()
    } else {
        format!("{}{}", SSH_VERSION_PREFIX, version)
    }
}

/// Client handler for russh connection callbacks.
pub struct ClientHandler {
    pub host_key_policy: HostKeyPolicy,
}

impl ClientHandler {
    /// Without a known-hosts store both policies trust the presented key.
    fn accepts_host_key(&self) -> bool {
        match self.host_key_policy {
            HostKeyPolicy::AcceptAny => true,
            HostKeyPolicy::AcceptNew => {
                tracing::debug!("No known-hosts store, accepting host key as new");
                true
            }
        }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = SessionError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(self.accepts_host_key())
    }
}
