//! Step and tunnel configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TunnelError;
use crate::rotator::ConnectAuthorizer;
use crate::session::SessionBroker;

/// SSH credentials used by the communicator once the tunnel is up
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SshCredentials {
    /// Login user on the remote instance
    #[serde(default)]
    pub username: String,
    /// Private key text, never written back out
    #[serde(default, skip_serializing)]
    pub private_key: Option<String>,
    /// Name of a key pair already registered with the instance
    #[serde(default)]
    pub key_pair_name: Option<String>,
}

impl fmt::Debug for SshCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshCredentials")
            .field("username", &self.username)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("key_pair_name", &self.key_pair_name)
            .finish()
    }
}

impl SshCredentials {
    /// A private key without a registered key pair has to be pushed to the
    /// instance on every reconnect.
    pub fn auth_mode(&self) -> AuthMode {
        let has_key_pair = self
            .key_pair_name
            .as_deref()
            .is_some_and(|name| !name.is_empty());

        match self.private_key.as_deref() {
            Some(key) if !key.is_empty() && !has_key_pair => {
                AuthMode::EphemeralKey(key.as_bytes().to_vec())
            }
            _ => AuthMode::PreRegisteredKeyPair,
        }
    }
}

/// How the remote instance authenticates the SSH user
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    PreRegisteredKeyPair,
    /// Private key whose public half must be re-sent after each reconnect
    EphemeralKey(Vec<u8>),
}

impl AuthMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, AuthMode::EphemeralKey(_))
    }
}

impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::PreRegisteredKeyPair => f.write_str("PreRegisteredKeyPair"),
            AuthMode::EphemeralKey(_) => f.write_str("EphemeralKey(<redacted>)"),
        }
    }
}

/// Configuration of the tunnel step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Whether the tunnel is used at all
    #[serde(default)]
    pub enabled: bool,
    pub region: String,
    /// Local port, 0 picks one from the default range
    #[serde(default)]
    pub local_port: u16,
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    #[serde(default)]
    pub ssh: SshCredentials,
    /// Delay before the session is established
    #[serde(default, with = "duration_secs")]
    pub pause_before: Duration,
}

fn default_remote_port() -> u16 {
    22
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            region: String::new(),
            local_port: 0,
            remote_port: default_remote_port(),
            ssh: SshCredentials::default(),
            pause_before: Duration::ZERO,
        }
    }
}

impl StepConfig {
    pub fn builder() -> StepConfigBuilder {
        StepConfigBuilder::default()
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.ssh.auth_mode()
    }

    /// Check the settings the enabled step depends on
    pub fn validate(&self) -> Result<(), TunnelError> {
        if !self.enabled {
            return Ok(());
        }
        if self.region.is_empty() {
            return Err(TunnelError::Config("region is required".to_string()));
        }
        if self.remote_port == 0 {
            return Err(TunnelError::Config(
                "remote port must be non-zero".to_string(),
            ));
        }
        if self.auth_mode().is_ephemeral() && self.ssh.username.is_empty() {
            return Err(TunnelError::Config(
                "ssh username is required to send a public key".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for StepConfig
#[derive(Default)]
pub struct StepConfigBuilder {
    config: StepConfig,
}

impl StepConfigBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.config.region = region.into();
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.config.local_port = port;
        self
    }

    pub fn remote_port(mut self, port: u16) -> Self {
        self.config.remote_port = port;
        self
    }

    pub fn ssh_username(mut self, username: impl Into<String>) -> Self {
        self.config.ssh.username = username.into();
        self
    }

    pub fn ssh_private_key(mut self, key: impl Into<String>) -> Self {
        self.config.ssh.private_key = Some(key.into());
        self
    }

    pub fn ssh_key_pair_name(mut self, name: impl Into<String>) -> Self {
        self.config.ssh.key_pair_name = Some(name.into());
        self
    }

    pub fn pause_before(mut self, delay: Duration) -> Self {
        self.config.pause_before = delay;
        self
    }

    pub fn build(self) -> Result<StepConfig, TunnelError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Parameters of one tunnel, fixed once the local port is known
#[derive(Clone)]
pub struct TunnelConfig {
    pub region: String,
    pub instance_id: String,
    pub remote_port: u16,
    pub local_port: u16,
    pub broker: Arc<dyn SessionBroker>,
    pub authorizer: Arc<dyn ConnectAuthorizer>,
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("region", &self.region)
            .field("instance_id", &self.instance_id)
            .field("remote_port", &self.remote_port)
            .field("local_port", &self.local_port)
            .finish_non_exhaustive()
    }
}
