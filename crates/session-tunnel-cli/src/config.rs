//! Tunnel settings from a YAML file and command-line flags
//!
//! Every field is optional in both sources; flags override the file. The
//! merged result is validated into a `StepConfig` plus the target instance.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use session_tunnel::{InstanceDescriptor, StepConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunnel settings as written in a config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelFile {
    pub region: Option<String>,
    pub instance_id: Option<String>,
    pub availability_zone: Option<String>,
    pub remote_port: Option<u16>,
    /// 0 or absent picks a free port
    pub local_port: Option<u16>,
    pub ssh_username: Option<String>,
    pub ssh_private_key_file: Option<PathBuf>,
    pub ssh_keypair_name: Option<String>,
    pub pause_before_seconds: Option<u64>,
    /// AWS CLI executable
    pub aws_program: Option<String>,
}

/// Everything the CLI needs to run the tunnel step
#[derive(Debug, Clone)]
pub struct Settings {
    pub step: StepConfig,
    pub instance: InstanceDescriptor,
    pub aws_program: String,
}

impl TunnelFile {
    /// Load settings from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        serde_yaml::from_str(&yaml)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Fields set in `overrides` win
    pub fn merge(self, overrides: TunnelFile) -> TunnelFile {
        TunnelFile {
            region: overrides.region.or(self.region),
            instance_id: overrides.instance_id.or(self.instance_id),
            availability_zone: overrides.availability_zone.or(self.availability_zone),
            remote_port: overrides.remote_port.or(self.remote_port),
            local_port: overrides.local_port.or(self.local_port),
            ssh_username: overrides.ssh_username.or(self.ssh_username),
            ssh_private_key_file: overrides.ssh_private_key_file.or(self.ssh_private_key_file),
            ssh_keypair_name: overrides.ssh_keypair_name.or(self.ssh_keypair_name),
            pause_before_seconds: overrides.pause_before_seconds.or(self.pause_before_seconds),
            aws_program: overrides.aws_program.or(self.aws_program),
        }
    }

    pub fn into_settings(self) -> Result<Settings> {
        let Some(region) = self.region else {
            bail!("--region is required");
        };
        let Some(instance_id) = self.instance_id else {
            bail!("--instance-id is required");
        };
        let Some(availability_zone) = self.availability_zone else {
            bail!("--availability-zone is required");
        };

        let mut builder = StepConfig::builder()
            .enabled(true)
            .region(region)
            .remote_port(self.remote_port.unwrap_or(22))
            .local_port(self.local_port.unwrap_or(0))
            .ssh_username(self.ssh_username.unwrap_or_default())
            .pause_before(Duration::from_secs(self.pause_before_seconds.unwrap_or(0)));

        if let Some(path) = &self.ssh_private_key_file {
            let key = fs::read_to_string(path)
                .with_context(|| format!("Failed to read private key: {:?}", path))?;
            builder = builder.ssh_private_key(key);
        }
        if let Some(name) = self.ssh_keypair_name {
            builder = builder.ssh_key_pair_name(name);
        }

        let step = builder.build().context("Invalid tunnel configuration")?;

        Ok(Settings {
            step,
            instance: InstanceDescriptor {
                instance_id,
                availability_zone,
            },
            aws_program: self.aws_program.unwrap_or_else(|| "aws".to_string()),
        })
    }
}
