//! Connect-authorization client backed by the AWS CLI

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::BoxError;
use crate::rotator::{ConnectAuthorizer, PublicKeyDelivery};

/// Response body of `send-ssh-public-key`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendSshPublicKeyOutput {
    #[serde(default)]
    request_id: Option<String>,
    success: bool,
}

/// Sends public keys with `aws ec2-instance-connect send-ssh-public-key`
#[derive(Debug, Clone)]
pub struct AwsCliAuthorizer {
    program: String,
    region: String,
    timeout: Duration,
}

impl AwsCliAuthorizer {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            program: "aws".to_string(),
            region: region.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn args(&self, delivery: &PublicKeyDelivery) -> Vec<String> {
        vec![
            "ec2-instance-connect".to_string(),
            "send-ssh-public-key".to_string(),
            "--region".to_string(),
            self.region.clone(),
            "--availability-zone".to_string(),
            delivery.availability_zone.clone(),
            "--instance-id".to_string(),
            delivery.instance_id.clone(),
            "--instance-os-user".to_string(),
            delivery.login_user.clone(),
            "--ssh-public-key".to_string(),
            delivery.public_key.clone(),
            "--output".to_string(),
            "json".to_string(),
        ]
    }
}

#[async_trait]
impl ConnectAuthorizer for AwsCliAuthorizer {
    async fn send_public_key(&self, delivery: &PublicKeyDelivery) -> Result<bool, BoxError> {
        let command = Command::new(&self.program)
            .args(self.args(delivery))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, command)
            .await
            .map_err(|_| format!("{} did not answer within {:?}", self.program, self.timeout))?
            .map_err(|e| format!("failed to run {}: {}", self.program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )
            .into());
        }

        let response: SendSshPublicKeyOutput = serde_json::from_slice(&output.stdout)?;
        debug!(
            "send-ssh-public-key request {} returned success={}",
            response.request_id.as_deref().unwrap_or("-"),
            response.success
        );

        Ok(response.success)
    }
}
