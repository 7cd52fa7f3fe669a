//! Brokered session backed by the native tunnel client
//!
//! The session runs `aws ssm start-session` with the port forwarding document
//! as a child process. When the client exits the session is started again
//! after a backoff, and every start is announced as a reconnect.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
use crate::session::{ReconnectEvent, SessionBroker, SessionEndpoint, SessionHandle};
use crate::ui::Ui;

/// Session document that forwards a local port to a port on the instance
pub const PORT_FORWARDING_DOCUMENT: &str = "AWS-StartPortForwardingSession";

/// Opens sessions through the AWS CLI
#[derive(Debug, Clone)]
pub struct PluginBroker {
    program: String,
    reconnect: ReconnectConfig,
}

impl Default for PluginBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginBroker {
    pub fn new() -> Self {
        Self {
            program: "aws".to_string(),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Use another AWS CLI executable
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Arguments of `aws ssm start-session` for a port forwarding tunnel
pub fn start_session_args(region: &str, endpoint: &SessionEndpoint) -> Vec<String> {
    let parameters = serde_json::json!({
        "portNumber": [endpoint.remote_port.to_string()],
        "localPortNumber": [endpoint.local_port.to_string()],
    });

    vec![
        "ssm".to_string(),
        "start-session".to_string(),
        "--region".to_string(),
        region.to_string(),
        "--target".to_string(),
        endpoint.instance_id.clone(),
        "--document-name".to_string(),
        PORT_FORWARDING_DOCUMENT.to_string(),
        "--parameters".to_string(),
        parameters.to_string(),
    ]
}

impl SessionBroker for PluginBroker {
    fn open(&self, config: &TunnelConfig) -> Result<Box<dyn SessionHandle>, TunnelError> {
        let endpoint = SessionEndpoint::from(config);
        let args = start_session_args(&config.region, &endpoint);

        Ok(Box::new(
            ProcessSession::new(endpoint, self.program.clone(), args)
                .with_reconnect(self.reconnect.clone()),
        ))
    }
}

/// A session whose transport is an external client process
pub struct ProcessSession {
    endpoint: SessionEndpoint,
    program: String,
    args: Vec<String>,
    reconnect: ReconnectConfig,
}

impl ProcessSession {
    pub fn new(endpoint: SessionEndpoint, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            endpoint,
            program: program.into(),
            args,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    fn spawn(&self) -> Result<Child, TunnelError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TunnelError::Transport(format!("failed to launch {}: {}", self.program, e))
            })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, self.endpoint.instance_id.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, self.endpoint.instance_id.clone());
        }

        Ok(child)
    }

    /// Announce a freshly spawned client and wait for it to exit.
    /// Returns true when `cancel` stopped it.
    async fn supervise(
        &self,
        mut child: Child,
        cancel: &CancellationToken,
        events: &mpsc::Sender<ReconnectEvent>,
    ) -> bool {
        debug!(
            "Tunnel client for {} running (pid {:?})",
            self.endpoint.instance_id,
            child.id()
        );

        tokio::select! {
            sent = events.send(ReconnectEvent) => {
                if sent.is_err() {
                    debug!("Reconnect listener gone, not announcing reconnect");
                }
            }
            _ = cancel.cancelled() => {
                self.stop(child).await;
                return true;
            }
        }

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                self.stop(child).await;
                return true;
            }
        };

        match status {
            Ok(status) if status.success() => {
                info!("Session to {} closed by remote side", self.endpoint.instance_id);
            }
            Ok(status) => {
                warn!(
                    "Tunnel client for {} exited with {}",
                    self.endpoint.instance_id, status
                );
            }
            Err(e) => {
                warn!(
                    "Failed to wait for tunnel client of {}: {}",
                    self.endpoint.instance_id, e
                );
            }
        }
        false
    }

    async fn stop(&self, mut child: Child) {
        if let Err(e) = child.kill().await {
            warn!("Failed to stop tunnel client for {}: {}", self.endpoint.instance_id, e);
        }
        info!("Session to {} stopped", self.endpoint.instance_id);
    }
}

fn forward_output<R>(reader: R, instance_id: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[{}] {}", instance_id, line);
        }
    });
}

#[async_trait]
impl SessionHandle for ProcessSession {
    fn endpoint(&self) -> &SessionEndpoint {
        &self.endpoint
    }

    async fn start(
        self: Box<Self>,
        cancel: CancellationToken,
        ui: Arc<dyn Ui>,
        events: mpsc::Sender<ReconnectEvent>,
    ) -> Result<(), TunnelError> {
        let mut backoff = ReconnectManager::new(self.reconnect.clone());
        let mut launched = false;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let started = Instant::now();
            match self.spawn() {
                Ok(child) => {
                    launched = true;
                    if self.supervise(child, &cancel, &events).await {
                        return Ok(());
                    }
                }
                // Only a failure of the first launch is fatal.
                Err(e) if !launched => return Err(e),
                Err(e) => warn!("{}", e),
            }

            backoff.session_ended(started.elapsed());
            match backoff.wait(&cancel).await {
                Ok(()) => ui.say(&format!(
                    "Reconnecting session to {} (attempt {})",
                    self.endpoint.instance_id,
                    backoff.attempt()
                )),
                Err(ReconnectError::Cancelled) => return Ok(()),
                Err(ReconnectError::MaxAttemptsReached) => {
                    return Err(TunnelError::Transport(format!(
                        "tunnel client for {} kept exiting, giving up after {} reconnection attempts",
                        self.endpoint.instance_id,
                        backoff.attempt() - 1
                    )));
                }
            }
        }
    }
}
