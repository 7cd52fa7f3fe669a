//! Pipeline step that creates the session tunnel
//!
//! `run` reserves a local port, launches the persistent session in the
//! background and returns `Continue` straight away; the tunnel outlives the
//! call. Failures of the background session are only reported to the UI sink,
//! they never change an outcome that was already returned. `cleanup` cancels
//! the session.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{StepConfig, TunnelConfig};
use crate::error::TunnelError;
use crate::manager::PersistentSessionManager;
use crate::pipeline::{
    InstanceDescriptor, StateBag, Step, StepAction, STATE_CANCELLED, STATE_ERROR,
    STATE_INSTANCE, STATE_SESSION_PORT,
};
use crate::port::{PortAllocator, DEFAULT_MAX_PORT, DEFAULT_MIN_PORT};
use crate::rotator::{ConnectAuthorizer, KeyRotator};
use crate::session::SessionBroker;
use crate::ui::{TracingUi, Ui};

/// Lifecycle of the tunnel step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    WaitingToStart,
    Allocating,
    Running,
    Cancelled,
    Failed,
}

/// Creates and tears down the brokered tunnel for one pipeline run
pub struct TunnelStep {
    config: StepConfig,
    broker: Arc<dyn SessionBroker>,
    authorizer: Arc<dyn ConnectAuthorizer>,
    allocator: PortAllocator,
    state: TunnelState,
    local_port: Option<u16>,
    stop: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl TunnelStep {
    pub fn new(
        config: StepConfig,
        broker: Arc<dyn SessionBroker>,
        authorizer: Arc<dyn ConnectAuthorizer>,
    ) -> Self {
        Self {
            config,
            broker,
            authorizer,
            allocator: PortAllocator::new(),
            state: TunnelState::Idle,
            local_port: None,
            stop: None,
            task: None,
        }
    }

    pub fn with_port_allocator(mut self, allocator: PortAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Local port of the running tunnel
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    /// Whether the background session task is still alive
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Resolves once the background session ended on its own or was cancelled
    pub async fn finished(&mut self) {
        if let Some(task) = self.task.as_mut() {
            if let Err(e) = task.await {
                warn!("Session task panicked: {}", e);
            }
            self.task = None;
        }
    }

    /// Cancel the session and wait up to `grace` for it to wind down
    pub async fn shutdown(&mut self, state: &mut StateBag, grace: Duration) {
        self.cleanup(state);

        if let Some(task) = self.task.take() {
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(())) => debug!("Session task finished"),
                Ok(Err(e)) => warn!("Session task panicked: {}", e),
                Err(_) => warn!("Session did not stop within {:?}", grace),
            }
        }
    }

    async fn wait_before_start(
        &mut self,
        cancel: &CancellationToken,
        ui: &dyn Ui,
    ) -> Result<(), TunnelError> {
        let delay = self.config.pause_before;
        if delay.is_zero() {
            return Ok(());
        }

        self.state = TunnelState::WaitingToStart;
        ui.say(&format!(
            "Waiting {:?} before establishing the session...",
            delay
        ));

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        }
    }

    fn halt(&mut self, state: &mut StateBag, ui: &dyn Ui, err: TunnelError) -> StepAction {
        self.state = TunnelState::Failed;
        ui.error(&err.to_string());
        state.put(STATE_ERROR, err);
        StepAction::Halt
    }
}

#[async_trait]
impl Step for TunnelStep {
    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction {
        let ui = state.ui().unwrap_or_else(|| Arc::new(TracingUi));

        if !self.config.enabled {
            return StepAction::Continue;
        }

        // One reservation and one session per step.
        if self.state != TunnelState::Idle {
            warn!("Tunnel step already ran (state {:?}), not starting again", self.state);
            return match self.state {
                TunnelState::Running => StepAction::Continue,
                _ => StepAction::Halt,
            };
        }

        if let Err(e) = self.wait_before_start(cancel, ui.as_ref()).await {
            debug!("Tunnel step stopped before start: {}", e);
            ui.say("Tunnel step cancelled before the session was started");
            self.state = TunnelState::Cancelled;
            state.put(STATE_CANCELLED, true);
            return StepAction::Halt;
        }

        self.state = TunnelState::Allocating;
        let local_port = match self
            .allocator
            .acquire(self.config.local_port, DEFAULT_MIN_PORT, DEFAULT_MAX_PORT)
            .await
        {
            Ok(port) => port,
            Err(e) => return self.halt(state, ui.as_ref(), e.into()),
        };

        let instance = match state.get::<InstanceDescriptor>(STATE_INSTANCE) {
            Some(instance) => instance.clone(),
            None => return self.halt(state, ui.as_ref(), TunnelError::MissingInstance),
        };

        let tunnel = TunnelConfig {
            region: self.config.region.clone(),
            instance_id: instance.instance_id.clone(),
            remote_port: self.config.remote_port,
            local_port,
            broker: self.broker.clone(),
            authorizer: self.authorizer.clone(),
        };

        let session = match tunnel.broker.open(&tunnel) {
            Ok(session) => session,
            Err(e) => return self.halt(state, ui.as_ref(), e),
        };

        let rotator = KeyRotator::new(
            self.config.auth_mode(),
            self.config.ssh.username.clone(),
            tunnel.authorizer.clone(),
        );
        let manager = PersistentSessionManager::new(Arc::new(rotator));

        let stop = cancel.child_token();
        self.stop = Some(stop.clone());
        self.task = Some(tokio::spawn({
            let ui = ui.clone();
            async move { manager.run(stop, ui, session, instance).await }
        }));

        info!(
            "Tunnel to {} listening on local port {}",
            tunnel.instance_id, local_port
        );
        self.local_port = Some(local_port);
        state.put(STATE_SESSION_PORT, local_port);
        self.state = TunnelState::Running;

        StepAction::Continue
    }

    fn cleanup(&mut self, _state: &mut StateBag) {
        if !self.config.enabled {
            return;
        }

        if let Some(stop) = &self.stop {
            stop.cancel();
            if self.state == TunnelState::Running {
                self.state = TunnelState::Cancelled;
            }
        }
    }
}
