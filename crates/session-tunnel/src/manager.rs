//! Persistent session manager
//!
//! Runs one brokered session in the background and re-sends the public key
//! whenever the session reports a reconnect.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pipeline::InstanceDescriptor;
use crate::rotator::KeyRotator;
use crate::session::{ReconnectEvent, SessionHandle};
use crate::ui::Ui;

pub struct PersistentSessionManager {
    rotator: Arc<KeyRotator>,
}

impl PersistentSessionManager {
    pub fn new(rotator: Arc<KeyRotator>) -> Self {
        Self { rotator }
    }

    /// Drive `session` until it returns. Errors are reported to `ui`.
    ///
    /// An event still queued when `start` returns is dropped, and a
    /// rotation in flight is abandoned once `cancel` fires.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        ui: Arc<dyn Ui>,
        session: Box<dyn SessionHandle>,
        instance: InstanceDescriptor,
    ) {
        // Capacity 1: the session waits for each rotation before moving on.
        let (events_tx, events_rx) = mpsc::channel::<ReconnectEvent>(1);
        let session_done = CancellationToken::new();

        let listener = tokio::spawn(Self::handle_reconnects(
            self.rotator.clone(),
            ui.clone(),
            instance,
            events_rx,
            cancel.clone(),
            session_done.clone(),
        ));

        let endpoint = session.endpoint().clone();
        info!(
            "Starting session to {} (remote port {}, local port {})",
            endpoint.instance_id, endpoint.remote_port, endpoint.local_port
        );

        // events_tx moves into start and is dropped when it returns.
        let result = session.start(cancel, ui.clone(), events_tx).await;
        session_done.cancel();

        if let Err(e) = result {
            ui.error(&format!("session error: {}", e));
        }

        if let Err(e) = listener.await {
            ui.error(&format!("reconnect listener failed: {}", e));
        }

        debug!("Session to {} finished", endpoint.instance_id);
    }

    async fn handle_reconnects(
        rotator: Arc<KeyRotator>,
        ui: Arc<dyn Ui>,
        instance: InstanceDescriptor,
        mut events: mpsc::Receiver<ReconnectEvent>,
        cancel: CancellationToken,
        session_done: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = session_done.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(ReconnectEvent) = event else {
                break;
            };

            if !rotator.is_active() {
                continue;
            }

            ui.say("Uploading SSH public key to instance");
            tokio::select! {
                biased;
                result = rotator.rotate_if_needed(&instance) => {
                    if let Err(e) = result {
                        ui.error(&e.to_string());
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("Key upload to {} abandoned on cancel", instance.instance_id);
                    break;
                }
            }
        }

        debug!("Reconnect event stream closed");
    }
}
