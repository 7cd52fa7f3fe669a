//! Brokered session seams

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::ui::Ui;

/// The transport just (re)established the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectEvent;

/// Endpoints of one brokered tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndpoint {
    pub instance_id: String,
    pub remote_port: u16,
    pub local_port: u16,
}

impl From<&TunnelConfig> for SessionEndpoint {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            remote_port: config.remote_port,
            local_port: config.local_port,
        }
    }
}

/// One logical, possibly reconnecting, brokered tunnel
#[async_trait]
pub trait SessionHandle: Send {
    fn endpoint(&self) -> &SessionEndpoint;

    /// Run the tunnel until `cancel` fires or the transport gives up.
    ///
    /// One `ReconnectEvent` is sent on `events` after every (re)connect. The
    /// sender is dropped when this returns, which closes the stream. Consumes
    /// the handle, so a session starts at most once.
    async fn start(
        self: Box<Self>,
        cancel: CancellationToken,
        ui: Arc<dyn Ui>,
        events: mpsc::Sender<ReconnectEvent>,
    ) -> Result<(), TunnelError>;
}

/// Client of the session brokering service
pub trait SessionBroker: Send + Sync {
    fn open(&self, config: &TunnelConfig) -> Result<Box<dyn SessionHandle>, TunnelError>;
}
