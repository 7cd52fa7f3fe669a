//! Session tunnel - brokered port forwarding for build pipelines
//!
//! Opens a port-forwarding tunnel to a remote instance through a session
//! brokering service, keeps it alive across reconnects, re-sends a short-lived
//! SSH public key after every reconnect, and tears it down on cleanup.
//!
//! # Quick Start
//!
//! ```ignore
//! use session_tunnel::{
//!     AwsCliAuthorizer, InstanceDescriptor, PluginBroker, StateBag, Step, StepAction,
//!     StepConfig, TunnelStep, STATE_INSTANCE,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StepConfig::builder()
//!     .enabled(true)
//!     .region("us-east-1")
//!     .ssh_username("ec2-user")
//!     .ssh_private_key(std::fs::read_to_string("id_ed25519")?)
//!     .build()?;
//!
//! let mut state = StateBag::new();
//! state.put(STATE_INSTANCE, InstanceDescriptor {
//!     instance_id: "i-0123456789abcdef0".to_string(),
//!     availability_zone: "us-east-1a".to_string(),
//! });
//!
//! let mut step = TunnelStep::new(
//!     config,
//!     Arc::new(PluginBroker::new()),
//!     Arc::new(AwsCliAuthorizer::new("us-east-1")),
//! );
//! let cancel = CancellationToken::new();
//! if step.run(&cancel, &mut state).await == StepAction::Continue {
//!     // ssh -p <local port> ec2-user@127.0.0.1
//! }
//! step.cleanup(&mut state);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod instance_connect;
pub mod manager;
pub mod pipeline;
pub mod plugin;
pub mod port;
pub mod reconnect;
pub mod rotator;
pub mod session;
pub mod step;
pub mod ui;

#[cfg(test)]
mod testing;

pub use config::{AuthMode, SshCredentials, StepConfig, StepConfigBuilder, TunnelConfig};
pub use error::{BoxError, PortError, TunnelError};
pub use instance_connect::AwsCliAuthorizer;
pub use manager::PersistentSessionManager;
pub use pipeline::{
    InstanceDescriptor, StateBag, Step, StepAction, STATE_CANCELLED, STATE_ERROR, STATE_INSTANCE,
    STATE_SESSION_PORT, STATE_UI,
};
pub use plugin::{PluginBroker, ProcessSession};
pub use port::{PortAllocator, DEFAULT_MAX_PORT, DEFAULT_MIN_PORT};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use rotator::{derive_public_key, ConnectAuthorizer, KeyRotator, PublicKeyDelivery};
pub use session::{ReconnectEvent, SessionBroker, SessionEndpoint, SessionHandle};
pub use step::{TunnelState, TunnelStep};
pub use ui::{TracingUi, Ui};
