//! User-facing message sink

use tracing::{error, info};

/// Where progress and error messages for the user go
pub trait Ui: Send + Sync {
    fn say(&self, message: &str);

    fn error(&self, message: &str);
}

/// Sink that forwards messages to the tracing subscriber
#[derive(Debug, Clone, Default)]
pub struct TracingUi;

impl Ui for TracingUi {
    fn say(&self, message: &str) {
        info!("{}", message);
    }

    fn error(&self, message: &str) {
        error!("{}", message);
    }
}
