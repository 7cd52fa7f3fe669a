//! Build pipeline step contract and shared state

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::ui::Ui;

/// State key of the `Arc<dyn Ui>` sink
pub const STATE_UI: &str = "ui";
/// State key of the target `InstanceDescriptor`
pub const STATE_INSTANCE: &str = "instance";
/// State key the allocated local port (`u16`) is published under
pub const STATE_SESSION_PORT: &str = "session_port";
/// State key of the `TunnelError` that halted the step
pub const STATE_ERROR: &str = "error";
/// State key set to `true` when the step was stopped on request
pub const STATE_CANCELLED: &str = "cancelled";

/// Outcome of a step run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Continue,
    Halt,
}

/// A unit of work in the build pipeline
#[async_trait]
pub trait Step: Send {
    async fn run(&mut self, cancel: &CancellationToken, state: &mut StateBag) -> StepAction;

    fn cleanup(&mut self, state: &mut StateBag);
}

/// The remote instance the tunnel targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescriptor {
    pub instance_id: String,
    pub availability_zone: String,
}

/// Typed key/value state shared between pipeline steps
#[derive(Default)]
pub struct StateBag {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl StateBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    /// Value under `key`, or None when absent or of another type
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|value| value.downcast_ref::<T>())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn ui(&self) -> Option<Arc<dyn Ui>> {
        self.get::<Arc<dyn Ui>>(STATE_UI).cloned()
    }
}
