use async_trait::async_trait;
use kube::runtime::controller::Action;
use manager::Context;
use std::sync::Arc;

pub use common::{Error, Result};

#[async_trait]
pub trait Reconciler {
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action>;
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action>;
}

pub mod applied;
pub mod config;
pub mod events;
pub mod finalizer;
pub mod form;
pub mod hub;
pub mod node;
pub mod node_status;
pub mod render;
pub mod watch;

/// State machinery for kube, as exposeable to actix
pub mod manager;
pub use manager::Manager;

/// Generated type, for crdgen
pub use common::{LynqForm, LynqHub, LynqNode};

/// Metrics
pub mod metrics;
pub use metrics::Metrics;
