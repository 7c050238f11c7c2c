use crate::{
    Error, LynqForm, LynqHub, LynqNode, Metrics, Result,
    config::Config,
    events::{EventSink, KubeEvents},
    form, hub, node,
    watch::{child_resources, form_hub, forms_referencing, node_form, relevant_changes, tracked_node, tracked_resources},
};
use chrono::{DateTime, Utc};
use common::{
    apply::Applier,
    context::get_reporter,
    datasource::{DataSourceFactory, SqlDataSourceFactory},
    k8sgeneric::{KubeStore, ObjectStore},
    labels::LABEL_NODE,
    status::StatusManager,
    template::{Engine, HandleBars},
};
use futures::{FutureExt, StreamExt, future::BoxFuture};
use kube::{
    api::{Api, DynamicObject, ListParams},
    client::Client,
    runtime::{
        WatchStreamExt,
        controller::{Config as ControllerConfig, Controller},
        events::Reporter,
        watcher,
    },
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::*;

// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Where every object is read and written
    pub store: Arc<dyn ObjectStore>,
    /// Apply engine of the node children
    pub applier: Applier,
    /// Pending LynqNode status writes
    pub status: Arc<StatusManager>,
    /// Template renderer
    pub engine: Arc<dyn Engine>,
    /// Opens the data source of a hub
    pub datasources: Arc<dyn DataSourceFactory>,
    /// Kubernetes events
    pub events: Arc<dyn EventSink>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
    pub config: Config,
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: get_reporter(),
        }
    }
}

/// Data owned by the Manager
#[derive(Clone, Default)]
pub struct Manager {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    metrics: Arc<Metrics>,
}

async fn ensure_crd<K>(api: &Api<K>, kind: &str) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    api.list(&ListParams::default().limit(1)).await.map_err(|e| {
        Error::Other(format!(
            "cannot list {kind} ({e}), is the crd installed? please run: cargo run --bin crdgen | kubectl apply -f -"
        ))
    })?;
    Ok(())
}

/// Futures to be awaited by `main`
pub struct Controllers {
    pub hub: BoxFuture<'static, ()>,
    pub form: BoxFuture<'static, ()>,
    pub node: BoxFuture<'static, ()>,
    pub status: BoxFuture<'static, ()>,
}

/// Manager that owns the LynqHub, LynqForm and LynqNode controllers
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` and the futures driving the controllers and the
    /// status flusher. It is up to `main` to wait for them.
    pub async fn new(config: Config) -> Result<(Self, Controllers)> {
        let client = Client::try_default().await?;
        let manager = Manager::default();
        let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone()));
        let status = Arc::new(StatusManager::new(store.clone(), config.status_retries));
        let context = Arc::new(Context {
            store: store.clone(),
            applier: Applier::new(store),
            status: status.clone(),
            engine: Arc::new(HandleBars::new()),
            datasources: Arc::new(SqlDataSourceFactory),
            events: Arc::new(KubeEvents::new(client.clone(), get_reporter())),
            diagnostics: manager.diagnostics.clone(),
            metrics: manager.metrics.clone(),
            config: config.clone(),
        });

        let hubs = Api::<LynqHub>::all(client.clone());
        let forms = Api::<LynqForm>::all(client.clone());
        let nodes = Api::<LynqNode>::all(client.clone());
        // Ensure CRDs are installed before loop-watching
        ensure_crd(&hubs, "LynqHub").await?;
        ensure_crd(&forms, "LynqForm").await?;
        ensure_crd(&nodes, "LynqNode").await?;

        let wc = watcher::Config::default().any_semantic();

        let controller_hub = Controller::new(hubs.clone(), wc.clone())
            .with_config(ControllerConfig::default().concurrency(config.hub_concurrency))
            .owns(nodes.clone(), wc.clone())
            .watches(forms.clone(), wc.clone(), |form| form_hub(&form))
            .run(hub::reconcile, hub::error_policy, context.clone())
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
            .boxed();

        let form_controller = Controller::new(forms, wc.clone())
            .with_config(ControllerConfig::default().concurrency(config.form_concurrency));
        let form_cache = form_controller.store();
        let controller_form = form_controller
            .watches(nodes.clone(), wc.clone(), |node| node_form(&node))
            .watches(hubs, wc.clone(), move |hub| forms_referencing(&form_cache.state(), &hub))
            .run(form::reconcile, form::error_policy, context.clone())
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
            .boxed();

        let mut node_controller = Controller::new(nodes, wc.clone())
            .with_config(ControllerConfig::default().concurrency(config.node_concurrency));
        for ar in child_resources() {
            let api = Api::<DynamicObject>::all_with(client.clone(), &ar);
            let changes = relevant_changes(watcher(api, wc.clone()).default_backoff());
            node_controller = node_controller.owns_stream_with(changes, ar);
        }
        // Namespaces, retained and cross-namespace children have no ownerReference
        let tracked = watcher::Config::default().labels(LABEL_NODE).any_semantic();
        for ar in tracked_resources() {
            let api = Api::<DynamicObject>::all_with(client.clone(), &ar);
            let changes = relevant_changes(watcher(api, tracked.clone()).default_backoff());
            node_controller = node_controller.watches_stream_with(changes, |obj| tracked_node(&obj), ar);
        }
        let controller_node = node_controller
            .run(node::reconcile, node::error_policy, context)
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
            .boxed();

        let status_flusher = status.run(config.status_flush_interval).boxed();

        Ok((manager, Controllers {
            hub: controller_hub,
            form: controller_form,
            node: controller_node,
            status: status_flusher,
        }))
    }

    /// Metrics getter
    #[must_use]
    pub fn metrics(&self) -> String {
        self.metrics.encode().unwrap_or_else(|e| {
            warn!("Failed to encode metrics: {e}");
            String::new()
        })
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::tests::CapturedEvents;
    use async_trait::async_trait;
    use common::{
        LynqHub,
        datasource::{DataSource, QueryConfig, Row},
        k8smock::MockStore,
    };
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    /// In-memory rows of a hub table
    #[derive(Clone, Default)]
    pub struct FakeRows {
        rows: Arc<Mutex<Vec<Row>>>,
        failing: Arc<AtomicBool>,
    }

    impl FakeRows {
        pub fn set(&self, rows: Vec<Row>) {
            *self.rows.lock().unwrap() = rows;
        }

        pub fn fail(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DataSource for FakeRows {
        async fn query_rows(&self, _config: &QueryConfig) -> Result<Vec<Row>> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Other("connection refused".into()));
            }
            Ok(self.rows.lock().unwrap().clone())
        }
    }

    #[async_trait]
    impl DataSourceFactory for FakeRows {
        async fn open(&self, _hub: &LynqHub, _store: &dyn ObjectStore) -> Result<Arc<dyn DataSource>> {
            Ok(Arc::new(self.clone()))
        }
    }

    pub struct Harness {
        pub store: MockStore,
        pub events: Arc<CapturedEvents>,
        pub rows: FakeRows,
        pub ctx: Arc<Context>,
    }

    pub fn harness() -> Harness {
        let store = MockStore::new();
        let shared: Arc<dyn ObjectStore> = Arc::new(store.clone());
        let events = Arc::new(CapturedEvents::default());
        let rows = FakeRows::default();
        let ctx = Arc::new(Context {
            store: shared.clone(),
            applier: Applier::new(shared.clone()).with_backoff(Duration::from_millis(1)),
            status: Arc::new(StatusManager::new(shared, 5)),
            engine: Arc::new(HandleBars::new()),
            datasources: Arc::new(rows.clone()),
            events: events.clone(),
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics: Arc::new(Metrics::default()),
            config: Config::default(),
        });
        Harness {
            store,
            events,
            rows,
            ctx,
        }
    }

    #[tokio::test]
    async fn test_manager_getters() {
        let manager = Manager::default();
        assert!(manager.metrics().contains("lynqnode_reconcile"));
        let before = manager.diagnostics().await.last_event;
        assert!(before <= Utc::now());
    }
}
