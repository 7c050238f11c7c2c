use crate::{Error, Result};
use common::conditions::{Condition, DEGRADED};
use kube::ResourceExt;
use prometheus_client::{
    encoding::{EncodeLabelSet, text::encode},
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use std::sync::Arc;
use tokio::time::Instant;

const DURATION_BUCKETS: [f64; 8] = [0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.];

fn duration_histogram() -> Histogram {
    Histogram::new(DURATION_BUCKETS.into_iter())
}

#[derive(Clone)]
pub struct Metrics {
    pub hub: ReconcileMetrics,
    pub form: ReconcileMetrics,
    pub node: ReconcileMetrics,
    pub lynq: LynqMetrics,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::default();
        let hub = ReconcileMetrics::default().register(registry.sub_registry_with_prefix("lynqhub_reconcile"));
        let form = ReconcileMetrics::default().register(registry.sub_registry_with_prefix("lynqform_reconcile"));
        let node = ReconcileMetrics::default().register(registry.sub_registry_with_prefix("lynqnode_reconcile"));
        let lynq = LynqMetrics::default().register(&mut registry);
        Self {
            hub,
            form,
            node,
            lynq,
            registry: Arc::new(registry),
        }
    }
}

impl Metrics {
    /// OpenMetrics text exposition
    pub fn encode(&self) -> Result<String> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry).map_err(|e| Error::Other(format!("metrics encoding failed: {e}")))?;
        Ok(buffer)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub instance: String,
    pub error: String,
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Counter,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: Histogram,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: Counter::default(),
            failures: Family::<ErrorLabels, Counter>::default(),
            duration: duration_histogram(),
        }
    }
}

impl ReconcileMetrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit("duration", "reconcile duration", Unit::Seconds, self.duration.clone());
        r.register("failures", "reconciliation errors", self.failures.clone());
        r.register("runs", "reconciliations", self.runs.clone());
        self
    }

    pub fn reconcile_failure<K: ResourceExt>(&self, obj: &K, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                instance: obj.name_any(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.runs.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeLabels {
    pub lynqnode: String,
    pub namespace: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConditionLabels {
    pub lynqnode: String,
    pub namespace: String,
    pub r#type: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DegradedLabels {
    pub lynqnode: String,
    pub namespace: String,
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConflictLabels {
    pub lynqnode: String,
    pub namespace: String,
    pub resource_kind: String,
    pub conflict_policy: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ApplyLabels {
    pub kind: String,
    pub result: String,
    pub conflict_policy: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HubLabels {
    pub hub: String,
    pub namespace: String,
}

/// Resource counters of one LynqNode as published in its status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeCounts {
    pub desired: i32,
    pub ready: i32,
    pub failed: i32,
    pub conflicted: i32,
}

/// Domain gauges and counters
#[derive(Clone)]
pub struct LynqMetrics {
    pub node_duration: Family<ResultLabels, Histogram, fn() -> Histogram>,
    pub resources_desired: Family<NodeLabels, Gauge>,
    pub resources_ready: Family<NodeLabels, Gauge>,
    pub resources_failed: Family<NodeLabels, Gauge>,
    pub resources_conflicted: Family<NodeLabels, Gauge>,
    pub condition_status: Family<ConditionLabels, Gauge>,
    pub degraded_status: Family<DegradedLabels, Gauge>,
    pub conflicts: Family<ConflictLabels, Counter>,
    pub apply_attempts: Family<ApplyLabels, Counter>,
    pub hub_desired: Family<HubLabels, Gauge>,
    pub hub_ready: Family<HubLabels, Gauge>,
    pub hub_failed: Family<HubLabels, Gauge>,
}

impl Default for LynqMetrics {
    fn default() -> Self {
        Self {
            node_duration: Family::new_with_constructor(duration_histogram),
            resources_desired: Family::default(),
            resources_ready: Family::default(),
            resources_failed: Family::default(),
            resources_conflicted: Family::default(),
            condition_status: Family::default(),
            degraded_status: Family::default(),
            conflicts: Family::default(),
            apply_attempts: Family::default(),
            hub_desired: Family::default(),
            hub_ready: Family::default(),
            hub_failed: Family::default(),
        }
    }
}

fn node_labels(name: &str, namespace: &str) -> NodeLabels {
    NodeLabels {
        lynqnode: name.to_string(),
        namespace: namespace.to_string(),
    }
}

impl LynqMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "lynqnode_reconcile_duration",
            "LynqNode reconcile duration by outcome",
            Unit::Seconds,
            self.node_duration.clone(),
        );
        r.register(
            "lynqnode_resources_desired",
            "Resources declared by a LynqNode",
            self.resources_desired.clone(),
        );
        r.register("lynqnode_resources_ready", "Ready resources of a LynqNode", self.resources_ready.clone());
        r.register("lynqnode_resources_failed", "Failed resources of a LynqNode", self.resources_failed.clone());
        r.register(
            "lynqnode_resources_conflicted",
            "Conflicted resources of a LynqNode",
            self.resources_conflicted.clone(),
        );
        r.register(
            "lynqnode_condition_status",
            "LynqNode condition status (1 true, 0 false)",
            self.condition_status.clone(),
        );
        r.register(
            "lynqnode_degraded_status",
            "LynqNode degraded state by reason",
            self.degraded_status.clone(),
        );
        r.register("lynqnode_conflicts", "Ownership conflicts met while applying", self.conflicts.clone());
        r.register("apply_attempts", "Apply attempts by kind and outcome", self.apply_attempts.clone());
        r.register("hub_desired", "Nodes a hub should have", self.hub_desired.clone());
        r.register("hub_ready", "Ready nodes of a hub", self.hub_ready.clone());
        r.register("hub_failed", "Not ready nodes of a hub", self.hub_failed.clone());
        self
    }

    pub fn node_reconciled(&self, result: &str, seconds: f64) {
        self.node_duration
            .get_or_create(&ResultLabels {
                result: result.to_string(),
            })
            .observe(seconds);
    }

    pub fn node_observed(&self, name: &str, namespace: &str, counts: NodeCounts, conditions: &[Condition]) {
        let labels = node_labels(name, namespace);
        self.resources_desired.get_or_create(&labels).set(counts.desired.into());
        self.resources_ready.get_or_create(&labels).set(counts.ready.into());
        self.resources_failed.get_or_create(&labels).set(counts.failed.into());
        self.resources_conflicted.get_or_create(&labels).set(counts.conflicted.into());
        for cond in conditions {
            self.condition_status
                .get_or_create(&ConditionLabels {
                    lynqnode: name.to_string(),
                    namespace: namespace.to_string(),
                    r#type: cond.condition_type.clone(),
                })
                .set(i64::from(cond.is_true()));
            if cond.condition_type == DEGRADED {
                self.clear_degraded(name, namespace);
                if cond.is_true() {
                    self.degraded_status
                        .get_or_create(&DegradedLabels {
                            lynqnode: name.to_string(),
                            namespace: namespace.to_string(),
                            reason: cond.reason.clone(),
                        })
                        .set(1);
                }
            }
        }
    }

    fn clear_degraded(&self, name: &str, namespace: &str) {
        for reason in DEGRADED_REASONS {
            self.degraded_status.remove(&DegradedLabels {
                lynqnode: name.to_string(),
                namespace: namespace.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    /// Drop the series of a LynqNode that went away
    pub fn node_forget(&self, name: &str, namespace: &str) {
        let labels = node_labels(name, namespace);
        self.resources_desired.remove(&labels);
        self.resources_ready.remove(&labels);
        self.resources_failed.remove(&labels);
        self.resources_conflicted.remove(&labels);
        for t in ["Ready", "Progressing", "Conflicted", "Degraded"] {
            self.condition_status.remove(&ConditionLabels {
                lynqnode: name.to_string(),
                namespace: namespace.to_string(),
                r#type: t.to_string(),
            });
        }
        self.clear_degraded(name, namespace);
    }

    pub fn conflict(&self, name: &str, namespace: &str, kind: &str, policy: &str) {
        self.conflicts
            .get_or_create(&ConflictLabels {
                lynqnode: name.to_string(),
                namespace: namespace.to_string(),
                resource_kind: kind.to_string(),
                conflict_policy: policy.to_string(),
            })
            .inc();
    }

    pub fn apply_attempt(&self, kind: &str, result: &str, policy: &str) {
        self.apply_attempts
            .get_or_create(&ApplyLabels {
                kind: if kind.is_empty() { "Unknown" } else { kind }.to_string(),
                result: result.to_string(),
                conflict_policy: policy.to_string(),
            })
            .inc();
    }

    pub fn hub_observed(&self, hub: &str, namespace: &str, desired: i32, ready: i32, failed: i32) {
        let labels = HubLabels {
            hub: hub.to_string(),
            namespace: namespace.to_string(),
        };
        self.hub_desired.get_or_create(&labels).set(desired.into());
        self.hub_ready.get_or_create(&labels).set(ready.into());
        self.hub_failed.get_or_create(&labels).set(failed.into());
    }

    pub fn hub_forget(&self, hub: &str, namespace: &str) {
        let labels = HubLabels {
            hub: hub.to_string(),
            namespace: namespace.to_string(),
        };
        self.hub_desired.remove(&labels);
        self.hub_ready.remove(&labels);
        self.hub_failed.remove(&labels);
    }
}

const DEGRADED_REASONS: [&str; 5] = [
    "ResourceFailuresAndConflicts",
    "ResourceFailures",
    "ResourceConflicts",
    "ResourcesNotReady",
    "DependencyCycle",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exposition_contains_every_family() {
        let metrics = Metrics::default();
        metrics.hub.runs.inc();
        metrics.lynq.apply_attempt("ConfigMap", "success", "Stuck");
        metrics.lynq.hub_observed("customers", "tenants", 3, 2, 1);
        let text = metrics.encode().unwrap();
        assert!(text.contains("lynqhub_reconcile_runs_total 1"));
        assert!(text.contains("apply_attempts_total{kind=\"ConfigMap\",result=\"success\",conflict_policy=\"Stuck\"} 1"));
        assert!(text.contains("hub_desired{hub=\"customers\",namespace=\"tenants\"} 3"));
        assert!(text.contains("# EOF"));
    }

    #[test]
    fn test_degraded_reason_is_exclusive() {
        let metrics = Metrics::default();
        let counts = NodeCounts {
            desired: 2,
            ready: 1,
            failed: 1,
            conflicted: 0,
        };
        let failing = Condition::new(DEGRADED, true, "ResourceFailures", "");
        metrics.lynq.node_observed("u1-web", "tenants", counts, &[failing]);
        let healthy = Condition::new(DEGRADED, false, "Healthy", "");
        metrics.lynq.node_observed("u1-web", "tenants", NodeCounts::default(), &[healthy]);
        let text = metrics.encode().unwrap();
        assert!(!text.contains("reason=\"ResourceFailures\""));
        assert!(text.contains("lynqnode_condition_status{lynqnode=\"u1-web\",namespace=\"tenants\",type=\"Degraded\"} 0"));
    }

    #[test]
    fn test_forgotten_node_has_no_series() {
        let metrics = Metrics::default();
        metrics.lynq.node_observed("u1-web", "tenants", NodeCounts::default(), &[]);
        metrics.lynq.node_forget("u1-web", "tenants");
        assert!(!metrics.encode().unwrap().contains("u1-web"));
    }
}
