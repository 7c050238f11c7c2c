use crate::{
    Error, Reconciler, Result,
    applied::{AppliedKey, orphans},
    events,
    finalizer::run_with_finalizer,
    manager::Context,
    metrics::NodeCounts,
    node_status::{dependency_failure, pass_conditions, progressing},
    render::{Rendered, node_variables, render_resource},
};
use async_trait::async_trait;
use chrono::Utc;
use common::{
    LynqNode,
    apply::{ApplyOptions, Owner, Ownership, Plan, live_deletion_policy, ownership},
    graph,
    k8sgeneric::{ObjectKey, get_as},
    labels::*,
    readiness::{is_ready, readiness_message},
    resources::{DeletionPolicy, TResource},
    status::NodeStatusUpdate,
};
use kube::{ResourceExt, runtime::controller::Action};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio::time::{Duration, Instant, timeout};
use tracing::*;

const APPLY_REQUEUE: Duration = Duration::from_secs(30);
const STATUS_REQUEUE: Duration = Duration::from_secs(5 * 60);
const CLEANUP_BUDGET: Duration = Duration::from_secs(30);

#[instrument(skip(ctx, node), fields(node = %node.name_any()))]
pub async fn reconcile(node: Arc<LynqNode>, ctx: Arc<Context>) -> Result<Action> {
    let _mes = ctx.metrics.node.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let started = Instant::now();
    let res = run_with_finalizer(node, ctx.clone(), NODE_FINALIZER).await;
    let result = if res.is_ok() { "success" } else { "error" };
    ctx.metrics.lynq.node_reconciled(result, started.elapsed().as_secs_f64());
    res
}

#[must_use]
pub fn error_policy(node: Arc<LynqNode>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed for LynqNode {}: {:?}", node.name_any(), error);
    ctx.metrics.node.reconcile_failure(node.as_ref(), error);
    Action::requeue(APPLY_REQUEUE)
}

fn node_key(node: &LynqNode) -> ObjectKey {
    ObjectKey::of::<LynqNode>(&node.namespace().unwrap_or_default(), &node.name_any())
}

/// Kind to apiVersion of the resources currently declared
fn api_versions(resources: &[TResource]) -> BTreeMap<String, String> {
    resources
        .iter()
        .filter(|r| !r.kind().is_empty() && !r.api_version().is_empty())
        .map(|r| (r.kind().to_string(), r.api_version().to_string()))
        .collect()
}

/// What happened to a child being removed
#[derive(Debug, PartialEq, Eq)]
enum Removal {
    Gone,
    Foreign,
    Deleted,
    Retained,
}

/// Delete or orphan one child, provided it is still ours.
/// Without an explicit policy the one recorded on the live object wins.
async fn remove_child(
    ctx: &Context,
    owner: &Owner,
    key: &ObjectKey,
    policy: Option<DeletionPolicy>,
    reason: &str,
) -> Result<Removal> {
    let Some(live) = ctx.store.get(key).await? else {
        return Ok(Removal::Gone);
    };
    match ownership(&live, owner) {
        Ownership::Managed => {}
        Ownership::Adoptable => {
            debug!("Leaving {} alone, it is orphaned already", key);
            return Ok(Removal::Foreign);
        }
        Ownership::Foreign(why) => {
            debug!("Leaving {} alone: {}", key, why);
            return Ok(Removal::Foreign);
        }
    }
    let policy = policy.unwrap_or_else(|| live_deletion_policy(&live));
    if !ctx.applier.delete(&live, owner, policy, reason).await? {
        return Ok(Removal::Gone);
    }
    Ok(match policy {
        DeletionPolicy::Delete => Removal::Deleted,
        DeletionPolicy::Retain => Removal::Retained,
    })
}

async fn deleted_meanwhile(node: &LynqNode, ctx: &Context) -> Result<bool> {
    let current = get_as::<LynqNode>(ctx.store.as_ref(), &node_key(node)).await?;
    Ok(current.is_none_or(|n| n.metadata.deletion_timestamp.is_some()))
}

/// Previously applied keys of one resource id
fn previous_keys_of(node: &LynqNode, id: &str) -> Vec<String> {
    node.applied_resources()
        .iter()
        .filter(|k| k.parse::<AppliedKey>().is_ok_and(|a| a.id == id))
        .cloned()
        .collect()
}

async fn publish(node: &LynqNode, ctx: &Context, update: NodeStatusUpdate) -> Result<()> {
    ctx.status.publish(&node_key(node), update).await?;
    Ok(())
}

/// Remove the children that were applied before but are no longer rendered.
/// Returns the keys that must stay recorded because their removal failed.
async fn remove_orphans(
    node: &LynqNode,
    ctx: &Context,
    owner: &Owner,
    current: &BTreeSet<String>,
    api_versions: &BTreeMap<String, String>,
) -> Vec<String> {
    let reference = events::reference(node);
    let mut kept = vec![];
    for raw in orphans(node.applied_resources(), current) {
        let Ok(applied) = raw.parse::<AppliedKey>() else {
            warn!("Dropping malformed applied resource {}", raw);
            continue;
        };
        let Some(key) = applied.object_key(api_versions) else {
            warn!("Cannot resolve the apiVersion of {}, forgetting it", raw);
            continue;
        };
        match remove_child(ctx, owner, &key, None, REASON_REMOVED_FROM_TEMPLATE).await {
            Ok(Removal::Deleted) => {
                ctx.events
                    .publish(
                        events::normal(
                            "OrphanedResourceDeleted",
                            "DeleteOrphan",
                            format!("Deleted {key}, resource {} left the template", applied.id),
                        ),
                        &reference,
                    )
                    .await;
            }
            Ok(Removal::Retained) => {
                ctx.events
                    .publish(
                        events::normal(
                            "OrphanedResourceRetained",
                            "DeleteOrphan",
                            format!("Retained {key}, resource {} left the template", applied.id),
                        ),
                        &reference,
                    )
                    .await;
            }
            Ok(Removal::Gone | Removal::Foreign) => {}
            Err(e) => {
                warn!("Failed to remove orphan {}: {}", key, e);
                kept.push(raw);
            }
        }
    }
    kept
}

/// Render then apply every resource in dependency order
async fn apply_pass(node: &LynqNode, ctx: Arc<Context>) -> Result<Action> {
    let ns = node.namespace().unwrap_or_default();
    let name = node.name_any();
    let generation = node.metadata.generation;
    let reference = events::reference(node);
    let owner = Owner::from_node(node)?;

    let resources = match graph::sorted(&node.spec.resources.collect()) {
        Ok(sorted) => sorted,
        Err(e) => {
            warn!("LynqNode {} cannot order its resources: {}", name, e);
            let desired = i32::try_from(node.spec.resources.collect().len()).unwrap_or(i32::MAX);
            let mut update = NodeStatusUpdate::default().counters(desired, 0, 0, 0);
            for cond in dependency_failure(&e.to_string(), generation) {
                update = update.condition(cond);
            }
            update.observed_generation = generation;
            publish(node, &ctx, update).await?;
            return Ok(Action::requeue(APPLY_REQUEUE));
        }
    };
    let vars = node_variables(node);
    let rendered: Vec<(&TResource, Result<Rendered>)> = resources
        .iter()
        .map(|res| (res, render_resource(ctx.engine.as_ref(), res, &vars, &ns)))
        .collect();

    // resources that failed to render keep their previous keys
    let mut current: BTreeSet<String> = BTreeSet::new();
    for (res, out) in &rendered {
        match out {
            Ok(r) => {
                current.insert(r.key.to_string());
            }
            Err(_) => current.extend(previous_keys_of(node, &res.id)),
        }
    }
    let kept_orphans = remove_orphans(node, &ctx, &owner, &current, &api_versions(&resources)).await;

    let mut counts = NodeCounts {
        desired: i32::try_from(rendered.len()).unwrap_or(i32::MAX),
        ..NodeCounts::default()
    };
    let mut applied_keys: BTreeSet<String> = kept_orphans.into_iter().collect();
    let mut changed = 0;
    for (res, out) in rendered {
        if deleted_meanwhile(node, &ctx).await? {
            info!("LynqNode {} is being deleted, stopping the apply pass", name);
            return Ok(Action::requeue(Duration::ZERO));
        }
        let rendered = match out {
            Ok(r) => r,
            Err(e) => {
                counts.failed += 1;
                applied_keys.extend(previous_keys_of(node, &res.id));
                warn!("LynqNode {}: {}", name, e);
                ctx.events
                    .publish(events::warning("TemplateRenderError", "Render", e.to_string()), &reference)
                    .await;
                continue;
            }
        };
        let opts = ApplyOptions::from(res);
        let policy = res.conflict_policy.as_str();
        match ctx.applier.apply(&rendered.object, &owner, &opts).await {
            Ok(applied) => {
                ctx.metrics.lynq.apply_attempt(res.kind(), "success", policy);
                applied_keys.insert(rendered.key.to_string());
                if applied.changed {
                    if changed == 0 {
                        publish(node, &ctx, NodeStatusUpdate::default().condition(progressing(generation)))
                            .await?;
                        ctx.events
                            .publish(
                                events::normal(
                                    "TemplateResourcesApplying",
                                    "Apply",
                                    format!("Applying resources of LynqNode {name}"),
                                ),
                                &reference,
                            )
                            .await;
                    }
                    changed += 1;
                }
                if applied.readopted {
                    ctx.events
                        .publish(
                            events::normal(
                                "OrphanMarkersRemoved",
                                "Apply",
                                format!("Readopted {} of resource {}", rendered.key, res.id),
                            ),
                            &reference,
                        )
                        .await;
                }
                if applied.skipped_once || !res.wait_for_ready || is_ready(&applied.live) {
                    counts.ready += 1;
                } else {
                    debug!("{} not ready yet: {}", rendered.key, readiness_message(&applied.live));
                }
            }
            Err(Error::Conflict(conflict)) => {
                counts.conflicted += 1;
                counts.failed += 1;
                ctx.metrics.lynq.apply_attempt(res.kind(), "conflict", policy);
                ctx.metrics.lynq.conflict(&name, &ns, res.kind(), policy);
                warn!("LynqNode {}: {}", name, conflict);
                ctx.events
                    .publish(events::warning("ResourceConflict", "Apply", conflict.to_string()), &reference)
                    .await;
            }
            Err(e) => {
                counts.failed += 1;
                applied_keys.extend(previous_keys_of(node, &res.id));
                ctx.metrics.lynq.apply_attempt(res.kind(), "error", policy);
                warn!("LynqNode {} failed to apply {}: {}", name, rendered.key, e);
                ctx.events
                    .publish(
                        events::warning("ApplyFailed", "Apply", format!("Failed to apply {}: {e}", rendered.key)),
                        &reference,
                    )
                    .await;
            }
        }
    }

    if counts.failed > 0 {
        ctx.events
            .publish(
                events::warning(
                    "TemplateAppliedPartial",
                    "Apply",
                    format!(
                        "Applied {}/{} resources, {} failed",
                        counts.desired - counts.failed,
                        counts.desired,
                        counts.failed
                    ),
                ),
                &reference,
            )
            .await;
    } else if changed > 0 {
        ctx.events
            .publish(
                events::normal(
                    "TemplateAppliedSuccess",
                    "Apply",
                    format!("Applied {} resources", counts.desired),
                ),
                &reference,
            )
            .await;
    }

    let conditions = pass_conditions(counts, generation);
    let mut update = NodeStatusUpdate {
        applied_resources: Some(applied_keys.into_iter().collect()),
        ..NodeStatusUpdate::default()
    }
    .counters(counts.desired, counts.ready, counts.failed, counts.conflicted);
    for cond in &conditions {
        update = update.condition(cond.clone());
    }
    update.observed_generation = generation;
    publish(node, &ctx, update).await?;
    ctx.metrics.lynq.node_observed(&name, &ns, counts, &conditions);
    info!(
        "LynqNode {} applied: {}/{} ready, {} failed, {} conflicted",
        name, counts.ready, counts.desired, counts.failed, counts.conflicted
    );
    Ok(Action::requeue(APPLY_REQUEUE))
}

/// Refresh the counters from the live children; any drift triggers a spec pass
async fn observe(node: &LynqNode, ctx: Arc<Context>) -> Result<Action> {
    let ns = node.namespace().unwrap_or_default();
    let name = node.name_any();
    let generation = node.metadata.generation;
    let owner = Owner::from_node(node)?;
    let Ok(resources) = graph::sorted(&node.spec.resources.collect()) else {
        return apply_pass(node, ctx).await;
    };
    let vars = node_variables(node);
    let mut counts = NodeCounts {
        desired: i32::try_from(resources.len()).unwrap_or(i32::MAX),
        ..NodeCounts::default()
    };
    for res in &resources {
        let Ok(rendered) = render_resource(ctx.engine.as_ref(), res, &vars, &ns) else {
            counts.failed += 1;
            continue;
        };
        match ctx.applier.preview(&rendered.object, &owner, &ApplyOptions::from(res)).await {
            Ok(Plan::SkipOnce(_)) => counts.ready += 1,
            // fields the manifest leaves out are not drift
            Ok(Plan::InSync(live) | Plan::Refresh { live, .. }) => {
                if !res.wait_for_ready || is_ready(&live) {
                    counts.ready += 1;
                }
            }
            Ok(_) => {
                info!("{} of LynqNode {} drifted, applying again", rendered.key, name);
                return apply_pass(node, ctx).await;
            }
            Err(Error::Conflict(_)) => {
                counts.conflicted += 1;
                counts.failed += 1;
            }
            Err(e) => {
                warn!("LynqNode {} cannot check {}: {}", name, rendered.key, e);
                counts.failed += 1;
            }
        }
    }
    let conditions = pass_conditions(counts, generation);
    let mut update =
        NodeStatusUpdate::default().counters(counts.desired, counts.ready, counts.failed, counts.conflicted);
    for cond in &conditions {
        update = update.condition(cond.clone());
    }
    publish(node, &ctx, update).await?;
    ctx.metrics.lynq.node_observed(&name, &ns, counts, &conditions);
    Ok(Action::requeue(STATUS_REQUEUE))
}

#[async_trait]
impl Reconciler for LynqNode {
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        if self.metadata.generation == Some(self.observed_generation()) {
            observe(self, ctx).await
        } else {
            apply_pass(self, ctx).await
        }
    }

    // Children go away within a bounded time, whatever their readiness
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let ns = self.namespace().unwrap_or_default();
        let name = self.name_any();
        let reference = events::reference(self);
        let owner = Owner::from_node(self)?;
        let deadline = Instant::now() + CLEANUP_BUDGET;
        let resources = self.spec.resources.collect();
        let vars = node_variables(self);

        // rendered resources with their own policy, then recorded keys nothing renders anymore
        let mut targets: Vec<(ObjectKey, Option<DeletionPolicy>)> = vec![];
        let mut covered = BTreeSet::new();
        let mut failures = 0;
        for res in &resources {
            match render_resource(ctx.engine.as_ref(), res, &vars, &ns) {
                Ok(rendered) => {
                    covered.insert(rendered.key.to_string());
                    targets.push((ObjectKey::from_value(&rendered.object)?, Some(res.deletion_policy)));
                }
                Err(e) => {
                    warn!("LynqNode {} cannot render {} for cleanup: {}", name, res.id, e);
                    failures += 1;
                }
            }
        }
        let versions = api_versions(&resources);
        for raw in orphans(self.applied_resources(), &covered) {
            if let Some(key) = raw.parse::<AppliedKey>().ok().and_then(|k| k.object_key(&versions)) {
                targets.push((key, None));
            }
        }

        for (key, policy) in targets {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("LynqNode {} cleanup ran out of time before {}", name, key);
                failures += 1;
                break;
            }
            match timeout(remaining, remove_child(&ctx, &owner, &key, policy, REASON_NODE_DELETED)).await {
                Ok(Ok(Removal::Retained)) => {
                    ctx.events
                        .publish(
                            events::normal("ResourceRetained", "Cleanup", format!("Retained {key} with orphan markers")),
                            &reference,
                        )
                        .await;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!("LynqNode {} failed to remove {}: {}", name, key, e);
                    failures += 1;
                }
                Err(_) => {
                    warn!("LynqNode {} cleanup timed out on {}", name, key);
                    failures += 1;
                    break;
                }
            }
        }

        if failures > 0 {
            ctx.events
                .publish(
                    events::warning(
                        "CleanupPartialFailure",
                        "Cleanup",
                        format!("{failures} resources could not be cleaned up"),
                    ),
                    &reference,
                )
                .await;
        }
        ctx.events
            .publish(
                events::normal("LynqNodeDeleted", "Cleanup", format!("LynqNode {name} cleaned up")),
                &reference,
            )
            .await;
        ctx.status.forget(&node_key(self));
        ctx.metrics.lynq.node_forget(&name, &ns);
        Ok(Action::await_change())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        manager::tests::{Harness, harness},
        render::{
            build_node,
            tests::{form, hub, row},
        },
    };
    use common::{
        LynqNodeStatus,
        conditions::{CONFLICTED, DEGRADED, READY, find_condition, is_condition_true},
        template::HandleBars,
    };
    use serde_json::{Value, json};

    fn node_key() -> ObjectKey {
        ObjectKey::of::<LynqNode>("tenants", "u1-web")
    }

    fn cm_key(name: &str) -> ObjectKey {
        ObjectKey::new("v1", "ConfigMap", Some("tenants"), name)
    }

    fn cm(id: &str, deps: &[&str], extra: Value) -> Value {
        let mut res = json!({"id": id, "dependIds": deps, "nameTemplate": format!("{{{{uid}}}}-{id}"),
            "spec": {"data": {"key": "v1"}}});
        if let (Some(res), Some(extra)) = (res.as_object_mut(), extra.as_object()) {
            res.extend(extra.clone());
        }
        res
    }

    fn setup(resources: Value) -> Harness {
        let h = harness();
        let mut node = build_node(&HandleBars::new(), &hub(), &form("web", resources), &row("u1")).unwrap();
        node.metadata.finalizers = Some(vec![NODE_FINALIZER.to_string()]);
        h.store.insert(serde_json::to_value(node).unwrap()).unwrap();
        h
    }

    async fn stored(h: &Harness) -> LynqNode {
        get_as::<LynqNode>(h.ctx.store.as_ref(), &node_key()).await.unwrap().unwrap()
    }

    async fn run(h: &Harness) -> Action {
        reconcile(Arc::new(stored(h).await), h.ctx.clone()).await.unwrap()
    }

    async fn status(h: &Harness) -> LynqNodeStatus {
        stored(h).await.status.unwrap_or_default()
    }

    /// Edit the node spec the way the hub would, bumping its generation
    async fn edit_spec(h: &Harness, f: impl FnOnce(&mut Value)) {
        let mut obj = h.store.object(&node_key()).unwrap();
        f(&mut obj["spec"]);
        h.ctx.store.replace(&obj).await.unwrap();
    }

    fn reason(status: &LynqNodeStatus, condition: &str) -> String {
        find_condition(&status.conditions, condition).unwrap().reason.clone()
    }

    #[tokio::test]
    async fn test_once_keeps_initial_value() {
        let h = setup(json!({"configMaps": [cm("cm", &[], json!({"creationPolicy": "Once",
            "spec": {"data": {"key": "initial"}}}))]}));
        assert_eq!(run(&h).await, Action::requeue(APPLY_REQUEUE));
        let child = h.store.object(&cm_key("u1-cm")).unwrap();
        assert_eq!(child["data"]["key"], "initial");
        assert_eq!(child["metadata"]["annotations"][ANNOTATION_CREATED_ONCE], "true");
        let st = status(&h).await;
        assert!(is_condition_true(&st.conditions, READY));
        assert_eq!(st.observed_generation, 1);
        assert_eq!(st.applied_resources, vec!["ConfigMap/tenants/u1-cm@cm"]);
        assert!(h.events.has("TemplateAppliedSuccess"));

        edit_spec(&h, |spec| spec["configMaps"][0]["spec"]["data"]["key"] = json!("updated")).await;
        run(&h).await;
        assert_eq!(h.store.object(&cm_key("u1-cm")).unwrap()["data"]["key"], "initial");
        let st = status(&h).await;
        assert_eq!(st.observed_generation, 2);
        assert_eq!(st.ready_resources, 1);
    }

    #[tokio::test]
    async fn test_replace_drift_is_reverted_from_status_pass() {
        let h = setup(json!({"configMaps": [cm("cm", &[], json!({"patchStrategy": "replace"}))]}));
        run(&h).await;
        // settled: the next pass only observes
        h.store.clear_writes();
        assert_eq!(run(&h).await, Action::requeue(STATUS_REQUEUE));
        assert!(!h.store.writes().iter().any(|w| w.contains("ConfigMap")));

        // a field the template leaves out, like a server default, is not drift
        h.store.modify(&cm_key("u1-cm"), |o| o["data"]["extra"] = json!("manual"));
        assert_eq!(run(&h).await, Action::requeue(STATUS_REQUEUE));
        assert!(!h.store.writes().iter().any(|w| w.contains("ConfigMap")));

        h.store.modify(&cm_key("u1-cm"), |o| o["data"]["key"] = json!("manual"));
        assert_eq!(run(&h).await, Action::requeue(APPLY_REQUEUE));
        assert_eq!(h.store.object(&cm_key("u1-cm")).unwrap()["data"], json!({"key": "v1"}));
    }

    #[tokio::test]
    async fn test_stuck_conflict_then_recovery() {
        let h = setup(json!({"configMaps": [cm("cm", &[], json!({"spec": {"data": {"key": "managed"}}}))]}));
        h.store
            .insert(json!({"apiVersion": "v1", "kind": "ConfigMap",
                "metadata": {"name": "u1-cm", "namespace": "tenants"}, "data": {"key": "existing"}}))
            .unwrap();
        run(&h).await;
        let st = status(&h).await;
        assert!(is_condition_true(&st.conditions, CONFLICTED));
        assert!(is_condition_true(&st.conditions, DEGRADED));
        assert_eq!(reason(&st, READY), "ResourcesFailedAndConflicted");
        assert_eq!((st.conflicted_resources, st.failed_resources), (1, 1));
        assert_eq!(st.observed_generation, 1);
        assert!(st.applied_resources.is_empty());
        assert_eq!(h.store.object(&cm_key("u1-cm")).unwrap()["data"]["key"], "existing");
        assert!(h.events.warnings().contains(&"ResourceConflict".to_string()));

        // the spec was processed, later passes only observe the conflict
        h.store.clear_writes();
        assert_eq!(run(&h).await, Action::requeue(STATUS_REQUEUE));
        assert!(!h.store.writes().iter().any(|w| w.contains("ConfigMap")));
        assert_eq!(status(&h).await.conflicted_resources, 1);

        h.store.remove(&cm_key("u1-cm"));
        assert_eq!(run(&h).await, Action::requeue(APPLY_REQUEUE));
        assert_eq!(h.store.object(&cm_key("u1-cm")).unwrap()["data"]["key"], "managed");
        let st = status(&h).await;
        assert!(is_condition_true(&st.conditions, READY));
        assert!(!is_condition_true(&st.conditions, CONFLICTED));
        assert_eq!(st.observed_generation, 1);
    }

    #[tokio::test]
    async fn test_retained_child_survives_node_deletion() {
        let h = setup(json!({"configMaps": [cm("cm", &[], json!({"deletionPolicy": "Retain"}))]}));
        run(&h).await;
        let child = h.store.object(&cm_key("u1-cm")).unwrap();
        assert!(child["metadata"].get("ownerReferences").is_none());
        assert_eq!(child["metadata"]["labels"][LABEL_NODE], "u1-web");

        h.ctx.store.delete(&node_key()).await.unwrap();
        assert_eq!(run(&h).await, Action::await_change());
        assert!(h.store.object(&node_key()).is_none());
        let child = h.store.object(&cm_key("u1-cm")).unwrap();
        assert_eq!(child["metadata"]["labels"][LABEL_ORPHANED], "true");
        assert!(child["metadata"]["annotations"].get(ANNOTATION_ORPHANED_AT).is_some());
        assert_eq!(child["metadata"]["annotations"][ANNOTATION_ORPHANED_REASON], REASON_NODE_DELETED);
        assert!(h.events.has("ResourceRetained"));
        assert!(h.events.has("LynqNodeDeleted"));
    }

    #[tokio::test]
    async fn test_dependency_order_and_failure_isolation() {
        let h = setup(json!({"configMaps": [cm("a", &["m"], json!({})), cm("m", &["z"], json!({})), cm("z", &[], json!({}))]}));
        run(&h).await;
        let creates: Vec<String> = h
            .store
            .writes()
            .into_iter()
            .filter(|w| w.starts_with("create ConfigMap"))
            .collect();
        assert_eq!(creates, vec![
            "create ConfigMap/tenants/u1-z",
            "create ConfigMap/tenants/u1-m",
            "create ConfigMap/tenants/u1-a",
        ]);

        let h = setup(json!({"configMaps": [cm("a", &["m"], json!({})), cm("m", &["z"], json!({})), cm("z", &[], json!({}))]}));
        h.store.fail_writes(&cm_key("u1-z"));
        run(&h).await;
        assert!(h.store.object(&cm_key("u1-m")).is_some());
        assert!(h.store.object(&cm_key("u1-a")).is_some());
        let st = status(&h).await;
        assert_eq!((st.failed_resources, st.ready_resources, st.desired_resources), (1, 2, 3));
        assert_eq!(reason(&st, READY), "ResourcesFailed");
        assert_eq!(st.observed_generation, 1);
        let warnings = h.events.warnings();
        assert!(warnings.contains(&"ApplyFailed".to_string()));
        assert!(warnings.contains(&"TemplateAppliedPartial".to_string()));
    }

    #[tokio::test]
    async fn test_deletion_interrupts_apply_pass() {
        let h = setup(json!({"configMaps": [cm("a", &[], json!({})), cm("b", &["a"], json!({}))]}));
        let stale = Arc::new(stored(&h).await);
        h.ctx.store.delete(&node_key()).await.unwrap();

        let started = std::time::Instant::now();
        assert_eq!(reconcile(stale, h.ctx.clone()).await.unwrap(), Action::requeue(Duration::ZERO));
        assert!(h.store.object(&cm_key("u1-a")).is_none());
        assert_eq!(run(&h).await, Action::await_change());
        assert!(h.store.object(&node_key()).is_none());
        assert!(started.elapsed() < CLEANUP_BUDGET);
    }

    #[tokio::test]
    async fn test_removed_resource_is_deleted() {
        let h = setup(json!({"configMaps": [cm("a", &[], json!({})), cm("b", &[], json!({}))]}));
        run(&h).await;
        assert_eq!(status(&h).await.applied_resources.len(), 2);

        edit_spec(&h, |spec| {
            if let Some(list) = spec["configMaps"].as_array_mut() {
                list.retain(|r| r["id"] != "b");
            }
        })
        .await;
        run(&h).await;
        assert!(h.store.object(&cm_key("u1-b")).is_none());
        assert!(h.store.object(&cm_key("u1-a")).is_some());
        assert_eq!(status(&h).await.applied_resources, vec!["ConfigMap/tenants/u1-a@a"]);
        assert!(h.events.has("OrphanedResourceDeleted"));
    }

    #[tokio::test]
    async fn test_cycle_blocks_apply() {
        let h = setup(json!({"configMaps": [cm("a", &["b"], json!({})), cm("b", &["a"], json!({}))]}));
        assert_eq!(run(&h).await, Action::requeue(APPLY_REQUEUE));
        assert!(h.store.object(&cm_key("u1-a")).is_none());
        let st = status(&h).await;
        assert_eq!(reason(&st, DEGRADED), "DependencyCycle");
        assert!(!is_condition_true(&st.conditions, READY));
    }

    #[tokio::test]
    async fn test_cycle_replaces_previous_pass_status() {
        let h = setup(json!({"configMaps": [cm("a", &[], json!({}))]}));
        h.store
            .insert(json!({"apiVersion": "v1", "kind": "ConfigMap",
                "metadata": {"name": "u1-a", "namespace": "tenants"}, "data": {"key": "existing"}}))
            .unwrap();
        run(&h).await;
        assert!(is_condition_true(&status(&h).await.conditions, CONFLICTED));

        edit_spec(&h, |spec| {
            spec["configMaps"] = json!([cm("a", &["b"], json!({})), cm("b", &["a"], json!({}))]);
        })
        .await;
        assert_eq!(run(&h).await, Action::requeue(APPLY_REQUEUE));
        let st = status(&h).await;
        assert_eq!(reason(&st, CONFLICTED), "DependencyCycle");
        assert!(!is_condition_true(&st.conditions, CONFLICTED));
        assert_eq!(reason(&st, DEGRADED), "DependencyCycle");
        assert_eq!(
            (st.desired_resources, st.ready_resources, st.failed_resources, st.conflicted_resources),
            (2, 0, 0, 0)
        );
        assert_eq!(st.observed_generation, 2);
    }

    #[tokio::test]
    async fn test_unreadable_child_does_not_abort_status_pass() {
        let h = setup(json!({"configMaps": [cm("a", &[], json!({})), cm("b", &[], json!({}))]}));
        run(&h).await;
        assert_eq!(status(&h).await.ready_resources, 2);

        h.store.fail_reads(&cm_key("u1-a"));
        assert_eq!(run(&h).await, Action::requeue(STATUS_REQUEUE));
        let st = status(&h).await;
        assert_eq!((st.ready_resources, st.failed_resources), (1, 1));
        assert_eq!(reason(&st, READY), "ResourcesFailed");

        h.store.heal(&cm_key("u1-a"));
        assert_eq!(run(&h).await, Action::requeue(STATUS_REQUEUE));
        let st = status(&h).await;
        assert_eq!((st.ready_resources, st.failed_resources), (2, 0));
        assert!(is_condition_true(&st.conditions, READY));
    }

    #[tokio::test]
    async fn test_unready_child_is_not_counted() {
        let h = setup(json!({"deployments": [{"id": "app", "nameTemplate": "{{uid}}-app",
            "spec": {"spec": {"replicas": 1}}}]}));
        run(&h).await;
        let st = status(&h).await;
        assert_eq!((st.ready_resources, st.failed_resources), (0, 0));
        assert_eq!(reason(&st, READY), "NotAllResourcesReady");
        assert_eq!(reason(&st, DEGRADED), "ResourcesNotReady");
        assert_eq!(st.observed_generation, 1);
    }
}
