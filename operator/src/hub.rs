use crate::{
    Error, Reconciler, Result, events,
    finalizer::run_with_finalizer,
    manager::Context,
    render::{build_node, needs_update},
};
use async_trait::async_trait;
use chrono::Utc;
use common::{
    LynqForm, LynqHub, LynqHubStatus, LynqNode,
    conditions::{Condition, READY, set_condition},
    datasource::{QueryConfig, Row, active_rows},
    k8sgeneric::{ObjectKey, list_as, replace_as},
    labels::*,
    resources::DeletionPolicy,
    status::update_status_with,
};
use kube::{ResourceExt, runtime::controller::Action};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tokio::time::Duration;
use tracing::*;

#[instrument(skip(ctx, hub), fields(hub = %hub.name_any()))]
pub async fn reconcile(hub: Arc<LynqHub>, ctx: Arc<Context>) -> Result<Action> {
    let _mes = ctx.metrics.hub.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();
    run_with_finalizer(hub, ctx, HUB_FINALIZER).await
}

#[must_use]
pub fn error_policy(hub: Arc<LynqHub>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed for LynqHub {}: {:?}", hub.name_any(), error);
    ctx.metrics.hub.reconcile_failure(hub.as_ref(), error);
    Action::requeue(Duration::from_secs(5 * 60))
}

fn hub_key(hub: &LynqHub) -> ObjectKey {
    ObjectKey::of::<LynqHub>(&hub.namespace().unwrap_or_default(), &hub.name_any())
}

fn node_key(node: &LynqNode) -> ObjectKey {
    ObjectKey::of::<LynqNode>(&node.namespace().unwrap_or_default(), &node.name_any())
}

async fn fetch_rows(hub: &LynqHub, ctx: &Context) -> Result<Vec<Row>> {
    let config = QueryConfig::from_hub(hub)?;
    let source = ctx.datasources.open(hub, ctx.store.as_ref()).await?;
    let rows = source.query_rows(&config).await;
    source.close().await;
    rows
}

async fn write_status(hub: &LynqHub, ctx: &Context, mut f: impl FnMut(&mut LynqHubStatus)) -> Result<()> {
    let generation = hub.metadata.generation.unwrap_or_default();
    update_status_with::<LynqHubStatus, _>(
        ctx.store.as_ref(),
        &hub_key(hub),
        ctx.config.status_retries,
        |status| {
            status.observed_generation = generation;
            f(status);
        },
    )
    .await?;
    Ok(())
}

/// (ready, failed) from the Ready condition of the nodes; nodes without one count in neither
pub fn count_nodes(nodes: &[LynqNode]) -> (i32, i32) {
    nodes.iter().fold((0, 0), |(ready, failed), node| {
        match node.conditions().iter().find(|c| c.condition_type == READY) {
            Some(c) if c.is_true() => (ready + 1, failed),
            Some(_) => (ready, failed + 1),
            None => (ready, failed),
        }
    })
}

type NodeId = (String, String);

/// Every (form, active row) pair keyed by (form name, uid)
pub fn desired_pairs<'a>(forms: &'a [LynqForm], rows: &'a [Row]) -> BTreeMap<NodeId, (&'a LynqForm, &'a Row)> {
    forms
        .iter()
        .flat_map(|form| rows.iter().map(move |row| ((form.name_any(), row.uid.clone()), (form, row))))
        .collect()
}

async fn create_node(ctx: &Context, hub: &LynqHub, form: &LynqForm, row: &Row) -> Result<()> {
    let node = build_node(ctx.engine.as_ref(), hub, form, row)?;
    ctx.store.create(&serde_json::to_value(&node)?).await?;
    info!("Created LynqNode {} for row {}", node.name_any(), row.uid);
    ctx.events
        .publish(
            events::normal(
                "NodeCreated",
                "Create",
                format!("Created LynqNode {} from LynqForm {}", node.name_any(), form.name_any()),
            ),
            &events::reference(hub),
        )
        .await;
    Ok(())
}

async fn update_node(ctx: &Context, hub: &LynqHub, current: &LynqNode, form: &LynqForm, row: &Row) -> Result<()> {
    let wanted = build_node(ctx.engine.as_ref(), hub, form, row)?;
    let mut next = current.clone();
    next.spec = wanted.spec;
    next.labels_mut().extend(wanted.metadata.labels.unwrap_or_default());
    next.annotations_mut().extend(wanted.metadata.annotations.unwrap_or_default());
    replace_as(ctx.store.as_ref(), &next).await?;
    info!("Updated LynqNode {}", next.name_any());
    ctx.events
        .publish(
            events::normal(
                "NodeUpdated",
                "Update",
                format!("Updated LynqNode {} (row or form changed)", next.name_any()),
            ),
            &events::reference(hub),
        )
        .await;
    Ok(())
}

async fn delete_node(ctx: &Context, hub: &LynqHub, node: &LynqNode) {
    let name = node.name_any();
    let reference = events::reference(hub);
    ctx.events
        .publish(
            events::normal("NodeDeleting", "Delete", format!("Deleting LynqNode {name}, its row is gone")),
            &reference,
        )
        .await;
    match ctx.store.delete(&node_key(node)).await {
        Ok(_) => {
            info!("Deleted LynqNode {}", name);
            ctx.events
                .publish(events::normal("NodeDeleted", "Delete", format!("Deleted LynqNode {name}")), &reference)
                .await;
        }
        Err(e) => {
            warn!("Failed to delete LynqNode {}: {}", name, e);
            ctx.events
                .publish(
                    events::warning("NodeDeletionFailed", "Delete", format!("Failed to delete LynqNode {name}: {e}")),
                    &reference,
                )
                .await;
        }
    }
}

/// Drop the ownerReferences a node holds on one retained child
async fn release_retained(ctx: &Context, node: &LynqNode, res: &common::resources::TResource) -> Result<bool> {
    let Some(uid) = node.uid() else {
        return Ok(false);
    };
    let name = res
        .name_template
        .clone()
        .filter(|n| !n.is_empty())
        .or_else(|| res.spec.pointer("/metadata/name").and_then(Value::as_str).map(str::to_string))
        .ok_or(Error::MissingObjectKey("metadata.name"))?;
    let node_ns = node.namespace().unwrap_or_default();
    let namespace = match res.kind() {
        "Namespace" => None,
        _ => Some(res.target_namespace.clone().filter(|n| !n.is_empty()).unwrap_or(node_ns)),
    };
    let key = ObjectKey::new(res.api_version(), res.kind(), namespace.as_deref(), &name);
    let Some(mut live) = ctx.store.get(&key).await? else {
        return Ok(false);
    };
    let Some(refs) = live.pointer_mut("/metadata/ownerReferences").and_then(Value::as_array_mut) else {
        return Ok(false);
    };
    let before = refs.len();
    refs.retain(|r| r.get("uid").and_then(Value::as_str) != Some(uid.as_str()));
    if refs.len() == before {
        return Ok(false);
    }
    ctx.store.replace(&live).await?;
    info!("Released {} from LynqNode {}", key, node.name_any());
    Ok(true)
}

#[async_trait]
impl Reconciler for LynqHub {
    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let ns = self.namespace().unwrap_or_default();
        let name = self.name_any();
        let interval = self.sync_interval();
        let generation = self.metadata.generation;

        let forms: Vec<LynqForm> = list_as::<LynqForm>(ctx.store.as_ref(), &ns, &BTreeMap::new())
            .await?
            .into_iter()
            .filter(|f| f.spec.hub_id == name)
            .collect();
        let referencing = i32::try_from(forms.len()).unwrap_or(i32::MAX);

        let rows = match fetch_rows(self, &ctx).await {
            Ok(rows) => active_rows(rows),
            Err(e) => {
                warn!("Failed to query the data source of LynqHub {}: {}", name, e);
                ctx.events
                    .publish(
                        events::warning("DatabaseQueryFailed", "Sync", format!("Failed to query the data source: {e}")),
                        &events::reference(self),
                    )
                    .await;
                let message = e.to_string();
                write_status(self, &ctx, |status| {
                    status.referencing_forms = referencing;
                    set_condition(
                        &mut status.conditions,
                        Condition::new(READY, false, "DatabaseConnectionFailed", &message).with_generation(generation),
                        Utc::now(),
                    );
                })
                .await?;
                return Ok(Action::requeue(interval));
            }
        };

        let hub_labels = BTreeMap::from([(LABEL_HUB.to_string(), name.clone())]);
        let existing: BTreeMap<NodeId, LynqNode> = list_as::<LynqNode>(ctx.store.as_ref(), &ns, &hub_labels)
            .await?
            .into_iter()
            .map(|n| ((n.spec.template_ref.clone(), n.spec.uid.clone()), n))
            .collect();
        let desired = desired_pairs(&forms, &rows);
        debug!(
            "LynqHub {}: {} forms, {} active rows, {} existing nodes",
            name,
            forms.len(),
            rows.len(),
            existing.len()
        );

        for (id, (form, row)) in &desired {
            let outcome = match existing.get(id) {
                None => create_node(&ctx, self, form, row).await,
                Some(node) if needs_update(node, form, row) => update_node(&ctx, self, node, form, row).await,
                Some(_) => Ok(()),
            };
            if let Err(e) = outcome {
                warn!("Failed to sync LynqNode for form {} and row {}: {}", id.0, id.1, e);
            }
        }
        for (id, node) in &existing {
            if !desired.contains_key(id) && node.metadata.deletion_timestamp.is_none() {
                delete_node(&ctx, self, node).await;
            }
        }

        let nodes: Vec<LynqNode> = list_as::<LynqNode>(ctx.store.as_ref(), &ns, &hub_labels)
            .await?
            .into_iter()
            .filter(|n| desired.contains_key(&(n.spec.template_ref.clone(), n.spec.uid.clone())))
            .collect();
        let (ready, failed) = count_nodes(&nodes);
        let total = i32::try_from(desired.len()).unwrap_or(i32::MAX);
        ctx.metrics.lynq.hub_observed(&name, &ns, total, ready, failed);
        let message = format!("Synced {} active rows", rows.len());
        write_status(self, &ctx, |status| {
            status.referencing_forms = referencing;
            status.desired = total;
            status.ready = ready;
            status.failed = failed;
            set_condition(
                &mut status.conditions,
                Condition::new(READY, true, "DatabaseConnected", &message).with_generation(generation),
                Utc::now(),
            );
        })
        .await?;
        Ok(Action::requeue(interval))
    }

    // Retained children must outlive the nodes the garbage collector is about to remove
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let ns = self.namespace().unwrap_or_default();
        let name = self.name_any();
        let hub_labels = BTreeMap::from([(LABEL_HUB.to_string(), name.clone())]);
        let nodes = list_as::<LynqNode>(ctx.store.as_ref(), &ns, &hub_labels).await?;
        for node in &nodes {
            let retained = node
                .spec
                .resources
                .collect()
                .into_iter()
                .filter(|r| r.deletion_policy == DeletionPolicy::Retain);
            for res in retained {
                if let Err(e) = release_retained(&ctx, node, &res).await {
                    warn!("Failed to release {} of LynqNode {}: {}", res.id, node.name_any(), e);
                    ctx.events
                        .publish(
                            events::warning(
                                "CleanupFailed",
                                "Cleanup",
                                format!("Failed to release resource {} of LynqNode {}: {e}", res.id, node.name_any()),
                            ),
                            &events::reference(self),
                        )
                        .await;
                }
            }
        }
        ctx.metrics.lynq.hub_forget(&name, &ns);
        info!("LynqHub {} released {} nodes", name, nodes.len());
        Ok(Action::await_change())
    }
}
