use crate::{Error, Reconciler, Result, events, manager::Context};
use async_trait::async_trait;
use chrono::Utc;
use common::{
    LynqForm, LynqFormStatus, LynqHub, LynqNode,
    conditions::{APPLIED, Condition, READY, VALID, find_condition, is_condition_true, set_condition},
    graph::Graph,
    k8sgeneric::{ObjectKey, list_as},
    status::update_status_with,
};
use kube::{ResourceExt, runtime::controller::Action};
use std::{collections::BTreeMap, sync::Arc};
use tokio::time::Duration;
use tracing::*;

#[instrument(skip(ctx, form), fields(form = %form.name_any()))]
pub async fn reconcile(form: Arc<LynqForm>, ctx: Arc<Context>) -> Result<Action> {
    let _mes = ctx.metrics.form.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();
    if form.metadata.deletion_timestamp.is_some() {
        form.cleanup(ctx).await
    } else {
        form.reconcile(ctx).await
    }
}

#[must_use]
pub fn error_policy(form: Arc<LynqForm>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed for LynqForm {}: {:?}", form.name_any(), error);
    ctx.metrics.form.reconcile_failure(form.as_ref(), error);
    Action::requeue(Duration::from_secs(5 * 60))
}

/// One reason the form cannot be used
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationFailure {
    pub reason: &'static str,
    pub message: String,
}

/// Problems of the form content alone: duplicate ids, dangling or cyclic dependencies
pub fn validate_resources(form: &LynqForm) -> Vec<ValidationFailure> {
    let duplicates = form.spec.resources.duplicate_ids();
    if !duplicates.is_empty() {
        return vec![ValidationFailure {
            reason: "DuplicateResourceIDs",
            message: format!("Duplicate resource ids: {}", duplicates.join(", ")),
        }];
    }
    match Graph::build(&form.spec.resources.collect()).and_then(|g| g.validate()) {
        Ok(()) => vec![],
        Err(e) => vec![ValidationFailure {
            reason: "DependencyValidationFailed",
            message: e.to_string(),
        }],
    }
}

/// (Applied condition, total, ready) of the nodes rendered from a form
pub fn rollup(nodes: &[&LynqNode], generation: Option<i64>) -> (Condition, i32, i32) {
    let total = i32::try_from(nodes.len()).unwrap_or(i32::MAX);
    let ready = i32::try_from(
        nodes
            .iter()
            .filter(|n| is_condition_true(n.conditions(), READY))
            .count(),
    )
    .unwrap_or(i32::MAX);
    let message = format!("{ready}/{total} nodes ready");
    let condition = if total == 0 {
        Condition::new(APPLIED, false, "NoNodes", &message)
    } else if ready == total {
        Condition::new(APPLIED, true, "AllNodesReady", &message)
    } else {
        Condition::new(APPLIED, false, "NotAllNodesReady", &message)
    };
    (condition.with_generation(generation), total, ready)
}

async fn validate(form: &LynqForm, ctx: &Context) -> Result<Vec<ValidationFailure>> {
    let ns = form.namespace().unwrap_or_default();
    let hub = ctx
        .store
        .get(&ObjectKey::of::<LynqHub>(&ns, &form.spec.hub_id))
        .await?;
    let mut failures = vec![];
    if hub.is_none() {
        failures.push(ValidationFailure {
            reason: "HubNotFound",
            message: format!("LynqHub {}/{} does not exist", ns, form.spec.hub_id),
        });
    }
    failures.extend(validate_resources(form));
    Ok(failures)
}

#[async_trait]
impl Reconciler for LynqForm {
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let ns = self.namespace().unwrap_or_default();
        let name = self.name_any();
        let generation = self.metadata.generation;
        let previous = self.status.clone().unwrap_or_default();
        let reference = events::reference(self);

        let failures = validate(self, &ctx).await?;
        let valid = if failures.is_empty() {
            Condition::new(VALID, true, "ValidationPassed", "Form is valid")
        } else {
            let message = failures.iter().map(|f| f.message.as_str()).collect::<Vec<_>>().join("; ");
            Condition::new(VALID, false, "ValidationFailed", &message)
        }
        .with_generation(generation);

        // events on transitions only, the form is requeued every minute
        let unchanged = find_condition(&previous.conditions, VALID)
            .is_some_and(|c| c.status == valid.status && c.message == valid.message);
        if !unchanged {
            for failure in &failures {
                ctx.events
                    .publish(events::warning(failure.reason, "Validate", failure.message.clone()), &reference)
                    .await;
            }
            if failures.is_empty() {
                info!("LynqForm {} is valid", name);
                ctx.events
                    .publish(
                        events::normal("ValidationPassed", "Validate", format!("LynqForm {name} passed validation")),
                        &reference,
                    )
                    .await;
            } else {
                warn!("LynqForm {} is invalid: {}", name, valid.message);
                ctx.events
                    .publish(events::warning("ValidationFailed", "Validate", valid.message.clone()), &reference)
                    .await;
            }
        }

        let rolled_up = if failures.is_empty() {
            let nodes = list_as::<LynqNode>(ctx.store.as_ref(), &ns, &BTreeMap::new()).await?;
            let mine: Vec<&LynqNode> = nodes.iter().filter(|n| n.spec.template_ref == name).collect();
            Some(rollup(&mine, generation))
        } else {
            None
        };

        update_status_with::<LynqFormStatus, _>(
            ctx.store.as_ref(),
            &ObjectKey::of::<LynqForm>(&ns, &name),
            ctx.config.status_retries,
            |status| {
                let now = Utc::now();
                status.observed_generation = generation.unwrap_or_default();
                set_condition(&mut status.conditions, valid.clone(), now);
                if let Some((applied, total, ready)) = &rolled_up {
                    status.total_nodes = *total;
                    status.ready_nodes = *ready;
                    set_condition(&mut status.conditions, applied.clone(), now);
                }
            },
        )
        .await?;
        Ok(Action::requeue(Duration::from_secs(60)))
    }

    // nodes follow their hub once the form is gone
    async fn cleanup(&self, _ctx: Arc<Context>) -> Result<Action> {
        Ok(Action::await_change())
    }
}
