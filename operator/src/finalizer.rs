//! Finalizer handling through the object store, so the controllers run the
//! same way against the API server and the in-memory store.
use crate::{Reconciler, Result, manager::Context};
use common::k8sgeneric::{ObjectKey, ObjectStore};
use kube::{Resource, ResourceExt, runtime::controller::Action};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::*;

async fn edit_finalizers(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    edit: impl Fn(&mut Vec<String>),
) -> Result<()> {
    let mut attempt = 0;
    loop {
        let Some(mut live) = store.get(key).await? else {
            return Ok(());
        };
        let mut finalizers: Vec<String> = live
            .pointer("/metadata/finalizers")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        let before = finalizers.clone();
        edit(&mut finalizers);
        if finalizers == before {
            return Ok(());
        }
        live["metadata"]["finalizers"] = Value::from(finalizers);
        match store.replace(&live).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_api_conflict() && attempt < 4 => {
                debug!("{} changed while editing finalizers, retrying", key);
                attempt += 1;
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

pub async fn add_finalizer(store: &dyn ObjectStore, key: &ObjectKey, name: &str) -> Result<()> {
    edit_finalizers(store, key, |f| {
        if !f.iter().any(|x| x == name) {
            f.push(name.to_string());
        }
    })
    .await
}

pub async fn remove_finalizer(store: &dyn ObjectStore, key: &ObjectKey, name: &str) -> Result<()> {
    edit_finalizers(store, key, |f| f.retain(|x| x != name)).await
}

/// Dispatch between the apply and the cleanup paths of `obj`.
///
/// The finalizer is added on the first pass (then requeued at once) and removed
/// once the cleanup ran, whatever its outcome. `kube::runtime::finalizer` keeps the
/// finalizer on a failed cleanup, so it cannot be used here.
pub async fn run_with_finalizer<K>(obj: Arc<K>, ctx: Arc<Context>, name: &str) -> Result<Action>
where
    K: Reconciler + Resource<DynamicType = ()> + Send + Sync,
{
    let key = ObjectKey::of::<K>(&obj.namespace().unwrap_or_default(), &obj.name_any());
    let has_finalizer = obj.finalizers().iter().any(|f| f == name);
    if obj.meta().deletion_timestamp.is_some() {
        if !has_finalizer {
            return Ok(Action::await_change());
        }
        if let Err(e) = obj.cleanup(ctx.clone()).await {
            warn!("Cleanup of {} failed, releasing it anyway: {}", key, e);
        }
        remove_finalizer(ctx.store.as_ref(), &key, name).await?;
        return Ok(Action::await_change());
    }
    if !has_finalizer {
        add_finalizer(ctx.store.as_ref(), &key, name).await?;
        return Ok(Action::requeue(Duration::ZERO));
    }
    obj.reconcile(ctx).await
}
