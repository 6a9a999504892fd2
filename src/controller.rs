//! Drives [`Reconciler`] passes from watches on `AugmentedNetworkPolicy`
//! resources and the `NetworkPolicy` resources derived from them.

use crate::{
    k8s::{AugmentedNetworkPolicy, NetworkPolicy, ResourceId},
    reconcile::{self, Reconciler},
};
use ahash::AHashMap;
use futures::prelude::*;
use kube::{
    api::Api,
    runtime::{
        controller::{self, Action},
        watcher, Controller,
    },
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Duration;

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

struct Context {
    reconciler: Reconciler,
    failures: Mutex<AHashMap<ResourceId, u32>>,
}

/// Runs the controller until `shutdown` is signaled.
pub async fn run(client: kube::Client, reconciler: Reconciler, shutdown: drain::Watch) {
    let ctx = Arc::new(Context {
        reconciler,
        failures: Mutex::new(AHashMap::new()),
    });

    let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
    let controller = Controller::new(
        Api::<AugmentedNetworkPolicy>::all(client.clone()),
        watcher::Config::default(),
    )
    .owns(
        Api::<NetworkPolicy>::all(client),
        watcher::Config::default(),
    )
    .graceful_shutdown_on(close_rx.map(|_| ()))
    .run(reconcile, error_policy, ctx.clone())
    .for_each(move |result| {
        let ctx = ctx.clone();
        async move {
            match result {
                Ok((obj, _)) => tracing::trace!(policy = %obj, "reconciled"),
                Err(controller::Error::ObjectNotFound(obj)) => {
                    let id = ResourceId::new(obj.namespace.unwrap_or_default(), obj.name);
                    ctx.deleted(&id).await;
                }
                Err(controller::Error::ReconcilerFailed(error, obj)) => {
                    tracing::debug!(policy = %obj, %error, "reconcile failed")
                }
                Err(error) => tracing::warn!(%error, "controller error"),
            }
        }
    });
    tokio::pin!(controller);

    tracing::info!("watching AugmentedNetworkPolicies");
    tokio::select! {
        _ = &mut controller => {}
        handle = shutdown.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(controller).await;
        }
    }
}

async fn reconcile(
    policy: Arc<AugmentedNetworkPolicy>,
    ctx: Arc<Context>,
) -> Result<Action, reconcile::Error> {
    let Some(id) = ResourceId::of(&*policy) else {
        return Ok(Action::await_change());
    };

    let requeue = ctx.reconciler.reconcile(&id).await?;
    ctx.clear_failures(&id);
    Ok(match requeue {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

fn error_policy(
    policy: Arc<AugmentedNetworkPolicy>,
    error: &reconcile::Error,
    ctx: Arc<Context>,
) -> Action {
    let Some(id) = ResourceId::of(&*policy) else {
        return Action::await_change();
    };

    let failures = {
        let mut failures = ctx.failures.lock();
        let count = failures.entry(id.clone()).or_default();
        *count = count.saturating_add(1);
        *count
    };
    let delay = backoff(failures);
    tracing::warn!(policy = %id, %error, failures, ?delay, "reconcile failed; retrying");
    Action::requeue(delay)
}

/// Doubles the retry delay with each consecutive failure, up to a maximum.
fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    INITIAL_BACKOFF
        .checked_mul(1 << exp)
        .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
}

// === impl Context ===

impl Context {
    fn clear_failures(&self, id: &ResourceId) {
        self.failures.lock().remove(id);
    }

    /// Handles a policy that was deleted while a pass was queued. The pass
    /// still runs so that the deletion is observed.
    async fn deleted(&self, id: &ResourceId) {
        self.clear_failures(id);
        if let Err(error) = self.reconciler.reconcile(id).await {
            tracing::warn!(policy = %id, %error, "reconcile failed");
        }
    }
}
