// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hook Registry - named extension points fired on lifecycle transitions.
//!
//! Each entity (the hypervisor, every VM worker) owns a [`HookRegistry`]
//! created with a fixed set of [`HookPoint`]s. Other subsystems register
//! callbacks on those points; [`HookRegistry::fire`] awaits every callback in
//! registration order before returning. One-shot callbacks are detached as
//! soon as they are picked up by a firing, so they run at most once even when
//! the same point fires concurrently.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Extension points known to the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HookPoint {
    /// A VM was allocated.
    HypervisorAlloc,
    /// A VM was freed by an operator.
    HypervisorFree,
    /// A VM left this node through live migration.
    HypervisorMigratedVmLeave,
    /// A VM arrived on this node through live migration.
    HypervisorMigratedVmArrive,
    /// A VM was cloned.
    HypervisorClone,
    /// A worker's connection is authenticated.
    EntityAuthenticated,
    /// A worker finished loading its domain.
    VmInitialize,
}

impl HookPoint {
    /// Wire name of the hook point.
    pub fn name(&self) -> &'static str {
        match self {
            HookPoint::HypervisorAlloc => "HOOK_HYPERVISOR_ALLOC",
            HookPoint::HypervisorFree => "HOOK_HYPERVISOR_FREE",
            HookPoint::HypervisorMigratedVmLeave => "HOOK_HYPERVISOR_MIGRATEDVM_LEAVE",
            HookPoint::HypervisorMigratedVmArrive => "HOOK_HYPERVISOR_MIGRATEDVM_ARRIVE",
            HookPoint::HypervisorClone => "HOOK_HYPERVISOR_CLONE",
            HookPoint::EntityAuthenticated => "HOOK_ENTITY_AUTHENTICATED",
            HookPoint::VmInitialize => "HOOK_VM_INITIALIZE",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Arguments passed to a hook callback.
#[derive(Debug, Clone)]
pub struct HookInvocation {
    /// Point that fired.
    pub point: HookPoint,
    /// Address of the entity owning the registry.
    pub origin: String,
    /// Context supplied at registration.
    pub context: Option<Value>,
    /// Payload supplied by the firing site.
    pub parameters: Value,
}

/// A registered callback.
pub type HookCallback = Arc<dyn Fn(HookInvocation) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`HookCallback`].
pub fn callback<F, Fut>(f: F) -> HookCallback
where
    F: Fn(HookInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |invocation| Box::pin(f(invocation)))
}

/// Handle returned by [`HookRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

struct Registration {
    id: HookId,
    callback: HookCallback,
    context: Option<Value>,
    oneshot: bool,
}

/// Ordered callbacks per hook point.
pub struct HookRegistry {
    origin: String,
    points: Mutex<HashMap<HookPoint, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl HookRegistry {
    /// Create a registry exposing exactly `points`.
    pub fn with_points(origin: impl Into<String>, points: &[HookPoint]) -> Self {
        Self {
            origin: origin.into(),
            points: Mutex::new(points.iter().map(|p| (*p, Vec::new())).collect()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Whether `point` exists in this registry.
    pub fn has_point(&self, point: HookPoint) -> bool {
        self.lock().contains_key(&point)
    }

    /// Append a callback to `point`.
    pub fn register(
        &self,
        point: HookPoint,
        callback: HookCallback,
        context: Option<Value>,
        oneshot: bool,
    ) -> Result<HookId> {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut points = self.lock();
        let registrations = points
            .get_mut(&point)
            .ok_or_else(|| Error::UnknownHook(point.name().to_string()))?;
        registrations.push(Registration {
            id,
            callback,
            context,
            oneshot,
        });
        debug!(origin = %self.origin, hook = %point, oneshot, "Hook callback registered");
        Ok(id)
    }

    /// Remove a callback. Returns whether it was still registered.
    pub fn unregister(&self, point: HookPoint, id: HookId) -> bool {
        let mut points = self.lock();
        let Some(registrations) = points.get_mut(&point) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    /// Number of callbacks currently attached to `point`.
    pub fn registered(&self, point: HookPoint) -> usize {
        self.lock().get(&point).map(Vec::len).unwrap_or(0)
    }

    /// Invoke every callback on `point` in order and wait for them.
    ///
    /// Returns the number of callbacks invoked. Firing a point unknown to
    /// this registry is a no-op.
    pub async fn fire(&self, point: HookPoint, parameters: Value) -> usize {
        let batch: Vec<(HookCallback, Option<Value>)> = {
            let mut points = self.lock();
            let Some(registrations) = points.get_mut(&point) else {
                warn!(origin = %self.origin, hook = %point, "Fired unknown hook point");
                return 0;
            };
            let batch = registrations
                .iter()
                .map(|r| (r.callback.clone(), r.context.clone()))
                .collect();
            registrations.retain(|r| !r.oneshot);
            batch
        };

        let count = batch.len();
        for (callback, context) in batch {
            callback(HookInvocation {
                point,
                origin: self.origin.clone(),
                context,
                parameters: parameters.clone(),
            })
            .await;
        }
        debug!(origin = %self.origin, hook = %point, callbacks = count, "Hook fired");
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<HookPoint, Vec<Registration>>> {
        // Callbacks never run under this lock.
        self.points.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counter(count: Arc<AtomicUsize>) -> HookCallback {
        callback(move |_| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn test_fire_runs_callbacks_in_order() {
        let registry = HookRegistry::with_points("hv@localhost", &[HookPoint::HypervisorAlloc]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = seen.clone();
            registry
                .register(
                    HookPoint::HypervisorAlloc,
                    callback(move |inv| {
                        let seen = seen.clone();
                        async move {
                            let ctx = inv.context.unwrap_or_default();
                            seen.lock().unwrap().push(ctx.as_str().unwrap().to_string());
                        }
                    }),
                    Some(json!(tag)),
                    false,
                )
                .unwrap();
        }

        assert_eq!(registry.fire(HookPoint::HypervisorAlloc, json!({})).await, 2);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_oneshot_runs_once() {
        let registry = HookRegistry::with_points("vm@localhost", &[HookPoint::VmInitialize]);
        let count = Arc::new(AtomicUsize::new(0));
        registry
            .register(HookPoint::VmInitialize, counter(count.clone()), None, true)
            .unwrap();
        registry
            .register(HookPoint::VmInitialize, counter(count.clone()), None, false)
            .unwrap();

        registry.fire(HookPoint::VmInitialize, Value::Null).await;
        registry.fire(HookPoint::VmInitialize, Value::Null).await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(registry.registered(HookPoint::VmInitialize), 1);
    }

    #[test]
    fn test_register_unknown_point() {
        let registry = HookRegistry::with_points("hv@localhost", &[HookPoint::HypervisorAlloc]);
        let result = registry.register(
            HookPoint::VmInitialize,
            counter(Arc::new(AtomicUsize::new(0))),
            None,
            false,
        );
        assert!(matches!(result, Err(Error::UnknownHook(_))));
    }

    #[test]
    fn test_unregister() {
        let registry = HookRegistry::with_points("hv@localhost", &[HookPoint::HypervisorFree]);
        let id = registry
            .register(
                HookPoint::HypervisorFree,
                counter(Arc::new(AtomicUsize::new(0))),
                None,
                false,
            )
            .unwrap();
        assert!(registry.unregister(HookPoint::HypervisorFree, id));
        assert!(!registry.unregister(HookPoint::HypervisorFree, id));
    }
}
