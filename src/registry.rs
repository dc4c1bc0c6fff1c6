//! Capacity-ordered target registry.
//!
//! The registry keeps targets sorted descending by idle-slot count so the
//! balancer can answer "who has the most capacity" from the head in O(1),
//! with an id index for report arrival and running aggregate counters.
//! Slot consumption changes capacity by one unit, so restoring order after
//! it only needs neighbor comparisons; an external report can move a target
//! arbitrarily far and re-inserts it instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::target::{Target, TargetInfo, TargetStatus};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("target already registered: {0}")]
    DuplicateTarget(String),
}

/// Running idle/processing totals across all live targets.
///
/// Maintained incrementally on register/consume/report/remove and recomputed
/// from scratch on every temporal sweep, which corrects any drift from
/// concurrent partial updates. Owned by the registry; never a global.
#[derive(Default)]
pub struct Aggregate {
    slots_idle: AtomicI64,
    slots_processing: AtomicI64,
}

impl Aggregate {
    fn add(&self, delta_idle: i64, delta_processing: i64) {
        self.slots_idle.fetch_add(delta_idle, Ordering::SeqCst);
        self.slots_processing
            .fetch_add(delta_processing, Ordering::SeqCst);
    }

    fn set(&self, slots_idle: i64, slots_processing: i64) {
        self.slots_idle.store(slots_idle, Ordering::SeqCst);
        self.slots_processing
            .store(slots_processing, Ordering::SeqCst);
    }

    pub fn slots_idle(&self) -> i64 {
        self.slots_idle.load(Ordering::SeqCst)
    }

    pub fn slots_processing(&self) -> i64 {
        self.slots_processing.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        AggregateSnapshot {
            status: TargetStatus::Ok,
            slots_idle: self.slots_idle().max(0) as u64,
            slots_processing: self.slots_processing().max(0) as u64,
        }
    }
}

/// JSON body of the aggregated health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateSnapshot {
    pub status: TargetStatus,
    pub slots_idle: u64,
    pub slots_processing: u64,
}

struct RegistryInner {
    /// Descending by idle-slot count; ties keep insertion order.
    order: Vec<Arc<Target>>,
    by_id: HashMap<String, Arc<Target>>,
}

pub struct TargetRegistry {
    inner: RwLock<RegistryInner>,
    aggregate: Aggregate,
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                order: Vec::new(),
                by_id: HashMap::new(),
            }),
            aggregate: Aggregate::default(),
        }
    }

    pub fn aggregate(&self) -> &Aggregate {
        &self.aggregate
    }

    /// Aggregate health as served to clients. A pool that has targets but
    /// no idle slot reports `NoSlots`; an empty pool reports `Ok` with
    /// zeroed counters.
    pub async fn health(&self) -> AggregateSnapshot {
        let mut snapshot = self.aggregate.snapshot();
        if snapshot.slots_idle == 0 && !self.inner.read().await.order.is_empty() {
            snapshot.status = TargetStatus::NoSlots;
        }
        snapshot
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.order.is_empty()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Target>> {
        self.inner.read().await.by_id.get(id).cloned()
    }

    /// The target with the most idle slots, or `None` when empty.
    pub async fn head(&self) -> Option<Arc<Target>> {
        self.inner.read().await.order.first().cloned()
    }

    pub async fn infos(&self) -> Vec<TargetInfo> {
        self.inner
            .read()
            .await
            .order
            .iter()
            .map(|target| target.info())
            .collect()
    }

    /// Insert a new target in capacity order and add it to the aggregate.
    pub async fn register(&self, target: Arc<Target>) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;

        if inner.by_id.contains_key(target.id()) {
            return Err(RegistryError::DuplicateTarget(target.id().to_string()));
        }

        let snapshot = target.snapshot();
        let at = inner
            .order
            .partition_point(|t| t.slots_idle() >= snapshot.slots_idle);
        inner.order.insert(at, Arc::clone(&target));
        inner
            .by_id
            .insert(target.id().to_string(), Arc::clone(&target));

        self.aggregate.add(
            snapshot.slots_idle as i64,
            snapshot.slots_processing as i64,
        );

        debug!(id = %target.id(), slots_idle = snapshot.slots_idle, "Registered target");
        Ok(())
    }

    /// Atomically move one slot from idle to processing on `target`, adjust
    /// the aggregate, and restore ordering.
    ///
    /// Returns `false` (no mutation anywhere) if the target has no idle slot
    /// left or is no longer registered. The capacity change is exactly one
    /// unit, so re-ordering bubbles toward the tail only.
    pub async fn consume_slot(&self, target: &Arc<Target>) -> bool {
        let mut inner = self.inner.write().await;

        let Some(mut at) = inner.order.iter().position(|t| Arc::ptr_eq(t, target)) else {
            return false;
        };

        if !target.try_consume_slot() {
            return false;
        }

        self.aggregate.add(-1, 1);

        while at + 1 < inner.order.len()
            && inner.order[at + 1].slots_idle() > inner.order[at].slots_idle()
        {
            inner.order.swap(at, at + 1);
            at += 1;
        }

        true
    }

    /// Replace a target's capacity snapshot from a fresh report.
    ///
    /// Resets the liveness countdown, adjusts the aggregate by the signed
    /// delta, and re-inserts the target at its new position (a report can
    /// move it anywhere in the order).
    pub async fn apply_report(&self, target: &Arc<Target>, snapshot: crate::target::SlotSnapshot) {
        let mut inner = self.inner.write().await;

        let (delta_idle, delta_processing) = target.apply_report(snapshot);
        self.aggregate.add(delta_idle, delta_processing);

        if let Some(at) = inner.order.iter().position(|t| Arc::ptr_eq(t, target)) {
            inner.order.remove(at);
            let slots_idle = target.slots_idle();
            let new_at = inner.order.partition_point(|t| t.slots_idle() >= slots_idle);
            inner.order.insert(new_at, Arc::clone(target));
        }
    }

    /// Delete a target from both structures and subtract its last-known
    /// capacity from the aggregate.
    pub async fn remove(&self, id: &str) -> Option<Arc<Target>> {
        let mut inner = self.inner.write().await;
        let target = inner.by_id.remove(id)?;

        if let Some(at) = inner.order.iter().position(|t| Arc::ptr_eq(t, &target)) {
            inner.order.remove(at);
        }

        let snapshot = target.snapshot();
        self.aggregate.add(
            -(snapshot.slots_idle as i64),
            -(snapshot.slots_processing as i64),
        );

        Some(target)
    }

    /// One liveness pass: count down every target, evict the ones that
    /// exhausted their countdown, and recompute the aggregate from the
    /// survivors. Removal is deferred until the iteration completes.
    ///
    /// Returns the evicted targets.
    pub async fn sweep(&self) -> Vec<Arc<Target>> {
        let mut inner = self.inner.write().await;

        let mut stale_ids = Vec::new();
        for target in &inner.order {
            if target.tick() < 1 {
                stale_ids.push(target.id().to_string());
            }
        }

        let mut evicted = Vec::with_capacity(stale_ids.len());
        for id in &stale_ids {
            if let Some(target) = inner.by_id.remove(id) {
                if let Some(at) = inner.order.iter().position(|t| Arc::ptr_eq(t, &target)) {
                    inner.order.remove(at);
                }
                evicted.push(target);
            }
        }

        let mut slots_idle = 0i64;
        let mut slots_processing = 0i64;
        for target in &inner.order {
            let snapshot = target.snapshot();
            slots_idle += snapshot.slots_idle as i64;
            slots_processing += snapshot.slots_processing as i64;
        }
        self.aggregate.set(slots_idle, slots_processing);

        evicted
    }

    #[cfg(test)]
    pub async fn ordered_idle_counts(&self) -> Vec<usize> {
        self.inner
            .read()
            .await
            .order
            .iter()
            .map(|t| t.slots_idle())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{SlotSnapshot, TargetAddress};

    fn test_target(id: &str, idle: usize) -> Arc<Target> {
        Arc::new(
            Target::new(
                id.to_string(),
                format!("{id}-name"),
                TargetAddress {
                    scheme: "http".to_string(),
                    host: "127.0.0.1".to_string(),
                    port: 8081,
                },
                SlotSnapshot::ok(idle, 0),
                3,
            )
            .unwrap(),
        )
    }

    async fn assert_order_invariant(registry: &TargetRegistry) {
        let counts = registry.ordered_idle_counts().await;
        for pair in counts.windows(2) {
            assert!(
                pair[0] >= pair[1],
                "order must be non-increasing by idle slots: {counts:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_register_orders_by_idle_slots() {
        let registry = TargetRegistry::new();

        registry.register(test_target("b", 8)).await.unwrap();
        registry.register(test_target("a", 10)).await.unwrap();
        registry.register(test_target("c", 3)).await.unwrap();

        assert_eq!(registry.len().await, 3);
        assert_eq!(registry.head().await.unwrap().id(), "a");
        assert_eq!(registry.aggregate().slots_idle(), 21);
        assert_order_invariant(&registry).await;
    }

    #[tokio::test]
    async fn test_register_duplicate_fails() {
        let registry = TargetRegistry::new();

        registry.register(test_target("a", 4)).await.unwrap();
        let err = registry.register(test_target("a", 4)).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTarget(id) if id == "a"));
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.aggregate().slots_idle(), 4);
    }

    #[tokio::test]
    async fn test_consume_slot_adjusts_target_and_aggregate() {
        let registry = TargetRegistry::new();
        let a = test_target("a", 4);
        registry.register(Arc::clone(&a)).await.unwrap();
        registry.register(test_target("b", 4)).await.unwrap();
        registry.register(test_target("c", 4)).await.unwrap();

        assert!(registry.consume_slot(&a).await);

        assert_eq!(a.slots_idle(), 3);
        assert_eq!(a.slots_processing(), 1);
        assert_eq!(registry.aggregate().slots_idle(), 11);
        assert_eq!(registry.aggregate().slots_processing(), 1);
        // other targets untouched
        assert_eq!(registry.get("b").await.unwrap().slots_idle(), 4);
        assert_eq!(registry.get("c").await.unwrap().slots_idle(), 4);
        // head moved off the consumed target
        assert_ne!(registry.head().await.unwrap().id(), "a");
        assert_order_invariant(&registry).await;
    }

    #[tokio::test]
    async fn test_consume_slot_refuses_at_zero() {
        let registry = TargetRegistry::new();
        let a = test_target("a", 1);
        registry.register(Arc::clone(&a)).await.unwrap();

        assert!(registry.consume_slot(&a).await);
        assert!(!registry.consume_slot(&a).await);
        assert_eq!(a.slots_idle(), 0);
        assert_eq!(registry.aggregate().slots_idle(), 0);
        assert_eq!(registry.aggregate().slots_processing(), 1);
    }

    #[tokio::test]
    async fn test_consume_slot_on_removed_target_is_noop() {
        let registry = TargetRegistry::new();
        let a = test_target("a", 4);
        registry.register(Arc::clone(&a)).await.unwrap();
        registry.remove("a").await.unwrap();

        assert!(!registry.consume_slot(&a).await);
        assert_eq!(a.slots_idle(), 4);
    }

    #[tokio::test]
    async fn test_health_status_reflects_saturation() {
        let registry = TargetRegistry::new();
        assert_eq!(registry.health().await.status, TargetStatus::Ok);

        let a = test_target("a", 1);
        registry.register(Arc::clone(&a)).await.unwrap();
        assert_eq!(registry.health().await.status, TargetStatus::Ok);

        registry.consume_slot(&a).await;
        let health = registry.health().await;
        assert_eq!(health.status, TargetStatus::NoSlots);
        assert_eq!(health.slots_idle, 0);
        assert_eq!(health.slots_processing, 1);

        registry.remove("a").await;
        assert_eq!(registry.health().await.status, TargetStatus::Ok);
    }

    #[tokio::test]
    async fn test_report_moves_target_to_head() {
        let registry = TargetRegistry::new();
        let a = test_target("a", 10);
        let b = test_target("b", 8);
        registry.register(Arc::clone(&a)).await.unwrap();
        registry.register(Arc::clone(&b)).await.unwrap();

        registry.apply_report(&b, SlotSnapshot::ok(11, 0)).await;

        assert_eq!(registry.head().await.unwrap().id(), "b");
        assert_eq!(registry.aggregate().slots_idle(), 21);
        assert_order_invariant(&registry).await;
    }

    #[tokio::test]
    async fn test_report_can_reduce_aggregate() {
        let registry = TargetRegistry::new();
        let a = test_target("a", 10);
        registry.register(Arc::clone(&a)).await.unwrap();

        registry.apply_report(&a, SlotSnapshot::ok(2, 3)).await;

        assert_eq!(registry.aggregate().slots_idle(), 2);
        assert_eq!(registry.aggregate().slots_processing(), 3);
    }

    #[tokio::test]
    async fn test_remove_deletes_from_both_structures() {
        let registry = TargetRegistry::new();
        registry.register(test_target("a", 10)).await.unwrap();
        registry.register(test_target("b", 8)).await.unwrap();

        registry.remove("a").await.unwrap();

        assert_eq!(registry.len().await, 1);
        assert!(registry.get("a").await.is_none());
        assert_eq!(registry.head().await.unwrap().id(), "b");
        assert_eq!(registry.aggregate().slots_idle(), 8);
    }

    #[tokio::test]
    async fn test_sweep_evicts_after_exact_countdown() {
        let registry = TargetRegistry::new();
        let a = test_target("a", 4);
        registry.register(Arc::clone(&a)).await.unwrap();

        assert!(registry.sweep().await.is_empty());
        assert!(registry.sweep().await.is_empty());
        let evicted = registry.sweep().await;

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id(), "a");
        assert!(registry.is_empty().await);
        assert_eq!(registry.aggregate().slots_idle(), 0);
    }

    #[tokio::test]
    async fn test_report_resets_sweep_countdown() {
        let registry = TargetRegistry::new();
        let a = test_target("a", 4);
        registry.register(Arc::clone(&a)).await.unwrap();

        registry.sweep().await;
        registry.sweep().await;
        registry.apply_report(&a, SlotSnapshot::ok(4, 0)).await;

        // countdown starts over: two more silent ticks survive, third evicts
        assert!(registry.sweep().await.is_empty());
        assert!(registry.sweep().await.is_empty());
        assert_eq!(registry.sweep().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_recomputes_aggregate_from_survivors() {
        let registry = TargetRegistry::new();
        let a = test_target("a", 4);
        let b = test_target("b", 2);
        registry.register(Arc::clone(&a)).await.unwrap();
        registry.register(Arc::clone(&b)).await.unwrap();

        // drift the aggregate on purpose
        registry.aggregate().set(100, 100);

        registry.apply_report(&a, SlotSnapshot::ok(4, 0)).await;
        registry.apply_report(&b, SlotSnapshot::ok(2, 1)).await;
        registry.sweep().await;

        assert_eq!(registry.aggregate().slots_idle(), 6);
        assert_eq!(registry.aggregate().slots_processing(), 1);
    }

    #[tokio::test]
    async fn test_head_tracks_consumption_and_reports() {
        let registry = TargetRegistry::new();
        let a = test_target("a", 10);
        let b = test_target("b", 8);
        registry.register(Arc::clone(&a)).await.unwrap();
        registry.register(Arc::clone(&b)).await.unwrap();

        assert_eq!(registry.head().await.unwrap().id(), "a");

        // first two consumptions keep A at the head (9 > 8, 8 == 8 keeps
        // stable order), the third drops it below B
        registry.consume_slot(&a).await;
        registry.consume_slot(&a).await;
        assert_eq!(registry.head().await.unwrap().id(), "a");
        registry.consume_slot(&a).await;
        assert_eq!(registry.head().await.unwrap().id(), "b");

        for _ in 0..6 {
            registry.consume_slot(&a).await;
        }
        assert_eq!(a.slots_idle(), 1);
        assert_eq!(registry.head().await.unwrap().id(), "b");

        registry.apply_report(&b, SlotSnapshot::ok(11, 0)).await;
        assert_eq!(registry.head().await.unwrap().id(), "b");
        assert_order_invariant(&registry).await;
    }

    #[tokio::test]
    async fn test_aggregate_matches_sum_after_mixed_operations() {
        let registry = TargetRegistry::new();
        let a = test_target("a", 5);
        let b = test_target("b", 7);
        let c = test_target("c", 1);
        for target in [&a, &b, &c] {
            registry.register(Arc::clone(target)).await.unwrap();
        }

        registry.consume_slot(&b).await;
        registry.apply_report(&a, SlotSnapshot::ok(9, 2)).await;
        registry.remove("c").await;
        registry.consume_slot(&a).await;

        let infos = registry.infos().await;
        let sum_idle: u64 = infos.iter().map(|i| i.snapshot.slots_idle as u64).sum();
        let sum_processing: u64 = infos
            .iter()
            .map(|i| i.snapshot.slots_processing as u64)
            .sum();

        assert_eq!(registry.aggregate().slots_idle() as u64, sum_idle);
        assert_eq!(registry.aggregate().slots_processing() as u64, sum_processing);
        assert_order_invariant(&registry).await;
    }
}
