//! A single backend inference server and its live capacity state.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;

use axum::http::Uri;

/// Last reported health of a target, as sent by its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Ok,
    Loading,
    NoSlots,
    Error,
}

/// Capacity snapshot reported for a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub status: TargetStatus,
    pub slots_idle: usize,
    pub slots_processing: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SlotSnapshot {
    pub fn ok(slots_idle: usize, slots_processing: usize) -> Self {
        Self {
            status: TargetStatus::Ok,
            slots_idle,
            slots_processing,
            error_message: None,
        }
    }
}

/// Network address of a backend server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAddress {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

fn default_scheme() -> String {
    "http".to_string()
}

impl TargetAddress {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl std::fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base_url())
    }
}

/// Reusable forwarding destination bound to a target's address.
#[derive(Debug, Clone)]
pub struct ForwardingHandle {
    pub addr: TargetAddress,
    pub origin: Uri,
}

impl ForwardingHandle {
    pub fn bind(addr: TargetAddress) -> anyhow::Result<Self> {
        let origin: Uri = addr.base_url().parse()?;
        Ok(Self { addr, origin })
    }
}

/// Serializable view of a target, exposed by the management API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInfo {
    pub id: String,
    pub name: String,
    pub addr: TargetAddress,
    pub snapshot: SlotSnapshot,
    pub last_update: SystemTime,
    pub total_updates: u64,
}

/// One backend inference server.
///
/// Identity is id-based: an update for a known id with a new address rebinds
/// the forwarding handle rather than creating a second target. The snapshot
/// sits behind its own lock so a capacity report racing a tick decrement
/// cannot interleave into a torn read; the liveness countdown is an atomic
/// touched by the temporal sweep.
pub struct Target {
    id: String,
    name: String,
    forwarding: RwLock<ForwardingHandle>,
    snapshot: Mutex<SlotSnapshot>,
    remaining_ticks: AtomicI64,
    liveness_ticks: i64,
    last_update: Mutex<SystemTime>,
    total_updates: AtomicU64,
}

impl Target {
    pub fn new(
        id: String,
        name: String,
        addr: TargetAddress,
        snapshot: SlotSnapshot,
        liveness_ticks: i64,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            id,
            name,
            forwarding: RwLock::new(ForwardingHandle::bind(addr)?),
            snapshot: Mutex::new(snapshot),
            remaining_ticks: AtomicI64::new(liveness_ticks),
            liveness_ticks,
            last_update: Mutex::new(SystemTime::now()),
            total_updates: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> TargetAddress {
        self.forwarding.read().unwrap().addr.clone()
    }

    /// Base URI requests to this target are forwarded to.
    pub fn origin(&self) -> Uri {
        self.forwarding.read().unwrap().origin.clone()
    }

    /// Rebind the forwarding handle after an address change.
    pub fn rebind(&self, addr: TargetAddress) -> anyhow::Result<()> {
        let handle = ForwardingHandle::bind(addr)?;
        *self.forwarding.write().unwrap() = handle;
        Ok(())
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        self.snapshot.lock().unwrap().clone()
    }

    pub fn slots_idle(&self) -> usize {
        self.snapshot.lock().unwrap().slots_idle
    }

    pub fn slots_processing(&self) -> usize {
        self.snapshot.lock().unwrap().slots_processing
    }

    pub fn last_update(&self) -> SystemTime {
        *self.last_update.lock().unwrap()
    }

    pub fn total_updates(&self) -> u64 {
        self.total_updates.load(Ordering::Relaxed)
    }

    /// Move one slot from idle to processing. Returns `false` without
    /// mutating anything if no idle slot remains, so counters can never
    /// go negative.
    pub fn try_consume_slot(&self) -> bool {
        let mut snapshot = self.snapshot.lock().unwrap();
        if snapshot.slots_idle < 1 {
            return false;
        }
        snapshot.slots_idle -= 1;
        snapshot.slots_processing += 1;
        true
    }

    /// Replace the capacity snapshot with a fresh report and refresh the
    /// liveness countdown. Returns the signed (idle, processing) delta
    /// against the previous snapshot.
    pub fn apply_report(&self, snapshot: SlotSnapshot) -> (i64, i64) {
        let (delta_idle, delta_processing) = {
            let mut current = self.snapshot.lock().unwrap();
            let delta = (
                snapshot.slots_idle as i64 - current.slots_idle as i64,
                snapshot.slots_processing as i64 - current.slots_processing as i64,
            );
            *current = snapshot;
            delta
        };

        self.remaining_ticks
            .store(self.liveness_ticks, Ordering::SeqCst);
        *self.last_update.lock().unwrap() = SystemTime::now();
        self.total_updates.fetch_add(1, Ordering::Relaxed);

        (delta_idle, delta_processing)
    }

    /// Count down one liveness tick and return the remaining value.
    pub fn tick(&self) -> i64 {
        self.remaining_ticks.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn remaining_ticks(&self) -> i64 {
        self.remaining_ticks.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> TargetInfo {
        TargetInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            addr: self.addr(),
            snapshot: self.snapshot(),
            last_update: self.last_update(),
            total_updates: self.total_updates(),
        }
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("addr", &self.addr())
            .field("snapshot", &self.snapshot())
            .field("remaining_ticks", &self.remaining_ticks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_target(idle: usize) -> Target {
        Target::new(
            "t1".to_string(),
            "target-1".to_string(),
            TargetAddress {
                scheme: "http".to_string(),
                host: "127.0.0.1".to_string(),
                port: 8081,
            },
            SlotSnapshot::ok(idle, 0),
            3,
        )
        .unwrap()
    }

    #[test]
    fn test_consume_slot_moves_one_unit() {
        let target = test_target(4);

        assert!(target.try_consume_slot());
        assert_eq!(target.slots_idle(), 3);
        assert_eq!(target.slots_processing(), 1);
    }

    #[test]
    fn test_consume_slot_refuses_when_empty() {
        let target = test_target(0);

        assert!(!target.try_consume_slot());
        assert_eq!(target.slots_idle(), 0);
        assert_eq!(target.slots_processing(), 0);
    }

    #[test]
    fn test_apply_report_returns_signed_delta() {
        let target = test_target(4);
        target.try_consume_slot();

        let (delta_idle, delta_processing) = target.apply_report(SlotSnapshot::ok(8, 0));
        assert_eq!(delta_idle, 5);
        assert_eq!(delta_processing, -1);
        assert_eq!(target.slots_idle(), 8);
        assert_eq!(target.total_updates(), 2);
    }

    #[test]
    fn test_report_resets_liveness() {
        let target = test_target(4);

        assert_eq!(target.tick(), 2);
        assert_eq!(target.tick(), 1);
        target.apply_report(SlotSnapshot::ok(4, 0));
        assert_eq!(target.remaining_ticks(), 3);
    }

    #[test]
    fn test_rebind_changes_origin() {
        let target = test_target(4);

        target
            .rebind(TargetAddress {
                scheme: "http".to_string(),
                host: "10.0.0.5".to_string(),
                port: 9000,
            })
            .unwrap();

        assert_eq!(target.origin().to_string(), "http://10.0.0.5:9000/");
    }

    #[test]
    fn test_snapshot_serde_wire_format() {
        let snapshot: SlotSnapshot =
            serde_json::from_str(r#"{"status": "ok", "slots_idle": 4, "slots_processing": 1}"#)
                .unwrap();
        assert_eq!(snapshot.status, TargetStatus::Ok);
        assert_eq!(snapshot.slots_idle, 4);
        assert_eq!(snapshot.error_message, None);

        let err: SlotSnapshot = serde_json::from_str(
            r#"{"status": "error", "slots_idle": 0, "slots_processing": 0, "error_message": "oom"}"#,
        )
        .unwrap();
        assert_eq!(err.status, TargetStatus::Error);
        assert_eq!(err.error_message.as_deref(), Some("oom"));
    }
}
