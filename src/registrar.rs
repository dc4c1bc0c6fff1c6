//! Turns inbound capacity reports into registry insert/update operations.
//!
//! This is the only path by which the registry gains or updates entries.
//! Removal is exclusively the temporal manager's job.

use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::registry::{RegistryError, TargetRegistry};
use crate::target::{SlotSnapshot, Target, TargetAddress};

/// Wire format of a capacity report, POSTed by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRegistration {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub addr: TargetAddress,
    pub snapshot: SlotSnapshot,
}

pub struct Registrar {
    registry: Arc<TargetRegistry>,
    liveness_ticks: i64,
}

impl Registrar {
    pub fn new(registry: Arc<TargetRegistry>, liveness_ticks: i64) -> Self {
        Self {
            registry,
            liveness_ticks,
        }
    }

    /// Register a previously-unseen target or apply the report to an
    /// existing one. Targets are identified by id, so an address change in
    /// a report rebinds the forwarding handle instead of duplicating the
    /// target.
    pub async fn register_or_update(&self, registration: TargetRegistration) -> anyhow::Result<()> {
        let TargetRegistration {
            id,
            name,
            addr,
            snapshot,
        } = registration;

        if let Some(existing) = self.registry.get(&id).await {
            if existing.addr() != addr {
                debug!(id = %id, addr = %addr, "Target address changed, rebinding");
                existing
                    .rebind(addr)
                    .with_context(|| format!("Failed to rebind target {id}"))?;
            }
            self.registry.apply_report(&existing, snapshot).await;
            return Ok(());
        }

        debug!(id = %id, addr = %addr, "Registering target");

        let target = Arc::new(
            Target::new(id.clone(), name, addr, snapshot.clone(), self.liveness_ticks)
                .with_context(|| format!("Failed to create target {id}"))?,
        );

        match self.registry.register(Arc::clone(&target)).await {
            Ok(()) => Ok(()),
            Err(RegistryError::DuplicateTarget(_)) => {
                // lost a registration race between lookup and insert; the
                // report still counts as an update
                warn!(id = %id, "Concurrent registration, applying as update");
                if let Some(existing) = self.registry.get(&id).await {
                    self.registry.apply_report(&existing, snapshot).await;
                }
                Ok(())
            }
        }
    }
}
