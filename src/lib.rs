//! # slotmux
//!
//! Slot-aware load balancer and admission controller for LLM inference
//! servers. Each backend ("target") exposes a small number of concurrent
//! processing slots; slotmux routes every inference request to the target
//! with the most idle slots, keeps capacity accounting consistent without
//! querying targets synchronously, evicts targets that stop reporting, and
//! buffers requests when the whole pool is saturated.
//!
//! ## Architecture
//!
//! ```text
//! agents ──POST /api/targets──▶ Registrar ─▶ TargetRegistry ◀─ TemporalManager
//! (capacity reports)                         (capacity-ordered,  (liveness sweep,
//!                                             aggregate)          stats publication)
//!                                                  ▲
//! clients ──▶ proxy ──▶ Admission ──▶ Balancer ────┘
//!             (axum)    (bounded buffer,  (head pick +
//!                        drain retries)    slot consume)
//!                              │
//!                              ▼
//!                     forward to target origin
//! ```

mod balancer;
mod buffer;
mod config;
mod management;
mod proxy;
mod registrar;
mod registry;
mod target;
mod telemetry;
mod temporal;

pub use balancer::{classify, BalanceError, Balancer, RequestKind};
pub use buffer::{Admission, AdmissionOutcome, BufferDepth, DrainProcessor};
pub use config::Config;
pub use management::{management_router, ManagementState};
pub use proxy::{proxy_router, ProxyState};
pub use registrar::{Registrar, TargetRegistration};
pub use registry::{AggregateSnapshot, RegistryError, TargetRegistry};
pub use target::{SlotSnapshot, Target, TargetAddress, TargetInfo, TargetStatus};

use anyhow::Result;
use std::sync::Arc;
use temporal::TemporalManager;
use tracing::info;

/// Build the complete slotmux stack.
///
/// Spawns the temporal manager and the buffer drain processor, and returns:
/// - the proxy router (balanced inference traffic + `/health`)
/// - an optional metrics router (when `config.metrics_port > 0`)
/// - the management router (agent registration, served on the management port)
pub fn build_app(config: &Config) -> Result<(axum::Router, Option<axum::Router>, axum::Router)> {
    info!(
        buffer_capacity = config.buffer_capacity,
        liveness_ticks = config.liveness_ticks,
        "Building slotmux"
    );

    let registry = Arc::new(TargetRegistry::new());
    let balancer = Balancer::new(Arc::clone(&registry));
    let registrar = Arc::new(Registrar::new(Arc::clone(&registry), config.liveness_ticks));

    let (admission, drain) = Admission::new(balancer, config.buffer_capacity, config.buffer_timeout());
    let admission = Arc::new(admission);
    let _drain_handle = drain.with_interval(config.drain_interval()).spawn();

    let _temporal_handle = TemporalManager::new(
        Arc::clone(&registry),
        admission.buffer_depth(),
        config.tick_interval(),
    )
    .spawn();

    let app = proxy_router(ProxyState::new(Arc::clone(&admission), Arc::clone(&registry)));

    let management = management_router(ManagementState {
        registrar,
        registry,
    });

    let metrics_router = if config.metrics_port > 0 {
        telemetry::install().map(telemetry::metrics_router)
    } else {
        None
    };

    Ok((app, metrics_router, management))
}
