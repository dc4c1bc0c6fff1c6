//! Periodic liveness sweep and stats publication.
//!
//! Runs on a fixed wall-clock tick: counts down every target's liveness,
//! evicts targets that stopped reporting, lets the registry recompute its
//! aggregate from the survivors, and pushes the totals to the metrics sink.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::buffer::BufferDepth;
use crate::registry::TargetRegistry;

pub struct TemporalManager {
    registry: Arc<TargetRegistry>,
    buffer_depth: Arc<BufferDepth>,
    interval: Duration,
}

impl TemporalManager {
    pub fn new(
        registry: Arc<TargetRegistry>,
        buffer_depth: Arc<BufferDepth>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            buffer_depth,
            interval,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        info!(interval_ms = self.interval.as_millis(), "Spawning temporal manager");

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; skip so the first sweep happens a
            // full tick after startup
            tick.tick().await;

            loop {
                tick.tick().await;
                self.on_tick().await;
            }
        })
    }

    /// One sweep-and-report cycle. Failures here are operational events,
    /// never fatal.
    pub async fn on_tick(&self) {
        let evicted = self.registry.sweep().await;

        for target in &evicted {
            info!(id = %target.id(), addr = %target.addr(), "Evicted stale target");
            counter!("slotmux_targets_evicted_total").increment(1);
        }

        let aggregate = self.registry.aggregate().snapshot();
        let registered = self.registry.len().await;
        let buffered = self.buffer_depth.get();

        gauge!("slotmux_slots_idle").set(aggregate.slots_idle as f64);
        gauge!("slotmux_slots_processing").set(aggregate.slots_processing as f64);
        gauge!("slotmux_targets_registered").set(registered as f64);
        gauge!("slotmux_buffered_requests").set(buffered as f64);

        debug!(
            slots_idle = aggregate.slots_idle,
            slots_processing = aggregate.slots_processing,
            targets = registered,
            buffered,
            "Tick"
        );
    }
}
