//! Request admission and buffering.
//!
//! Capacity-sensitive requests that hit a saturated pool are parked in a
//! bounded buffer and retried on a fixed interval instead of failing
//! outright. A request with no targets at all fails immediately; there is
//! nothing to wait for.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::balancer::{BalanceError, Balancer, RequestKind};
use crate::target::Target;

/// Number of requests currently parked in the buffer. Published by the
/// temporal manager on every tick.
#[derive(Default)]
pub struct BufferDepth(AtomicUsize);

impl BufferDepth {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Terminal result a buffered request is completed with.
enum BufferOutcome {
    Granted(Arc<Target>),
    NoTargets,
    Overflow,
}

/// A parked capacity-sensitive request.
///
/// The oneshot sender is consumed by the terminal transition, so a request
/// can be completed at most once; a request whose receiver is gone (caller
/// disconnected or timed out) is dropped by the drain cycle without a
/// response attempt.
struct BufferedRequest {
    responder: oneshot::Sender<BufferOutcome>,
    deadline: Instant,
}

/// Bounded handoff into the drain processor.
#[derive(Clone)]
struct RequestBuffer {
    tx: mpsc::Sender<BufferedRequest>,
    depth: Arc<BufferDepth>,
}

impl RequestBuffer {
    fn new(capacity: usize) -> (Self, mpsc::Receiver<BufferedRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                depth: Arc::new(BufferDepth::default()),
            },
            rx,
        )
    }

    /// Non-blocking insert: tests capacity and either parks the request or
    /// hands it back on overflow.
    fn try_enqueue(&self, request: BufferedRequest) -> Result<(), BufferedRequest> {
        match self.tx.try_send(request) {
            Ok(()) => {
                self.depth.increment();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(request))
            | Err(mpsc::error::TrySendError::Closed(request)) => Err(request),
        }
    }
}

/// How an admission attempt ended, mapped to a response by the proxy layer.
#[derive(Debug)]
pub enum AdmissionOutcome {
    /// A target was selected (and a slot consumed, for slottable requests).
    Granted(Arc<Target>),
    /// Registry empty; respond service-unavailable immediately.
    NoTargets,
    /// Buffer full; respond too-many-requests immediately.
    Overflow,
    /// Buffered but no capacity appeared before the deadline.
    TimedOut,
}

/// Admission gate in front of the balancer.
pub struct Admission {
    balancer: Balancer,
    buffer: RequestBuffer,
    buffer_timeout: Duration,
}

impl Admission {
    /// Build the admission gate and the receiving end its drain processor
    /// consumes from.
    pub fn new(
        balancer: Balancer,
        buffer_capacity: usize,
        buffer_timeout: Duration,
    ) -> (Self, DrainProcessor) {
        let (buffer, rx) = RequestBuffer::new(buffer_capacity);
        let drain = DrainProcessor {
            balancer: balancer.clone(),
            buffer: buffer.clone(),
            rx,
            interval: Duration::from_secs(1),
        };

        (
            Self {
                balancer,
                buffer,
                buffer_timeout,
            },
            drain,
        )
    }

    pub fn buffer_depth(&self) -> Arc<BufferDepth> {
        Arc::clone(&self.buffer.depth)
    }

    /// Balance the request, parking it in the buffer when the pool is
    /// saturated.
    ///
    /// The wait ends on whichever fires first: the buffered attempt
    /// completing, the caller disconnecting (this future being dropped), or
    /// the buffer timeout elapsing.
    pub async fn acquire(&self, kind: RequestKind) -> AdmissionOutcome {
        match self.balancer.balance(kind).await {
            Ok(target) => return AdmissionOutcome::Granted(target),
            Err(BalanceError::NoTargetsAvailable) => return AdmissionOutcome::NoTargets,
            Err(BalanceError::NoSlotsAvailable) => {}
        }

        let (responder, outcome_rx) = oneshot::channel();
        let buffered = BufferedRequest {
            responder,
            deadline: Instant::now() + self.buffer_timeout,
        };

        if self.buffer.try_enqueue(buffered).is_err() {
            debug!("Request buffer full, rejecting");
            return AdmissionOutcome::Overflow;
        }

        counter!("slotmux_requests_buffered_total").increment(1);
        trace!(depth = self.buffer.depth.get(), "Request buffered");

        match tokio::time::timeout(self.buffer_timeout, outcome_rx).await {
            Ok(Ok(BufferOutcome::Granted(target))) => AdmissionOutcome::Granted(target),
            Ok(Ok(BufferOutcome::NoTargets)) => AdmissionOutcome::NoTargets,
            Ok(Ok(BufferOutcome::Overflow)) => AdmissionOutcome::Overflow,
            // sender dropped without completing: the drain discarded an
            // expired request, which only happens past our own deadline
            Ok(Err(_)) => AdmissionOutcome::TimedOut,
            Err(_) => AdmissionOutcome::TimedOut,
        }
    }
}

/// Background task that retries buffered requests on a fixed interval, one
/// request per cycle.
pub struct DrainProcessor {
    balancer: Balancer,
    buffer: RequestBuffer,
    rx: mpsc::Receiver<BufferedRequest>,
    interval: Duration,
}

impl DrainProcessor {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        info!(interval_ms = self.interval.as_millis(), "Spawning buffer drain");

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tick.tick().await;
                self.drain_one().await;
            }
        })
    }

    async fn drain_one(&mut self) {
        let Ok(buffered) = self.rx.try_recv() else {
            return;
        };
        self.buffer.depth.decrement();

        if buffered.responder.is_closed() {
            trace!("Dropping buffered request with no waiter");
            return;
        }
        if Instant::now() >= buffered.deadline {
            // the caller's own timeout handling fires independently
            trace!("Dropping expired buffered request");
            return;
        }

        match self.balancer.balance(RequestKind::Slottable).await {
            Ok(target) => {
                debug!(id = %target.id(), "Buffered request granted a slot");
                let _ = buffered.responder.send(BufferOutcome::Granted(target));
            }
            Err(BalanceError::NoTargetsAvailable) => {
                let _ = buffered.responder.send(BufferOutcome::NoTargets);
            }
            Err(BalanceError::NoSlotsAvailable) => {
                // still saturated; back into the buffer for the next cycle
                if let Err(request) = self.buffer.try_enqueue(buffered) {
                    let _ = request.responder.send(BufferOutcome::Overflow);
                }
            }
        }
    }
}
