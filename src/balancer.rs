//! Target selection for inbound requests.

use std::sync::Arc;

use axum::http::Method;

use crate::registry::TargetRegistry;
use crate::target::Target;

/// Balancing failures that are part of normal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BalanceError {
    /// The registry is empty. Terminal; there is nothing to wait for.
    #[error("no targets available")]
    NoTargetsAvailable,

    /// Targets exist but the most idle one is saturated. Retryable via
    /// buffering.
    #[error("no slots available")]
    NoSlotsAvailable,
}

/// Whether a request consumes a processing slot on its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Completion-generating request; occupies a slot for its duration.
    Slottable,
    /// Plain passthrough (health probes, model listing, tokenize, ...);
    /// bypasses capacity accounting entirely.
    Passthrough,
}

/// Paths whose POST requests occupy an inference slot: llama.cpp's native
/// completion endpoints plus the OpenAI-compatible routes.
const SLOTTABLE_PATHS: &[&str] = &[
    "/completion",
    "/completions",
    "/infill",
    "/v1/completions",
    "/v1/chat/completions",
];

/// Classify a request by method and path.
pub fn classify(method: &Method, path: &str) -> RequestKind {
    if method == Method::POST && SLOTTABLE_PATHS.contains(&path) {
        RequestKind::Slottable
    } else {
        RequestKind::Passthrough
    }
}

/// Picks the head target for a request and consumes a slot when the request
/// needs one. Selection itself has no side effect; slot consumption is the
/// only mutation.
#[derive(Clone)]
pub struct Balancer {
    registry: Arc<TargetRegistry>,
}

impl Balancer {
    pub fn new(registry: Arc<TargetRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    pub async fn balance(&self, kind: RequestKind) -> Result<Arc<Target>, BalanceError> {
        let head = self
            .registry
            .head()
            .await
            .ok_or(BalanceError::NoTargetsAvailable)?;

        match kind {
            RequestKind::Passthrough => Ok(head),
            RequestKind::Slottable => {
                // consume_slot re-checks idle count under the write lock, so
                // of two requests racing for the same head at one remaining
                // slot, at most one wins.
                if self.registry.consume_slot(&head).await {
                    Ok(head)
                } else {
                    Err(BalanceError::NoSlotsAvailable)
                }
            }
        }
    }
}
