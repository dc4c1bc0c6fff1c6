//! Reverse proxy: balances inbound requests and forwards them to the
//! chosen target.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::error;

use crate::balancer::classify;
use crate::buffer::{Admission, AdmissionOutcome};
use crate::registry::TargetRegistry;
use crate::target::Target;

/// Shared state for the proxy listener.
#[derive(Clone)]
pub struct ProxyState {
    client: Client<HttpConnector, Body>,
    admission: Arc<Admission>,
    registry: Arc<TargetRegistry>,
}

impl ProxyState {
    pub fn new(admission: Arc<Admission>, registry: Arc<TargetRegistry>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            admission,
            registry,
        }
    }
}

/// Build the proxy router: aggregated health plus a catch-all that balances
/// everything else onto the target pool.
pub fn proxy_router(state: ProxyState) -> Router {
    Router::new()
        .route("/health", get(aggregated_health))
        .fallback(proxy_handler)
        .with_state(state)
}

/// Read-only snapshot of the aggregate capacity counters.
async fn aggregated_health(State(state): State<ProxyState>) -> impl IntoResponse {
    Json(state.registry.health().await)
}

/// Axum fallback handler: classify, admit (buffering if saturated), forward.
async fn proxy_handler(State(state): State<ProxyState>, req: Request<Body>) -> Response<Body> {
    let kind = classify(req.method(), req.uri().path());

    match state.admission.acquire(kind).await {
        AdmissionOutcome::Granted(target) => {
            match forward(state.client.clone(), req, &target).await {
                Ok(response) => response,
                Err(e) => {
                    error!(id = %target.id(), error = %e, "Forwarding error");
                    error_response(StatusCode::BAD_GATEWAY, &format!("Backend error: {}", e))
                }
            }
        }
        AdmissionOutcome::NoTargets => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "No targets available")
        }
        AdmissionOutcome::Overflow => {
            error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests")
        }
        AdmissionOutcome::TimedOut => error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "Request timed out waiting for a free slot",
        ),
    }
}

async fn forward(
    client: Client<HttpConnector, Body>,
    mut req: Request<Body>,
    target: &Arc<Target>,
) -> anyhow::Result<Response<Body>> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    // Rewrite URI to the target's forwarding origin
    let origin = target.origin();
    let scheme = origin.scheme_str().unwrap_or("http");
    let authority = origin
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_default();
    let uri: Uri = format!("{scheme}://{authority}{path_and_query}").parse()?;

    *req.uri_mut() = uri;
    req.headers_mut().remove("host");

    let response = client.request(req).await?;
    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, Body::new(body)))
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "slotmux_error"
        }
    });

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}
