//! Federation interception: the callback server the intercepting proxy
//! posts every homeserver-to-homeserver request to, and the partition
//! policy applied to each one.
//!
//! While the partition gate is up, federation requests are failed at the
//! proxy with a 504 — except `/.well-known/matrix/server` lookups, which
//! are always allowed. Homeservers cache well-known responses in memory
//! with a hard-coded 2-minute retry on failure, so partitioning them turns
//! a restart during a netsplit into a pathological stall. The partition is
//! knowingly leaky there.

use crate::bus::BusServer;
use crate::HarnessError;
use havoc_proto::{FederationRequestPayload, Payload};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use warp::http::StatusCode;
use warp::Filter;

const WELL_KNOWN_SUFFIX: &str = "/.well-known/matrix/server";

/// What the proxy tells us about an intercepted request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackData {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub response_code: i64,
    #[serde(default)]
    pub response_body: Json,
    #[serde(default)]
    pub request_body: Json,
}

/// Our verdict: empty means pass-through; a status code makes the proxy
/// answer on the upstream's behalf.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallbackResponse {
    #[serde(rename = "respond_status_code", skip_serializing_if = "Option::is_none")]
    pub respond_status_code: Option<u16>,
    #[serde(rename = "respond_body", skip_serializing_if = "Option::is_none")]
    pub respond_body: Option<Json>,
}

/// Whether a federation request should be failed, given the gate state.
pub fn should_block(gate_up: bool, url: &str) -> bool {
    gate_up && !url.ends_with(WELL_KNOWN_SUFFIX)
}

fn gateway_timeout() -> CallbackResponse {
    CallbackResponse {
        respond_status_code: Some(StatusCode::GATEWAY_TIMEOUT.as_u16()),
        respond_body: Some(serde_json::json!({ "error": "gateway timeout" })),
    }
}

/// The in-process callback server. Listens on an ephemeral port; the proxy
/// reaches it at `callback_url`.
pub struct CallbackServer {
    pub callback_url: String,
    pub local_addr: SocketAddr,
}

impl CallbackServer {
    /// Start the server. `host_domain` is the hostname the proxy can use to
    /// reach this process.
    pub fn start(
        host_domain: &str,
        bus: Arc<BusServer>,
        gate: Arc<AtomicBool>,
    ) -> Result<Self, HarnessError> {
        let request = warp::path("request")
            .and(warp::path::end())
            .and(warp::post())
            .and(warp::body::json())
            .and_then(move |data: CallbackData| {
                let bus = bus.clone();
                let gate = gate.clone();
                async move {
                    let blocked = should_block(gate.load(Ordering::SeqCst), &data.url);
                    bus.send(Payload::FederationRequest(FederationRequestPayload {
                        method: data.method.clone(),
                        url: data.url.clone(),
                        body: data.request_body.clone(),
                        blocked,
                    }))
                    .await;
                    let reply = if blocked {
                        gateway_timeout()
                    } else {
                        CallbackResponse::default()
                    };
                    Ok::<_, warp::Rejection>(warp::reply::json(&reply))
                }
            });

        // The proxy also supports response callbacks; none is registered.
        let response = warp::path("response").and(warp::post()).map(|| {
            warp::reply::with_status(
                warp::reply::json(&serde_json::json!({
                    "error": "no response handler registered"
                })),
                StatusCode::NOT_FOUND,
            )
        });

        let routes = request.or(response);
        let (local_addr, server) = warp::serve(routes)
            .try_bind_ephemeral(([0, 0, 0, 0], 0))
            .map_err(|e| HarnessError::Interceptor(e.to_string()))?;
        tokio::spawn(server);

        let callback_url = format!("http://{}:{}/request", host_domain, local_addr.port());
        info!("federation callback server listening on {local_addr}, callbacks via {callback_url}");
        Ok(Self {
            callback_url,
            local_addr,
        })
    }
}
