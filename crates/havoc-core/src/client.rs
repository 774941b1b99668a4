//! HTTP client for the homeserver client API subset the harness drives.
//!
//! This is a test-harness client: hostnames ending in `.localhost` resolve
//! to loopback and TLS verification is disabled.

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const JOIN_POLL_ATTEMPTS: u32 = 200;

/// Errors from the homeserver client. Transport errors (the request never
/// produced a response) are distinct from protocol errors (a non-2xx
/// response), because callers poll on the former and give up on neither.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{method} {url}: {source}")]
    Transport {
        method: &'static str,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} {url} returned HTTP {status}: {body}")]
    Protocol {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    #[error("failed to decode {context} response: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to build http client: {0}")]
    Build(#[source] reqwest::Error),

    #[error("invalid base URL '{0}'")]
    BadBaseUrl(String),

    #[error("register: response is for domain '{got}' but we are registering on '{want}'")]
    DomainMismatch { got: String, want: String },

    #[error("timed out waiting for {user_id} to appear joined in {room_id}")]
    JoinTimeout { user_id: String, room_id: String },
}

/// An event as returned by the client API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixEvent {
    /// Present only on state events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub sender: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "origin_server_ts", default)]
    pub timestamp: i64,
    #[serde(rename = "event_id", default)]
    pub id: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub content: serde_json::Map<String, Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Json>,
}

impl MatrixEvent {
    /// The `membership` content field, for `m.room.member` events.
    pub fn membership(&self) -> Option<&str> {
        self.content.get("membership").and_then(|v| v.as_str())
    }
}

/// Options for a `/sync` request. The default value performs a full initial
/// sync.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    /// `next_batch` token from an earlier sync.
    pub since: String,
    /// Filter ID or inline filter JSON.
    pub filter: String,
    /// Return all state events even when `since` is set.
    pub full_state: bool,
    /// Presence override: one of `offline`, `online`, `unavailable`.
    pub set_presence: String,
    /// Long-poll timeout in milliseconds. Empty uses 1000.
    pub timeout_millis: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SyncRooms,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: HashMap<String, SyncRoom>,
    #[serde(default)]
    pub leave: HashMap<String, SyncRoom>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncRoom {
    #[serde(default)]
    pub state: EventBundle,
    #[serde(default)]
    pub timeline: Timeline,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventBundle {
    #[serde(default)]
    pub events: Vec<MatrixEvent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<MatrixEvent>,
    #[serde(default)]
    pub limited: bool,
    #[serde(default)]
    pub prev_batch: String,
}

/// The subset of the client API that workers and the convergence checker
/// exercise, as a trait so tests can substitute a fake server.
#[async_trait]
pub trait ChatApi: Send + Sync {
    fn user_id(&self) -> &str;
    async fn join_room(&self, room_id: &str, server_names: &[String]) -> Result<(), ClientError>;
    async fn leave_room(&self, room_id: &str) -> Result<(), ClientError>;
    async fn send_text(&self, room_id: &str, text: &str) -> Result<String, ClientError>;
    /// `Ok(None)` means the event is not (yet) visible on this server;
    /// transport and protocol failures are genuine errors.
    async fn event(&self, room_id: &str, event_id: &str)
        -> Result<Option<MatrixEvent>, ClientError>;
    async fn members(&self, room_id: &str) -> Result<Vec<MatrixEvent>, ClientError>;
    async fn sync(&self, req: SyncRequest) -> Result<SyncResponse, ClientError>;
}

/// A registered session against one homeserver. Value-semantic: clones share
/// the underlying connection pool and transaction counter.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    pub base_url: String,
    pub domain: String,
    pub user_id: String,
    pub access_token: String,
    txn_counter: Arc<AtomicU64>,
    debug: bool,
}

impl Client {
    pub fn new(base_url: &str, domain: &str, debug: bool) -> Result<Self, ClientError> {
        let url =
            Url::parse(base_url).map_err(|_| ClientError::BadBaseUrl(base_url.to_string()))?;
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true);
        // Resolve *.localhost to loopback like curl does.
        if let Some(host) = url.host_str() {
            if host.ends_with(".localhost") {
                builder = builder.resolve(host, SocketAddr::from(([127, 0, 0, 1], 0)));
            }
        }
        let http = builder.build().map_err(ClientError::Build)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            domain: domain.to_string(),
            user_id: String::new(),
            access_token: String::new(),
            txn_counter: Arc::new(AtomicU64::new(0)),
            debug,
        })
    }

    /// Register a new user and adopt its credentials.
    pub async fn register(&mut self, localpart: &str) -> Result<(), ClientError> {
        #[derive(Deserialize)]
        struct RegisterResponse {
            user_id: String,
            access_token: String,
            #[serde(default)]
            home_server: String,
        }
        let body = json!({
            "auth": { "type": "m.login.dummy" },
            "username": localpart,
            "password": "loadtestingisfun",
        });
        let res: RegisterResponse = self
            .request(
                Method::POST,
                &["_matrix", "client", "v3", "register"],
                &[],
                Some(&body),
                "register",
            )
            .await?;
        if !res.home_server.is_empty() && res.home_server != self.domain {
            return Err(ClientError::DomainMismatch {
                got: res.home_server,
                want: self.domain.clone(),
            });
        }
        self.user_id = res.user_id;
        self.access_token = res.access_token;
        Ok(())
    }

    /// Create a room and return its ID. `opts` is passed through as the
    /// createRoom body.
    pub async fn create_room(&self, opts: &Json) -> Result<String, ClientError> {
        #[derive(Deserialize)]
        struct CreateRoomResponse {
            room_id: String,
        }
        let res: CreateRoomResponse = self
            .request(
                Method::POST,
                &["_matrix", "client", "v3", "createRoom"],
                &[],
                Some(opts),
                "createRoom",
            )
            .await?;
        Ok(res.room_id)
    }

    /// Poll `/members` until this user's own join membership is visible.
    /// Joins over federation land asynchronously; prepare relies on this
    /// before letting the workload loose on a room.
    pub async fn ensure_fully_joined(&self, room_id: &str) -> Result<(), ClientError> {
        for _ in 0..JOIN_POLL_ATTEMPTS {
            let members = ChatApi::members(self, room_id).await?;
            let joined = members.iter().any(|ev| {
                ev.state_key.as_deref() == Some(self.user_id.as_str())
                    && ev.membership() == Some("join")
            });
            if joined {
                return Ok(());
            }
            tokio::time::sleep(JOIN_POLL_INTERVAL).await;
        }
        Err(ClientError::JoinTimeout {
            user_id: self.user_id.clone(),
            room_id: room_id.to_string(),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        paths: &[&str],
        query: &[(&str, &str)],
        body: Option<&Json>,
        context: &'static str,
    ) -> Result<T, ClientError> {
        let method_str = method_name(&method);
        let url = self.build_url(paths, query)?;
        let url_str = url.to_string();

        let mut req = self.http.request(method, url);
        if !self.access_token.is_empty() {
            req = req.bearer_auth(&self.access_token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        if self.debug {
            debug!("{} : {} {}", self.user_id, method_str, url_str);
        }

        let res = req.send().await.map_err(|source| ClientError::Transport {
            method: method_str,
            url: url_str.clone(),
            source,
        })?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ClientError::Protocol {
                method: method_str,
                url: url_str,
                status: status.as_u16(),
                body,
            });
        }
        res.json().await.map_err(|source| ClientError::Decode {
            context,
            source,
        })
    }

    fn build_url(&self, paths: &[&str], query: &[(&str, &str)]) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|_| ClientError::BadBaseUrl(self.base_url.clone()))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::BadBaseUrl(self.base_url.clone()))?
            .extend(paths);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }
}

#[async_trait]
impl ChatApi for Client {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn join_room(&self, room_id: &str, server_names: &[String]) -> Result<(), ClientError> {
        let query: Vec<(&str, &str)> = server_names
            .iter()
            .map(|s| ("server_name", s.as_str()))
            .collect();
        let _: Json = self
            .request(
                Method::POST,
                &["_matrix", "client", "v3", "join", room_id],
                &query,
                Some(&json!({})),
                "join",
            )
            .await?;
        Ok(())
    }

    async fn leave_room(&self, room_id: &str) -> Result<(), ClientError> {
        let _: Json = self
            .request(
                Method::POST,
                &["_matrix", "client", "v3", "rooms", room_id, "leave"],
                &[],
                Some(&json!({})),
                "leave",
            )
            .await?;
        Ok(())
    }

    async fn send_text(&self, room_id: &str, text: &str) -> Result<String, ClientError> {
        #[derive(Deserialize)]
        struct SendResponse {
            event_id: String,
        }
        let txn = self.txn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let txn = txn.to_string();
        let res: SendResponse = self
            .request(
                Method::PUT,
                &[
                    "_matrix",
                    "client",
                    "v3",
                    "rooms",
                    room_id,
                    "send",
                    "m.room.message",
                    &txn,
                ],
                &[],
                Some(&json!({ "msgtype": "m.text", "body": text })),
                "send",
            )
            .await?;
        Ok(res.event_id)
    }

    async fn event(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<Option<MatrixEvent>, ClientError> {
        let res = self
            .request::<MatrixEvent>(
                Method::GET,
                &["_matrix", "client", "v3", "rooms", room_id, "event", event_id],
                &[],
                None,
                "event",
            )
            .await;
        match res {
            Ok(ev) => Ok(Some(ev)),
            Err(ClientError::Protocol { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn members(&self, room_id: &str) -> Result<Vec<MatrixEvent>, ClientError> {
        #[derive(Deserialize)]
        struct MembersResponse {
            #[serde(default)]
            chunk: Vec<MatrixEvent>,
        }
        let res: MembersResponse = self
            .request(
                Method::GET,
                &["_matrix", "client", "v3", "rooms", room_id, "members"],
                &[],
                None,
                "members",
            )
            .await?;
        Ok(res.chunk)
    }

    async fn sync(&self, req: SyncRequest) -> Result<SyncResponse, ClientError> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        let timeout = if req.timeout_millis.is_empty() {
            "1000"
        } else {
            &req.timeout_millis
        };
        query.push(("timeout", timeout));
        if !req.since.is_empty() {
            query.push(("since", &req.since));
        }
        if !req.filter.is_empty() {
            query.push(("filter", &req.filter));
        }
        if req.full_state {
            query.push(("full_state", "true"));
        }
        if !req.set_presence.is_empty() {
            query.push(("set_presence", &req.set_presence));
        }
        self.request(
            Method::GET,
            &["_matrix", "client", "v3", "sync"],
            &query,
            None,
            "sync",
        )
        .await
    }
}

fn method_name(method: &Method) -> &'static str {
    match method.as_str() {
        "GET" => "GET",
        "POST" => "POST",
        "PUT" => "PUT",
        "DELETE" => "DELETE",
        _ => "HTTP",
    }
}
