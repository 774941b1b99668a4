//! Control-bus wire protocol: envelope, outbound payloads, inbound requests.
//!
//! The JSON key casing is part of the protocol (capitalised keys on the
//! envelope and payloads, since observers other than this binary consume the
//! stream), so every struct pins its names with explicit renames.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::config::ChaosConfig;

/// A user action driven by the workload generator.
///
/// `TickEof` is not a user action: it is the in-band sentinel the dispatcher
/// enqueues after a tick's commands so each worker can signal completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Join,
    Send,
    Leave,
    TickEof,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Join => write!(f, "join"),
            Self::Send => write!(f, "send"),
            Self::Leave => write!(f, "leave"),
            Self::TickEof => write!(f, "tick_eof"),
        }
    }
}

/// Envelope wrapping every payload sent over the control bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Payload")]
    pub payload: Json,
}

impl BusMessage {
    /// Decode the envelope back into a typed payload.
    pub fn decode(&self) -> Result<Payload, PayloadError> {
        let payload = self.payload.clone();
        let decoded = match self.kind.as_str() {
            "Config" => Payload::Config(serde_json::from_value(payload)?),
            "WorkerAction" => Payload::WorkerAction(serde_json::from_value(payload)?),
            "FederationRequest" => Payload::FederationRequest(serde_json::from_value(payload)?),
            "TickGeneration" => Payload::TickGeneration(serde_json::from_value(payload)?),
            "Netsplit" => Payload::Netsplit(serde_json::from_value(payload)?),
            "Convergence" => Payload::Convergence(serde_json::from_value(payload)?),
            "Restart" => Payload::Restart(serde_json::from_value(payload)?),
            other => return Err(PayloadError::UnknownType(other.to_string())),
        };
        Ok(decoded)
    }
}

/// Errors produced while encoding or decoding bus payloads.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("unknown payload type: {0}")]
    UnknownType(String),

    #[error("payload JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything the harness multicasts to control-bus observers.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Config(ConfigPayload),
    WorkerAction(WorkerActionPayload),
    FederationRequest(FederationRequestPayload),
    TickGeneration(TickGenerationPayload),
    Netsplit(NetsplitPayload),
    Convergence(ConvergencePayload),
    Restart(RestartPayload),
}

impl Payload {
    /// The `Type` tag written into the envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "Config",
            Self::WorkerAction(_) => "WorkerAction",
            Self::FederationRequest(_) => "FederationRequest",
            Self::TickGeneration(_) => "TickGeneration",
            Self::Netsplit(_) => "Netsplit",
            Self::Convergence(_) => "Convergence",
            Self::Restart(_) => "Restart",
        }
    }

    /// Wrap this payload in an envelope with a fresh message ID.
    pub fn to_message(&self) -> Result<BusMessage, PayloadError> {
        let payload = match self {
            Self::Config(p) => serde_json::to_value(p)?,
            Self::WorkerAction(p) => serde_json::to_value(p)?,
            Self::FederationRequest(p) => serde_json::to_value(p)?,
            Self::TickGeneration(p) => serde_json::to_value(p)?,
            Self::Netsplit(p) => serde_json::to_value(p)?,
            Self::Convergence(p) => serde_json::to_value(p)?,
            Self::Restart(p) => serde_json::to_value(p)?,
        };
        Ok(BusMessage {
            id: uuid::Uuid::new_v4().to_string(),
            kind: self.kind().to_string(),
            payload,
        })
    }
}

impl std::fmt::Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(p) => {
                let json = serde_json::to_string(&p.config).unwrap_or_default();
                write!(f, "Config: {json}")
            }
            Self::WorkerAction(p) => write!(
                f,
                "WorkerAction: {} {} {} {}",
                p.user_id, p.action, p.room_id, p.body
            ),
            Self::FederationRequest(p) => {
                if p.blocked {
                    write!(f, "BLOCKED: {} {}", p.method, p.url)
                } else {
                    write!(f, "{} {}", p.method, p.url)
                }
            }
            Self::TickGeneration(p) => write!(
                f,
                "Tick {}: (Joins={}, Sends={}, Leaves={})",
                p.number, p.joins, p.sends, p.leaves
            ),
            Self::Netsplit(p) => {
                if p.started {
                    write!(f, "========== NETSPLIT! =========")
                } else {
                    write!(f, "========== NETSPLIT RESOLVED! =========")
                }
            }
            Self::Convergence(p) => write!(f, "Convergence[{}]: err={}", p.state, p.error),
            Self::Restart(p) => {
                if p.finished {
                    write!(f, "Restarted server '{}'", p.domain)
                } else {
                    write!(f, "Restarting server '{}'", p.domain)
                }
            }
        }
    }
}

/// Sent once, directly, to every new control-bus connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigPayload {
    #[serde(rename = "Config")]
    pub config: ChaosConfig,
    #[serde(rename = "WorkerUserIDs", default)]
    pub worker_user_ids: Vec<String>,
}

/// One user action about to be performed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerActionPayload {
    #[serde(rename = "UserID")]
    pub user_id: String,
    #[serde(rename = "RoomID")]
    pub room_id: String,
    #[serde(rename = "Action")]
    pub action: Action,
    #[serde(rename = "Body")]
    pub body: String,
}

/// A federation request seen (and possibly blocked) by the interceptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationRequestPayload {
    #[serde(rename = "Method")]
    pub method: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Body", default)]
    pub body: Json,
    #[serde(rename = "Blocked")]
    pub blocked: bool,
}

/// Summary of the commands generated for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickGenerationPayload {
    #[serde(rename = "Number")]
    pub number: u64,
    #[serde(rename = "Joins")]
    pub joins: usize,
    #[serde(rename = "Sends")]
    pub sends: usize,
    #[serde(rename = "Leaves")]
    pub leaves: usize,
}

/// Edge-triggered partition state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetsplitPayload {
    #[serde(rename = "Started")]
    pub started: bool,
}

/// Progress of a convergence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvergenceState {
    Starting,
    Synchronised,
    Waiting,
    Checking,
    Success,
    Failure,
}

impl std::fmt::Display for ConvergenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Synchronised => write!(f, "synchronised"),
            Self::Waiting => write!(f, "waiting"),
            Self::Checking => write!(f, "checking"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// State transition of a convergence check, with its error when one exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergencePayload {
    #[serde(rename = "State")]
    pub state: ConvergenceState,
    #[serde(rename = "Error", default)]
    pub error: String,
}

impl ConvergencePayload {
    pub fn new(state: ConvergenceState) -> Self {
        Self {
            state,
            error: String::new(),
        }
    }

    pub fn with_error(state: ConvergenceState, error: impl Into<String>) -> Self {
        Self {
            state,
            error: error.into(),
        }
    }
}

/// A homeserver restart starting or finishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartPayload {
    #[serde(rename = "Domain")]
    pub domain: String,
    #[serde(rename = "Finished")]
    pub finished: bool,
}

/// Inbound request from a control-bus client. All fields are optional so a
/// client can set exactly the ones it means.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusRequest {
    #[serde(
        rename = "RestartServers",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub restart_servers: Option<Vec<String>>,

    #[serde(rename = "Netsplit", default, skip_serializing_if = "Option::is_none")]
    pub netsplit: Option<bool>,

    #[serde(rename = "CheckConvergence", default)]
    pub check_convergence: bool,

    #[serde(rename = "Begin", default)]
    pub begin: bool,
}

impl BusRequest {
    pub fn netsplit(up: bool) -> Self {
        Self {
            netsplit: Some(up),
            ..Default::default()
        }
    }

    pub fn restart_servers(domains: Vec<String>) -> Self {
        Self {
            restart_servers: Some(domains),
            ..Default::default()
        }
    }

    pub fn check_convergence() -> Self {
        Self {
            check_convergence: true,
            ..Default::default()
        }
    }

    pub fn begin() -> Self {
        Self {
            begin: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(payload: Payload) -> Payload {
        let msg = payload.to_message().unwrap();
        assert!(!msg.id.is_empty());
        assert_eq!(msg.kind, payload.kind());
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: BusMessage = serde_json::from_str(&json).unwrap();
        parsed.decode().unwrap()
    }

    #[test]
    fn test_worker_action_round_trip() {
        let payload = Payload::WorkerAction(WorkerActionPayload {
            user_id: "@u1:hs1".into(),
            room_id: "!r:hs1".into(),
            action: Action::Join,
            body: String::new(),
        });
        assert_eq!(round_trip(payload.clone()), payload);
    }

    #[test]
    fn test_federation_request_round_trip() {
        let payload = Payload::FederationRequest(FederationRequestPayload {
            method: "PUT".into(),
            url: "https://hs2/_matrix/federation/v1/send/1".into(),
            body: serde_json::json!({"edus": []}),
            blocked: true,
        });
        assert_eq!(round_trip(payload.clone()), payload);
    }

    #[test]
    fn test_tick_generation_round_trip() {
        let payload = Payload::TickGeneration(TickGenerationPayload {
            number: 7,
            joins: 2,
            sends: 5,
            leaves: 1,
        });
        assert_eq!(round_trip(payload.clone()), payload);
    }

    #[test]
    fn test_netsplit_round_trip() {
        let payload = Payload::Netsplit(NetsplitPayload { started: true });
        assert_eq!(round_trip(payload.clone()), payload);
    }

    #[test]
    fn test_convergence_round_trip() {
        let payload = Payload::Convergence(ConvergencePayload::with_error(
            ConvergenceState::Failure,
            "user @a:hs1 is 'left'. Want 'joined'",
        ));
        assert_eq!(round_trip(payload.clone()), payload);
    }

    #[test]
    fn test_restart_round_trip() {
        let payload = Payload::Restart(RestartPayload {
            domain: "hs2".into(),
            finished: false,
        });
        assert_eq!(round_trip(payload.clone()), payload);
    }

    #[test]
    fn test_config_round_trip() {
        let payload = Payload::Config(ConfigPayload {
            config: ChaosConfig::default(),
            worker_user_ids: vec!["@u1:hs1".into(), "@u2:hs2".into()],
        });
        assert_eq!(round_trip(payload.clone()), payload);
    }

    #[test]
    fn test_envelope_keys_are_capitalised() {
        let msg = Payload::Netsplit(NetsplitPayload { started: false })
            .to_message()
            .unwrap();
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("ID").is_some());
        assert!(json.get("Type").is_some());
        assert!(json.get("Payload").is_some());
        assert_eq!(json["Payload"]["Started"], serde_json::json!(false));
    }

    #[test]
    fn test_unknown_type_errors() {
        let msg = BusMessage {
            id: "1".into(),
            kind: "Bogus".into(),
            payload: serde_json::json!({}),
        };
        assert!(matches!(msg.decode(), Err(PayloadError::UnknownType(t)) if t == "Bogus"));
    }

    #[test]
    fn test_action_serialises_snake_case() {
        assert_eq!(serde_json::to_string(&Action::TickEof).unwrap(), "\"tick_eof\"");
        assert_eq!(serde_json::to_string(&Action::Join).unwrap(), "\"join\"");
        let parsed: Action = serde_json::from_str("\"leave\"").unwrap();
        assert_eq!(parsed, Action::Leave);
    }

    #[test]
    fn test_bus_request_partial_fields() {
        // A request with only Netsplit set omits RestartServers entirely.
        let json = serde_json::to_string(&BusRequest::netsplit(true)).unwrap();
        assert!(!json.contains("RestartServers"));
        assert!(json.contains("\"Netsplit\":true"));

        // Requests from older clients may carry only one key.
        let parsed: BusRequest = serde_json::from_str(r#"{"CheckConvergence":true}"#).unwrap();
        assert!(parsed.check_convergence);
        assert!(parsed.netsplit.is_none());
        assert!(parsed.restart_servers.is_none());
        assert!(!parsed.begin);
    }

    #[test]
    fn test_convergence_state_wire_names() {
        for (state, want) in [
            (ConvergenceState::Starting, "\"starting\""),
            (ConvergenceState::Synchronised, "\"synchronised\""),
            (ConvergenceState::Waiting, "\"waiting\""),
            (ConvergenceState::Checking, "\"checking\""),
            (ConvergenceState::Success, "\"success\""),
            (ConvergenceState::Failure, "\"failure\""),
        ] {
            assert_eq!(serde_json::to_string(&state).unwrap(), want);
        }
    }

    #[test]
    fn test_payload_display() {
        let blocked = Payload::FederationRequest(FederationRequestPayload {
            method: "GET".into(),
            url: "https://hs2/x".into(),
            body: Json::Null,
            blocked: true,
        });
        assert_eq!(blocked.to_string(), "BLOCKED: GET https://hs2/x");

        let tick = Payload::TickGeneration(TickGenerationPayload {
            number: 3,
            joins: 1,
            sends: 2,
            leaves: 0,
        });
        assert_eq!(tick.to_string(), "Tick 3: (Joins=1, Sends=2, Leaves=0)");
    }
}
