//! # Havoc Proto
//!
//! Shared types for the havoc chaos harness: the control-bus wire protocol
//! (envelope, payloads, inbound requests) and the runtime configuration
//! loaded from YAML.
//!
//! The control bus speaks newline-free JSON over a full-duplex WebSocket.
//! Every outbound message is wrapped in a [`BusMessage`] envelope; inbound
//! messages are bare [`BusRequest`] objects.

pub mod config;
pub mod payload;

pub use config::{
    plugin_config, ChaosConfig, ConfigError, ConvergenceSchedule, HomeserverConfig,
    MitmProxyConfig, NetsplitSchedule, PluginConfig, RestartSchedule, TestConfig,
};
pub use payload::{
    Action, BusMessage, BusRequest, ConfigPayload, ConvergencePayload, ConvergenceState,
    FederationRequestPayload, NetsplitPayload, Payload, PayloadError, RestartPayload,
    TickGenerationPayload, WorkerActionPayload,
};
