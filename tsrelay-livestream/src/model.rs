//! Typed channel and client records and their hash-field encoding.
//!
//! The shared store keeps both records as flat string hashes. Everything that
//! crosses that boundary goes through `to_fields` / `from_fields` here; the
//! rest of the engine only sees the typed structs.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type Fields = Vec<(String, String)>;

/// Metadata hash field names.
pub mod field {
    pub const URL: &str = "url";
    pub const USER_AGENT: &str = "user_agent";
    pub const STATE: &str = "state";
    pub const OWNER: &str = "owner";
    pub const STREAM_ID: &str = "stream_id";
    pub const STREAM_PROFILE: &str = "stream_profile";
    pub const INIT_TIME: &str = "init_time";
    pub const STATE_CHANGED_AT: &str = "state_changed_at";
    pub const CONNECTION_READY_TIME: &str = "connection_ready_time";
    pub const TOTAL_BYTES: &str = "total_bytes";
    pub const ERROR_MESSAGE: &str = "error_message";
    pub const ERROR_TIME: &str = "error_time";
    pub const STREAM_SWITCH_TIME: &str = "stream_switch_time";
    pub const STREAM_SWITCH_REASON: &str = "stream_switch_reason";
    pub const UPSTREAM_STATE: &str = "upstream_state";

    pub const IP_ADDRESS: &str = "ip_address";
    pub const WORKER_ID: &str = "worker_id";
    pub const CONNECTED_AT: &str = "connected_at";
    pub const LAST_ACTIVE: &str = "last_active";
    pub const BYTES_SENT: &str = "bytes_sent";
    pub const CHUNKS_SENT: &str = "chunks_sent";
    pub const AVG_RATE: &str = "avg_rate_KBps";
    pub const CURRENT_RATE: &str = "current_rate_KBps";
    pub const STATS_UPDATED_AT: &str = "stats_updated_at";
}

/// Channel lifecycle as seen by every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Initializing,
    Connecting,
    WaitingForClients,
    Active,
    Error,
    Stopping,
    Stopped,
}

impl ChannelState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Connecting => "connecting",
            Self::WaitingForClients => "waiting_for_clients",
            Self::Active => "active",
            Self::Error => "error",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    /// Upstream is connected and the buffer is being fed.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Active | Self::WaitingForClients)
    }

    /// Still starting up; data may not have arrived yet.
    #[must_use]
    pub const fn is_starting(self) -> bool {
        matches!(self, Self::Initializing | Self::Connecting)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Stopping | Self::Stopped)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "initializing" => Self::Initializing,
            "connecting" => Self::Connecting,
            "waiting_for_clients" => Self::WaitingForClients,
            "active" => Self::Active,
            "error" => Self::Error,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            other => return Err(format!("unknown channel state: {other}")),
        })
    }
}

/// Upstream connection manager state, owner side only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Connecting,
    Connected,
    Healthy,
    Unhealthy,
    Reconnecting,
    Switching,
    Stopped,
}

impl ManagerState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Reconnecting => "reconnecting",
            Self::Switching => "switching",
            Self::Stopped => "stopped",
        }
    }

    /// An upstream socket is open and delivering.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Healthy)
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManagerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "connecting" => Self::Connecting,
            "connected" => Self::Connected,
            "healthy" => Self::Healthy,
            "unhealthy" => Self::Unhealthy,
            "reconnecting" => Self::Reconnecting,
            "switching" => Self::Switching,
            "stopped" => Self::Stopped,
            other => return Err(format!("unknown upstream state: {other}")),
        })
    }
}

/// Shared channel metadata, written by the owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelMetadata {
    pub url: String,
    pub user_agent: String,
    pub state: ChannelState,
    pub owner: String,
    pub stream_id: Option<i64>,
    pub stream_profile: String,
    pub init_time: f64,
    pub state_changed_at: f64,
    pub connection_ready_time: Option<f64>,
    pub total_bytes: u64,
    pub error_message: Option<String>,
    pub error_time: Option<f64>,
    pub stream_switch_time: Option<f64>,
    pub stream_switch_reason: Option<String>,
    pub upstream_state: Option<ManagerState>,
}

impl ChannelMetadata {
    /// Fresh metadata for a channel just claimed by `owner`.
    #[must_use]
    pub fn initializing(
        owner: &str,
        url: &str,
        user_agent: &str,
        stream_id: Option<i64>,
        stream_profile: &str,
        now: f64,
    ) -> Self {
        Self {
            url: url.to_string(),
            user_agent: user_agent.to_string(),
            state: ChannelState::Initializing,
            owner: owner.to_string(),
            stream_id,
            stream_profile: stream_profile.to_string(),
            init_time: now,
            state_changed_at: now,
            connection_ready_time: None,
            total_bytes: 0,
            error_message: None,
            error_time: None,
            stream_switch_time: None,
            stream_switch_reason: None,
            upstream_state: None,
        }
    }

    #[must_use]
    pub fn to_fields(&self) -> Fields {
        let mut fields = vec![
            (field::URL.to_string(), self.url.clone()),
            (field::USER_AGENT.to_string(), self.user_agent.clone()),
            (field::STATE.to_string(), self.state.as_str().to_string()),
            (field::OWNER.to_string(), self.owner.clone()),
            (field::STREAM_PROFILE.to_string(), self.stream_profile.clone()),
            (field::INIT_TIME.to_string(), self.init_time.to_string()),
            (field::STATE_CHANGED_AT.to_string(), self.state_changed_at.to_string()),
            (field::TOTAL_BYTES.to_string(), self.total_bytes.to_string()),
        ];
        let optional = [
            (field::STREAM_ID, self.stream_id.map(|v| v.to_string())),
            (
                field::CONNECTION_READY_TIME,
                self.connection_ready_time.map(|v| v.to_string()),
            ),
            (field::ERROR_MESSAGE, self.error_message.clone()),
            (field::ERROR_TIME, self.error_time.map(|v| v.to_string())),
            (
                field::STREAM_SWITCH_TIME,
                self.stream_switch_time.map(|v| v.to_string()),
            ),
            (field::STREAM_SWITCH_REASON, self.stream_switch_reason.clone()),
            (
                field::UPSTREAM_STATE,
                self.upstream_state.map(|s| s.as_str().to_string()),
            ),
        ];
        fields.extend(
            optional
                .into_iter()
                .filter_map(|(name, value)| value.map(|v| (name.to_string(), v))),
        );
        fields
    }

    /// Decode a metadata hash. Returns `None` when the hash is empty or has no
    /// state, which is what a deleted or half-written channel looks like.
    #[must_use]
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let state = fields.get(field::STATE)?.parse().ok()?;
        Some(Self {
            url: text(fields, field::URL),
            user_agent: text(fields, field::USER_AGENT),
            state,
            owner: text(fields, field::OWNER),
            stream_id: parsed(fields, field::STREAM_ID),
            stream_profile: text(fields, field::STREAM_PROFILE),
            init_time: parsed(fields, field::INIT_TIME).unwrap_or_default(),
            state_changed_at: parsed(fields, field::STATE_CHANGED_AT).unwrap_or_default(),
            connection_ready_time: parsed(fields, field::CONNECTION_READY_TIME),
            total_bytes: parsed(fields, field::TOTAL_BYTES).unwrap_or_default(),
            error_message: fields.get(field::ERROR_MESSAGE).cloned(),
            error_time: parsed(fields, field::ERROR_TIME),
            stream_switch_time: parsed(fields, field::STREAM_SWITCH_TIME),
            stream_switch_reason: fields.get(field::STREAM_SWITCH_REASON).cloned(),
            upstream_state: parsed(fields, field::UPSTREAM_STATE),
        })
    }
}

/// One attached client as recorded in the shared store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientRecord {
    pub client_id: String,
    pub ip_address: String,
    pub user_agent: String,
    pub worker_id: String,
    pub connected_at: f64,
    pub last_active: f64,
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    #[serde(rename = "avg_rate_KBps")]
    pub avg_rate_kbps: f64,
    #[serde(rename = "current_rate_KBps")]
    pub current_rate_kbps: f64,
    pub stats_updated_at: f64,
}

impl ClientRecord {
    #[must_use]
    pub fn new(client_id: &str, ip_address: &str, user_agent: &str, worker_id: &str, now: f64) -> Self {
        Self {
            client_id: client_id.to_string(),
            ip_address: ip_address.to_string(),
            user_agent: user_agent.to_string(),
            worker_id: worker_id.to_string(),
            connected_at: now,
            last_active: now,
            bytes_sent: 0,
            chunks_sent: 0,
            avg_rate_kbps: 0.0,
            current_rate_kbps: 0.0,
            stats_updated_at: now,
        }
    }

    #[must_use]
    pub fn to_fields(&self) -> Fields {
        vec![
            (field::IP_ADDRESS.to_string(), self.ip_address.clone()),
            (field::USER_AGENT.to_string(), self.user_agent.clone()),
            (field::WORKER_ID.to_string(), self.worker_id.clone()),
            (field::CONNECTED_AT.to_string(), self.connected_at.to_string()),
            (field::LAST_ACTIVE.to_string(), self.last_active.to_string()),
            (field::BYTES_SENT.to_string(), self.bytes_sent.to_string()),
            (field::CHUNKS_SENT.to_string(), self.chunks_sent.to_string()),
            (field::AVG_RATE.to_string(), format!("{:.2}", self.avg_rate_kbps)),
            (field::CURRENT_RATE.to_string(), format!("{:.2}", self.current_rate_kbps)),
            (field::STATS_UPDATED_AT.to_string(), self.stats_updated_at.to_string()),
        ]
    }

    #[must_use]
    pub fn from_fields(client_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        Some(Self {
            client_id: client_id.to_string(),
            ip_address: text(fields, field::IP_ADDRESS),
            user_agent: text(fields, field::USER_AGENT),
            worker_id: text(fields, field::WORKER_ID),
            connected_at: parsed(fields, field::CONNECTED_AT).unwrap_or_default(),
            last_active: parsed(fields, field::LAST_ACTIVE).unwrap_or_default(),
            bytes_sent: parsed(fields, field::BYTES_SENT).unwrap_or_default(),
            chunks_sent: parsed(fields, field::CHUNKS_SENT).unwrap_or_default(),
            avg_rate_kbps: parsed(fields, field::AVG_RATE).unwrap_or_default(),
            current_rate_kbps: parsed(fields, field::CURRENT_RATE).unwrap_or_default(),
            stats_updated_at: parsed(fields, field::STATS_UPDATED_AT).unwrap_or_default(),
        })
    }
}

fn text(fields: &HashMap<String, String>, name: &str) -> String {
    fields.get(name).cloned().unwrap_or_default()
}

fn parsed<T: FromStr>(fields: &HashMap<String, String>, name: &str) -> Option<T> {
    fields.get(name).and_then(|v| v.parse().ok())
}
