use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ── ServerState ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "server_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Provisioning,
    Running,
    Stopped,
    Rebooting,
    Terminated,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Provisioning => "provisioning",
            ServerState::Running => "running",
            ServerState::Stopped => "stopped",
            ServerState::Rebooting => "rebooting",
            ServerState::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServerState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(ServerState::Provisioning),
            "running" => Ok(ServerState::Running),
            "stopped" => Ok(ServerState::Stopped),
            "rebooting" => Ok(ServerState::Rebooting),
            "terminated" => Ok(ServerState::Terminated),
            _ => Err(()),
        }
    }
}

// ── ServerAction ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerAction {
    Start,
    Stop,
    Reboot,
    Terminate,
}

impl ServerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerAction::Start => "start",
            ServerAction::Stop => "stop",
            ServerAction::Reboot => "reboot",
            ServerAction::Terminate => "terminate",
        }
    }
}

impl std::fmt::Display for ServerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServerAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(ServerAction::Start),
            "stop" => Ok(ServerAction::Stop),
            "reboot" => Ok(ServerAction::Reboot),
            "terminate" => Ok(ServerAction::Terminate),
            _ => Err(()),
        }
    }
}

// ── EventType ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "event_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Provisioned,
    Started,
    Stopped,
    Rebooted,
    Terminated,
    Billed,
    Reaped,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Provisioned => "provisioned",
            EventType::Started => "started",
            EventType::Stopped => "stopped",
            EventType::Rebooted => "rebooted",
            EventType::Terminated => "terminated",
            EventType::Billed => "billed",
            EventType::Reaped => "reaped",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Entities ────────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Server {
    pub id: Uuid,
    pub region: String,
    pub server_type: String,
    pub ip_id: Option<i64>,
    pub state: ServerState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IpAddress {
    pub id: i64,
    pub address: String,
    pub allocated: bool,
    pub server_id: Option<Uuid>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Billing {
    pub server_id: Uuid,
    pub accumulated_seconds: i64,
    pub last_billed_at: Option<DateTime<Utc>>,
    pub total_cost: f64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EventLog {
    pub id: i64,
    pub server_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: EventType,
    pub message: String,
}

// ── FSM ─────────────────────────────────────────────────────────────

/// Timestamp column stamped alongside a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    None,
    Started,
    Stopped,
    Terminated,
}

/// Outcome of a legal FSM transition: the externally visible destination
/// state, the timestamp to stamp, and the journal entries to emit in order.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub to: ServerState,
    pub stamp: Stamp,
    pub events: &'static [(EventType, &'static str)],
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("invalid state transition: {from} -> {action}")]
pub struct InvalidTransition {
    pub from: ServerState,
    pub action: ServerAction,
}

impl ServerState {
    /// Evaluate the lifecycle table for `action` from this state.
    ///
    /// Reboot passes through a transient `rebooting` state that is never
    /// observable outside the transition; the destination stays `running`
    /// and `started_at` is left untouched so uptime metering continues.
    pub fn transition(self, action: ServerAction) -> Result<Transition, InvalidTransition> {
        use ServerAction::*;
        use ServerState::*;

        match (self, action) {
            (Stopped, Start) => Ok(Transition {
                to: Running,
                stamp: Stamp::Started,
                events: &[(EventType::Started, "Server started")],
            }),
            (Running, Stop) => Ok(Transition {
                to: Stopped,
                stamp: Stamp::Stopped,
                events: &[(EventType::Stopped, "Server stopped")],
            }),
            (Running, Reboot) => Ok(Transition {
                to: Running,
                stamp: Stamp::None,
                events: &[
                    (EventType::Rebooted, "Server rebooting"),
                    (EventType::Started, "Server rebooted and running"),
                ],
            }),
            (from, Terminate) if from != Terminated => Ok(Transition {
                to: Terminated,
                stamp: Stamp::Terminated,
                events: &[(EventType::Terminated, "Server terminated")],
            }),
            (from, action) => Err(InvalidTransition { from, action }),
        }
    }
}
