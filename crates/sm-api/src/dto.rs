use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sm_db::ServerDetail;
use sm_db::models::{Billing, EventLog, EventType, ServerState};

// ── Requests ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    #[serde(default)]
    pub region: String,
    #[serde(default, rename = "type")]
    pub server_type: String,
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    #[serde(default)]
    pub action: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub region: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub server_type: Option<String>,
    // Kept as strings so junk paging values fall back to the defaults
    // instead of failing extraction.
    pub limit: Option<String>,
    pub offset: Option<String>,
}

// ── Responses ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ProvisionResponse {
    pub id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub result: String,
}

#[derive(Debug, Serialize)]
pub struct ServerResponse {
    pub id: Uuid,
    pub state: ServerState,
    pub region: String,
    #[serde(rename = "type")]
    pub server_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing: Option<BillingResponse>,
}

impl From<ServerDetail> for ServerResponse {
    fn from(detail: ServerDetail) -> Self {
        Self {
            id: detail.server.id,
            state: detail.server.state,
            region: detail.server.region,
            server_type: detail.server.server_type,
            ip_address: detail.ip.map(|ip| ip.address),
            billing: detail.billing.map(BillingResponse::from),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BillingResponse {
    pub accumulated_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_billed_at: Option<DateTime<Utc>>,
    pub total_cost: f64,
}

impl From<Billing> for BillingResponse {
    fn from(billing: Billing) -> Self {
        Self {
            accumulated_seconds: billing.accumulated_seconds,
            last_billed_at: billing.last_billed_at,
            total_cost: billing.total_cost,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EventLogResponse {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub message: String,
}

impl From<EventLog> for EventLogResponse {
    fn from(event: EventLog) -> Self {
        Self {
            timestamp: event.timestamp,
            kind: event.kind,
            message: event.message,
        }
    }
}
