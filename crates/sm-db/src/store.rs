use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Billing, EventLog, EventType, IpAddress, Server, ServerState, Stamp};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Filter and paging arguments for server listings.
#[derive(Debug, Clone, Default)]
pub struct ServerFilter {
    pub region: Option<String>,
    pub state: Option<ServerState>,
    pub server_type: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl ServerFilter {
    pub fn by_state(state: ServerState, limit: i64) -> Self {
        Self {
            state: Some(state),
            limit,
            ..Default::default()
        }
    }
}

/// A server row with its eagerly loaded relations.
///
/// `events` is populated (newest first, capped) by `get_server`; listings
/// leave it empty since no list consumer reads the journal.
#[derive(Debug, Clone)]
pub struct ServerDetail {
    pub server: Server,
    pub ip: Option<IpAddress>,
    pub billing: Option<Billing>,
    pub events: Vec<EventLog>,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub server_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: EventType,
    pub message: String,
}

/// Persistence port consumed by the control plane core.
///
/// Backed by Postgres in production (`PgStore`) and by an in-memory table
/// set in tests (`MemStore`). All writes observable through this trait are
/// atomic per call: a state update and its timestamps land together or not
/// at all.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // ── Address pool ────────────────────────────────────────────────

    /// Atomically reserve the lowest-id free address. `None` means the pool
    /// is exhausted, which is a normal condition rather than an error.
    async fn allocate_ip(&self) -> Result<Option<IpAddress>, StoreError>;

    /// Return an address to the pool, clearing the server back-reference.
    /// Idempotent.
    async fn release_ip(&self, ip_id: i64) -> Result<(), StoreError>;

    /// Stamp the owning server on an allocated address.
    async fn bind_ip(&self, ip_id: i64, server_id: Uuid) -> Result<(), StoreError>;

    /// `(total, free)` counts for the pool.
    async fn count_ips(&self) -> Result<(i64, i64), StoreError>;

    /// Seed pool rows; duplicates are skipped.
    async fn insert_ips(&self, addresses: &[String]) -> Result<(), StoreError>;

    // ── Servers ─────────────────────────────────────────────────────

    /// Persist a new server together with its zeroed billing record.
    async fn insert_server(&self, server: &Server) -> Result<(), StoreError>;

    async fn get_server(&self, id: Uuid) -> Result<Option<ServerDetail>, StoreError>;

    async fn list_servers(&self, filter: &ServerFilter) -> Result<Vec<ServerDetail>, StoreError>;

    /// Write the new state, the stamped lifecycle timestamp and `updated_at`
    /// in one statement.
    async fn update_server_state(
        &self,
        id: Uuid,
        state: ServerState,
        stamp: Stamp,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Release the server's address binding from both sides: free the pool
    /// row and null out the server's `ip_id`. Idempotent.
    async fn release_server_ip(&self, server_id: Uuid) -> Result<(), StoreError>;

    // ── Billing ─────────────────────────────────────────────────────

    /// Add `seconds` and `cost` to the server's meter and advance
    /// `last_billed_at`.
    async fn charge(
        &self,
        server_id: Uuid,
        seconds: i64,
        cost: f64,
        billed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // ── Journal ─────────────────────────────────────────────────────

    async fn append_event(&self, event: &NewEvent) -> Result<(), StoreError>;

    /// Up to `n` entries for the server, newest first.
    async fn last_events(&self, server_id: Uuid, n: i64) -> Result<Vec<EventLog>, StoreError>;
}
