use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::Mutex;
use uuid::Uuid;

use sm_db::models::{EventLog, EventType, Server, ServerAction, ServerState, Stamp};
use sm_db::{NewEvent, ServerDetail, ServerFilter, Store, StoreError};

use crate::error::ApiError;
use crate::metrics::{IP_POOL_EXHAUSTED, SERVER_ACTIONS, SERVERS_PROVISIONED};

const LOCK_STRIPES: usize = 64;

pub const DEFAULT_LIST_LIMIT: i64 = 20;
pub const MAX_LIST_LIMIT: i64 = 100;

/// Orchestrates provisioning and lifecycle actions over the storage port.
///
/// Transitions on one server are serialized through a striped lock table so
/// FSM evaluation, the state write and the journal appends for an action
/// never interleave with a concurrent action on the same server.
pub struct ServerService {
    store: Arc<dyn Store>,
    locks: Vec<Mutex<()>>,
}

impl ServerService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, id: &Uuid) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.locks[(hasher.finish() as usize) % self.locks.len()]
    }

    /// Provision a new server: reserve an address, create the record with a
    /// zeroed billing meter, bind the address and bring the server up.
    ///
    /// The address reservation is released if the server row cannot be
    /// created; later failures leave a durable server the caller can
    /// terminate.
    pub async fn provision(&self, region: &str, server_type: &str) -> Result<Uuid, ApiError> {
        if region.trim().is_empty() || server_type.trim().is_empty() {
            return Err(ApiError::InvalidInput("region and type are required".into()));
        }

        let Some(ip) = self.store.allocate_ip().await? else {
            tracing::warn!("no available IPs for provisioning");
            counter!(IP_POOL_EXHAUSTED).increment(1);
            return Err(ApiError::NoAvailableIps);
        };

        let now = Utc::now();
        let server = Server {
            id: Uuid::new_v4(),
            region: region.into(),
            server_type: server_type.into(),
            ip_id: Some(ip.id),
            state: ServerState::Provisioning,
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
            terminated_at: None,
        };

        if let Err(err) = self.store.insert_server(&server).await {
            tracing::error!(error = %err, "failed to persist server, releasing IP");
            if let Err(release_err) = self.store.release_ip(ip.id).await {
                tracing::error!(ip_id = ip.id, error = %release_err, "failed to release IP after rollback");
            }
            return Err(err.into());
        }

        self.store.bind_ip(ip.id, server.id).await.map_err(|err| match err {
            StoreError::NotFound => ApiError::Internal("allocated IP row disappeared".into()),
            err => ApiError::from(err),
        })?;

        // Provisioning completes immediately: the server comes up running.
        let started = Utc::now();
        self.store
            .update_server_state(server.id, ServerState::Running, Stamp::Started, started)
            .await?;

        self.append_event(server.id, started, EventType::Provisioned, "Server provisioned")
            .await;
        self.append_event(server.id, started, EventType::Started, "Server running")
            .await;

        tracing::info!(id = %server.id, region, server_type, ip = %ip.address, "provisioned server");
        counter!(SERVERS_PROVISIONED).increment(1);
        Ok(server.id)
    }

    /// Apply a lifecycle action under the server's stripe lock.
    pub async fn action(&self, id: Uuid, action: ServerAction) -> Result<ServerState, ApiError> {
        let _guard = self.stripe(&id).lock().await;

        let detail = self.store.get_server(id).await?.ok_or(ApiError::NotFound)?;
        let from = detail.server.state;
        let transition = from.transition(action).inspect_err(|_| {
            tracing::warn!(%id, %from, %action, "invalid FSM transition");
        })?;

        let now = Utc::now();
        self.store
            .update_server_state(id, transition.to, transition.stamp, now)
            .await?;

        if action == ServerAction::Terminate {
            self.store.release_server_ip(id).await?;
        }

        for (kind, message) in transition.events {
            self.append_event(id, now, *kind, message).await;
        }

        tracing::info!(%id, %from, to = %transition.to, %action, "applied action");
        counter!(SERVER_ACTIONS, "action" => action.as_str()).increment(1);
        Ok(transition.to)
    }

    /// Terminate a stopped server that has idled past `cutoff`.
    ///
    /// State and `stopped_at` are re-checked under the stripe lock, so a
    /// server started between the reaper's listing and this call survives.
    /// Returns whether the server was reaped.
    pub async fn reap_if_idle(&self, id: Uuid, cutoff: DateTime<Utc>) -> Result<bool, ApiError> {
        let _guard = self.stripe(&id).lock().await;

        let Some(detail) = self.store.get_server(id).await? else {
            return Ok(false);
        };
        let server = &detail.server;
        let idle = server.state == ServerState::Stopped
            && server.stopped_at.is_some_and(|stopped| stopped < cutoff);
        if !idle {
            return Ok(false);
        }

        let transition = server.state.transition(ServerAction::Terminate)?;
        let now = Utc::now();
        self.store
            .update_server_state(id, transition.to, transition.stamp, now)
            .await?;
        self.store.release_server_ip(id).await?;

        for (kind, message) in transition.events {
            self.append_event(id, now, *kind, message).await;
        }
        self.append_event(id, now, EventType::Reaped, "Server reaped after exceeding idle timeout")
            .await;

        tracing::warn!(%id, "reaped idle server");
        Ok(true)
    }

    pub async fn get(&self, id: Uuid) -> Result<ServerDetail, ApiError> {
        self.store
            .get_server(id)
            .await?
            .ok_or(ApiError::NotFound)
    }

    /// Filtered, paginated listing; limit is clamped to `[1, MAX_LIST_LIMIT]`
    /// with `DEFAULT_LIST_LIMIT` when unset.
    pub async fn list(&self, mut filter: ServerFilter) -> Result<Vec<ServerDetail>, ApiError> {
        filter.limit = if filter.limit <= 0 {
            DEFAULT_LIST_LIMIT
        } else {
            filter.limit.min(MAX_LIST_LIMIT)
        };
        filter.offset = filter.offset.max(0);
        Ok(self.store.list_servers(&filter).await?)
    }

    pub async fn last_events(&self, id: Uuid, n: i64) -> Result<Vec<EventLog>, ApiError> {
        Ok(self.store.last_events(id, n).await?)
    }

    // Journal appends happen after the state row is durable; a failed append
    // loses an audit entry but never fabricates a transition, so it is
    // logged and swallowed.
    async fn append_event(
        &self,
        server_id: Uuid,
        timestamp: DateTime<Utc>,
        kind: EventType,
        message: &str,
    ) {
        let event = NewEvent {
            server_id,
            timestamp,
            kind,
            message: message.into(),
        };
        if let Err(err) = self.store.append_event(&event).await {
            tracing::error!(%server_id, %kind, error = %err, "failed to append event");
        }
    }
}
