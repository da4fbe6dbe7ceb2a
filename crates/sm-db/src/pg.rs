use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{Billing, EventLog, IpAddress, Server, ServerState, Stamp};
use crate::store::{NewEvent, ServerDetail, ServerFilter, Store, StoreError};

/// Journal entries eagerly loaded on a single-server read.
const EVENT_LOAD_CAP: i64 = 100;

/// Postgres-backed store.
///
/// Address allocation is guarded twice: a row lock inside a transaction is
/// the authoritative serialization, and a process-local mutex keeps
/// concurrent local callers from piling onto the same lock queue.
pub struct PgStore {
    pool: PgPool,
    alloc_mu: Mutex<()>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            alloc_mu: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn allocate_ip(&self) -> Result<Option<IpAddress>, StoreError> {
        let _guard = self.alloc_mu.lock().await;

        let mut tx = self.pool.begin().await?;
        // SKIP LOCKED so a concurrent allocator takes the next free row
        // instead of blocking on this one and re-reading it as taken.
        let ip: Option<IpAddress> = sqlx::query_as(
            r#"SELECT * FROM ip_addresses
               WHERE allocated = false
               ORDER BY id
               LIMIT 1
               FOR UPDATE SKIP LOCKED"#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut ip) = ip else {
            return Ok(None);
        };

        sqlx::query("UPDATE ip_addresses SET allocated = true WHERE id = $1")
            .bind(ip.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        ip.allocated = true;
        Ok(Some(ip))
    }

    async fn release_ip(&self, ip_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE ip_addresses SET allocated = false, server_id = NULL WHERE id = $1")
            .bind(ip_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bind_ip(&self, ip_id: i64, server_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE ip_addresses SET server_id = $1 WHERE id = $2")
            .bind(server_id)
            .bind(ip_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn count_ips(&self) -> Result<(i64, i64), StoreError> {
        let (total, free): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(*) FILTER (WHERE allocated = false) FROM ip_addresses",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((total, free))
    }

    async fn insert_ips(&self, addresses: &[String]) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO ip_addresses (address, allocated)
               SELECT addr, false FROM UNNEST($1::text[]) AS addr
               ON CONFLICT (address) DO NOTHING"#,
        )
        .bind(addresses)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_server(&self, server: &Server) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"INSERT INTO servers (id, region, server_type, ip_id, state,
                                    created_at, updated_at, started_at, stopped_at, terminated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(server.id)
        .bind(&server.region)
        .bind(&server.server_type)
        .bind(server.ip_id)
        .bind(server.state)
        .bind(server.created_at)
        .bind(server.updated_at)
        .bind(server.started_at)
        .bind(server.stopped_at)
        .bind(server.terminated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO billing (server_id) VALUES ($1)")
            .bind(server.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_server(&self, id: Uuid) -> Result<Option<ServerDetail>, StoreError> {
        let server: Option<Server> = sqlx::query_as("SELECT * FROM servers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(server) = server else {
            return Ok(None);
        };

        let ip = match server.ip_id {
            Some(ip_id) => {
                sqlx::query_as("SELECT * FROM ip_addresses WHERE id = $1")
                    .bind(ip_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => None,
        };

        let billing: Option<Billing> = sqlx::query_as("SELECT * FROM billing WHERE server_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let events = self.last_events(id, EVENT_LOAD_CAP).await?;

        Ok(Some(ServerDetail {
            server,
            ip,
            billing,
            events,
        }))
    }

    async fn list_servers(&self, filter: &ServerFilter) -> Result<Vec<ServerDetail>, StoreError> {
        let servers: Vec<Server> = sqlx::query_as(
            r#"SELECT * FROM servers
               WHERE ($1::text IS NULL OR region = $1)
                 AND ($2::server_state IS NULL OR state = $2)
                 AND ($3::text IS NULL OR server_type = $3)
               ORDER BY created_at DESC, id
               LIMIT $4 OFFSET $5"#,
        )
        .bind(filter.region.as_deref())
        .bind(filter.state)
        .bind(filter.server_type.as_deref())
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        if servers.is_empty() {
            return Ok(Vec::new());
        }

        let ip_ids: Vec<i64> = servers.iter().filter_map(|s| s.ip_id).collect();
        let ips: Vec<IpAddress> = sqlx::query_as("SELECT * FROM ip_addresses WHERE id = ANY($1)")
            .bind(&ip_ids)
            .fetch_all(&self.pool)
            .await?;
        let ips: HashMap<i64, IpAddress> = ips.into_iter().map(|ip| (ip.id, ip)).collect();

        let server_ids: Vec<Uuid> = servers.iter().map(|s| s.id).collect();
        let billing: Vec<Billing> = sqlx::query_as("SELECT * FROM billing WHERE server_id = ANY($1)")
            .bind(&server_ids)
            .fetch_all(&self.pool)
            .await?;
        let billing: HashMap<Uuid, Billing> =
            billing.into_iter().map(|b| (b.server_id, b)).collect();

        Ok(servers
            .into_iter()
            .map(|server| {
                let ip = server.ip_id.and_then(|ip_id| ips.get(&ip_id).cloned());
                let billing = billing.get(&server.id).cloned();
                ServerDetail {
                    server,
                    ip,
                    billing,
                    events: Vec::new(),
                }
            })
            .collect())
    }

    async fn update_server_state(
        &self,
        id: Uuid,
        state: ServerState,
        stamp: Stamp,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let query = match stamp {
            Stamp::None => "UPDATE servers SET state = $1, updated_at = $2 WHERE id = $3",
            Stamp::Started => {
                "UPDATE servers SET state = $1, updated_at = $2, started_at = $2 WHERE id = $3"
            }
            Stamp::Stopped => {
                "UPDATE servers SET state = $1, updated_at = $2, stopped_at = $2 WHERE id = $3"
            }
            Stamp::Terminated => {
                "UPDATE servers SET state = $1, updated_at = $2, terminated_at = $2 WHERE id = $3"
            }
        };
        let result = sqlx::query(query)
            .bind(state)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn release_server_ip(&self, server_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE ip_addresses SET allocated = false, server_id = NULL WHERE server_id = $1",
        )
        .bind(server_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE servers SET ip_id = NULL, updated_at = now() WHERE id = $1")
            .bind(server_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn charge(
        &self,
        server_id: Uuid,
        seconds: i64,
        cost: f64,
        billed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE billing
               SET accumulated_seconds = accumulated_seconds + $1,
                   total_cost          = total_cost + $2,
                   last_billed_at      = $3
               WHERE server_id = $4"#,
        )
        .bind(seconds)
        .bind(cost)
        .bind(billed_at)
        .bind(server_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_event(&self, event: &NewEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO event_logs (server_id, timestamp, kind, message)
               VALUES ($1, $2, $3, $4)"#,
        )
        .bind(event.server_id)
        .bind(event.timestamp)
        .bind(event.kind)
        .bind(&event.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_events(&self, server_id: Uuid, n: i64) -> Result<Vec<EventLog>, StoreError> {
        let events = sqlx::query_as(
            r#"SELECT * FROM event_logs
               WHERE server_id = $1
               ORDER BY timestamp DESC, id DESC
               LIMIT $2"#,
        )
        .bind(server_id)
        .bind(n)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}
