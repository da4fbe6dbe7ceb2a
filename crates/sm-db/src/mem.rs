use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Billing, EventLog, IpAddress, Server, ServerState, Stamp};
use crate::store::{NewEvent, ServerDetail, ServerFilter, Store, StoreError};

const EVENT_LOAD_CAP: usize = 100;

#[derive(Default)]
struct Inner {
    ips: BTreeMap<i64, IpAddress>,
    next_ip_id: i64,
    servers: HashMap<Uuid, Server>,
    billing: HashMap<Uuid, Billing>,
    events: Vec<EventLog>,
    next_event_id: i64,
}

/// In-memory store with the same observable semantics as `PgStore`.
///
/// Every test that exercises the allocator, the lifecycle service or the
/// HTTP surface runs against this instead of a live database.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sort_newest_first(servers: &mut [Server]) {
    servers.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[async_trait]
impl Store for MemStore {
    async fn allocate_ip(&self) -> Result<Option<IpAddress>, StoreError> {
        let mut inner = self.lock();
        let free = inner
            .ips
            .values()
            .find(|ip| !ip.allocated)
            .map(|ip| ip.id);
        let Some(id) = free else {
            return Ok(None);
        };
        match inner.ips.get_mut(&id) {
            Some(ip) => {
                ip.allocated = true;
                Ok(Some(ip.clone()))
            }
            None => Ok(None),
        }
    }

    async fn release_ip(&self, ip_id: i64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(ip) = inner.ips.get_mut(&ip_id) {
            ip.allocated = false;
            ip.server_id = None;
        }
        Ok(())
    }

    async fn bind_ip(&self, ip_id: i64, server_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let ip = inner.ips.get_mut(&ip_id).ok_or(StoreError::NotFound)?;
        ip.server_id = Some(server_id);
        Ok(())
    }

    async fn count_ips(&self) -> Result<(i64, i64), StoreError> {
        let inner = self.lock();
        let total = inner.ips.len() as i64;
        let free = inner.ips.values().filter(|ip| !ip.allocated).count() as i64;
        Ok((total, free))
    }

    async fn insert_ips(&self, addresses: &[String]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for address in addresses {
            if inner.ips.values().any(|ip| &ip.address == address) {
                continue;
            }
            inner.next_ip_id += 1;
            let id = inner.next_ip_id;
            inner.ips.insert(
                id,
                IpAddress {
                    id,
                    address: address.clone(),
                    allocated: false,
                    server_id: None,
                },
            );
        }
        Ok(())
    }

    async fn insert_server(&self, server: &Server) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.servers.insert(server.id, server.clone());
        inner.billing.insert(
            server.id,
            Billing {
                server_id: server.id,
                accumulated_seconds: 0,
                last_billed_at: None,
                total_cost: 0.0,
            },
        );
        Ok(())
    }

    async fn get_server(&self, id: Uuid) -> Result<Option<ServerDetail>, StoreError> {
        let inner = self.lock();
        let Some(server) = inner.servers.get(&id).cloned() else {
            return Ok(None);
        };
        let ip = server
            .ip_id
            .and_then(|ip_id| inner.ips.get(&ip_id).cloned());
        let billing = inner.billing.get(&id).cloned();

        let mut events: Vec<EventLog> = inner
            .events
            .iter()
            .filter(|e| e.server_id == id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        events.truncate(EVENT_LOAD_CAP);

        Ok(Some(ServerDetail {
            server,
            ip,
            billing,
            events,
        }))
    }

    async fn list_servers(&self, filter: &ServerFilter) -> Result<Vec<ServerDetail>, StoreError> {
        let inner = self.lock();
        let mut servers: Vec<Server> = inner
            .servers
            .values()
            .filter(|s| {
                filter.region.as_ref().is_none_or(|r| &s.region == r)
                    && filter.state.is_none_or(|st| s.state == st)
                    && filter.server_type.as_ref().is_none_or(|t| &s.server_type == t)
            })
            .cloned()
            .collect();
        sort_newest_first(&mut servers);

        let offset = filter.offset.max(0) as usize;
        let limit = filter.limit.max(0) as usize;
        Ok(servers
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|server| {
                let ip = server
                    .ip_id
                    .and_then(|ip_id| inner.ips.get(&ip_id).cloned());
                let billing = inner.billing.get(&server.id).cloned();
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
        let mut inner = self.lock();
        let server = inner.servers.get_mut(&id).ok_or(StoreError::NotFound)?;
        server.state = state;
        server.updated_at = now;
        match stamp {
            Stamp::None => {}
            Stamp::Started => server.started_at = Some(now),
            Stamp::Stopped => server.stopped_at = Some(now),
            Stamp::Terminated => server.terminated_at = Some(now),
        }
        Ok(())
    }

    async fn release_server_ip(&self, server_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for ip in inner.ips.values_mut() {
            if ip.server_id == Some(server_id) {
                ip.allocated = false;
                ip.server_id = None;
            }
        }
        if let Some(server) = inner.servers.get_mut(&server_id) {
            server.ip_id = None;
            server.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn charge(
        &self,
        server_id: Uuid,
        seconds: i64,
        cost: f64,
        billed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(billing) = inner.billing.get_mut(&server_id) {
            billing.accumulated_seconds += seconds;
            billing.total_cost += cost;
            billing.last_billed_at = Some(billed_at);
        }
        Ok(())
    }

    async fn append_event(&self, event: &NewEvent) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.next_event_id += 1;
        let id = inner.next_event_id;
        inner.events.push(EventLog {
            id,
            server_id: event.server_id,
            timestamp: event.timestamp,
            kind: event.kind,
            message: event.message.clone(),
        });
        Ok(())
    }

    async fn last_events(&self, server_id: Uuid, n: i64) -> Result<Vec<EventLog>, StoreError> {
        let inner = self.lock();
        let mut events: Vec<EventLog> = inner
            .events
            .iter()
            .filter(|e| e.server_id == server_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        events.truncate(n.max(0) as usize);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::models::EventType;

    fn server(id: Uuid, region: &str, created_at: DateTime<Utc>) -> Server {
        Server {
            id,
            region: region.into(),
            server_type: "t2.micro".into(),
            ip_id: None,
            state: ServerState::Provisioning,
            created_at,
            updated_at: created_at,
            started_at: None,
            stopped_at: None,
            terminated_at: None,
        }
    }

    #[tokio::test]
    async fn allocates_lowest_free_id_first() {
        let store = MemStore::new();
        store
            .insert_ips(&["10.0.0.1".into(), "10.0.0.2".into()])
            .await
            .unwrap();

        let first = store.allocate_ip().await.unwrap().unwrap();
        let second = store.allocate_ip().await.unwrap().unwrap();
        assert_eq!(first.address, "10.0.0.1");
        assert_eq!(second.address, "10.0.0.2");
        assert!(store.allocate_ip().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_allocation_hands_out_distinct_addresses() {
        let store = Arc::new(MemStore::new());
        let addresses: Vec<String> = (1..=8).map(|i| format!("10.0.0.{i}")).collect();
        store.insert_ips(&addresses).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move { store.allocate_ip().await.unwrap() }));
        }

        let mut seen = Vec::new();
        for task in tasks {
            if let Some(ip) = task.await.unwrap() {
                seen.push(ip.address);
            }
        }
        // Pool of 8: exactly 8 of 16 callers win, all with distinct addresses.
        assert_eq!(seen.len(), 8);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 8);
    }

    #[tokio::test]
    async fn released_address_is_allocatable_again() {
        let store = MemStore::new();
        store.insert_ips(&["10.0.0.1".into()]).await.unwrap();

        let ip = store.allocate_ip().await.unwrap().unwrap();
        store.bind_ip(ip.id, Uuid::new_v4()).await.unwrap();
        assert!(store.allocate_ip().await.unwrap().is_none());

        store.release_ip(ip.id).await.unwrap();
        store.release_ip(ip.id).await.unwrap(); // idempotent

        let again = store.allocate_ip().await.unwrap().unwrap();
        assert_eq!(again.id, ip.id);
        assert_eq!(again.server_id, None);
    }

    #[tokio::test]
    async fn bind_unknown_ip_is_not_found() {
        let store = MemStore::new();
        let err = store.bind_ip(42, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn list_orders_newest_first_and_pages() {
        let store = MemStore::new();
        let base = Utc::now();
        for i in 0..5 {
            let created = base - chrono::Duration::seconds(i);
            store
                .insert_server(&server(Uuid::new_v4(), "r1", created))
                .await
                .unwrap();
        }

        let filter = ServerFilter {
            limit: 2,
            ..Default::default()
        };
        let page1 = store.list_servers(&filter).await.unwrap();
        assert_eq!(page1.len(), 2);
        assert!(page1[0].server.created_at >= page1[1].server.created_at);

        let filter = ServerFilter {
            limit: 2,
            offset: 2,
            ..Default::default()
        };
        let page2 = store.list_servers(&filter).await.unwrap();
        assert_eq!(page2.len(), 2);
        assert!(page1[1].server.created_at >= page2[0].server.created_at);

        // Same arguments, same result.
        let again = store.list_servers(&filter).await.unwrap();
        let ids: Vec<Uuid> = again.iter().map(|d| d.server.id).collect();
        let expect: Vec<Uuid> = page2.iter().map(|d| d.server.id).collect();
        assert_eq!(ids, expect);
    }

    #[tokio::test]
    async fn insert_server_creates_zeroed_billing() {
        let store = MemStore::new();
        let id = Uuid::new_v4();
        store.insert_server(&server(id, "r1", Utc::now())).await.unwrap();

        let detail = store.get_server(id).await.unwrap().unwrap();
        let billing = detail.billing.unwrap();
        assert_eq!(billing.accumulated_seconds, 0);
        assert_eq!(billing.total_cost, 0.0);
        assert!(billing.last_billed_at.is_none());
    }

    #[tokio::test]
    async fn journal_reads_newest_first() {
        let store = MemStore::new();
        let id = Uuid::new_v4();
        let base = Utc::now();
        for (i, kind) in [EventType::Provisioned, EventType::Started, EventType::Stopped]
            .into_iter()
            .enumerate()
        {
            store
                .append_event(&NewEvent {
                    server_id: id,
                    timestamp: base + chrono::Duration::seconds(i as i64),
                    kind,
                    message: kind.to_string(),
                })
                .await
                .unwrap();
        }

        let events = store.last_events(id, 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventType::Stopped);
        assert_eq!(events[1].kind, EventType::Started);
    }
}
