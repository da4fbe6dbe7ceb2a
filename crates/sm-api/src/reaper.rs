use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sm_db::models::ServerState;
use sm_db::{ServerFilter, Store};

use crate::billing::TICK_LIST_CAP;
use crate::config::AppConfig;
use crate::metrics::SERVERS_REAPED;
use crate::service::ServerService;

/// Spawn the idle reaper: on every tick, terminate servers that have been
/// stopped for longer than the configured idle timeout.
pub fn spawn(
    store: Arc<dyn Store>,
    service: Arc<ServerService>,
    config: &AppConfig,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let interval = config.reaper_interval;
    let idle_timeout = config.idle_timeout;
    let tick_timeout = config.request_timeout;

    tokio::spawn(async move {
        tracing::info!(?interval, ?idle_timeout, "idle reaper started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("idle reaper stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let store = store.clone();
            let service = service.clone();
            let tick = tokio::spawn(async move {
                match tokio::time::timeout(
                    tick_timeout,
                    run_tick(store.as_ref(), service.as_ref(), idle_timeout),
                )
                .await
                {
                    Ok(reaped) => reaped,
                    Err(_) => {
                        tracing::warn!("reaper tick exceeded deadline");
                        0
                    }
                }
            });
            if let Err(err) = tick.await {
                if err.is_panic() {
                    tracing::error!("reaper tick panicked; continuing");
                }
            }
        }
    })
}

/// One reap pass. Termination goes through the lifecycle service so address
/// release and journaling match a manual terminate; each candidate is
/// re-validated under its server lock. Returns the number of servers reaped.
pub async fn run_tick(
    store: &dyn Store,
    service: &ServerService,
    idle_timeout: Duration,
) -> usize {
    let cutoff = chrono::Utc::now() - idle_timeout;

    let filter = ServerFilter::by_state(ServerState::Stopped, TICK_LIST_CAP);
    let servers = match store.list_servers(&filter).await {
        Ok(servers) => servers,
        Err(err) => {
            tracing::error!(error = %err, "reaper: failed to list stopped servers");
            return 0;
        }
    };

    let candidates: Vec<Uuid> = servers
        .iter()
        .filter(|detail| {
            detail
                .server
                .stopped_at
                .is_some_and(|stopped| stopped < cutoff)
        })
        .map(|detail| detail.server.id)
        .collect();

    let results = join_all(candidates.into_iter().map(|id| async move {
        match service.reap_if_idle(id, cutoff).await {
            Ok(reaped) => reaped,
            Err(err) => {
                tracing::error!(%id, error = %err, "reaper: failed to terminate server");
                false
            }
        }
    }))
    .await;

    let reaped = results.into_iter().filter(|reaped| *reaped).count();
    if reaped > 0 {
        counter!(SERVERS_REAPED).increment(reaped as u64);
    }
    reaped
}
