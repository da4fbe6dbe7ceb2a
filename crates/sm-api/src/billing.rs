use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sm_db::models::ServerState;
use sm_db::{ServerDetail, ServerFilter, Store};

use crate::config::AppConfig;
use crate::metrics::{BILLED_SERVERS, BILLING_TICKS};

/// Servers examined per daemon tick, at most.
pub const TICK_LIST_CAP: i64 = 1000;

/// Spawn the billing daemon: on every tick, charge each running server for
/// the uptime accrued since it was last billed.
pub fn spawn(
    store: Arc<dyn Store>,
    config: &AppConfig,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let billing_rate = config.billing_rate;
    let interval = config.billing_interval;
    let tick_timeout = config.request_timeout;

    tokio::spawn(async move {
        tracing::info!(?interval, rate = billing_rate, "billing daemon started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("billing daemon stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            // Each tick runs in its own task so a panic is confined to that
            // tick and the loop keeps going.
            let store = store.clone();
            let tick = tokio::spawn(async move {
                match tokio::time::timeout(tick_timeout, run_tick(store.as_ref(), billing_rate))
                    .await
                {
                    Ok(billed) => billed,
                    Err(_) => {
                        tracing::warn!("billing tick exceeded deadline");
                        0
                    }
                }
            });
            if let Err(err) = tick.await {
                if err.is_panic() {
                    tracing::error!("billing tick panicked; continuing");
                }
            }
        }
    })
}

/// One metering pass over running servers. Per-server updates run
/// concurrently; individual failures are logged and skipped. Returns the
/// number of servers billed.
pub async fn run_tick(store: &dyn Store, billing_rate: f64) -> usize {
    counter!(BILLING_TICKS).increment(1);

    let filter = ServerFilter::by_state(ServerState::Running, TICK_LIST_CAP);
    let servers = match store.list_servers(&filter).await {
        Ok(servers) => servers,
        Err(err) => {
            tracing::error!(error = %err, "billing: failed to list running servers");
            return 0;
        }
    };

    let now = Utc::now();
    let rate_per_second = billing_rate / 3600.0;
    let charges: Vec<(Uuid, i64, f64)> = servers
        .iter()
        .filter_map(|detail| charge_for(detail, now, rate_per_second))
        .collect();

    let results = join_all(charges.into_iter().map(|(id, seconds, cost)| async move {
        match store.charge(id, seconds, cost, now).await {
            Ok(()) => {
                tracing::debug!(%id, seconds, cost, "billed server");
                true
            }
            Err(err) => {
                tracing::error!(%id, error = %err, "billing: failed to update meter");
                false
            }
        }
    }))
    .await;

    let billed = results.into_iter().filter(|ok| *ok).count();
    if billed > 0 {
        counter!(BILLED_SERVERS).increment(billed as u64);
    }
    billed
}

/// Compute the charge for one server, metering from the later of
/// `started_at` and `last_billed_at` so overlapping ticks never bill the
/// same interval twice. `None` means nothing to charge.
fn charge_for(
    detail: &ServerDetail,
    now: DateTime<Utc>,
    rate_per_second: f64,
) -> Option<(Uuid, i64, f64)> {
    let started = detail.server.started_at?;
    let anchor = match detail.billing.as_ref().and_then(|b| b.last_billed_at) {
        Some(last_billed) if last_billed > started => last_billed,
        _ => started,
    };
    let delta = (now - anchor).num_milliseconds() as f64 / 1000.0;
    if delta <= 0.0 {
        return None;
    }
    Some((
        detail.server.id,
        delta.floor() as i64,
        rate_per_second * delta,
    ))
}
