use std::sync::OnceLock;

use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const SERVERS_PROVISIONED: &str = "servers_provisioned_total";
pub const SERVER_ACTIONS: &str = "server_actions_total";
pub const SERVERS_REAPED: &str = "servers_reaped_total";
pub const BILLING_TICKS: &str = "billing_ticks_total";
pub const BILLED_SERVERS: &str = "billed_servers_total";
pub const IP_POOL_EXHAUSTED: &str = "ip_pool_exhausted_total";

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder and register counter descriptions.
///
/// Safe to call more than once; later calls return the existing handle.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|err| panic!("failed to install prometheus recorder: {err}"));

            describe_counter!(SERVERS_PROVISIONED, "Total servers provisioned");
            describe_counter!(SERVER_ACTIONS, "Total lifecycle actions applied, by action");
            describe_counter!(SERVERS_REAPED, "Total servers terminated by the idle reaper");
            describe_counter!(BILLING_TICKS, "Total billing daemon ticks");
            describe_counter!(BILLED_SERVERS, "Total per-server billing updates");
            describe_counter!(IP_POOL_EXHAUSTED, "Total provision attempts rejected for lack of IPs");

            handle
        })
        .clone()
}

/// The global handle, if `init_metrics` has run.
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Prometheus exposition text; empty until the recorder is installed.
pub fn render() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}
