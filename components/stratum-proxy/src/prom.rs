//! Prometheus metrics. Registered against the default registry and served
//! on the optional `--prom-port` listener.

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge, Encoder,
    Gauge, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use tracing::info;

static JOBS_RECEIVED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("proxy_jobs_received_total", "mining.notify broadcasts received from the pool")
        .unwrap()
});

static SHARES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "proxy_shares_total",
        "shares handled by the proxy",
        &["worker", "outcome"]
    )
    .unwrap()
});

static GETWORK_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("proxy_getwork_requests_total", "getwork requests answered").unwrap()
});

static LONGPOLL_WAKEUPS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("proxy_longpoll_wakeups_total", "long-poll requests completed by a new block")
        .unwrap()
});

static STRATUM_CLIENTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("proxy_stratum_clients", "connected downstream stratum clients").unwrap()
});

static POOL_DIFFICULTY: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("proxy_pool_difficulty", "current pool difficulty").unwrap()
});

pub fn record_job_received() {
    JOBS_RECEIVED.inc();
}

pub fn record_share(worker: &str, accepted: bool) {
    let outcome = if accepted { "accepted" } else { "rejected" };
    SHARES.with_label_values(&[worker, outcome]).inc();
}

pub fn record_getwork_request() {
    GETWORK_REQUESTS.inc();
}

pub fn record_longpoll_wakeup() {
    LONGPOLL_WAKEUPS.inc();
}

pub fn record_stratum_clients(count: i64) {
    STRATUM_CLIENTS.set(count);
}

pub fn record_pool_difficulty(difficulty: f64) {
    POOL_DIFFICULTY.set(difficulty);
}

async fn metrics_handler() -> ([(axum::http::HeaderName, &'static str); 1], Vec<u8>) {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let _ = encoder.encode(&prometheus::gather(), &mut buffer);
    ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], buffer)
}

/// Serve `/metrics` until the process exits.
pub async fn start_prom_server(port: u16) -> std::io::Result<()> {
    let app = axum::Router::new().route("/metrics", axum::routing::get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("prometheus metrics on http://0.0.0.0:{port}/metrics");
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_the_gathered_set() {
        record_job_received();
        record_share("w1", true);
        record_share("w1", false);
        record_pool_difficulty(512.0);

        let families = prometheus::gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.iter().any(|n| n == "proxy_jobs_received_total"));
        assert!(names.iter().any(|n| n == "proxy_shares_total"));
        assert!(names.iter().any(|n| n == "proxy_pool_difficulty"));
    }
}
