use anyhow::Result;
use axum::{routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

pub static DEPOSITS_PROCESSED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "deposits_processed_total",
        "Total deposits processed (credited)"
    )
    .expect("metric registers once")
});

pub static DEPOSITS_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("deposits_errors_total", "Total deposit processing errors")
        .expect("metric registers once")
});

pub static COLLISIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "collisions_total",
        "Total collisions detected during amount-diff matching"
    )
    .expect("metric registers once")
});

pub static POLLER_LAST_SUCCESS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "poller_last_success_unixtime",
        "Unix time of last successful poll"
    )
    .expect("metric registers once")
});

pub static WEBHOOK_SUCCESS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("webhook_success_total", "Successful webhook deliveries")
        .expect("metric registers once")
});

pub static WEBHOOK_FAIL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("webhook_fail_total", "Failed webhook delivery attempts")
        .expect("metric registers once")
});

/// Prometheus text exposition of the default registry.
pub fn render() -> Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

async fn metrics_handler() -> String {
    render().unwrap_or_default()
}

/// Serve `/metrics` on the given port until the process exits.
pub async fn serve(port: u16) -> Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("metrics exposition listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_registered_series() {
        DEPOSITS_PROCESSED.inc();
        COLLISIONS.inc();
        POLLER_LAST_SUCCESS.set(1_700_000_000);
        let text = render().unwrap();
        assert!(text.contains("deposits_processed_total"));
        assert!(text.contains("collisions_total"));
        assert!(text.contains("poller_last_success_unixtime 1700000000"));
    }
}
