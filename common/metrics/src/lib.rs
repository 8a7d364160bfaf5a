use std::time::Instant;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
/// Intended to take a Router as returned by `setup_metrics_routes`, with whatever
/// other routes the caller wants (e.g. liveness) added to it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}

/// Add the Prometheus `/metrics` endpoint to a router.
pub fn setup_metrics_routes(router: Router) -> Router {
    let recorder_handle = setup_metrics_recorder();
    router.route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    )
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const SEND_LATENCY_BUCKETS: &[f64] = &[
        1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(SEND_LATENCY_BUCKETS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// A guard that records the time between creation and drop as a histogram entry.
/// Used at the entry point of every send/consume/batch operation, so a panic or
/// early return still records the elapsed time.
pub struct TimingGuard<'a> {
    name: &'static str,
    labels: &'a [(&'static str, String)],
    start: Instant,
}

pub fn timing_guard<'a>(
    name: &'static str,
    labels: &'a [(&'static str, String)],
) -> TimingGuard<'a> {
    TimingGuard {
        name,
        labels,
        start: Instant::now(),
    }
}

impl Drop for TimingGuard<'_> {
    fn drop(&mut self) {
        metrics::histogram!(self.name, self.labels).record(self.start.elapsed().as_millis() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_guard_records_on_drop() {
        let recorder = metrics_util::debugging::DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, || {
            let _guard = timing_guard("test_latency_ms", &[]);
        });
        let snapshot = snapshotter.snapshot().into_vec();
        assert!(snapshot
            .iter()
            .any(|(key, ..)| key.key().name() == "test_latency_ms"));
    }
}
