//! Named metrics and tracing spans for the messaging façade (§4.H).
//!
//! Call sites elsewhere in the crate go through these helpers rather than
//! invoking `metrics::counter!`/`histogram!` ad hoc, so the metric names and
//! label sets in this one file are the only place that needs to change if
//! either ever does. The `metrics` crate's global recorder is installed once
//! per process by the embedding application (same as the reference
//! codebase's `common_metrics::setup_metrics_recorder`); these helpers just
//! call the macros and assume a recorder is already in place (a missing
//! recorder makes them no-ops, never a panic).

use std::time::{Duration, Instant};

use tracing::Span;

/// Records a single-message send outcome: `messages_sent_total{success}` and
/// the `send_latency_ms` histogram, both tagged by topic and entity type.
pub fn record_send(topic: &str, entity_type: &str, success: bool, elapsed: Duration) {
    metrics::counter!(
        "messages_sent_total",
        "topic" => topic.to_string(),
        "entity_type" => entity_type.to_string(),
        "success" => success.to_string(),
    )
    .increment(1);
    metrics::histogram!(
        "send_latency_ms",
        "topic" => topic.to_string(),
        "entity_type" => entity_type.to_string(),
    )
    .record(elapsed.as_secs_f64() * 1000.0);
}

/// Records a batch send outcome: `batches_sent_total{success}`.
pub fn record_batch(topic: &str, entity_type: &str, all_successful: bool) {
    metrics::counter!(
        "batches_sent_total",
        "topic" => topic.to_string(),
        "entity_type" => entity_type.to_string(),
        "success" => all_successful.to_string(),
    )
    .increment(1);
}

/// Records a decoded message handed back to the caller from `Consume`/
/// `Fetch`: `messages_received_total` plus the `processing_time_ms`
/// histogram for however long the caller's handler/fold took.
pub fn record_receive(topic: &str, entity_type: &str, processing_time: Duration) {
    metrics::counter!(
        "messages_received_total",
        "topic" => topic.to_string(),
        "entity_type" => entity_type.to_string(),
    )
    .increment(1);
    metrics::histogram!(
        "processing_time_ms",
        "topic" => topic.to_string(),
        "entity_type" => entity_type.to_string(),
    )
    .record(processing_time.as_secs_f64() * 1000.0);
}

/// A `TimingGuard`-style start handle for the spans named in §4.H. Kept as a
/// thin wrapper (rather than calling `tracing::info_span!` directly at each
/// call site) so the span names in this module are the single source of
/// truth for what §4.H calls them.
pub struct OperationTiming {
    started: Instant,
}

impl OperationTiming {
    pub fn start() -> Self {
        Self { started: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

macro_rules! op_span {
    ($name:ident, $span_name:literal) => {
        pub fn $name(trace_context: Option<&str>) -> Span {
            tracing::info_span!(
                $span_name,
                trace_context = trace_context.unwrap_or(""),
                otel.status_code = tracing::field::Empty,
                otel.status_description = tracing::field::Empty,
            )
        }
    };
}

op_span!(send_span, "kafka.send");
op_span!(send_batch_span, "kafka.send_batch");
op_span!(consume_stream_span, "kafka.consume_stream");
op_span!(fetch_batch_span, "kafka.fetch_batch");
op_span!(batch_send_optimized_span, "kafka.batch_send_optimized");
op_span!(consume_batches_span, "kafka.consume_batches");

/// Marks `span` with the outcome of the operation it wraps: `OK` on
/// success, `Error` with the rendered message on failure. Mirrors
/// OpenTelemetry's span-status convention (`tracing-opentelemetry` maps
/// these fields onto it) without taking a hard dependency on that crate.
pub fn record_outcome<T, E: std::fmt::Display>(span: &Span, result: &Result<T, E>) {
    match result {
        Ok(_) => span.record("otel.status_code", "OK"),
        Err(e) => {
            span.record("otel.status_code", "ERROR");
            span.record("otel.status_description", e.to_string().as_str())
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_send_and_batch_do_not_panic_without_a_recorder_assertion() {
        // No DebuggingRecorder installed here deliberately: this just
        // exercises that the macros don't panic when called normally, the
        // way every real call site does.
        record_send("orders", "Order", true, Duration::from_millis(5));
        record_batch("orders", "Order", false);
        record_receive("orders", "Order", Duration::from_millis(1));
    }

    #[test]
    fn operation_timing_elapses() {
        let timing = OperationTiming::start();
        assert!(timing.elapsed() >= Duration::ZERO);
    }
}
