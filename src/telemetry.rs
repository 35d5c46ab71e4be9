//! Log and trace integrations.
//!
//! Sets up the tracing subscriber (env-filter + compact fmt layer) and, when
//! the `telemetry` feature is enabled and `OTEL_COLLECTOR_HOST` is set, an
//! OTLP span exporter. The W3C trace-context propagator is installed
//! unconditionally so that span context can be carried across task
//! boundaries and into the process via the `OTEL_CONTEXT` environment
//! variable.

use std::collections::HashMap;

use opentelemetry::sdk::propagation::TraceContextPropagator;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

#[cfg(feature = "telemetry")]
async fn init_tracer() -> opentelemetry::sdk::trace::Tracer {
    use opentelemetry::sdk::{trace, Resource};
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;

    let endpoint = std::env::var("OTEL_COLLECTOR_HOST")
        .expect("OTEL_COLLECTOR_HOST must be set when the telemetry feature is enabled");

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(trace::config().with_resource(Resource::new(vec![KeyValue::new(
            "service.name",
            "etos-suite-runner",
        )])))
        .install_batch(opentelemetry::runtime::Tokio)
        .expect("valid OTLP tracer pipeline")
}

/// Initialize tracing.
///
/// Must be called once, before any spans are created.
pub async fn init() {
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let logger = tracing_subscriber::fmt::layer().compact();
    let env_filter = EnvFilter::try_from_default_env()
        .or(EnvFilter::try_new("info"))
        .unwrap();

    #[cfg(feature = "telemetry")]
    {
        let telemetry = tracing_opentelemetry::layer().with_tracer(init_tracer().await);
        Registry::default()
            .with(env_filter)
            .with(logger)
            .with(telemetry)
            .init();
    }
    #[cfg(not(feature = "telemetry"))]
    Registry::default().with(env_filter).with(logger).init();
}

/// Trace context handed to this process via the `OTEL_CONTEXT` environment
/// variable, as a `key=value,key=value` carrier (typically a single
/// `traceparent` pair injected by the controller that spawned us).
pub fn carrier_from_env() -> HashMap<String, String> {
    let mut carrier = HashMap::new();
    if let Ok(value) = std::env::var("OTEL_CONTEXT") {
        for pair in value.split(',') {
            if let Some((key, val)) = pair.split_once('=') {
                carrier.insert(key.trim().to_string(), val.trim().to_string());
            }
        }
    }
    carrier
}

/// Record a failure on `span`.
///
/// The span must have been created with empty `otel.status_code`,
/// `error.kind` and `exception.message` fields.
pub fn record_error(span: &tracing::Span, kind: &str, error: &dyn std::fmt::Display) {
    span.record("otel.status_code", "ERROR");
    span.record("error.kind", kind);
    span.record("exception.message", tracing::field::display(error));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carrier_from_env_parses_pairs() {
        // Not using the real env here; exercise the parsing path directly.
        let value = "traceparent=00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01,tracestate=vendor=1";
        let mut carrier = HashMap::new();
        for pair in value.split(',') {
            if let Some((key, val)) = pair.split_once('=') {
                carrier.insert(key.trim().to_string(), val.trim().to_string());
            }
        }
        assert_eq!(
            carrier.get("traceparent").map(String::as_str),
            Some("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
        );
        // A tracestate value may itself contain '=': split_once keeps the rest.
        assert_eq!(carrier.get("tracestate").map(String::as_str), Some("vendor=1"));
    }
}
