//! # Telemetry Features
//!
//! Console logging through `tracing-subscriber` is always on and filtered by
//! `RUST_LOG` (default `info`). OpenTelemetry export is opt-in.
//!
//! ## Feature matrix
//!
//! - `otel`: exports spans (HTTP requests, claims) through
//!   `tracing-opentelemetry`.
//! - `metrics`: exports claim counters and latency histograms.
//! - `otlp`: OTLP/gRPC exporter. The collector address is read from
//!   `OTEL_EXPORTER_OTLP_ENDPOINT`.
//! - `stdout`: stdout exporter, for local inspection.
//!
//! ## Feature constraints
//!
//! - Exporters require at least one of `otel` or `metrics`.
//! - `otlp` and `stdout` can be enabled together.
//!
//! ## Span behavior
//!
//! - Each HTTP request opens an `http_request` span; each claim opens a
//!   `claim` span inside it.
//! - Events inside a span become span events in the backend. Events outside
//!   any span are only printed to the console.
//!
//! ## Example usage
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 \
//!     cargo run -p ticketer-server --features otel,metrics,otlp
//! ```
//!
//! ```bash
//! cargo run -p ticketer-server --features otel,stdout -- --backend memory
//! ```

#[cfg(all(feature = "otlp", not(any(feature = "otel", feature = "metrics"))))]
compile_error!("The 'otlp' feature requires at least one of 'otel' or 'metrics' to be enabled.");

#[cfg(all(feature = "stdout", not(any(feature = "otel", feature = "metrics"))))]
compile_error!("The 'stdout' feature requires at least one of 'otel' or 'metrics' to be enabled.");

use std::sync::atomic::{AtomicI64, Ordering};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "otel")))]
use opentelemetry_otlp::{Protocol, WithExportConfig};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "otel"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "otel")]
use opentelemetry_sdk::trace as sdktrace;

pub struct TelemetryProviders {
    #[cfg(feature = "otel")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes pending spans and metrics, then stops the exporters.
    pub fn shutdown(&self) {
        #[cfg(feature = "otel")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry(_service_name: &str) -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "otel")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "otel")]
    let tracer_provider = init_tracer(_service_name)?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics(_service_name)?;

    #[cfg(any(feature = "metrics", feature = "otel"))]
    let scope = InstrumentationScope::builder("ticketer")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    // Console output is independent of the `stdout` exporter; it prints
    // events as human-readable lines.
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        );

    #[cfg(feature = "otel")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "otel")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "otel")))]
fn otlp_endpoint() -> anyhow::Result<String> {
    use anyhow::Context;

    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").context("missing `OTEL_EXPORTER_OTLP_ENDPOINT`")
}

#[cfg(any(feature = "metrics", feature = "otel"))]
fn resource(service_name: &str) -> Resource {
    Resource::builder()
        .with_service_name(service_name.to_owned())
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics(service_name: &str) -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource(service_name));

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(otlp_endpoint()?)
            .with_protocol(Protocol::Grpc)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_temporality(sdkmetrics::Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "otel")]
fn init_tracer(service_name: &str) -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource(service_name));

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        let batch = sdktrace::BatchSpanProcessor::builder(SpanExporter::default())
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(otlp_endpoint()?)
            .with_protocol(Protocol::Grpc)
            .with_timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build tracer exporter")?;

        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();

        builder.with_span_processor(batch)
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
static REQUESTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CLAIMS_INFLIGHT: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CLAIMS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static CLAIM_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TICKETS_ISSUED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TICKETS_PER_CLAIM: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = REQUESTS.set(
        meter
            .u64_counter("requests")
            .with_description("Total ticket requests")
            .build(),
    );

    let _ = CLAIMS_INFLIGHT.set(
        meter
            .i64_up_down_counter("claims_inflight")
            .with_description("Claims holding a transaction")
            .build(),
    );

    let _ = CLAIMS.set(
        meter
            .u64_counter("claims")
            .with_description("Finished claims by operation and outcome")
            .build(),
    );

    let _ = CLAIM_DURATION_MS.set(
        meter
            .f64_histogram("claim_duration")
            .with_unit("ms")
            .with_description("Claim latency from connection acquisition to commit")
            .build(),
    );

    let _ = TICKETS_ISSUED.set(
        meter
            .u64_counter("tickets_issued")
            .with_description("Total tickets issued")
            .build(),
    );

    let _ = TICKETS_PER_CLAIM.set(
        meter
            .f64_histogram("tickets_per_claim")
            .with_description("Tickets issued per successful claim")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn increment_requests() {
    if let Some(counter) = REQUESTS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests() {}

static CLAIMS_INFLIGHT_NOW: AtomicI64 = AtomicI64::new(0);

/// Holds one claim in the `claims_inflight` gauge until dropped, so a request
/// cancelled mid-claim is still released.
#[must_use = "the claim leaves the gauge as soon as the guard drops"]
pub struct InflightClaim(());

impl InflightClaim {
    pub fn start() -> Self {
        CLAIMS_INFLIGHT_NOW.fetch_add(1, Ordering::Relaxed);
        add_claims_inflight(1);
        Self(())
    }
}

impl Drop for InflightClaim {
    fn drop(&mut self) {
        CLAIMS_INFLIGHT_NOW.fetch_sub(1, Ordering::Relaxed);
        add_claims_inflight(-1);
    }
}

/// Claims currently holding an [`InflightClaim`].
pub fn claims_inflight() -> i64 {
    CLAIMS_INFLIGHT_NOW.load(Ordering::Relaxed)
}

#[cfg(feature = "metrics")]
fn add_claims_inflight(delta: i64) {
    if let Some(counter) = CLAIMS_INFLIGHT.get() {
        counter.add(delta, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
fn add_claims_inflight(_delta: i64) {}

/// Counts one finished claim and records its latency.
#[cfg(feature = "metrics")]
pub fn record_claim(op: &'static str, outcome: &'static str, duration_ms: f64) {
    let attrs = [KeyValue::new("op", op), KeyValue::new("outcome", outcome)];
    if let Some(counter) = CLAIMS.get() {
        counter.add(1, &attrs);
    }
    if let Some(histogram) = CLAIM_DURATION_MS.get() {
        histogram.record(duration_ms, &attrs);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_claim(_op: &'static str, _outcome: &'static str, _duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn record_tickets_issued(count: u64) {
    if let Some(counter) = TICKETS_ISSUED.get() {
        counter.add(count, &[]);
    }
    if let Some(histogram) = TICKETS_PER_CLAIM.get() {
        histogram.record(count as f64, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_tickets_issued(_count: u64) {}
