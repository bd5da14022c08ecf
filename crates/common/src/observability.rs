use std::borrow::Cow;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

/// Counter incremented for every ERROR-level event.
pub const ERROR_EVENTS_METRIC: &str = "hub_tracing_error_events";

/// Flushes the global tracer provider when dropped. Hold it for the life of `main`.
pub struct OtelGuard {
    _private: (),
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

struct ErrorCounterLayer;

impl<S> Layer<S> for ErrorCounterLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::ERROR {
            let target = event.metadata().target().to_string();
            metrics::counter!(ERROR_EVENTS_METRIC, "target" => target).increment(1);
        }
    }
}

fn json_layer<S>() -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .json()
}

fn otlp_tracer_provider(
    endpoint: String,
    service_name: &str,
) -> Option<opentelemetry_sdk::trace::TracerProvider> {
    use opentelemetry_otlp::WithExportConfig;

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(err) => {
            eprintln!("otlp exporter disabled: {err}");
            return None;
        }
    };

    let resource = Resource::new(vec![KeyValue::new(
        "service.name",
        service_name.to_string(),
    )]);

    // Batch export needs a running Tokio runtime; hubd is `#[tokio::main]`.
    Some(
        opentelemetry_sdk::trace::TracerProvider::builder()
            .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
            .with_resource(resource)
            .build(),
    )
}

/// Build the `tracing` dispatcher used by `hubd`.
///
/// - JSON lines on stdout
/// - `RUST_LOG` wins over `default_level`
/// - ERROR events counted in [`ERROR_EVENTS_METRIC`]
/// - spans exported over OTLP/HTTP only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set
pub fn build_dispatch(
    service_name: impl Into<Cow<'static, str>>,
    default_level: &str,
) -> (tracing::Dispatch, Option<OtelGuard>) {
    let service_name = service_name.into();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let base = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer())
        .with(ErrorCounterLayer);

    let provider = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|endpoint| otlp_tracer_provider(endpoint, &service_name));

    match provider {
        Some(provider) => {
            let tracer = provider.tracer("hub_reputation");
            let _ = opentelemetry::global::set_tracer_provider(provider);
            let subscriber = base.with(tracing_opentelemetry::layer().with_tracer(tracer));
            (
                tracing::Dispatch::new(subscriber),
                Some(OtelGuard { _private: () }),
            )
        }
        None => (tracing::Dispatch::new(base), None),
    }
}
