//! Tracing setup: `tracing`/`tracing-subscriber` are always on; OpenTelemetry OTLP export
//! is gated behind the `telemetry` Cargo feature so a deployment can run with plain
//! stdout logs and skip pulling in the OTel stack entirely.

#[cfg(feature = "telemetry")]
mod otel {
    use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
    use opentelemetry_sdk::{
        Resource,
        metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider},
        trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    };
    use opentelemetry_semantic_conventions::{
        SCHEMA_URL,
        attribute::{DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_VERSION},
    };
    use serde::{Deserialize, Serialize};
    use std::env;
    use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    #[allow(clippy::upper_case_acronyms)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum TelemetryProtocol {
        #[serde(rename = "http/protobuf")]
        HTTP,
        #[serde(rename = "grpc")]
        GRPC,
    }

    impl TelemetryProtocol {
        pub fn from_env() -> Option<Self> {
            let is_enabled = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
                || env::var("OTEL_EXPORTER_OTLP_HEADERS").is_ok()
                || env::var("OTEL_EXPORTER_OTLP_PROTOCOL").is_ok();
            if !is_enabled {
                return None;
            }
            let protocol = match env::var("OTEL_EXPORTER_OTLP_PROTOCOL") {
                Ok(string) => match string.as_str() {
                    "grpc" => TelemetryProtocol::GRPC,
                    _ => TelemetryProtocol::HTTP,
                },
                Err(_) => TelemetryProtocol::HTTP,
            };
            Some(protocol)
        }
    }

    fn resource() -> Resource {
        let deployment_env = env::var("DEPLOYMENT_ENV").unwrap_or_else(|_| "develop".to_string());
        Resource::builder()
            .with_service_name(env!("CARGO_PKG_NAME"))
            .with_schema_url(
                [
                    KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
                    KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, deployment_env),
                ],
                SCHEMA_URL,
            )
            .build()
    }

    fn init_meter_provider(protocol: &TelemetryProtocol) -> SdkMeterProvider {
        let exporter = opentelemetry_otlp::MetricExporter::builder();
        let exporter = match protocol {
            TelemetryProtocol::HTTP => exporter
                .with_http()
                .with_temporality(opentelemetry_sdk::metrics::Temporality::default())
                .build(),
            TelemetryProtocol::GRPC => exporter
                .with_tonic()
                .with_temporality(opentelemetry_sdk::metrics::Temporality::default())
                .build(),
        }
        .expect("failed to build OTLP metric exporter");
        let reader = PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(30))
            .build();
        let meter_provider = MeterProviderBuilder::default()
            .with_resource(resource())
            .with_reader(reader)
            .build();
        global::set_meter_provider(meter_provider.clone());
        meter_provider
    }

    fn init_tracer_provider(protocol: &TelemetryProtocol) -> SdkTracerProvider {
        let exporter = opentelemetry_otlp::SpanExporter::builder();
        let exporter = match protocol {
            TelemetryProtocol::HTTP => exporter.with_http().build(),
            TelemetryProtocol::GRPC => exporter.with_tonic().build(),
        }
        .expect("failed to build OTLP span exporter");
        SdkTracerProvider::builder()
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(1.0))))
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(resource())
            .with_batch_exporter(exporter)
            .build()
    }

    pub struct OtelGuard {
        tracer_provider: SdkTracerProvider,
        meter_provider: SdkMeterProvider,
    }

    impl Drop for OtelGuard {
        fn drop(&mut self) {
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("{err:?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
    }

    pub fn try_init() -> Option<OtelGuard> {
        let protocol = TelemetryProtocol::from_env()?;
        let tracer_provider = init_tracer_provider(&protocol);
        let meter_provider = init_meter_provider(&protocol);
        let tracer = tracer_provider.tracer("fcr-facilitator");

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .with(tracing_subscriber::fmt::layer())
            .with(MetricsLayer::new(meter_provider.clone()))
            .with(OpenTelemetryLayer::new(tracer))
            .init();

        tracing::info!(?protocol, "OpenTelemetry export enabled");
        Some(OtelGuard {
            tracer_provider,
            meter_provider,
        })
    }
}

/// Holds whatever telemetry providers were set up, so dropping it flushes them on shutdown.
pub struct Telemetry {
    #[cfg(feature = "telemetry")]
    _guard: Option<otel::OtelGuard>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    /// Initializes tracing. With the `telemetry` feature and `OTEL_EXPORTER_OTLP_*` env
    /// vars set, exports spans/metrics via OTLP; otherwise falls back to `fmt` logging.
    pub fn new() -> Self {
        #[cfg(feature = "telemetry")]
        {
            let guard = otel::try_init();
            if guard.is_none() {
                init_fmt_only();
            }
            Telemetry { _guard: guard }
        }
        #[cfg(not(feature = "telemetry"))]
        {
            init_fmt_only();
            Telemetry {}
        }
    }

    /// A tower layer that records an HTTP request span per request, teacher-style.
    pub fn http_tracing(&self) -> tower_http::trace::TraceLayer<tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>> {
        tower_http::trace::TraceLayer::new_for_http()
    }
}

fn init_fmt_only() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    tracing::info!("OpenTelemetry export is not enabled");
}
