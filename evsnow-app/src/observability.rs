//! The production [`Tracer`] implementation and process-wide logging/OTLP
//! setup. `evsnow-core` depends only on the `Tracer` trait (spec.md §9
//! design notes: "replace with a small Tracer interface... default
//! no-op"); this module is the only place in the workspace that touches
//! `tracing-subscriber` or the `opentelemetry*` crates directly, matching
//! SPEC_FULL.md §1.1's ambient-stack section.

use crate::config::ObservabilityConfig;
use evsnow_core::{AttrValue, SpanHandle, Tracer};
use opentelemetry::metrics::Counter;
use opentelemetry::{global, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::Resource;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber: an `EnvFilter` (`RUST_LOG`,
/// defaulting to `info`) plus a stdout formatter, and — when
/// `observability.otlp_endpoint` is configured — an OTLP log exporter
/// bridged in via `opentelemetry-appender-tracing` so every `tracing`
/// event is also shipped as an OpenTelemetry log record. Returns the
/// logger provider so `main` can flush it on shutdown; `None` if OTLP
/// export isn't configured.
pub fn install(config: &ObservabilityConfig) -> Option<SdkLoggerProvider> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let resource = Resource::builder().with_service_name(config.service_name.clone()).build();

    let Some(endpoint) = config.otlp_endpoint.as_ref() else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        return None;
    };

    let log_exporter = opentelemetry_otlp::LogExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .expect("building the OTLP log exporter should not fail on valid configuration");

    let logger_provider = SdkLoggerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(log_exporter)
        .build();

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .expect("building the OTLP metric exporter should not fail on valid configuration");

    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_periodic_exporter(metric_exporter)
        .build();
    global::set_meter_provider(meter_provider);

    let otel_bridge = OpenTelemetryTracingBridge::new(&logger_provider);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(otel_bridge)
        .init();

    Some(logger_provider)
}

/// The [`Tracer`] every long-running component in this binary is handed.
/// Spans become `tracing` spans (picked up by the fmt layer and, when
/// configured, exported as OTel logs by the bridge installed above);
/// counters become OpenTelemetry metrics instruments, lazily created and
/// cached by name the first time each is used.
pub struct TracingTracer {
    counters: Mutex<HashMap<&'static str, Counter<u64>>>,
}

impl TracingTracer {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn counter(&self, name: &'static str) -> Counter<u64> {
        let mut counters = self.counters.lock().expect("lock poisoned");
        counters
            .entry(name)
            .or_insert_with(|| global::meter("evsnow").u64_counter(name).build())
            .clone()
    }
}

impl Default for TracingTracer {
    fn default() -> Self {
        Self::new()
    }
}

fn to_key_values(attrs: &[(&'static str, AttrValue)]) -> Vec<KeyValue> {
    attrs.iter().map(|(k, v)| KeyValue::new(*k, v.to_string())).collect()
}

struct TracingSpanHandle(tracing::span::EnteredSpan);

impl SpanHandle for TracingSpanHandle {
    fn set_attr(&mut self, key: &'static str, value: AttrValue) {
        tracing::event!(target: "evsnow", tracing::Level::DEBUG, attr.key = key, attr.value = %value);
    }
}

impl Tracer for TracingTracer {
    fn span(&self, name: &'static str, attrs: &[(&'static str, AttrValue)]) -> Box<dyn SpanHandle> {
        let attrs_display = attrs.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",");
        let span = tracing::info_span!(target: "evsnow", "evsnow_span", name, attrs = %attrs_display);
        Box::new(TracingSpanHandle(span.entered()))
    }

    fn event(&self, name: &'static str, attrs: &[(&'static str, AttrValue)]) {
        let attrs_display = attrs.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",");
        tracing::info!(target: "evsnow", name, attrs = %attrs_display, "evsnow event");
    }

    fn counter_add(&self, name: &'static str, delta: u64, attrs: &[(&'static str, AttrValue)]) {
        self.counter(name).add(delta, &to_key_values(attrs));
    }
}
