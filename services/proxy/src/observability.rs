//! Tracing and metrics setup for the proxy service.
//!
//! Logs go through a `tracing_subscriber` registry filtered by `RUST_LOG`
//! (default `info`). An OTLP span exporter is attached when one can be built;
//! failure leaves local logging only. A Prometheus recorder backs the
//! `metrics` macros used across the pool, served with `/live` and `/ready`
//! over `axum`.

use axum::http::StatusCode;
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace as sdktrace;
use relaymux_pool::Pool;
use std::net::SocketAddr;
#[cfg(test)]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global subscriber, propagator and metrics recorder.
///
/// Relay connection logs, client session logs and fan-in drop reasons all
/// flow through the subscriber installed here. The counters and gauges the
/// pool records (`relaymux_upstream_*`, `relaymux_frames_*`,
/// `relaymux_completions_total`, `relaymux_client*`) land in the Prometheus
/// recorder.
///
/// Returns the handle `/metrics` renders from. Call once per process; tests
/// share a cached recorder.
pub fn init_observability(service_name: &str) -> PrometheusHandle {
    // W3C trace context, so spans can join a trace started by the caller.
    global::set_text_map_propagator(opentelemetry_sdk::propagation::TraceContextPropagator::new());

    let provider = build_tracer_provider(service_name);

    // RUST_LOG wins; `info` keeps relay up/down and client connects visible.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    if let Some(provider) = provider {
        let tracer = provider.tracer(service_name.to_string());
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        init_subscriber(registry.with(otel_layer));
    } else {
        // Local logs only.
        init_subscriber(registry);
    }

    install_metrics_recorder()
}

/// Build the OTLP span pipeline for `service_name`.
///
/// The exporter endpoint comes from the standard `OTEL_EXPORTER_OTLP_*`
/// variables. Returns None when the pipeline cannot be installed; the proxy
/// then runs with local logging only.
fn build_tracer_provider(service_name: &str) -> Option<opentelemetry_sdk::trace::TracerProvider> {
    let resource = Resource::new(resource_attributes(service_name));
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(sdktrace::Config::default().with_resource(resource))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .ok()
}

/// Resource attributes attached to every exported span.
///
/// `service.instance.id` prefers `RELAYMUX_INSTANCE_ID` and falls back to
/// `HOSTNAME`, so replicas behind one listener address stay distinguishable.
/// Kubernetes and deployment attributes are added only when set.
fn resource_attributes(service_name: &str) -> Vec<KeyValue> {
    let mut attrs = vec![KeyValue::new("service.name", service_name.to_string())];
    if let Ok(value) =
        std::env::var("RELAYMUX_INSTANCE_ID").or_else(|_| std::env::var("HOSTNAME"))
    {
        attrs.push(KeyValue::new("service.instance.id", value));
    }
    if let Ok(value) = std::env::var("K8S_NAMESPACE_NAME") {
        attrs.push(KeyValue::new("k8s.namespace.name", value));
    }
    if let Ok(value) = std::env::var("K8S_POD_NAME") {
        attrs.push(KeyValue::new("k8s.pod.name", value));
    }
    if let Ok(value) = std::env::var("DEPLOYMENT_ENVIRONMENT") {
        attrs.push(KeyValue::new("deployment.environment", value));
    }
    attrs
}

/// Health and metrics routes.
///
/// - `/metrics`: Prometheus text rendered from `handle`.
/// - `/live`: always `ok` while the process serves requests.
/// - `/ready`: relay availability, see [`readiness`].
fn router(handle: PrometheusHandle, pool: Pool) -> axum::Router {
    axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route(
            "/ready",
            axum::routing::get(move || async move { readiness(&pool) }),
        )
}

/// Ready once at least one relay is connected. With zero relays every
/// subscribe or publish would only complete by timeout, so load balancers
/// should hold traffic back.
fn readiness(pool: &Pool) -> (StatusCode, &'static str) {
    if pool.count_connected() > 0 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no relay connected")
    }
}

/// Serve `/metrics`, `/live` and `/ready` on `addr`.
///
/// Runs on its own listener, separate from the client websocket port, until
/// the task is aborted or the listener fails.
pub async fn serve_metrics(
    handle: PrometheusHandle,
    addr: SocketAddr,
    pool: Pool,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(handle, pool).into_make_service()).await
}

/// Install the process-wide Prometheus recorder behind the `metrics` macros.
///
/// A second installation is a programming error, so it panics outside tests.
fn install_metrics_recorder() -> PrometheusHandle {
    #[cfg(test)]
    {
        // One global recorder per test binary.
        if let Some(handle) = METRICS_HANDLE.get() {
            return handle.clone();
        }
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("install metrics recorder");
        let _ = METRICS_HANDLE.set(handle.clone());
        handle
    }
    #[cfg(not(test))]
    {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install metrics recorder")
    }
}

/// Set `subscriber` as the global default. Tests tolerate one already being
/// installed by an earlier test in the same binary.
fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    #[cfg(test)]
    {
        let _ = subscriber.try_init();
    }
    #[cfg(not(test))]
    {
        subscriber.init();
    }
}
