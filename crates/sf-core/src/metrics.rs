//! Process-wide Prometheus registry.
//!
//! Every series carries a `service` label so one scrape config can cover the
//! feed service and the CLI alike.

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::{Layer, Service};

pub const FLUSH_TRIGGER_THRESHOLD: &str = "threshold";
pub const FLUSH_TRIGGER_TIMER: &str = "timer";
pub const FLUSH_TRIGGER_MANUAL: &str = "manual";

pub const FLUSH_RESULT_SUCCESS: &str = "success";
pub const FLUSH_RESULT_ERROR: &str = "error";

const HTTP_LABELS: &[&str] = &["service", "route", "method", "status"];
const HTTP_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];
const FLUSH_SECONDS_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];
const FLUSH_EVENTS_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0];

struct Metrics {
    registry: Registry,
    up: IntGaugeVec,
    http_requests: IntCounterVec,
    http_duration: HistogramVec,
    buffer_pending: IntGaugeVec,
    flushes: IntCounterVec,
    flush_duration: HistogramVec,
    flush_events: HistogramVec,
    dropped_events: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Registers `collector` and hands it back. Names are fixed at compile time,
/// so a failure here is a programming error.
fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> C {
    registry
        .register(Box::new(collector.clone()))
        .expect("metric registration");
    collector
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    register(
        registry,
        IntCounterVec::new(Opts::new(name, help), labels).expect("counter definition"),
    )
}

fn gauge(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    register(
        registry,
        IntGaugeVec::new(Opts::new(name, help), labels).expect("gauge definition"),
    )
}

fn histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: &[f64],
) -> HistogramVec {
    register(
        registry,
        HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets.to_vec()), labels)
            .expect("histogram definition"),
    )
}

fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let registry = Registry::new();
        Metrics {
            up: gauge(&registry, "sf_up", "Service health", &["service"]),
            http_requests: counter(
                &registry,
                "http_requests_total",
                "HTTP request count",
                HTTP_LABELS,
            ),
            http_duration: histogram(
                &registry,
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
                HTTP_LABELS,
                HTTP_BUCKETS,
            ),
            buffer_pending: gauge(
                &registry,
                "feed_buffer_pending",
                "Events queued in a write buffer and not yet flushed",
                &["service", "kind"],
            ),
            flushes: counter(
                &registry,
                "feed_flush_total",
                "Write buffer flush outcomes",
                &["service", "kind", "trigger", "result"],
            ),
            flush_duration: histogram(
                &registry,
                "feed_flush_duration_seconds",
                "Write buffer flush duration in seconds",
                &["service", "kind", "result"],
                FLUSH_SECONDS_BUCKETS,
            ),
            flush_events: histogram(
                &registry,
                "feed_flush_events",
                "Events per write buffer flush",
                &["service", "kind"],
                FLUSH_EVENTS_BUCKETS,
            ),
            dropped_events: counter(
                &registry,
                "feed_dropped_events_total",
                "Buffered events discarded after a failed flush",
                &["service", "kind"],
            ),
            registry,
        }
    })
}

pub fn init(service_name: &'static str) {
    metrics().up.with_label_values(&[service_name]).set(1);
}

pub fn record_http_request(
    service_name: &'static str,
    method: &str,
    route: &str,
    status: u16,
    duration: Duration,
) {
    let status = status.to_string();
    let labels = [service_name, route, method, status.as_str()];
    let metrics = metrics();
    metrics.http_requests.with_label_values(&labels).inc();
    metrics
        .http_duration
        .with_label_values(&labels)
        .observe(duration.as_secs_f64());
}

pub fn set_buffer_pending(service_name: &'static str, kind: &str, pending: usize) {
    metrics()
        .buffer_pending
        .with_label_values(&[service_name, kind])
        .set(i64::try_from(pending).unwrap_or(i64::MAX));
}

pub fn buffer_pending(service_name: &'static str, kind: &str) -> i64 {
    metrics()
        .buffer_pending
        .with_label_values(&[service_name, kind])
        .get()
}

pub fn record_flush(
    service_name: &'static str,
    kind: &str,
    trigger: &str,
    result: &str,
    events: usize,
    duration: Duration,
) {
    let metrics = metrics();
    metrics
        .flushes
        .with_label_values(&[service_name, kind, trigger, result])
        .inc();
    metrics
        .flush_duration
        .with_label_values(&[service_name, kind, result])
        .observe(duration.as_secs_f64());
    metrics
        .flush_events
        .with_label_values(&[service_name, kind])
        .observe(events as f64);
}

pub fn inc_dropped_events(service_name: &'static str, kind: &str, events: usize) {
    metrics()
        .dropped_events
        .with_label_values(&[service_name, kind])
        .inc_by(events as u64);
}

/// Prometheus text exposition of the whole registry.
pub fn metrics_response(service_name: &'static str) -> impl IntoResponse {
    init(service_name);
    let families = metrics().registry.gather();
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut body) {
        tracing::warn!(error = %err, "metrics encoding failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            HeaderMap::new(),
            "failed to encode metrics".to_string(),
        );
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    (
        StatusCode::OK,
        headers,
        String::from_utf8_lossy(&body).into_owned(),
    )
}

/// Tower layer recording `http_requests_total` and
/// `http_request_duration_seconds` per matched route.
#[derive(Clone)]
pub struct MetricsLayer {
    service_name: &'static str,
}

impl MetricsLayer {
    pub fn new(service_name: &'static str) -> Self {
        Self { service_name }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            service_name: self.service_name,
        }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    service_name: &'static str,
}

impl<S, ReqBody, ResBody> Service<axum::http::Request<ReqBody>> for MetricsService<S>
where
    S: Service<axum::http::Request<ReqBody>, Response = axum::response::Response<ResBody>>
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: axum::http::Request<ReqBody>) -> Self::Future {
        let service_name = self.service_name;
        let method = request.method().as_str().to_string();
        let route = crate::http::route_label(&request);
        let started = Instant::now();
        let response = self.inner.call(request);

        Box::pin(async move {
            let result = response.await;
            let status = match &result {
                Ok(response) => response.status().as_u16(),
                Err(_) => StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            };
            record_http_request(service_name, &method, &route, status, started.elapsed());
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn exposition() -> String {
        let response = metrics_response("sf-test").into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn flush_metrics_show_up_in_exposition() {
        set_buffer_pending("sf-test", "likes", 3);
        record_flush(
            "sf-test",
            "likes",
            FLUSH_TRIGGER_TIMER,
            FLUSH_RESULT_SUCCESS,
            3,
            Duration::from_millis(4),
        );
        inc_dropped_events("sf-test", "views", 2);
        assert_eq!(buffer_pending("sf-test", "likes"), 3);

        let text = exposition().await;
        assert!(text.contains("feed_buffer_pending{kind=\"likes\",service=\"sf-test\"} 3"));
        assert!(text.contains(
            "feed_flush_total{kind=\"likes\",result=\"success\",service=\"sf-test\",trigger=\"timer\"}"
        ));
        assert!(text.contains("feed_dropped_events_total{kind=\"views\",service=\"sf-test\"}"));
    }

    #[tokio::test]
    async fn http_requests_are_labelled_by_route_template() {
        let router = Router::new()
            .route("/posts/{id}", get(|| async { StatusCode::NO_CONTENT }))
            .layer(MetricsLayer::new("sf-test"));

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/posts/17")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let text = exposition().await;
        assert!(text.contains("route=\"/posts/{id}\""));
        assert!(!text.contains("route=\"/posts/17\""));
    }
}
