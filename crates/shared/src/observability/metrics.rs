//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use std::net::SocketAddr;
use std::sync::OnceLock;

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::{error, info};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 指标服务器任务句柄
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl MetricsHandle {
    pub fn abort(&self) {
        self.server_handle.abort();
    }
}

/// 安装全局 recorder，并在 `port` 上暴露 `/metrics`
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    describe_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

fn describe_metrics(service_name: &str) {
    metrics::describe_counter!("http_requests_total", "Total number of HTTP requests");
    metrics::describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );
    metrics::describe_counter!(
        "order_events_published_total",
        "Order events appended to the main topic"
    );
    metrics::describe_counter!(
        "order_events_consumed_total",
        "Order events consumed, labelled by outcome"
    );
    metrics::describe_counter!(
        "order_events_dead_lettered_total",
        "Order events routed to the dead-letter topic"
    );
    metrics::describe_histogram!(
        "order_event_handle_duration_seconds",
        "Time spent handling a single order event"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    }))
}

pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

#[inline]
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str.clone()
    )
    .increment(1);

    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str
    )
    .record(duration_secs);
}

/// 记录一次成功发布
#[inline]
pub fn record_event_published(topic: &str) {
    metrics::counter!("order_events_published_total", "topic" => topic.to_string()).increment(1);
}

/// 记录一条记录的最终去向：success / dead_lettered
#[inline]
pub fn record_event_consumed(outcome: &str, duration_secs: f64) {
    metrics::counter!("order_events_consumed_total", "outcome" => outcome.to_string())
        .increment(1);
    metrics::histogram!("order_event_handle_duration_seconds").record(duration_secs);
}

#[inline]
pub fn record_dead_lettered(reason_code: &str) {
    metrics::counter!(
        "order_events_dead_lettered_total",
        "reason" => reason_code.to_string()
    )
    .increment(1);
}
