//! 订单网关服务
//!
//! 启动时声明 topic 拓扑，随后对外提供 `POST /orders`。

use std::sync::Arc;

use order_service::{AppState, OrderProducer, app};
use order_shared::{
    config::AppConfig,
    kafka::{KafkaProducer, KafkaTopicAdmin},
    observability,
    topology::{Topology, ensure_topology},
};
use tokio::net::TcpListener;
use tracing::info;

const SERVICE_NAME: &str = "order-service";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;
    let _guard = observability::init(SERVICE_NAME, &config.observability).await?;

    info!(
        brokers = %config.kafka.brokers,
        topic = %config.topics.orders,
        dead_letter = %config.topics.orders_dlt,
        "Starting {} on {}",
        SERVICE_NAME,
        config.server_addr()
    );

    // 拓扑声明失败对进程是致命的
    let admin = KafkaTopicAdmin::new(&config.kafka)?;
    ensure_topology(&admin, &Topology::from_config(&config.topics)).await?;

    let publisher = KafkaProducer::new(&config.kafka)?;
    let producer = OrderProducer::from_config(Arc::new(publisher), &config);
    let state = AppState::new(Arc::new(producer), SERVICE_NAME);

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
