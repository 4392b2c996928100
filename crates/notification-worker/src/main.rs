//! 通知 worker
//!
//! 加入消费组消费订单事件，失败记录转入死信 topic。

use std::sync::Arc;

use notification_worker::{
    ConsumerGroupMember, DeadLetterPublisher, DedupSink, EmailSink, FailurePolicy, WorkerContext,
};
use order_shared::{
    config::AppConfig,
    kafka::{KafkaConsumer, KafkaProducer, KafkaTopicAdmin},
    observability,
    retry::RetryPolicy,
    topology::{Topology, ensure_topology},
};
use tokio::sync::watch;
use tracing::info;

const SERVICE_NAME: &str = "notification-worker";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;
    let _guard = observability::init(SERVICE_NAME, &config.observability).await?;

    info!(
        brokers = %config.kafka.brokers,
        group_id = %config.kafka.consumer_group,
        topic = %config.topics.orders,
        dead_letter = %config.topics.orders_dlt,
        "Starting {}",
        SERVICE_NAME
    );

    // 死信 topic 必须在第一条失败记录之前存在
    let admin = KafkaTopicAdmin::new(&config.kafka)?;
    ensure_topology(&admin, &Topology::from_config(&config.topics)).await?;

    let consumer =
        KafkaConsumer::new(&config.kafka, &config.kafka.consumer_group, &config.consumer)?;
    consumer.subscribe(&[config.topics.orders.as_str()])?;
    let (source, committer) = consumer.split()?;

    let dead_letter =
        DeadLetterPublisher::from_config(Arc::new(KafkaProducer::new(&config.kafka)?), &config);
    let sink = DedupSink::new(Arc::new(EmailSink), config.consumer.dedup_capacity);

    let ctx = WorkerContext::new(
        Arc::new(sink),
        Arc::new(committer),
        dead_letter,
        FailurePolicy::from_config(&config.consumer),
        RetryPolicy::from_consumer_config(&config.consumer),
    );
    let member = ConsumerGroupMember::new(
        config.kafka.consumer_group.clone(),
        Box::new(source),
        ctx,
        &config.consumer,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    member.run(shutdown_rx).await?;

    info!("Worker shutdown complete");
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
        _ = ctrl_c => info!("Received Ctrl+C, draining partitions..."),
        _ = terminate => info!("Received SIGTERM, draining partitions..."),
    }
}
