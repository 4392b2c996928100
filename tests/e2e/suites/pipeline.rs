//! 全链路测试套件
//!
//! 网关受理的订单经由主 topic 到达通知处理器。

use std::sync::Arc;

use order_shared::events::OrderEvent;
use serde_json::json;

use crate::helpers::RecordingSink;
use crate::setup::TestEnvironment;

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use notification_worker::HandleOutcome;

    /// 受理的订单恰好被处理一次，处理器拿到的事件与日志中的完全一致
    #[tokio::test]
    async fn test_accepted_order_reaches_sink() {
        let env = TestEnvironment::setup().await.unwrap();
        let sink = Arc::new(RecordingSink::new());
        let worker = env.start_worker(sink.clone());

        let body = json!({"orderId": "O-1", "name": "Widget", "quantity": 2, "price": 9.99});
        let response = env.api.create_order(&body).await.unwrap();
        crate::assert_accepted!(response, "O-1");

        env.wait_for("O-1 处理并提交", || sink.count() == 1 && env.all_committed())
            .await
            .unwrap();
        worker.stop().await.unwrap();

        let record = &env.orders()[0];
        let deliveries = sink.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].event, OrderEvent::from_bytes(&record.payload).unwrap());
        assert_eq!(deliveries[0].correlation_id, record.correlation_id());
        assert_eq!(deliveries[0].attempt, 1);
        assert!(env.dead_letters().is_empty());
    }

    /// 同一 key 的事件按发布顺序处理，不同 key 互不阻塞
    #[tokio::test]
    async fn test_per_key_order_is_preserved() {
        let env = TestEnvironment::setup().await.unwrap();
        let sink = Arc::new(RecordingSink::new());
        let worker = env.start_worker(sink.clone());

        for i in 0..5 {
            let same_key = json!({"orderId": "O-7", "name": format!("v{i}"), "quantity": 1, "price": 1.0});
            env.api.create_order(&same_key).await.unwrap();
            let other = json!({"orderId": format!("X-{i}"), "name": "Other", "quantity": 1, "price": 1.0});
            env.api.create_order(&other).await.unwrap();
        }

        env.wait_for("全部处理", || sink.count() == 10 && env.all_committed())
            .await
            .unwrap();
        worker.stop().await.unwrap();

        let names: Vec<_> = sink
            .deliveries()
            .into_iter()
            .filter(|d| d.event.order.order_id == "O-7")
            .map(|d| d.event.order.name)
            .collect();
        assert_eq!(names, vec!["v0", "v1", "v2", "v3", "v4"]);
    }

    /// 重启后从已提交位点继续，已处理的记录不会再次投递
    #[tokio::test]
    async fn test_restart_resumes_from_committed_offsets() {
        let env = TestEnvironment::setup().await.unwrap();

        let first_sink = Arc::new(RecordingSink::new());
        let worker = env.start_worker(first_sink.clone());
        for i in 0..3 {
            let body = json!({"orderId": format!("O-{i}"), "name": "Widget", "quantity": 1, "price": 1.0});
            env.api.create_order(&body).await.unwrap();
        }
        env.wait_for("前三条处理完成", || first_sink.count() == 3 && env.all_committed())
            .await
            .unwrap();
        worker.stop().await.unwrap();

        for i in 3..5 {
            let body = json!({"orderId": format!("O-{i}"), "name": "Widget", "quantity": 1, "price": 1.0});
            env.api.create_order(&body).await.unwrap();
        }

        let second_sink = Arc::new(RecordingSink::new());
        let worker = env.start_worker(second_sink.clone());
        env.wait_for("后两条处理完成", || second_sink.count() == 2 && env.all_committed())
            .await
            .unwrap();
        worker.stop().await.unwrap();

        let mut seen: Vec<_> = second_sink
            .deliveries()
            .into_iter()
            .map(|d| d.event.order.order_id)
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["O-3", "O-4"]);
    }

    /// 关闭时仍在退避中的记录不提交，下一个成员会重新收到它
    #[tokio::test]
    async fn test_record_in_backoff_is_redelivered_after_restart() {
        let mut env = TestEnvironment::setup().await.unwrap();
        env.consumer.retry_initial_delay_ms = 60_000;
        env.consumer.retry_max_delay_ms = 60_000;

        let first_sink = Arc::new(
            RecordingSink::new().script("O-9", [HandleOutcome::retryable("SMTP_UNAVAILABLE", "421")]),
        );
        let worker = env.start_worker(first_sink.clone());
        let body = json!({"orderId": "O-9", "name": "Widget", "quantity": 1, "price": 1.0});
        env.api.create_order(&body).await.unwrap();

        env.wait_for("首次处理失败", || first_sink.count() == 1).await.unwrap();
        worker.stop().await.unwrap();

        let record = env.orders()[0].clone();
        assert_eq!(env.committed(&record.topic_partition()), None);

        let second_sink = Arc::new(RecordingSink::new());
        let worker = env.start_worker(second_sink.clone());
        env.wait_for("重新投递并提交", || second_sink.count() == 1 && env.all_committed())
            .await
            .unwrap();
        worker.stop().await.unwrap();

        assert_eq!(second_sink.deliveries()[0].correlation_id, record.correlation_id());
        assert!(env.dead_letters().is_empty());
    }

    /// 重新分配后继续消费新记录
    #[tokio::test]
    async fn test_rebalance_keeps_consuming() {
        let env = TestEnvironment::setup().await.unwrap();
        let sink = Arc::new(RecordingSink::new());
        let worker = env.start_worker(sink.clone());

        let body = json!({"orderId": "O-10", "name": "Widget", "quantity": 1, "price": 1.0});
        env.api.create_order(&body).await.unwrap();
        env.wait_for("第一条处理完成", || sink.count() == 1 && env.all_committed())
            .await
            .unwrap();

        env.broker.trigger_rebalance(crate::setup::CONSUMER_GROUP);
        let body = json!({"orderId": "O-11", "name": "Widget", "quantity": 1, "price": 1.0});
        env.api.create_order(&body).await.unwrap();
        env.wait_for("第二条处理完成", || sink.count() == 2 && env.all_committed())
            .await
            .unwrap();
        worker.stop().await.unwrap();

        assert_eq!(sink.count_for("O-10"), 1);
        assert_eq!(sink.count_for("O-11"), 1);
    }
}
