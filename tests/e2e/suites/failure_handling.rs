//! 失败处理测试套件
//!
//! 永久失败、瞬时失败、不可解码记录与优雅关闭。

use std::sync::Arc;
use std::time::{Duration, Instant};

use notification_worker::HandleOutcome;
use order_shared::broker::{ConsumerMessage, OutboundRecord, RecordPublisher};
use order_shared::events::CORRELATION_ID_HEADER;
use serde_json::json;

use crate::helpers::RecordingSink;
use crate::setup::TestEnvironment;

fn record_for(env: &TestEnvironment, order_id: &str) -> ConsumerMessage {
    env.orders()
        .into_iter()
        .find(|m| m.key.as_deref() == Some(order_id))
        .unwrap()
}

async fn submit(env: &TestEnvironment, order_id: &str) {
    let body = json!({"orderId": order_id, "name": "Widget", "quantity": 1, "price": 3.0});
    let response = env.api.create_order(&body).await.unwrap();
    crate::assert_accepted!(response, order_id);
}

#[cfg(test)]
mod failure_handling_tests {
    use super::*;

    /// 永久失败的记录进入死信，位点推进，后续记录照常处理
    #[tokio::test]
    async fn test_permanent_failure_goes_to_dead_letter() {
        let env = TestEnvironment::setup().await.unwrap();
        let sink = Arc::new(
            RecordingSink::new().script("O-2", [HandleOutcome::permanent("INVALID_RECIPIENT", "no mailbox")]),
        );
        let worker = env.start_worker(sink.clone());

        for id in ["O-1", "O-2", "O-3"] {
            submit(&env, id).await;
        }
        env.wait_for("全部结果落定", || env.all_committed() && env.dead_letters().len() == 1)
            .await
            .unwrap();
        worker.stop().await.unwrap();

        let dead_letters = env.dead_letters();
        crate::assert_dead_letter_of!(dead_letters[0], record_for(&env, "O-2"));
        assert!(
            dead_letters[0]
                .header("dlt-reason")
                .unwrap()
                .starts_with("INVALID_RECIPIENT")
        );
        assert_eq!(dead_letters[0].header("dlt-attempts"), Some("1"));
        assert_eq!(sink.count_for("O-1"), 1);
        assert_eq!(sink.count_for("O-2"), 1);
        assert_eq!(sink.count_for("O-3"), 1);
    }

    /// 瞬时失败在预算内重试成功，不进入死信
    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let env = TestEnvironment::setup().await.unwrap();
        let sink = Arc::new(RecordingSink::new().script(
            "O-4",
            [
                HandleOutcome::retryable("SMTP_UNAVAILABLE", "421"),
                HandleOutcome::retryable("SMTP_UNAVAILABLE", "421"),
            ],
        ));
        let worker = env.start_worker(sink.clone());

        submit(&env, "O-4").await;
        env.wait_for("O-4 处理成功", || sink.count() == 3 && env.all_committed())
            .await
            .unwrap();
        worker.stop().await.unwrap();

        let attempts: Vec<_> = sink.deliveries().iter().map(|d| d.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert!(env.dead_letters().is_empty());
    }

    /// 瞬时失败超出预算后升级为死信
    #[tokio::test]
    async fn test_exhausted_retries_go_to_dead_letter() {
        let env = TestEnvironment::setup().await.unwrap();
        let sink = Arc::new(
            RecordingSink::new().script("O-5", vec![HandleOutcome::retryable("SMTP_UNAVAILABLE", "421"); 5]),
        );
        let worker = env.start_worker(sink.clone());

        submit(&env, "O-5").await;
        env.wait_for("O-5 进入死信", || env.all_committed() && env.dead_letters().len() == 1)
            .await
            .unwrap();
        worker.stop().await.unwrap();

        // 首次 + max_handler_retries(2)
        assert_eq!(sink.count_for("O-5"), 3);
        let dead_letters = env.dead_letters();
        crate::assert_dead_letter_of!(dead_letters[0], record_for(&env, "O-5"));
        assert_eq!(dead_letters[0].header("dlt-attempts"), Some("3"));
    }

    /// 配置的永久错误码覆盖处理器自报的可重试
    #[tokio::test]
    async fn test_configured_permanent_code_skips_retries() {
        let mut env = TestEnvironment::setup().await.unwrap();
        env.consumer.permanent_codes = vec!["SMTP_REJECTED".to_string()];
        let sink = Arc::new(
            RecordingSink::new().script("O-6", [HandleOutcome::retryable("SMTP_REJECTED", "550")]),
        );
        let worker = env.start_worker(sink.clone());

        submit(&env, "O-6").await;
        env.wait_for("O-6 进入死信", || env.all_committed() && env.dead_letters().len() == 1)
            .await
            .unwrap();
        worker.stop().await.unwrap();

        assert_eq!(sink.count_for("O-6"), 1);
    }

    /// 无法解码的记录不交给处理器，直接进入死信
    #[tokio::test]
    async fn test_undecodable_record_goes_to_dead_letter() {
        let env = TestEnvironment::setup().await.unwrap();
        let sink = Arc::new(RecordingSink::new());
        let worker = env.start_worker(sink.clone());

        env.broker
            .publish(
                OutboundRecord::new(env.topics.orders.clone(), b"not an order".to_vec())
                    .with_key("P-1")
                    .with_header(CORRELATION_ID_HEADER, "poison-1"),
            )
            .await
            .unwrap();
        submit(&env, "O-7").await;

        env.wait_for("结果落定", || env.all_committed() && env.dead_letters().len() == 1)
            .await
            .unwrap();
        worker.stop().await.unwrap();

        let dead_letters = env.dead_letters();
        crate::assert_dead_letter_of!(dead_letters[0], record_for(&env, "P-1"));
        assert_eq!(
            dead_letters[0].header(CORRELATION_ID_HEADER),
            Some("poison-1")
        );
        assert!(
            dead_letters[0]
                .header("dlt-reason")
                .unwrap()
                .starts_with("DESERIALIZATION_ERROR")
        );
        assert_eq!(sink.count(), 1);
        assert_eq!(sink.count_for("O-7"), 1);
    }

    /// 关闭在宽限期内完成
    #[tokio::test]
    async fn test_shutdown_completes_within_grace() {
        let env = TestEnvironment::setup().await.unwrap();
        let sink = Arc::new(RecordingSink::new());
        let worker = env.start_worker(sink.clone());

        submit(&env, "O-8").await;
        env.wait_for("O-8 处理完成", || sink.count() == 1).await.unwrap();

        let started = Instant::now();
        worker.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(env.consumer.shutdown_grace_ms));
    }
}
