//! 网关测试套件
//!
//! `POST /orders` 的受理、校验与探针。

use axum::http::StatusCode;
use order_shared::events::{Order, OrderEvent, OrderStatus, PENDING_MESSAGE};
use serde_json::json;

use crate::setup::TestEnvironment;

#[cfg(test)]
mod order_gateway_tests {
    use super::*;

    /// 受理的订单在主 topic 上恰好产生一条 Pending 事件
    #[tokio::test]
    async fn test_accepted_order_appends_one_pending_event() {
        let env = TestEnvironment::setup().await.unwrap();
        let body = json!({"orderId": "O-1", "name": "Widget", "quantity": 2, "price": 9.99});

        let response = env.api.create_order(&body).await.unwrap();
        crate::assert_accepted!(response, "O-1");

        let records = env.orders();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.key.as_deref(), Some("O-1"));
        assert!(record.correlation_id().is_some(), "记录头应带关联 ID");

        let event = OrderEvent::from_bytes(&record.payload).unwrap();
        let submitted: Order = serde_json::from_value(body).unwrap();
        assert_eq!(event.order, submitted);
        assert_eq!(event.status, OrderStatus::Pending);
        assert_eq!(event.message, PENDING_MESSAGE);
    }

    /// 违反约束的订单返回 400，不产生任何记录
    #[tokio::test]
    async fn test_invalid_orders_are_rejected() {
        let env = TestEnvironment::setup().await.unwrap();

        let invalid = [
            json!({"orderId": "", "name": "Widget", "quantity": 1, "price": 1.0}),
            json!({"orderId": "O-2", "name": "   ", "quantity": 1, "price": 1.0}),
            json!({"orderId": "O-3", "name": "Widget", "quantity": 0, "price": 1.0}),
            json!({"orderId": "O-4", "name": "Widget", "quantity": 1, "price": -0.5}),
        ];
        for body in &invalid {
            let response = env.api.create_order(body).await.unwrap();
            crate::assert_rejected!(response, StatusCode::BAD_REQUEST, "VALIDATION_ERROR");
        }

        assert!(env.orders().is_empty());
    }

    /// 缺字段或类型错误的请求体在反序列化阶段就被拒绝
    #[tokio::test]
    async fn test_malformed_body_is_client_error() {
        let env = TestEnvironment::setup().await.unwrap();

        for body in [
            r#"{"orderId":"O-5","name":"Widget","price":1.0}"#,
            r#"{"orderId":"O-5","name":"Widget","quantity":"two","price":1.0}"#,
            "not json",
        ] {
            let response = env.api.create_order_raw(body).await.unwrap();
            assert!(response.status.is_client_error(), "{body} -> {}", response.status);
        }

        assert!(env.orders().is_empty());
    }

    /// 同一订单重复提交：两次都受理，同一分区内按提交顺序排列，关联 ID 各不相同
    #[tokio::test]
    async fn test_resubmitted_order_keeps_partition_order() {
        let env = TestEnvironment::setup().await.unwrap();

        for name in ["first", "second"] {
            let body = json!({"orderId": "O-6", "name": name, "quantity": 1, "price": 2.5});
            let response = env.api.create_order(&body).await.unwrap();
            crate::assert_accepted!(response, "O-6");
        }

        let records = env.orders();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].partition, records[1].partition);
        assert_ne!(records[0].correlation_id(), records[1].correlation_id());

        let names: Vec<_> = records
            .iter()
            .map(|r| OrderEvent::from_bytes(&r.payload).unwrap().order.name)
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_probes_and_request_id() {
        let env = TestEnvironment::setup().await.unwrap();

        let health = env.api.get("/health").await.unwrap();
        assert_eq!(health.status, StatusCode::OK);
        assert_eq!(health.json().unwrap()["service"], "order-service");
        assert!(health.request_id.is_some());

        let ready = env.api.get("/ready").await.unwrap();
        assert_eq!(ready.status, StatusCode::OK);
        assert_eq!(ready.json().unwrap()["checks"]["broker"], "ok");
    }
}
