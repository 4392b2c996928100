//! 自定义断言宏

/// 断言网关受理了订单
#[macro_export]
macro_rules! assert_accepted {
    ($response:expr, $order_id:expr) => {
        assert_eq!($response.status, axum::http::StatusCode::ACCEPTED);
        assert_eq!($response.body, format!("Order accepted: {}", $order_id));
    };
}

/// 断言网关以给定状态码和错误码拒绝请求
#[macro_export]
macro_rules! assert_rejected {
    ($response:expr, $status:expr, $code:expr) => {
        assert_eq!($response.status, $status);
        let body = $response.json().unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], $code);
    };
}

/// 断言死信记录保留了原始负载与关联 ID
#[macro_export]
macro_rules! assert_dead_letter_of {
    ($dead_letter:expr, $original:expr) => {
        assert_eq!($dead_letter.payload, $original.payload);
        assert_eq!($dead_letter.key, $original.key);
        assert_eq!($dead_letter.correlation_id(), $original.correlation_id());
        assert_eq!(
            $dead_letter.header("dlt-original-offset"),
            Some($original.offset.to_string().as_str())
        );
    };
}
