//! 网关客户端
//!
//! 直接通过 `tower::ServiceExt::oneshot` 调用 axum 路由，不经过网络。

use anyhow::Result;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

/// 网关响应
#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub request_id: Option<String>,
    pub body: String,
}

impl ApiResponse {
    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

#[derive(Clone)]
pub struct ApiClient {
    router: Router,
}

impl ApiClient {
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    /// POST /orders
    pub async fn create_order(&self, body: &Value) -> Result<ApiResponse> {
        self.create_order_raw(&body.to_string()).await
    }

    pub async fn create_order_raw(&self, body: &str) -> Result<ApiResponse> {
        let request = Request::builder()
            .method("POST")
            .uri("/orders")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))?;
        self.send(request).await
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        let request = Request::builder().uri(path).body(Body::empty())?;
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> Result<ApiResponse> {
        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let bytes = response.into_body().collect().await?.to_bytes();

        Ok(ApiResponse {
            status,
            request_id,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}
