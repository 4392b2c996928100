//! 统一可观测性模块
//!
//! 日志与 Prometheus 指标的统一初始化。两个二进制都从这里进入，
//! 保证日志字段和指标命名一致。

pub mod metrics;
pub mod middleware;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;

use crate::config::ObservabilityConfig;

/// 可观测性资源守卫，持有指标服务器任务的生命周期
pub struct ObservabilityGuard {
    metrics_handle: Option<metrics::MetricsHandle>,
}

impl ObservabilityGuard {
    /// 禁用指标时使用
    pub fn empty() -> Self {
        Self {
            metrics_handle: None,
        }
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.metrics_handle.take() {
            handle.abort();
        }
        info!("可观测性组件已关闭");
    }
}

/// 初始化日志，并按配置启动 Prometheus 指标导出
pub async fn init(service_name: &str, config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    tracing::init(config)?;

    if !config.metrics_enabled {
        info!(service = service_name, "指标导出已禁用");
        return Ok(ObservabilityGuard::empty());
    }

    let metrics_handle = metrics::init(service_name, config.metrics_port).await?;
    info!(
        service = service_name,
        metrics_port = config.metrics_port,
        log_format = %config.log_format,
        "可观测性已初始化"
    );

    Ok(ObservabilityGuard {
        metrics_handle: Some(metrics_handle),
    })
}
