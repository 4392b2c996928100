//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。
//! topic 名称和消费组 ID 全部来自配置，代码中不硬编码。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Kafka 连接配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
    pub consumer_group: String,
    pub auto_offset_reset: String,
    /// librdkafka 层面的投递超时，超时后由上层重试预算接管
    pub message_timeout_ms: u64,
    /// Admin API（创建 topic、拉取元数据）的操作超时
    pub operation_timeout_ms: u64,
    /// 单次发布超时后的重试次数（不含首次），耗尽后返回 PublishError
    pub publish_max_retries: u32,
    pub publish_retry_initial_delay_ms: u64,
    pub publish_retry_max_delay_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            consumer_group: "notification-worker".to_string(),
            auto_offset_reset: "earliest".to_string(),
            message_timeout_ms: 5000,
            operation_timeout_ms: 10_000,
            publish_max_retries: 3,
            publish_retry_initial_delay_ms: 200,
            publish_retry_max_delay_ms: 5000,
        }
    }
}

impl KafkaConfig {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Topic 拓扑配置
///
/// 副本数是部署参数：单 broker 开发环境为 1，生产环境应按集群规模调大。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub orders: String,
    pub orders_dlt: String,
    pub partitions: i32,
    pub replicas: i32,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            orders: "orders".to_string(),
            orders_dlt: "orders-dlt".to_string(),
            partitions: 3,
            replicas: 1,
        }
    }
}

/// 消费者行为配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// 瞬时失败的最大重试次数（不含首次处理），超过后升级为死信
    pub max_handler_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// 收到关闭信号后等待分区 worker 收尾的宽限期
    pub shutdown_grace_ms: u64,
    pub poll_timeout_ms: u64,
    /// 无论处理器如何上报，都按可重试处理的失败码
    pub retryable_codes: Vec<String>,
    /// 无论处理器如何上报，都直接进入死信的失败码
    pub permanent_codes: Vec<String>,
    /// 去重窗口容量（按 correlation id）
    pub dedup_capacity: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_handler_retries: 3,
            retry_initial_delay_ms: 200,
            retry_max_delay_ms: 5000,
            shutdown_grace_ms: 10_000,
            poll_timeout_ms: 1000,
            retryable_codes: Vec::new(),
            permanent_codes: Vec::new(),
            dedup_capacity: 10_000,
        }
    }
}

impl ConsumerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// 服务配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
            metrics_port: 9090,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub server: ServerConfig,
    pub kafka: KafkaConfig,
    pub topics: TopicsConfig,
    pub consumer: ConsumerConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. .env 文件（仅填充尚未设置的环境变量）
    /// 2. config/default.toml（默认配置）
    /// 3. config/{environment}.toml（环境特定配置）
    /// 4. config/{service_name}.toml（服务特定配置）
    /// 5. 环境变量（ORDER_ 前缀，`__` 分隔层级，如 ORDER_TOPICS__ORDERS_DLT -> topics.orders_dlt）
    /// 6. 服务特定端口环境变量（如 ORDER_SERVICE_PORT）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        // .env 不存在是正常情况
        let _ = dotenvy::dotenv();

        let env = std::env::var("ORDER_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        Self::load_from(Path::new(&config_dir), &env, service_name)
    }

    /// 从指定目录加载配置，层级同 [`AppConfig::load`] 的 2-6 步
    pub fn load_from(
        config_dir: &Path,
        env: &str,
        service_name: &str,
    ) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            .add_source(
                File::from(config_dir.join(format!("{}.toml", service_name))).required(false),
            )
            .add_source(
                Environment::with_prefix("ORDER")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("consumer.retryable_codes")
                    .with_list_parse_key("consumer.permanent_codes")
                    .try_parsing(true),
            );

        let mut config: Self = builder.build()?.try_deserialize()?;

        if let Some(port) = Self::service_port_from_env(service_name) {
            config.server.port = port;
        }

        Ok(config)
    }

    /// 将 "order-service" 转换为 "ORDER_SERVICE_PORT" 并读取
    fn service_port_from_env(service_name: &str) -> Option<u16> {
        std::env::var(Self::service_port_env_name(service_name))
            .ok()
            .and_then(|v| v.parse().ok())
    }

    fn service_port_env_name(service_name: &str) -> String {
        format!("{}_PORT", service_name.to_uppercase().replace('-', "_"))
    }

    /// 获取服务地址
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
