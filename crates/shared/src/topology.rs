//! Topic 拓扑声明
//!
//! 启动时声明主 topic 与死信 topic。声明是幂等的：topic 已存在且参数一致时视为成功，
//! 已存在但分区数不同则报 `Provisioning` 错误（本设计不支持在线扩分区）。

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::TopicsConfig;
use crate::error::OrderError;

/// Topic 描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDescriptor {
    pub name: String,
    pub partitions: i32,
    pub replicas: i32,
}

impl TopicDescriptor {
    pub fn new(name: impl Into<String>, partitions: i32, replicas: i32) -> Self {
        Self {
            name: name.into(),
            partitions,
            replicas,
        }
    }

    /// 客户端可检查的约束；副本数上限由 broker 数量决定，只能由 broker 判定
    pub fn validate(&self) -> Result<(), OrderError> {
        let reason = if self.name.trim().is_empty() {
            Some("topic 名称不能为空".to_string())
        } else if self.partitions < 1 {
            Some(format!("分区数必须 >= 1, 实际 {}", self.partitions))
        } else if self.replicas < 1 {
            Some(format!("副本数必须 >= 1, 实际 {}", self.replicas))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(OrderError::Provisioning {
                topic: self.name.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// 主 topic 与对应的死信 topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub main: TopicDescriptor,
    pub dead_letter: TopicDescriptor,
}

impl Topology {
    pub fn new(
        main: impl Into<String>,
        dead_letter: impl Into<String>,
        partitions: i32,
        replicas: i32,
    ) -> Self {
        Self {
            main: TopicDescriptor::new(main, partitions, replicas),
            dead_letter: TopicDescriptor::new(dead_letter, partitions, replicas),
        }
    }

    pub fn from_config(config: &TopicsConfig) -> Self {
        Self::new(
            config.orders.clone(),
            config.orders_dlt.clone(),
            config.partitions,
            config.replicas,
        )
    }
}

/// 创建结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicCreation {
    Created,
    AlreadyExists,
}

/// broker 元数据管理接口
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// 创建 topic；已存在时返回 `AlreadyExists` 而非错误
    async fn create_topic(&self, topic: &TopicDescriptor) -> Result<TopicCreation, OrderError>;

    /// 查询 topic 当前的分区数与副本数，不存在时返回 `None`
    async fn describe_topic(&self, name: &str) -> Result<Option<TopicDescriptor>, OrderError>;
}

/// 幂等地声明主 topic 与死信 topic
pub async fn ensure_topology(admin: &dyn TopicAdmin, topology: &Topology) -> Result<(), OrderError> {
    if topology.main.name == topology.dead_letter.name {
        return Err(OrderError::Provisioning {
            topic: topology.main.name.clone(),
            reason: "主 topic 与死信 topic 不能同名".to_string(),
        });
    }

    for descriptor in [&topology.main, &topology.dead_letter] {
        ensure_topic(admin, descriptor).await?;
    }

    info!(
        main = %topology.main.name,
        dead_letter = %topology.dead_letter.name,
        partitions = topology.main.partitions,
        replicas = topology.main.replicas,
        "topic 拓扑已就绪"
    );
    Ok(())
}

async fn ensure_topic(admin: &dyn TopicAdmin, descriptor: &TopicDescriptor) -> Result<(), OrderError> {
    descriptor.validate()?;

    match admin.create_topic(descriptor).await? {
        TopicCreation::Created => {
            info!(topic = %descriptor.name, partitions = descriptor.partitions, "topic 已创建");
            Ok(())
        }
        TopicCreation::AlreadyExists => {
            let Some(existing) = admin.describe_topic(&descriptor.name).await? else {
                // 创建返回已存在但元数据尚未传播，按已存在处理
                warn!(topic = %descriptor.name, "topic 已存在但暂未查询到元数据");
                return Ok(());
            };

            if existing.partitions != descriptor.partitions {
                return Err(OrderError::Provisioning {
                    topic: descriptor.name.clone(),
                    reason: format!(
                        "已存在的 topic 分区数为 {}, 声明为 {}",
                        existing.partitions, descriptor.partitions
                    ),
                });
            }

            if existing.replicas != descriptor.replicas {
                warn!(
                    topic = %descriptor.name,
                    existing = existing.replicas,
                    declared = descriptor.replicas,
                    "已存在的 topic 副本数与声明不一致"
                );
            }

            info!(topic = %descriptor.name, "topic 已存在，跳过创建");
            Ok(())
        }
    }
}
