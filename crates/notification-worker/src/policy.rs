//! 失败分类策略
//!
//! 处理器自己上报可重试/永久失败，运维可以用配置按失败码覆盖它的判断。
//! 优先级：`permanent_codes` > `retryable_codes` > 处理器上报。

use std::collections::HashSet;

use order_shared::config::ConsumerConfig;
use order_shared::error::OrderError;

use crate::sink::HandleOutcome;

/// 一条记录接下来的去向
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// 处理完成，提交位点
    Commit,
    /// 不推进位点，退避后重试
    Retry { code: String, message: String },
    /// 写入死信 topic 后提交位点
    DeadLetter { code: String, message: String },
}

#[derive(Debug, Clone, Default)]
pub struct FailurePolicy {
    retryable_codes: HashSet<String>,
    permanent_codes: HashSet<String>,
}

impl FailurePolicy {
    pub fn new<I, J, S>(retryable_codes: I, permanent_codes: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            retryable_codes: retryable_codes.into_iter().map(Into::into).collect(),
            permanent_codes: permanent_codes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self::new(
            config.retryable_codes.iter().cloned(),
            config.permanent_codes.iter().cloned(),
        )
    }

    /// 对处理器的结果分类
    pub fn classify(&self, outcome: &HandleOutcome) -> Disposition {
        let (code, message, reported_retryable) = match outcome {
            HandleOutcome::Success => return Disposition::Commit,
            HandleOutcome::RetryableFailure { code, message } => (code, message, true),
            HandleOutcome::PermanentFailure { code, message } => (code, message, false),
        };

        let retry = if self.permanent_codes.contains(code) {
            false
        } else if self.retryable_codes.contains(code) {
            true
        } else {
            reported_retryable
        };

        let (code, message) = (code.clone(), message.clone());
        if retry {
            Disposition::Retry { code, message }
        } else {
            Disposition::DeadLetter { code, message }
        }
    }

    /// 对处理器之外的错误分类；解码失败重试也不会成功，总是进入死信
    pub fn classify_error(&self, error: &OrderError) -> Disposition {
        let code = error.code().to_string();
        let message = error.to_string();
        match error {
            OrderError::Deserialization(_) => Disposition::DeadLetter { code, message },
            _ if error.is_retryable() => Disposition::Retry { code, message },
            _ => Disposition::DeadLetter { code, message },
        }
    }
}
