//! 消费端错误类型
//!
//! 区分会话级故障（连接、订阅中断）和单条投递的解码失败，
//! 监管循环据此决定重连还是退出。

use orderflow_shared::error::BrokerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("投递解码失败: delivery_tag={delivery_tag}, 原因={reason}")]
    DeliveryDecode { delivery_tag: u64, reason: String },

    #[error("订阅中断: {0}")]
    Subscription(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("消费端配置无效: {0}")]
    Config(String),
}

impl ConsumerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeliveryDecode { .. } => "DELIVERY_DECODE_ERROR",
            Self::Subscription(_) => "SUBSCRIPTION_LOST",
            Self::Broker(e) => e.code(),
            Self::Config(_) => "CONSUMER_CONFIG_ERROR",
        }
    }

    /// 是否值得重建会话
    ///
    /// 队列声明冲突和配置错误在重连后依旧存在，直接退出。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Subscription(_) => true,
            Self::Broker(e) => !matches!(
                e,
                BrokerError::Declaration { .. } | BrokerError::Config(_)
            ),
            Self::DeliveryDecode { .. } | Self::Config(_) => false,
        }
    }
}
