//! 统一错误处理模块
//!
//! 定义 Broker 通道抽象的错误类型。每一类失败对应独立的变体，
//! 调用方（Dispatcher、Worker、入口处理器）据此区分故障阶段并决定是否重试。

use thiserror::Error;

/// Broker 通道错误
#[derive(Debug, Error)]
pub enum BrokerError {
    // ==================== 连接与通道 ====================
    #[error("连接 Broker 失败: {0}")]
    Connection(String),

    #[error("打开通道失败: {0}")]
    Channel(String),

    // ==================== 队列 ====================
    #[error("声明队列失败: queue={queue}, 原因={reason}")]
    Declaration { queue: String, reason: String },

    // ==================== 投递 ====================
    #[error("发布消息失败: queue={queue}, 原因={reason}")]
    Publish { queue: String, reason: String },

    #[error("订阅队列失败: {0}")]
    Subscription(String),

    #[error("确认消息失败: delivery_tag={delivery_tag}, 原因={reason}")]
    Acknowledgement { delivery_tag: u64, reason: String },

    // ==================== 配置 ====================
    #[error("Broker 配置无效: {0}")]
    Config(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "BROKER_CONNECTION_ERROR",
            Self::Channel(_) => "BROKER_CHANNEL_ERROR",
            Self::Declaration { .. } => "QUEUE_DECLARATION_ERROR",
            Self::Publish { .. } => "PUBLISH_ERROR",
            Self::Subscription(_) => "SUBSCRIPTION_ERROR",
            Self::Acknowledgement { .. } => "ACKNOWLEDGEMENT_ERROR",
            Self::Config(_) => "BROKER_CONFIG_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有网络层面的瞬时故障值得重试；声明冲突和配置错误重试也不会成功。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Publish { .. })
    }
}
