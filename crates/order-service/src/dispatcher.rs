//! 订单派发
//!
//! 每次派发独立完成 连接 → 打开通道 → 声明队列 → 发布 → 释放，
//! 调用之间不共享任何 Broker 资源。派发本身不做重试，
//! 失败按阶段区分后原样交给调用方。

use std::sync::Arc;
use std::time::Instant;

use orderflow_shared::broker::{Broker, Channel, Connection, PublishAck, QueueSpec};
use orderflow_shared::envelope::{Envelope, HEADER_PRODUCER, Order};
use orderflow_shared::error::BrokerError;
use orderflow_shared::observability::metrics::record_dispatch;
use thiserror::Error;
use tracing::{debug, info, warn};

/// 派发错误
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("订单序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Broker(e) => e.code(),
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Broker(e) => e.is_retryable(),
            Self::Serialization(_) => false,
        }
    }
}

/// 派发结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    /// 最终使用的订单标识（调用方提供或新分配）
    pub order_id: String,
    pub ack: PublishAck,
}

/// 订单派发器
pub struct Dispatcher<B: Broker> {
    broker: Arc<B>,
    queue: QueueSpec,
    producer: String,
}

impl<B: Broker> Dispatcher<B> {
    pub fn new(broker: Arc<B>, queue: QueueSpec, producer: impl Into<String>) -> Self {
        Self {
            broker,
            queue,
            producer: producer.into(),
        }
    }

    pub fn queue(&self) -> &QueueSpec {
        &self.queue
    }

    /// 发布一个订单
    ///
    /// `id` 为空时分配 UUID v4，否则原样保留。成功仅表示 Broker 已接收，
    /// 不代表订单已被处理。
    pub async fn dispatch(&self, mut order: Order) -> Result<Dispatched, DispatchError> {
        let started = Instant::now();
        if order.ensure_id() {
            debug!(order_id = %order.id, "已为订单分配标识");
        }

        let result = self.publish(&order).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(ack) => {
                record_dispatch(&self.queue.name, "ok", elapsed);
                info!(
                    order_id = %order.id,
                    queue = %ack.queue,
                    sequence = ack.sequence,
                    "订单已发布"
                );
                Ok(Dispatched {
                    order_id: order.id,
                    ack,
                })
            }
            Err(e) => {
                record_dispatch(&self.queue.name, e.code(), elapsed);
                warn!(order_id = %order.id, code = e.code(), error = %e, "订单发布失败");
                Err(e)
            }
        }
    }

    async fn publish(&self, order: &Order) -> Result<PublishAck, DispatchError> {
        let envelope = Envelope::encode(order)?.with_header(HEADER_PRODUCER, &self.producer);

        let connection = self.broker.connect().await?;
        let result = self.publish_on(&connection, &envelope).await;
        if let Err(e) = connection.close().await {
            warn!(error = %e, "关闭 Broker 连接失败");
        }
        result
    }

    async fn publish_on(
        &self,
        connection: &B::Connection,
        envelope: &Envelope,
    ) -> Result<PublishAck, DispatchError> {
        let channel = connection.open_channel().await?;
        let result = async {
            let queue = channel.declare_queue(&self.queue).await?;
            channel.publish(&queue, envelope).await
        }
        .await;
        if let Err(e) = channel.close().await {
            warn!(error = %e, "关闭 Broker 通道失败");
        }
        Ok(result?)
    }
}
