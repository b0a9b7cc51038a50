//! Broker 通道抽象
//!
//! 对持久化队列的最小能力接口：连接、打开通道、声明队列（幂等）、发布、
//! 以流的形式消费、确认/拒绝、关闭。不包含任何业务逻辑。
//!
//! 两个实现：
//! - [`kafka`]：基于 rdkafka 的生产实现
//! - [`memory`]：进程内实现，语义对齐 AMQP 队列，用于测试和本地开发

pub mod kafka;
pub mod memory;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;

use crate::envelope::Envelope;
use crate::error::Result;

/// 订单队列名称
pub const ORDERS_QUEUE: &str = "orders";

/// 队列声明参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, durable: bool) -> Self {
        Self {
            name: name.into(),
            durable,
        }
    }
}

/// 已声明队列的句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    name: String,
    durable: bool,
}

impl QueueHandle {
    pub fn new(spec: &QueueSpec) -> Self {
        Self {
            name: spec.name.clone(),
            durable: spec.durable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn durable(&self) -> bool {
        self.durable
    }
}

/// 发布确认：Broker 已接收消息用于路由，不代表已被消费
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub queue: String,
    /// Broker 分配的位置（Kafka offset 或内存队列序号）
    pub sequence: u64,
}

/// 消费确认模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// 处理完成后由消费者显式确认
    #[default]
    Explicit,
    /// 投递即视为确认；处理中崩溃的消息会丢失
    Auto,
}

/// 单条投递的确认句柄
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<()>;
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;
}

/// 自动确认模式下的空确认器
pub struct NoopAcker;

#[async_trait]
impl Acker for NoopAcker {
    async fn ack(&self, _delivery_tag: u64) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _delivery_tag: u64, _requeue: bool) -> Result<()> {
        Ok(())
    }
}

/// 一次 Broker 到消费者的投递
///
/// `ack`/`nack` 按值消费 `Delivery`，同一投递只能结算一次，
/// 句柄也无法被挪用到其他投递上。
pub struct Delivery {
    delivery_tag: u64,
    redelivered: bool,
    envelope: Envelope,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        envelope: Envelope,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            envelope,
            acker,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Broker 是否标记为重投（仅内存实现能准确提供）
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack(self.delivery_tag).await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// 无界、惰性、不可重启的投递流
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// Broker 入口：持有端点配置，按需建立连接
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: Connection;

    async fn connect(&self) -> Result<Self::Connection>;
}

/// 传输层会话
#[async_trait]
pub trait Connection: Send + Sync {
    type Channel: Channel;

    async fn open_channel(&self) -> Result<Self::Channel>;

    async fn close(&self) -> Result<()>;
}

/// 复用在连接之上的逻辑通道
///
/// 消费端会把通道放进 `Arc` 与处理任务共享，因此要求 `'static`。
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// 幂等声明：相同参数重复声明不报错，也不改变队列标识
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueHandle>;

    async fn publish(&self, queue: &QueueHandle, envelope: &Envelope) -> Result<PublishAck>;

    async fn consume(&self, queue: &QueueHandle, mode: AckMode) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}

/// 根据配置选择 Broker 实现
///
/// 让二进制入口只依赖一个具体类型，而不必在每个调用点做泛型分派。
pub enum AnyBroker {
    Kafka(kafka::KafkaBroker),
    Memory(memory::MemoryBroker),
}

pub enum AnyConnection {
    Kafka(kafka::KafkaConnection),
    Memory(memory::MemoryConnection),
}

pub enum AnyChannel {
    Kafka(kafka::KafkaChannel),
    Memory(memory::MemoryChannel),
}

impl AnyBroker {
    pub fn from_config(config: &crate::config::BrokerConfig) -> Result<Self> {
        match config.kind {
            crate::config::BrokerKind::Kafka => Ok(Self::Kafka(kafka::KafkaBroker::new(config)?)),
            crate::config::BrokerKind::Memory => Ok(Self::Memory(memory::MemoryBroker::new())),
        }
    }
}

#[async_trait]
impl Broker for AnyBroker {
    type Connection = AnyConnection;

    async fn connect(&self) -> Result<AnyConnection> {
        match self {
            Self::Kafka(b) => b.connect().await.map(AnyConnection::Kafka),
            Self::Memory(b) => b.connect().await.map(AnyConnection::Memory),
        }
    }
}

#[async_trait]
impl Connection for AnyConnection {
    type Channel = AnyChannel;

    async fn open_channel(&self) -> Result<AnyChannel> {
        match self {
            Self::Kafka(c) => c.open_channel().await.map(AnyChannel::Kafka),
            Self::Memory(c) => c.open_channel().await.map(AnyChannel::Memory),
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            Self::Kafka(c) => c.close().await,
            Self::Memory(c) => c.close().await,
        }
    }
}

#[async_trait]
impl Channel for AnyChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueHandle> {
        match self {
            Self::Kafka(c) => c.declare_queue(spec).await,
            Self::Memory(c) => c.declare_queue(spec).await,
        }
    }

    async fn publish(&self, queue: &QueueHandle, envelope: &Envelope) -> Result<PublishAck> {
        match self {
            Self::Kafka(c) => c.publish(queue, envelope).await,
            Self::Memory(c) => c.publish(queue, envelope).await,
        }
    }

    async fn consume(&self, queue: &QueueHandle, mode: AckMode) -> Result<DeliveryStream> {
        match self {
            Self::Kafka(c) => c.consume(queue, mode).await,
            Self::Memory(c) => c.consume(queue, mode).await,
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            Self::Kafka(c) => c.close().await,
            Self::Memory(c) => c.close().await,
        }
    }
}
