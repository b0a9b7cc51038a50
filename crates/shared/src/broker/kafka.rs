//! Kafka 实现
//!
//! 将 rdkafka 的底层 API 映射到通道抽象：
//! - 队列 = 单分区 topic，保证单生产者的 FIFO 顺序
//! - 声明 = 通过 Admin API 建 topic，已存在视为成功
//! - 显式确认 = 关闭自动提交，ack 提交 offset+1
//! - `nack(requeue=true)` = 将消息重新发布到同一 topic 尾部后提交；`nack(requeue=false)` = 直接提交
//!
//! 未提交的消息在消费者重新加入消费组后会从上次提交位置重新投递。
//! offset 提交是累积的，因此消费端必须逐条按序结算。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use tracing::{debug, info, warn};

use super::{
    AckMode, Acker, Broker, Channel, Connection, Delivery, DeliveryStream, NoopAcker, PublishAck,
    QueueHandle, QueueSpec,
};
use crate::config::BrokerConfig;
use crate::envelope::Envelope;
use crate::error::{BrokerError, Result};

/// 内容类型在 Kafka 消息头中的键
const CONTENT_TYPE_HEADER: &str = "content-type";

/// 连接探测和 flush 的超时
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct KafkaSettings {
    brokers: String,
    consumer_group: String,
    auto_offset_reset: String,
    replication_factor: i32,
    publish_timeout: Duration,
}

/// Kafka Broker 入口
pub struct KafkaBroker {
    settings: Arc<KafkaSettings>,
}

impl KafkaBroker {
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        if config.brokers.trim().is_empty() {
            return Err(BrokerError::Config("broker.brokers 不能为空".to_string()));
        }
        if config.replication_factor < 1 {
            return Err(BrokerError::Config(format!(
                "broker.replication_factor 必须大于 0，实际为 {}",
                config.replication_factor
            )));
        }

        Ok(Self {
            settings: Arc::new(KafkaSettings {
                brokers: config.brokers.clone(),
                consumer_group: config.consumer_group.clone(),
                auto_offset_reset: config.auto_offset_reset.clone(),
                replication_factor: config.replication_factor,
                publish_timeout: config.publish_timeout(),
            }),
        })
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.settings.brokers);
        config
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    type Connection = KafkaConnection;

    /// 创建生产者并拉取一次集群元数据，确认 Broker 可达
    async fn connect(&self) -> Result<KafkaConnection> {
        let producer: FutureProducer = self
            .client_config()
            .set("message.timeout.ms", self.settings.publish_timeout.as_millis().to_string())
            .set("acks", "all")
            .create()
            .map_err(|e| BrokerError::Connection(format!("创建生产者失败: {e}")))?;

        let probe = producer.clone();
        tokio::task::spawn_blocking(move || {
            probe
                .client()
                .fetch_metadata(None, Timeout::After(METADATA_TIMEOUT))
                .map(|_| ())
        })
        .await
        .map_err(|e| BrokerError::Connection(format!("元数据探测任务异常: {e}")))?
        .map_err(|e| BrokerError::Connection(format!("Broker 不可达: {e}")))?;

        debug!(brokers = %self.settings.brokers, "Kafka 连接已建立");
        Ok(KafkaConnection {
            settings: self.settings.clone(),
            producer,
        })
    }
}

/// Kafka 连接：持有共享的生产者
pub struct KafkaConnection {
    settings: Arc<KafkaSettings>,
    producer: FutureProducer,
}

#[async_trait]
impl Connection for KafkaConnection {
    type Channel = KafkaChannel;

    async fn open_channel(&self) -> Result<KafkaChannel> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.settings.brokers)
            .create()
            .map_err(|e| BrokerError::Channel(format!("创建 Admin 客户端失败: {e}")))?;

        Ok(KafkaChannel {
            settings: self.settings.clone(),
            producer: self.producer.clone(),
            admin,
            consumers: Mutex::new(Vec::new()),
        })
    }

    /// 刷出生产者缓冲区中尚未送达的消息
    async fn close(&self) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(METADATA_TIMEOUT)))
            .await
            .map_err(|e| BrokerError::Connection(format!("flush 任务异常: {e}")))?
            .map_err(|e| BrokerError::Connection(format!("flush 生产者失败: {e}")))
    }
}

/// Kafka 通道
///
/// 通道记录自己创建的消费者，`close` 时取消订阅；
/// 消费者本身在投递流和所有未结算的投递都被丢弃后释放。
pub struct KafkaChannel {
    settings: Arc<KafkaSettings>,
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    consumers: Mutex<Vec<Arc<StreamConsumer>>>,
}

#[async_trait]
impl Channel for KafkaChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueHandle> {
        // 持久队列使用配置的副本数；非持久队列单副本，Broker 节点丢失即丢消息
        let replication = if spec.durable {
            self.settings.replication_factor
        } else {
            1
        };
        let topic = NewTopic::new(&spec.name, 1, TopicReplication::Fixed(replication));

        let results = self
            .admin
            .create_topics([&topic], &AdminOptions::new())
            .await
            .map_err(|e| BrokerError::Declaration {
                queue: spec.name.clone(),
                reason: e.to_string(),
            })?;

        for result in results {
            match result {
                Ok(name) => info!(topic = %name, replication, "Kafka topic 已创建"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Kafka topic 已存在")
                }
                Err((name, code)) => {
                    return Err(BrokerError::Declaration {
                        queue: name,
                        reason: code.to_string(),
                    });
                }
            }
        }

        Ok(QueueHandle::new(spec))
    }

    async fn publish(&self, queue: &QueueHandle, envelope: &Envelope) -> Result<PublishAck> {
        send_envelope(
            &self.producer,
            queue.name(),
            envelope,
            self.settings.publish_timeout,
        )
        .await
    }

    async fn consume(&self, queue: &QueueHandle, mode: AckMode) -> Result<DeliveryStream> {
        let auto_commit = match mode {
            AckMode::Explicit => "false",
            AckMode::Auto => "true",
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.settings.brokers)
            .set("group.id", &self.settings.consumer_group)
            .set("auto.offset.reset", &self.settings.auto_offset_reset)
            .set("enable.auto.commit", auto_commit)
            .create()
            .map_err(|e| BrokerError::Subscription(format!("创建消费者失败: {e}")))?;

        consumer
            .subscribe(&[queue.name()])
            .map_err(|e| BrokerError::Subscription(format!("订阅 topic 失败: {e}")))?;

        info!(
            topic = queue.name(),
            group_id = %self.settings.consumer_group,
            ?mode,
            "已订阅 Kafka topic"
        );

        let consumer = Arc::new(consumer);
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(consumer.clone());

        let source = KafkaSource {
            consumer,
            producer: self.producer.clone(),
            publish_timeout: self.settings.publish_timeout,
            mode,
        };

        let stream = futures::stream::unfold(source, |source| async move {
            let item = match source.consumer.recv().await {
                Ok(msg) => Ok(source.to_delivery(&msg)),
                Err(e) => Err(BrokerError::Subscription(format!("接收 Kafka 消息出错: {e}"))),
            };
            Some((item, source))
        });

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<()> {
        let consumers = std::mem::take(
            &mut *self.consumers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for consumer in consumers {
            consumer.unsubscribe();
            debug!("Kafka 消费者已取消订阅");
        }
        Ok(())
    }
}

async fn send_envelope(
    producer: &FutureProducer,
    topic: &str,
    envelope: &Envelope,
    timeout: Duration,
) -> Result<PublishAck> {
    let headers = envelope.headers().iter().fold(
        OwnedHeaders::new().insert(Header {
            key: CONTENT_TYPE_HEADER,
            value: Some(envelope.content_type()),
        }),
        |headers, (key, value)| {
            headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        },
    );

    let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic)
        .payload(envelope.body())
        .headers(headers);
    if let Some(key) = envelope.key() {
        record = record.key(key);
    }

    let delivery = producer
        .send(record, Timeout::After(timeout))
        .await
        .map_err(|(e, _)| BrokerError::Publish {
            queue: topic.to_string(),
            reason: e.to_string(),
        })?;

    debug!(
        topic,
        partition = delivery.partition,
        offset = delivery.offset,
        "消息已发送"
    );
    Ok(PublishAck {
        queue: topic.to_string(),
        sequence: delivery.offset.max(0) as u64,
    })
}

struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
    publish_timeout: Duration,
    mode: AckMode,
}

impl KafkaSource {
    /// 将借用消息转换为拥有所有权的投递，使其可以跨 await 点传递
    fn to_delivery(&self, msg: &BorrowedMessage<'_>) -> Delivery {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);
        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let mut content_type = String::new();
        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    if header.key == CONTENT_TYPE_HEADER {
                        content_type = value.to_string();
                    } else {
                        headers.insert(header.key.to_string(), value.to_string());
                    }
                }
            }
        }

        let envelope = Envelope::from_parts(payload, content_type, key, headers);
        let offset = msg.offset();

        let acker: Box<dyn Acker> = match self.mode {
            AckMode::Explicit => Box::new(KafkaAcker {
                consumer: self.consumer.clone(),
                producer: self.producer.clone(),
                publish_timeout: self.publish_timeout,
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset,
                envelope: envelope.clone(),
            }),
            AckMode::Auto => Box::new(NoopAcker),
        };

        Delivery::new(offset.max(0) as u64, false, envelope, acker)
    }
}

struct KafkaAcker {
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
    publish_timeout: Duration,
    topic: String,
    partition: i32,
    offset: i64,
    envelope: Envelope,
}

impl KafkaAcker {
    /// 同步提交 offset+1，返回时 Broker 已确认
    async fn commit(&self, delivery_tag: u64) -> Result<()> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();
        let partition = self.partition;
        let next = Offset::Offset(self.offset + 1);

        tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&topic, partition, next)?;
            consumer.commit(&tpl, CommitMode::Sync)
        })
        .await
        .map_err(|e| BrokerError::Acknowledgement {
            delivery_tag,
            reason: format!("提交任务异常: {e}"),
        })?
        .map_err(|e| BrokerError::Acknowledgement {
            delivery_tag,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Acker for KafkaAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.commit(delivery_tag).await
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        if requeue {
            // 先重新发布再提交：发布失败时不提交，消息仍会在重新加入消费组后重投
            send_envelope(
                &self.producer,
                &self.topic,
                &self.envelope,
                self.publish_timeout,
            )
            .await
            .map_err(|e| {
                warn!(topic = %self.topic, offset = self.offset, error = %e, "重新入队失败");
                BrokerError::Acknowledgement {
                    delivery_tag,
                    reason: e.to_string(),
                }
            })?;
        }
        self.commit(delivery_tag).await
    }
}
