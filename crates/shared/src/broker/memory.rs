//! 进程内 Broker
//!
//! 语义对齐 AMQP 队列，供测试和单进程本地开发使用：
//! - 队列声明幂等，持久化参数不一致时报错
//! - 显式确认模式下，未确认的投递挂在所属通道上；通道关闭或被丢弃时回到队首并标记重投
//! - `nack(requeue=true)` 将消息放回队首
//! - `restart()` 模拟 Broker 重启：非持久队列连同消息一起丢失，持久队列保留全部消息
//!
//! 另提供故障注入（不可达、发布失败）和状态观测接口。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{
    AckMode, Acker, Broker, Channel, Connection, Delivery, DeliveryStream, NoopAcker, PublishAck,
    QueueHandle, QueueSpec,
};
use crate::envelope::Envelope;
use crate::error::{BrokerError, Result};

#[derive(Debug, Clone)]
struct StoredMessage {
    sequence: u64,
    envelope: Envelope,
    redelivered: bool,
}

#[derive(Debug)]
struct InFlight {
    queue: String,
    channel_id: u64,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct QueueState {
    durable: bool,
    ready: VecDeque<StoredMessage>,
}

#[derive(Debug)]
struct State {
    reachable: bool,
    failing_publishes: u32,
    /// 每次重启递增，旧纪元的连接和通道全部失效
    epoch: u64,
    queues: HashMap<String, QueueState>,
    in_flight: HashMap<u64, InFlight>,
    next_sequence: u64,
    next_tag: u64,
    next_channel_id: u64,
    open_connections: usize,
    open_channels: usize,
}

impl State {
    fn requeue_channel(&mut self, channel_id: u64) -> usize {
        let tags: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();

        // 按原始顺序放回队首
        let mut returned: Vec<InFlight> = tags
            .into_iter()
            .filter_map(|tag| self.in_flight.remove(&tag))
            .collect();
        returned.sort_by_key(|f| std::cmp::Reverse(f.message.sequence));

        let count = returned.len();
        for flight in returned {
            self.return_to_queue(flight);
        }
        count
    }

    fn return_to_queue(&mut self, flight: InFlight) {
        if let Some(queue) = self.queues.get_mut(&flight.queue) {
            let mut message = flight.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 进程内 Broker，克隆后共享同一份队列状态
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    reachable: true,
                    failing_publishes: 0,
                    epoch: 0,
                    queues: HashMap::new(),
                    in_flight: HashMap::new(),
                    next_sequence: 0,
                    next_tag: 0,
                    next_channel_id: 0,
                    open_connections: 0,
                    open_channels: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    // ==================== 故障注入 ====================

    /// 设置为不可达后，`connect` 返回连接错误
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().reachable = reachable;
    }

    /// 下一次发布失败
    pub fn fail_next_publish(&self) {
        self.inner.lock().failing_publishes += 1;
    }

    /// 模拟 Broker 重启
    ///
    /// 所有现存连接、通道和订阅失效；非持久队列被删除，
    /// 持久队列中未确认的消息回到队首。
    pub fn restart(&self) {
        let mut state = self.inner.lock();
        state.epoch += 1;

        let mut in_flight: Vec<InFlight> = state.in_flight.drain().map(|(_, f)| f).collect();
        in_flight.sort_by_key(|f| std::cmp::Reverse(f.message.sequence));
        for flight in in_flight {
            state.return_to_queue(flight);
        }

        let before = state.queues.len();
        state.queues.retain(|_, q| q.durable);
        let dropped = before - state.queues.len();
        state.open_connections = 0;
        state.open_channels = 0;
        drop(state);

        warn!(dropped_queues = dropped, "内存 Broker 已重启，非持久队列已丢失");
        self.inner.notify.notify_waiters();
    }

    // ==================== 状态观测 ====================

    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.lock().queues.contains_key(name)
    }

    /// 待投递消息数
    pub fn queue_depth(&self, name: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(name)
            .map_or(0, |q| q.ready.len())
    }

    /// 已投递未确认消息数
    pub fn unacked_count(&self, name: &str) -> usize {
        self.inner
            .lock()
            .in_flight
            .values()
            .filter(|f| f.queue == name)
            .count()
    }

    /// 待投递消息快照（按投递顺序）
    pub fn ready_messages(&self, name: &str) -> Vec<Envelope> {
        self.inner
            .lock()
            .queues
            .get(name)
            .map(|q| q.ready.iter().map(|m| m.envelope.clone()).collect())
            .unwrap_or_default()
    }

    pub fn open_connections(&self) -> usize {
        self.inner.lock().open_connections
    }

    pub fn open_channels(&self) -> usize {
        self.inner.lock().open_channels
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection> {
        let mut state = self.inner.lock();
        if !state.reachable {
            return Err(BrokerError::Connection(
                "memory broker unreachable".to_string(),
            ));
        }
        state.open_connections += 1;
        debug!(open_connections = state.open_connections, "内存 Broker 连接已建立");

        Ok(MemoryConnection {
            inner: self.inner.clone(),
            epoch: state.epoch,
            closed: AtomicBool::new(false),
        })
    }
}

/// 内存 Broker 连接
pub struct MemoryConnection {
    inner: Arc<Inner>,
    epoch: u64,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel> {
        let mut state = self.inner.lock();
        if self.closed.load(Ordering::SeqCst) || state.epoch != self.epoch {
            return Err(BrokerError::Channel("connection is closed".to_string()));
        }
        state.next_channel_id += 1;
        state.open_channels += 1;

        Ok(MemoryChannel {
            inner: self.inner.clone(),
            id: state.next_channel_id,
            epoch: self.epoch,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.inner.lock();
        if state.epoch == self.epoch {
            state.open_connections = state.open_connections.saturating_sub(1);
        }
        Ok(())
    }
}

/// 内存 Broker 通道
///
/// 被丢弃时等同于异常断开：所有未确认的投递重新入队。
pub struct MemoryChannel {
    inner: Arc<Inner>,
    id: u64,
    epoch: u64,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &State) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Channel("channel is closed".to_string()));
        }
        if state.epoch != self.epoch {
            return Err(BrokerError::Channel("connection lost".to_string()));
        }
        Ok(())
    }

    fn release(&self) {
        let mut state = self.inner.lock();
        let requeued = state.requeue_channel(self.id);
        if state.epoch == self.epoch {
            state.open_channels = state.open_channels.saturating_sub(1);
        }
        drop(state);

        if requeued > 0 {
            info!(channel_id = self.id, requeued, "通道关闭，未确认消息已重新入队");
        }
        self.inner.notify.notify_waiters();
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.release();
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueHandle> {
        let mut state = self.inner.lock();
        self.ensure_open(&state)?;

        match state.queues.get(&spec.name) {
            Some(existing) if existing.durable != spec.durable => {
                return Err(BrokerError::Declaration {
                    queue: spec.name.clone(),
                    reason: format!(
                        "durable mismatch: existing={}, requested={}",
                        existing.durable, spec.durable
                    ),
                });
            }
            Some(_) => {}
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    QueueState {
                        durable: spec.durable,
                        ready: VecDeque::new(),
                    },
                );
                debug!(queue = %spec.name, durable = spec.durable, "队列已创建");
            }
        }

        Ok(QueueHandle::new(spec))
    }

    async fn publish(&self, queue: &QueueHandle, envelope: &Envelope) -> Result<PublishAck> {
        let mut state = self.inner.lock();
        self.ensure_open(&state)?;

        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BrokerError::Publish {
                queue: queue.name().to_string(),
                reason: "injected publish failure".to_string(),
            });
        }

        state.next_sequence += 1;
        let sequence = state.next_sequence;
        let Some(target) = state.queues.get_mut(queue.name()) else {
            return Err(BrokerError::Publish {
                queue: queue.name().to_string(),
                reason: "queue not declared".to_string(),
            });
        };
        target.ready.push_back(StoredMessage {
            sequence,
            envelope: envelope.clone(),
            redelivered: false,
        });
        drop(state);

        self.inner.notify.notify_waiters();
        Ok(PublishAck {
            queue: queue.name().to_string(),
            sequence,
        })
    }

    async fn consume(&self, queue: &QueueHandle, mode: AckMode) -> Result<DeliveryStream> {
        {
            let state = self.inner.lock();
            self.ensure_open(&state)?;
            if !state.queues.contains_key(queue.name()) {
                return Err(BrokerError::Subscription(format!(
                    "queue {} not declared",
                    queue.name()
                )));
            }
        }

        let subscription = Subscription {
            inner: self.inner.clone(),
            queue: queue.name().to_string(),
            channel_id: self.id,
            epoch: self.epoch,
            channel_closed: self.closed.clone(),
            mode,
            finished: false,
        };

        let stream = futures::stream::unfold(subscription, |mut sub| async move {
            if sub.finished {
                return None;
            }
            let item = sub.next_delivery().await;
            if item.is_err() {
                sub.finished = true;
            }
            Some((item, sub))
        });

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.release();
        }
        Ok(())
    }
}

struct Subscription {
    inner: Arc<Inner>,
    queue: String,
    channel_id: u64,
    epoch: u64,
    channel_closed: Arc<AtomicBool>,
    mode: AckMode,
    finished: bool,
}

impl Subscription {
    async fn next_delivery(&self) -> Result<Delivery> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // 先登记唤醒再检查队列，避免丢失检查与等待之间的通知
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take()? {
                return Ok(delivery);
            }

            notified.await;
        }
    }

    fn try_take(&self) -> Result<Option<Delivery>> {
        let mut state = self.inner.lock();
        if self.channel_closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Subscription("channel is closed".to_string()));
        }
        if state.epoch != self.epoch {
            return Err(BrokerError::Subscription("connection lost".to_string()));
        }

        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Err(BrokerError::Subscription(format!(
                "queue {} was deleted",
                self.queue
            )));
        };
        let Some(message) = queue.ready.pop_front() else {
            return Ok(None);
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        let envelope = message.envelope.clone();
        let redelivered = message.redelivered;

        let acker: Box<dyn Acker> = match self.mode {
            AckMode::Explicit => {
                state.in_flight.insert(
                    tag,
                    InFlight {
                        queue: self.queue.clone(),
                        channel_id: self.channel_id,
                        message,
                    },
                );
                Box::new(MemoryAcker {
                    inner: self.inner.clone(),
                    channel_id: self.channel_id,
                })
            }
            AckMode::Auto => Box::new(NoopAcker),
        };

        Ok(Some(Delivery::new(tag, redelivered, envelope, acker)))
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    channel_id: u64,
}

impl MemoryAcker {
    fn take(&self, state: &mut State, delivery_tag: u64) -> Result<InFlight> {
        match state.in_flight.remove(&delivery_tag) {
            Some(flight) if flight.channel_id == self.channel_id => Ok(flight),
            Some(flight) => {
                state.in_flight.insert(delivery_tag, flight);
                Err(BrokerError::Acknowledgement {
                    delivery_tag,
                    reason: "delivery belongs to another channel".to_string(),
                })
            }
            None => Err(BrokerError::Acknowledgement {
                delivery_tag,
                reason: "unknown delivery tag".to_string(),
            }),
        }
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.inner.lock();
        self.take(&mut state, delivery_tag)?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.inner.lock();
        let flight = self.take(&mut state, delivery_tag)?;
        if requeue {
            state.return_to_queue(flight);
            drop(state);
            self.inner.notify.notify_waiters();
        }
        Ok(())
    }
}
