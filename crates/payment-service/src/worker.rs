//! 订单消费端
//!
//! 一个会话持有一条长连接和一个通道，状态机为
//! `Disconnected → Connected → Subscribed → Consuming → Draining → Disconnected`，
//! 当前状态通过 watch 通道对外可见。
//!
//! 每条投递由独立任务处理并独占自己的 `Delivery`，并发数由信号量限制；
//! 并发为 1 时严格按队列顺序逐条处理。确认只在处理步骤成功后发生；
//! 处理步骤 panic 时投递被 `nack(requeue=true)`，进程崩溃的投递在通道关闭时由 Broker 重投。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use orderflow_shared::broker::{
    AckMode, Broker, Channel, Connection, Delivery, DeliveryStream, QueueSpec,
};
use orderflow_shared::config::{AppConfig, BrokerKind};
use orderflow_shared::dlq::{DeadLetterPublisher, DeadLetterReason};
use orderflow_shared::envelope::Order;
use orderflow_shared::observability::metrics::{record_delivery, record_processing};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::ConsumerError;
use crate::processor::{Disposition, ProcessingStep};

type ChannelOf<B> = <<B as Broker>::Connection as Connection>::Channel;

/// 消费端状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connected,
    Subscribed,
    Consuming,
    /// 已停止拉取，等待处理中的投递完成
    Draining,
}

/// 消费会话统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub poison: u64,
    pub dead_lettered: u64,
    /// 排空超时被取消并重新入队
    pub cancelled: u64,
    /// ack/nack 本身失败，由 Broker 负责重投
    pub settle_failures: u64,
    /// 处理步骤 panic，投递已重新入队
    pub crashed: u64,
}

impl WorkerReport {
    pub fn merge(&mut self, other: &WorkerReport) {
        self.delivered += other.delivered;
        self.acked += other.acked;
        self.requeued += other.requeued;
        self.rejected += other.rejected;
        self.poison += other.poison;
        self.dead_lettered += other.dead_lettered;
        self.cancelled += other.cancelled;
        self.settle_failures += other.settle_failures;
        self.crashed += other.crashed;
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Acked => self.acked += 1,
            Outcome::Requeued => self.requeued += 1,
            Outcome::Cancelled => self.cancelled += 1,
            Outcome::Rejected { dead_lettered } => {
                self.rejected += 1;
                self.dead_lettered += u64::from(dead_lettered);
            }
            Outcome::Poison { dead_lettered } => {
                self.poison += 1;
                self.dead_lettered += u64::from(dead_lettered);
            }
            Outcome::Crashed => self.crashed += 1,
            Outcome::SettleFailed => self.settle_failures += 1,
        }
    }

    fn record_joined(&mut self, joined: Result<Outcome, JoinError>) {
        match joined {
            Ok(outcome) => self.record(outcome),
            Err(e) => {
                error!(error = %e, "投递处理任务异常退出，消息将在通道关闭后重投");
                self.crashed += 1;
            }
        }
    }
}

/// 消费端运行参数
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue: QueueSpec,
    pub ack_mode: AckMode,
    pub concurrency: usize,
    pub drain_timeout: Duration,
    pub dead_letter: Option<QueueSpec>,
    pub service_name: String,
}

impl WorkerSettings {
    pub fn new(queue: QueueSpec, service_name: impl Into<String>) -> Self {
        Self {
            queue,
            ack_mode: AckMode::Explicit,
            concurrency: 1,
            drain_timeout: Duration::from_secs(30),
            dead_letter: None,
            service_name: service_name.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ConsumerError> {
        let queue = config
            .broker
            .queue_spec()
            .map_err(|e| ConsumerError::Config(e.to_string()))?;
        let dead_letter = config
            .broker
            .dead_letter_spec()
            .map_err(|e| ConsumerError::Config(e.to_string()))?;

        if config.worker.concurrency == 0 {
            return Err(ConsumerError::Config(
                "worker.concurrency 必须大于 0".to_string(),
            ));
        }
        // Kafka 的 offset 提交是累积的，乱序确认会越过仍在处理中的订单
        if config.broker.kind == BrokerKind::Kafka && config.worker.concurrency > 1 {
            return Err(ConsumerError::Config(format!(
                "Kafka 后端只支持 worker.concurrency = 1，实际为 {}",
                config.worker.concurrency
            )));
        }

        Ok(Self {
            queue,
            ack_mode: config.worker.ack_mode,
            concurrency: config.worker.concurrency,
            drain_timeout: config.worker.drain_timeout(),
            dead_letter,
            service_name: config.service_name.clone(),
        })
    }
}

/// 订单消费端
pub struct Worker<B: Broker, P: ProcessingStep + ?Sized> {
    broker: Arc<B>,
    processor: Arc<P>,
    settings: WorkerSettings,
    state: watch::Sender<WorkerState>,
    totals: Mutex<WorkerReport>,
}

impl<B: Broker, P: ProcessingStep + ?Sized> Worker<B, P> {
    pub fn new(broker: Arc<B>, processor: Arc<P>, settings: WorkerSettings) -> Self {
        let (state, _) = watch::channel(WorkerState::Disconnected);
        Self {
            broker,
            processor,
            settings,
            state,
            totals: Mutex::new(WorkerReport::default()),
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// 所有已结束会话的累计统计
    pub fn totals(&self) -> WorkerReport {
        *self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: WorkerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "消费端状态变更");
        }
    }

    /// 运行一个消费会话
    ///
    /// 收到关闭信号（或信号发送端被丢弃）后停止拉取、排空并返回统计；
    /// 投递流出错或结束时同样先排空，再返回 `Subscription` 错误。
    /// 连接与通道在所有退出路径上都会关闭。会话内不做重连。
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WorkerReport, ConsumerError> {
        let connection = self.broker.connect().await?;
        self.transition(WorkerState::Connected);
        info!(
            queue = %self.settings.queue.name,
            durable = self.settings.queue.durable,
            ack_mode = ?self.settings.ack_mode,
            concurrency = self.settings.concurrency,
            "已连接 Broker"
        );

        let result = match connection.open_channel().await {
            Ok(channel) => {
                let channel = Arc::new(channel);
                let result = self.consume(&channel, &mut shutdown).await;
                if let Err(e) = channel.close().await {
                    warn!(error = %e, "关闭 Broker 通道失败");
                }
                result
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = connection.close().await {
            warn!(error = %e, "关闭 Broker 连接失败");
        }
        self.transition(WorkerState::Disconnected);
        result
    }

    async fn consume(
        &self,
        channel: &Arc<ChannelOf<B>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<WorkerReport, ConsumerError> {
        let queue = channel.declare_queue(&self.settings.queue).await?;
        let dead_letter = match &self.settings.dead_letter {
            Some(spec) => Some(DeadLetterPublisher::new(
                channel.declare_queue(spec).await?,
                &self.settings.service_name,
            )),
            None => None,
        };

        let deliveries = channel.consume(&queue, self.settings.ack_mode).await?;
        self.transition(WorkerState::Subscribed);
        if self.settings.ack_mode == AckMode::Auto {
            warn!(queue = %queue.name(), "自动确认模式：处理中崩溃的订单将丢失");
        }
        info!(
            queue = %queue.name(),
            dead_letter_queue = ?dead_letter.as_ref().map(|d| d.queue().name().to_string()),
            "已订阅订单队列"
        );

        let handler = Arc::new(DeliveryHandler {
            channel: channel.clone(),
            processor: self.processor.clone(),
            queue: queue.name().to_string(),
            dead_letter,
        });

        let mut report = WorkerReport::default();
        let result = self.pump(deliveries, handler, shutdown, &mut report).await;

        info!(
            queue = %queue.name(),
            delivered = report.delivered,
            acked = report.acked,
            requeued = report.requeued,
            rejected = report.rejected,
            poison = report.poison,
            cancelled = report.cancelled,
            crashed = report.crashed,
            "消费会话结束"
        );
        self.totals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(&report);

        result.map(|()| report)
    }

    /// 拉取投递并分派给处理任务，退出前排空
    async fn pump(
        &self,
        mut deliveries: DeliveryStream,
        handler: Arc<DeliveryHandler<ChannelOf<B>, P>>,
        shutdown: &mut watch::Receiver<bool>,
        report: &mut WorkerReport,
    ) -> Result<(), ConsumerError> {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let (abort_tx, abort_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        self.transition(WorkerState::Consuming);

        let outcome = loop {
            while let Some(joined) = tasks.try_join_next() {
                report.record_joined(joined);
            }

            // 先拿到许可再拉取，未处理的投递不会在本地堆积
            let permit = tokio::select! {
                biased;
                _ = stop_requested(shutdown) => break Ok(()),
                permit = semaphore.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                break Ok(());
            };

            let next = tokio::select! {
                biased;
                _ = stop_requested(shutdown) => break Ok(()),
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    report.delivered += 1;
                    let handler = handler.clone();
                    let abort = abort_rx.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        handler.handle(delivery, abort).await
                    });
                }
                Some(Err(e)) => break Err(ConsumerError::Subscription(e.to_string())),
                None => break Err(ConsumerError::Subscription("投递流已结束".to_string())),
            }
        };

        match &outcome {
            Ok(()) => info!("收到关闭信号，停止拉取新投递"),
            Err(e) => warn!(error = %e, "投递流中断"),
        }

        self.transition(WorkerState::Draining);
        self.drain(&mut tasks, &abort_tx, report).await;
        drop(deliveries);
        outcome
    }

    async fn drain(
        &self,
        tasks: &mut JoinSet<Outcome>,
        abort: &watch::Sender<bool>,
        report: &mut WorkerReport,
    ) {
        if tasks.is_empty() {
            return;
        }
        info!(in_flight = tasks.len(), "等待处理中的订单完成");

        let timeout = self.settings.drain_timeout;
        if tokio::time::timeout(timeout, join_all(tasks, report))
            .await
            .is_err()
        {
            warn!(
                remaining = tasks.len(),
                timeout_ms = timeout.as_millis() as u64,
                "排空超时，取消剩余处理并重新入队"
            );
            abort.send_replace(true);
            join_all(tasks, report).await;
        }
    }
}

async fn join_all(tasks: &mut JoinSet<Outcome>, report: &mut WorkerReport) {
    while let Some(joined) = tasks.join_next().await {
        report.record_joined(joined);
    }
}

/// 等待关闭信号；发送端被丢弃同样视为关闭
pub(crate) async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// 等待取消信号；发送端被丢弃时永不返回
async fn cancelled(abort: &mut watch::Receiver<bool>) {
    if abort.wait_for(|aborted| *aborted).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// 单条投递的结算结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Acked,
    Requeued,
    Cancelled,
    Rejected { dead_lettered: bool },
    Poison { dead_lettered: bool },
    /// 处理步骤 panic
    Crashed,
    SettleFailed,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Requeued => "requeued",
            Self::Cancelled => "cancelled",
            Self::Rejected { .. } => "rejected",
            Self::Poison { .. } => "poison",
            Self::Crashed => "crashed",
            Self::SettleFailed => "settle_failed",
        }
    }
}

struct DeliveryHandler<C, P: ?Sized> {
    channel: Arc<C>,
    processor: Arc<P>,
    queue: String,
    dead_letter: Option<DeadLetterPublisher>,
}

impl<C: Channel, P: ProcessingStep + ?Sized> DeliveryHandler<C, P> {
    async fn handle(&self, delivery: Delivery, mut abort: watch::Receiver<bool>) -> Outcome {
        let order = match decode_order(&delivery) {
            Ok(order) => order,
            Err(e) => return self.reject_poison(delivery, e).await,
        };
        let delivery_tag = delivery.delivery_tag();
        debug!(
            order_id = %order.id,
            delivery_tag,
            redelivered = delivery.redelivered(),
            "收到订单"
        );

        let started = Instant::now();
        let processing = AssertUnwindSafe(self.processor.process(&order)).catch_unwind();
        let result = tokio::select! {
            result = processing => Some(result),
            _ = cancelled(&mut abort) => None,
        };

        let Some(result) = result else {
            warn!(order_id = %order.id, delivery_tag, "处理被取消，订单重新入队");
            return self.settle(delivery, &order.id, Outcome::Cancelled).await;
        };
        let result = match result {
            Ok(result) => result,
            Err(panic) => {
                error!(
                    order_id = %order.id,
                    delivery_tag,
                    panic = panic_message(&*panic),
                    "处理步骤 panic，订单重新入队"
                );
                return self.settle(delivery, &order.id, Outcome::Crashed).await;
            }
        };
        record_processing(&self.queue, started.elapsed().as_secs_f64());

        match result {
            Ok(()) => self.settle(delivery, &order.id, Outcome::Acked).await,
            Err(e) => match self.processor.disposition(&e) {
                Disposition::Requeue => {
                    warn!(order_id = %order.id, delivery_tag, error = %e, "处理失败，订单重新入队");
                    self.settle(delivery, &order.id, Outcome::Requeued).await
                }
                Disposition::Reject => {
                    error!(order_id = %order.id, delivery_tag, error = %e, "处理失败，订单被拒绝");
                    let dead_lettered = self
                        .dead_letter(&delivery, Some(order.id.clone()), DeadLetterReason::Rejected, &e.to_string())
                        .await;
                    self.settle(delivery, &order.id, Outcome::Rejected { dead_lettered })
                        .await
                }
            },
        }
    }

    async fn reject_poison(&self, delivery: Delivery, cause: ConsumerError) -> Outcome {
        error!(
            delivery_tag = delivery.delivery_tag(),
            content_type = %delivery.envelope().content_type(),
            error = %cause,
            "无法解码的毒消息，拒绝且不重新入队"
        );
        let dead_lettered = self
            .dead_letter(&delivery, None, DeadLetterReason::Poison, &cause.to_string())
            .await;
        self.settle(delivery, "", Outcome::Poison { dead_lettered }).await
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        message_id: Option<String>,
        reason: DeadLetterReason,
        cause: &str,
    ) -> bool {
        match &self.dead_letter {
            Some(publisher) => {
                publisher
                    .send(
                        self.channel.as_ref(),
                        &self.queue,
                        message_id,
                        delivery.envelope(),
                        reason,
                        cause,
                    )
                    .await
            }
            None => false,
        }
    }

    async fn settle(&self, delivery: Delivery, order_id: &str, outcome: Outcome) -> Outcome {
        let delivery_tag = delivery.delivery_tag();
        let result = match outcome {
            Outcome::Acked => delivery.ack().await,
            Outcome::Requeued | Outcome::Cancelled | Outcome::Crashed => {
                delivery.nack(true).await
            }
            Outcome::Rejected { .. } | Outcome::Poison { .. } => delivery.nack(false).await,
            Outcome::SettleFailed => Ok(()),
        };

        let outcome = match result {
            Ok(()) => {
                debug!(order_id, delivery_tag, outcome = outcome.label(), "投递已结算");
                outcome
            }
            Err(e) => {
                warn!(order_id, delivery_tag, error = %e, "结算投递失败，消息将由 Broker 重投");
                Outcome::SettleFailed
            }
        };
        record_delivery(&self.queue, outcome.label());
        outcome
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn decode_order(delivery: &Delivery) -> Result<Order, ConsumerError> {
    delivery
        .envelope()
        .decode()
        .map_err(|e| ConsumerError::DeliveryDecode {
            delivery_tag: delivery.delivery_tag(),
            reason: e.to_string(),
        })
}
