//! 下单到支付的端到端管道测试
//!
//! 使用内存 Broker 覆盖：正常处理、暂时失败重新入队、毒消息隔离、
//! 崩溃后重投、Broker 重启后的至少一次处理、关闭时排空。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use mockall::mock;
use order_service::Dispatcher;
use orderflow_shared::broker::memory::MemoryBroker;
use orderflow_shared::broker::{AckMode, Broker, Channel, Connection, ORDERS_QUEUE, QueueSpec};
use orderflow_shared::dlq::{DeadLetterMessage, DeadLetterReason};
use orderflow_shared::envelope::{CONTENT_TYPE_JSON, Envelope, Order};
use orderflow_shared::retry::RetryPolicy;
use orderflow_shared::test_utils::{orders_queue, unassigned_order, wait_until};
use payment_service::{
    ConsumerError, Disposition, ProcessingError, ProcessingStep, Worker, WorkerReport,
    WorkerSettings, supervisor,
};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

const DLQ: &str = "orders.dlq";
const WAIT: Duration = Duration::from_secs(5);

mock! {
    pub Step {}

    #[async_trait]
    impl ProcessingStep for Step {
        async fn process(&self, order: &Order) -> Result<(), ProcessingError>;
        fn disposition(&self, error: &ProcessingError) -> Disposition;
    }
}

// ==================== 测试用处理步骤 ====================

/// 记录处理过的订单
#[derive(Default)]
struct RecordingStep {
    processed: Mutex<Vec<Order>>,
}

impl RecordingStep {
    fn processed(&self) -> Vec<Order> {
        self.processed.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.processed.lock().unwrap().len()
    }
}

#[async_trait]
impl ProcessingStep for RecordingStep {
    async fn process(&self, order: &Order) -> Result<(), ProcessingError> {
        self.processed.lock().unwrap().push(order.clone());
        Ok(())
    }
}

/// 第一次调用永远挂起，模拟处理中崩溃
#[derive(Default)]
struct HangOnceStep {
    started: AtomicUsize,
    hung: AtomicBool,
    processed: Mutex<Vec<String>>,
}

impl HangOnceStep {
    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn processed(&self) -> Vec<String> {
        self.processed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessingStep for HangOnceStep {
    async fn process(&self, order: &Order) -> Result<(), ProcessingError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if !self.hung.swap(true, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.processed.lock().unwrap().push(order.id.clone());
        Ok(())
    }
}

/// 第一次调用 panic
#[derive(Default)]
struct PanicOnceStep {
    panicked: AtomicBool,
    processed: Mutex<Vec<String>>,
}

impl PanicOnceStep {
    fn processed(&self) -> Vec<String> {
        self.processed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessingStep for PanicOnceStep {
    async fn process(&self, order: &Order) -> Result<(), ProcessingError> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("payment gateway client bug");
        }
        self.processed.lock().unwrap().push(order.id.clone());
        Ok(())
    }
}

/// 第一次调用等待放行，用于在处理中途制造 Broker 故障
#[derive(Default)]
struct GatedStep {
    gate: Notify,
    started: AtomicUsize,
    gated: AtomicBool,
    processed: Mutex<Vec<String>>,
}

impl GatedStep {
    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn processed(&self) -> Vec<String> {
        self.processed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessingStep for GatedStep {
    async fn process(&self, order: &Order) -> Result<(), ProcessingError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if !self.gated.swap(true, Ordering::SeqCst) {
            self.gate.notified().await;
        }
        self.processed.lock().unwrap().push(order.id.clone());
        Ok(())
    }
}

/// 每单耗时固定，记录最大并发
struct SlowStep {
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    done: AtomicUsize,
}

impl SlowStep {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProcessingStep for SlowStep {
    async fn process(&self, _order: &Order) -> Result<(), ProcessingError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ==================== 辅助函数 ====================

struct RunningWorker {
    handle: JoinHandle<Result<WorkerReport, ConsumerError>>,
    shutdown: watch::Sender<bool>,
}

impl RunningWorker {
    async fn stop(self) -> WorkerReport {
        self.shutdown.send_replace(true);
        self.handle.await.unwrap().unwrap()
    }
}

fn settings(durable: bool) -> WorkerSettings {
    WorkerSettings::new(orders_queue(durable), "payment-service")
}

fn spawn_worker<P: ProcessingStep>(
    broker: &MemoryBroker,
    step: Arc<P>,
    settings: WorkerSettings,
) -> RunningWorker {
    let worker = Worker::new(Arc::new(broker.clone()), step, settings);
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(rx).await });
    RunningWorker { handle, shutdown }
}

async fn dispatch(broker: &MemoryBroker, durable: bool, order: Order) -> String {
    Dispatcher::new(Arc::new(broker.clone()), orders_queue(durable), "order-service")
        .dispatch(order)
        .await
        .unwrap()
        .order_id
}

async fn publish_raw(broker: &MemoryBroker, body: &[u8]) {
    let conn = broker.connect().await.unwrap();
    let channel = conn.open_channel().await.unwrap();
    let queue = channel.declare_queue(&orders_queue(false)).await.unwrap();
    let envelope = Envelope::from_parts(body.to_vec(), CONTENT_TYPE_JSON, None, Default::default());
    channel.publish(&queue, &envelope).await.unwrap();
    channel.close().await.unwrap();
    conn.close().await.unwrap();
}

async fn drained(broker: &MemoryBroker, queue: &str) -> bool {
    wait_until(WAIT, || async {
        broker.queue_depth(queue) == 0 && broker.unacked_count(queue) == 0
    })
    .await
}

// ==================== 场景 ====================

#[tokio::test]
async fn test_happy_path_processes_each_order_once_in_order() {
    let broker = MemoryBroker::new();
    let step = Arc::new(RecordingStep::default());
    let worker = spawn_worker(&broker, step.clone(), settings(false));

    let mut ids = Vec::new();
    for amount in [500, 20, 7] {
        ids.push(dispatch(&broker, false, unassigned_order(amount)).await);
    }

    assert!(wait_until(WAIT, || async { step.count() == 3 }).await);
    assert!(drained(&broker, ORDERS_QUEUE).await);
    let report = worker.stop().await;

    let processed = step.processed();
    assert_eq!(
        processed.iter().map(|o| o.id.clone()).collect::<Vec<_>>(),
        ids
    );
    assert_eq!(processed[0].amount, 500);
    assert_eq!(report.delivered, 3);
    assert_eq!(report.acked, 3);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn test_transient_failure_is_requeued_and_retried() {
    let broker = MemoryBroker::new();
    let attempts = Arc::new(AtomicUsize::new(0));

    let mut step = MockStep::new();
    let counter = attempts.clone();
    step.expect_process().returning(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(ProcessingError::Transient("gateway timeout".to_string()))
        } else {
            Ok(())
        }
    });
    step.expect_disposition()
        .returning(|e| e.default_disposition());

    let worker = spawn_worker(&broker, Arc::new(step), settings(false));
    dispatch(&broker, false, unassigned_order(500)).await;

    assert!(wait_until(WAIT, || async { attempts.load(Ordering::SeqCst) == 2 }).await);
    assert!(drained(&broker, ORDERS_QUEUE).await);
    let report = worker.stop().await;

    assert_eq!(report.delivered, 2);
    assert_eq!(report.requeued, 1);
    assert_eq!(report.acked, 1);
    assert_eq!(report.rejected, 0);
}

#[tokio::test]
async fn test_transient_failure_is_redelivered_to_next_subscription() {
    let broker = MemoryBroker::new();
    let id = dispatch(&broker, false, unassigned_order(500)).await;

    // 第一次处理返回暂时失败并同时请求关闭，会话在重新入队后结束
    let (shutdown, rx) = watch::channel(false);
    let mut step = MockStep::new();
    step.expect_process().times(1).returning(move |_| {
        shutdown.send_replace(true);
        Err(ProcessingError::Transient("gateway timeout".to_string()))
    });
    step.expect_disposition()
        .returning(|e| e.default_disposition());

    let worker = Worker::new(Arc::new(broker.clone()), Arc::new(step), settings(false));
    let report = worker.run(rx).await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(broker.queue_depth(ORDERS_QUEUE), 1);
    assert_eq!(broker.unacked_count(ORDERS_QUEUE), 0);

    // 新的订阅收到同一订单，并带有重投标记
    let conn = broker.connect().await.unwrap();
    let channel = conn.open_channel().await.unwrap();
    let queue = channel.declare_queue(&orders_queue(false)).await.unwrap();
    let mut deliveries = channel.consume(&queue, AckMode::Explicit).await.unwrap();
    let delivery = tokio::time::timeout(WAIT, deliveries.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(delivery.redelivered());
    let order = delivery.envelope().decode().unwrap();
    assert_eq!(order.id, id);
    assert_eq!(order.amount, 500);
    delivery.ack().await.unwrap();
    drop(deliveries);
    channel.close().await.unwrap();
    conn.close().await.unwrap();
    assert_eq!(broker.queue_depth(ORDERS_QUEUE), 0);
    assert_eq!(broker.unacked_count(ORDERS_QUEUE), 0);
}

#[tokio::test]
async fn test_panicking_step_requeues_and_worker_keeps_consuming() {
    let broker = MemoryBroker::new();
    let step = Arc::new(PanicOnceStep::default());
    let worker = spawn_worker(&broker, step.clone(), settings(false));

    let first = dispatch(&broker, false, unassigned_order(500)).await;
    let second = dispatch(&broker, false, unassigned_order(20)).await;

    assert!(wait_until(WAIT, || async { step.processed().len() == 2 }).await);
    assert!(drained(&broker, ORDERS_QUEUE).await);
    assert!(!worker.handle.is_finished());
    let report = worker.stop().await;

    assert_eq!(step.processed(), vec![first, second]);
    assert_eq!(report.crashed, 1);
    assert_eq!(report.acked, 2);
    assert_eq!(report.delivered, 3);
}

#[tokio::test]
async fn test_permanent_failure_is_rejected_to_dead_letter_queue() {
    let broker = MemoryBroker::new();
    let mut step = MockStep::new();
    step.expect_process()
        .times(1)
        .returning(|_| Err(ProcessingError::Permanent("card declined".to_string())));
    step.expect_disposition()
        .returning(|e| e.default_disposition());

    let mut settings = settings(false);
    settings.dead_letter = Some(QueueSpec::new(DLQ, false));
    let worker = spawn_worker(&broker, Arc::new(step), settings);
    let id = dispatch(&broker, false, unassigned_order(500)).await;

    assert!(wait_until(WAIT, || async { broker.queue_depth(DLQ) == 1 }).await);
    assert!(drained(&broker, ORDERS_QUEUE).await);
    let report = worker.stop().await;

    assert_eq!(report.rejected, 1);
    assert_eq!(report.dead_lettered, 1);

    let dead: DeadLetterMessage =
        serde_json::from_slice(broker.ready_messages(DLQ)[0].body()).unwrap();
    assert_eq!(dead.message_id.as_deref(), Some(id.as_str()));
    assert_eq!(dead.reason, DeadLetterReason::Rejected);
    assert_eq!(dead.source_queue, ORDERS_QUEUE);
    assert_eq!(dead.source_service, "payment-service");
}

#[tokio::test]
async fn test_poison_message_is_contained() {
    let broker = MemoryBroker::new();
    publish_raw(&broker, b"{not json").await;
    let valid = dispatch(&broker, false, unassigned_order(500)).await;

    let step = Arc::new(RecordingStep::default());
    let mut settings = settings(false);
    settings.dead_letter = Some(QueueSpec::new(DLQ, false));
    let worker = spawn_worker(&broker, step.clone(), settings);

    assert!(wait_until(WAIT, || async { step.count() == 1 }).await);
    assert!(drained(&broker, ORDERS_QUEUE).await);
    let report = worker.stop().await;

    // 毒消息不进入处理步骤，也不会回到主队列
    assert_eq!(step.processed()[0].id, valid);
    assert_eq!(report.poison, 1);
    assert_eq!(report.acked, 1);
    assert_eq!(report.dead_lettered, 1);

    let dead: DeadLetterMessage =
        serde_json::from_slice(broker.ready_messages(DLQ)[0].body()).unwrap();
    assert_eq!(dead.reason, DeadLetterReason::Poison);
    assert_eq!(dead.payload, "{not json");
    assert_eq!(dead.original_body().unwrap(), b"{not json");
    assert_eq!(dead.message_id, None);
}

#[tokio::test]
async fn test_poison_without_dead_letter_queue_is_discarded() {
    let broker = MemoryBroker::new();
    publish_raw(&broker, b"\x00\x01binary").await;

    let step = Arc::new(RecordingStep::default());
    let worker = spawn_worker(&broker, step.clone(), settings(false));

    assert!(drained(&broker, ORDERS_QUEUE).await);
    let report = worker.stop().await;

    assert_eq!(report.poison, 1);
    assert_eq!(report.dead_lettered, 0);
    assert_eq!(step.count(), 0);
}

#[tokio::test]
async fn test_crash_during_processing_leads_to_redelivery() {
    let broker = MemoryBroker::new();
    let step = Arc::new(HangOnceStep::default());
    let id = dispatch(&broker, false, unassigned_order(500)).await;

    let crashed = spawn_worker(&broker, step.clone(), settings(false));
    assert!(wait_until(WAIT, || async { step.started() == 1 }).await);
    assert_eq!(broker.unacked_count(ORDERS_QUEUE), 1);

    crashed.handle.abort();
    assert!(wait_until(WAIT, || async { broker.queue_depth(ORDERS_QUEUE) == 1 }).await);
    assert_eq!(broker.unacked_count(ORDERS_QUEUE), 0);

    let worker = spawn_worker(&broker, step.clone(), settings(false));
    assert!(wait_until(WAIT, || async { step.processed().len() == 1 }).await);
    assert!(drained(&broker, ORDERS_QUEUE).await);
    let report = worker.stop().await;

    assert_eq!(step.processed(), vec![id]);
    assert_eq!(report.acked, 1);
}

#[tokio::test]
async fn test_auto_ack_loses_order_on_crash() {
    let broker = MemoryBroker::new();
    let step = Arc::new(HangOnceStep::default());
    dispatch(&broker, false, unassigned_order(500)).await;

    let mut settings = settings(false);
    settings.ack_mode = AckMode::Auto;
    let crashed = spawn_worker(&broker, step.clone(), settings);
    assert!(wait_until(WAIT, || async { step.started() == 1 }).await);

    crashed.handle.abort();
    let _ = crashed.handle.await;

    assert_eq!(broker.queue_depth(ORDERS_QUEUE), 0);
    assert_eq!(broker.unacked_count(ORDERS_QUEUE), 0);
}

#[tokio::test]
async fn test_at_least_once_across_broker_restart() {
    let broker = MemoryBroker::new();
    let step = Arc::new(GatedStep::default());

    let worker = Worker::new(Arc::new(broker.clone()), step.clone(), settings(true));
    let (shutdown, rx) = watch::channel(false);
    let policy = RetryPolicy::with_retries(5, Duration::from_millis(10));
    let supervised = tokio::spawn(async move { supervisor::supervise(&worker, &policy, rx).await });

    let first = dispatch(&broker, true, unassigned_order(500)).await;
    assert!(wait_until(WAIT, || async { step.started() == 1 }).await);

    // 处理中途 Broker 重启：确认失效，订单保留在持久队列中并在新会话重投
    broker.restart();
    step.gate.notify_one();
    assert!(wait_until(WAIT, || async { step.processed().len() == 2 }).await);

    let second = dispatch(&broker, true, unassigned_order(20)).await;
    assert!(wait_until(WAIT, || async { step.processed().contains(&second) }).await);
    assert!(drained(&broker, ORDERS_QUEUE).await);

    shutdown.send_replace(true);
    let totals = supervised.await.unwrap().unwrap();

    // 至少一次：重启前已处理但未能确认的订单会被再处理一次
    assert_eq!(step.processed(), vec![first.clone(), first, second]);
    assert_eq!(totals.acked, 2);
    assert_eq!(totals.settle_failures, 1);
    assert_eq!(totals.delivered, 3);
}

#[tokio::test]
async fn test_non_durable_queue_loses_orders_on_restart() {
    let broker = MemoryBroker::new();
    dispatch(&broker, false, unassigned_order(500)).await;
    assert_eq!(broker.queue_depth(ORDERS_QUEUE), 1);

    broker.restart();

    assert!(!broker.queue_exists(ORDERS_QUEUE));
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_and_stops_pulling() {
    let broker = MemoryBroker::new();
    for amount in 1..=3 {
        dispatch(&broker, false, unassigned_order(amount)).await;
    }

    let step = Arc::new(SlowStep::new(Duration::from_millis(100)));
    let worker = spawn_worker(&broker, step.clone(), settings(false));
    assert!(wait_until(WAIT, || async { step.active.load(Ordering::SeqCst) == 1 }).await);

    let report = worker.stop().await;

    assert_eq!(report.delivered, 1);
    assert_eq!(report.acked, 1);
    assert_eq!(step.done.load(Ordering::SeqCst), 1);
    assert_eq!(broker.queue_depth(ORDERS_QUEUE), 2);
    assert_eq!(broker.unacked_count(ORDERS_QUEUE), 0);
}

#[tokio::test]
async fn test_drain_timeout_requeues_cancelled_work() {
    let broker = MemoryBroker::new();
    let step = Arc::new(HangOnceStep::default());
    dispatch(&broker, false, unassigned_order(500)).await;

    let mut settings = settings(false);
    settings.drain_timeout = Duration::from_millis(20);
    let worker = spawn_worker(&broker, step.clone(), settings);
    assert!(wait_until(WAIT, || async { step.started() == 1 }).await);

    let report = worker.stop().await;

    assert_eq!(report.cancelled, 1);
    assert_eq!(report.acked, 0);
    assert_eq!(broker.queue_depth(ORDERS_QUEUE), 1);
    assert_eq!(broker.unacked_count(ORDERS_QUEUE), 0);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let broker = MemoryBroker::new();
    for amount in 1..=6 {
        dispatch(&broker, false, unassigned_order(amount)).await;
    }

    let step = Arc::new(SlowStep::new(Duration::from_millis(50)));
    let mut settings = settings(false);
    settings.concurrency = 3;
    let worker = spawn_worker(&broker, step.clone(), settings);

    assert!(wait_until(WAIT, || async { step.done.load(Ordering::SeqCst) == 6 }).await);
    assert!(drained(&broker, ORDERS_QUEUE).await);
    let report = worker.stop().await;

    let max_active = step.max_active.load(Ordering::SeqCst);
    assert!(max_active <= 3, "max_active={max_active}");
    assert!(max_active >= 2, "max_active={max_active}");
    assert_eq!(report.acked, 6);
}

#[tokio::test]
async fn test_repeated_sessions_declare_idempotently() {
    let broker = MemoryBroker::new();
    let step = Arc::new(RecordingStep::default());

    for _ in 0..2 {
        let worker = spawn_worker(&broker, step.clone(), settings(true));
        dispatch(&broker, true, unassigned_order(1)).await;
        assert!(drained(&broker, ORDERS_QUEUE).await);
        worker.stop().await;
    }

    assert!(broker.queue_exists(ORDERS_QUEUE));
    assert_eq!(step.count(), 2);
}
