//! 消费会话监管
//!
//! `Worker::run` 只负责单个会话。这里在会话因连接丢失或订阅中断结束时
//! 按指数退避重建会话，连续失败超过上限或遇到不可重试的错误时退出。

use std::time::Duration;

use orderflow_shared::broker::Broker;
use orderflow_shared::retry::RetryPolicy;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::ConsumerError;
use crate::processor::ProcessingStep;
use crate::worker::{Worker, WorkerReport, stop_requested};

/// 持续运行消费会话直到收到关闭信号
///
/// 订阅中断说明会话曾经建立成功，重连计数归零；
/// 连接阶段的失败累加计数，超过 `policy.max_retries` 后返回最后一个错误。
pub async fn supervise<B, P>(
    worker: &Worker<B, P>,
    policy: &RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) -> Result<WorkerReport, ConsumerError>
where
    B: Broker,
    P: ProcessingStep + ?Sized,
{
    let mut failures: u32 = 0;

    loop {
        let error = match worker.run(shutdown.clone()).await {
            Ok(_) => {
                info!("消费端已停止");
                return Ok(worker.totals());
            }
            Err(e) => e,
        };

        if *shutdown.borrow() {
            info!(error = %error, "关闭期间会话结束");
            return Ok(worker.totals());
        }
        if !error.is_retryable() {
            error!(code = error.code(), error = %error, "消费会话出现不可恢复的错误");
            return Err(error);
        }

        if matches!(error, ConsumerError::Subscription(_)) {
            failures = 0;
        }
        if !policy.should_retry(failures) {
            error!(
                attempts = failures + 1,
                error = %error,
                "重连次数已用尽，放弃消费"
            );
            return Err(error);
        }

        let delay = policy.delay_for_attempt(failures);
        failures += 1;
        warn!(
            attempt = failures,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "消费会话中断，等待后重连"
        );

        if wait_or_stop(delay, &mut shutdown).await {
            return Ok(worker.totals());
        }
    }
}

/// 等待退避时间；期间收到关闭信号返回 true
async fn wait_or_stop(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = stop_requested(shutdown) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
