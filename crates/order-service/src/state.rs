//! 应用状态定义

use std::sync::Arc;
use std::time::Duration;

use orderflow_shared::broker::AnyBroker;
use orderflow_shared::config::IntakeConfig;
use orderflow_shared::retry::RetryPolicy;

use crate::dispatcher::Dispatcher;

/// Axum 应用共享状态
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher<AnyBroker>>,
    /// 下单入口对可重试派发失败的重试策略
    pub retry_policy: RetryPolicy,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher<AnyBroker>, intake: &IntakeConfig) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            retry_policy: RetryPolicy::with_retries(
                intake.publish_retries,
                Duration::from_millis(intake.retry_initial_delay_ms),
            ),
        }
    }
}
