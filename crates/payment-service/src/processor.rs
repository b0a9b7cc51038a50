//! 支付处理步骤
//!
//! 通过 `ProcessingStep` trait 抽象单个订单的业务处理，消费端只关心结果：
//! 成功则确认，失败则按 `disposition` 决定重新入队还是拒绝。
//! 默认实现 `PaymentProcessor` 为模拟扣款（仅记录日志），按订单 ID 幂等。

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use orderflow_shared::envelope::Order;
use thiserror::Error;
use tracing::info;

/// 处理失败分类
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    /// 暂时性失败，稍后重试可能成功
    #[error("暂时性失败: {0}")]
    Transient(String),

    /// 永久性失败，重试无意义
    #[error("永久性失败: {0}")]
    Permanent(String),
}

impl ProcessingError {
    /// 默认处置：暂时性失败重新入队，永久性失败拒绝
    pub fn default_disposition(&self) -> Disposition {
        match self {
            Self::Transient(_) => Disposition::Requeue,
            Self::Permanent(_) => Disposition::Reject,
        }
    }
}

/// 处理失败后的投递处置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// `nack(requeue=true)`
    Requeue,
    /// `nack(requeue=false)`
    Reject,
}

/// 单个订单的业务处理
///
/// 同一订单可能被投递多次，实现方需自行保证幂等。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessingStep: Send + Sync + 'static {
    async fn process(&self, order: &Order) -> Result<(), ProcessingError>;

    fn disposition(&self, error: &ProcessingError) -> Disposition {
        error.default_disposition()
    }
}

/// 模拟支付处理器
///
/// 记录本进程内已结算的订单，重复投递直接视为成功。
#[derive(Debug, Default)]
pub struct PaymentProcessor {
    settled: DashMap<String, i64>,
}

impl PaymentProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_settled(&self, order_id: &str) -> bool {
        self.settled.contains_key(order_id)
    }

    pub fn settled_count(&self) -> usize {
        self.settled.len()
    }
}

#[async_trait]
impl ProcessingStep for PaymentProcessor {
    async fn process(&self, order: &Order) -> Result<(), ProcessingError> {
        if !order.has_id() {
            return Err(ProcessingError::Permanent("订单缺少标识".to_string()));
        }
        if order.amount < 0 {
            return Err(ProcessingError::Permanent(format!(
                "扣款金额不能为负: {}",
                order.amount
            )));
        }

        match self.settled.entry(order.id.clone()) {
            Entry::Occupied(_) => {
                info!(order_id = %order.id, "订单已结算，忽略重复投递");
            }
            Entry::Vacant(entry) => {
                entry.insert(order.amount);
                info!(order_id = %order.id, amount = order.amount, "订单支付处理完成");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orderflow_shared::test_utils::assigned_order;

    #[test]
    fn test_default_disposition() {
        assert_eq!(
            ProcessingError::Transient("gateway timeout".to_string()).default_disposition(),
            Disposition::Requeue
        );
        assert_eq!(
            ProcessingError::Permanent("card declined".to_string()).default_disposition(),
            Disposition::Reject
        );
    }

    #[tokio::test]
    async fn test_payment_is_idempotent() {
        let processor = PaymentProcessor::new();
        let order = assigned_order(500);

        processor.process(&order).await.unwrap();
        processor.process(&order).await.unwrap();

        assert!(processor.is_settled(&order.id));
        assert_eq!(processor.settled_count(), 1);
    }

    #[tokio::test]
    async fn test_negative_amount_is_permanent() {
        let processor = PaymentProcessor::new();
        let err = processor.process(&assigned_order(-1)).await.unwrap_err();

        assert!(matches!(err, ProcessingError::Permanent(_)));
        assert_eq!(processor.disposition(&err), Disposition::Reject);
        assert_eq!(processor.settled_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_step_overrides_disposition() {
        let mut step = MockProcessingStep::new();
        step.expect_process()
            .returning(|_| Err(ProcessingError::Permanent("duplicate card".to_string())));
        step.expect_disposition().returning(|_| Disposition::Requeue);

        let err = step.process(&assigned_order(1)).await.unwrap_err();
        assert_eq!(step.disposition(&err), Disposition::Requeue);
    }
}
