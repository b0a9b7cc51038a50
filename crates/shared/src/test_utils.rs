//! 测试工具模块
//!
//! 提供集成测试所需的辅助函数和测试数据生成器。

use std::future::Future;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use crate::broker::{ORDERS_QUEUE, QueueSpec};
use crate::config::{BrokerConfig, BrokerKind};
use crate::envelope::Order;

// ==================== 测试配置辅助 ====================

/// 创建使用内存 Broker 的配置
pub fn memory_broker_config(durable: bool) -> BrokerConfig {
    BrokerConfig {
        kind: BrokerKind::Memory,
        durable: Some(durable),
        ..Default::default()
    }
}

/// 订单队列声明参数
pub fn orders_queue(durable: bool) -> QueueSpec {
    QueueSpec::new(ORDERS_QUEUE, durable)
}

// ==================== 测试数据 ====================

/// 生成唯一的测试订单 ID
pub fn test_order_id() -> String {
    format!("test-order-{}", Uuid::new_v4())
}

/// 未分配标识的订单，带一个透传字段
pub fn unassigned_order(amount: i64) -> Order {
    Order::new(amount).with_attribute("customer", json!("test-customer"))
}

/// 已分配标识的订单
pub fn assigned_order(amount: i64) -> Order {
    Order {
        id: test_order_id(),
        ..unassigned_order(amount)
    }
}

// ==================== 异步断言 ====================

/// 轮询等待条件成立，超时返回 false
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
