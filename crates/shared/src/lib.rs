//! 共享库
//!
//! 包含下单服务和支付服务共用的订单信封、Broker 通道抽象、配置、错误处理、
//! 重试策略、死信队列和可观测性等基础设施代码。

pub mod broker;
pub mod config;
pub mod dlq;
pub mod envelope;
pub mod error;
pub mod observability;
pub mod retry;
pub mod test_utils;
