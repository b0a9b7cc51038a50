//! 支付服务
//!
//! 以自己的节奏消费订单队列：解码、执行支付处理步骤，
//! 并把确认与处理结果绑定，保证至少一次处理。

pub mod error;
pub mod processor;
pub mod supervisor;
pub mod worker;

pub use error::ConsumerError;
pub use processor::{Disposition, PaymentProcessor, ProcessingError, ProcessingStep};
pub use worker::{Worker, WorkerReport, WorkerSettings, WorkerState};
