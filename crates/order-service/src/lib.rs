//! 下单服务
//!
//! 通过 HTTP 接收订单，交给 Dispatcher 发布到订单队列后立即返回，
//! 支付处理由下游消费端异步完成。

pub mod dispatcher;
pub mod dto;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use dispatcher::{DispatchError, Dispatched, Dispatcher};
pub use error::IntakeError;
pub use state::AppState;
