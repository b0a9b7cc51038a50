//! 下单 API 处理器

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
};
use orderflow_shared::envelope::Order;
use orderflow_shared::retry::retry_with_policy;
use tracing::info;

use crate::{
    dispatcher::DispatchError,
    dto::{ApiResponse, OrderCreated},
    error::IntakeError,
    state::AppState,
};

/// 提交订单
///
/// POST /orders
///
/// 订单发布到队列后立即返回 201，不等待支付处理。
/// 可重试的派发失败按重试策略重试；标识在首次尝试前确定，
/// 重试不会产生不同 ID 的重复订单。
pub async fn create_order(
    State(state): State<AppState>,
    payload: Result<Json<Order>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<OrderCreated>>), IntakeError> {
    let Json(mut order) = payload.map_err(|e| IntakeError::InvalidOrder(e.body_text()))?;
    order.ensure_id();

    let dispatcher = &state.dispatcher;
    let dispatched = retry_with_policy(
        &state.retry_policy,
        "dispatch_order",
        DispatchError::is_retryable,
        || dispatcher.dispatch(order.clone()),
    )
    .await?;

    info!(order_id = %dispatched.order_id, amount = order.amount, "订单已受理");

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::created(OrderCreated {
            id: dispatched.order_id,
        })),
    ))
}
