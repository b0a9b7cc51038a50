//! 路由配置模块

use std::time::Duration;

use axum::{
    Router,
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use orderflow_shared::observability::middleware as obs_middleware;
use tower_http::timeout::TimeoutLayer;

use crate::{handlers, state::AppState};

/// 单个请求的处理上限，覆盖派发与入口重试
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// 业务路由
pub fn api_routes() -> Router<AppState> {
    Router::new().route("/orders", post(handlers::order::create_order))
}

/// 构建完整应用：业务路由、健康检查与可观测性中间件
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(api_routes())
        .route("/health", get(handlers::health::health_check))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            REQUEST_TIMEOUT,
        ))
        .layer(middleware::from_fn(obs_middleware::http_tracing))
        .layer(middleware::from_fn(obs_middleware::request_id))
        .with_state(state)
}
