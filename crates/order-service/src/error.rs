//! 下单入口错误类型
//!
//! 将派发失败映射为 HTTP 响应：请求体问题归咎于调用方，
//! Broker 不可达返回 503，其余 Broker 故障统一为 500。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use orderflow_shared::error::BrokerError;
use serde_json::json;

use crate::dispatcher::DispatchError;

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("订单格式无效: {0}")]
    InvalidOrder(String),

    #[error("订单派发失败: {0}")]
    Dispatch(#[from] DispatchError),
}

impl IntakeError {
    /// 返回对应的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidOrder(_) => StatusCode::BAD_REQUEST,
            Self::Dispatch(DispatchError::Broker(BrokerError::Connection(_))) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Dispatch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 返回错误码（用于 API 响应）
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidOrder(_) => "INVALID_ORDER",
            Self::Dispatch(DispatchError::Broker(BrokerError::Connection(_))) => {
                "BROKER_UNAVAILABLE"
            }
            Self::Dispatch(_) => "DISPATCH_FAILED",
        }
    }
}

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Broker 细节只写日志，不返回给调用方
        let message = match &self {
            Self::InvalidOrder(_) => self.to_string(),
            Self::Dispatch(e) => {
                tracing::error!(code = e.code(), error = %e, "订单派发失败");
                if status == StatusCode::SERVICE_UNAVAILABLE {
                    "消息队列暂不可用，请稍后重试".to_string()
                } else {
                    "服务内部错误，请稍后重试".to_string()
                }
            }
        };

        let body = json!({
            "success": false,
            "code": self.error_code(),
            "message": message,
            "data": serde_json::Value::Null
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let invalid = IntakeError::InvalidOrder("missing field `amount`".to_string());
        assert_eq!(invalid.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(invalid.error_code(), "INVALID_ORDER");

        let unreachable = IntakeError::from(DispatchError::from(BrokerError::Connection(
            "refused".to_string(),
        )));
        assert_eq!(unreachable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(unreachable.error_code(), "BROKER_UNAVAILABLE");

        let declaration = IntakeError::from(DispatchError::from(BrokerError::Declaration {
            queue: "orders".to_string(),
            reason: "durable mismatch".to_string(),
        }));
        assert_eq!(declaration.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(declaration.error_code(), "DISPATCH_FAILED");
    }
}
