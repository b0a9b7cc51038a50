//! 响应 DTO 定义

use serde::{Deserialize, Serialize};

/// API 统一响应
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// 创建成功响应
    pub fn created(data: T) -> Self {
        Self {
            success: true,
            code: "CREATED".to_string(),
            message: "Order created successfully".to_string(),
            data: Some(data),
        }
    }
}

/// 下单成功后返回的订单标识
#[derive(Debug, Serialize, Deserialize)]
pub struct OrderCreated {
    pub id: String,
}
