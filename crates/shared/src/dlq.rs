//! 死信队列
//!
//! 无法解码的毒消息和被判定为永久失败的订单，在以 `nack(requeue=false)` 拒绝之前，
//! 可选地包装为死信消息发送到独立队列，保留原始内容供排查或人工重放。
//! UTF-8 消息体原样保存，其余按 base64 保存，可逐字节还原。
//! 死信发布失败只记录日志，不影响主队列的结算。

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::broker::{Channel, QueueHandle};
use crate::envelope::{CONTENT_TYPE_JSON, Envelope};
use crate::error::BrokerError;

/// 死信原因分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// 消息体无法解码为订单
    Poison,
    /// 处理步骤判定为永久失败
    Rejected,
}

/// 原始消息体在死信中的编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    Utf8,
    Base64,
}

/// 死信消息信封
///
/// 包装原始消息，附加失败原因和来源信息。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始订单 ID；毒消息无法解析时为 None
    pub message_id: Option<String>,
    pub source_queue: String,
    /// 原始消息体，编码见 `payload_encoding`
    pub payload: String,
    pub payload_encoding: PayloadEncoding,
    pub content_type: String,
    pub reason: DeadLetterReason,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub source_service: String,
}

impl DeadLetterMessage {
    pub fn new(
        message_id: Option<String>,
        source_queue: impl Into<String>,
        original: &Envelope,
        reason: DeadLetterReason,
        error: impl Into<String>,
        source_service: impl Into<String>,
    ) -> Self {
        let (payload, payload_encoding) = match std::str::from_utf8(original.body()) {
            Ok(text) => (text.to_string(), PayloadEncoding::Utf8),
            Err(_) => (BASE64.encode(original.body()), PayloadEncoding::Base64),
        };
        Self {
            message_id,
            source_queue: source_queue.into(),
            payload,
            payload_encoding,
            content_type: original.content_type().to_string(),
            reason,
            error: error.into(),
            failed_at: Utc::now(),
            source_service: source_service.into(),
        }
    }

    /// 还原原始消息体
    pub fn original_body(&self) -> Result<Vec<u8>, base64::DecodeError> {
        match self.payload_encoding {
            PayloadEncoding::Utf8 => Ok(self.payload.clone().into_bytes()),
            PayloadEncoding::Base64 => BASE64.decode(&self.payload),
        }
    }

    /// 编码为 JSON 信封，路由键沿用原始消息 ID
    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        let body = serde_json::to_vec(self)?;
        Ok(Envelope::from_parts(
            body,
            CONTENT_TYPE_JSON,
            self.message_id.clone(),
            HashMap::new(),
        ))
    }
}

/// 死信发布器
///
/// 与消费者共用同一通道，发布到预先声明好的死信队列。
pub struct DeadLetterPublisher {
    queue: QueueHandle,
    source_service: String,
}

impl DeadLetterPublisher {
    pub fn new(queue: QueueHandle, source_service: impl Into<String>) -> Self {
        Self {
            queue,
            source_service: source_service.into(),
        }
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    /// 将失败消息发送到死信队列
    ///
    /// 返回是否发送成功；失败只记录日志。
    pub async fn send<C: Channel>(
        &self,
        channel: &C,
        source_queue: &str,
        message_id: Option<String>,
        original: &Envelope,
        reason: DeadLetterReason,
        cause: &str,
    ) -> bool {
        let message = DeadLetterMessage::new(
            message_id,
            source_queue,
            original,
            reason,
            cause,
            &self.source_service,
        );

        let result = match message.to_envelope() {
            Ok(envelope) => channel.publish(&self.queue, &envelope).await,
            Err(e) => Err(BrokerError::Publish {
                queue: self.queue.name().to_string(),
                reason: format!("死信序列化失败: {e}"),
            }),
        };

        match result {
            Ok(_) => {
                warn!(
                    message_id = ?message.message_id,
                    source_queue,
                    dead_letter_queue = self.queue.name(),
                    ?reason,
                    error = cause,
                    "消息已发送到死信队列"
                );
                true
            }
            Err(e) => {
                error!(
                    message_id = ?message.message_id,
                    dead_letter_queue = self.queue.name(),
                    error = %e,
                    "发送到死信队列失败，消息仅保留在日志中"
                );
                false
            }
        }
    }
}
