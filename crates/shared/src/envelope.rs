//! 订单与消息信封
//!
//! `Order` 是端到端传递的领域实体；`Envelope` 是它在队列中的不可变字节表示。
//! 生产端只负责构造信封，消费端只负责解码信封，两端之间不共享任何内存。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// 订单消息的内容类型
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// 信封头：生产者服务名，仅用于日志关联
pub const HEADER_PRODUCER: &str = "x-producer";

/// 订单
///
/// `id` 为空表示尚未分配标识，由 Dispatcher 在发布前补齐。
/// 除 `id`、`amount` 外的字段原样透传，核心流程不做任何解析。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(default)]
    pub id: String,
    pub amount: i64,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Order {
    pub fn new(amount: i64) -> Self {
        Self {
            id: String::new(),
            amount,
            attributes: Map::new(),
        }
    }

    /// 附加透传字段
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }

    /// 若尚无标识则分配一个随机 UUID v4，返回是否发生了分配
    pub fn ensure_id(&mut self) -> bool {
        if self.has_id() {
            return false;
        }
        self.id = Uuid::new_v4().to_string();
        true
    }
}

/// 信封解码错误
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("不支持的内容类型: {0}")]
    UnsupportedContentType(String),

    #[error("消息体无法解码为订单: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// 消息信封
///
/// 构造后不可变：字段私有，只暴露只读访问。
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    body: Vec<u8>,
    content_type: String,
    key: Option<String>,
    headers: HashMap<String, String>,
}

impl Envelope {
    /// 从原始字节构造，供 Broker 后端还原收到的消息
    pub fn from_parts(
        body: Vec<u8>,
        content_type: impl Into<String>,
        key: Option<String>,
        headers: HashMap<String, String>,
    ) -> Self {
        Self {
            body,
            content_type: content_type.into(),
            key,
            headers,
        }
    }

    /// 将订单编码为 JSON 信封，订单 id 作为路由键
    pub fn encode(order: &Order) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(order)?;
        let key = order.has_id().then(|| order.id.clone());
        Ok(Self::from_parts(body, CONTENT_TYPE_JSON, key, HashMap::new()))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// 解码为订单
    ///
    /// 内容类型缺失时按 JSON 尝试；明确声明为其他类型时直接拒绝。
    pub fn decode(&self) -> Result<Order, EnvelopeError> {
        if !self.content_type.is_empty() && self.content_type != CONTENT_TYPE_JSON {
            return Err(EnvelopeError::UnsupportedContentType(
                self.content_type.clone(),
            ));
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_order_without_id_deserializes_empty() {
        let order: Order = serde_json::from_str(r#"{"amount":500}"#).unwrap();
        assert_eq!(order.id, "");
        assert_eq!(order.amount, 500);
        assert!(order.attributes.is_empty());
    }

    #[test]
    fn test_order_requires_amount() {
        let result: Result<Order, _> = serde_json::from_str(r#"{"id":"o-1"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_extra_attributes_pass_through() {
        let raw = json!({"id": "o-1", "amount": 42, "customer": "c-9", "items": [1, 2]});
        let order: Order = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(order.attributes.get("customer"), Some(&json!("c-9")));

        let back = serde_json::to_value(&order).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_ensure_id_assigns_only_when_empty() {
        let mut order = Order::new(10);
        assert!(order.ensure_id());
        assert!(Uuid::parse_str(&order.id).is_ok());

        let assigned = order.id.clone();
        assert!(!order.ensure_id());
        assert_eq!(order.id, assigned);
    }

    #[test]
    fn test_envelope_encode_sets_content_type_and_key() {
        let order = Order {
            id: "order-7".to_string(),
            amount: 500,
            attributes: Map::new(),
        };
        let envelope = Envelope::encode(&order).unwrap();

        assert_eq!(envelope.content_type(), CONTENT_TYPE_JSON);
        assert_eq!(envelope.key(), Some("order-7"));
        assert_eq!(envelope.decode().unwrap(), order);
    }

    #[test]
    fn test_envelope_decode_rejects_garbage() {
        let envelope =
            Envelope::from_parts(b"not json".to_vec(), CONTENT_TYPE_JSON, None, HashMap::new());
        assert!(matches!(
            envelope.decode(),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn test_envelope_decode_rejects_foreign_content_type() {
        let envelope = Envelope::from_parts(
            br#"{"id":"x","amount":1}"#.to_vec(),
            "text/plain",
            None,
            HashMap::new(),
        );
        assert!(matches!(
            envelope.decode(),
            Err(EnvelopeError::UnsupportedContentType(ct)) if ct == "text/plain"
        ));
    }
}
