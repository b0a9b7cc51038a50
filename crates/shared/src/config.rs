//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::broker::{AckMode, ORDERS_QUEUE, QueueSpec};
use crate::error::BrokerError;

/// Broker 实现类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Kafka,
    /// 进程内 Broker，仅在单进程内有效
    Memory,
}

/// Broker 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub brokers: String,
    pub consumer_group: String,
    pub auto_offset_reset: String,
    pub queue: String,
    /// 队列持久化必须显式配置，没有默认值
    pub durable: Option<bool>,
    pub replication_factor: i32,
    pub publish_timeout_ms: u64,
    pub dead_letter_queue: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Kafka,
            brokers: "localhost:9092".to_string(),
            consumer_group: "payment-service".to_string(),
            auto_offset_reset: "earliest".to_string(),
            queue: ORDERS_QUEUE.to_string(),
            durable: None,
            replication_factor: 1,
            publish_timeout_ms: 5000,
            dead_letter_queue: None,
        }
    }
}

impl BrokerConfig {
    /// 订单队列声明参数
    ///
    /// `durable` 未配置时返回错误：非持久队列在 Broker 重启时会丢失消息，
    /// 这一取舍必须由部署方显式做出。
    pub fn queue_spec(&self) -> Result<QueueSpec, BrokerError> {
        let durable = self.durable.ok_or_else(|| {
            BrokerError::Config(format!(
                "broker.durable 未配置，必须显式声明队列 {} 是否持久化",
                self.queue
            ))
        })?;
        Ok(QueueSpec::new(&self.queue, durable))
    }

    /// 死信队列声明参数，与主队列持久化策略一致
    pub fn dead_letter_spec(&self) -> Result<Option<QueueSpec>, BrokerError> {
        let Some(name) = &self.dead_letter_queue else {
            return Ok(None);
        };
        let main = self.queue_spec()?;
        Ok(Some(QueueSpec::new(name, main.durable)))
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// 消费端配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 并发处理数，1 表示严格顺序处理
    pub concurrency: usize,
    pub ack_mode: AckMode,
    pub drain_timeout_ms: u64,
    /// 会话连续失败的最大重连次数
    pub max_reconnects: u32,
    pub reconnect_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            ack_mode: AckMode::Explicit,
            drain_timeout_ms: 30_000,
            max_reconnects: 5,
            reconnect_delay_ms: 1000,
        }
    }
}

impl WorkerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// 下单入口配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// 可重试的派发失败在返回错误前的最大重试次数
    pub publish_retries: u32,
    pub retry_initial_delay_ms: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            publish_retries: 2,
            retry_initial_delay_ms: 100,
        }
    }
}

/// 服务配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 是否输出 JSON 格式日志
    pub json_logs: bool,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_port: 9090,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub intake: IntakeConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（ORDERFLOW_ 前缀，双下划线分隔层级，如 ORDERFLOW_BROKER__BROKERS -> broker.brokers）
    /// 5. 服务端口环境变量（如 ORDER_SERVICE_PORT）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        // .env 文件不存在是正常情况
        let _ = dotenvy::dotenv();

        let env = std::env::var("ORDERFLOW_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("ORDERFLOW")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: Self = builder.build()?.try_deserialize()?;

        if let Some(port) = Self::service_port_from_env(service_name) {
            config.server.port = port;
        }

        Ok(config)
    }

    /// 将 "order-service" 转换为 "ORDER_SERVICE_PORT" 并读取
    fn service_port_from_env(service_name: &str) -> Option<u16> {
        std::env::var(Self::service_port_var(service_name))
            .ok()
            .and_then(|v| v.parse().ok())
    }

    fn service_port_var(service_name: &str) -> String {
        format!("{}_PORT", service_name.to_uppercase().replace('-', "_"))
    }

    /// 获取服务地址
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
