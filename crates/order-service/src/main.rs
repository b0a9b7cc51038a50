//! 下单服务入口

use std::sync::Arc;

use order_service::{AppState, Dispatcher, routes};
use orderflow_shared::{
    broker::AnyBroker,
    config::{AppConfig, BrokerKind},
    observability,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "order-service";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;
    let _guard = observability::init(&config.service_name, &config.observability).await?;

    info!("Starting {} on {}", SERVICE_NAME, config.server_addr());

    let queue = config.broker.queue_spec()?;
    info!(queue = %queue.name, durable = queue.durable, "订单队列配置");
    if config.broker.kind == BrokerKind::Memory {
        warn!("使用进程内 Broker，订单不会离开本进程");
    }

    let broker = Arc::new(AnyBroker::from_config(&config.broker)?);
    let dispatcher = Dispatcher::new(broker, queue, &config.service_name);
    let app = routes::app(AppState::new(dispatcher, &config.intake));

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    // 停止接收新连接，等待已受理的订单发布完毕
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// 监听关闭信号（SIGTERM 或 Ctrl+C）
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
