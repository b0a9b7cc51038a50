//! 支付服务入口

use std::sync::Arc;

use orderflow_shared::{
    broker::AnyBroker,
    config::{AppConfig, BrokerKind},
    observability,
    retry::RetryPolicy,
};
use payment_service::{PaymentProcessor, Worker, WorkerSettings, supervisor};
use tokio::sync::watch;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "payment-service";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;
    let _guard = observability::init(&config.service_name, &config.observability).await?;

    info!("Starting {}...", SERVICE_NAME);

    let settings = WorkerSettings::from_config(&config)?;
    if !settings.queue.durable {
        warn!(queue = %settings.queue.name, "订单队列为非持久队列，Broker 重启时队列中的订单会丢失");
    }
    if config.broker.kind == BrokerKind::Memory {
        warn!("使用进程内 Broker，只能消费本进程发布的订单");
    }

    let broker = Arc::new(AnyBroker::from_config(&config.broker)?);
    let worker = Worker::new(broker, Arc::new(PaymentProcessor::new()), settings);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_tx.send_replace(true);
    });

    let policy = RetryPolicy::with_retries(
        config.worker.max_reconnects,
        config.worker.reconnect_delay(),
    );
    let report = supervisor::supervise(&worker, &policy, shutdown_rx).await?;

    info!(
        delivered = report.delivered,
        acked = report.acked,
        requeued = report.requeued,
        rejected = report.rejected,
        poison = report.poison,
        "{} shutdown complete",
        SERVICE_NAME
    );
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
