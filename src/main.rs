//! Workforce Broker
//!
//! 入口：初始化日志、加载配置、构建 BrokerContext，记录 outbox 事件直到收到关闭信号。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use workforce_broker::config::load_config;
use workforce_broker::observability;
use workforce_broker::shutdown::{ShutdownCoordinator, ShutdownManager};
use workforce_broker::BrokerContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    // 可选：第一个参数为额外的配置文件路径
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    let manager = Arc::new(ShutdownManager::new());
    manager.install_signal_handlers();

    let ctx = Arc::new(
        BrokerContext::new(config)
            .context("Failed to build broker context")?
            .with_shutdown_token(&manager.token()),
    );
    let bus = ctx.event_bus().await.context("Failed to create event bus")?;
    let _outbox = bus.subscribe(|event| async move {
        tracing::info!(
            event_id = %event.event_id,
            object_type = %event.object_type,
            object_id = %event.object_id,
            event_type = ?event.event_type,
            "Outbox event"
        );
        Ok(())
    });

    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    coordinator.register(ctx.clone());

    tracing::info!(mode = %ctx.mode(), "workforce-broker started");
    let reason = coordinator.run(&manager).await;
    tracing::info!(reason = ?reason, "workforce-broker stopped");
    Ok(())
}
