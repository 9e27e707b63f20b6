//! 进程关闭
//!
//! [`ShutdownManager`] 持有进程级 CancellationToken，Ctrl+C / SIGTERM 触发时取消；
//! BrokerContext 通过 [`BrokerContext::with_shutdown_token`] 挂在其下，队列冲刷随之停止。
//! [`ShutdownCoordinator`] 等待关闭后按注册顺序释放代理、传输与上下文。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerObject, ObjectBroker};
use crate::context::BrokerContext;
use crate::transport::SocketTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
}

pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；只记录第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut current = self.reason.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(first) = *current {
                tracing::debug!(first = ?first, ignored = ?reason, "Shutdown already requested");
                return;
            }
            *current = Some(reason);
        }
        tracing::info!(reason = ?reason, "Shutdown requested");
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        tracing::info!("Received SIGTERM");
                        manager.shutdown(ShutdownReason::Signal);
                    }
                    Err(e) => tracing::warn!(error = %e, "SIGTERM handler unavailable"),
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要释放的组件
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

#[async_trait::async_trait]
impl ShutdownCleanup for BrokerContext {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "broker-context"
    }
}

/// 销毁该类别下所有活动对象（及其会话缓存与输出流）
#[async_trait::async_trait]
impl<A: BrokerObject> ShutdownCleanup for ObjectBroker<A> {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let objects = self.len().await;
        tracing::info!(kind = %self.kind(), objects = objects, "Releasing objects");
        self.destroy_all().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "object-broker"
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SocketTransport {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.close();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "socket-transport"
    }
}

/// 按注册顺序执行清理，单个组件超时后跳过
pub struct ShutdownCoordinator {
    components: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            components: Vec::new(),
            timeout,
        }
    }

    pub fn register(&mut self, component: Arc<dyn ShutdownCleanup>) {
        self.components.push(component);
    }

    /// 等待关闭信号，然后清理；返回触发关闭的原因
    pub async fn run(&self, manager: &ShutdownManager) -> Option<ShutdownReason> {
        manager.wait_for_shutdown().await;
        self.cleanup().await;
        manager.reason()
    }

    pub async fn cleanup(&self) {
        for component in &self.components {
            let name = component.name();
            match tokio::time::timeout(self.timeout, component.cleanup()).await {
                Ok(Ok(())) => tracing::debug!(component = name, "Released"),
                Ok(Err(e)) => tracing::warn!(component = name, error = %e, "Cleanup failed"),
                Err(_) => tracing::warn!(component = name, timeout = ?self.timeout, "Cleanup timed out"),
            }
        }
        tracing::info!(components = self.components.len(), "Shutdown cleanup finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::broker::ObjectKind;
    use crate::channel::MockChannel;
    use crate::transport::{FrameHandler, TransportConfig, TypedHandler};

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(manager.reason().is_none());

        manager.shutdown(ShutdownReason::Signal);
        manager.shutdown(ShutdownReason::UserInitiated);

        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Signal));
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl ShutdownCleanup for Stuck {
        async fn cleanup(&self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "stuck"
        }
    }

    struct Flag(Arc<AtomicBool>);

    #[async_trait::async_trait]
    impl ShutdownCleanup for Flag {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "flag"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_component_does_not_block_the_rest() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let released = Arc::new(AtomicBool::new(false));
        coordinator.register(Arc::new(Stuck));
        coordinator.register(Arc::new(Flag(released.clone())));

        coordinator.cleanup().await;
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_releases_brokers_then_context() {
        let manager = Arc::new(ShutdownManager::new());
        let ctx = Arc::new(BrokerContext::in_memory().with_shutdown_token(&manager.token()));
        ctx.event_bus().await.unwrap();
        let broker = Arc::new(ctx.broker::<MockChannel>(ObjectKind::Channel));
        broker.register(Arc::new(MockChannel::new("ch-1"))).await.unwrap();

        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.register(broker.clone());
        coordinator.register(ctx.clone());

        let run = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { coordinator.run(&manager).await })
        };
        manager.shutdown(ShutdownReason::UserInitiated);

        assert_eq!(run.await.unwrap(), Some(ShutdownReason::UserInitiated));
        assert!(ctx.shutdown_token().is_cancelled());
        assert!(broker.is_empty().await);
        assert!(ctx.hub().is_empty());
    }

    #[tokio::test]
    async fn test_transport_cleanup_stops_reconnecting() {
        let handler: Arc<dyn FrameHandler> =
            Arc::new(TypedHandler::new(|_: serde_json::Value| futures_util::future::ready(Ok(()))));
        let transport = Arc::new(SocketTransport::connect(TransportConfig::new("ws://127.0.0.1:9"), handler));

        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        coordinator.register(transport.clone());
        coordinator.cleanup().await;

        assert!(transport.is_closed());
        assert!(transport.send(&"late").await.is_err());
    }
}
