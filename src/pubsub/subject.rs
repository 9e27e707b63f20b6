//! Subject：命名多播流
//!
//! 每个订阅者拥有独立的无界队列与投递任务，因此：
//! - 同一 Subject 内，订阅者收到的顺序与发布顺序一致
//! - 订阅者回调返回错误或 panic 只记录日志，不影响发布者与其他订阅者
//! - 完成（complete）后不再接受新值，已入队的值仍会投递完毕

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Payload, PubSubMode};
use crate::error::Result;

static NEXT_SUBJECT_ID: AtomicU64 = AtomicU64::new(0);

type CompleteHook = Box<dyn FnOnce() + Send>;

struct Observer<T> {
    id: u64,
    tx: mpsc::UnboundedSender<T>,
}

struct SubjectState<T> {
    observers: Vec<Observer<T>>,
    completed: bool,
    hooks: Vec<CompleteHook>,
}

/// 发布侧连接
pub(super) enum Link {
    Local,
    #[cfg(feature = "redis")]
    Redis(super::redis::RedisLink),
}

impl Link {
    fn close(&self) {
        match self {
            Link::Local => {}
            #[cfg(feature = "redis")]
            Link::Redis(link) => link.close(),
        }
    }
}

pub(super) struct SubjectInner<T> {
    id: u64,
    name: String,
    mode: PubSubMode,
    link: Link,
    next_observer: AtomicU64,
    state: Mutex<SubjectState<T>>,
}

impl<T: Clone> SubjectInner<T> {
    fn lock(&self) -> MutexGuard<'_, SubjectState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 向当前所有订阅者投递（已退出的订阅者顺带清理）
    pub(super) fn deliver(&self, value: T) {
        let mut state = self.lock();
        if state.completed {
            return;
        }
        state.observers.retain(|o| o.tx.send(value.clone()).is_ok());
    }

    fn remove_observer(&self, id: u64) {
        self.lock().observers.retain(|o| o.id != id);
    }
}

/// 命名多播流（克隆共享同一实例）
pub struct Subject<T> {
    inner: Arc<SubjectInner<T>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("mode", &self.inner.mode)
            .finish()
    }
}

impl<T: Payload> Subject<T> {
    /// 进程内 Subject，不进入 Hub 注册表（如会话内部的三条信号流）
    pub fn local(name: impl Into<String>) -> Self {
        Self::with_link(name.into(), PubSubMode::InMemory, Link::Local)
    }

    pub(super) fn with_link(name: String, mode: PubSubMode, link: Link) -> Self {
        Self {
            inner: Arc::new(SubjectInner {
                id: NEXT_SUBJECT_ID.fetch_add(1, Ordering::Relaxed),
                name,
                mode,
                link,
                next_observer: AtomicU64::new(0),
                state: Mutex::new(SubjectState {
                    observers: Vec::new(),
                    completed: false,
                    hooks: Vec::new(),
                }),
            }),
        }
    }

    /// 实例标识（同名 Subject 被重建后标识不同）
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn mode(&self) -> PubSubMode {
        self.inner.mode
    }

    pub fn is_completed(&self) -> bool {
        self.inner.lock().completed
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    /// 是否为同一实例
    pub fn same_instance(&self, other: &Subject<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(super) fn downgrade(&self) -> Weak<SubjectInner<T>> {
        Arc::downgrade(&self.inner)
    }

    /// 发布一个值；完成后的 Subject 忽略新值
    pub async fn next(&self, value: T) -> Result<()> {
        if self.is_completed() {
            tracing::debug!(subject = %self.inner.name, "Ignoring value published after completion");
            return Ok(());
        }
        match &self.inner.link {
            Link::Local => {
                self.inner.deliver(value);
                Ok(())
            }
            #[cfg(feature = "redis")]
            Link::Redis(link) => link.publish(&self.inner.name, &value).await,
        }
    }

    /// 订阅：回调按发布顺序依次执行，返回可撤销的订阅句柄
    ///
    /// 丢弃句柄不会取消订阅，需显式调用 `unsubscribe`。
    pub fn subscribe<F, Fut>(&self, callback: F) -> Subscription
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let observer_id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.inner.lock();
            if state.completed {
                return Subscription::closed();
            }
            state.observers.push(Observer {
                id: observer_id,
                tx,
            });
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let name = self.inner.name.clone();
        tokio::spawn(async move {
            loop {
                let value = tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    value = rx.recv() => match value {
                        Some(value) => value,
                        None => break,
                    },
                };
                let outcome = AssertUnwindSafe(async { callback(value).await })
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!(subject = %name, error = %e, "Subscriber failed to handle value");
                    }
                    Err(_) => {
                        tracing::error!(subject = %name, "Subscriber panicked while handling value");
                    }
                }
            }
            task_token.cancel();
        });

        let weak = self.downgrade();
        Subscription {
            token,
            detach: Some(Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.remove_observer(observer_id);
                }
            })),
        }
    }

    /// 注册完成钩子；已完成则立即执行
    pub fn on_complete(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.inner.lock();
            if !state.completed {
                state.hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// 完成：停止接收新值、断开后端连接并执行完成钩子（幂等）
    pub fn complete(&self) {
        let hooks = {
            let mut state = self.inner.lock();
            if state.completed {
                return;
            }
            state.completed = true;
            state.observers.clear();
            std::mem::take(&mut state.hooks)
        };
        self.inner.link.close();
        tracing::debug!(subject = %self.inner.name, mode = %self.inner.mode, "Subject completed");
        for hook in hooks {
            hook();
        }
    }
}

/// 可撤销的订阅句柄（克隆共享同一订阅）
#[derive(Clone)]
pub struct Subscription {
    token: CancellationToken,
    detach: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Subscription {
    fn closed() -> Self {
        let token = CancellationToken::new();
        token.cancel();
        Self {
            token,
            detach: None,
        }
    }

    /// 取消订阅；尚未投递的值被丢弃，已投递的不受影响
    pub fn unsubscribe(&self) {
        self.token.cancel();
        if let Some(detach) = &self.detach {
            detach();
        }
    }

    /// 已取消或 Subject 已完成且队列已排空
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn recv(rx: &mut mpsc::UnboundedReceiver<u32>) -> Option<u32> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_delivery_preserves_publish_order() {
        let subject = Subject::<u32>::local("order");
        let (tx, mut rx) = mpsc::unbounded_channel();
        subject.subscribe(move |v| {
            let tx = tx.clone();
            async move {
                tx.send(v)?;
                Ok(())
            }
        });

        for i in 0..50 {
            subject.next(i).await.unwrap();
        }
        for i in 0..50 {
            assert_eq!(recv(&mut rx).await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_affect_others() {
        let subject = Subject::<u32>::local("isolation");
        subject.subscribe(|_| async { Err(anyhow::anyhow!("boom")) });
        subject.subscribe(|v| async move {
            if v == 1 {
                panic!("subscriber panic");
            }
            Ok(())
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        subject.subscribe(move |v| {
            let tx = tx.clone();
            async move {
                tx.send(v)?;
                Ok(())
            }
        });

        subject.next(1).await.unwrap();
        subject.next(2).await.unwrap();
        assert_eq!(recv(&mut rx).await, Some(1));
        assert_eq!(recv(&mut rx).await, Some(2));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_future_delivery() {
        let subject = Subject::<u32>::local("unsubscribe");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = subject.subscribe(move |v| {
            let tx = tx.clone();
            async move {
                tx.send(v)?;
                Ok(())
            }
        });

        subject.next(1).await.unwrap();
        assert_eq!(recv(&mut rx).await, Some(1));

        subscription.unsubscribe();
        assert!(subscription.is_closed());
        assert_eq!(subject.observer_count(), 0);
        subject.next(2).await.unwrap();
        assert_eq!(recv(&mut rx).await, None);
    }

    #[tokio::test]
    async fn test_complete_runs_hooks_once_and_rejects_new_subscribers() {
        let subject = Subject::<u32>::local("complete");
        let (tx, mut rx) = mpsc::unbounded_channel();
        subject.on_complete(move || {
            let _ = tx.send(7);
        });

        subject.complete();
        subject.complete();
        assert!(subject.is_completed());
        assert_eq!(rx.recv().await, Some(7));
        assert!(rx.try_recv().is_err());

        let late = subject.subscribe(|_| async { Ok(()) });
        assert!(late.is_closed());
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let subject = Subject::<u32>::local("no-replay");
        subject.next(1).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        subject.subscribe(move |v| {
            let tx = tx.clone();
            async move {
                tx.send(v)?;
                Ok(())
            }
        });
        subject.next(2).await.unwrap();
        assert_eq!(recv(&mut rx).await, Some(2));
    }
}
