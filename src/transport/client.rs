use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{AuthMessage, AuthResponse, ConnectionState, FrameHandler, TransportConfig};
use crate::error::{BrokerError, Result};

type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;
type UnauthorizedCallback = Arc<dyn Fn() + Send + Sync>;

/// 出站状态：认证标记、当前连接的写端、预认证队列（跨重连保留）
#[derive(Default)]
struct Outbound {
    authed: bool,
    sink: Option<mpsc::UnboundedSender<WsMessage>>,
    preauth: VecDeque<String>,
}

struct Inner {
    config: TransportConfig,
    state_tx: watch::Sender<ConnectionState>,
    outbound: Mutex<Outbound>,
    shutdown: CancellationToken,
    on_state: Mutex<Option<StateCallback>>,
    on_unauthorized: Mutex<Option<UnauthorizedCallback>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous == state {
            return;
        }
        tracing::debug!(url = %self.config.url, from = ?previous, to = ?state, "Transport state changed");
        let callback = lock(&self.on_state).clone();
        if let Some(callback) = callback {
            callback(state);
        }
    }

    fn is_authed(&self) -> bool {
        lock(&self.outbound).authed
    }

    /// 已认证且有写端则直接发送，否则进入预认证队列
    fn enqueue(&self, text: String) {
        let mut guard = lock(&self.outbound);
        let out = &mut *guard;
        if out.authed {
            if let Some(sink) = &out.sink {
                match sink.send(WsMessage::Text(text)) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(WsMessage::Text(text))) => {
                        out.preauth.push_back(text);
                        return;
                    }
                    Err(_) => return,
                }
            }
        }
        out.preauth.push_back(text);
    }

    /// 标记已认证并按原顺序冲刷预认证队列
    fn authenticate(&self) {
        {
            let mut guard = lock(&self.outbound);
            let out = &mut *guard;
            out.authed = true;
            if let Some(sink) = &out.sink {
                let mut flushed = 0;
                while let Some(text) = out.preauth.pop_front() {
                    if let Err(mpsc::error::SendError(msg)) = sink.send(WsMessage::Text(text)) {
                        if let WsMessage::Text(text) = msg {
                            out.preauth.push_front(text);
                        }
                        break;
                    }
                    flushed += 1;
                }
                if flushed > 0 {
                    tracing::debug!(url = %self.config.url, flushed, "Flushed pre-auth queue");
                }
            }
        }
        self.set_state(ConnectionState::Connected);
    }

    fn attach(&self, sink: mpsc::UnboundedSender<WsMessage>) {
        lock(&self.outbound).sink = Some(sink);
    }

    fn mark_disconnected(&self) {
        {
            let mut out = lock(&self.outbound);
            out.sink = None;
            out.authed = false;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn notify_unauthorized(&self) {
        let callback = lock(&self.on_unauthorized).clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// 自动重连的 WebSocket 客户端
///
/// 连接断开（包括认证超时）后按固定间隔无限重连，直到调用 [`SocketTransport::close`] 或被丢弃。
pub struct SocketTransport {
    inner: Arc<Inner>,
}

impl SocketTransport {
    /// 启动连接循环（需在 tokio 运行时内调用）
    pub fn connect(config: TransportConfig, handler: Arc<dyn FrameHandler>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(Inner {
            config,
            state_tx,
            outbound: Mutex::new(Outbound::default()),
            shutdown: CancellationToken::new(),
            on_state: Mutex::new(None),
            on_unauthorized: Mutex::new(None),
        });
        tokio::spawn(run(Arc::clone(&inner), handler));
        Self { inner }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn set_state_callback(&self, callback: impl Fn(ConnectionState) + Send + Sync + 'static) {
        *lock(&self.inner.on_state) = Some(Arc::new(callback));
    }

    /// 认证超时时调用
    pub fn set_unauthorized_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *lock(&self.inner.on_unauthorized) = Some(Arc::new(callback));
    }

    /// 预认证队列中等待发送的消息数
    pub fn pending(&self) -> usize {
        lock(&self.inner.outbound).preauth.len()
    }

    /// 发送一条 JSON 消息
    ///
    /// 未连接时等待连接建立；已连接但未认证时进入预认证队列。传输关闭后返回 Closed。
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let text = serde_json::to_string(message)?;
        let mut state_rx = self.inner.state_tx.subscribe();
        let ready = async {
            state_rx
                .wait_for(|s| matches!(s, ConnectionState::Authenticating | ConnectionState::Connected))
                .await
                .map(|_| ())
        };
        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => return Err(BrokerError::Closed),
            ready = ready => ready.map_err(|_| BrokerError::Closed)?,
        }
        self.inner.enqueue(text);
        Ok(())
    }

    /// 关闭连接并停止重连（不可恢复）
    pub fn close(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!(url = %self.inner.config.url, "Closing transport");
            self.inner.shutdown.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn run(inner: Arc<Inner>, handler: Arc<dyn FrameHandler>) {
    loop {
        inner.set_state(ConnectionState::Connecting);
        let connected = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            result = tokio_tungstenite::connect_async(inner.config.url.as_str()) => result,
        };
        match connected {
            Ok((ws, _)) => {
                tracing::info!(url = %inner.config.url, "WebSocket connected");
                run_session(&inner, handler.as_ref(), ws).await;
                tracing::info!(url = %inner.config.url, "WebSocket disconnected");
            }
            Err(e) => {
                tracing::warn!(url = %inner.config.url, error = %e, "WebSocket connect failed");
            }
        }
        inner.mark_disconnected();

        let delay = inner.config.reconnect_delay;
        tracing::debug!(url = %inner.config.url, ?delay, "Scheduling reconnect");
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    inner.mark_disconnected();
    tracing::debug!(url = %inner.config.url, "Transport loop stopped");
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_session(inner: &Arc<Inner>, handler: &dyn FrameHandler, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, WsMessage::Close(_));
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    inner.attach(tx.clone());

    let anonymous = inner.config.anonymous;
    let opened = Instant::now();
    let mut pending_token = match (&inner.config.token, anonymous) {
        (Some(token), false) => Some(token.clone()),
        _ => None,
    };
    let token_at = opened + inner.config.token_delay;
    let auth_deadline = pending_token.as_ref().map(|_| opened + inner.config.auth_timeout);

    if anonymous {
        tracing::debug!(url = %inner.config.url, "Anonymous connection");
        inner.authenticate();
    } else {
        if pending_token.is_none() {
            tracing::debug!(url = %inner.config.url, "No auth token");
        }
        inner.set_state(ConnectionState::Authenticating);
    }

    loop {
        let awaiting_auth = !inner.is_authed();
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                let _ = tx.send(WsMessage::Close(None));
                break;
            }
            _ = sleep_until_opt(Some(token_at)), if pending_token.is_some() => {
                if let Some(token) = pending_token.take() {
                    match serde_json::to_string(&AuthMessage { token }) {
                        Ok(frame) => {
                            tracing::debug!(url = %inner.config.url, "Sending auth token");
                            let _ = tx.send(WsMessage::Text(frame));
                        }
                        Err(e) => tracing::error!(error = %e, "Failed to encode auth frame"),
                    }
                }
            }
            _ = sleep_until_opt(auth_deadline), if awaiting_auth && auth_deadline.is_some() => {
                let err = BrokerError::AuthTimeout(inner.config.auth_timeout);
                tracing::warn!(url = %inner.config.url, error = %err, "Closing unauthenticated connection");
                inner.notify_unauthorized();
                let _ = tx.send(WsMessage::Close(None));
                break;
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => handle_text(inner, handler, &text).await,
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(url = %inner.config.url, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    }

    drop(tx);
    inner.mark_disconnected();
    let _ = writer.await;
}

async fn handle_text(inner: &Inner, handler: &dyn FrameHandler, text: &str) {
    if !inner.config.anonymous && !inner.is_authed() {
        match serde_json::from_str::<AuthResponse>(text) {
            Ok(resp) if resp.success => {
                tracing::info!(url = %inner.config.url, "Authenticated");
                inner.authenticate();
            }
            Ok(resp) => {
                tracing::error!(
                    url = %inner.config.url,
                    message = resp.message.as_deref().unwrap_or(""),
                    "Authentication rejected"
                );
            }
            Err(e) => {
                tracing::error!(url = %inner.config.url, error = %e, "Unexpected frame before authentication");
            }
        }
        return;
    }

    let frame: serde_json::Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(url = %inner.config.url, error = %e, "Dropping non-JSON frame");
            return;
        }
    };
    if let Err(e) = handler.handle_frame(frame).await {
        tracing::error!(url = %inner.config.url, error = %e, "Frame handler failed");
    }
}
