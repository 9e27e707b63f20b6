//! SocketTransport 对本地 tokio-tungstenite 服务端的握手、预认证队列与重连

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use workforce_broker::transport::{ConnectionState, FrameHandler, SocketTransport, TransportConfig, TypedHandler};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Chat {
    text: String,
}

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("client connection")
        .unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

/// 下一条文本帧；连接关闭返回 None
async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> Option<String> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await.ok()?? {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

fn config(url: &str) -> TransportConfig {
    let mut config = TransportConfig::new(url);
    config.token_delay = Duration::from_millis(200);
    config.auth_timeout = Duration::from_secs(3);
    config.reconnect_delay = Duration::from_millis(50);
    config
}

fn chat_handler() -> (Arc<dyn FrameHandler>, mpsc::UnboundedReceiver<Chat>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn FrameHandler> = Arc::new(TypedHandler::new(move |chat: Chat| {
        futures_util::future::ready(tx.send(chat).map_err(anyhow::Error::from))
    }));
    (handler, rx)
}

async fn wait_for_state(transport: &SocketTransport, state: ConnectionState) {
    let mut rx = transport.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .expect("state change")
        .unwrap();
}

#[tokio::test]
async fn test_token_sent_first_then_queue_flushed_in_order() {
    let (listener, url) = listen().await;
    let (handler, mut inbound) = chat_handler();
    let transport = SocketTransport::connect(config(&url).with_token("secret-token"), handler);

    let mut server = accept(&listener).await;
    wait_for_state(&transport, ConnectionState::Authenticating).await;

    for text in ["one", "two", "three"] {
        transport.send(&Chat { text: text.to_string() }).await.unwrap();
    }
    assert_eq!(transport.pending(), 3);

    let first: serde_json::Value = serde_json::from_str(&next_text(&mut server).await.unwrap()).unwrap();
    assert_eq!(first, json!({"token": "secret-token"}));
    server.send(Message::Text(json!({"success": true}).to_string())).await.unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        let chat: Chat = serde_json::from_str(&next_text(&mut server).await.unwrap()).unwrap();
        received.push(chat.text);
    }
    assert_eq!(received, vec!["one", "two", "three"]);
    wait_for_state(&transport, ConnectionState::Connected).await;
    assert_eq!(transport.pending(), 0);

    // 认证后的发送直接上线
    transport.send(&Chat { text: "four".to_string() }).await.unwrap();
    let chat: Chat = serde_json::from_str(&next_text(&mut server).await.unwrap()).unwrap();
    assert_eq!(chat.text, "four");

    server.send(Message::Text(json!({"text": "from-server"}).to_string())).await.unwrap();
    let chat = tokio::time::timeout(Duration::from_secs(5), inbound.recv()).await.unwrap().unwrap();
    assert_eq!(chat.text, "from-server");

    transport.close();
    assert!(transport.send(&Chat { text: "late".to_string() }).await.is_err());
}

#[tokio::test]
async fn test_auth_timeout_closes_and_reconnects() {
    let (listener, url) = listen().await;
    let (handler, _inbound) = chat_handler();
    let mut cfg = config(&url).with_token("never-acknowledged");
    cfg.token_delay = Duration::from_millis(10);
    cfg.auth_timeout = Duration::from_millis(300);
    let transport = SocketTransport::connect(cfg, handler);

    let unauthorized = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&unauthorized);
    transport.set_unauthorized_callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut first = accept(&listener).await;
    let token: serde_json::Value = serde_json::from_str(&next_text(&mut first).await.unwrap()).unwrap();
    assert_eq!(token["token"], "never-acknowledged");

    // 不回复：客户端超时后关闭连接
    assert!(next_text(&mut first).await.is_none());
    assert!(unauthorized.load(Ordering::SeqCst) >= 1);

    // 固定间隔后重新连接，并重新发送 token
    let mut second = accept(&listener).await;
    let token: serde_json::Value = serde_json::from_str(&next_text(&mut second).await.unwrap()).unwrap();
    assert_eq!(token["token"], "never-acknowledged");

    transport.close();
}

#[tokio::test]
async fn test_anonymous_connection_skips_handshake() {
    let (listener, url) = listen().await;
    let (handler, mut inbound) = chat_handler();
    let transport = SocketTransport::connect(config(&url).anonymous(), handler);

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        while let Some(text) = next_text(&mut ws).await {
            if ws.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    transport.send(&Chat { text: "ping".to_string() }).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), inbound.recv()).await.unwrap().unwrap();
    assert_eq!(echoed, Chat { text: "ping".to_string() });
    assert_eq!(transport.state(), ConnectionState::Connected);

    transport.close();
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
}

#[tokio::test]
async fn test_preauth_queue_survives_reconnect() {
    let (listener, url) = listen().await;
    let (handler, _inbound) = chat_handler();
    let mut cfg = config(&url).with_token("retry-token");
    cfg.token_delay = Duration::from_millis(10);
    let transport = SocketTransport::connect(cfg, handler);

    let mut first = accept(&listener).await;
    wait_for_state(&transport, ConnectionState::Authenticating).await;
    for text in ["a", "b"] {
        transport.send(&Chat { text: text.to_string() }).await.unwrap();
    }
    let token: serde_json::Value = serde_json::from_str(&next_text(&mut first).await.unwrap()).unwrap();
    assert_eq!(token["token"], "retry-token");

    // 不回复认证，直接断开
    first.close(None).await.unwrap();
    drop(first);

    let mut second = accept(&listener).await;
    wait_for_state(&transport, ConnectionState::Authenticating).await;
    transport.send(&Chat { text: "c".to_string() }).await.unwrap();
    assert_eq!(transport.pending(), 3);

    let token: serde_json::Value = serde_json::from_str(&next_text(&mut second).await.unwrap()).unwrap();
    assert_eq!(token["token"], "retry-token");
    second.send(Message::Text(json!({"success": true}).to_string())).await.unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        let chat: Chat = serde_json::from_str(&next_text(&mut second).await.unwrap()).unwrap();
        received.push(chat.text);
    }
    assert_eq!(received, vec!["a", "b", "c"]);
    wait_for_state(&transport, ConnectionState::Connected).await;
    assert_eq!(transport.pending(), 0);

    transport.close();
}

#[tokio::test]
async fn test_rejected_auth_stays_pending_until_timeout() {
    let (listener, url) = listen().await;
    let (handler, _inbound) = chat_handler();
    let mut cfg = config(&url).with_token("bad-token");
    cfg.token_delay = Duration::from_millis(10);
    cfg.auth_timeout = Duration::from_millis(500);
    let transport = SocketTransport::connect(cfg, handler);

    let unauthorized = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&unauthorized);
    transport.set_unauthorized_callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut server = accept(&listener).await;
    wait_for_state(&transport, ConnectionState::Authenticating).await;
    transport.send(&Chat { text: "held".to_string() }).await.unwrap();
    let _token = next_text(&mut server).await.unwrap();
    server
        .send(Message::Text(json!({"success": false, "message": "bad"}).to_string()))
        .await
        .unwrap();

    // 拒绝不会放行队列，也不会立即断开
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.state(), ConnectionState::Authenticating);
    assert_eq!(transport.pending(), 1);
    assert_eq!(unauthorized.load(Ordering::SeqCst), 0);

    // 超时后客户端关闭连接，排队的消息从未发出
    assert!(next_text(&mut server).await.is_none());
    assert_eq!(unauthorized.load(Ordering::SeqCst), 1);
    assert_eq!(transport.pending(), 1);

    transport.close();
}
