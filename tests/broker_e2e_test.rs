//! 端到端：MockChannel 经 ObjectBroker 收发消息，outbox 删除事件销毁对象

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use workforce_broker::broker::{ObjectConfig, ObjectKind};
use workforce_broker::channel::{channel_factory, ChannelMessageEvent, MessageRequest, MockChannel};
use workforce_broker::event_bus::OutboxEvent;
use workforce_broker::BrokerContext;

const CHANNEL_ID: &str = "mock-channel-id";
const SESSION_ID: &str = "mock-task-execution-id";
const WORKER_ID: &str = "mock-worker-id";
const SENDER_ID: &str = "mock-sender-id";

async fn recv(rx: &mut mpsc::UnboundedReceiver<ChannelMessageEvent>) -> Option<ChannelMessageEvent> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.ok().flatten()
}

#[tokio::test]
async fn test_mock_channel_replies_once_with_final_message() {
    let ctx = BrokerContext::in_memory();
    let broker = ctx.broker::<MockChannel>(ObjectKind::Channel);
    broker.register(Arc::new(MockChannel::new(CHANNEL_ID))).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = broker
        .subscribe(CHANNEL_ID, SESSION_ID, WORKER_ID, &["message"], move |event| {
            let tx = tx.clone();
            async move {
                tx.send(event)?;
                Ok(())
            }
        })
        .await
        .unwrap();

    let request = MessageRequest::new(CHANNEL_ID, WORKER_ID, SESSION_ID, SENDER_ID, "hello").with_message_type("message");
    broker.execute(CHANNEL_ID, request.clone()).await.unwrap();

    let event = recv(&mut rx).await.expect("channel reply");
    assert_eq!(event.message, "mock-final-message");
    assert_eq!(event.sender_id, CHANNEL_ID);
    assert_eq!(event.users, vec![SENDER_ID.to_string()]);
    assert_eq!(event.task_execution_id.as_deref(), Some(SESSION_ID));

    // 最终消息之后不再回复
    broker.execute(CHANNEL_ID, request).await.unwrap();
    assert!(recv(&mut rx).await.is_none());

    let forwarded = event.to_request(SESSION_ID, WORKER_ID);
    assert_eq!(forwarded.sender_id, CHANNEL_ID);
    assert_eq!(forwarded.worker_id, WORKER_ID);
    assert_eq!(forwarded.message, "mock-final-message");

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_replies_are_not_delivered_to_other_sessions_or_types() {
    let ctx = BrokerContext::in_memory();
    let broker = ctx.broker::<MockChannel>(ObjectKind::Channel);
    broker
        .register(Arc::new(MockChannel::new(CHANNEL_ID).with_emit_delay(Duration::from_millis(10))))
        .await
        .unwrap();

    let (tx, mut other_session) = mpsc::unbounded_channel();
    let _a = broker
        .subscribe(CHANNEL_ID, "other-session", WORKER_ID, &["message"], move |event| {
            let tx = tx.clone();
            async move {
                tx.send(event)?;
                Ok(())
            }
        })
        .await
        .unwrap();
    let (tx, mut chat_only) = mpsc::unbounded_channel();
    let _b = broker
        .subscribe(CHANNEL_ID, SESSION_ID, WORKER_ID, &["chat-message"], move |event| {
            let tx = tx.clone();
            async move {
                tx.send(event)?;
                Ok(())
            }
        })
        .await
        .unwrap();

    let request = MessageRequest::new(CHANNEL_ID, WORKER_ID, SESSION_ID, SENDER_ID, "hello").with_message_type("message");
    broker.execute(CHANNEL_ID, request).await.unwrap();

    assert!(recv(&mut other_session).await.is_none());
    assert!(recv(&mut chat_only).await.is_none());
}

#[tokio::test]
async fn test_factory_built_channel_follows_script_and_outbox_delete() {
    let ctx = BrokerContext::in_memory();
    let broker = Arc::new(ctx.broker::<MockChannel>(ObjectKind::Channel));
    let factory = channel_factory();

    let config = ObjectConfig::new(CHANNEL_ID, ObjectKind::Channel, "mock").with_variables(json!({
        "messages": ["first", "second"],
        "finalMessage": "done"
    }));
    assert!(broker.sync_object(config.clone(), &factory).await.unwrap());
    assert!(!broker.sync_object(config, &factory).await.unwrap());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = broker
        .subscribe(CHANNEL_ID, SESSION_ID, WORKER_ID, &["chat-message"], move |event| {
            let tx = tx.clone();
            async move {
                tx.send(event)?;
                Ok(())
            }
        })
        .await
        .unwrap();

    let mut replies = Vec::new();
    for i in 0..3 {
        let request = MessageRequest::new(CHANNEL_ID, WORKER_ID, SESSION_ID, SENDER_ID, format!("msg-{}", i));
        broker.execute(CHANNEL_ID, request).await.unwrap();
        replies.push(recv(&mut rx).await.expect("scripted reply").message);
    }
    assert_eq!(replies, vec!["first", "second", "done"]);

    let bus = ctx.event_bus().await.unwrap();
    let _watch = broker.watch_outbox(&bus);
    bus.next(OutboxEvent::delete("channel", CHANNEL_ID)).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while broker.get_object(CHANNEL_ID).await.is_some() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(broker.get_object(CHANNEL_ID).await.is_none());
    assert!(broker
        .execute(CHANNEL_ID, MessageRequest::new(CHANNEL_ID, WORKER_ID, SESSION_ID, SENDER_ID, "late"))
        .await
        .unwrap_err()
        .is_not_found());
}
