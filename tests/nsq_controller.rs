//! NsqController integration tests against the in-memory NSQ backend and a
//! local HTTP stand-in for nsqlookupd.
//!
//! Run with: cargo test --test nsq_controller

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use nsq_broker::broker::{BrokerChannelSubscription, BrokerController, BrokerError, BrokerMessage};
use nsq_broker::nsq::{
    MockNsq, NsqController, NsqControllerConfig, NsqMessage, ATTEMPTS_HEADER,
    MESSAGE_ID_HEADER, TIMESTAMP_HEADER,
};
use tokio::net::TcpListener;

/// Serve `app` on an ephemeral port, returning `host:port`.
async fn start_lookupd(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}

fn lookupd_with_body(status: StatusCode, body: &'static str) -> Router {
    Router::new().route("/topics", get(move || async move { (status, body) }))
}

fn controller(nsq: &MockNsq, addr: &str, config: NsqControllerConfig) -> NsqController {
    NsqController::with_factory(addr, Arc::new(nsq.clone()), config).unwrap()
}

async fn recv(sub: &mut BrokerChannelSubscription) -> BrokerMessage {
    tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("timed out waiting for message")
        .expect("subscription closed")
}

// ============================================================================
// Topic lookup
// ============================================================================

#[tokio::test]
async fn test_lookup_topics() {
    let addr = start_lookupd(lookupd_with_body(
        StatusCode::OK,
        r#"{"topics":["a","b"]}"#,
    ))
    .await;
    let controller = controller(&MockNsq::new(), &addr, NsqControllerConfig::default());

    let topics = controller.lookup_topics().await.unwrap();
    assert_eq!(topics, vec!["a", "b"]);
}

#[tokio::test]
async fn test_lookup_topics_empty_list() {
    let addr = start_lookupd(lookupd_with_body(StatusCode::OK, r#"{"topics":[]}"#)).await;
    let controller = controller(&MockNsq::new(), &addr, NsqControllerConfig::default());

    assert!(controller.lookup_topics().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_lookup_topics_null_list() {
    let addr = start_lookupd(lookupd_with_body(StatusCode::OK, r#"{"topics":null}"#)).await;
    let controller = controller(&MockNsq::new(), &addr, NsqControllerConfig::default());

    assert!(controller.lookup_topics().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_lookup_topics_server_error() {
    let addr = start_lookupd(lookupd_with_body(
        StatusCode::INTERNAL_SERVER_ERROR,
        "boom",
    ))
    .await;
    let controller = controller(&MockNsq::new(), &addr, NsqControllerConfig::default());

    let result = controller.lookup_topics().await;
    assert!(matches!(result, Err(BrokerError::Transport(_))));
}

#[tokio::test]
async fn test_lookup_topics_malformed_body() {
    let addr = start_lookupd(lookupd_with_body(StatusCode::OK, r#"{"topics":"oops"}"#)).await;
    let controller = controller(&MockNsq::new(), &addr, NsqControllerConfig::default());

    let result = controller.lookup_topics().await;
    assert!(matches!(result, Err(BrokerError::Decode(_))));
}

#[tokio::test]
async fn test_lookup_topics_timeout() {
    let app = Router::new().route(
        "/topics",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            r#"{"topics":[]}"#
        }),
    );
    let addr = start_lookupd(app).await;
    let controller = controller(
        &MockNsq::new(),
        &addr,
        NsqControllerConfig::default().with_lookup_timeout(Duration::from_millis(100)),
    );

    let result = controller.lookup_topics().await;
    assert!(matches!(result, Err(BrokerError::Transport(_))));
}

// ============================================================================
// Publish / subscribe
// ============================================================================

#[tokio::test]
async fn test_publish_reaches_every_channel() {
    let nsq = MockNsq::new();
    let controller = controller(&nsq, "127.0.0.1:4150", NsqControllerConfig::default());

    let mut billing = controller.subscribe("orders#billing").await.unwrap();
    let mut audit = controller.subscribe("orders#audit").await.unwrap();
    let mut other = controller.subscribe("inventory").await.unwrap();

    controller
        .publish("orders#ignored", BrokerMessage::new("order-1"))
        .await
        .unwrap();

    for sub in [&mut billing, &mut audit] {
        let message = recv(sub).await;
        assert_eq!(message.payload, b"order-1");
        assert!(message.header(MESSAGE_ID_HEADER).is_some());
        assert_eq!(message.header(ATTEMPTS_HEADER), Some(&b"1"[..]));
        assert!(message.header(TIMESTAMP_HEADER).is_some());
    }

    let nothing = tokio::time::timeout(Duration::from_millis(100), other.recv()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn test_messages_arrive_in_publish_order() {
    let nsq = MockNsq::new();
    let controller = controller(&nsq, "127.0.0.1:4150", NsqControllerConfig::default());
    let mut sub = controller.subscribe("orders").await.unwrap();

    for i in 0..25 {
        controller
            .publish("orders", BrokerMessage::new(format!("m{}", i)))
            .await
            .unwrap();
    }

    for i in 0..25 {
        assert_eq!(recv(&mut sub).await.payload, format!("m{}", i).into_bytes());
    }
}

#[tokio::test]
async fn test_subscription_as_stream() {
    let nsq = MockNsq::new();
    let controller = controller(&nsq, "127.0.0.1:4150", NsqControllerConfig::default());
    let sub = controller.subscribe("orders").await.unwrap();

    for body in ["a", "b", "c"] {
        controller
            .publish("orders", BrokerMessage::new(body))
            .await
            .unwrap();
    }

    let payloads: Vec<Vec<u8>> = tokio::time::timeout(
        Duration::from_secs(2),
        sub.map(|m| m.payload).take(3).collect(),
    )
    .await
    .unwrap();
    assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

#[tokio::test]
async fn test_full_queue_stalls_consumer_until_drained() {
    let nsq = MockNsq::new();
    let controller = controller(
        &nsq,
        "127.0.0.1:4150",
        NsqControllerConfig::default().with_queue_size(1),
    );
    let mut sub = controller.subscribe("orders").await.unwrap();

    for i in 0..4 {
        controller
            .publish("orders", BrokerMessage::new(format!("m{}", i)))
            .await
            .unwrap();
    }
    assert!(nsq.deliver(
        "orders",
        "default",
        NsqMessage {
            id: b"prepared".to_vec(),
            attempts: 1,
            timestamp: 0,
            body: b"m4".to_vec(),
        },
    ));

    // m0 fills the queue and the handler for m1 blocks the consumer.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(nsq.handled_messages(), 1);

    assert_eq!(recv(&mut sub).await.payload, b"m0");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(nsq.handled_messages(), 2);

    for i in 1..5 {
        assert_eq!(recv(&mut sub).await.payload, format!("m{}", i).into_bytes());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(nsq.handled_messages(), 5);
}

#[tokio::test]
async fn test_cancel_with_full_queue_does_not_block() {
    let nsq = MockNsq::new();
    let controller = controller(
        &nsq,
        "127.0.0.1:4150",
        NsqControllerConfig::default().with_queue_size(1),
    );
    let mut sub = controller.subscribe("orders").await.unwrap();

    for i in 0..3 {
        controller
            .publish("orders", BrokerMessage::new(format!("m{}", i)))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(1), async { sub.cancel() })
        .await
        .unwrap();
    assert!(sub.is_cancelled());

    for _ in 0..100 {
        if nsq.consumer_stops() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(nsq.consumer_stops(), 1);

    controller
        .publish("orders", BrokerMessage::new("late"))
        .await
        .unwrap();

    let mut drained = Vec::new();
    while let Ok(Some(message)) =
        tokio::time::timeout(Duration::from_millis(100), sub.recv()).await
    {
        drained.push(message.payload);
    }
    assert!(drained.len() <= 1);
    assert!(!drained.contains(&b"late".to_vec()));
}

#[tokio::test]
async fn test_dropping_subscription_stops_consumer() {
    let nsq = MockNsq::new();
    let controller = controller(&nsq, "127.0.0.1:4150", NsqControllerConfig::default());

    let sub = controller.subscribe("orders").await.unwrap();
    assert_eq!(nsq.connected_consumers(), 1);
    drop(sub);

    for _ in 0..100 {
        if nsq.connected_consumers() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(nsq.connected_consumers(), 0);
    assert_eq!(nsq.consumer_stops(), 1);
}

#[tokio::test]
async fn test_close_leaves_subscriptions_running() {
    let nsq = MockNsq::new();
    let controller = controller(&nsq, "127.0.0.1:4150", NsqControllerConfig::default());
    let mut sub = controller.subscribe("orders").await.unwrap();

    controller.close().await;

    let delivered = nsq.deliver(
        "orders",
        "default",
        NsqMessage {
            id: b"after-close".to_vec(),
            attempts: 1,
            timestamp: 0,
            body: b"still here".to_vec(),
        },
    );
    assert!(delivered);
    assert_eq!(recv(&mut sub).await.payload, b"still here");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publish_and_subscribe() {
    let nsq = MockNsq::new();
    let controller = Arc::new(controller(
        &nsq,
        "127.0.0.1:4150",
        NsqControllerConfig::default(),
    ));

    let mut subs = Vec::new();
    let mut tasks = Vec::new();
    for i in 0..8 {
        let controller = controller.clone();
        tasks.push(tokio::spawn(async move {
            controller
                .subscribe(&format!("topic-{}#ch", i))
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        subs.push(task.await.unwrap());
    }

    let mut publishers = Vec::new();
    for i in 0..8 {
        let controller = controller.clone();
        publishers.push(tokio::spawn(async move {
            controller
                .publish(&format!("topic-{}", i), BrokerMessage::new(format!("p{}", i)))
                .await
                .unwrap();
        }));
    }
    for publisher in publishers {
        publisher.await.unwrap();
    }

    assert_eq!(nsq.published().len(), 8);
    assert_eq!(nsq.created_consumers(), 8);
    for sub in &mut subs {
        let message = recv(sub).await;
        assert!(message.payload.starts_with(b"p"));
    }
}
