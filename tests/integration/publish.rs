use cuterabbit::rabbitmq::errors::NOT_FOUND;
use cuterabbit::rabbitmq::{
    Confirmation, MemoryBroker, PublishError, PublishOptions, QueueDeclaration,
};
use cuterabbit::{ClientConfig, OutgoingMessage};
use serde::Serialize;
use std::time::Duration;

use crate::{connect, connect_with, eventually, test_config};

#[derive(Serialize)]
struct OrderMessage {
    order_id: u32,
    customer_id: String,
}

#[tokio::test]
async fn confirmed_publish_reports_the_delivery_tag() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client.declare_queue(QueueDeclaration::new("orders")).await.unwrap();

    let first = client
        .publish("one", "orders", "", &PublishOptions::default())
        .await
        .unwrap();
    let second = client
        .publish("two", "orders", "", &PublishOptions::default())
        .await
        .unwrap();

    assert_eq!(first.confirmation, Confirmation::Acked);
    assert_eq!(first.attempts, 1);
    assert!(first.delivery_tag.is_some());
    // Sequential publishes reuse the pooled channel.
    assert_eq!(first.channel_id, second.channel_id);
    assert!(second.delivery_tag > first.delivery_tag);
    assert_eq!(broker.queue_depth("orders"), 2);
    client.close().await;
}

#[tokio::test]
async fn json_payloads_are_published() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client.declare_queue(QueueDeclaration::new("orders")).await.unwrap();

    let order = OrderMessage {
        order_id: 7,
        customer_id: "c-42".into(),
    };
    client
        .publish_json(&order, "orders", "", &PublishOptions::default())
        .await
        .unwrap();

    assert_eq!(broker.queue_depth("orders"), 1);
    client.close().await;
}

#[tokio::test]
async fn fire_and_forget_skips_confirms() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client.declare_queue(QueueDeclaration::new("orders")).await.unwrap();

    let outcome = client
        .publish("quick", "orders", "", &PublishOptions::fire_and_forget())
        .await
        .unwrap();

    assert_eq!(outcome.confirmation, Confirmation::NotRequested);
    eventually("message to arrive", || broker.queue_depth("orders") == 1).await;
    client.close().await;
}

#[tokio::test]
async fn mandatory_unroutable_message_fails() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;

    let err = client
        .publish("lost", "nobody-home", "amq.direct", &PublishOptions::default().mandatory())
        .await
        .unwrap_err();

    match err {
        PublishError::Unroutable {
            exchange,
            routing_key,
            reply_code,
            ..
        } => {
            assert_eq!(exchange, "amq.direct");
            assert_eq!(routing_key, "nobody-home");
            assert_eq!(reply_code, 312);
        }
        other => panic!("expected unroutable, got {:?}", other),
    }
    client.close().await;
}

#[tokio::test]
async fn unroutable_without_mandatory_is_silently_dropped() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;

    let outcome = client
        .publish("lost", "nobody-home", "amq.direct", &PublishOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.confirmation, Confirmation::Acked);
    client.close().await;
}

#[tokio::test]
async fn broker_nack_is_an_error() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client.declare_queue(QueueDeclaration::new("orders")).await.unwrap();
    broker.nack_publishes(true);

    let err = client
        .publish("refused", "orders", "", &PublishOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::Nacked { .. }));
    assert_eq!(broker.queue_depth("orders"), 0);
    client.close().await;
}

#[tokio::test]
async fn missing_confirm_times_out() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client.declare_queue(QueueDeclaration::new("orders")).await.unwrap();
    broker.withhold_confirms(true);

    let options = PublishOptions::default().with_confirm_timeout(Duration::from_millis(50));
    let err = client
        .publish("slow", "orders", "", &options)
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::ConfirmTimeout { timeout, .. } if timeout == Duration::from_millis(50)));
    client.close().await;
}

#[tokio::test]
async fn publishing_to_a_missing_exchange_is_rejected_and_the_channel_replaced() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client.declare_queue(QueueDeclaration::new("orders")).await.unwrap();

    let err = client
        .publish("x", "orders", "no-such-exchange", &PublishOptions::default())
        .await
        .unwrap_err();
    match err {
        PublishError::Rejected(source) => assert_eq!(source.reply_code(), Some(NOT_FOUND)),
        other => panic!("expected a broker refusal, got {:?}", other),
    }

    client
        .publish("y", "orders", "", &PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("orders"), 1);
    assert_eq!(broker.connection_count(), 1);
    client.close().await;
}

#[tokio::test]
async fn concurrent_publishes_share_the_connection() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client.declare_queue(QueueDeclaration::new("orders")).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..20 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let message = OutgoingMessage::from(format!("order {}", i)).persistent();
            client
                .publish(message, "orders", "", &PublishOptions::default())
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(broker.queue_depth("orders"), 20);
    assert_eq!(broker.connection_count(), 1);
    assert!(client.pool_stats().idle <= test_config().channel.max_idle);
    client.close().await;
}

#[tokio::test]
async fn pending_confirm_fails_when_the_connection_drops() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client.declare_queue(QueueDeclaration::new("orders")).await.unwrap();
    broker.withhold_confirms(true);

    let publisher = client.clone();
    let pending = tokio::spawn(async move {
        publisher
            .publish("in flight", "orders", "", &PublishOptions::default())
            .await
    });
    eventually("publish to reach the broker", || broker.queue_depth("orders") == 1).await;
    broker.kill_connections();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, PublishError::ChannelLost(_)));
    assert!(err.is_retryable());
    client.close().await;
}

#[tokio::test]
async fn opted_in_retry_republishes_after_recovery() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client.declare_queue(QueueDeclaration::new("orders")).await.unwrap();
    broker.withhold_confirms(true);

    let publisher = client.clone();
    let pending = tokio::spawn(async move {
        publisher
            .publish("twice", "orders", "", &PublishOptions::default().with_retry())
            .await
    });
    eventually("publish to reach the broker", || broker.queue_depth("orders") == 1).await;
    broker.withhold_confirms(false);
    broker.kill_connections();

    let outcome = pending.await.unwrap().unwrap();
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.confirmation, Confirmation::Acked);
    // At-least-once: the first copy survived the connection loss.
    assert_eq!(broker.queue_depth("orders"), 2);
    client.close().await;
}

#[tokio::test]
async fn close_fails_pending_publishes() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client.declare_queue(QueueDeclaration::new("orders")).await.unwrap();
    broker.withhold_confirms(true);

    let publisher = client.clone();
    let pending = tokio::spawn(async move {
        publisher
            .publish("never confirmed", "orders", "", &PublishOptions::default())
            .await
    });
    eventually("publish to reach the broker", || broker.queue_depth("orders") == 1).await;
    client.close().await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, PublishError::Closed));
    assert!(!err.is_retryable());
}

fn without_confirm_mode() -> ClientConfig {
    let mut config = test_config();
    config.channel.confirm_mode = false;
    config
}

#[tokio::test]
async fn mandatory_publish_fails_unroutable_without_confirm_mode() {
    let broker = MemoryBroker::new();
    let client = connect_with(&broker, without_confirm_mode()).await;

    let err = client
        .publish("lost", "nowhere", "", &PublishOptions::default().mandatory())
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::Unroutable { reply_code: 312, .. }));
    client.close().await;
}

#[tokio::test]
async fn waiting_publish_is_confirmed_without_confirm_mode() {
    let broker = MemoryBroker::new();
    let client = connect_with(&broker, without_confirm_mode()).await;
    client.declare_queue(QueueDeclaration::new("orders")).await.unwrap();

    let quick = client
        .publish("quick", "orders", "", &PublishOptions::fire_and_forget())
        .await
        .unwrap();
    assert_eq!(quick.confirmation, Confirmation::NotRequested);
    assert_eq!(quick.delivery_tag, None);

    let confirmed = client
        .publish("checked", "orders", "", &PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(confirmed.confirmation, Confirmation::Acked);
    assert_eq!(confirmed.delivery_tag, Some(1));
    assert_eq!(broker.queue_depth("orders"), 2);
    client.close().await;
}
