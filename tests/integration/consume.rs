use anyhow::anyhow;
use cuterabbit::rabbitmq::errors::NOT_FOUND;
use cuterabbit::rabbitmq::{
    Client, Disposition, MemoryBroker, PublishOptions, QueueDeclaration, RegistrationState, SubscribeError,
    SubscribeOptions,
};
use cuterabbit::{Delivery, HandlerError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{connect, eventually};

async fn with_queue(broker: &MemoryBroker, queue: &str) -> Client {
    let client = connect(broker).await;
    client.declare_queue(QueueDeclaration::new(queue)).await.unwrap();
    client
}

async fn send(client: &Client, queue: &str, body: &str) {
    client
        .publish(body, queue, "", &PublishOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn successful_handlers_ack_every_message() {
    let broker = MemoryBroker::new();
    let client = with_queue(&broker, "orders").await;
    let received = Arc::new(Mutex::new(Vec::new()));

    let seen = received.clone();
    let registration = client
        .consume(
            "orders",
            move |delivery: Delivery| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(delivery.body_str().unwrap_or_default().to_string());
                    Ok::<(), HandlerError>(())
                }
            },
            SubscribeOptions::default().with_parallelism(1),
        )
        .await
        .unwrap();
    assert_eq!(registration.state(), RegistrationState::Active);
    assert!(registration.consumer_tag().is_some());

    for body in ["a", "b", "c"] {
        send(&client, "orders", body).await;
    }

    eventually("three acks", || registration.stats().acked == 3).await;
    assert_eq!(*received.lock(), vec!["a", "b", "c"]);
    assert_eq!(broker.queue_depth("orders"), 0);
    assert_eq!(broker.unacked_count("orders"), 0);
    client.close().await;
}

#[tokio::test]
async fn recoverable_failures_are_requeued_until_the_limit() {
    let broker = MemoryBroker::new();
    let client = with_queue(&broker, "orders").await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let registration = client
        .consume(
            "orders",
            move |_delivery: Delivery| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(HandlerError::recoverable(anyhow!("database unavailable")))
                }
            },
            SubscribeOptions::default().with_max_redeliveries(2),
        )
        .await
        .unwrap();

    send(&client, "orders", "flaky").await;

    eventually("the message to be rejected", || registration.stats().rejected == 1).await;
    let stats = registration.stats();
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.requeued, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(broker.queue_depth("orders"), 0);
    client.close().await;
}

#[tokio::test]
async fn non_recoverable_failures_are_rejected_at_once() {
    let broker = MemoryBroker::new();
    let client = with_queue(&broker, "orders").await;

    let registration = client
        .consume(
            "orders",
            |_delivery: Delivery| async {
                Err::<(), _>(HandlerError::non_recoverable(anyhow!("malformed order")))
            },
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    send(&client, "orders", "bad").await;

    eventually("the message to be rejected", || registration.stats().rejected == 1).await;
    assert_eq!(registration.stats().delivered, 1);
    assert_eq!(registration.stats().requeued, 0);
    client.close().await;
}

#[tokio::test]
async fn classifier_decides_unclassified_failures() {
    let broker = MemoryBroker::new();
    let client = with_queue(&broker, "orders").await;

    let options = SubscribeOptions::default().with_classifier(|err: &anyhow::Error| {
        if err.to_string().contains("parse") {
            Disposition::Reject
        } else {
            Disposition::Requeue
        }
    });
    let registration = client
        .consume(
            "orders",
            |_delivery: Delivery| async { Err::<(), HandlerError>(anyhow!("parse error at line 1").into()) },
            options,
        )
        .await
        .unwrap();

    send(&client, "orders", "{").await;

    eventually("the message to be rejected", || registration.stats().rejected == 1).await;
    assert_eq!(registration.stats().requeued, 0);
    client.close().await;
}

#[tokio::test]
async fn a_panicking_handler_rejects_and_keeps_consuming() {
    let broker = MemoryBroker::new();
    let client = with_queue(&broker, "orders").await;

    let registration = client
        .consume(
            "orders",
            |delivery: Delivery| async move {
                if delivery.body_str() == Some("boom") {
                    panic!("handler blew up");
                }
                Ok::<(), HandlerError>(())
            },
            SubscribeOptions::default().with_parallelism(1),
        )
        .await
        .unwrap();

    send(&client, "orders", "boom").await;
    send(&client, "orders", "fine").await;

    eventually("both messages settled", || {
        let stats = registration.stats();
        stats.rejected == 1 && stats.acked == 1
    })
    .await;
    assert_eq!(registration.state(), RegistrationState::Active);
    client.close().await;
}

#[tokio::test]
async fn auto_ack_leaves_nothing_unacked() {
    let broker = MemoryBroker::new();
    let client = with_queue(&broker, "orders").await;
    let handled = Arc::new(AtomicUsize::new(0));

    let counter = handled.clone();
    let registration = client
        .consume(
            "orders",
            move |_delivery: Delivery| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            },
            SubscribeOptions::default().auto_ack(),
        )
        .await
        .unwrap();

    send(&client, "orders", "one").await;
    send(&client, "orders", "two").await;

    eventually("both messages handled", || handled.load(Ordering::SeqCst) == 2).await;
    assert_eq!(broker.unacked_count("orders"), 0);
    assert_eq!(registration.stats().acked, 0);
    client.close().await;
}

#[tokio::test]
async fn auto_ack_failures_are_not_requeued() {
    let broker = MemoryBroker::new();
    let client = with_queue(&broker, "orders").await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let registration = client
        .consume(
            "orders",
            move |_delivery: Delivery| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(HandlerError::recoverable(anyhow!("database unavailable")))
                }
            },
            SubscribeOptions::default().auto_ack().with_max_redeliveries(1),
        )
        .await
        .unwrap();

    for body in ["one", "two", "three"] {
        send(&client, "orders", body).await;
    }

    eventually("every message handled", || registration.stats().delivered == 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = registration.stats();
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!((stats.requeued, stats.rejected, stats.acked), (0, 0, 0));
    assert_eq!(broker.queue_depth("orders"), 0);
    assert_eq!(broker.unacked_count("orders"), 0);
    client.close().await;
}

#[tokio::test]
async fn parallelism_bounds_concurrent_handlers() {
    let broker = MemoryBroker::new();
    let client = with_queue(&broker, "orders").await;
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (now, max) = (running.clone(), peak.clone());
    let registration = client
        .consume(
            "orders",
            move |_delivery: Delivery| {
                let (now, max) = (now.clone(), max.clone());
                async move {
                    let current = now.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    now.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            },
            SubscribeOptions::default().with_prefetch(10).with_parallelism(2),
        )
        .await
        .unwrap();

    for i in 0..6 {
        send(&client, "orders", &format!("job {}", i)).await;
    }

    eventually("all jobs acked", || registration.stats().acked == 6).await;
    assert!(peak.load(Ordering::SeqCst) <= 2);
    client.close().await;
}

#[tokio::test]
async fn unsubscribe_cancels_the_broker_consumer() {
    let broker = MemoryBroker::new();
    let client = with_queue(&broker, "orders").await;

    let registration = client
        .consume(
            "orders",
            |_delivery: Delivery| async { Ok::<(), HandlerError>(()) },
            SubscribeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(broker.consumer_count("orders"), 1);

    client.unsubscribe(&registration).await;

    assert_eq!(registration.state(), RegistrationState::Cancelled);
    assert_eq!(registration.consumer_tag(), None);
    assert_eq!(broker.consumer_count("orders"), 0);
    assert!(client.registrations().is_empty());

    send(&client, "orders", "unclaimed").await;
    assert_eq!(broker.queue_depth("orders"), 1);
    client.close().await;
}

#[tokio::test]
async fn subscribing_to_a_missing_queue_fails() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;

    let err = client
        .consume(
            "ghost",
            |_delivery: Delivery| async { Ok::<(), HandlerError>(()) },
            SubscribeOptions::default(),
        )
        .await
        .unwrap_err();

    match err {
        SubscribeError::Rejected { queue, source } => {
            assert_eq!(queue, "ghost");
            assert_eq!(source.reply_code(), Some(NOT_FOUND));
        }
        other => panic!("expected a broker refusal, got {:?}", other),
    }
    assert!(client.registrations().is_empty());
    client.close().await;
}

#[tokio::test]
async fn zero_parallelism_is_invalid() {
    let broker = MemoryBroker::new();
    let client = with_queue(&broker, "orders").await;

    let err = client
        .consume(
            "orders",
            |_delivery: Delivery| async { Ok::<(), HandlerError>(()) },
            SubscribeOptions::default().with_parallelism(0),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SubscribeError::Invalid(_)));
    client.close().await;
}

#[tokio::test]
async fn a_lost_consumer_channel_is_resubscribed_on_the_same_connection() {
    let broker = MemoryBroker::new();
    let client = with_queue(&broker, "orders").await;
    let handled = Arc::new(AtomicUsize::new(0));

    let counter = handled.clone();
    let registration = client
        .consume(
            "orders",
            move |_delivery: Delivery| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            },
            SubscribeOptions::default().with_resubscribe_delay(Duration::from_millis(10)),
        )
        .await
        .unwrap();
    let first_tag = registration.consumer_tag();

    broker.close_consumer_channels("orders");

    eventually("a second subscription", || registration.stats().subscriptions == 2).await;
    assert_eq!(registration.state(), RegistrationState::Active);
    assert_ne!(registration.consumer_tag(), first_tag);
    assert_eq!(broker.consumer_count("orders"), 1);
    assert_eq!(broker.connection_count(), 1);

    send(&client, "orders", "after").await;
    eventually("the message to be handled", || handled.load(Ordering::SeqCst) == 1).await;
    client.close().await;
}

#[tokio::test]
async fn listener_receives_a_routed_message_exactly_once() {
    use cuterabbit::rabbitmq::{ExchangeDeclaration, ExchangeKind};

    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client
        .declare_exchange(ExchangeDeclaration::new("logs", ExchangeKind::Topic))
        .await
        .unwrap();
    client
        .declare_queue(QueueDeclaration::new("potato").durable(true))
        .await
        .unwrap();
    client.bind("potato", "logs", "info").await.unwrap();
    client.bind("potato", "logs", "warning").await.unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let seen = received.clone();
    let registration = client
        .consume(
            "potato",
            move |delivery: Delivery| {
                let seen = seen.clone();
                async move {
                    seen.lock().push((delivery.routing_key.clone(), delivery.body.clone()));
                    Ok::<(), HandlerError>(())
                }
            },
            client.subscribe_options(),
        )
        .await
        .unwrap();

    client
        .publish("M", "info", "logs", &PublishOptions::default())
        .await
        .unwrap();

    eventually("the ack", || registration.stats().acked == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*received.lock(), vec![("info".to_string(), b"M".to_vec())]);
    assert_eq!(broker.queue_depth("potato"), 0);
    client.close().await;
}
