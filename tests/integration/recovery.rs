use async_trait::async_trait;
use cuterabbit::rabbitmq::{
    ExchangeDeclaration, ExchangeKind, MemoryBroker, MessageHandler, PublishOptions, QueueDeclaration,
    RegistrationState, SessionEvent, SessionState,
};
use cuterabbit::{Delivery, HandlerError, OutgoingMessage, SubscribeOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::{connect, eventually};

async fn next_matching<F>(events: &mut broadcast::Receiver<SessionEvent>, matches: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => {}
                Err(err) => panic!("event stream failed: {}", err),
            }
        }
    })
    .await
    .expect("expected session event did not arrive")
}

struct CountingHandler(Arc<AtomicUsize>);

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(&self, _delivery: Delivery) -> Result<(), HandlerError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn lifecycle_events_follow_a_connection_loss() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    let mut events = client.events();

    broker.kill_connections();

    let disconnected = next_matching(&mut events, |_| true).await;
    assert!(matches!(disconnected, SessionEvent::Disconnected { .. }));
    let recovering = next_matching(&mut events, |_| true).await;
    assert_eq!(
        recovering,
        SessionEvent::Recovering {
            attempt: 1,
            delay: Duration::from_millis(10)
        }
    );
    let recovered = next_matching(&mut events, |_| true).await;
    assert_eq!(recovered, SessionEvent::Recovered { replay_topology: true });

    assert_eq!(client.state(), SessionState::Connected);
    assert_eq!(broker.connection_count(), 1);
    client.close().await;
}

#[tokio::test]
async fn topology_is_replayed_after_a_broker_restart() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client
        .declare_exchange(ExchangeDeclaration::new("logs", ExchangeKind::Topic))
        .await
        .unwrap();
    client
        .declare_queue(QueueDeclaration::new("scratch"))
        .await
        .unwrap();
    client.bind("scratch", "logs", "info").await.unwrap();

    broker.restart();
    assert!(!broker.has_exchange("logs"));
    assert!(!broker.has_queue("scratch"));

    eventually("topology replay", || {
        broker.has_exchange("logs") && broker.has_queue("scratch") && broker.bindings().len() == 1
    })
    .await;

    client
        .publish("back", "info", "logs", &PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("scratch"), 1);
    client.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publishes_across_restarts_wait_for_the_topology() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client
        .declare_exchange(ExchangeDeclaration::new("logs", ExchangeKind::Topic))
        .await
        .unwrap();
    client
        .declare_queue(QueueDeclaration::new("scratch"))
        .await
        .unwrap();
    client.bind("scratch", "logs", "info").await.unwrap();

    let mut publishers = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        publishers.push(tokio::spawn(async move {
            let mut refused = Vec::new();
            for _ in 0..50 {
                match client.publish("tick", "info", "logs", &PublishOptions::default()).await {
                    Err(err) if !err.is_retryable() => refused.push(err.to_string()),
                    _ => {}
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            refused
        }));
    }

    tokio::time::sleep(Duration::from_millis(30)).await;
    broker.restart();
    tokio::time::sleep(Duration::from_millis(40)).await;
    broker.restart();

    let mut refused = Vec::new();
    for publisher in publishers {
        refused.extend(publisher.await.unwrap());
    }
    assert!(refused.is_empty(), "publishes refused across restarts: {:?}", refused);
    eventually("topology replay", || broker.has_exchange("logs") && broker.bindings().len() == 1).await;
    client.close().await;
}

#[tokio::test]
async fn consumers_resume_after_a_restart_without_duplicates() {
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

    let handled = Arc::new(AtomicUsize::new(0));
    let registration = client
        .consume(
            "potato",
            CountingHandler(handled.clone()),
            SubscribeOptions::default().with_resubscribe_delay(Duration::from_millis(10)),
        )
        .await
        .unwrap();
    let first_tag = registration.consumer_tag();

    broker.restart();

    eventually("the consumer to come back", || {
        registration.stats().subscriptions == 2 && registration.state() == RegistrationState::Active
    })
    .await;
    assert_ne!(registration.consumer_tag(), first_tag);
    assert_eq!(broker.consumer_count("potato"), 1);
    eventually("topology replay", || broker.has_exchange("logs") && broker.bindings().len() == 2).await;

    for key in ["info", "warning", "debug"] {
        client
            .publish(key, key, "logs", &PublishOptions::default())
            .await
            .unwrap();
    }
    eventually("routed messages handled", || handled.load(Ordering::SeqCst) == 2).await;

    // Another outage still leaves exactly one consumer.
    broker.kill_connections();
    eventually("the consumer to come back again", || registration.stats().subscriptions == 3).await;
    assert_eq!(broker.consumer_count("potato"), 1);
    assert_eq!(client.registrations().len(), 1);

    client
        .publish("after the drop", "warning", "logs", &PublishOptions::default())
        .await
        .unwrap();
    eventually("the warning handled by the same registration", || {
        handled.load(Ordering::SeqCst) == 3
    })
    .await;
    client.close().await;
}

#[tokio::test]
async fn persistent_messages_survive_and_are_delivered_after_restart() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client
        .declare_queue(QueueDeclaration::new("potato").durable(true))
        .await
        .unwrap();
    client
        .publish(OutgoingMessage::from("keep me").persistent(), "potato", "", &PublishOptions::default())
        .await
        .unwrap();
    client
        .publish("drop me", "potato", "", &PublishOptions::default())
        .await
        .unwrap();

    broker.restart();
    assert_eq!(broker.queue_depth("potato"), 1);

    let handled = Arc::new(AtomicUsize::new(0));
    let registration = client
        .consume("potato", CountingHandler(handled.clone()), SubscribeOptions::default())
        .await
        .unwrap();

    eventually("the persistent message", || handled.load(Ordering::SeqCst) == 1).await;
    eventually("the ack", || registration.stats().acked == 1).await;
    client.close().await;
}

#[tokio::test]
async fn unacked_messages_are_redelivered_after_a_connection_loss() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client
        .declare_queue(QueueDeclaration::new("slow"))
        .await
        .unwrap();

    let started = Arc::new(AtomicUsize::new(0));
    let redelivered = Arc::new(AtomicUsize::new(0));
    let (start_count, redelivery_count) = (started.clone(), redelivered.clone());
    let registration = client
        .consume(
            "slow",
            move |delivery: Delivery| {
                let (start_count, redelivery_count) = (start_count.clone(), redelivery_count.clone());
                async move {
                    if delivery.redelivered {
                        redelivery_count.fetch_add(1, Ordering::SeqCst);
                        return Ok(());
                    }
                    start_count.fetch_add(1, Ordering::SeqCst);
                    // Still working when the connection drops.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<(), HandlerError>(())
                }
            },
            SubscribeOptions::default().with_resubscribe_delay(Duration::from_millis(10)),
        )
        .await
        .unwrap();

    client
        .publish("work", "slow", "", &PublishOptions::default())
        .await
        .unwrap();
    eventually("the handler to start", || started.load(Ordering::SeqCst) == 1).await;

    broker.kill_connections();

    eventually("the redelivery", || redelivered.load(Ordering::SeqCst) == 1).await;
    eventually("the redelivered ack", || registration.stats().acked == 1).await;
    assert_eq!(broker.queue_depth("slow"), 0);
    client.close().await;
}

#[tokio::test]
async fn publishes_wait_out_an_outage() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client
        .declare_queue(QueueDeclaration::new("orders").durable(true))
        .await
        .unwrap();

    broker.set_available(false);
    broker.kill_connections();
    eventually("recovery to start", || client.state() == SessionState::Recovering).await;

    let publisher = client.clone();
    let pending = tokio::spawn(async move {
        publisher
            .publish("during outage", "orders", "", &PublishOptions::default())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    broker.set_available(true);
    let outcome = pending.await.unwrap().unwrap();
    assert_eq!(outcome.attempts, 1);
    assert_eq!(broker.queue_depth("orders"), 1);
    client.close().await;
}
