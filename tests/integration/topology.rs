use cuterabbit::rabbitmq::errors::ACCESS_REFUSED;
use cuterabbit::rabbitmq::{
    Binding, DeclarationError, Declaration, ExchangeDeclaration, ExchangeKind, MemoryBroker, PublishOptions,
    QueueDeclaration,
};

use crate::connect;

#[tokio::test]
async fn listener_topology_is_declared_and_routes() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;

    client
        .declare_exchange(ExchangeDeclaration::new("logs", ExchangeKind::Topic))
        .await
        .unwrap();
    let info = client
        .declare_queue(QueueDeclaration::new("potato").durable(true))
        .await
        .unwrap();
    assert_eq!(info.name, "potato");
    assert_eq!(info.message_count, 0);
    client.bind("potato", "logs", "info").await.unwrap();
    client.bind("potato", "logs", "warning").await.unwrap();

    assert!(broker.has_exchange("logs"));
    assert!(broker.has_queue("potato"));
    assert_eq!(broker.bindings().len(), 2);

    for key in ["info", "warning", "debug"] {
        client
            .publish(key, key, "logs", &PublishOptions::default())
            .await
            .unwrap();
    }
    assert_eq!(broker.queue_depth("potato"), 2);
    client.close().await;
}

#[tokio::test]
async fn redeclaring_the_same_entity_is_a_no_op() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;

    let exchange = ExchangeDeclaration::new("logs", ExchangeKind::Topic);
    client.declare_exchange(exchange.clone()).await.unwrap();
    client.declare_exchange(exchange).await.unwrap();
    client.declare_queue(QueueDeclaration::new("potato")).await.unwrap();
    client.declare_queue(QueueDeclaration::new("potato")).await.unwrap();
    client.bind("potato", "logs", "info").await.unwrap();
    client.bind("potato", "logs", "info").await.unwrap();

    assert_eq!(client.topology().len(), 3);
    assert_eq!(broker.bindings().len(), 1);
    client.close().await;
}

#[tokio::test]
async fn conflicting_declarations_are_refused_locally() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;

    client
        .declare_exchange(ExchangeDeclaration::new("logs", ExchangeKind::Topic))
        .await
        .unwrap();
    let err = client
        .declare_exchange(ExchangeDeclaration::new("logs", ExchangeKind::Fanout))
        .await
        .unwrap_err();
    assert!(matches!(err, DeclarationError::Conflict { kind: "exchange", .. }));

    client
        .declare_queue(QueueDeclaration::new("potato").durable(true))
        .await
        .unwrap();
    let err = client
        .declare_queue(QueueDeclaration::new("potato"))
        .await
        .unwrap_err();
    assert!(matches!(err, DeclarationError::Conflict { kind: "queue", .. }));

    // The recorded declarations are untouched.
    assert_eq!(
        client.topology(),
        vec![
            Declaration::Exchange(ExchangeDeclaration::new("logs", ExchangeKind::Topic)),
            Declaration::Queue(QueueDeclaration::new("potato").durable(true)),
        ]
    );
    client.close().await;
}

#[tokio::test]
async fn unrecoverable_names_are_rejected() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;

    let err = client
        .declare_exchange(ExchangeDeclaration::new("", ExchangeKind::Direct))
        .await
        .unwrap_err();
    assert!(matches!(err, DeclarationError::Invalid(_)));

    let err = client
        .declare_queue(QueueDeclaration::new(""))
        .await
        .unwrap_err();
    assert!(matches!(err, DeclarationError::Invalid(_)));

    assert!(client.topology().is_empty());
    client.close().await;
}

#[tokio::test]
async fn broker_refusal_is_reported_and_the_client_keeps_working() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;

    let err = client
        .declare_exchange(ExchangeDeclaration::new("amq.mine", ExchangeKind::Direct))
        .await
        .unwrap_err();
    match err {
        DeclarationError::Rejected { kind, name, source } => {
            assert_eq!(kind, "exchange");
            assert_eq!(name, "amq.mine");
            assert_eq!(source.reply_code(), Some(ACCESS_REFUSED));
        }
        other => panic!("expected a broker refusal, got {:?}", other),
    }
    assert!(client.topology().is_empty());

    client
        .declare_queue(QueueDeclaration::new("potato"))
        .await
        .unwrap();
    client
        .bind_with(Binding::new("potato", "amq.topic", "orders.#"))
        .await
        .unwrap();
    assert_eq!(broker.connection_count(), 1);
    client.close().await;
}

#[tokio::test]
async fn binding_to_a_missing_exchange_is_not_recorded() {
    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client.declare_queue(QueueDeclaration::new("potato")).await.unwrap();

    let err = client.bind("potato", "nope", "info").await.unwrap_err();

    assert!(matches!(err, DeclarationError::Rejected { kind: "binding", .. }));
    assert_eq!(client.topology().len(), 1);
    client.close().await;
}
