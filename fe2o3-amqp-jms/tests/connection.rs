use std::sync::Arc;

use fe2o3_amqp_jms::{
    AckMode, ConnectionFactory, ConnectionState, DeliveryMode, Destination, Error,
    LoopbackBroker, Message, TemporaryQueue,
};
use tokio::sync::mpsc;

mod common;

use common::{loopback, SHORT, URL, WAIT};

#[tokio::test]
async fn lifecycle_states() {
    let (_broker, factory) = loopback(&[]);
    let connection = factory.create_connection().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Created);
    connection.start().unwrap();
    assert_eq!(connection.state(), ConnectionState::Started);
    connection.stop().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Stopped);
    connection.close().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(matches!(connection.stop().await, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn client_id_is_used_as_container_id() {
    let broker = LoopbackBroker::new();
    let factory = ConnectionFactory::new(format!("{}?jms.clientID=sample-client", URL))
        .unwrap()
        .with_binding(broker);
    let connection = factory.create_connection().await.unwrap();
    assert_eq!(connection.client_id(), "sample-client");
    connection.close().await.unwrap();
}

#[tokio::test]
async fn wrong_credentials_fail_authentication() {
    let broker = LoopbackBroker::new().with_credentials("admin", "secret");
    let factory = ConnectionFactory::new(URL).unwrap().with_binding(broker.clone());

    let result = factory.create_connection().await;
    assert!(matches!(result, Err(Error::AuthenticationFailed(_))));
    let result = factory.create_connection_with("admin", "wrong").await;
    assert!(matches!(result, Err(Error::AuthenticationFailed(_))));

    let connection = factory.create_connection_with("admin", "secret").await.unwrap();
    assert_eq!(broker.connection_count(), 1);
    connection.close().await.unwrap();
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn credentials_from_url_are_used() {
    let broker = LoopbackBroker::new().with_credentials("admin", "secret");
    let factory = ConnectionFactory::new(format!(
        "{}?jms.username=admin&jms.password=secret",
        URL
    ))
    .unwrap()
    .with_binding(broker);
    let connection = factory.create_connection().await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test]
async fn unreachable_broker_is_a_transport_failure() {
    let (broker, factory) = loopback(&[]);
    broker.set_refuse_connections(true);
    let result = factory.create_connection().await;
    assert!(matches!(result, Err(Error::TransportFailed(_))));

    broker.set_refuse_connections(false);
    let connection = factory.create_connection().await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test]
async fn lost_connection_reaches_exception_listener() {
    let (broker, factory) = loopback(&["Q/lost"]);
    let connection = factory.create_connection().await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    connection
        .set_exception_listener(move |error: Error| {
            let _ = tx.send(error);
        })
        .unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let consumer = Arc::new(
        session
            .create_consumer(Destination::queue("Q/lost"))
            .await
            .unwrap(),
    );
    connection.start().unwrap();
    let pending = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.receive().await }
    });
    tokio::time::sleep(SHORT).await;

    broker.disconnect_all();

    let error = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(error, Error::TransportFailed(_)));
    let result = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::ConsumerClosed)));
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(matches!(
        connection.create_session(AckMode::AutoAck).await,
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(
        session.create_producer(None).await,
        Err(Error::ConnectionClosed)
    ));

    // The listener is called once
    assert!(tokio::time::timeout(SHORT, rx.recv()).await.ok().flatten().is_none());
    connection.close().await.unwrap();
}

#[tokio::test]
async fn temporary_queue_lives_as_long_as_its_connection() {
    let (broker, factory) = loopback(&[]);
    let owner = factory.create_connection().await.unwrap();
    let session = owner.create_session(AckMode::AutoAck).await.unwrap();
    let queue = session.create_temporary_queue().await.unwrap();
    assert!(broker.has_queue(queue.name()));
    assert_eq!(queue.owner(), Some(owner.id()));

    // Another connection may send to it, but not consume from it
    let other = factory.create_connection().await.unwrap();
    let other_session = other.create_session(AckMode::AutoAck).await.unwrap();
    let mut producer = other_session
        .create_producer(Destination::from(&queue))
        .await
        .unwrap();
    producer.send(Message::text("hello owner")).await.unwrap();
    let result = other_session.create_consumer(&queue).await;
    assert!(matches!(result, Err(Error::InvalidDestination(_))));
    let result = other_session
        .create_consumer(TemporaryQueue::remote(queue.name()))
        .await;
    assert!(matches!(result, Err(Error::InvalidDestination(_))));

    let consumer = session.create_consumer(&queue).await.unwrap();
    owner.start().unwrap();
    let message = consumer.receive_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(message.text_body(), Some("hello owner"));

    owner.close().await.unwrap();
    assert!(!broker.has_queue(queue.name()));
    other.close().await.unwrap();
}

#[tokio::test]
async fn deleted_temporary_queue_cannot_be_consumed() {
    let (broker, factory) = loopback(&[]);
    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let queue = session.create_temporary_queue().await.unwrap();

    session.delete_temporary_queue(&queue).await.unwrap();
    assert!(!broker.has_queue(queue.name()));
    let result = session.create_consumer(&queue).await;
    assert!(matches!(result, Err(Error::InvalidDestination(_))));
    let result = session.delete_temporary_queue(&queue).await;
    assert!(matches!(result, Err(Error::InvalidDestination(_))));
    connection.close().await.unwrap();
}

#[tokio::test]
async fn temporary_queues_survive_their_session() {
    let (broker, factory) = loopback(&[]);
    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let queue = session.create_temporary_queue().await.unwrap();
    session.close().await.unwrap();
    assert!(broker.has_queue(queue.name()));

    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    assert!(session.create_consumer(&queue).await.is_ok());
    connection.close().await.unwrap();
    assert!(!broker.has_queue(queue.name()));
}

#[tokio::test]
async fn unknown_queue_is_an_invalid_destination() {
    let (_broker, factory) = loopback(&[]);
    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let result = session.create_producer(Destination::queue("Q/missing")).await;
    assert!(matches!(result, Err(Error::InvalidDestination(_))));
    let result = session.create_consumer(Destination::queue("Q/missing")).await;
    assert!(matches!(result, Err(Error::InvalidDestination(_))));
    connection.close().await.unwrap();
}

#[tokio::test]
async fn full_queue_rejects_persistent_sends() {
    let broker = LoopbackBroker::new();
    broker.provision_bounded_queue("Q/small", 1);
    let factory = ConnectionFactory::new(URL).unwrap().with_binding(broker.clone());
    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let mut producer = session
        .create_producer(Destination::queue("Q/small"))
        .await
        .unwrap();

    producer.send(Message::text("fits")).await.unwrap();
    let result = producer.send(Message::text("overflows")).await;
    assert!(matches!(result, Err(Error::BrokerRejected(_))));

    // Best effort sends do not wait for the outcome
    producer.set_delivery_mode(DeliveryMode::NonPersistent);
    producer.send(Message::text("dropped")).await.unwrap();
    assert_eq!(broker.queue_depth("Q/small"), Some(1));

    // The connection is still usable
    assert_eq!(connection.state(), ConnectionState::Created);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn producer_destination_rules() {
    let (_broker, factory) = loopback(&["Q/bound", "Q/other"]);
    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();

    let mut unbound = session.create_producer(None).await.unwrap();
    assert!(unbound.destination().is_none());
    let result = unbound.send(Message::text("where to?")).await;
    assert!(matches!(result, Err(Error::UnresolvedDestination)));
    unbound
        .send_to(Destination::queue("Q/other"), Message::text("there"))
        .await
        .unwrap();

    let mut bound = session
        .create_producer(Destination::queue("Q/bound"))
        .await
        .unwrap();
    let result = bound
        .send_to(Destination::queue("Q/other"), Message::text("elsewhere"))
        .await;
    assert!(matches!(result, Err(Error::UnsupportedOperation(_))));
    connection.close().await.unwrap();
}

#[tokio::test]
async fn send_stamps_headers() {
    let (_broker, factory) = loopback(&["Q/headers"]);
    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let mut producer = session
        .create_producer(Destination::queue("Q/headers"))
        .await
        .unwrap();
    producer.set_priority(7);
    producer.set_time_to_live(std::time::Duration::from_secs(60));
    producer
        .send(Message::text("stamped").with_property("origin", "test"))
        .await
        .unwrap();

    let consumer = session
        .create_consumer(Destination::queue("Q/headers"))
        .await
        .unwrap();
    connection.start().unwrap();
    let message = consumer.receive_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(message.priority(), 7);
    let timestamp = message.timestamp().unwrap();
    assert_eq!(message.expiration(), Some(timestamp + 60_000));
    assert_eq!(
        message.property("origin"),
        Some(&fe2o3_amqp_jms::PropertyValue::String("test".into()))
    );
    connection.close().await.unwrap();
}

#[tokio::test]
async fn unbound_producer_keeps_a_bounded_set_of_links() {
    let (_broker, factory) = loopback(&[]);
    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let mut producer = session.create_producer(None).await.unwrap();

    for i in 0..50 {
        let queue = session.create_temporary_queue().await.unwrap();
        producer
            .send_to(&queue, Message::text(format!("reply {}", i)))
            .await
            .unwrap();
        session.delete_temporary_queue(&queue).await.unwrap();
    }
    assert!(producer.attached_links() <= 16);

    // A link whose address went away is dropped instead of failing every later send
    let queue = session.create_temporary_queue().await.unwrap();
    producer.send_to(&queue, Message::text("first")).await.unwrap();
    let before = producer.attached_links();
    session.delete_temporary_queue(&queue).await.unwrap();
    let result = producer.send_to(&queue, Message::text("second")).await;
    assert!(matches!(result, Err(Error::InvalidDestination(_))));
    assert_eq!(producer.attached_links(), before - 1);

    connection.close().await.unwrap();
}

#[tokio::test]
async fn huge_time_to_live_does_not_expire_the_message() {
    let (_broker, factory) = loopback(&["Q/ttl"]);
    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let mut producer = session
        .create_producer(Destination::queue("Q/ttl"))
        .await
        .unwrap();
    producer.set_time_to_live(std::time::Duration::MAX);
    producer.send(Message::text("long lived")).await.unwrap();

    let consumer = session
        .create_consumer(Destination::queue("Q/ttl"))
        .await
        .unwrap();
    connection.start().unwrap();
    let message = consumer.receive_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(message.text_body(), Some("long lived"));
    let timestamp = message.timestamp().unwrap();
    assert_eq!(message.expiration(), Some(timestamp + u32::MAX as i64));

    connection.close().await.unwrap();
}
