//! End to end runs of the sample flows against the in-process broker

use std::time::Duration;

use fe2o3_amqp_jms::{
    AckMode, DeliveryMode, Destination, Error, Message, ReplyOutcome, Replier, Requestor,
    Resolver,
};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

mod common;

use common::{loopback, SHORT, WAIT};

#[tokio::test]
async fn queue_send_and_receive() {
    let resolver = Resolver::from_map([
        ("initialContextFactory", "loopback"),
        ("connectionfactory.solaceConnectionLookup", "amqp://localhost:5672"),
        ("queue.queueLookup", "Q/tutorial"),
    ])
    .unwrap();
    let broker = resolver.loopback_broker().unwrap().clone();
    let factory = resolver
        .lookup_connection_factory("solaceConnectionLookup")
        .unwrap();
    let queue = resolver.lookup_queue("queueLookup").unwrap();

    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let mut producer = session
        .create_producer(Destination::from(queue.clone()))
        .await
        .unwrap();
    let message = session
        .create_text_message("Message with String Data")
        .unwrap();
    producer.send(message).await.unwrap();
    assert_eq!(broker.queue_depth("Q/tutorial"), Some(1));

    let consumer = session.create_consumer(queue).await.unwrap();
    connection.start().unwrap();
    let received = consumer.receive_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(received.text_body(), Some("Message with String Data"));
    assert_eq!(received.delivery_mode(), DeliveryMode::Persistent);
    assert_eq!(received.destination(), Some(&Destination::queue("Q/tutorial")));
    assert!(received.message_id().unwrap().starts_with("ID:"));
    assert!(received.timestamp().is_some());
    assert!(!received.redelivered());

    consumer.close().await.unwrap();
    producer.close().await.unwrap();
    session.close().await.unwrap();
    connection.close().await.unwrap();
    resolver.close();

    assert_eq!(broker.queue_depth("Q/tutorial"), Some(0));
    assert_eq!(broker.unsettled_count(), 0);
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn topic_listener_is_invoked_once() {
    let (_broker, factory) = loopback(&[]);

    let subscriber = factory.create_connection().await.unwrap();
    let session = subscriber.create_session(AckMode::AutoAck).await.unwrap();
    let topic = session.create_topic("T/GettingStarted/pubsub").unwrap();
    let consumer = session.create_consumer(topic.clone()).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer
        .set_message_listener(move |message: Message| {
            let _ = tx.send(message);
        })
        .unwrap();
    subscriber.start().unwrap();

    let publisher = factory.create_connection().await.unwrap();
    let publishing = publisher.create_session(AckMode::AutoAck).await.unwrap();
    let mut producer = publishing.create_producer(Destination::from(topic)).await.unwrap();
    producer.set_delivery_mode(DeliveryMode::NonPersistent);
    producer.send(Message::text("Hello world!")).await.unwrap();

    let received = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.text_body(), Some("Hello world!"));
    assert_eq!(received.delivery_mode(), DeliveryMode::NonPersistent);
    assert!(tokio::time::timeout(SHORT, rx.recv()).await.is_err());

    publisher.close().await.unwrap();
    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn topic_fans_out_to_every_subscriber() {
    let (_broker, factory) = loopback(&[]);
    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let first = session.create_consumer(Destination::topic("T/fanout")).await.unwrap();
    let second = session.create_consumer(Destination::topic("T/fanout")).await.unwrap();
    connection.start().unwrap();

    let mut producer = session.create_producer(None).await.unwrap();
    producer
        .send_to(Destination::topic("T/fanout"), Message::text("to all"))
        .await
        .unwrap();

    for consumer in [&first, &second] {
        let message = consumer.receive_timeout(WAIT).await.unwrap().unwrap();
        assert_eq!(message.text_body(), Some("to all"));
    }
    connection.close().await.unwrap();
}

#[tokio::test]
async fn request_reply_with_helpers() {
    let (_broker, factory) = loopback(&["Q/tutorial"]);

    let replier_connection = factory.create_connection().await.unwrap();
    let replier_session = replier_connection
        .create_session(AckMode::AutoAck)
        .await
        .unwrap();
    let mut replier = Replier::new(&replier_session, Destination::queue("Q/tutorial"))
        .await
        .unwrap();
    replier_connection.start().unwrap();
    let serving = tokio::spawn(async move {
        let outcome = replier
            .reply_once(|request| {
                Message::text(format!(
                    "Reply to \"{}\"",
                    request.text_body().unwrap_or_default()
                ))
            })
            .await;
        (replier, outcome)
    });

    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let mut requestor = Requestor::new(&session, Destination::queue("Q/tutorial"))
        .await
        .unwrap();
    connection.start().unwrap();

    let reply = requestor
        .request(Message::text("Request with String Data"), WAIT)
        .await
        .unwrap()
        .expect("reply within timeout");
    assert_eq!(reply.text_body(), Some("Reply to \"Request with String Data\""));
    assert!(reply.correlation_id().is_some());

    let (replier, outcome) = serving.await.unwrap();
    assert_eq!(outcome.unwrap(), ReplyOutcome::Replied);

    requestor.close().await.unwrap();
    replier.close().await.unwrap();
    connection.close().await.unwrap();
    replier_connection.close().await.unwrap();
}

#[tokio::test]
async fn request_reply_by_hand() {
    let (_broker, factory) = loopback(&["Q/tutorial"]);

    let replier_connection = factory.create_connection().await.unwrap();
    let replier_session = replier_connection
        .create_session(AckMode::AutoAck)
        .await
        .unwrap();
    let requests = replier_session
        .create_consumer(Destination::queue("Q/tutorial"))
        .await
        .unwrap();
    let mut replies = replier_session.create_producer(None).await.unwrap();
    replier_connection.start().unwrap();

    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let reply_queue = session.create_temporary_queue().await.unwrap();
    let reply_consumer = session.create_consumer(&reply_queue).await.unwrap();
    let (reply_tx, reply_rx) = oneshot::channel();
    let reply_tx = parking_lot::Mutex::new(Some(reply_tx));
    reply_consumer
        .set_message_listener(move |message: Message| {
            if let Some(tx) = reply_tx.lock().take() {
                let _ = tx.send(message);
            }
        })
        .unwrap();
    connection.start().unwrap();

    let correlation_id = Uuid::new_v4().to_string();
    let mut producer = session
        .create_producer(Destination::queue("Q/tutorial"))
        .await
        .unwrap();
    producer.set_delivery_mode(DeliveryMode::NonPersistent);
    let request = Message::text("Request with String Data")
        .with_correlation_id(correlation_id.clone())
        .with_reply_to(reply_queue.clone());
    producer.send(request).await.unwrap();

    let request = requests.receive_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(
        request.reply_to(),
        Some(&Destination::TemporaryQueue(reply_queue.clone()))
    );
    let reply = Message::text("Reply to \"Request with String Data\"")
        .with_correlation_id(request.correlation_id().unwrap());
    replies
        .send_to(request.reply_to().cloned().unwrap(), reply)
        .await
        .unwrap();

    let reply = tokio::time::timeout(WAIT, reply_rx).await.unwrap().unwrap();
    assert_eq!(reply.correlation_id(), Some(correlation_id.as_str()));
    assert_eq!(reply.text_body(), Some("Reply to \"Request with String Data\""));

    connection.close().await.unwrap();
    replier_connection.close().await.unwrap();
}

#[tokio::test]
async fn requestor_skips_uncorrelated_replies() {
    let (_broker, factory) = loopback(&["Q/requests"]);
    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let mut requestor = Requestor::new(&session, Destination::queue("Q/requests"))
        .await
        .unwrap();
    let mut replier = Replier::new(&session, Destination::queue("Q/requests"))
        .await
        .unwrap();
    connection.start().unwrap();

    let mut stray = session
        .create_producer(Destination::from(requestor.reply_queue()))
        .await
        .unwrap();
    stray
        .send(Message::text("stray").with_correlation_id("someone else"))
        .await
        .unwrap();

    let serving = tokio::spawn(async move {
        replier
            .reply_once(|request| Message::text(request.text_body().unwrap_or_default()))
            .await
    });
    let reply = requestor
        .request(Message::text("echo"), WAIT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.text_body(), Some("echo"));
    assert_eq!(serving.await.unwrap().unwrap(), ReplyOutcome::Replied);

    connection.close().await.unwrap();
}

#[tokio::test]
async fn request_without_reply_to_is_dropped() {
    let (broker, factory) = loopback(&["Q/tutorial"]);

    let replier_connection = factory.create_connection().await.unwrap();
    let replier_session = replier_connection
        .create_session(AckMode::AutoAck)
        .await
        .unwrap();
    let mut replier = Replier::new(&replier_session, Destination::queue("Q/tutorial"))
        .await
        .unwrap();
    replier_connection.start().unwrap();

    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let mut producer = session
        .create_producer(Destination::queue("Q/tutorial"))
        .await
        .unwrap();
    producer
        .send(Message::text("nobody is listening").with_correlation_id("lost"))
        .await
        .unwrap();

    let outcome = replier
        .reply_once(|_| Message::text("unused"))
        .await
        .unwrap();
    assert_eq!(outcome, ReplyOutcome::Dropped);
    assert_eq!(broker.queue_depth("Q/tutorial"), Some(0));

    // The replier keeps answering after a dropped request
    let mut requestor = Requestor::new(&session, Destination::queue("Q/tutorial"))
        .await
        .unwrap();
    connection.start().unwrap();
    let serving = tokio::spawn(async move {
        let outcome = replier.reply_once(|_| Message::text("pong")).await;
        (replier, outcome)
    });
    let reply = requestor
        .request(Message::text("ping"), WAIT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.text_body(), Some("pong"));
    let (replier, outcome) = serving.await.unwrap();
    assert_eq!(outcome.unwrap(), ReplyOutcome::Replied);

    replier.close().await.unwrap();
    requestor.close().await.unwrap();
    connection.close().await.unwrap();
    replier_connection.close().await.unwrap();
}

#[tokio::test]
async fn request_times_out_without_replier() {
    let (_broker, factory) = loopback(&["Q/nobody"]);
    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let mut requestor = Requestor::new(&session, Destination::queue("Q/nobody"))
        .await
        .unwrap();
    connection.start().unwrap();

    let reply = requestor
        .request(Message::text("anyone?"), SHORT)
        .await
        .unwrap();
    assert!(reply.is_none());
    connection.close().await.unwrap();
}

#[tokio::test]
async fn orderly_shutdown_then_closed_errors() {
    let (_broker, factory) = loopback(&["Q/tutorial"]);
    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let mut producer = session
        .create_producer(Destination::queue("Q/tutorial"))
        .await
        .unwrap();
    let consumer = session
        .create_consumer(Destination::queue("Q/tutorial"))
        .await
        .unwrap();
    connection.start().unwrap();

    producer.close().await.unwrap();
    session.close().await.unwrap();
    connection.close().await.unwrap();

    assert!(matches!(
        producer.send(Message::text("late")).await,
        Err(Error::ProducerClosed)
    ));
    assert!(matches!(consumer.receive().await, Err(Error::ConsumerClosed)));
    assert!(matches!(
        session.create_producer(None).await,
        Err(Error::SessionClosed)
    ));
    assert!(matches!(
        connection.create_session(AckMode::AutoAck).await,
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(connection.start(), Err(Error::ConnectionClosed)));

    // Closing again is a no-op
    producer.close().await.unwrap();
    consumer.close().await.unwrap();
    session.close().await.unwrap();
    connection.close().await.unwrap();
}
