//! Runs against an ActiveMQ Artemis container. Requires docker.

use std::time::Duration;

use fe2o3_amqp_jms::{
    AckMode, ConnectionFactory, DeliveryMode, Destination, Message, ReplyOutcome, Replier,
    Requestor,
};
use testcontainers::{Container, GenericImage};

mod common;

use common::{setup_activemq_artemis, WAIT};

async fn factory() -> (Container<'static, GenericImage>, ConnectionFactory) {
    let (node, port) = setup_activemq_artemis().await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let factory = ConnectionFactory::new(format!(
        "amqp://localhost:{}?amqp.idleTimeout=120000",
        port
    ))
    .unwrap();
    (node, factory)
}

#[tokio::test]
#[ignore]
async fn artemis_queue_round_trip() {
    let (_node, factory) = factory().await;
    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();

    let mut producer = session
        .create_producer(Destination::queue("Q/tutorial"))
        .await
        .unwrap();
    producer
        .send(Message::text("Message with String Data"))
        .await
        .unwrap();

    let consumer = session
        .create_consumer(Destination::queue("Q/tutorial"))
        .await
        .unwrap();
    connection.start().unwrap();
    let message = consumer.receive_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(message.text_body(), Some("Message with String Data"));
    assert_eq!(message.destination(), Some(&Destination::queue("Q/tutorial")));

    connection.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn artemis_topic_publish_subscribe() {
    let (_node, factory) = factory().await;
    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let consumer = session
        .create_consumer(Destination::topic("T/GettingStarted/pubsub"))
        .await
        .unwrap();
    connection.start().unwrap();

    let mut producer = session
        .create_producer(Destination::topic("T/GettingStarted/pubsub"))
        .await
        .unwrap();
    producer.set_delivery_mode(DeliveryMode::NonPersistent);
    producer.send(Message::text("Hello world!")).await.unwrap();

    let message = consumer.receive_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(message.text_body(), Some("Hello world!"));
    assert!(matches!(message.destination(), Some(Destination::Topic(_))));

    connection.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn artemis_request_reply() {
    let (_node, factory) = factory().await;

    let replier_connection = factory.create_connection().await.unwrap();
    let replier_session = replier_connection
        .create_session(AckMode::AutoAck)
        .await
        .unwrap();
    let mut replier = Replier::new(&replier_session, Destination::queue("Q/requests"))
        .await
        .unwrap();
    replier_connection.start().unwrap();
    let serving = tokio::spawn(async move {
        replier
            .reply_once(|request| {
                Message::text(format!(
                    "Reply to \"{}\"",
                    request.text_body().unwrap_or_default()
                ))
            })
            .await
    });

    let connection = factory.create_connection().await.unwrap();
    let session = connection.create_session(AckMode::AutoAck).await.unwrap();
    let mut requestor = Requestor::new(&session, Destination::queue("Q/requests"))
        .await
        .unwrap();
    connection.start().unwrap();
    let reply = requestor
        .request(Message::text("Request with String Data"), WAIT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.text_body(), Some("Reply to \"Request with String Data\""));
    assert_eq!(serving.await.unwrap().unwrap(), ReplyOutcome::Replied);

    requestor.close().await.unwrap();
    connection.close().await.unwrap();
    replier_connection.close().await.unwrap();
}
