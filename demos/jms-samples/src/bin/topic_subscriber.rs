//! Waits for one message on a topic with a message listener
//!
//! ```text
//! cargo run --bin topic_subscriber -- amqp://localhost:5672 [username password]
//! ```

use fe2o3_amqp_jms::{AckMode, Body, Message, Resolver, Result};
use jms_samples::{init_logging, HostArgs, CONNECTION_LOOKUP, TOPIC_NAME};
use tokio::sync::mpsc;

async fn run(args: HostArgs) -> Result<()> {
    println!("TopicSubscriber is connecting to {}...", args.host);
    let resolver = Resolver::from_map([
        (
            "java.naming.factory.initial",
            "org.apache.qpid.jms.jndi.JmsInitialContextFactory".to_string(),
        ),
        ("connectionfactory.solaceConnectionLookup", args.url()),
    ])?;
    let factory = resolver.lookup_connection_factory(CONNECTION_LOOKUP)?;
    let connection = match (&args.username, &args.password) {
        (Some(username), Some(password)) => {
            factory.create_connection_with(username, password).await?
        }
        _ => factory.create_connection().await?,
    };
    let session = connection.create_session(AckMode::AutoAck).await?;
    println!("Connected.");

    let topic = session.create_topic(TOPIC_NAME)?;
    let consumer = session.create_consumer(topic).await?;

    let (received, mut done) = mpsc::unbounded_channel();
    consumer.set_message_listener(move |message: Message| {
        match message.body() {
            Body::Text(text) => println!("TextMessage received: '{}'", text),
            _ => println!("Message received."),
        }
        println!("Message Content:\n{:?}", message);
        let _ = received.send(());
    })?;

    connection.start()?;
    println!("Awaiting message...");
    let _ = done.recv().await;

    consumer.close().await?;
    session.close().await?;
    connection.close().await?;
    resolver.close();
    Ok(())
}

#[tokio::main]
async fn main() {
    init_logging();
    let args = HostArgs::parse_for("TopicSubscriber");
    if let Err(err) = run(args).await {
        eprintln!("TopicSubscriber failed: {}", err);
        std::process::exit(1);
    }
}
