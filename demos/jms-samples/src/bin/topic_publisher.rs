//! Publishes one non-persistent message through an unbound producer
//!
//! ```text
//! cargo run --bin topic_publisher -- amqp://localhost:5672 [username password]
//! ```

use fe2o3_amqp_jms::{AckMode, ConnectionFactory, DeliveryMode, Result, SendOptions};
use jms_samples::{init_logging, HostArgs, TOPIC_NAME};

async fn run(args: HostArgs) -> Result<()> {
    println!("TopicPublisher is connecting to {}...", args.host);
    let mut builder = ConnectionFactory::builder().url(args.url());
    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        builder = builder.username(username.as_str()).password(password.as_str());
    }
    let factory = builder.build()?;
    let connection = factory.create_connection().await?;
    let session = connection.create_session(AckMode::AutoAck).await?;
    println!("Connected.");

    let topic = session.create_topic(TOPIC_NAME)?;
    let mut producer = session.create_producer(None).await?;

    let message = session.create_text_message("Hello world!")?;
    println!(
        "Sending message '{}' to topic '{}'...",
        message.text_body().unwrap_or_default(),
        topic.name()
    );
    let options = SendOptions::new().delivery_mode(DeliveryMode::NonPersistent);
    producer.send_to_with(topic, message, options).await?;
    println!("Sent successfully. Exiting...");

    producer.close().await?;
    session.close().await?;
    connection.close().await
}

#[tokio::main]
async fn main() {
    init_logging();
    let args = HostArgs::parse_for("TopicPublisher");
    if let Err(err) = run(args).await {
        eprintln!("TopicPublisher failed: {}", err);
        std::process::exit(1);
    }
}
