//! Sends one persistent message to a queue that already exists on the broker
//!
//! ```text
//! cargo run --bin queue_producer -- amqp://localhost:5672 [username password]
//! ```

use fe2o3_amqp_jms::{AckMode, ConnectionFactory, Destination, Result};
use jms_samples::{init_logging, HostArgs, QUEUE_NAME};

async fn run(args: HostArgs) -> Result<()> {
    println!("QueueProducer is connecting to {}...", args.host);
    let factory = ConnectionFactory::new(args.url())?;
    let connection = match (&args.username, &args.password) {
        (Some(username), Some(password)) => {
            factory.create_connection_with(username, password).await?
        }
        _ => factory.create_connection().await?,
    };
    let session = connection.create_session(AckMode::AutoAck).await?;
    match &args.username {
        Some(username) => println!("Connected with username '{}'.", username),
        None => println!("Connected."),
    }

    // The queue must already exist on the broker
    let queue = session.create_queue(QUEUE_NAME)?;
    let mut producer = session.create_producer(Destination::from(queue.clone())).await?;

    let message = session.create_text_message("Hello world Queues!")?;
    println!(
        "Sending message '{}' to queue '{}'...",
        message.text_body().unwrap_or_default(),
        queue.name()
    );
    producer.send(message).await?;
    println!("Sent successfully. Exiting...");

    producer.close().await?;
    session.close().await?;
    connection.close().await
}

#[tokio::main]
async fn main() {
    init_logging();
    let args = HostArgs::parse_for("QueueProducer");
    if let Err(err) = run(args).await {
        eprintln!("QueueProducer failed: {}", err);
        std::process::exit(1);
    }
}
