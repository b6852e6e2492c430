//! Receives one message from the queue bound as `queueLookup` in `jndi.properties`

use fe2o3_amqp_jms::{AckMode, Error, Resolver, Result};
use jms_samples::{init_logging, CONNECTION_LOOKUP, QUEUE_LOOKUP};

async fn run() -> Result<()> {
    let resolver = Resolver::from_default_file()?;
    let factory = resolver.lookup_connection_factory(CONNECTION_LOOKUP)?;
    let connection = factory.create_connection().await?;
    connection.set_exception_listener(|err: Error| tracing::error!("{}", err))?;
    connection.start()?;

    let source = resolver.lookup_queue(QUEUE_LOOKUP)?;
    let session = connection.create_session(AckMode::AutoAck).await?;
    let receiver = session.create_consumer(source).await?;

    tracing::info!("Waiting for a persistent message...");
    let message = receiver.receive().await?;
    match message.text_body() {
        Some(text) => tracing::info!("Received message with string data: \"{}\"", text),
        None => tracing::warn!("Unexpected data type in message: \"{:?}\".", message),
    }

    receiver.close().await?;
    session.close().await?;
    connection.close().await?;
    resolver.close();
    Ok(())
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run().await {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}
