//! Sends one persistent message to the queue bound as `queueLookup` in `jndi.properties`

use fe2o3_amqp_jms::{AckMode, DeliveryMode, Destination, Error, Resolver, Result};
use jms_samples::{init_logging, CONNECTION_LOOKUP, QUEUE_LOOKUP};

async fn run() -> Result<()> {
    let resolver = Resolver::from_default_file()?;
    let factory = resolver.lookup_connection_factory(CONNECTION_LOOKUP)?;
    let connection = factory.create_connection().await?;
    connection.set_exception_listener(|err: Error| tracing::error!("{}", err))?;
    connection.start()?;

    let target = resolver.lookup_queue(QUEUE_LOOKUP)?;
    let session = connection.create_session(AckMode::AutoAck).await?;
    let mut sender = session.create_producer(Destination::from(target)).await?;
    sender.set_delivery_mode(DeliveryMode::Persistent);

    let message = session.create_text_message("Message with String Data")?;
    sender.send(message).await?;
    tracing::info!("Message sent successfully.");

    sender.close().await?;
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
