//! Sends a request to the queue bound as `queueLookup` and waits for the reply on a temporary
//! queue

use std::time::Duration;

use fe2o3_amqp_jms::{AckMode, Error, Resolver, Requestor, Result};
use jms_samples::{init_logging, CONNECTION_LOOKUP, QUEUE_LOOKUP};

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

async fn run() -> Result<()> {
    let resolver = Resolver::from_default_file()?;
    let factory = resolver.lookup_connection_factory(CONNECTION_LOOKUP)?;
    let connection = factory.create_connection().await?;
    connection.set_exception_listener(|err: Error| tracing::error!("{}", err))?;
    connection.start()?;

    let target = resolver.lookup_queue(QUEUE_LOOKUP)?;
    let session = connection.create_session(AckMode::AutoAck).await?;
    let mut requestor = Requestor::new(&session, target).await?;

    let request = session.create_text_message("Request with String Data")?;
    tracing::info!("Sending request, waiting for a reply...");
    match requestor.request(request, REPLY_TIMEOUT).await? {
        Some(reply) => tracing::info!(
            "Received reply: \"{}\"",
            reply.text_body().unwrap_or_default()
        ),
        None => tracing::warn!("No reply within {:?}", REPLY_TIMEOUT),
    }

    requestor.close().await?;
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
