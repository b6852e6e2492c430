//! Answers requests from the queue bound as `queueLookup` until interrupted with ctrl-c

use fe2o3_amqp_jms::{AckMode, Error, Message, Replier, Resolver, Result};
use jms_samples::{init_logging, CONNECTION_LOOKUP, QUEUE_LOOKUP};

fn reply_to(request: &Message) -> Message {
    match request.text_body() {
        Some(text) => {
            tracing::info!("Received request with string data: \"{}\"", text);
            Message::text(format!("Reply to \"{}\"", text))
        }
        None => {
            tracing::warn!("Unexpected data type in request: \"{:?}\"", request);
            Message::text("Reply to a request without string data")
        }
    }
}

async fn run() -> Result<()> {
    let resolver = Resolver::from_default_file()?;
    let factory = resolver.lookup_connection_factory(CONNECTION_LOOKUP)?;
    let connection = factory.create_connection().await?;
    connection.set_exception_listener(|err: Error| tracing::error!("{}", err))?;
    connection.start()?;

    let source = resolver.lookup_queue(QUEUE_LOOKUP)?;
    let session = connection.create_session(AckMode::AutoAck).await?;
    let mut replier = Replier::new(&session, source).await?;

    tracing::info!("Waiting for requests...");
    tokio::select! {
        served = replier.serve(reply_to) => served?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted, shutting down"),
    }

    replier.close().await?;
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
