//! Request/reply over a temporary queue
//!
//! A [`Requestor`] sends requests carrying a fresh correlation id and a `reply_to` pointing at a
//! temporary queue of its own connection, then waits for the reply with the same correlation id.
//! A [`Replier`] answers each request on the queue named by its `reply_to`.

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    consumer::Consumer,
    destination::{Destination, TemporaryQueue},
    error::{Error, Result},
    message::{DeliveryMode, Message},
    producer::Producer,
    session::{Session, SessionInner},
};

/// Sends requests and waits for correlated replies
#[derive(Debug)]
pub struct Requestor {
    session: Arc<SessionInner>,
    producer: Producer,
    consumer: Consumer,
    reply_queue: TemporaryQueue,
}

impl Requestor {
    /// Creates the reply queue and the links to the request destination
    ///
    /// The connection must be started for replies to be received.
    pub async fn new(session: &Session, requests: impl Into<Destination>) -> Result<Self> {
        let reply_queue = session.create_temporary_queue().await?;
        let consumer = session.create_consumer(&reply_queue).await?;
        let mut producer = session.create_producer(Some(requests.into())).await?;
        producer.set_delivery_mode(DeliveryMode::NonPersistent);

        Ok(Self {
            session: session.inner().clone(),
            producer,
            consumer,
            reply_queue,
        })
    }

    /// The temporary queue replies are sent to
    pub fn reply_queue(&self) -> &TemporaryQueue {
        &self.reply_queue
    }

    /// Sends `request` and waits up to `timeout` for its reply
    ///
    /// Replies with another correlation id are discarded. Returns `None` on timeout.
    pub async fn request(&mut self, request: Message, timeout: Duration) -> Result<Option<Message>> {
        let correlation_id = Uuid::new_v4().to_string();
        let request = request
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(self.reply_queue.clone());
        self.producer.send(request).await?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let Some(reply) = self.consumer.receive_timeout(remaining).await? else {
                return Ok(None);
            };
            if reply.correlation_id() == Some(correlation_id.as_str()) {
                return Ok(Some(reply));
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(expected = %correlation_id, got = ?reply.correlation_id(), "ignoring uncorrelated reply");
            #[cfg(feature = "log")]
            log::debug!("ignoring reply {:?}, waiting for {}", reply.correlation_id(), correlation_id);
        }
    }

    /// Closes the links and deletes the reply queue
    pub async fn close(mut self) -> Result<()> {
        self.producer.close().await?;
        self.consumer.close().await?;
        match self.session.connection.delete_temporary_queue(&self.reply_queue).await {
            Ok(()) | Err(Error::InvalidDestination(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// What happened to a request taken by [`Replier::reply_once`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The reply was sent
    Replied,
    /// The request had no usable `reply_to` and was dropped
    Dropped,
}

/// Answers requests from a destination
#[derive(Debug)]
pub struct Replier {
    consumer: Consumer,
    producer: Producer,
}

impl Replier {
    /// Creates a consumer on the request destination and an unbound, non-persistent producer for
    /// the replies
    pub async fn new(session: &Session, requests: impl Into<Destination>) -> Result<Self> {
        let consumer = session.create_consumer(requests).await?;
        let mut producer = session.create_producer(None).await?;
        producer.set_delivery_mode(DeliveryMode::NonPersistent);
        Ok(Self { consumer, producer })
    }

    /// Waits for one request and sends the reply built by `handler`
    ///
    /// The reply echoes the correlation id of the request. A request without `reply_to`, or
    /// whose `reply_to` no longer exists, is logged and dropped.
    pub async fn reply_once<F>(&mut self, handler: F) -> Result<ReplyOutcome>
    where
        F: FnOnce(&Message) -> Message,
    {
        let request = self.consumer.receive().await?;
        let Some(reply_to) = request.reply_to().cloned() else {
            #[cfg(feature = "tracing")]
            tracing::warn!(id = ?request.message_id(), "request has no reply_to, dropping it");
            #[cfg(feature = "log")]
            log::warn!("request {:?} has no reply_to, dropping it", request.message_id());
            return Ok(ReplyOutcome::Dropped);
        };

        let mut reply = handler(&request);
        if let Some(correlation_id) = request.correlation_id() {
            reply.set_correlation_id(correlation_id);
        }

        match self.producer.send_to(reply_to, reply).await {
            Ok(()) => Ok(ReplyOutcome::Replied),
            Err(Error::InvalidDestination(_reason)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("cannot reply to request {:?}: {}", request.message_id(), _reason);
                #[cfg(feature = "log")]
                log::warn!("cannot reply to request {:?}: {}", request.message_id(), _reason);
                Ok(ReplyOutcome::Dropped)
            }
            Err(err) => Err(err),
        }
    }

    /// Answers requests until the consumer, its session or its connection is closed
    pub async fn serve<F>(&mut self, mut handler: F) -> Result<()>
    where
        F: FnMut(&Message) -> Message,
    {
        loop {
            match self.reply_once(&mut handler).await {
                Ok(_) => {}
                Err(Error::ConsumerClosed) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Closes the consumer and the producer
    pub async fn close(mut self) -> Result<()> {
        self.consumer.close().await?;
        self.producer.close().await
    }
}
