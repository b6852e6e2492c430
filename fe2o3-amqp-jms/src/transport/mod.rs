//! Transport binding between the session layer and a wire protocol implementation
//!
//! The session layer never touches frames. It talks to a [`Binding`], which dials the broker and
//! hands back a [`Transport`]. A transport begins [`TransportSession`]s, and sessions attach
//! [`LinkSender`]s and [`LinkReceiver`]s. [`amqp::AmqpBinding`] is the production binding,
//! [`loopback::LoopbackBroker`] an in-process one.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::{destination::Destination, message::Message};

pub mod amqp;
pub mod codec;
pub mod loopback;

/// Errors raised by a transport binding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The broker refused the credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The connection to the broker is gone
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The broker detached a link
    #[error("Link detached: {0}")]
    Detached(String),

    /// The broker settled a delivery with a non-accepted outcome
    #[error("Delivery rejected: {0}")]
    Rejected(String),

    /// The address does not exist on the broker
    #[error("Address not found: {0}")]
    NotFound(String),
}

/// Outcome applied to a received delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Consumed
    Accepted,

    /// Give the delivery back to the broker for redelivery
    Released,
}

/// Opaque per-link identifier of an unsettled incoming delivery
pub type DeliveryTag = u64;

/// A message received on a link, still unsettled
#[derive(Debug)]
pub struct Inbound {
    /// Identifies the delivery when settling it
    pub tag: DeliveryTag,

    /// The decoded message
    pub message: Message,
}

/// Everything a binding needs to dial the broker
#[derive(Clone)]
pub struct ConnectOptions<'a> {
    /// Broker url without the client options query
    pub url: &'a Url,

    /// Container id announced in the open frame
    pub container_id: &'a str,

    /// SASL PLAIN user name. ANONYMOUS is used when absent
    pub username: Option<&'a str>,

    /// SASL PLAIN password
    pub password: Option<&'a str>,

    /// Idle timeout announced in the open frame
    pub idle_timeout: Option<Duration>,
}

impl fmt::Debug for ConnectOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("url", &self.url.as_str())
            .field("container_id", &self.container_id)
            .field("username", &self.username)
            .field("password", &self.password.map(|_| "***"))
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

/// Dials a broker
#[async_trait]
pub trait Binding: fmt::Debug + Send + Sync {
    /// Performs the open handshake, including SASL
    async fn connect(&self, options: ConnectOptions<'_>) -> Result<Box<dyn Transport>, TransportError>;
}

/// One open connection to the broker
#[async_trait]
pub trait Transport: Send {
    /// Begins a new session on the connection
    async fn begin(&mut self) -> Result<Box<dyn TransportSession>, TransportError>;

    /// Closes the connection. Temporary queues created on it are deleted by the broker
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Unsolicited failures reported by the transport, such as a broker initiated close.
    ///
    /// Called once after the connection is open; `None` if the binding only reports failures
    /// through link operations.
    fn take_failures(&mut self) -> Option<mpsc::UnboundedReceiver<TransportError>> {
        None
    }
}

/// A session on a transport connection
#[async_trait]
pub trait TransportSession: Send {
    /// Attaches a sending link to the destination
    async fn attach_sender(
        &mut self,
        name: String,
        destination: &Destination,
    ) -> Result<Box<dyn LinkSender>, TransportError>;

    /// Attaches a receiving link to the destination, granting `prefetch` credits
    async fn attach_receiver(
        &mut self,
        name: String,
        destination: &Destination,
        prefetch: u32,
    ) -> Result<Box<dyn LinkReceiver>, TransportError>;

    /// Asks the broker for a dynamic temporary queue.
    ///
    /// Returns the broker assigned address and the link that anchors the queue. Closing that
    /// link deletes the queue.
    async fn create_temporary_queue(
        &mut self,
        name: String,
    ) -> Result<(String, Box<dyn LinkSender>), TransportError>;

    /// Ends the session, detaching every link still attached on it
    async fn end(&mut self) -> Result<(), TransportError>;
}

/// Sending half of a link
#[async_trait]
pub trait LinkSender: Send {
    /// Transfers a message.
    ///
    /// With `settled` the transfer is pre-settled and returns once the frame is handed to the
    /// wire. Otherwise it returns after the broker settled the delivery, failing with
    /// [`TransportError::Rejected`] on any outcome other than accepted.
    async fn send(&mut self, message: &Message, settled: bool) -> Result<(), TransportError>;

    /// Detaches the link with `closed = true`
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Receiving half of a link
#[async_trait]
pub trait LinkReceiver: Send {
    /// Waits for the next delivery. Must be cancel safe.
    async fn recv(&mut self) -> Result<Inbound, TransportError>;

    /// Settles a delivery previously returned by [`LinkReceiver::recv`]
    async fn settle(&mut self, tag: DeliveryTag, disposition: Disposition) -> Result<(), TransportError>;

    /// Detaches the link with `closed = true`; unsettled deliveries go back to the broker
    async fn close(&mut self) -> Result<(), TransportError>;
}
