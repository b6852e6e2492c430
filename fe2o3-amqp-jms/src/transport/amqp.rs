//! Binding over an AMQP 1.0 connection
//!
//! Each [`TransportSession`] is an AMQP session, each producer or consumer link an AMQP link.
//! Destinations become link terminus addresses tagged with a `queue`, `topic` or
//! `temporary-queue` capability, and temporary queues are dynamic sender targets.

use std::collections::HashMap;

use async_trait::async_trait;
use fe2o3_amqp::{
    connection::{ConnectionHandle, OpenError},
    link::{
        delivery::DeliveryInfo, receiver::CreditMode, LinkStateError, ReceiverAttachError,
        RecvError, SendError, SenderAttachError,
    },
    sasl_profile::SaslProfile,
    session::SessionHandle,
    types::{
        definitions::{self, AmqpError, ErrorCondition},
        messaging::{Body as AmqpBody, Source, Target},
        primitives::{Symbol, Value},
    },
    Connection, Delivery, Receiver, Sendable, Sender, Session,
};

use super::{
    codec, Binding, ConnectOptions, DeliveryTag, Disposition, Inbound, LinkReceiver, LinkSender,
    Transport, TransportError, TransportSession,
};
use crate::{
    destination::{Destination, DestinationKind},
    message::Message,
};

/// Dials the broker over TCP (or TLS for `amqps`, with the `rustls` or `native-tls` feature)
#[derive(Debug, Clone, Default)]
pub struct AmqpBinding {}

impl AmqpBinding {
    /// Creates the binding
    pub fn new() -> Self {
        Self {}
    }
}

fn capabilities(destination: &Destination) -> Vec<Symbol> {
    vec![Symbol::from(codec::capability(destination.kind()))]
}

/// Error carried by a detach or close frame from the broker
fn remote_error(error: &definitions::Error, address: &str) -> TransportError {
    match &error.condition {
        ErrorCondition::AmqpError(AmqpError::NotFound) => TransportError::NotFound(address.to_string()),
        condition => TransportError::Detached(match &error.description {
            Some(description) => format!("{:?}: {}", condition, description),
            None => format!("{:?}", condition),
        }),
    }
}

/// Only the loss of the session takes the connection down; everything else ends one link
fn link_state_error(error: LinkStateError, address: &str) -> TransportError {
    match error {
        lost @ LinkStateError::IllegalSessionState => TransportError::ConnectionLost(lost.to_string()),
        LinkStateError::RemoteDetachedWithError(remote)
        | LinkStateError::RemoteClosedWithError(remote) => remote_error(&remote, address),
        other => TransportError::Detached(other.to_string()),
    }
}

fn send_error(error: SendError, address: &str) -> TransportError {
    match error {
        SendError::LinkStateError(error) => link_state_error(error, address),
        other => TransportError::Detached(other.to_string()),
    }
}

fn recv_error(error: RecvError, address: &str) -> TransportError {
    match error {
        RecvError::LinkStateError(error) => link_state_error(error, address),
        other => TransportError::Detached(other.to_string()),
    }
}

fn sender_attach_error(error: SenderAttachError, address: &str) -> TransportError {
    match error {
        lost @ SenderAttachError::IllegalSessionState => {
            TransportError::ConnectionLost(lost.to_string())
        }
        SenderAttachError::RemoteClosedWithError(remote) => remote_error(&remote, address),
        other => TransportError::Detached(other.to_string()),
    }
}

fn receiver_attach_error(error: ReceiverAttachError, address: &str) -> TransportError {
    match error {
        lost @ ReceiverAttachError::IllegalSessionState => {
            TransportError::ConnectionLost(lost.to_string())
        }
        ReceiverAttachError::RemoteClosedWithError(remote) => remote_error(&remote, address),
        other => TransportError::Detached(other.to_string()),
    }
}

#[async_trait]
impl Binding for AmqpBinding {
    async fn connect(&self, options: ConnectOptions<'_>) -> Result<Box<dyn Transport>, TransportError> {
        let mut builder = Connection::builder().container_id(options.container_id);
        if let Some(username) = options.username {
            builder = builder.sasl_profile(SaslProfile::Plain {
                username: username.to_string(),
                password: options.password.unwrap_or_default().to_string(),
            });
        }
        if let Some(idle_timeout) = options.idle_timeout {
            builder = builder.idle_time_out(idle_timeout.as_millis() as u32);
        }

        let connection = builder
            .open(options.url.clone())
            .await
            .map_err(|error| match error {
                OpenError::SaslError { .. } => TransportError::Authentication(error.to_string()),
                _ => TransportError::ConnectionLost(error.to_string()),
            })?;

        Ok(Box::new(AmqpTransport { connection }))
    }
}

struct AmqpTransport {
    connection: ConnectionHandle<()>,
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn begin(&mut self) -> Result<Box<dyn TransportSession>, TransportError> {
        let session = Session::begin(&mut self.connection)
            .await
            .map_err(|error| TransportError::ConnectionLost(error.to_string()))?;
        Ok(Box::new(AmqpSession { session }))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connection
            .close()
            .await
            .map_err(|error| TransportError::ConnectionLost(error.to_string()))
    }
}

struct AmqpSession {
    session: SessionHandle<()>,
}

#[async_trait]
impl TransportSession for AmqpSession {
    async fn attach_sender(
        &mut self,
        name: String,
        destination: &Destination,
    ) -> Result<Box<dyn LinkSender>, TransportError> {
        let target = Target::builder()
            .address(destination.name().to_string())
            .capabilities(capabilities(destination))
            .build();
        let sender = Sender::builder()
            .name(name)
            .target(target)
            .attach(&mut self.session)
            .await
            .map_err(|error| sender_attach_error(error, destination.name()))?;
        Ok(Box::new(AmqpSender {
            sender: Some(sender),
            address: destination.name().to_string(),
        }))
    }

    async fn attach_receiver(
        &mut self,
        name: String,
        destination: &Destination,
        prefetch: u32,
    ) -> Result<Box<dyn LinkReceiver>, TransportError> {
        let source = Source::builder()
            .address(destination.name().to_string())
            .capabilities(capabilities(destination))
            .build();
        let receiver = Receiver::builder()
            .name(name)
            .source(source)
            .credit_mode(CreditMode::Auto(prefetch.max(1)))
            .auto_accept(false)
            .attach(&mut self.session)
            .await
            .map_err(|error| receiver_attach_error(error, destination.name()))?;
        Ok(Box::new(AmqpReceiver {
            receiver: Some(receiver),
            address: destination.name().to_string(),
            next_tag: 0,
            unsettled: HashMap::new(),
        }))
    }

    async fn create_temporary_queue(
        &mut self,
        name: String,
    ) -> Result<(String, Box<dyn LinkSender>), TransportError> {
        let target = Target::builder()
            .dynamic(true)
            .capabilities(vec![Symbol::from(codec::capability(
                DestinationKind::TemporaryQueue,
            ))])
            .build();
        let sender = Sender::builder()
            .name(name)
            .target(target)
            .attach(&mut self.session)
            .await
            .map_err(|error| sender_attach_error(error, "dynamic target"))?;

        let address = sender
            .target()
            .as_ref()
            .and_then(|target| target.address.clone());
        match address {
            Some(address) => {
                let anchor = AmqpSender {
                    sender: Some(sender),
                    address: address.clone(),
                };
                Ok((address, Box::new(anchor)))
            }
            None => {
                let _ = sender.close().await;
                Err(TransportError::Detached(
                    "broker did not assign an address to the dynamic target".to_string(),
                ))
            }
        }
    }

    async fn end(&mut self) -> Result<(), TransportError> {
        self.session
            .end()
            .await
            .map_err(|error| TransportError::ConnectionLost(error.to_string()))
    }
}

struct AmqpSender {
    sender: Option<Sender>,
    address: String,
}

#[async_trait]
impl LinkSender for AmqpSender {
    async fn send(&mut self, message: &Message, settled: bool) -> Result<(), TransportError> {
        let sender = self
            .sender
            .as_mut()
            .ok_or_else(|| TransportError::Detached("sender is closed".to_string()))?;
        let sendable = Sendable::builder()
            .message(codec::encode(message))
            .settled(settled)
            .build();
        let outcome = sender
            .send(sendable)
            .await
            .map_err(|error| send_error(error, &self.address))?;
        outcome
            .accepted_or_else(|outcome| outcome)
            .map(|_| ())
            .map_err(|outcome| TransportError::Rejected(format!("{:?}", outcome)))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.sender.take() {
            Some(sender) => sender
                .close()
                .await
                .map_err(|error| TransportError::Detached(error.to_string())),
            None => Ok(()),
        }
    }
}

struct AmqpReceiver {
    receiver: Option<Receiver>,
    address: String,
    next_tag: DeliveryTag,
    unsettled: HashMap<DeliveryTag, DeliveryInfo>,
}

#[async_trait]
impl LinkReceiver for AmqpReceiver {
    async fn recv(&mut self) -> Result<Inbound, TransportError> {
        let receiver = self
            .receiver
            .as_mut()
            .ok_or_else(|| TransportError::Detached("receiver is closed".to_string()))?;
        let delivery: Delivery<AmqpBody<Value>> = loop {
            match receiver.recv::<AmqpBody<Value>>().await {
                Ok(delivery) => break delivery,
                // The transfer is consumed by the link; keep the link for the next one
                Err(RecvError::MessageDecode(_)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(address = %self.address, "skipping undecodable delivery");
                    #[cfg(feature = "log")]
                    log::warn!("skipping undecodable delivery on {}", self.address);
                }
                Err(error) => return Err(recv_error(error, &self.address)),
            }
        };

        let message = codec::decode(delivery.message().clone());
        self.next_tag += 1;
        let tag = self.next_tag;
        self.unsettled.insert(tag, DeliveryInfo::from(delivery));
        Ok(Inbound { tag, message })
    }

    async fn settle(&mut self, tag: DeliveryTag, disposition: Disposition) -> Result<(), TransportError> {
        let Some(info) = self.unsettled.remove(&tag) else {
            return Ok(());
        };
        let receiver = self
            .receiver
            .as_mut()
            .ok_or_else(|| TransportError::Detached("receiver is closed".to_string()))?;
        let result = match disposition {
            Disposition::Accepted => receiver.accept(info).await,
            Disposition::Released => receiver.release(info).await,
        };
        result.map_err(|error| TransportError::Detached(error.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.unsettled.clear();
        match self.receiver.take() {
            Some(receiver) => receiver
                .close()
                .await
                .map_err(|error| TransportError::Detached(error.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(condition: AmqpError) -> definitions::Error {
        definitions::Error::new(condition, None, None)
    }

    #[test]
    fn lost_session_fails_the_connection() {
        let mapped = link_state_error(LinkStateError::IllegalSessionState, "Q/tutorial");
        assert!(matches!(mapped, TransportError::ConnectionLost(_)));

        let mapped = send_error(
            SendError::LinkStateError(LinkStateError::IllegalSessionState),
            "Q/tutorial",
        );
        assert!(matches!(mapped, TransportError::ConnectionLost(_)));
    }

    #[test]
    fn remote_detach_only_ends_the_link() {
        let mapped = send_error(
            SendError::LinkStateError(LinkStateError::RemoteDetached),
            "Q/tutorial",
        );
        assert!(matches!(mapped, TransportError::Detached(_)));

        let mapped = recv_error(
            RecvError::LinkStateError(LinkStateError::RemoteClosedWithError(remote(
                AmqpError::ResourceLimitExceeded,
            ))),
            "Q/tutorial",
        );
        assert!(matches!(mapped, TransportError::Detached(_)));
    }

    #[test]
    fn undecodable_delivery_is_not_a_connection_failure() {
        let mapped = recv_error(RecvError::MessageDecodeError, "Q/tutorial");
        assert!(matches!(mapped, TransportError::Detached(_)));
    }

    #[test]
    fn not_found_condition_names_the_address() {
        let mapped = send_error(
            SendError::LinkStateError(LinkStateError::RemoteDetachedWithError(remote(
                AmqpError::NotFound,
            ))),
            "#P2P/QTMP/gone",
        );
        assert_eq!(mapped, TransportError::NotFound("#P2P/QTMP/gone".to_string()));

        let mapped = sender_attach_error(
            SenderAttachError::RemoteClosedWithError(remote(AmqpError::NotFound)),
            "Q/missing",
        );
        assert_eq!(mapped, TransportError::NotFound("Q/missing".to_string()));
    }
}
