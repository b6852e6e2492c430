#![deny(missing_docs, missing_debug_implementations)]
#![allow(clippy::result_large_err)]

//! A JMS style messaging layer on top of `fe2o3-amqp`
//!
//! The crate provides connections, sessions, producers and consumers for queues, topics and
//! temporary queues, speaking AMQP 1.0 with the message annotations used by JMS clients so that
//! destination kinds survive a round trip through the broker.
//!
//! ```rust,ignore
//! use fe2o3_amqp_jms::{AckMode, ConnectionFactory, Destination, Message};
//!
//! let factory = ConnectionFactory::new("amqp://localhost:5672")?;
//! let connection = factory.create_connection().await?;
//! let session = connection.create_session(AckMode::AutoAck).await?;
//!
//! let mut producer = session.create_producer(Destination::queue("Q/tutorial")).await?;
//! producer.send(Message::text("Message with String Data")).await?;
//!
//! producer.close().await?;
//! session.close().await?;
//! connection.close().await?;
//! ```
//!
//! # Feature flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `rustls` | `amqps` urls over `rustls` |
//! | `native-tls` | `amqps` urls over `native-tls` |
//! | `tracing` | logging with `tracing` |
//! | `log` | logging with `log` |

pub mod connection;
pub mod consumer;
pub mod destination;
pub mod error;
pub mod factory;
pub mod message;
pub mod producer;
pub mod request_reply;
pub mod resolver;
pub mod session;
pub mod transport;

pub use connection::{Connection, ConnectionState, ExceptionListener};
pub use consumer::{Consumer, MessageListener};
pub use destination::{ConnectionId, Destination, DestinationKind, Queue, TemporaryQueue, Topic};
pub use error::{Error, Result};
pub use factory::{ConnectionFactory, DEFAULT_PREFETCH};
pub use message::{Body, DeliveryMode, Message, PropertyValue};
pub use producer::{Producer, SendOptions};
pub use request_reply::{ReplyOutcome, Replier, Requestor};
pub use resolver::{Endpoint, EndpointKind, Resolver};
pub use session::{AckMode, Session};
pub use transport::loopback::LoopbackBroker;
