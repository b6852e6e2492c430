//! Message envelope: headers, application properties and body

use std::{
    collections::BTreeMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{destination::Destination, error::Result, session::ack::AckHandle};

/// Priority used when none is configured. The broker ignores it.
pub const DEFAULT_PRIORITY: u8 = 4;

/// Time-to-live used when none is configured. Zero means the message never expires.
pub const DEFAULT_TIME_TO_LIVE: Duration = Duration::ZERO;

/// Whether the broker must store the message durably before accepting it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// The send completes only after the broker has durably accepted the message
    #[default]
    Persistent,

    /// Best effort, the send completes once the message is handed to the transport
    NonPersistent,
}

/// Value of an application property or of a map body entry
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Long(i64),
    /// Floating point
    Double(f64),
    /// UTF-8 string
    String(String),
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Long(value as i64)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// Message payload
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    /// No payload
    #[default]
    Empty,

    /// UTF-8 text
    Text(String),

    /// Opaque bytes
    Bytes(Vec<u8>),

    /// String keyed map of primitive values
    Map(BTreeMap<String, PropertyValue>),
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// A message with its headers
///
/// Ownership of a message moves into the producer on send, so a submitted message cannot be
/// changed afterwards. Messages handed out by a consumer carry a handle to the session that
/// delivered them, which [`Message::acknowledge`] uses in client acknowledge mode.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub(crate) message_id: Option<String>,
    pub(crate) correlation_id: Option<String>,
    pub(crate) reply_to: Option<Destination>,
    pub(crate) destination: Option<Destination>,
    pub(crate) delivery_mode: DeliveryMode,
    pub(crate) priority: u8,
    pub(crate) time_to_live: Duration,
    pub(crate) timestamp: Option<i64>,
    pub(crate) expiration: Option<i64>,
    pub(crate) delivery_count: u32,
    pub(crate) properties: BTreeMap<String, PropertyValue>,
    pub(crate) body: Body,
    pub(crate) ack: Option<AckHandle>,
}

impl Message {
    /// Creates a message with the given body and default headers
    pub fn new(body: impl Into<Body>) -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            body: body.into(),
            ..Default::default()
        }
    }

    /// Creates a text message
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Body::Text(text.into()))
    }

    /// Creates a bytes message
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(Body::Bytes(bytes.into()))
    }

    /// Creates a map message
    pub fn map(entries: BTreeMap<String, PropertyValue>) -> Self {
        Self::new(Body::Map(entries))
    }

    /// The body
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// The text if this is a text message
    pub fn text_body(&self) -> Option<&str> {
        match &self.body {
            Body::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Identifier assigned when the message was sent
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Correlation id
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Sets the correlation id
    pub fn set_correlation_id(&mut self, correlation_id: impl Into<String>) {
        self.correlation_id = Some(correlation_id.into());
    }

    /// Builder style [`Message::set_correlation_id`]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.set_correlation_id(correlation_id);
        self
    }

    /// Where replies should be sent
    pub fn reply_to(&self) -> Option<&Destination> {
        self.reply_to.as_ref()
    }

    /// Sets where replies should be sent
    pub fn set_reply_to(&mut self, reply_to: impl Into<Option<Destination>>) {
        self.reply_to = reply_to.into();
    }

    /// Builder style [`Message::set_reply_to`]
    pub fn with_reply_to(mut self, reply_to: impl Into<Destination>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Destination the message was sent to
    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    /// Delivery mode used to send the message
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    /// Priority
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Time-to-live the message was sent with
    pub fn time_to_live(&self) -> Duration {
        self.time_to_live
    }

    /// Send time in milliseconds since the unix epoch
    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    /// Absolute expiry time in milliseconds since the unix epoch, `None` if it never expires
    pub fn expiration(&self) -> Option<i64> {
        self.expiration
    }

    /// Number of earlier delivery attempts
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Whether the message was delivered before
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 0
    }

    /// Application properties
    pub fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    /// Gets an application property
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Sets an application property
    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), value.into());
    }

    /// Builder style [`Message::set_property`]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.set_property(name, value);
        self
    }

    /// Acknowledges this message and every message delivered before it on the same session.
    ///
    /// Only has an effect in [`AckMode::ClientAck`](crate::AckMode::ClientAck). Fails with
    /// [`Error::SessionClosed`](crate::Error::SessionClosed) once the delivering session is
    /// closed.
    pub fn acknowledge(&self) -> Result<()> {
        match &self.ack {
            Some(handle) => handle.acknowledge(),
            None => Ok(()),
        }
    }

    pub(crate) fn is_expired_at(&self, now_millis: i64) -> bool {
        matches!(self.expiration, Some(expiration) if expiration <= now_millis)
    }

    /// Strips everything that only makes sense on the receiving side
    pub(crate) fn prepare_for_send(&mut self) {
        self.ack = None;
        self.delivery_count = 0;
    }
}

/// Time-to-live as carried in the AMQP header, which is a `uint` of milliseconds. Zero means no
/// expiry; longer values are capped.
pub(crate) fn ttl_millis(ttl: Duration) -> Option<u32> {
    match ttl.is_zero() {
        true => None,
        false => Some(u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX)),
    }
}

/// Absolute expiry time matching the header ttl
pub(crate) fn expiration_after(now_millis: i64, ttl: Duration) -> Option<i64> {
    ttl_millis(ttl).and_then(|ttl| now_millis.checked_add(i64::from(ttl)))
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_defaults() {
        let message = Message::text("Message with String Data");
        assert_eq!(message.text_body(), Some("Message with String Data"));
        assert_eq!(message.priority(), DEFAULT_PRIORITY);
        assert_eq!(message.time_to_live(), DEFAULT_TIME_TO_LIVE);
        assert_eq!(message.delivery_mode(), DeliveryMode::Persistent);
        assert!(message.message_id().is_none());
        assert!(!message.redelivered());
    }

    #[test]
    fn acknowledge_without_session_is_noop() {
        assert!(Message::text("x").acknowledge().is_ok());
    }

    #[test]
    fn huge_ttl_is_capped_not_wrapped() {
        assert_eq!(ttl_millis(Duration::ZERO), None);
        assert_eq!(ttl_millis(Duration::from_secs(60)), Some(60_000));
        assert_eq!(ttl_millis(Duration::MAX), Some(u32::MAX));

        let now = 1_700_000_000_000;
        let expiration = expiration_after(now, Duration::MAX).unwrap();
        assert_eq!(expiration, now + u32::MAX as i64);
        assert!(expiration > now);
        assert_eq!(expiration_after(i64::MAX, Duration::from_secs(1)), None);
    }

    #[test]
    fn expiry() {
        let mut message = Message::text("x");
        assert!(!message.is_expired_at(i64::MAX));
        message.expiration = Some(1_000);
        assert!(message.is_expired_at(1_000));
        assert!(!message.is_expired_at(999));
    }

    #[test]
    fn properties_and_headers() {
        let message = Message::bytes(vec![1, 2, 3])
            .with_correlation_id("abc")
            .with_reply_to(Destination::queue("replies"))
            .with_property("count", 3)
            .with_property("flag", true);
        assert_eq!(message.correlation_id(), Some("abc"));
        assert_eq!(message.reply_to(), Some(&Destination::queue("replies")));
        assert_eq!(message.property("count"), Some(&PropertyValue::Long(3)));
        assert_eq!(message.property("flag"), Some(&PropertyValue::Bool(true)));
        assert_eq!(message.body(), &Body::Bytes(vec![1, 2, 3]));
        assert!(message.text_body().is_none());
    }
}
