//! Mapping between [`Message`] and AMQP 1.0 message sections
//!
//! The mapping follows the JMS-over-AMQP conventions so that destination kinds survive the trip
//! through the broker. In particular a `reply-to` that names a temporary queue is tagged with
//! `x-opt-jms-reply-to = 2` and decodes back into a [`TemporaryQueue`](crate::TemporaryQueue).

use std::{collections::BTreeMap, time::Duration};

use fe2o3_amqp_types::{
    messaging::{
        annotations::OwnedKey, AmqpValue, ApplicationProperties, Body as AmqpBody, Data, Header,
        Message as AmqpMessage, MessageAnnotations, MessageId, Priority, Properties,
    },
    primitives::{Binary, OrderedMap, SimpleValue, Symbol, Timestamp, Value},
};

use crate::{
    destination::{Destination, DestinationKind},
    message::{ttl_millis, Body, DeliveryMode, Message, PropertyValue, DEFAULT_PRIORITY},
};

/// Message annotation carrying the body type
pub const JMS_MSG_TYPE: &str = "x-opt-jms-msg-type";

/// Message annotation carrying the kind of the `to` address
pub const JMS_DEST: &str = "x-opt-jms-dest";

/// Message annotation carrying the kind of the `reply-to` address
pub const JMS_REPLY_TO: &str = "x-opt-jms-reply-to";

const MSG_TYPE_MESSAGE: i8 = 0;
const MSG_TYPE_MAP: i8 = 2;
const MSG_TYPE_BYTES: i8 = 3;
const MSG_TYPE_TEXT: i8 = 5;

const DEST_QUEUE: i8 = 0;
const DEST_TOPIC: i8 = 1;
const DEST_TEMP_QUEUE: i8 = 2;

const OCTET_STREAM: &str = "application/octet-stream";

/// Terminus capability advertised for a destination kind
pub fn capability(kind: DestinationKind) -> &'static str {
    match kind {
        DestinationKind::Queue => "queue",
        DestinationKind::Topic => "topic",
        DestinationKind::TemporaryQueue => "temporary-queue",
    }
}

fn kind_to_byte(kind: DestinationKind) -> i8 {
    match kind {
        DestinationKind::Queue => DEST_QUEUE,
        DestinationKind::Topic => DEST_TOPIC,
        DestinationKind::TemporaryQueue => DEST_TEMP_QUEUE,
    }
}

fn byte_to_kind(value: i64) -> DestinationKind {
    match value as i8 {
        DEST_TOPIC => DestinationKind::Topic,
        DEST_TEMP_QUEUE => DestinationKind::TemporaryQueue,
        // temporary topics are not supported and fall back to a queue as well
        _ => DestinationKind::Queue,
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Byte(v) => Some(*v as i64),
        Value::Ubyte(v) => Some(*v as i64),
        Value::Short(v) => Some(*v as i64),
        Value::Int(v) => Some(*v as i64),
        Value::Long(v) => Some(*v),
        _ => None,
    }
}

fn to_amqp_value(value: &PropertyValue) -> Value {
    match value {
        PropertyValue::Null => Value::Null,
        PropertyValue::Bool(v) => Value::Bool(*v),
        PropertyValue::Long(v) => Value::Long(*v),
        PropertyValue::Double(v) => Value::from(*v),
        PropertyValue::String(v) => Value::String(v.clone()),
    }
}

fn from_amqp_value(value: Value) -> PropertyValue {
    match value {
        Value::Bool(v) => PropertyValue::Bool(v),
        Value::Double(v) => PropertyValue::Double(v.into_inner()),
        Value::Float(v) => PropertyValue::Double(v.into_inner() as f64),
        Value::String(v) => PropertyValue::String(v),
        Value::Symbol(v) => PropertyValue::String(v.0),
        other => match value_as_i64(&other) {
            Some(v) => PropertyValue::Long(v),
            None => PropertyValue::Null,
        },
    }
}

fn to_simple_value(value: &PropertyValue) -> SimpleValue {
    match value {
        PropertyValue::Null => SimpleValue::Null,
        PropertyValue::Bool(v) => SimpleValue::from(*v),
        PropertyValue::Long(v) => SimpleValue::from(*v),
        PropertyValue::Double(v) => SimpleValue::from(*v),
        PropertyValue::String(v) => SimpleValue::String(v.clone()),
    }
}

fn from_simple_value(value: SimpleValue) -> PropertyValue {
    match value {
        SimpleValue::Bool(v) => PropertyValue::Bool(v),
        SimpleValue::Byte(v) => PropertyValue::Long(v as i64),
        SimpleValue::Short(v) => PropertyValue::Long(v as i64),
        SimpleValue::Int(v) => PropertyValue::Long(v as i64),
        SimpleValue::Long(v) => PropertyValue::Long(v),
        SimpleValue::Ubyte(v) => PropertyValue::Long(v as i64),
        SimpleValue::Ushort(v) => PropertyValue::Long(v as i64),
        SimpleValue::Uint(v) => PropertyValue::Long(v as i64),
        SimpleValue::Double(v) => PropertyValue::Double(v.into_inner()),
        SimpleValue::Float(v) => PropertyValue::Double(v.into_inner() as f64),
        SimpleValue::String(v) => PropertyValue::String(v),
        SimpleValue::Symbol(v) => PropertyValue::String(v.0),
        _ => PropertyValue::Null,
    }
}

fn message_id_to_string(id: MessageId) -> String {
    match id {
        MessageId::String(id) => id,
        other => format!("{:?}", other),
    }
}

/// Encodes a message into its AMQP 1.0 representation
pub fn encode(message: &Message) -> AmqpMessage<AmqpBody<Value>> {
    let ttl = ttl_millis(message.time_to_live);
    let header = Header {
        durable: message.delivery_mode == DeliveryMode::Persistent,
        priority: Priority(message.priority),
        ttl,
        ..Default::default()
    };

    let mut annotations = MessageAnnotations::builder();
    let msg_type = match &message.body {
        Body::Empty => MSG_TYPE_MESSAGE,
        Body::Text(_) => MSG_TYPE_TEXT,
        Body::Bytes(_) => MSG_TYPE_BYTES,
        Body::Map(_) => MSG_TYPE_MAP,
    };
    annotations = annotations.insert(Symbol::from(JMS_MSG_TYPE), Value::Byte(msg_type));
    if let Some(destination) = &message.destination {
        annotations = annotations.insert(
            Symbol::from(JMS_DEST),
            Value::Byte(kind_to_byte(destination.kind())),
        );
    }
    if let Some(reply_to) = &message.reply_to {
        annotations = annotations.insert(
            Symbol::from(JMS_REPLY_TO),
            Value::Byte(kind_to_byte(reply_to.kind())),
        );
    }

    let properties = Properties {
        message_id: message.message_id.clone().map(MessageId::String),
        to: message.destination.as_ref().map(|d| d.name().to_string()),
        reply_to: message.reply_to.as_ref().map(|d| d.name().to_string()),
        correlation_id: message.correlation_id.clone().map(MessageId::String),
        content_type: match message.body {
            Body::Bytes(_) => Some(Symbol::from(OCTET_STREAM)),
            _ => None,
        },
        creation_time: message.timestamp.map(Timestamp::from_milliseconds),
        absolute_expiry_time: message.expiration.map(Timestamp::from_milliseconds),
        ..Default::default()
    };

    let application_properties = if message.properties.is_empty() {
        None
    } else {
        let mut builder = ApplicationProperties::builder();
        for (key, value) in &message.properties {
            builder = builder.insert(key.clone(), to_simple_value(value));
        }
        Some(builder.build())
    };

    let body = match &message.body {
        Body::Empty => AmqpBody::Empty,
        Body::Text(text) => AmqpBody::Value(AmqpValue(Value::String(text.clone()))),
        Body::Bytes(bytes) => AmqpBody::from(Data(Binary::from(bytes.clone()))),
        Body::Map(entries) => {
            let mut map = OrderedMap::new();
            for (key, value) in entries {
                map.insert(Value::String(key.clone()), to_amqp_value(value));
            }
            AmqpBody::Value(AmqpValue(Value::Map(map)))
        }
    };

    AmqpMessage {
        header: Some(header),
        delivery_annotations: None,
        message_annotations: Some(annotations.build()),
        properties: Some(properties),
        application_properties,
        body,
        footer: None,
    }
}

/// Decodes an AMQP 1.0 message received from the broker
pub fn decode(message: AmqpMessage<AmqpBody<Value>>) -> Message {
    let mut msg_type = None;
    let mut dest_kind = DestinationKind::Queue;
    let mut reply_to_kind = DestinationKind::Queue;
    if let Some(annotations) = message.message_annotations {
        for (key, value) in annotations.0.iter() {
            let OwnedKey::Symbol(symbol) = key else {
                continue;
            };
            let Some(value) = value_as_i64(value) else {
                continue;
            };
            match symbol.0.as_str() {
                JMS_MSG_TYPE => msg_type = Some(value as i8),
                JMS_DEST => dest_kind = byte_to_kind(value),
                JMS_REPLY_TO => reply_to_kind = byte_to_kind(value),
                _ => {}
            }
        }
    }

    let mut decoded = Message {
        priority: DEFAULT_PRIORITY,
        ..Default::default()
    };

    if let Some(header) = message.header {
        decoded.delivery_mode = match header.durable {
            true => DeliveryMode::Persistent,
            false => DeliveryMode::NonPersistent,
        };
        decoded.priority = header.priority.0;
        decoded.time_to_live = Duration::from_millis(header.ttl.unwrap_or(0) as u64);
        decoded.delivery_count = header.delivery_count;
    } else {
        decoded.delivery_mode = DeliveryMode::NonPersistent;
    }

    if let Some(properties) = message.properties {
        decoded.message_id = properties.message_id.map(message_id_to_string);
        decoded.correlation_id = properties.correlation_id.map(message_id_to_string);
        decoded.destination = properties
            .to
            .map(|address| Destination::from_parts(address, dest_kind));
        decoded.reply_to = properties
            .reply_to
            .map(|address| Destination::from_parts(address, reply_to_kind));
        decoded.timestamp = properties.creation_time.map(|t| t.milliseconds());
        decoded.expiration = properties.absolute_expiry_time.map(|t| t.milliseconds());
    }

    if let Some(application_properties) = message.application_properties {
        decoded.properties = application_properties
            .0
            .into_iter()
            .map(|(key, value)| (key, from_simple_value(value)))
            .collect();
    }

    decoded.body = match message.body {
        AmqpBody::Empty => Body::Empty,
        AmqpBody::Value(value) => match value.0 {
            Value::String(text) => Body::Text(text),
            Value::Binary(bytes) => Body::Bytes(bytes.into_vec()),
            Value::Map(map) => {
                let entries: BTreeMap<String, PropertyValue> = map
                    .into_iter()
                    .filter_map(|(key, value)| match key {
                        Value::String(key) => Some((key, from_amqp_value(value))),
                        Value::Symbol(key) => Some((key.0, from_amqp_value(value))),
                        _ => None,
                    })
                    .collect();
                Body::Map(entries)
            }
            Value::Null => Body::Empty,
            other => Body::Text(format!("{:?}", other)),
        },
        body @ AmqpBody::Data(_) => match body.try_into_data() {
            Ok(sections) => {
                let bytes: Vec<u8> = sections.flat_map(|binary| binary.into_vec()).collect();
                match msg_type {
                    Some(MSG_TYPE_TEXT) => match String::from_utf8(bytes) {
                        Ok(text) => Body::Text(text),
                        Err(err) => Body::Bytes(err.into_bytes()),
                    },
                    _ => Body::Bytes(bytes),
                }
            }
            Err(_) => Body::Empty,
        },
        AmqpBody::Sequence(_) => Body::Empty,
    };

    decoded
}
