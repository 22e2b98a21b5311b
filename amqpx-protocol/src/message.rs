//! Message sections and the [`Message`] type.
//!
//! A message on the wire is a sequence of described sections in a fixed
//! order: header, delivery-annotations, message-annotations, properties,
//! application-properties, body (one amqp-value, or one or more data or
//! amqp-sequence sections) and footer. Every section is optional.
//!
//! Application properties map string keys to simple (non-compound) values.
//! A property explicitly set to null is present; it is distinct from a key
//! that was never set.

use crate::codec;
use crate::composite::{split_described, Fields, FromValue, ListBuilder};
use crate::error::ProtocolError;
use crate::types::{Symbol, Value};
use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub const HEADER: u64 = 0x70;
pub const DELIVERY_ANNOTATIONS: u64 = 0x71;
pub const MESSAGE_ANNOTATIONS: u64 = 0x72;
pub const PROPERTIES: u64 = 0x73;
pub const APPLICATION_PROPERTIES: u64 = 0x74;
pub const DATA: u64 = 0x75;
pub const AMQP_SEQUENCE: u64 = 0x76;
pub const AMQP_VALUE: u64 = 0x77;
pub const FOOTER: u64 = 0x78;

/// Message format carried in transfer frames.
pub const MESSAGE_FORMAT: u32 = 0;

pub const DEFAULT_PRIORITY: u8 = 4;

/// Annotation and footer maps (symbol or ulong keys), carried as received.
pub type Annotations = Vec<(Value, Value)>;

/// The header section: transport-level delivery hints.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub durable: bool,
    pub priority: u8,
    /// Time to live in milliseconds.
    pub ttl: Option<u32>,
    pub first_acquirer: bool,
    pub delivery_count: u32,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            durable: false,
            priority: DEFAULT_PRIORITY,
            ttl: None,
            first_acquirer: false,
            delivery_count: 0,
        }
    }
}

impl Header {
    fn to_value(&self) -> Value {
        ListBuilder::new()
            .non_default(self.durable, false)
            .non_default(self.priority, DEFAULT_PRIORITY)
            .field(self.ttl)
            .non_default(self.first_acquirer, false)
            .non_default(self.delivery_count, 0)
            .describe(HEADER)
    }

    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut f = Fields::from_value(value)?;
        Ok(Self {
            durable: f.or_default()?,
            priority: f.optional()?.unwrap_or(DEFAULT_PRIORITY),
            ttl: f.optional()?,
            first_acquirer: f.or_default()?,
            delivery_count: f.or_default()?,
        })
    }
}

/// A message or correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Ulong(u64),
    Uuid(Uuid),
    Binary(Bytes),
    String(String),
}

impl From<MessageId> for Value {
    fn from(id: MessageId) -> Self {
        match id {
            MessageId::Ulong(v) => Value::Ulong(v),
            MessageId::Uuid(v) => Value::Uuid(v),
            MessageId::Binary(v) => Value::Binary(v),
            MessageId::String(v) => Value::String(v),
        }
    }
}

impl FromValue for MessageId {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Ulong(v) => Ok(MessageId::Ulong(v)),
            Value::Uuid(v) => Ok(MessageId::Uuid(v)),
            Value::Binary(v) => Ok(MessageId::Binary(v)),
            Value::String(v) => Ok(MessageId::String(v)),
            other => Err(ProtocolError::UnexpectedType {
                expected: "message id",
                found: other.type_name(),
            }),
        }
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        MessageId::String(value.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Ulong(v) => write!(f, "{}", v),
            MessageId::Uuid(v) => write!(f, "{}", v),
            MessageId::Binary(v) => write!(f, "{:02x?}", v.as_ref()),
            MessageId::String(v) => f.write_str(v),
        }
    }
}

/// The properties section: immutable, application-visible metadata.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Properties {
    pub message_id: Option<MessageId>,
    pub user_id: Option<Bytes>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<MessageId>,
    pub content_type: Option<Symbol>,
    pub content_encoding: Option<Symbol>,
    pub absolute_expiry_time: Option<DateTime<Utc>>,
    pub creation_time: Option<DateTime<Utc>>,
    pub group_id: Option<String>,
    pub group_sequence: Option<u32>,
    pub reply_to_group_id: Option<String>,
}

fn to_datetime(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, ProtocolError> {
    ms.map(|ms| {
        DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| ProtocolError::InvalidSection(format!("timestamp {} out of range", ms)))
    })
    .transpose()
}

impl Properties {
    fn to_value(&self) -> Value {
        ListBuilder::new()
            .field(self.message_id.clone())
            .field(self.user_id.clone())
            .field(self.to.clone())
            .field(self.subject.clone())
            .field(self.reply_to.clone())
            .field(self.correlation_id.clone())
            .field(self.content_type.clone())
            .field(self.content_encoding.clone())
            .timestamp(self.absolute_expiry_time.map(|t| t.timestamp_millis()))
            .timestamp(self.creation_time.map(|t| t.timestamp_millis()))
            .field(self.group_id.clone())
            .field(self.group_sequence)
            .field(self.reply_to_group_id.clone())
            .describe(PROPERTIES)
    }

    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut f = Fields::from_value(value)?;
        Ok(Self {
            message_id: f.optional()?,
            user_id: f.optional()?,
            to: f.optional()?,
            subject: f.optional()?,
            reply_to: f.optional()?,
            correlation_id: f.optional()?,
            content_type: f.optional()?,
            content_encoding: f.optional()?,
            absolute_expiry_time: to_datetime(f.timestamp()?)?,
            creation_time: to_datetime(f.timestamp()?)?,
            group_id: f.optional()?,
            group_sequence: f.optional()?,
            reply_to_group_id: f.optional()?,
        })
    }
}

/// The message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// A single amqp-value section.
    Value(Value),
    /// One or more data sections.
    Data(Vec<Bytes>),
    /// One or more amqp-sequence sections.
    Sequence(Vec<Vec<Value>>),
}

impl Default for Body {
    fn default() -> Self {
        Body::Value(Value::Null)
    }
}

/// An AMQP message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub header: Option<Header>,
    pub delivery_annotations: Option<Annotations>,
    pub message_annotations: Option<Annotations>,
    pub properties: Option<Properties>,
    application_properties: BTreeMap<String, Value>,
    pub body: Body,
    pub footer: Option<Annotations>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a message whose body is a single string value.
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            body: Body::Value(Value::String(text.into())),
            ..Default::default()
        }
    }

    /// Returns the text body, or `None` when the body is not a string
    /// (including an explicit null body).
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            Body::Value(Value::String(text)) => Some(text),
            _ => None,
        }
    }

    /// Sets the body to a string value, or to null.
    pub fn set_text(&mut self, text: Option<String>) {
        self.body = Body::Value(Value::from(text));
    }

    pub fn header_mut(&mut self) -> &mut Header {
        self.header.get_or_insert_with(Header::default)
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        self.properties.get_or_insert_with(Properties::default)
    }

    pub fn is_durable(&self) -> bool {
        self.header.as_ref().map(|h| h.durable).unwrap_or(false)
    }

    // -- application properties ------------------------------------------

    /// Sets an application property. Compound values are rejected.
    pub fn set_property(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), ProtocolError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ProtocolError::InvalidPropertyName(name));
        }
        let value = value.into();
        if value.is_compound() {
            return Err(ProtocolError::UnexpectedType {
                expected: "simple property value",
                found: value.type_name(),
            });
        }
        self.application_properties.insert(name, value);
        Ok(())
    }

    /// Sets a string property; `None` stores an explicit null.
    pub fn set_string_property(
        &mut self,
        name: impl Into<String>,
        value: Option<&str>,
    ) -> Result<(), ProtocolError> {
        self.set_property(name, value)
    }

    pub fn property_exists(&self, name: &str) -> bool {
        self.application_properties.contains_key(name)
    }

    /// Returns the raw property value, `Some(&Value::Null)` for a null one.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.application_properties.get(name)
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.application_properties.keys().map(String::as_str)
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.application_properties.remove(name)
    }

    pub fn clear_properties(&mut self) {
        self.application_properties.clear();
    }

    fn typed<T>(
        &self,
        name: &str,
        requested: &'static str,
        convert: impl FnOnce(&Value) -> Option<T>,
    ) -> Result<Option<T>, ProtocolError> {
        match self.application_properties.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => convert(value).map(Some).ok_or_else(|| {
                ProtocolError::PropertyConversion {
                    key: name.to_string(),
                    found: value.type_name(),
                    requested,
                }
            }),
        }
    }

    pub fn bool_property(&self, name: &str) -> Result<Option<bool>, ProtocolError> {
        self.typed(name, "boolean", |value| match value {
            Value::Boolean(v) => Some(*v),
            Value::String(s) => Some(s.eq_ignore_ascii_case("true")),
            _ => None,
        })
    }

    pub fn byte_property(&self, name: &str) -> Result<Option<i8>, ProtocolError> {
        self.typed(name, "byte", |value| match value {
            Value::Byte(v) => Some(*v),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn short_property(&self, name: &str) -> Result<Option<i16>, ProtocolError> {
        self.typed(name, "short", |value| match value {
            Value::Byte(v) => Some(*v as i16),
            Value::Short(v) => Some(*v),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn int_property(&self, name: &str) -> Result<Option<i32>, ProtocolError> {
        self.typed(name, "int", |value| match value {
            Value::Byte(v) => Some(*v as i32),
            Value::Short(v) => Some(*v as i32),
            Value::Int(v) => Some(*v),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn long_property(&self, name: &str) -> Result<Option<i64>, ProtocolError> {
        self.typed(name, "long", |value| match value {
            Value::Byte(v) => Some(*v as i64),
            Value::Short(v) => Some(*v as i64),
            Value::Int(v) => Some(*v as i64),
            Value::Long(v) => Some(*v),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn float_property(&self, name: &str) -> Result<Option<f32>, ProtocolError> {
        self.typed(name, "float", |value| match value {
            Value::Float(v) => Some(*v),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn double_property(&self, name: &str) -> Result<Option<f64>, ProtocolError> {
        self.typed(name, "double", |value| match value {
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    /// Reads any simple property as a string.
    pub fn string_property(&self, name: &str) -> Result<Option<String>, ProtocolError> {
        self.typed(name, "string", |value| match value {
            Value::String(s) => Some(s.clone()),
            Value::Symbol(s) => Some(s.to_string()),
            Value::Boolean(v) => Some(v.to_string()),
            Value::Ubyte(v) => Some(v.to_string()),
            Value::Ushort(v) => Some(v.to_string()),
            Value::Uint(v) => Some(v.to_string()),
            Value::Ulong(v) => Some(v.to_string()),
            Value::Byte(v) => Some(v.to_string()),
            Value::Short(v) => Some(v.to_string()),
            Value::Int(v) => Some(v.to_string()),
            Value::Long(v) => Some(v.to_string()),
            Value::Float(v) => Some(v.to_string()),
            Value::Double(v) => Some(v.to_string()),
            Value::Char(v) => Some(v.to_string()),
            Value::Timestamp(v) => Some(v.to_string()),
            Value::Uuid(v) => Some(v.to_string()),
            _ => None,
        })
    }

    // -- encoding ----------------------------------------------------------

    /// Encodes all present sections in wire order.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        if let Some(header) = &self.header {
            codec::encode(&header.to_value(), &mut buf)?;
        }
        if let Some(annotations) = &self.delivery_annotations {
            encode_map_section(DELIVERY_ANNOTATIONS, annotations, &mut buf)?;
        }
        if let Some(annotations) = &self.message_annotations {
            encode_map_section(MESSAGE_ANNOTATIONS, annotations, &mut buf)?;
        }
        if let Some(properties) = &self.properties {
            codec::encode(&properties.to_value(), &mut buf)?;
        }
        if !self.application_properties.is_empty() {
            let entries = self
                .application_properties
                .iter()
                .map(|(k, v)| (Value::String(k.clone()), v.clone()))
                .collect();
            codec::encode(
                &Value::described(APPLICATION_PROPERTIES, Value::Map(entries)),
                &mut buf,
            )?;
        }
        match &self.body {
            Body::Data(chunks) if !chunks.is_empty() => {
                for chunk in chunks {
                    codec::encode(&Value::described(DATA, Value::Binary(chunk.clone())), &mut buf)?;
                }
            }
            Body::Sequence(sequences) if !sequences.is_empty() => {
                for sequence in sequences {
                    codec::encode(
                        &Value::described(AMQP_SEQUENCE, Value::List(sequence.clone())),
                        &mut buf,
                    )?;
                }
            }
            Body::Value(value) => {
                codec::encode(&Value::described(AMQP_VALUE, value.clone()), &mut buf)?;
            }
            // An empty data or sequence body still needs a body section.
            _ => codec::encode(&Value::described(AMQP_VALUE, Value::Null), &mut buf)?,
        }
        if let Some(footer) = &self.footer {
            encode_map_section(FOOTER, footer, &mut buf)?;
        }
        Ok(buf.freeze())
    }

    /// Decodes a message from the concatenated transfer payload.
    pub fn decode(mut bytes: Bytes) -> Result<Self, ProtocolError> {
        if bytes.is_empty() {
            return Err(ProtocolError::InvalidSection("empty message".into()));
        }
        let mut message = Message::default();
        let mut body: Option<Body> = None;
        let mut last = 0u64;

        while bytes.has_remaining() {
            let (code, value) = split_described(codec::decode(&mut bytes)?)?;
            let repeatable = code == DATA || code == AMQP_SEQUENCE;
            if code < last || (code == last && !repeatable) {
                return Err(ProtocolError::InvalidSection(format!(
                    "section {:#x} out of order",
                    code
                )));
            }
            last = code;

            match code {
                HEADER => message.header = Some(Header::from_value(value)?),
                DELIVERY_ANNOTATIONS => message.delivery_annotations = Some(map_entries(value)?),
                MESSAGE_ANNOTATIONS => message.message_annotations = Some(map_entries(value)?),
                PROPERTIES => message.properties = Some(Properties::from_value(value)?),
                APPLICATION_PROPERTIES => {
                    message.application_properties = application_properties(value)?
                }
                DATA => {
                    let chunk = Bytes::from_value(value)?;
                    match &mut body {
                        None => body = Some(Body::Data(vec![chunk])),
                        Some(Body::Data(chunks)) => chunks.push(chunk),
                        Some(_) => return Err(mixed_body()),
                    }
                }
                AMQP_SEQUENCE => {
                    let items = match value {
                        Value::List(items) => items,
                        other => {
                            return Err(ProtocolError::UnexpectedType {
                                expected: "list",
                                found: other.type_name(),
                            })
                        }
                    };
                    match &mut body {
                        None => body = Some(Body::Sequence(vec![items])),
                        Some(Body::Sequence(sequences)) => sequences.push(items),
                        Some(_) => return Err(mixed_body()),
                    }
                }
                AMQP_VALUE => {
                    if body.is_some() {
                        return Err(mixed_body());
                    }
                    body = Some(Body::Value(value));
                }
                FOOTER => message.footer = Some(map_entries(value)?),
                other => {
                    return Err(ProtocolError::UnknownDescriptor(format!(
                        "section {:#x}",
                        other
                    )))
                }
            }
        }

        message.body = body.unwrap_or_default();
        Ok(message)
    }
}

fn mixed_body() -> ProtocolError {
    ProtocolError::InvalidSection("body sections of different kinds".into())
}

fn encode_map_section(
    code: u64,
    entries: &Annotations,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    codec::encode(&Value::described(code, Value::Map(entries.clone())), buf)
}

fn map_entries(value: Value) -> Result<Annotations, ProtocolError> {
    match value {
        Value::Map(entries) => Ok(entries),
        Value::Null => Ok(Vec::new()),
        other => Err(ProtocolError::UnexpectedType {
            expected: "map",
            found: other.type_name(),
        }),
    }
}

fn application_properties(value: Value) -> Result<BTreeMap<String, Value>, ProtocolError> {
    let mut properties = BTreeMap::new();
    for (key, value) in map_entries(value)? {
        let key = match key {
            Value::String(key) => key,
            other => {
                return Err(ProtocolError::InvalidSection(format!(
                    "application property key of type {}",
                    other.type_name()
                )))
            }
        };
        if value.is_compound() {
            return Err(ProtocolError::InvalidSection(format!(
                "application property {} has compound type {}",
                key,
                value.type_name()
            )));
        }
        if properties.insert(key.clone(), value).is_some() {
            return Err(ProtocolError::InvalidSection(format!(
                "duplicate application property {}",
                key
            )));
        }
    }
    Ok(properties)
}
