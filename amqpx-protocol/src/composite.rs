//! Helpers for described list types (performatives, sections, outcomes).
//!
//! Composite types are encoded as a described list. Trailing null fields
//! are dropped on encode and fields missing from the end of a received
//! list read as null, so both directions agree on defaults.

use crate::error::ProtocolError;
use crate::types::{Descriptor, Symbol, Value};
use bytes::Bytes;

/// Numeric descriptors and their symbolic aliases.
const DESCRIPTORS: &[(u64, &str)] = &[
    (0x10, "amqp:open:list"),
    (0x11, "amqp:begin:list"),
    (0x12, "amqp:attach:list"),
    (0x13, "amqp:flow:list"),
    (0x14, "amqp:transfer:list"),
    (0x15, "amqp:disposition:list"),
    (0x16, "amqp:detach:list"),
    (0x17, "amqp:end:list"),
    (0x18, "amqp:close:list"),
    (0x1d, "amqp:error:list"),
    (0x23, "amqp:received:list"),
    (0x24, "amqp:accepted:list"),
    (0x25, "amqp:rejected:list"),
    (0x26, "amqp:released:list"),
    (0x27, "amqp:modified:list"),
    (0x28, "amqp:source:list"),
    (0x29, "amqp:target:list"),
    (0x40, "amqp:sasl-mechanisms:list"),
    (0x41, "amqp:sasl-init:list"),
    (0x42, "amqp:sasl-challenge:list"),
    (0x43, "amqp:sasl-response:list"),
    (0x44, "amqp:sasl-outcome:list"),
    (0x70, "amqp:header:list"),
    (0x71, "amqp:delivery-annotations:map"),
    (0x72, "amqp:message-annotations:map"),
    (0x73, "amqp:properties:list"),
    (0x74, "amqp:application-properties:map"),
    (0x75, "amqp:data:binary"),
    (0x76, "amqp:amqp-sequence:list"),
    (0x77, "amqp:amqp-value:*"),
    (0x78, "amqp:footer:map"),
];

/// Resolves a descriptor to its numeric code.
pub fn descriptor_code(descriptor: &Descriptor) -> Result<u64, ProtocolError> {
    match descriptor {
        Descriptor::Code(code) => Ok(*code),
        Descriptor::Symbol(symbol) => DESCRIPTORS
            .iter()
            .find(|(_, name)| *name == symbol.as_str())
            .map(|(code, _)| *code)
            .ok_or_else(|| ProtocolError::UnknownDescriptor(symbol.to_string())),
    }
}

/// Splits a described value into its numeric code and inner value.
pub fn split_described(value: Value) -> Result<(u64, Value), ProtocolError> {
    match value {
        Value::Described(described) => {
            let code = descriptor_code(&described.descriptor)?;
            Ok((code, described.value))
        }
        other => Err(ProtocolError::UnexpectedType {
            expected: "described",
            found: other.type_name(),
        }),
    }
}

/// Unwraps a described list with the expected code into its fields.
pub fn expect_list(value: Value, code: u64) -> Result<Fields, ProtocolError> {
    let (found, inner) = split_described(value)?;
    if found != code {
        return Err(ProtocolError::UnknownDescriptor(format!("{:#x}", found)));
    }
    Fields::from_value(inner)
}

/// Conversion from a decoded field value.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, ProtocolError>;
}

fn mismatch(expected: &'static str, value: &Value) -> ProtocolError {
    ProtocolError::UnexpectedType {
        expected,
        found: value.type_name(),
    }
}

macro_rules! impl_from_value {
    ($($ty:ty => $variant:ident, $name:literal);* $(;)?) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self, ProtocolError> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(mismatch($name, &other)),
                    }
                }
            }
        )*
    };
}

impl_from_value! {
    bool => Boolean, "boolean";
    u8 => Ubyte, "ubyte";
    u16 => Ushort, "ushort";
    u32 => Uint, "uint";
    u64 => Ulong, "ulong";
    String => String, "string";
    Symbol => Symbol, "symbol";
    Bytes => Binary, "binary";
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        Ok(value)
    }
}

/// A "multiple" field: a single value or an array of values.
impl FromValue for Vec<Symbol> {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Symbol(symbol) => Ok(vec![symbol]),
            Value::Array(items) => items.into_iter().map(Symbol::from_value).collect(),
            other => Err(mismatch("symbol or symbol array", &other)),
        }
    }
}

/// Sequential reader over the fields of a received list.
pub struct Fields {
    items: std::vec::IntoIter<Value>,
}

impl Fields {
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::List(items) => Ok(Self {
                items: items.into_iter(),
            }),
            other => Err(mismatch("list", &other)),
        }
    }

    /// Next raw field; missing trailing fields read as null.
    pub fn next_value(&mut self) -> Value {
        self.items.next().unwrap_or(Value::Null)
    }

    pub fn optional<T: FromValue>(&mut self) -> Result<Option<T>, ProtocolError> {
        match self.next_value() {
            Value::Null => Ok(None),
            value => T::from_value(value).map(Some),
        }
    }

    pub fn required<T: FromValue>(&mut self, name: &'static str) -> Result<T, ProtocolError> {
        self.optional()?.ok_or(ProtocolError::MissingField(name))
    }

    pub fn or_default<T: FromValue + Default>(&mut self) -> Result<T, ProtocolError> {
        Ok(self.optional()?.unwrap_or_default())
    }

    /// A "multiple" symbol field; null reads as empty.
    pub fn symbols(&mut self) -> Result<Vec<Symbol>, ProtocolError> {
        self.or_default()
    }

    pub fn timestamp(&mut self) -> Result<Option<i64>, ProtocolError> {
        match self.next_value() {
            Value::Null => Ok(None),
            Value::Timestamp(ms) => Ok(Some(ms)),
            other => Err(mismatch("timestamp", &other)),
        }
    }
}

/// Builds the field list of a composite type.
#[derive(Default)]
pub struct ListBuilder {
    items: Vec<Value>,
}

impl ListBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, value: impl Into<Value>) -> Self {
        self.items.push(value.into());
        self
    }

    /// Writes `value`, or null when it equals the field default.
    pub fn non_default<T: Into<Value> + PartialEq>(self, value: T, default: T) -> Self {
        if value == default {
            self.field(Value::Null)
        } else {
            self.field(value)
        }
    }

    /// Writes a "multiple" symbol field; empty writes null.
    pub fn symbols(self, symbols: &[Symbol]) -> Self {
        if symbols.is_empty() {
            self.field(Value::Null)
        } else {
            self.field(Value::Array(
                symbols.iter().cloned().map(Value::Symbol).collect(),
            ))
        }
    }

    pub fn timestamp(self, ms: Option<i64>) -> Self {
        self.field(ms.map(Value::Timestamp))
    }

    /// Finishes the list as a described value, dropping trailing nulls.
    pub fn describe(mut self, code: u64) -> Value {
        while matches!(self.items.last(), Some(Value::Null)) {
            self.items.pop();
        }
        Value::described(code, Value::List(self.items))
    }
}
