//! The AMQP 1.0 type system.
//!
//! [`Value`] is the in-memory form of every encodable AMQP value. Each
//! variant corresponds to exactly one AMQP type, so a value always knows
//! its own wire type tag. `Null` is a value in its own right and is
//! distinct from an absent field or map key.

use bytes::Bytes;
use std::fmt;
use uuid::Uuid;

/// A symbolic value (ASCII string used for keys and identifiers).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Descriptor of a described type: either a numeric code or a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Descriptor {
    Code(u64),
    Symbol(Symbol),
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descriptor::Code(code) => write!(f, "{:#x}", code),
            Descriptor::Symbol(symbol) => f.write_str(symbol.as_str()),
        }
    }
}

/// A described value: a descriptor followed by the described value.
#[derive(Debug, Clone, PartialEq)]
pub struct Described {
    pub descriptor: Descriptor,
    pub value: Value,
}

impl Described {
    pub fn new(descriptor: Descriptor, value: Value) -> Self {
        Self { descriptor, value }
    }

    /// Creates a described value with a numeric descriptor.
    pub fn coded(code: u64, value: Value) -> Self {
        Self::new(Descriptor::Code(code), value)
    }
}

/// An AMQP value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Ubyte(u8),
    Ushort(u16),
    Uint(u32),
    Ulong(u64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Uuid(Uuid),
    Binary(Bytes),
    String(String),
    Symbol(Symbol),
    List(Vec<Value>),
    /// Map entries in wire order. Keys are unique.
    Map(Vec<(Value, Value)>),
    Array(Vec<Value>),
    Described(Box<Described>),
}

impl Value {
    /// Returns the AMQP type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Ubyte(_) => "ubyte",
            Value::Ushort(_) => "ushort",
            Value::Uint(_) => "uint",
            Value::Ulong(_) => "ulong",
            Value::Byte(_) => "byte",
            Value::Short(_) => "short",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Char(_) => "char",
            Value::Timestamp(_) => "timestamp",
            Value::Uuid(_) => "uuid",
            Value::Binary(_) => "binary",
            Value::String(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Array(_) => "array",
            Value::Described(_) => "described",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns true for list, map, array and described values.
    pub fn is_compound(&self) -> bool {
        matches!(
            self,
            Value::List(_) | Value::Map(_) | Value::Array(_) | Value::Described(_)
        )
    }

    pub fn described(code: u64, value: Value) -> Self {
        Value::Described(Box::new(Described::coded(code, value)))
    }

    /// Looks up a map entry by key. Returns `None` for non-map values.
    pub fn map_get(&self, key: &Value) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

macro_rules! impl_from_primitive {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value)
                }
            }
        )*
    };
}

impl_from_primitive! {
    bool => Boolean,
    u8 => Ubyte,
    u16 => Ushort,
    u32 => Uint,
    u64 => Ulong,
    i8 => Byte,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    char => Char,
    Uuid => Uuid,
    Bytes => Binary,
    String => String,
    Symbol => Symbol,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<Described> for Value {
    fn from(value: Described) -> Self {
        Value::Described(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_option() {
        let none: Option<String> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some(7i32)), Value::Int(7));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Value::Null.type_name(), "null");
        assert_eq!(Value::from(1i8).type_name(), "byte");
        assert_eq!(Value::from(1u8).type_name(), "ubyte");
        assert_eq!(Value::from("x").type_name(), "string");
        assert_eq!(Value::Symbol("x".into()).type_name(), "symbol");
    }

    #[test]
    fn test_map_get() {
        let map = Value::Map(vec![(Value::from("a"), Value::Int(1))]);
        assert_eq!(map.map_get(&Value::from("a")), Some(&Value::Int(1)));
        assert_eq!(map.map_get(&Value::from("b")), None);
        assert_eq!(Value::Null.map_get(&Value::from("a")), None);
    }

    #[test]
    fn test_descriptor_display() {
        assert_eq!(Descriptor::Code(0x10).to_string(), "0x10");
        assert_eq!(
            Descriptor::Symbol("amqp:open:list".into()).to_string(),
            "amqp:open:list"
        );
    }
}
