//! Encoder and decoder for AMQP values and frames.
//!
//! Value encoding is canonical: for a given value the encoder always picks
//! the same (smallest fitting) constructor, so equal values encode to
//! identical bytes. The decoder accepts every valid encoding of a type.

use crate::error::ProtocolError;
use crate::frame::{Frame, ProtocolHeader, PROTOCOL_HEADER_SIZE};
use crate::types::{Described, Descriptor, Symbol, Value};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// AMQP format codes.
pub mod format {
    pub const DESCRIBED: u8 = 0x00;
    pub const NULL: u8 = 0x40;
    pub const TRUE: u8 = 0x41;
    pub const FALSE: u8 = 0x42;
    pub const BOOLEAN: u8 = 0x56;
    pub const UINT0: u8 = 0x43;
    pub const ULONG0: u8 = 0x44;
    pub const LIST0: u8 = 0x45;
    pub const UBYTE: u8 = 0x50;
    pub const BYTE: u8 = 0x51;
    pub const SMALL_UINT: u8 = 0x52;
    pub const SMALL_ULONG: u8 = 0x53;
    pub const SMALL_INT: u8 = 0x54;
    pub const SMALL_LONG: u8 = 0x55;
    pub const USHORT: u8 = 0x60;
    pub const SHORT: u8 = 0x61;
    pub const UINT: u8 = 0x70;
    pub const INT: u8 = 0x71;
    pub const FLOAT: u8 = 0x72;
    pub const CHAR: u8 = 0x73;
    pub const DECIMAL32: u8 = 0x74;
    pub const ULONG: u8 = 0x80;
    pub const LONG: u8 = 0x81;
    pub const DOUBLE: u8 = 0x82;
    pub const TIMESTAMP: u8 = 0x83;
    pub const DECIMAL64: u8 = 0x84;
    pub const DECIMAL128: u8 = 0x94;
    pub const UUID: u8 = 0x98;
    pub const VBIN8: u8 = 0xa0;
    pub const STR8: u8 = 0xa1;
    pub const SYM8: u8 = 0xa3;
    pub const VBIN32: u8 = 0xb0;
    pub const STR32: u8 = 0xb1;
    pub const SYM32: u8 = 0xb3;
    pub const LIST8: u8 = 0xc0;
    pub const MAP8: u8 = 0xc1;
    pub const LIST32: u8 = 0xd0;
    pub const MAP32: u8 = 0xd1;
    pub const ARRAY8: u8 = 0xe0;
    pub const ARRAY32: u8 = 0xf0;
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encodes a value, appending it to `buf`.
///
/// Fails only for arrays whose elements do not share one type.
pub fn encode(value: &Value, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    match value {
        Value::Null => buf.put_u8(format::NULL),
        Value::Boolean(true) => buf.put_u8(format::TRUE),
        Value::Boolean(false) => buf.put_u8(format::FALSE),
        Value::Ubyte(v) => {
            buf.put_u8(format::UBYTE);
            buf.put_u8(*v);
        }
        Value::Ushort(v) => {
            buf.put_u8(format::USHORT);
            buf.put_u16(*v);
        }
        Value::Uint(0) => buf.put_u8(format::UINT0),
        Value::Uint(v) if *v <= u8::MAX as u32 => {
            buf.put_u8(format::SMALL_UINT);
            buf.put_u8(*v as u8);
        }
        Value::Uint(v) => {
            buf.put_u8(format::UINT);
            buf.put_u32(*v);
        }
        Value::Ulong(0) => buf.put_u8(format::ULONG0),
        Value::Ulong(v) if *v <= u8::MAX as u64 => {
            buf.put_u8(format::SMALL_ULONG);
            buf.put_u8(*v as u8);
        }
        Value::Ulong(v) => {
            buf.put_u8(format::ULONG);
            buf.put_u64(*v);
        }
        Value::Byte(v) => {
            buf.put_u8(format::BYTE);
            buf.put_i8(*v);
        }
        Value::Short(v) => {
            buf.put_u8(format::SHORT);
            buf.put_i16(*v);
        }
        Value::Int(v) if i8::try_from(*v).is_ok() => {
            buf.put_u8(format::SMALL_INT);
            buf.put_i8(*v as i8);
        }
        Value::Int(v) => {
            buf.put_u8(format::INT);
            buf.put_i32(*v);
        }
        Value::Long(v) if i8::try_from(*v).is_ok() => {
            buf.put_u8(format::SMALL_LONG);
            buf.put_i8(*v as i8);
        }
        Value::Long(v) => {
            buf.put_u8(format::LONG);
            buf.put_i64(*v);
        }
        Value::Float(v) => {
            buf.put_u8(format::FLOAT);
            buf.put_f32(*v);
        }
        Value::Double(v) => {
            buf.put_u8(format::DOUBLE);
            buf.put_f64(*v);
        }
        Value::Char(v) => {
            buf.put_u8(format::CHAR);
            buf.put_u32(*v as u32);
        }
        Value::Timestamp(v) => {
            buf.put_u8(format::TIMESTAMP);
            buf.put_i64(*v);
        }
        Value::Uuid(v) => {
            buf.put_u8(format::UUID);
            buf.put_slice(v.as_bytes());
        }
        Value::Binary(v) => put_variable(buf, format::VBIN8, format::VBIN32, v),
        Value::String(v) => put_variable(buf, format::STR8, format::STR32, v.as_bytes()),
        Value::Symbol(v) => put_variable(buf, format::SYM8, format::SYM32, v.as_str().as_bytes()),
        Value::List(items) if items.is_empty() => buf.put_u8(format::LIST0),
        Value::List(items) => {
            let mut body = BytesMut::new();
            for item in items {
                encode(item, &mut body)?;
            }
            put_compound(buf, format::LIST8, format::LIST32, items.len(), &body);
        }
        Value::Map(entries) => {
            let mut body = BytesMut::new();
            for (key, value) in entries {
                encode(key, &mut body)?;
                encode(value, &mut body)?;
            }
            put_compound(buf, format::MAP8, format::MAP32, entries.len() * 2, &body);
        }
        Value::Array(items) => encode_array(items, buf)?,
        Value::Described(described) => {
            buf.put_u8(format::DESCRIBED);
            match &described.descriptor {
                Descriptor::Code(code) => encode(&Value::Ulong(*code), buf)?,
                Descriptor::Symbol(symbol) => encode(&Value::Symbol(symbol.clone()), buf)?,
            }
            encode(&described.value, buf)?;
        }
    }
    Ok(())
}

/// Encodes a value into a fresh buffer.
pub fn to_bytes(value: &Value) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode(value, &mut buf)?;
    Ok(buf.freeze())
}

fn put_variable(buf: &mut BytesMut, code8: u8, code32: u8, data: &[u8]) {
    if data.len() <= u8::MAX as usize {
        buf.put_u8(code8);
        buf.put_u8(data.len() as u8);
    } else {
        buf.put_u8(code32);
        buf.put_u32(data.len() as u32);
    }
    buf.put_slice(data);
}

fn put_compound(buf: &mut BytesMut, code8: u8, code32: u8, count: usize, body: &[u8]) {
    if body.len() < u8::MAX as usize && count <= u8::MAX as usize {
        buf.put_u8(code8);
        buf.put_u8((body.len() + 1) as u8);
        buf.put_u8(count as u8);
    } else {
        buf.put_u8(code32);
        buf.put_u32((body.len() + 4) as u32);
        buf.put_u32(count as u32);
    }
    buf.put_slice(body);
}

/// Picks the single element constructor shared by every array element.
fn array_constructor(items: &[Value]) -> Result<u8, ProtocolError> {
    let Some(first) = items.first() else {
        return Ok(format::NULL);
    };
    let wide = |len: fn(&Value) -> usize| items.iter().any(|v| len(v) > u8::MAX as usize);
    let code = match first {
        Value::Null => format::NULL,
        Value::Boolean(_) => format::BOOLEAN,
        Value::Ubyte(_) => format::UBYTE,
        Value::Ushort(_) => format::USHORT,
        Value::Uint(_) => format::UINT,
        Value::Ulong(_) => format::ULONG,
        Value::Byte(_) => format::BYTE,
        Value::Short(_) => format::SHORT,
        Value::Int(_) => format::INT,
        Value::Long(_) => format::LONG,
        Value::Float(_) => format::FLOAT,
        Value::Double(_) => format::DOUBLE,
        Value::Char(_) => format::CHAR,
        Value::Timestamp(_) => format::TIMESTAMP,
        Value::Uuid(_) => format::UUID,
        Value::Binary(_) => {
            if wide(|v| match v {
                Value::Binary(b) => b.len(),
                _ => 0,
            }) {
                format::VBIN32
            } else {
                format::VBIN8
            }
        }
        Value::String(_) => {
            if wide(|v| match v {
                Value::String(s) => s.len(),
                _ => 0,
            }) {
                format::STR32
            } else {
                format::STR8
            }
        }
        Value::Symbol(_) => {
            if wide(|v| match v {
                Value::Symbol(s) => s.as_str().len(),
                _ => 0,
            }) {
                format::SYM32
            } else {
                format::SYM8
            }
        }
        Value::List(_) => format::LIST32,
        Value::Map(_) => format::MAP32,
        Value::Array(_) => format::ARRAY32,
        Value::Described(_) => return Err(ProtocolError::InvalidArray("described elements")),
    };
    if items
        .iter()
        .any(|v| std::mem::discriminant(v) != std::mem::discriminant(first))
    {
        return Err(ProtocolError::InvalidArray("mixed element types"));
    }
    Ok(code)
}

fn encode_array(items: &[Value], buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let code = array_constructor(items)?;
    let mut body = BytesMut::new();
    body.put_u8(code);
    for item in items {
        encode_element(code, item, &mut body)?;
    }
    // The element constructor is counted in the size but not in the count.
    if body.len() < u8::MAX as usize && items.len() <= u8::MAX as usize {
        buf.put_u8(format::ARRAY8);
        buf.put_u8((body.len() + 1) as u8);
        buf.put_u8(items.len() as u8);
    } else {
        buf.put_u8(format::ARRAY32);
        buf.put_u32((body.len() + 4) as u32);
        buf.put_u32(items.len() as u32);
    }
    buf.put_slice(&body);
    Ok(())
}

/// Encodes an array element body (no constructor) for the given code.
fn encode_element(code: u8, value: &Value, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    match (code, value) {
        (format::NULL, Value::Null) => {}
        (format::BOOLEAN, Value::Boolean(v)) => buf.put_u8(*v as u8),
        (format::UBYTE, Value::Ubyte(v)) => buf.put_u8(*v),
        (format::USHORT, Value::Ushort(v)) => buf.put_u16(*v),
        (format::UINT, Value::Uint(v)) => buf.put_u32(*v),
        (format::ULONG, Value::Ulong(v)) => buf.put_u64(*v),
        (format::BYTE, Value::Byte(v)) => buf.put_i8(*v),
        (format::SHORT, Value::Short(v)) => buf.put_i16(*v),
        (format::INT, Value::Int(v)) => buf.put_i32(*v),
        (format::LONG, Value::Long(v)) => buf.put_i64(*v),
        (format::FLOAT, Value::Float(v)) => buf.put_f32(*v),
        (format::DOUBLE, Value::Double(v)) => buf.put_f64(*v),
        (format::CHAR, Value::Char(v)) => buf.put_u32(*v as u32),
        (format::TIMESTAMP, Value::Timestamp(v)) => buf.put_i64(*v),
        (format::UUID, Value::Uuid(v)) => buf.put_slice(v.as_bytes()),
        (format::VBIN8, Value::Binary(v)) => {
            buf.put_u8(v.len() as u8);
            buf.put_slice(v);
        }
        (format::VBIN32, Value::Binary(v)) => {
            buf.put_u32(v.len() as u32);
            buf.put_slice(v);
        }
        (format::STR8, Value::String(v)) => {
            buf.put_u8(v.len() as u8);
            buf.put_slice(v.as_bytes());
        }
        (format::STR32, Value::String(v)) => {
            buf.put_u32(v.len() as u32);
            buf.put_slice(v.as_bytes());
        }
        (format::SYM8, Value::Symbol(v)) => {
            buf.put_u8(v.as_str().len() as u8);
            buf.put_slice(v.as_str().as_bytes());
        }
        (format::SYM32, Value::Symbol(v)) => {
            buf.put_u32(v.as_str().len() as u32);
            buf.put_slice(v.as_str().as_bytes());
        }
        (format::LIST32, Value::List(items)) => {
            let mut body = BytesMut::new();
            for item in items {
                encode(item, &mut body)?;
            }
            buf.put_u32((body.len() + 4) as u32);
            buf.put_u32(items.len() as u32);
            buf.put_slice(&body);
        }
        (format::MAP32, Value::Map(entries)) => {
            let mut body = BytesMut::new();
            for (key, value) in entries {
                encode(key, &mut body)?;
                encode(value, &mut body)?;
            }
            buf.put_u32((body.len() + 4) as u32);
            buf.put_u32((entries.len() * 2) as u32);
            buf.put_slice(&body);
        }
        (format::ARRAY32, Value::Array(items)) => {
            let inner = array_constructor(items)?;
            let mut body = BytesMut::new();
            body.put_u8(inner);
            for item in items {
                encode_element(inner, item, &mut body)?;
            }
            buf.put_u32((body.len() + 4) as u32);
            buf.put_u32(items.len() as u32);
            buf.put_slice(&body);
        }
        _ => return Err(ProtocolError::InvalidArray("mixed element types")),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn need(buf: &Bytes, n: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        return Err(ProtocolError::Truncated {
            needed: n - buf.remaining(),
        });
    }
    Ok(())
}

fn read_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn read_u32(buf: &mut Bytes) -> Result<u32, ProtocolError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn read_slice(buf: &mut Bytes, len: usize) -> Result<Bytes, ProtocolError> {
    need(buf, len)?;
    Ok(buf.split_to(len))
}

fn read_string(buf: &mut Bytes, len: usize) -> Result<String, ProtocolError> {
    let data = read_slice(buf, len)?;
    String::from_utf8(data.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Deepest nesting of described, list, map and array values accepted on
/// decode.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Most elements an array may declare when its element constructor takes
/// no bytes (null, true, false, uint0, ulong0, list0).
pub const MAX_ZERO_WIDTH_ELEMENTS: usize = 64 * 1024;

/// Decodes one value from the front of `buf`, consuming its bytes.
pub fn decode(buf: &mut Bytes) -> Result<Value, ProtocolError> {
    decode_nested(buf, 0)
}

fn check_depth(depth: usize) -> Result<(), ProtocolError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH));
    }
    Ok(())
}

fn decode_nested(buf: &mut Bytes, depth: usize) -> Result<Value, ProtocolError> {
    check_depth(depth)?;
    let code = read_u8(buf)?;
    if code == format::DESCRIBED {
        let descriptor = decode_descriptor(buf, depth + 1)?;
        let value = decode_nested(buf, depth + 1)?;
        return Ok(Value::Described(Box::new(Described { descriptor, value })));
    }
    decode_with(code, buf, depth)
}

/// Decodes a complete buffer holding exactly one value.
pub fn from_bytes(mut bytes: Bytes) -> Result<Value, ProtocolError> {
    decode(&mut bytes)
}

fn decode_descriptor(buf: &mut Bytes, depth: usize) -> Result<Descriptor, ProtocolError> {
    match decode_nested(buf, depth)? {
        Value::Ulong(code) => Ok(Descriptor::Code(code)),
        Value::Symbol(symbol) => Ok(Descriptor::Symbol(symbol)),
        other => Err(ProtocolError::UnexpectedType {
            expected: "ulong or symbol descriptor",
            found: other.type_name(),
        }),
    }
}

/// Decodes the body of a value whose constructor has already been read.
fn decode_with(code: u8, buf: &mut Bytes, depth: usize) -> Result<Value, ProtocolError> {
    check_depth(depth)?;
    let value = match code {
        format::NULL => Value::Null,
        format::TRUE => Value::Boolean(true),
        format::FALSE => Value::Boolean(false),
        format::BOOLEAN => match read_u8(buf)? {
            0 => Value::Boolean(false),
            1 => Value::Boolean(true),
            _ => return Err(ProtocolError::InvalidFormatCode(code)),
        },
        format::UBYTE => Value::Ubyte(read_u8(buf)?),
        format::USHORT => {
            need(buf, 2)?;
            Value::Ushort(buf.get_u16())
        }
        format::UINT0 => Value::Uint(0),
        format::SMALL_UINT => Value::Uint(read_u8(buf)? as u32),
        format::UINT => Value::Uint(read_u32(buf)?),
        format::ULONG0 => Value::Ulong(0),
        format::SMALL_ULONG => Value::Ulong(read_u8(buf)? as u64),
        format::ULONG => {
            need(buf, 8)?;
            Value::Ulong(buf.get_u64())
        }
        format::BYTE => {
            need(buf, 1)?;
            Value::Byte(buf.get_i8())
        }
        format::SHORT => {
            need(buf, 2)?;
            Value::Short(buf.get_i16())
        }
        format::SMALL_INT => {
            need(buf, 1)?;
            Value::Int(buf.get_i8() as i32)
        }
        format::INT => {
            need(buf, 4)?;
            Value::Int(buf.get_i32())
        }
        format::SMALL_LONG => {
            need(buf, 1)?;
            Value::Long(buf.get_i8() as i64)
        }
        format::LONG => {
            need(buf, 8)?;
            Value::Long(buf.get_i64())
        }
        format::FLOAT => {
            need(buf, 4)?;
            Value::Float(buf.get_f32())
        }
        format::DOUBLE => {
            need(buf, 8)?;
            Value::Double(buf.get_f64())
        }
        format::CHAR => {
            let raw = read_u32(buf)?;
            Value::Char(char::from_u32(raw).ok_or(ProtocolError::InvalidChar(raw))?)
        }
        format::TIMESTAMP => {
            need(buf, 8)?;
            Value::Timestamp(buf.get_i64())
        }
        format::UUID => {
            let raw = read_slice(buf, 16)?;
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&raw);
            Value::Uuid(Uuid::from_bytes(bytes))
        }
        format::VBIN8 => {
            let len = read_u8(buf)? as usize;
            Value::Binary(read_slice(buf, len)?)
        }
        format::VBIN32 => {
            let len = read_u32(buf)? as usize;
            Value::Binary(read_slice(buf, len)?)
        }
        format::STR8 => {
            let len = read_u8(buf)? as usize;
            Value::String(read_string(buf, len)?)
        }
        format::STR32 => {
            let len = read_u32(buf)? as usize;
            Value::String(read_string(buf, len)?)
        }
        format::SYM8 => {
            let len = read_u8(buf)? as usize;
            Value::Symbol(Symbol::new(read_string(buf, len)?))
        }
        format::SYM32 => {
            let len = read_u32(buf)? as usize;
            Value::Symbol(Symbol::new(read_string(buf, len)?))
        }
        format::LIST0 => Value::List(Vec::new()),
        format::LIST8 | format::LIST32 => {
            let (count, mut body) = read_compound(code == format::LIST32, buf)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_nested(&mut body, depth + 1)?);
            }
            Value::List(items)
        }
        format::MAP8 | format::MAP32 => {
            let (count, mut body) = read_compound(code == format::MAP32, buf)?;
            if count % 2 != 0 {
                return Err(ProtocolError::InvalidFormatCode(code));
            }
            let mut entries = Vec::with_capacity(count / 2);
            for _ in 0..count / 2 {
                let key = decode_nested(&mut body, depth + 1)?;
                let value = decode_nested(&mut body, depth + 1)?;
                entries.push((key, value));
            }
            Value::Map(entries)
        }
        format::ARRAY8 | format::ARRAY32 => decode_array(code == format::ARRAY32, buf, depth)?,
        format::DECIMAL32 | format::DECIMAL64 | format::DECIMAL128 => {
            return Err(ProtocolError::UnsupportedType(code))
        }
        other => return Err(ProtocolError::InvalidFormatCode(other)),
    };
    Ok(value)
}

/// Reads a list/map header and returns the element count and the body.
fn read_compound(wide: bool, buf: &mut Bytes) -> Result<(usize, Bytes), ProtocolError> {
    let (size, mut body) = if wide {
        let size = read_u32(buf)? as usize;
        (size, read_slice(buf, size)?)
    } else {
        let size = read_u8(buf)? as usize;
        (size, read_slice(buf, size)?)
    };
    let count = if wide {
        read_u32(&mut body)? as usize
    } else {
        read_u8(&mut body)? as usize
    };
    // Every element needs at least one constructor byte.
    if count > size {
        return Err(ProtocolError::Truncated {
            needed: count - body.remaining(),
        });
    }
    Ok((count, body))
}

fn decode_array(wide: bool, buf: &mut Bytes, depth: usize) -> Result<Value, ProtocolError> {
    let mut body = if wide {
        let size = read_u32(buf)? as usize;
        read_slice(buf, size)?
    } else {
        let size = read_u8(buf)? as usize;
        read_slice(buf, size)?
    };
    let count = if wide {
        read_u32(&mut body)? as usize
    } else {
        read_u8(&mut body)? as usize
    };
    let mut code = read_u8(&mut body)?;
    let descriptor = if code == format::DESCRIBED {
        let descriptor = decode_descriptor(&mut body, depth + 1)?;
        code = read_u8(&mut body)?;
        Some(descriptor)
    } else {
        None
    };
    if is_zero_width(code) {
        if count > MAX_ZERO_WIDTH_ELEMENTS {
            return Err(ProtocolError::InvalidArray("too many elements"));
        }
    } else if count > body.remaining() {
        return Err(ProtocolError::InvalidArray("count exceeds size"));
    }
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let value = decode_with(code, &mut body, depth + 1)?;
        items.push(match &descriptor {
            Some(descriptor) => Value::Described(Box::new(Described {
                descriptor: descriptor.clone(),
                value,
            })),
            None => value,
        });
    }
    Ok(Value::Array(items))
}

/// Constructors whose values carry no bytes after the format code.
fn is_zero_width(code: u8) -> bool {
    matches!(
        code,
        format::NULL
            | format::TRUE
            | format::FALSE
            | format::UINT0
            | format::ULONG0
            | format::LIST0
    )
}

// ---------------------------------------------------------------------------
// Frame stream codec
// ---------------------------------------------------------------------------

/// Encodes frames and protocol headers into bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes a protocol header.
    pub fn encode_header(header: ProtocolHeader) -> BytesMut {
        BytesMut::from(&header.to_bytes()[..])
    }

    /// Encodes a frame, rejecting it if it exceeds `max_frame_size`.
    pub fn encode_frame(frame: &Frame, max_frame_size: u32) -> Result<BytesMut, ProtocolError> {
        frame.encode(max_frame_size)
    }
}

/// Incremental decoder for an inbound AMQP byte stream.
///
/// Bytes are appended as they arrive; complete protocol headers and frames
/// are taken off the front. Partial input yields `Ok(None)`.
pub struct Decoder {
    buffer: BytesMut,
    max_frame_size: u32,
}

impl Decoder {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_frame_size,
        }
    }

    /// Returns the largest frame this decoder accepts.
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode a protocol header from the buffer.
    pub fn decode_header(&mut self) -> Result<Option<ProtocolHeader>, ProtocolError> {
        if self.buffer.len() < PROTOCOL_HEADER_SIZE {
            // Reject garbage early instead of waiting for eight bytes.
            let prefix = &self.buffer[..self.buffer.len().min(4)];
            if !b"AMQP".starts_with(prefix) {
                let mut raw = [0u8; PROTOCOL_HEADER_SIZE];
                raw[..self.buffer.len()].copy_from_slice(&self.buffer);
                return Err(ProtocolError::InvalidProtocolHeader(raw));
            }
            return Ok(None);
        }
        let mut raw = [0u8; PROTOCOL_HEADER_SIZE];
        raw.copy_from_slice(&self.buffer[..PROTOCOL_HEADER_SIZE]);
        let header = ProtocolHeader::from_bytes(raw)?;
        self.buffer.advance(PROTOCOL_HEADER_SIZE);
        Ok(Some(header))
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer, self.max_frame_size)
    }

    /// Checks that no partial frame is left once the stream has ended.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let needed = if self.buffer.len() >= 4 {
            let size = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            size.saturating_sub(self.buffer.len()).max(1)
        } else {
            4 - self.buffer.len()
        };
        Err(ProtocolError::Truncated { needed })
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(value: &Value) -> Value {
        let bytes = to_bytes(value).unwrap();
        from_bytes(bytes).unwrap()
    }

    #[test]
    fn test_canonical_small_encodings() {
        assert_eq!(&to_bytes(&Value::Null).unwrap()[..], &[0x40]);
        assert_eq!(&to_bytes(&Value::Boolean(true)).unwrap()[..], &[0x41]);
        assert_eq!(&to_bytes(&Value::Boolean(false)).unwrap()[..], &[0x42]);
        assert_eq!(&to_bytes(&Value::Uint(0)).unwrap()[..], &[0x43]);
        assert_eq!(&to_bytes(&Value::Uint(7)).unwrap()[..], &[0x52, 7]);
        assert_eq!(&to_bytes(&Value::Ulong(0x10)).unwrap()[..], &[0x53, 0x10]);
        assert_eq!(&to_bytes(&Value::Int(-1)).unwrap()[..], &[0x54, 0xff]);
        assert_eq!(
            &to_bytes(&Value::Int(i32::MAX)).unwrap()[..],
            &[0x71, 0x7f, 0xff, 0xff, 0xff]
        );
        assert_eq!(&to_bytes(&Value::List(vec![])).unwrap()[..], &[0x45]);
        assert_eq!(
            &to_bytes(&Value::from("ab")).unwrap()[..],
            &[0xa1, 2, b'a', b'b']
        );
    }

    #[test]
    fn test_accepts_non_canonical_encodings() {
        // uint as full-width 0x70
        let value = from_bytes(Bytes::from_static(&[0x70, 0, 0, 0, 5])).unwrap();
        assert_eq!(value, Value::Uint(5));

        // boolean with payload byte
        let value = from_bytes(Bytes::from_static(&[0x56, 0x01])).unwrap();
        assert_eq!(value, Value::Boolean(true));

        // str32 carrying a short string
        let value = from_bytes(Bytes::from_static(&[0xb1, 0, 0, 0, 1, b'x'])).unwrap();
        assert_eq!(value, Value::from("x"));

        // list32 with one element
        let value = from_bytes(Bytes::from_static(&[
            0xd0, 0, 0, 0, 5, 0, 0, 0, 1, 0x40,
        ]))
        .unwrap();
        assert_eq!(value, Value::List(vec![Value::Null]));
    }

    #[test]
    fn test_long_string_uses_str32() {
        let long = "x".repeat(300);
        let bytes = to_bytes(&Value::from(long.as_str())).unwrap();
        assert_eq!(bytes[0], format::STR32);
        assert_eq!(roundtrip(&Value::from(long.as_str())), Value::from(long.as_str()));
    }

    #[test]
    fn test_null_distinct_from_absent_in_map() {
        let map = Value::Map(vec![(Value::from("k"), Value::Null)]);
        let decoded = roundtrip(&map);
        assert_eq!(decoded.map_get(&Value::from("k")), Some(&Value::Null));
        assert_eq!(decoded.map_get(&Value::from("other")), None);
    }

    #[test]
    fn test_described_roundtrip() {
        let value = Value::described(0x77, Value::from("hello"));
        assert_eq!(roundtrip(&value), value);

        let symbolic = Value::Described(Box::new(Described::new(
            Descriptor::Symbol("amqp:amqp-value:*".into()),
            Value::Null,
        )));
        assert_eq!(roundtrip(&symbolic), symbolic);
    }

    #[test]
    fn test_symbol_array_roundtrip() {
        let array = Value::Array(vec![
            Value::Symbol("PLAIN".into()),
            Value::Symbol("ANONYMOUS".into()),
        ]);
        let bytes = to_bytes(&array).unwrap();
        assert_eq!(bytes[0], format::ARRAY8);
        assert_eq!(from_bytes(bytes).unwrap(), array);
    }

    #[test]
    fn test_boolean_array_roundtrip() {
        let array = Value::Array(vec![Value::Boolean(true), Value::Boolean(false)]);
        assert_eq!(roundtrip(&array), array);
    }

    #[test]
    fn test_mixed_array_rejected() {
        let array = Value::Array(vec![Value::Int(1), Value::from("x")]);
        assert!(matches!(
            to_bytes(&array),
            Err(ProtocolError::InvalidArray(_))
        ));
    }

    #[test]
    fn test_truncated_input() {
        assert!(matches!(
            from_bytes(Bytes::from_static(&[0x71, 0, 0])),
            Err(ProtocolError::Truncated { needed: 2 })
        ));
        assert!(matches!(
            from_bytes(Bytes::from_static(&[0xa1, 5, b'a'])),
            Err(ProtocolError::Truncated { needed: 4 })
        ));
        assert!(matches!(
            from_bytes(Bytes::new()),
            Err(ProtocolError::Truncated { needed: 1 })
        ));
    }

    #[test]
    fn test_list_count_larger_than_body() {
        // list8 declaring 200 elements in a 2 byte body
        let result = from_bytes(Bytes::from_static(&[0xc0, 2, 200, 0x40]));
        assert!(matches!(result, Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn test_invalid_utf8() {
        let result = from_bytes(Bytes::from_static(&[0xa1, 1, 0xff]));
        assert!(matches!(result, Err(ProtocolError::InvalidUtf8)));
    }

    #[test]
    fn test_unknown_and_unsupported_codes() {
        assert!(matches!(
            from_bytes(Bytes::from_static(&[0x99])),
            Err(ProtocolError::InvalidFormatCode(0x99))
        ));
        assert!(matches!(
            from_bytes(Bytes::from_static(&[0x74, 0, 0, 0, 0])),
            Err(ProtocolError::UnsupportedType(0x74))
        ));
    }

    #[test]
    fn test_decoder_rejects_garbage_header_early() {
        let mut decoder = Decoder::default();
        decoder.extend(b"HT");
        assert!(matches!(
            decoder.decode_header(),
            Err(ProtocolError::InvalidProtocolHeader(_))
        ));
    }

    #[test]
    fn test_decoder_partial_header() {
        let mut decoder = Decoder::default();
        decoder.extend(b"AMQP");
        assert!(decoder.decode_header().unwrap().is_none());
        decoder.extend(&[0, 1, 0, 0]);
        assert_eq!(
            decoder.decode_header().unwrap(),
            Some(ProtocolHeader::Amqp)
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_finish_with_leftover() {
        let mut decoder = Decoder::default();
        assert!(decoder.finish().is_ok());
        decoder.extend(&[0, 0, 0, 20, 2, 0]);
        assert!(matches!(
            decoder.finish(),
            Err(ProtocolError::Truncated { needed: 14 })
        ));
        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }

    fn nested_lists(levels: usize) -> Value {
        (0..levels).fold(Value::Null, |inner, _| Value::List(vec![inner]))
    }

    fn nested_maps(levels: usize) -> Value {
        (0..levels).fold(Value::Null, |inner, _| {
            Value::Map(vec![(Value::from("k"), inner)])
        })
    }

    #[test]
    fn test_descriptor_chain_rejected() {
        let bytes = Bytes::from(vec![0x00; 10_000]);
        assert!(matches!(
            from_bytes(bytes),
            Err(ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH))
        ));
    }

    #[test]
    fn test_nested_lists_limit() {
        let value = nested_lists(MAX_NESTING_DEPTH);
        assert_eq!(from_bytes(to_bytes(&value).unwrap()).unwrap(), value);

        let bytes = to_bytes(&nested_lists(MAX_NESTING_DEPTH + 1)).unwrap();
        assert!(matches!(
            from_bytes(bytes),
            Err(ProtocolError::NestingTooDeep(_))
        ));
    }

    #[test]
    fn test_nested_maps_limit() {
        let value = nested_maps(MAX_NESTING_DEPTH);
        assert_eq!(from_bytes(to_bytes(&value).unwrap()).unwrap(), value);

        let bytes = to_bytes(&nested_maps(500)).unwrap();
        assert!(matches!(
            from_bytes(bytes),
            Err(ProtocolError::NestingTooDeep(_))
        ));
    }

    #[test]
    fn test_deep_list32_bytes_rejected() {
        // list32 { count = 1, list32 { ... } } wrapped around a null 1000 times
        let mut raw = vec![0x40];
        for _ in 0..1000 {
            let mut outer = vec![0xd0];
            outer.extend_from_slice(&(raw.len() as u32 + 4).to_be_bytes());
            outer.extend_from_slice(&1u32.to_be_bytes());
            outer.extend_from_slice(&raw);
            raw = outer;
        }
        assert!(matches!(
            from_bytes(Bytes::from(raw)),
            Err(ProtocolError::NestingTooDeep(_))
        ));
    }

    #[test]
    fn test_array_count_beyond_body() {
        // array8 of three ubytes carrying only two
        assert!(matches!(
            from_bytes(Bytes::from_static(&[0xe0, 0x04, 0x03, 0x50, 0x01, 0x02])),
            Err(ProtocolError::InvalidArray(_))
        ));
    }

    #[test]
    fn test_zero_width_array_count_capped() {
        let count = 1_000_000u32;
        let size = count + 5;
        let mut raw = vec![0xf0];
        raw.extend_from_slice(&size.to_be_bytes());
        raw.extend_from_slice(&count.to_be_bytes());
        raw.push(0x40);
        raw.resize(1 + 4 + size as usize, 0);
        assert!(matches!(
            from_bytes(Bytes::from(raw)),
            Err(ProtocolError::InvalidArray(_))
        ));
    }

    #[test]
    fn test_null_array_roundtrip() {
        let value = Value::Array(vec![Value::Null; 5]);
        let bytes = to_bytes(&value).unwrap();
        assert_eq!(from_bytes(bytes).unwrap(), value);

        // ten booleans encoded with the zero-width true constructor
        assert_eq!(
            from_bytes(Bytes::from_static(&[0xe0, 0x02, 0x0a, 0x41])).unwrap(),
            Value::Array(vec![Value::Boolean(true); 10])
        );
    }

    fn primitive() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Boolean),
            any::<u8>().prop_map(Value::Ubyte),
            any::<u16>().prop_map(Value::Ushort),
            any::<u32>().prop_map(Value::Uint),
            any::<u64>().prop_map(Value::Ulong),
            any::<i8>().prop_map(Value::Byte),
            any::<i16>().prop_map(Value::Short),
            any::<i32>().prop_map(Value::Int),
            any::<i64>().prop_map(Value::Long),
            any::<f32>()
                .prop_filter("NaN never compares equal", |f| !f.is_nan())
                .prop_map(Value::Float),
            any::<f64>()
                .prop_filter("NaN never compares equal", |f| !f.is_nan())
                .prop_map(Value::Double),
            any::<char>().prop_map(Value::Char),
            any::<i64>().prop_map(Value::Timestamp),
            any::<[u8; 16]>().prop_map(|b| Value::Uuid(Uuid::from_bytes(b))),
            proptest::collection::vec(any::<u8>(), 0..300)
                .prop_map(|b| Value::Binary(Bytes::from(b))),
            any::<String>().prop_map(Value::String),
            "[a-z:.-]{0,40}".prop_map(|s| Value::Symbol(Symbol::new(s))),
        ]
    }

    fn any_value() -> impl Strategy<Value = Value> {
        primitive().prop_recursive(3, 48, 8, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..8).prop_map(Value::List),
                proptest::collection::vec((inner.clone(), inner.clone()), 0..4)
                    .prop_map(Value::Map),
                (any::<u64>(), inner).prop_map(|(code, v)| Value::described(code, v)),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_roundtrip(value in any_value()) {
            prop_assert_eq!(roundtrip(&value), value);
        }

        #[test]
        fn prop_encoding_is_deterministic(value in any_value()) {
            let first = to_bytes(&value).unwrap();
            let second = to_bytes(&value).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = from_bytes(Bytes::from(data));
        }
    }
}
