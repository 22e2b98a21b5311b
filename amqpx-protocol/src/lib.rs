//! # amqpx-protocol
//!
//! AMQP 1.0 wire protocol for amqpx.
//!
//! This crate provides:
//! - The AMQP type system and its canonical binary encoding
//! - Frame layout, protocol headers and a streaming frame decoder
//! - Performatives, SASL frames and delivery states
//! - Message sections with typed application-property access
//!
//! It performs no I/O.

pub mod codec;
mod composite;
pub mod definitions;
pub mod error;
pub mod frame;
pub mod message;
pub mod performative;
pub mod sasl;
pub mod types;

pub use codec::{Decoder, Encoder};
pub use definitions::{
    AmqpError, DeliveryState, Outcome, ReceiverSettleMode, Role, SenderSettleMode,
};
pub use error::{ErrorCondition, ProtocolError};
pub use frame::{Frame, FrameBody, ProtocolHeader, FRAME_HEADER_SIZE};
pub use message::{Body, Header, Message, MessageId, Properties};
pub use performative::Performative;
pub use sasl::SaslFrame;
pub use types::{Described, Descriptor, Symbol, Value};

/// IANA port for AMQP.
pub const DEFAULT_PORT: u16 = 5672;

/// IANA port for AMQP over TLS.
pub const DEFAULT_SECURE_PORT: u16 = 5671;

/// Smallest max-frame-size a peer may advertise.
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

/// Default max-frame-size (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1024 * 1024;
