//! Shared AMQP definitions: roles, settle modes, delivery states and the
//! error record carried by close, end, detach and rejected.

use crate::composite::{expect_list, split_described, Fields, FromValue, ListBuilder};
use crate::error::{ErrorCondition, ProtocolError};
use crate::types::{Symbol, Value};
use std::fmt;

pub type Handle = u32;
pub type DeliveryNumber = u32;
pub type TransferNumber = u32;
pub type SequenceNo = u32;

pub const ERROR: u64 = 0x1d;
pub const RECEIVED: u64 = 0x23;
pub const ACCEPTED: u64 = 0x24;
pub const REJECTED: u64 = 0x25;
pub const RELEASED: u64 = 0x26;
pub const MODIFIED: u64 = 0x27;

/// Link role. Encoded as a boolean: false = sender, true = receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn as_bool(self) -> bool {
        matches!(self, Role::Receiver)
    }

    pub fn opposite(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl FromValue for Role {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        Ok(if bool::from_value(value)? {
            Role::Receiver
        } else {
            Role::Sender
        })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderSettleMode {
    Unsettled,
    Settled,
    #[default]
    Mixed,
}

impl SenderSettleMode {
    pub fn as_u8(self) -> u8 {
        match self {
            SenderSettleMode::Unsettled => 0,
            SenderSettleMode::Settled => 1,
            SenderSettleMode::Mixed => 2,
        }
    }
}

impl FromValue for SenderSettleMode {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match u8::from_value(value)? {
            0 => Ok(SenderSettleMode::Unsettled),
            1 => Ok(SenderSettleMode::Settled),
            2 => Ok(SenderSettleMode::Mixed),
            other => Err(ProtocolError::InvalidSection(format!(
                "snd-settle-mode {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiverSettleMode {
    #[default]
    First,
    Second,
}

impl ReceiverSettleMode {
    pub fn as_u8(self) -> u8 {
        match self {
            ReceiverSettleMode::First => 0,
            ReceiverSettleMode::Second => 1,
        }
    }
}

impl FromValue for ReceiverSettleMode {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match u8::from_value(value)? {
            0 => Ok(ReceiverSettleMode::First),
            1 => Ok(ReceiverSettleMode::Second),
            other => Err(ProtocolError::InvalidSection(format!(
                "rcv-settle-mode {}",
                other
            ))),
        }
    }
}

/// Durability of a source or target terminus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminusDurability {
    #[default]
    None,
    Configuration,
    UnsettledState,
}

impl TerminusDurability {
    pub fn as_u32(self) -> u32 {
        match self {
            TerminusDurability::None => 0,
            TerminusDurability::Configuration => 1,
            TerminusDurability::UnsettledState => 2,
        }
    }
}

impl FromValue for TerminusDurability {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match u32::from_value(value)? {
            0 => Ok(TerminusDurability::None),
            1 => Ok(TerminusDurability::Configuration),
            2 => Ok(TerminusDurability::UnsettledState),
            other => Err(ProtocolError::InvalidSection(format!(
                "terminus durability {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminusExpiryPolicy {
    LinkDetach,
    #[default]
    SessionEnd,
    ConnectionClose,
    Never,
}

impl TerminusExpiryPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminusExpiryPolicy::LinkDetach => "link-detach",
            TerminusExpiryPolicy::SessionEnd => "session-end",
            TerminusExpiryPolicy::ConnectionClose => "connection-close",
            TerminusExpiryPolicy::Never => "never",
        }
    }
}

impl FromValue for TerminusExpiryPolicy {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let symbol = Symbol::from_value(value)?;
        match symbol.as_str() {
            "link-detach" => Ok(TerminusExpiryPolicy::LinkDetach),
            "session-end" => Ok(TerminusExpiryPolicy::SessionEnd),
            "connection-close" => Ok(TerminusExpiryPolicy::ConnectionClose),
            "never" => Ok(TerminusExpiryPolicy::Never),
            other => Err(ProtocolError::InvalidSection(format!(
                "expiry policy {}",
                other
            ))),
        }
    }
}

impl From<TerminusExpiryPolicy> for Value {
    fn from(policy: TerminusExpiryPolicy) -> Self {
        Value::Symbol(Symbol::from(policy.as_str()))
    }
}

/// The AMQP error record.
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpError {
    pub condition: ErrorCondition,
    pub description: Option<String>,
    /// Free-form info map, kept as received.
    pub info: Option<Value>,
}

impl AmqpError {
    pub fn new(condition: ErrorCondition, description: impl Into<String>) -> Self {
        Self {
            condition,
            description: Some(description.into()),
            info: None,
        }
    }

    pub fn to_value(&self) -> Value {
        ListBuilder::new()
            .field(Value::Symbol(Symbol::from(self.condition.as_symbol())))
            .field(self.description.clone())
            .field(self.info.clone())
            .describe(ERROR)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut fields = expect_list(value, ERROR)?;
        let condition: Symbol = fields.required("condition")?;
        Ok(Self {
            condition: ErrorCondition::from_symbol(condition.as_str()),
            description: fields.optional()?,
            info: fields.optional()?,
        })
    }
}

impl FromValue for AmqpError {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        AmqpError::from_value(value)
    }
}

impl fmt::Display for AmqpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.condition, description),
            None => write!(f, "{}", self.condition),
        }
    }
}

/// Terminal delivery outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Accepted,
    Rejected(Option<AmqpError>),
    Released,
    Modified {
        delivery_failed: bool,
        undeliverable_here: bool,
        message_annotations: Option<Value>,
    },
}

impl Outcome {
    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Accepted => "accepted",
            Outcome::Rejected(_) => "rejected",
            Outcome::Released => "released",
            Outcome::Modified { .. } => "modified",
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Outcome::Accepted => ListBuilder::new().describe(ACCEPTED),
            Outcome::Rejected(error) => ListBuilder::new()
                .field(error.as_ref().map(AmqpError::to_value))
                .describe(REJECTED),
            Outcome::Released => ListBuilder::new().describe(RELEASED),
            Outcome::Modified {
                delivery_failed,
                undeliverable_here,
                message_annotations,
            } => ListBuilder::new()
                .non_default(*delivery_failed, false)
                .non_default(*undeliverable_here, false)
                .field(message_annotations.clone())
                .describe(MODIFIED),
        }
    }
}

/// State of a delivery as carried by transfer and disposition.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryState {
    Received {
        section_number: u32,
        section_offset: u64,
    },
    Outcome(Outcome),
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Outcome(_))
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            DeliveryState::Outcome(outcome) => Some(outcome),
            DeliveryState::Received { .. } => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DeliveryState::Received {
                section_number,
                section_offset,
            } => ListBuilder::new()
                .field(*section_number)
                .field(*section_offset)
                .describe(RECEIVED),
            DeliveryState::Outcome(outcome) => outcome.to_value(),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let (code, inner) = split_described(value)?;
        let mut fields = Fields::from_value(inner)?;
        let state = match code {
            RECEIVED => DeliveryState::Received {
                section_number: fields.required("section-number")?,
                section_offset: fields.required("section-offset")?,
            },
            ACCEPTED => DeliveryState::Outcome(Outcome::Accepted),
            REJECTED => DeliveryState::Outcome(Outcome::Rejected(fields.optional()?)),
            RELEASED => DeliveryState::Outcome(Outcome::Released),
            MODIFIED => DeliveryState::Outcome(Outcome::Modified {
                delivery_failed: fields.or_default()?,
                undeliverable_here: fields.or_default()?,
                message_annotations: fields.optional()?,
            }),
            other => {
                return Err(ProtocolError::UnknownDescriptor(format!(
                    "delivery state {:#x}",
                    other
                )))
            }
        };
        Ok(state)
    }
}

impl FromValue for DeliveryState {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        DeliveryState::from_value(value)
    }
}

impl FromValue for Outcome {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match DeliveryState::from_value(value)? {
            DeliveryState::Outcome(outcome) => Ok(outcome),
            DeliveryState::Received { .. } => Err(ProtocolError::UnexpectedType {
                expected: "outcome",
                found: "received",
            }),
        }
    }
}

impl From<Outcome> for DeliveryState {
    fn from(outcome: Outcome) -> Self {
        DeliveryState::Outcome(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    fn through_wire(state: &DeliveryState) -> DeliveryState {
        let bytes = codec::to_bytes(&state.to_value()).unwrap();
        DeliveryState::from_value(codec::from_bytes(bytes).unwrap()).unwrap()
    }

    #[test]
    fn test_accepted_wire_form() {
        let bytes = codec::to_bytes(&Outcome::Accepted.to_value()).unwrap();
        assert_eq!(&bytes[..], &[0x00, 0x53, 0x24, 0x45]);
    }

    #[test]
    fn test_delivery_states_survive_wire() {
        let states = [
            DeliveryState::Received {
                section_number: 1,
                section_offset: 300,
            },
            Outcome::Accepted.into(),
            Outcome::Rejected(Some(AmqpError::new(
                ErrorCondition::DecodeError,
                "bad payload",
            )))
            .into(),
            Outcome::Rejected(None).into(),
            Outcome::Released.into(),
            Outcome::Modified {
                delivery_failed: true,
                undeliverable_here: false,
                message_annotations: None,
            }
            .into(),
        ];
        for state in &states {
            assert_eq!(&through_wire(state), state);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!DeliveryState::Received {
            section_number: 0,
            section_offset: 0
        }
        .is_terminal());
        assert!(DeliveryState::from(Outcome::Released).is_terminal());
    }

    #[test]
    fn test_unknown_condition_preserved() {
        let error = AmqpError::new(ErrorCondition::Other("vendor:oops".into()), "x");
        let decoded = AmqpError::from_value(error.to_value()).unwrap();
        assert_eq!(decoded.condition.as_symbol(), "vendor:oops");
        assert_eq!(decoded.to_string(), "vendor:oops: x");
    }

    #[test]
    fn test_role_encoding() {
        assert!(!Role::Sender.as_bool());
        assert!(Role::Receiver.as_bool());
        assert_eq!(Role::from_value(Value::Boolean(true)).unwrap(), Role::Receiver);
        assert_eq!(Role::Sender.opposite(), Role::Receiver);
    }

    #[test]
    fn test_settle_mode_defaults() {
        assert_eq!(SenderSettleMode::default(), SenderSettleMode::Mixed);
        assert_eq!(ReceiverSettleMode::default(), ReceiverSettleMode::First);
        assert!(SenderSettleMode::from_value(Value::Ubyte(7)).is_err());
    }
}
