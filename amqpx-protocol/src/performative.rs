//! AMQP performatives and link termini.
//!
//! Each performative is a described list. Field order and defaults follow
//! the AMQP 1.0 transport section; optional fields that hold their default
//! value are written as null so equal performatives encode identically.

use crate::composite::{expect_list, split_described, Fields, FromValue, ListBuilder};
use crate::definitions::{
    AmqpError, DeliveryNumber, DeliveryState, Handle, Outcome, ReceiverSettleMode, Role,
    SenderSettleMode, SequenceNo, TerminusDurability, TerminusExpiryPolicy, TransferNumber,
};
use crate::error::ProtocolError;
use crate::types::{Symbol, Value};
use bytes::Bytes;

pub const OPEN: u64 = 0x10;
pub const BEGIN: u64 = 0x11;
pub const ATTACH: u64 = 0x12;
pub const FLOW: u64 = 0x13;
pub const TRANSFER: u64 = 0x14;
pub const DISPOSITION: u64 = 0x15;
pub const DETACH: u64 = 0x16;
pub const END: u64 = 0x17;
pub const CLOSE: u64 = 0x18;
pub const SOURCE: u64 = 0x28;
pub const TARGET: u64 = 0x29;

#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    pub container_id: String,
    pub hostname: Option<String>,
    pub max_frame_size: u32,
    pub channel_max: u16,
    /// Idle timeout in milliseconds.
    pub idle_time_out: Option<u32>,
    pub outgoing_locales: Vec<Symbol>,
    pub incoming_locales: Vec<Symbol>,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Option<Value>,
}

impl Open {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            hostname: None,
            max_frame_size: u32::MAX,
            channel_max: u16::MAX,
            idle_time_out: None,
            outgoing_locales: Vec::new(),
            incoming_locales: Vec::new(),
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        }
    }

    fn to_value(&self) -> Value {
        ListBuilder::new()
            .field(self.container_id.as_str())
            .field(self.hostname.clone())
            .non_default(self.max_frame_size, u32::MAX)
            .non_default(self.channel_max, u16::MAX)
            .field(self.idle_time_out)
            .symbols(&self.outgoing_locales)
            .symbols(&self.incoming_locales)
            .symbols(&self.offered_capabilities)
            .symbols(&self.desired_capabilities)
            .field(self.properties.clone())
            .describe(OPEN)
    }

    fn from_fields(mut f: Fields) -> Result<Self, ProtocolError> {
        Ok(Self {
            container_id: f.required("container-id")?,
            hostname: f.optional()?,
            max_frame_size: f.optional()?.unwrap_or(u32::MAX),
            channel_max: f.optional()?.unwrap_or(u16::MAX),
            idle_time_out: f.optional()?,
            outgoing_locales: f.symbols()?,
            incoming_locales: f.symbols()?,
            offered_capabilities: f.symbols()?,
            desired_capabilities: f.symbols()?,
            properties: f.optional()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Begin {
    pub remote_channel: Option<u16>,
    pub next_outgoing_id: TransferNumber,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: Handle,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Option<Value>,
}

impl Begin {
    fn to_value(&self) -> Value {
        ListBuilder::new()
            .field(self.remote_channel)
            .field(self.next_outgoing_id)
            .field(self.incoming_window)
            .field(self.outgoing_window)
            .non_default(self.handle_max, u32::MAX)
            .symbols(&self.offered_capabilities)
            .symbols(&self.desired_capabilities)
            .field(self.properties.clone())
            .describe(BEGIN)
    }

    fn from_fields(mut f: Fields) -> Result<Self, ProtocolError> {
        Ok(Self {
            remote_channel: f.optional()?,
            next_outgoing_id: f.required("next-outgoing-id")?,
            incoming_window: f.required("incoming-window")?,
            outgoing_window: f.required("outgoing-window")?,
            handle_max: f.optional()?.unwrap_or(u32::MAX),
            offered_capabilities: f.symbols()?,
            desired_capabilities: f.symbols()?,
            properties: f.optional()?,
        })
    }
}

/// Source terminus of a link.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Source {
    pub address: Option<String>,
    pub durable: TerminusDurability,
    pub expiry_policy: TerminusExpiryPolicy,
    pub timeout: u32,
    pub dynamic: bool,
    pub dynamic_node_properties: Option<Value>,
    pub distribution_mode: Option<Symbol>,
    pub filter: Option<Value>,
    pub default_outcome: Option<Outcome>,
    pub outcomes: Vec<Symbol>,
    pub capabilities: Vec<Symbol>,
}

impl Source {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }

    fn to_value(&self) -> Value {
        ListBuilder::new()
            .field(self.address.clone())
            .non_default(self.durable.as_u32(), 0)
            .field(
                (self.expiry_policy != TerminusExpiryPolicy::SessionEnd)
                    .then_some(self.expiry_policy),
            )
            .non_default(self.timeout, 0)
            .non_default(self.dynamic, false)
            .field(self.dynamic_node_properties.clone())
            .field(self.distribution_mode.clone())
            .field(self.filter.clone())
            .field(self.default_outcome.as_ref().map(Outcome::to_value))
            .symbols(&self.outcomes)
            .symbols(&self.capabilities)
            .describe(SOURCE)
    }

    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut f = expect_list(value, SOURCE)?;
        Ok(Self {
            address: f.optional()?,
            durable: f.or_default()?,
            expiry_policy: f.or_default()?,
            timeout: f.or_default()?,
            dynamic: f.or_default()?,
            dynamic_node_properties: f.optional()?,
            distribution_mode: f.optional()?,
            filter: f.optional()?,
            default_outcome: f.optional()?,
            outcomes: f.symbols()?,
            capabilities: f.symbols()?,
        })
    }
}

/// Target terminus of a link.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Target {
    pub address: Option<String>,
    pub durable: TerminusDurability,
    pub expiry_policy: TerminusExpiryPolicy,
    pub timeout: u32,
    pub dynamic: bool,
    pub dynamic_node_properties: Option<Value>,
    pub capabilities: Vec<Symbol>,
}

impl Target {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }

    fn to_value(&self) -> Value {
        ListBuilder::new()
            .field(self.address.clone())
            .non_default(self.durable.as_u32(), 0)
            .field(
                (self.expiry_policy != TerminusExpiryPolicy::SessionEnd)
                    .then_some(self.expiry_policy),
            )
            .non_default(self.timeout, 0)
            .non_default(self.dynamic, false)
            .field(self.dynamic_node_properties.clone())
            .symbols(&self.capabilities)
            .describe(TARGET)
    }

    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut f = expect_list(value, TARGET)?;
        Ok(Self {
            address: f.optional()?,
            durable: f.or_default()?,
            expiry_policy: f.or_default()?,
            timeout: f.or_default()?,
            dynamic: f.or_default()?,
            dynamic_node_properties: f.optional()?,
            capabilities: f.symbols()?,
        })
    }
}

impl FromValue for Source {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        Source::from_value(value)
    }
}

impl FromValue for Target {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        Target::from_value(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attach {
    pub name: String,
    pub handle: Handle,
    pub role: Role,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub source: Option<Source>,
    pub target: Option<Target>,
    pub unsettled: Option<Value>,
    pub incomplete_unsettled: bool,
    pub initial_delivery_count: Option<SequenceNo>,
    pub max_message_size: Option<u64>,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Option<Value>,
}

impl Attach {
    pub fn new(name: impl Into<String>, handle: Handle, role: Role) -> Self {
        Self {
            name: name.into(),
            handle,
            role,
            snd_settle_mode: SenderSettleMode::default(),
            rcv_settle_mode: ReceiverSettleMode::default(),
            source: None,
            target: None,
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: None,
            max_message_size: None,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        }
    }

    fn to_value(&self) -> Value {
        ListBuilder::new()
            .field(self.name.as_str())
            .field(self.handle)
            .field(self.role.as_bool())
            .non_default(self.snd_settle_mode.as_u8(), SenderSettleMode::Mixed.as_u8())
            .non_default(self.rcv_settle_mode.as_u8(), ReceiverSettleMode::First.as_u8())
            .field(self.source.as_ref().map(Source::to_value))
            .field(self.target.as_ref().map(Target::to_value))
            .field(self.unsettled.clone())
            .non_default(self.incomplete_unsettled, false)
            .field(self.initial_delivery_count)
            .field(self.max_message_size)
            .symbols(&self.offered_capabilities)
            .symbols(&self.desired_capabilities)
            .field(self.properties.clone())
            .describe(ATTACH)
    }

    fn from_fields(mut f: Fields) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: f.required("name")?,
            handle: f.required("handle")?,
            role: f.required("role")?,
            snd_settle_mode: f.or_default()?,
            rcv_settle_mode: f.or_default()?,
            source: f.optional()?,
            target: f.optional()?,
            unsettled: f.optional()?,
            incomplete_unsettled: f.or_default()?,
            initial_delivery_count: f.optional()?,
            max_message_size: f.optional()?,
            offered_capabilities: f.symbols()?,
            desired_capabilities: f.symbols()?,
            properties: f.optional()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Flow {
    pub next_incoming_id: Option<TransferNumber>,
    pub incoming_window: u32,
    pub next_outgoing_id: TransferNumber,
    pub outgoing_window: u32,
    pub handle: Option<Handle>,
    pub delivery_count: Option<SequenceNo>,
    pub link_credit: Option<u32>,
    pub available: Option<u32>,
    pub drain: bool,
    pub echo: bool,
    pub properties: Option<Value>,
}

impl Flow {
    fn to_value(&self) -> Value {
        ListBuilder::new()
            .field(self.next_incoming_id)
            .field(self.incoming_window)
            .field(self.next_outgoing_id)
            .field(self.outgoing_window)
            .field(self.handle)
            .field(self.delivery_count)
            .field(self.link_credit)
            .field(self.available)
            .non_default(self.drain, false)
            .non_default(self.echo, false)
            .field(self.properties.clone())
            .describe(FLOW)
    }

    fn from_fields(mut f: Fields) -> Result<Self, ProtocolError> {
        Ok(Self {
            next_incoming_id: f.optional()?,
            incoming_window: f.required("incoming-window")?,
            next_outgoing_id: f.required("next-outgoing-id")?,
            outgoing_window: f.required("outgoing-window")?,
            handle: f.optional()?,
            delivery_count: f.optional()?,
            link_credit: f.optional()?,
            available: f.optional()?,
            drain: f.or_default()?,
            echo: f.or_default()?,
            properties: f.optional()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transfer {
    pub handle: Handle,
    pub delivery_id: Option<DeliveryNumber>,
    pub delivery_tag: Option<Bytes>,
    pub message_format: Option<u32>,
    pub settled: Option<bool>,
    pub more: bool,
    pub rcv_settle_mode: Option<ReceiverSettleMode>,
    pub state: Option<DeliveryState>,
    pub resume: bool,
    pub aborted: bool,
    pub batchable: bool,
}

impl Transfer {
    fn to_value(&self) -> Value {
        ListBuilder::new()
            .field(self.handle)
            .field(self.delivery_id)
            .field(self.delivery_tag.clone())
            .field(self.message_format)
            .field(self.settled)
            .non_default(self.more, false)
            .field(self.rcv_settle_mode.map(ReceiverSettleMode::as_u8))
            .field(self.state.as_ref().map(DeliveryState::to_value))
            .non_default(self.resume, false)
            .non_default(self.aborted, false)
            .non_default(self.batchable, false)
            .describe(TRANSFER)
    }

    fn from_fields(mut f: Fields) -> Result<Self, ProtocolError> {
        Ok(Self {
            handle: f.required("handle")?,
            delivery_id: f.optional()?,
            delivery_tag: f.optional()?,
            message_format: f.optional()?,
            settled: f.optional()?,
            more: f.or_default()?,
            rcv_settle_mode: f.optional()?,
            state: f.optional()?,
            resume: f.or_default()?,
            aborted: f.or_default()?,
            batchable: f.or_default()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Disposition {
    pub role: Role,
    pub first: DeliveryNumber,
    pub last: Option<DeliveryNumber>,
    pub settled: bool,
    pub state: Option<DeliveryState>,
    pub batchable: bool,
}

impl Disposition {
    /// The inclusive range of delivery ids this disposition covers.
    pub fn range(&self) -> std::ops::RangeInclusive<DeliveryNumber> {
        self.first..=self.last.unwrap_or(self.first)
    }

    fn to_value(&self) -> Value {
        ListBuilder::new()
            .field(self.role.as_bool())
            .field(self.first)
            .field(self.last)
            .non_default(self.settled, false)
            .field(self.state.as_ref().map(DeliveryState::to_value))
            .non_default(self.batchable, false)
            .describe(DISPOSITION)
    }

    fn from_fields(mut f: Fields) -> Result<Self, ProtocolError> {
        Ok(Self {
            role: f.required("role")?,
            first: f.required("first")?,
            last: f.optional()?,
            settled: f.or_default()?,
            state: f.optional()?,
            batchable: f.or_default()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detach {
    pub handle: Handle,
    pub closed: bool,
    pub error: Option<AmqpError>,
}

impl Detach {
    fn to_value(&self) -> Value {
        ListBuilder::new()
            .field(self.handle)
            .non_default(self.closed, false)
            .field(self.error.as_ref().map(AmqpError::to_value))
            .describe(DETACH)
    }

    fn from_fields(mut f: Fields) -> Result<Self, ProtocolError> {
        Ok(Self {
            handle: f.required("handle")?,
            closed: f.or_default()?,
            error: f.optional()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct End {
    pub error: Option<AmqpError>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Close {
    pub error: Option<AmqpError>,
}

/// A decoded AMQP frame body.
#[derive(Debug, Clone, PartialEq)]
pub enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
}

impl Performative {
    /// Returns the performative name used in frame traces.
    pub fn name(&self) -> &'static str {
        match self {
            Performative::Open(_) => "open",
            Performative::Begin(_) => "begin",
            Performative::Attach(_) => "attach",
            Performative::Flow(_) => "flow",
            Performative::Transfer(_) => "transfer",
            Performative::Disposition(_) => "disposition",
            Performative::Detach(_) => "detach",
            Performative::End(_) => "end",
            Performative::Close(_) => "close",
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Performative::Open(open) => open.to_value(),
            Performative::Begin(begin) => begin.to_value(),
            Performative::Attach(attach) => attach.to_value(),
            Performative::Flow(flow) => flow.to_value(),
            Performative::Transfer(transfer) => transfer.to_value(),
            Performative::Disposition(disposition) => disposition.to_value(),
            Performative::Detach(detach) => detach.to_value(),
            Performative::End(end) => ListBuilder::new()
                .field(end.error.as_ref().map(AmqpError::to_value))
                .describe(END),
            Performative::Close(close) => ListBuilder::new()
                .field(close.error.as_ref().map(AmqpError::to_value))
                .describe(CLOSE),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let (code, inner) = split_described(value)?;
        let mut fields = Fields::from_value(inner)?;
        let performative = match code {
            OPEN => Performative::Open(Open::from_fields(fields)?),
            BEGIN => Performative::Begin(Begin::from_fields(fields)?),
            ATTACH => Performative::Attach(Attach::from_fields(fields)?),
            FLOW => Performative::Flow(Flow::from_fields(fields)?),
            TRANSFER => Performative::Transfer(Transfer::from_fields(fields)?),
            DISPOSITION => Performative::Disposition(Disposition::from_fields(fields)?),
            DETACH => Performative::Detach(Detach::from_fields(fields)?),
            END => Performative::End(End {
                error: fields.optional()?,
            }),
            CLOSE => Performative::Close(Close {
                error: fields.optional()?,
            }),
            other => {
                return Err(ProtocolError::UnknownDescriptor(format!(
                    "performative {:#x}",
                    other
                )))
            }
        };
        Ok(performative)
    }
}

macro_rules! impl_into_performative {
    ($($ty:ident),*) => {
        $(
            impl From<$ty> for Performative {
                fn from(value: $ty) -> Self {
                    Performative::$ty(value)
                }
            }
        )*
    };
}

impl_into_performative!(Open, Begin, Attach, Flow, Transfer, Disposition, Detach, End, Close);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::error::ErrorCondition;

    fn through_wire(performative: &Performative) -> Performative {
        let bytes = codec::to_bytes(&performative.to_value()).unwrap();
        Performative::from_value(codec::from_bytes(bytes).unwrap()).unwrap()
    }

    fn sample() -> Vec<Performative> {
        let mut open = Open::new("client-1");
        open.hostname = Some("localhost".into());
        open.max_frame_size = 65536;
        open.channel_max = 255;
        open.idle_time_out = Some(30_000);
        open.offered_capabilities = vec!["ANONYMOUS-RELAY".into()];

        let mut attach = Attach::new("client-1:sender:1", 0, Role::Sender);
        attach.target = Some(Target::new("myQueue"));
        attach.source = Some(Source::default());
        attach.initial_delivery_count = Some(0);

        vec![
            open.into(),
            Begin {
                remote_channel: None,
                next_outgoing_id: 1,
                incoming_window: 2048,
                outgoing_window: u32::MAX,
                handle_max: 1023,
                offered_capabilities: vec![],
                desired_capabilities: vec![],
                properties: None,
            }
            .into(),
            attach.into(),
            Flow {
                next_incoming_id: Some(0),
                incoming_window: 2048,
                next_outgoing_id: 1,
                outgoing_window: 2048,
                handle: Some(0),
                delivery_count: Some(0),
                link_credit: Some(1000),
                drain: true,
                ..Default::default()
            }
            .into(),
            Transfer {
                handle: 0,
                delivery_id: Some(7),
                delivery_tag: Some(Bytes::from_static(&[0, 0, 0, 7])),
                message_format: Some(0),
                settled: Some(false),
                more: true,
                ..Default::default()
            }
            .into(),
            Disposition {
                role: Role::Receiver,
                first: 7,
                last: Some(9),
                settled: true,
                state: Some(Outcome::Accepted.into()),
                batchable: false,
            }
            .into(),
            Detach {
                handle: 0,
                closed: true,
                error: Some(AmqpError::new(ErrorCondition::DetachForced, "bye")),
            }
            .into(),
            End::default().into(),
            Close {
                error: Some(AmqpError::new(ErrorCondition::FramingError, "bad frame")),
            }
            .into(),
        ]
    }

    #[test]
    fn test_performatives_survive_wire() {
        for performative in sample() {
            assert_eq!(through_wire(&performative), performative);
        }
    }

    #[test]
    fn test_encoding_deterministic() {
        for performative in sample() {
            let a = codec::to_bytes(&performative.to_value()).unwrap();
            let b = codec::to_bytes(&performative.to_value()).unwrap();
            assert_eq!(a, b, "{}", performative.name());
        }
    }

    #[test]
    fn test_empty_close_wire_form() {
        let bytes = codec::to_bytes(&Performative::Close(Close::default()).to_value()).unwrap();
        assert_eq!(&bytes[..], &[0x00, 0x53, 0x18, 0x45]);
    }

    #[test]
    fn test_open_defaults_applied() {
        let value = Value::described(OPEN, Value::List(vec![Value::from("peer")]));
        let Performative::Open(open) = Performative::from_value(value).unwrap() else {
            panic!("expected open");
        };
        assert_eq!(open.container_id, "peer");
        assert_eq!(open.max_frame_size, u32::MAX);
        assert_eq!(open.channel_max, u16::MAX);
        assert_eq!(open.idle_time_out, None);
    }

    #[test]
    fn test_missing_mandatory_field() {
        let value = Value::described(OPEN, Value::List(vec![]));
        assert!(matches!(
            Performative::from_value(value),
            Err(ProtocolError::MissingField("container-id"))
        ));
    }

    #[test]
    fn test_symbolic_descriptor_accepted() {
        let value = Value::Described(Box::new(crate::types::Described::new(
            crate::types::Descriptor::Symbol("amqp:end:list".into()),
            Value::List(vec![]),
        )));
        assert_eq!(
            Performative::from_value(value).unwrap(),
            Performative::End(End::default())
        );
    }

    #[test]
    fn test_unknown_performative() {
        let value = Value::described(0x99, Value::List(vec![]));
        assert!(matches!(
            Performative::from_value(value),
            Err(ProtocolError::UnknownDescriptor(_))
        ));
    }

    #[test]
    fn test_disposition_range() {
        let single = Disposition {
            role: Role::Receiver,
            first: 4,
            last: None,
            settled: true,
            state: None,
            batchable: false,
        };
        assert_eq!(single.range(), 4..=4);
        let many = Disposition {
            last: Some(6),
            ..single
        };
        assert_eq!(many.range().count(), 3);
    }
}
