//! Delivery bookkeeping.

use crate::error::ClientError;
use amqpx_protocol::definitions::{DeliveryNumber, Handle};
use amqpx_protocol::{Message, Outcome};
use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

/// Reply slot for a send: the remote outcome, or `None` when pre-settled.
pub(crate) type SendReply = oneshot::Sender<Result<Option<Outcome>, ClientError>>;

/// A message received on a link.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub(crate) channel: u16,
    pub(crate) handle: Handle,
    pub delivery_id: DeliveryNumber,
    pub tag: Bytes,
    /// Whether the sender settled the delivery on transfer.
    pub settled: bool,
    pub message: Message,
}

impl Delivery {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

/// A message queued on a sender link, possibly partly transferred.
#[derive(Debug)]
pub(crate) struct PendingSend {
    pub payload: Bytes,
    /// Bytes already written in earlier transfer frames.
    pub offset: usize,
    pub settled: bool,
    pub delivery_id: Option<DeliveryNumber>,
    pub reply: SendReply,
}

impl PendingSend {
    pub fn new(payload: Bytes, settled: bool, reply: SendReply) -> Self {
        Self {
            payload,
            offset: 0,
            settled,
            delivery_id: None,
            reply,
        }
    }

    pub fn started(&self) -> bool {
        self.delivery_id.is_some()
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.offset
    }

    pub fn fail(self, err: ClientError) {
        let _ = self.reply.send(Err(err));
    }
}

/// An unsettled outgoing delivery awaiting the peer's disposition.
///
/// Owned by the session, so it outlives a detach of its link.
#[derive(Debug)]
pub(crate) struct OutgoingDelivery {
    pub handle: Handle,
    pub reply: SendReply,
}

/// An inbound delivery whose transfer frames are still arriving.
#[derive(Debug)]
pub(crate) struct IncomingTransfer {
    pub delivery_id: DeliveryNumber,
    pub tag: Bytes,
    pub settled: bool,
    pub payload: BytesMut,
}

impl IncomingTransfer {
    pub fn new(delivery_id: DeliveryNumber, tag: Bytes, settled: bool) -> Self {
        Self {
            delivery_id,
            tag,
            settled,
            payload: BytesMut::new(),
        }
    }
}
