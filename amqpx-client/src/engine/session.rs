//! Session endpoint: transfer windows, handle maps and delivery settlement.

use super::delivery::{Delivery, IncomingTransfer, OutgoingDelivery, PendingSend};
use super::link::{serial_diff, Link, Reply};
use super::state::{transition, Event, LinkState, SessionState, SESSION_TRANSITIONS};
use crate::error::ClientError;
use amqpx_protocol::codec;
use amqpx_protocol::definitions::{DeliveryNumber, Handle, TransferNumber};
use amqpx_protocol::performative::{Begin, Disposition, Flow, Transfer};
use amqpx_protocol::{
    AmqpError, DeliveryState, ErrorCondition, Frame, Message, Outcome, Performative, Role,
    FRAME_HEADER_SIZE,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Incoming and outgoing session window, in transfer frames.
pub const DEFAULT_WINDOW: u32 = 2048;

/// Keys of `map` within the wrapping range `first..=last`.
pub(crate) fn ids_in_range<V>(
    map: &BTreeMap<DeliveryNumber, V>,
    first: DeliveryNumber,
    last: DeliveryNumber,
) -> Vec<DeliveryNumber> {
    if first <= last {
        map.range(first..=last).map(|(id, _)| *id).collect()
    } else {
        map.range(first..)
            .chain(map.range(..=last))
            .map(|(id, _)| *id)
            .collect()
    }
}

pub(crate) struct Session {
    pub channel: u16,
    pub remote_channel: Option<u16>,
    pub state: SessionState,

    pub next_outgoing_id: TransferNumber,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub next_incoming_id: TransferNumber,
    pub remote_incoming_window: u32,
    pub remote_outgoing_window: u32,
    pub remote_handle_max: Handle,

    pub next_delivery_id: DeliveryNumber,
    pub links: BTreeMap<Handle, Link>,
    remote_handles: HashMap<Handle, Handle>,
    /// Sent, unsettled deliveries. Kept across link detach.
    pub unsettled: BTreeMap<DeliveryNumber, OutgoingDelivery>,
    /// Received, unsettled deliveries and the link they arrived on.
    pub incoming_unsettled: BTreeMap<DeliveryNumber, Handle>,

    pub begin_reply: Option<Reply<u16>>,
    pub end_reply: Option<Reply<()>>,
}

impl Session {
    pub fn new(channel: u16) -> Self {
        Self {
            channel,
            remote_channel: None,
            state: SessionState::Unmapped,
            next_outgoing_id: 0,
            incoming_window: DEFAULT_WINDOW,
            outgoing_window: DEFAULT_WINDOW,
            next_incoming_id: 0,
            remote_incoming_window: 0,
            remote_outgoing_window: 0,
            remote_handle_max: Handle::MAX,
            next_delivery_id: 0,
            links: BTreeMap::new(),
            remote_handles: HashMap::new(),
            unsettled: BTreeMap::new(),
            incoming_unsettled: BTreeMap::new(),
            begin_reply: None,
            end_reply: None,
        }
    }

    pub fn apply(&mut self, event: Event) -> Result<(), ClientError> {
        self.state = transition(SESSION_TRANSITIONS, "session", self.state, event)?;
        Ok(())
    }

    pub fn is_mapped(&self) -> bool {
        self.state == SessionState::Mapped
    }

    /// The begin we send. `remote_channel` is set when answering the peer.
    pub fn begin(&self) -> Begin {
        Begin {
            remote_channel: self.remote_channel,
            next_outgoing_id: self.next_outgoing_id,
            incoming_window: self.incoming_window,
            outgoing_window: self.outgoing_window,
            handle_max: Handle::MAX,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        }
    }

    /// Applies the peer's begin.
    pub fn remote_begin(&mut self, remote_channel: u16, begin: &Begin) -> Result<(), ClientError> {
        self.apply(Event::RecvOpen)?;
        self.remote_channel = Some(remote_channel);
        self.next_incoming_id = begin.next_outgoing_id;
        self.remote_incoming_window = begin.incoming_window;
        self.remote_outgoing_window = begin.outgoing_window;
        self.remote_handle_max = begin.handle_max;
        Ok(())
    }

    /// Lowest free local handle.
    pub fn allocate_handle(&self) -> Option<Handle> {
        (0..=self.remote_handle_max).find(|h| !self.links.contains_key(h))
    }

    pub fn map_remote_handle(&mut self, remote: Handle, local: Handle) -> Result<(), ClientError> {
        if self.remote_handles.contains_key(&remote) {
            return Err(ClientError::ProtocolViolation(format!(
                "handle {} already in use",
                remote
            )));
        }
        self.remote_handles.insert(remote, local);
        Ok(())
    }

    pub fn unmap_remote_handle(&mut self, remote: Handle) {
        self.remote_handles.remove(&remote);
    }

    /// Resolves a handle chosen by the peer to our local handle.
    pub fn local_handle(&self, remote: Handle) -> Result<Handle, ClientError> {
        self.remote_handles.get(&remote).copied().ok_or_else(|| {
            ClientError::ProtocolViolation(format!("unattached handle {}", remote))
        })
    }

    /// Session-level flow fields.
    pub fn flow(&self) -> Flow {
        Flow {
            next_incoming_id: Some(self.next_incoming_id),
            incoming_window: self.incoming_window,
            next_outgoing_id: self.next_outgoing_id,
            outgoing_window: self.outgoing_window,
            ..Default::default()
        }
    }

    /// Session flow plus the state of one link.
    pub fn link_flow(&self, handle: Handle) -> Option<Flow> {
        let link = self.links.get(&handle)?;
        let mut flow = self.flow();
        link.flow_fields(&mut flow);
        Some(flow)
    }

    /// Applies the session fields of a flow from the peer.
    pub fn remote_flow(&mut self, flow: &Flow) {
        // A missing next-incoming-id means the peer has not seen our begin;
        // our initial outgoing id is zero.
        let next_incoming = flow.next_incoming_id.unwrap_or(0);
        let limit = next_incoming.wrapping_add(flow.incoming_window);
        self.remote_incoming_window = serial_diff(limit, self.next_outgoing_id).max(0) as u32;
        self.remote_outgoing_window = flow.outgoing_window;
    }

    /// Accounts for an inbound transfer frame. Returns true when the
    /// incoming window fell below half and should be re-opened.
    pub fn receive_window(&mut self) -> Result<bool, ClientError> {
        if self.incoming_window == 0 {
            return Err(ClientError::Remote(AmqpError::new(
                ErrorCondition::WindowViolation,
                "transfer beyond incoming window",
            )));
        }
        self.incoming_window -= 1;
        self.next_incoming_id = self.next_incoming_id.wrapping_add(1);
        if self.incoming_window < DEFAULT_WINDOW / 2 {
            self.incoming_window = DEFAULT_WINDOW;
            return Ok(true);
        }
        Ok(false)
    }

    /// Writes queued messages on every sender link as far as link credit
    /// and the peer's incoming window allow.
    pub fn pump(&mut self, max_frame_size: u32, out: &mut VecDeque<Frame>) -> Result<(), ClientError> {
        let handles: Vec<Handle> = self.links.keys().copied().collect();
        for handle in handles {
            self.pump_link(handle, max_frame_size, out)?;
            if self.remote_incoming_window == 0 {
                break;
            }
        }
        Ok(())
    }

    fn pump_link(
        &mut self,
        handle: Handle,
        max_frame_size: u32,
        out: &mut VecDeque<Frame>,
    ) -> Result<(), ClientError> {
        let Some(link) = self.links.get_mut(&handle) else {
            return Ok(());
        };
        if !link.is_sender() || link.state != LinkState::Attached {
            return Ok(());
        }

        while self.remote_incoming_window > 0 {
            // Sends whose caller went away are dropped before they start.
            while link
                .queue
                .front()
                .is_some_and(|p| !p.started() && p.reply.is_closed())
            {
                link.queue.pop_front();
            }
            let Some(started) = link.queue.front().map(PendingSend::started) else {
                break;
            };

            let mut transfer = Transfer {
                handle: link.handle,
                ..Default::default()
            };
            if !started {
                if link.link_credit == 0 {
                    break;
                }
                let delivery_id = self.next_delivery_id;
                self.next_delivery_id = self.next_delivery_id.wrapping_add(1);
                link.link_credit -= 1;
                link.delivery_count = link.delivery_count.wrapping_add(1);

                transfer.delivery_id = Some(delivery_id);
                transfer.delivery_tag = Some(link.next_tag());
                transfer.message_format = Some(amqpx_protocol::message::MESSAGE_FORMAT);
            }

            let Some(pending) = link.queue.front_mut() else {
                break;
            };
            if !started {
                pending.delivery_id = transfer.delivery_id;
                transfer.settled = Some(pending.settled);
            }

            let capacity = transfer_capacity(&transfer, max_frame_size)?;
            let end = pending.offset + pending.remaining().min(capacity);
            let chunk = pending.payload.slice(pending.offset..end);
            pending.offset = end;
            transfer.more = pending.remaining() > 0;
            let done = !transfer.more;

            out.push_back(Frame::transfer(self.channel, transfer, chunk));
            self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
            self.remote_incoming_window -= 1;

            if done {
                if let Some(pending) = link.queue.pop_front() {
                    match (pending.settled, pending.delivery_id) {
                        (false, Some(id)) => {
                            self.unsettled.insert(
                                id,
                                OutgoingDelivery {
                                    handle,
                                    reply: pending.reply,
                                },
                            );
                        }
                        _ => {
                            let _ = pending.reply.send(Ok(None));
                        }
                    }
                }
            }
        }
        link.available = link.queue.len() as u32;
        Ok(())
    }

    /// Accepts one transfer frame for a receiver link. Returns the
    /// delivery once its last frame has arrived.
    pub fn receive_transfer(
        &mut self,
        handle: Handle,
        transfer: &Transfer,
        payload: Bytes,
    ) -> Result<Option<IncomingTransfer>, ClientError> {
        let Some(link) = self.links.get_mut(&handle) else {
            return Err(ClientError::ProtocolViolation(format!(
                "transfer on unknown handle {}",
                handle
            )));
        };
        if link.is_sender() || link.state != LinkState::Attached {
            return Err(ClientError::ProtocolViolation(format!(
                "transfer on link '{}' in state {:?}",
                link.name, link.state
            )));
        }

        let mut partial = match link.partial.take() {
            Some(partial) => {
                if transfer
                    .delivery_id
                    .is_some_and(|id| id != partial.delivery_id)
                {
                    return Err(ClientError::ProtocolViolation(format!(
                        "transfer for delivery {:?} while delivery {} is incomplete",
                        transfer.delivery_id, partial.delivery_id
                    )));
                }
                partial
            }
            None => {
                let delivery_id = transfer.delivery_id.ok_or_else(|| {
                    ClientError::ProtocolViolation("transfer without delivery-id".to_string())
                })?;
                link.consume_credit()?;
                IncomingTransfer::new(
                    delivery_id,
                    transfer.delivery_tag.clone().unwrap_or_default(),
                    false,
                )
            }
        };

        if transfer.settled == Some(true) {
            partial.settled = true;
        }
        if transfer.aborted {
            tracing::debug!("Discarding aborted delivery {}", partial.delivery_id);
            return Ok(None);
        }
        partial.payload.extend_from_slice(&payload);
        if transfer.more {
            link.partial = Some(partial);
            return Ok(None);
        }
        Ok(Some(partial))
    }

    /// Decodes a complete inbound delivery and hands it to the application.
    pub fn deliver(&mut self, handle: Handle, incoming: IncomingTransfer, out: &mut VecDeque<Frame>) {
        let IncomingTransfer {
            delivery_id,
            tag,
            settled,
            payload,
        } = incoming;

        let message = match Message::decode(payload.freeze()) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Rejecting undecodable delivery {}: {}", delivery_id, e);
                if !settled {
                    let error = AmqpError::new(ErrorCondition::DecodeError, e.to_string());
                    self.queue_settle(delivery_id, Outcome::Rejected(Some(error)), out);
                }
                return;
            }
        };

        if !settled {
            self.incoming_unsettled.insert(delivery_id, handle);
        }
        let Some(link) = self.links.get_mut(&handle) else {
            return;
        };
        let delivery = Delivery {
            channel: self.channel,
            handle,
            delivery_id,
            tag,
            settled,
            message,
        };
        let auto_accept = link.auto_accept && !settled;
        match link.hand_off(delivery) {
            None if auto_accept => self.settle(delivery_id, Outcome::Accepted, out),
            None => {}
            Some(delivery) => link.prefetched.push_back(delivery),
        }
    }

    /// Settles a received delivery with `outcome`. Already settled
    /// deliveries are ignored.
    pub fn settle(&mut self, delivery_id: DeliveryNumber, outcome: Outcome, out: &mut VecDeque<Frame>) {
        if self.incoming_unsettled.remove(&delivery_id).is_some() {
            self.queue_settle(delivery_id, outcome, out);
        }
    }

    fn queue_settle(&self, delivery_id: DeliveryNumber, outcome: Outcome, out: &mut VecDeque<Frame>) {
        let disposition = Disposition {
            role: Role::Receiver,
            first: delivery_id,
            last: None,
            settled: true,
            state: Some(DeliveryState::Outcome(outcome)),
            batchable: false,
        };
        out.push_back(Frame::amqp(self.channel, disposition));
    }

    /// Applies a disposition from the peer.
    pub fn remote_disposition(&mut self, disposition: &Disposition, out: &mut VecDeque<Frame>) {
        let first = disposition.first;
        let last = disposition.last.unwrap_or(first);

        match disposition.role {
            // The peer received our deliveries.
            Role::Receiver => {
                let outcome = disposition
                    .state
                    .as_ref()
                    .and_then(DeliveryState::outcome)
                    .cloned();
                for id in ids_in_range(&self.unsettled, first, last) {
                    if outcome.is_none() && !disposition.settled {
                        // Interim state only.
                        continue;
                    }
                    let Some(delivery) = self.unsettled.remove(&id) else {
                        continue;
                    };
                    tracing::debug!(
                        delivery_id = id,
                        "Delivery settled: {}",
                        outcome.as_ref().map(Outcome::name).unwrap_or("none")
                    );
                    let _ = delivery.reply.send(Ok(outcome.clone()));
                    if !disposition.settled {
                        let settle = Disposition {
                            role: Role::Sender,
                            first: id,
                            last: None,
                            settled: true,
                            state: disposition.state.clone(),
                            batchable: false,
                        };
                        out.push_back(Frame::amqp(self.channel, settle));
                    }
                }
            }
            // The peer settled deliveries it sent us.
            Role::Sender => {
                if disposition.settled {
                    for id in ids_in_range(&self.incoming_unsettled, first, last) {
                        self.incoming_unsettled.remove(&id);
                    }
                }
            }
        }
    }

    /// Fails everything pending in this session.
    pub fn fail(&mut self, err: &ClientError) {
        let delivery_err = ClientError::DeliveryFailed(err.to_string());
        for link in self.links.values_mut() {
            link.fail(err, &delivery_err);
        }
        for (_, delivery) in std::mem::take(&mut self.unsettled) {
            let _ = delivery.reply.send(Err(delivery_err.clone()));
        }
        self.incoming_unsettled.clear();
        if let Some(reply) = self.begin_reply.take() {
            let _ = reply.send(Err(err.clone()));
        }
        if let Some(reply) = self.end_reply.take() {
            let _ = reply.send(Err(err.clone()));
        }
    }
}

/// Payload bytes that fit in one transfer frame after its header and
/// performative.
fn transfer_capacity(transfer: &Transfer, max_frame_size: u32) -> Result<usize, ClientError> {
    // Measure with `more` set, the larger of the two encodings.
    let mut sizing = transfer.clone();
    sizing.more = true;
    let overhead = FRAME_HEADER_SIZE + codec::to_bytes(&Performative::Transfer(sizing).to_value())?.len();
    let max = max_frame_size as usize;
    if max <= overhead {
        return Err(ClientError::InvalidArgument(format!(
            "max frame size {} leaves no room for payload",
            max_frame_size
        )));
    }
    Ok(max - overhead)
}
