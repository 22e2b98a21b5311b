//! Link endpoint: credit, delivery counting and the per-link queues.

use super::delivery::{Delivery, IncomingTransfer, PendingSend};
use super::state::{transition, Event, LinkState, LINK_TRANSITIONS};
use crate::error::ClientError;
use amqpx_protocol::definitions::{Handle, SequenceNo};
use amqpx_protocol::performative::{Attach, Flow, Source, Target};
use amqpx_protocol::{Role, SenderSettleMode};
use bytes::Bytes;
use std::collections::VecDeque;
use tokio::sync::oneshot;

pub(crate) type ReceiveReply = oneshot::Sender<Result<Delivery, ClientError>>;
pub(crate) type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

/// What the application asked for when attaching a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LinkSpec {
    pub role: Role,
    pub address: String,
    pub name: Option<String>,
    /// Sender only: transfer every message pre-settled.
    pub presettled: bool,
    /// Receiver only: credit window kept open towards the sender.
    pub prefetch: u32,
    /// Receiver only: accept deliveries when handed to the application.
    pub auto_accept: bool,
}

/// Signed distance from `from` to `to` in serial number arithmetic.
pub(crate) fn serial_diff(to: SequenceNo, from: SequenceNo) -> i64 {
    to.wrapping_sub(from) as i32 as i64
}

fn credit_between(limit: SequenceNo, delivery_count: SequenceNo) -> u32 {
    serial_diff(limit, delivery_count).max(0) as u32
}

pub(crate) struct Link {
    pub name: String,
    pub handle: Handle,
    pub remote_handle: Option<Handle>,
    pub role: Role,
    pub address: String,
    pub state: LinkState,

    pub delivery_count: SequenceNo,
    pub link_credit: u32,
    pub available: u32,
    pub drain: bool,

    // sender side
    pub presettled: bool,
    pub queue: VecDeque<PendingSend>,
    next_tag: u64,

    // receiver side
    pub prefetch: u32,
    pub auto_accept: bool,
    pub prefetched: VecDeque<Delivery>,
    pub waiters: VecDeque<ReceiveReply>,
    pub partial: Option<IncomingTransfer>,

    /// Set when the peer attached without the terminus we asked for; the
    /// detach that follows carries the reason.
    pub refused: bool,
    pub attach_reply: Option<Reply<Handle>>,
    pub detach_reply: Option<Reply<()>>,
    pub drain_reply: Option<Reply<()>>,
}

impl Link {
    pub fn new(handle: Handle, name: String, spec: LinkSpec) -> Self {
        Self {
            name,
            handle,
            remote_handle: None,
            role: spec.role,
            address: spec.address,
            state: LinkState::Detached,
            delivery_count: 0,
            link_credit: 0,
            available: 0,
            drain: false,
            presettled: spec.presettled,
            queue: VecDeque::new(),
            next_tag: 0,
            prefetch: spec.prefetch,
            auto_accept: spec.auto_accept,
            prefetched: VecDeque::new(),
            waiters: VecDeque::new(),
            partial: None,
            refused: false,
            attach_reply: None,
            detach_reply: None,
            drain_reply: None,
        }
    }

    pub fn is_sender(&self) -> bool {
        self.role == Role::Sender
    }

    pub fn apply(&mut self, event: Event) -> Result<(), ClientError> {
        self.state = transition(LINK_TRANSITIONS, "link", self.state, event)?;
        Ok(())
    }

    /// The attach we send for this link.
    pub fn attach(&self) -> Attach {
        let mut attach = Attach::new(self.name.clone(), self.handle, self.role);
        match self.role {
            Role::Sender => {
                attach.snd_settle_mode = if self.presettled {
                    SenderSettleMode::Settled
                } else {
                    SenderSettleMode::Mixed
                };
                attach.source = Some(Source::default());
                attach.target = Some(Target::new(self.address.clone()));
                attach.initial_delivery_count = Some(self.delivery_count);
            }
            Role::Receiver => {
                attach.source = Some(Source::new(self.address.clone()));
                attach.target = Some(Target::default());
            }
        }
        attach
    }

    /// Applies the peer's attach.
    pub fn remote_attach(&mut self, attach: &Attach) -> Result<(), ClientError> {
        self.apply(Event::RecvOpen)?;
        self.remote_handle = Some(attach.handle);
        match self.role {
            Role::Sender => self.refused = attach.target.is_none(),
            Role::Receiver => {
                self.refused = attach.source.is_none();
                self.delivery_count = attach.initial_delivery_count.unwrap_or(0);
            }
        }
        Ok(())
    }

    pub fn next_tag(&mut self) -> Bytes {
        let tag = Bytes::copy_from_slice(&self.next_tag.to_be_bytes());
        self.next_tag = self.next_tag.wrapping_add(1);
        tag
    }

    /// Fills in the link fields of a flow.
    pub fn flow_fields(&self, flow: &mut Flow) {
        flow.handle = Some(self.handle);
        flow.delivery_count = Some(self.delivery_count);
        flow.link_credit = Some(self.link_credit);
        flow.available = Some(self.available);
        flow.drain = self.drain;
    }

    /// Applies a link flow from the peer. Returns true when the peer asked
    /// for our link state back.
    pub fn remote_flow(&mut self, flow: &Flow) -> bool {
        match self.role {
            Role::Sender => {
                // Without a delivery count the peer has not seen any of
                // our transfers yet.
                let remote_count = flow.delivery_count.unwrap_or(0);
                let limit = remote_count.wrapping_add(flow.link_credit.unwrap_or(0));
                self.link_credit = credit_between(limit, self.delivery_count);
                self.drain = flow.drain;
            }
            Role::Receiver => {
                let limit = self.delivery_count.wrapping_add(self.link_credit);
                if let Some(remote_count) = flow.delivery_count {
                    self.delivery_count = remote_count;
                }
                self.link_credit = credit_between(limit, self.delivery_count);
                self.available = flow.available.unwrap_or(0);
                if self.drain && self.link_credit == 0 {
                    self.finish_drain();
                }
            }
        }
        flow.echo
    }

    /// Sender: the peer asked to drain and nothing is queued, so the
    /// remaining credit is consumed. Returns true when a flow must be sent.
    pub fn drain_credit(&mut self) -> bool {
        if self.drain && self.queue.is_empty() && self.link_credit > 0 {
            self.delivery_count = self.delivery_count.wrapping_add(self.link_credit);
            self.link_credit = 0;
            true
        } else {
            false
        }
    }

    /// Receiver: starts a drain. Returns true when a flow must be sent.
    pub fn start_drain(&mut self, reply: Reply<()>) -> bool {
        if self.link_credit == 0 {
            let _ = reply.send(Ok(()));
            return false;
        }
        if let Some(previous) = self.drain_reply.replace(reply) {
            let _ = previous.send(Ok(()));
        }
        self.drain = true;
        true
    }

    fn finish_drain(&mut self) {
        self.drain = false;
        if let Some(reply) = self.drain_reply.take() {
            let _ = reply.send(Ok(()));
        }
    }

    /// Receiver: accounts for the first frame of an inbound delivery.
    pub fn consume_credit(&mut self) -> Result<(), ClientError> {
        if self.link_credit == 0 {
            return Err(ClientError::ProtocolViolation(format!(
                "transfer on link '{}' without credit",
                self.name
            )));
        }
        self.link_credit -= 1;
        self.delivery_count = self.delivery_count.wrapping_add(1);
        if self.drain && self.link_credit == 0 {
            self.finish_drain();
        }
        Ok(())
    }

    /// Gives a delivery to the first live receive call. Returns it back when
    /// nobody is waiting.
    pub fn hand_off(&mut self, mut delivery: Delivery) -> Option<Delivery> {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.is_closed() {
                continue;
            }
            match waiter.send(Ok(delivery)) {
                Ok(()) => return None,
                Err(Ok(returned)) => delivery = returned,
                Err(Err(_)) => return None,
            }
        }
        Some(delivery)
    }

    /// Receiver: tops up credit when the outstanding window falls to half
    /// the prefetch. Returns true when a flow must be sent.
    pub fn replenish(&mut self) -> bool {
        if self.role != Role::Receiver || self.state != LinkState::Attached || self.drain {
            return false;
        }
        self.waiters.retain(|w| !w.is_closed());
        let buffered = self.prefetched.len() as u32;

        if self.prefetch == 0 {
            // Credit on demand, one message per waiting receive.
            let wanted = (self.waiters.len() as u32).saturating_sub(buffered);
            if wanted > self.link_credit {
                self.link_credit = wanted;
                return true;
            }
            return false;
        }

        let outstanding = self.link_credit.saturating_add(buffered);
        if outstanding <= self.prefetch / 2 {
            let credit = self.prefetch.saturating_sub(buffered);
            if credit > self.link_credit {
                self.link_credit = credit;
                return true;
            }
        }
        false
    }

    /// Fails everything pending on this link.
    pub fn fail(&mut self, err: &ClientError, delivery_err: &ClientError) {
        for pending in self.queue.drain(..) {
            pending.fail(delivery_err.clone());
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        if let Some(reply) = self.attach_reply.take() {
            let _ = reply.send(Err(err.clone()));
        }
        if let Some(reply) = self.drain_reply.take() {
            let _ = reply.send(Err(err.clone()));
        }
        if let Some(reply) = self.detach_reply.take() {
            let _ = reply.send(Err(err.clone()));
        }
        self.partial = None;
        self.available = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(role: Role, prefetch: u32) -> LinkSpec {
        LinkSpec {
            role,
            address: "queue".to_string(),
            name: None,
            presettled: false,
            prefetch,
            auto_accept: false,
        }
    }

    fn attached(role: Role, prefetch: u32) -> Link {
        let mut link = Link::new(0, "test".to_string(), spec(role, prefetch));
        link.state = LinkState::Attached;
        link
    }

    fn flow(delivery_count: Option<u32>, link_credit: u32) -> Flow {
        Flow {
            delivery_count,
            link_credit: Some(link_credit),
            ..Default::default()
        }
    }

    #[test]
    fn test_serial_diff_wraps() {
        assert_eq!(serial_diff(5, 3), 2);
        assert_eq!(serial_diff(3, 5), -2);
        assert_eq!(serial_diff(1, u32::MAX), 2);
    }

    #[test]
    fn test_sender_credit_formula() {
        let mut link = attached(Role::Sender, 0);
        link.remote_flow(&flow(None, 10));
        assert_eq!(link.link_credit, 10);

        // Three transfers in flight when the peer's flow was written.
        link.delivery_count = 3;
        link.link_credit = 7;
        link.remote_flow(&flow(Some(0), 10));
        assert_eq!(link.link_credit, 7);

        link.remote_flow(&flow(Some(3), 10));
        assert_eq!(link.link_credit, 10);
    }

    #[test]
    fn test_sender_credit_across_wrap() {
        let mut link = attached(Role::Sender, 0);
        link.delivery_count = u32::MAX - 1;
        link.remote_flow(&flow(Some(u32::MAX - 1), 5));
        assert_eq!(link.link_credit, 5);
    }

    #[test]
    fn test_stale_flow_never_goes_negative() {
        let mut link = attached(Role::Sender, 0);
        link.delivery_count = 10;
        link.remote_flow(&flow(Some(2), 3));
        assert_eq!(link.link_credit, 0);
    }

    #[test]
    fn test_sender_drain_consumes_credit() {
        let mut link = attached(Role::Sender, 0);
        let mut drain = flow(Some(0), 4);
        drain.drain = true;
        link.remote_flow(&drain);
        assert!(link.drain_credit());
        assert_eq!(link.delivery_count, 4);
        assert_eq!(link.link_credit, 0);
        assert!(!link.drain_credit());
    }

    #[test]
    fn test_receiver_consume_credit() {
        let mut link = attached(Role::Receiver, 2);
        assert!(link.consume_credit().is_err());

        link.link_credit = 1;
        link.consume_credit().unwrap();
        assert_eq!(link.delivery_count, 1);
        assert!(matches!(
            link.consume_credit(),
            Err(ClientError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_receiver_drain_completes_on_flow() {
        let mut link = attached(Role::Receiver, 10);
        link.link_credit = 10;
        let (tx, mut rx) = oneshot::channel();
        assert!(link.start_drain(tx));
        assert!(link.drain);

        // Sender advanced its count by the unused credit.
        link.remote_flow(&flow(Some(10), 0));
        assert!(!link.drain);
        assert_eq!(link.link_credit, 0);
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_drain_without_credit_completes_immediately() {
        let mut link = attached(Role::Receiver, 0);
        let (tx, mut rx) = oneshot::channel();
        assert!(!link.start_drain(tx));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_replenish_at_half_prefetch() {
        let mut link = attached(Role::Receiver, 10);
        assert!(link.replenish());
        assert_eq!(link.link_credit, 10);
        assert!(!link.replenish());

        link.link_credit = 6;
        assert!(!link.replenish());
        link.link_credit = 5;
        assert!(link.replenish());
        assert_eq!(link.link_credit, 10);
    }

    #[test]
    fn test_replenish_on_demand_without_prefetch() {
        let mut link = attached(Role::Receiver, 0);
        assert!(!link.replenish());

        let (tx, _rx) = oneshot::channel();
        link.waiters.push_back(tx);
        assert!(link.replenish());
        assert_eq!(link.link_credit, 1);
        assert!(!link.replenish());
    }

    #[test]
    fn test_hand_off_skips_closed_waiters() {
        let mut link = attached(Role::Receiver, 0);
        let (closed_tx, closed_rx) = oneshot::channel();
        drop(closed_rx);
        let (tx, mut rx) = oneshot::channel();
        link.waiters.push_back(closed_tx);
        link.waiters.push_back(tx);

        let delivery = Delivery {
            channel: 0,
            handle: 0,
            delivery_id: 7,
            tag: Bytes::from_static(b"t"),
            settled: false,
            message: amqpx_protocol::Message::with_text("hi"),
        };
        assert!(link.hand_off(delivery.clone()).is_none());
        assert_eq!(rx.try_recv().unwrap().unwrap().delivery_id, 7);

        // No waiter left: the delivery comes back.
        assert_eq!(link.hand_off(delivery).unwrap().delivery_id, 7);
    }

    #[test]
    fn test_tags_are_unique() {
        let mut link = attached(Role::Sender, 0);
        let a = link.next_tag();
        let b = link.next_tag();
        assert_ne!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn test_attach_termini() {
        let sender = Link::new(1, "s".to_string(), spec(Role::Sender, 0)).attach();
        assert_eq!(sender.target.unwrap().address.as_deref(), Some("queue"));
        assert_eq!(sender.initial_delivery_count, Some(0));

        let receiver = Link::new(2, "r".to_string(), spec(Role::Receiver, 0)).attach();
        assert_eq!(receiver.source.unwrap().address.as_deref(), Some("queue"));
        assert_eq!(receiver.initial_delivery_count, None);
    }
}
