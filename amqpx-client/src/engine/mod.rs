//! Protocol engine.
//!
//! The engine owns every endpoint state machine and does no I/O: frames
//! from the peer go in through [`Engine::handle_frame`], application
//! requests through [`Engine::handle_command`], and frames to write come
//! out of [`Engine::pop_outbound`]. The driver task moves bytes between
//! the engine and the transport.

pub(crate) mod delivery;
pub(crate) mod link;
pub(crate) mod session;
pub(crate) mod state;

pub use delivery::Delivery;

use crate::error::ClientError;
use amqpx_protocol::definitions::{DeliveryNumber, Handle};
use amqpx_protocol::performative::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Transfer,
};
use amqpx_protocol::{
    AmqpError, ErrorCondition, Frame, FrameBody, Outcome, Performative, ProtocolHeader, Role,
    MIN_MAX_FRAME_SIZE,
};
use bytes::Bytes;
use delivery::{PendingSend, SendReply};
use link::{Link, LinkSpec, ReceiveReply, Reply};
use session::Session;
use state::{transition, ConnectionState, Event, LinkState, SessionState, CONNECTION_TRANSITIONS};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

/// Local connection parameters sent in our open.
#[derive(Debug, Clone)]
pub(crate) struct EngineConfig {
    pub container_id: String,
    pub hostname: Option<String>,
    pub max_frame_size: u32,
    pub channel_max: u16,
    pub idle_timeout: Option<Duration>,
}

/// An application request, answered through its reply channel.
#[derive(Debug)]
pub(crate) enum Command {
    Begin {
        reply: Reply<u16>,
    },
    End {
        channel: u16,
        reply: Reply<()>,
    },
    Attach {
        channel: u16,
        spec: LinkSpec,
        reply: Reply<Handle>,
    },
    Detach {
        channel: u16,
        handle: Handle,
        reply: Reply<()>,
    },
    Send {
        channel: u16,
        handle: Handle,
        payload: Bytes,
        reply: SendReply,
    },
    Receive {
        channel: u16,
        handle: Handle,
        reply: ReceiveReply,
    },
    Settle {
        channel: u16,
        delivery_id: DeliveryNumber,
        outcome: Outcome,
        reply: Reply<()>,
    },
    Credit {
        channel: u16,
        handle: Handle,
        credit: u32,
        reply: Reply<()>,
    },
    Drain {
        channel: u16,
        handle: Handle,
        reply: Reply<()>,
    },
    Close {
        reply: Option<Reply<()>>,
    },
}

impl Command {
    /// Answers the command with `err` without running it.
    pub fn fail(self, err: ClientError) {
        match self {
            Command::Begin { reply } => {
                let _ = reply.send(Err(err));
            }
            Command::Attach { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Send { reply, .. } => {
                let _ = reply.send(Err(ClientError::DeliveryFailed(err.to_string())));
            }
            Command::Receive { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::End { reply, .. }
            | Command::Detach { reply, .. }
            | Command::Settle { reply, .. }
            | Command::Credit { reply, .. }
            | Command::Drain { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            // The connection is already gone, which is what close asked for.
            Command::Close { reply } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }
}

fn violation(message: impl Into<String>) -> ClientError {
    ClientError::ProtocolViolation(message.into())
}

/// Looks up the session for a frame from the peer. `None` means the
/// session is ending and the frame is dropped.
fn inbound_session<'a>(
    sessions: &'a mut BTreeMap<u16, Session>,
    remote_channels: &HashMap<u16, u16>,
    remote_channel: u16,
) -> Result<Option<&'a mut Session>, ClientError> {
    let channel = remote_channels
        .get(&remote_channel)
        .copied()
        .ok_or_else(|| violation(format!("frame on unmapped channel {}", remote_channel)))?;
    let session = sessions
        .get_mut(&channel)
        .ok_or_else(|| violation(format!("no session on channel {}", channel)))?;
    match session.state {
        SessionState::Mapped => Ok(Some(session)),
        SessionState::EndSent => Ok(None),
        state => Err(violation(format!(
            "frame for session on channel {} in state {:?}",
            channel, state
        ))),
    }
}

/// A session the application may use.
fn local_session(
    sessions: &mut BTreeMap<u16, Session>,
    channel: u16,
) -> Result<&mut Session, ClientError> {
    match sessions.get_mut(&channel) {
        Some(session) if session.is_mapped() => Ok(session),
        _ => Err(ClientError::SessionEnded),
    }
}

/// An attached link the application may use.
fn local_link(
    sessions: &mut BTreeMap<u16, Session>,
    channel: u16,
    handle: Handle,
) -> Result<&mut Session, ClientError> {
    let session = local_session(sessions, channel)?;
    match session.links.get(&handle) {
        Some(link) if link.state == LinkState::Attached => Ok(session),
        Some(link) => Err(ClientError::LinkDetached(format!(
            "link '{}' is not attached",
            link.name
        ))),
        None => Err(ClientError::LinkDetached(format!("no link on handle {}", handle))),
    }
}

/// Connection endpoint and everything below it.
pub(crate) struct Engine {
    config: EngineConfig,
    state: ConnectionState,
    remote_open: Option<Open>,
    sessions: BTreeMap<u16, Session>,
    /// Peer channel to local channel.
    remote_channels: HashMap<u16, u16>,
    outbound: VecDeque<Frame>,
    open_reply: Option<Reply<()>>,
    close_replies: Vec<Reply<()>>,
    error: Option<ClientError>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Start,
            remote_open: None,
            sessions: BTreeMap::new(),
            remote_channels: HashMap::new(),
            outbound: VecDeque::new(),
            open_reply: None,
            close_replies: Vec::new(),
            error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn is_closing(&self) -> bool {
        self.state == ConnectionState::CloseSent
    }

    /// Why the connection ended, once it has.
    pub fn error(&self) -> Option<&ClientError> {
        self.error.as_ref()
    }

    pub fn pop_outbound(&mut self) -> Option<Frame> {
        self.outbound.pop_front()
    }

    fn apply(&mut self, event: Event) -> Result<(), ClientError> {
        self.state = transition(CONNECTION_TRANSITIONS, "connection", self.state, event)?;
        Ok(())
    }

    /// Largest frame we may write. Until the peer's open arrives only the
    /// protocol minimum is safe.
    pub fn max_outbound_frame_size(&self) -> u32 {
        match &self.remote_open {
            Some(open) => self
                .config
                .max_frame_size
                .min(open.max_frame_size)
                .max(MIN_MAX_FRAME_SIZE),
            None => MIN_MAX_FRAME_SIZE,
        }
    }

    /// The peer's idle timeout, if it asked for heartbeats.
    pub fn remote_idle_timeout(&self) -> Option<Duration> {
        self.remote_open
            .as_ref()
            .and_then(|open| open.idle_time_out)
            .filter(|ms| *ms > 0)
            .map(|ms| Duration::from_millis(ms as u64))
    }

    /// Our idle timeout, enforced on inbound traffic.
    pub fn local_idle_timeout(&self) -> Option<Duration> {
        self.config.idle_timeout.filter(|t| !t.is_zero())
    }

    pub fn header_sent(&mut self) -> Result<(), ClientError> {
        self.apply(Event::SendHeader)
    }

    pub fn header_received(&mut self, header: ProtocolHeader) -> Result<(), ClientError> {
        if header != ProtocolHeader::Amqp {
            return Err(violation(format!("unexpected {:?} protocol header", header)));
        }
        self.apply(Event::RecvHeader)
    }

    /// Queues our open. `reply` completes when the peer's open arrives.
    pub fn open(&mut self, reply: Reply<()>) -> Result<(), ClientError> {
        self.apply(Event::SendOpen)?;
        let mut open = Open::new(self.config.container_id.clone());
        open.hostname = self.config.hostname.clone();
        open.max_frame_size = self.config.max_frame_size;
        open.channel_max = self.config.channel_max;
        open.idle_time_out = self
            .local_idle_timeout()
            .map(|t| t.as_millis().min(u32::MAX as u128) as u32);
        self.outbound.push_back(Frame::amqp(0, open));
        self.open_reply = Some(reply);
        Ok(())
    }

    /// Processes one frame from the peer. Violations close the connection.
    pub fn handle_frame(&mut self, frame: Frame) {
        if self.is_closed() {
            return;
        }
        if let Err(err) = self.dispatch(frame) {
            self.violation(err);
        }
    }

    fn dispatch(&mut self, frame: Frame) -> Result<(), ClientError> {
        let channel = frame.channel;
        let (performative, payload) = match frame.body {
            FrameBody::Empty => return Ok(()),
            FrameBody::Sasl(sasl) => {
                return Err(violation(format!("unexpected {} after SASL", sasl.name())))
            }
            FrameBody::Amqp {
                performative,
                payload,
            } => (performative, payload),
        };

        if self.state == ConnectionState::CloseSent
            && !matches!(performative, Performative::Close(_))
        {
            tracing::debug!("Ignoring {} while closing", performative.name());
            return Ok(());
        }

        match performative {
            Performative::Open(open) => self.on_open(open),
            Performative::Close(close) => self.on_close(close),
            other => {
                if self.state != ConnectionState::Opened {
                    return Err(violation(format!(
                        "{} in connection state {:?}",
                        other.name(),
                        self.state
                    )));
                }
                match other {
                    Performative::Begin(begin) => self.on_begin(channel, begin),
                    Performative::End(end) => self.on_end(channel, end),
                    Performative::Attach(attach) => self.on_attach(channel, attach),
                    Performative::Flow(flow) => self.on_flow(channel, flow),
                    Performative::Transfer(transfer) => {
                        self.on_transfer(channel, transfer, payload)
                    }
                    Performative::Disposition(disposition) => {
                        self.on_disposition(channel, disposition)
                    }
                    Performative::Detach(detach) => self.on_detach(channel, detach),
                    Performative::Open(_) | Performative::Close(_) => Ok(()),
                }
            }
        }
    }

    fn on_open(&mut self, open: Open) -> Result<(), ClientError> {
        self.apply(Event::RecvOpen)?;
        if open.max_frame_size < MIN_MAX_FRAME_SIZE {
            return Err(ClientError::Remote(AmqpError::new(
                ErrorCondition::FrameSizeTooSmall,
                format!("max-frame-size {} below {}", open.max_frame_size, MIN_MAX_FRAME_SIZE),
            )));
        }
        tracing::info!(
            "Connection opened by container '{}' (max frame {}, channel max {})",
            open.container_id,
            open.max_frame_size,
            open.channel_max
        );
        self.remote_open = Some(open);
        if let Some(reply) = self.open_reply.take() {
            let _ = reply.send(Ok(()));
        }
        Ok(())
    }

    fn on_close(&mut self, close: Close) -> Result<(), ClientError> {
        if self.state == ConnectionState::CloseSent {
            self.apply(Event::RecvClose)?;
            tracing::debug!("Close acknowledged by peer");
            let err = close
                .error
                .map(ClientError::Remote)
                .unwrap_or(ClientError::ConnectionClosed);
            self.shutdown(err);
            return Ok(());
        }

        self.apply(Event::RecvClose)?;
        let err = match close.error {
            Some(error) => {
                tracing::warn!("Connection closed by peer: {}", error);
                ClientError::Remote(error)
            }
            None => {
                tracing::info!("Connection closed by peer");
                ClientError::ConnectionClosed
            }
        };
        self.outbound.push_back(Frame::amqp(0, Close::default()));
        self.apply(Event::SendClose)?;
        self.shutdown(err);
        Ok(())
    }

    fn local_channel(&self, remote: u16) -> Result<u16, ClientError> {
        self.remote_channels
            .get(&remote)
            .copied()
            .ok_or_else(|| violation(format!("frame on unmapped channel {}", remote)))
    }

    fn channel_max(&self) -> u16 {
        let remote = self.remote_open.as_ref().map_or(u16::MAX, |o| o.channel_max);
        self.config.channel_max.min(remote)
    }

    fn allocate_channel(&self) -> Option<u16> {
        (0..=self.channel_max()).find(|c| !self.sessions.contains_key(c))
    }

    fn on_begin(&mut self, remote_channel: u16, begin: Begin) -> Result<(), ClientError> {
        if self.remote_channels.contains_key(&remote_channel) {
            return Err(violation(format!("channel {} already in use", remote_channel)));
        }

        match begin.remote_channel {
            Some(channel) => {
                let session = self
                    .sessions
                    .get_mut(&channel)
                    .ok_or_else(|| violation(format!("begin for unknown channel {}", channel)))?;
                session.remote_begin(remote_channel, &begin)?;
                self.remote_channels.insert(remote_channel, channel);
                tracing::debug!("Session mapped: channel {} <-> {}", channel, remote_channel);
                if let Some(reply) = session.begin_reply.take() {
                    let _ = reply.send(Ok(channel));
                }
            }
            None => {
                // Peer-initiated session: answer it so the channel is mapped.
                let channel = self.allocate_channel().ok_or_else(|| {
                    ClientError::Remote(AmqpError::new(
                        ErrorCondition::ResourceLimitExceeded,
                        "no free channel",
                    ))
                })?;
                let mut session = Session::new(channel);
                session.remote_begin(remote_channel, &begin)?;
                session.apply(Event::SendOpen)?;
                self.outbound
                    .push_back(Frame::amqp(channel, session.begin()));
                self.sessions.insert(channel, session);
                self.remote_channels.insert(remote_channel, channel);
                tracing::debug!("Accepted session from peer on channel {}", channel);
            }
        }
        Ok(())
    }

    fn on_end(&mut self, remote_channel: u16, end: End) -> Result<(), ClientError> {
        let channel = self.local_channel(remote_channel)?;
        let Some(mut session) = self.sessions.remove(&channel) else {
            return Err(violation(format!("end for unknown channel {}", channel)));
        };
        self.remote_channels.remove(&remote_channel);

        if session.state == SessionState::EndSent {
            session.apply(Event::RecvClose)?;
            if let Some(reply) = session.end_reply.take() {
                let _ = reply.send(Ok(()));
            }
            session.fail(&ClientError::SessionEnded);
            tracing::debug!("Session on channel {} ended", channel);
            return Ok(());
        }

        session.apply(Event::RecvClose)?;
        let err = match end.error {
            Some(error) => {
                tracing::warn!("Session on channel {} ended by peer: {}", channel, error);
                ClientError::Remote(error)
            }
            None => ClientError::SessionEnded,
        };
        self.outbound
            .push_back(Frame::amqp(channel, End::default()));
        session.apply(Event::SendClose)?;
        session.fail(&err);
        Ok(())
    }

    fn on_attach(&mut self, remote_channel: u16, attach: Attach) -> Result<(), ClientError> {
        let Some(session) =
            inbound_session(&mut self.sessions, &self.remote_channels, remote_channel)?
        else {
            return Ok(());
        };

        let handle = session
            .links
            .values()
            .find(|l| l.name == attach.name && l.state == LinkState::AttachSent)
            .map(|l| l.handle)
            .ok_or_else(|| violation(format!("unsolicited attach for link '{}'", attach.name)))?;
        session.map_remote_handle(attach.handle, handle)?;

        let Some(link) = session.links.get_mut(&handle) else {
            return Ok(());
        };
        if attach.role == link.role {
            return Err(violation(format!(
                "peer attached link '{}' with our own role",
                link.name
            )));
        }
        link.remote_attach(&attach)?;
        if link.refused {
            tracing::debug!("Link '{}' refused, waiting for detach", link.name);
            return Ok(());
        }
        tracing::debug!("Link '{}' attached on handle {}", link.name, handle);
        if let Some(reply) = link.attach_reply.take() {
            let _ = reply.send(Ok(handle));
        }
        let send_flow = link.replenish();

        if send_flow {
            if let Some(flow) = session.link_flow(handle) {
                self.outbound.push_back(Frame::amqp(session.channel, flow));
            }
        }
        Ok(())
    }

    fn on_flow(&mut self, remote_channel: u16, flow: Flow) -> Result<(), ClientError> {
        let max_frame_size = self.max_outbound_frame_size();
        let Some(session) =
            inbound_session(&mut self.sessions, &self.remote_channels, remote_channel)?
        else {
            return Ok(());
        };
        session.remote_flow(&flow);

        let Some(remote_handle) = flow.handle else {
            if flow.echo {
                self.outbound
                    .push_back(Frame::amqp(session.channel, session.flow()));
            }
            return session.pump(max_frame_size, &mut self.outbound);
        };

        let handle = session.local_handle(remote_handle)?;
        let Some(link) = session.links.get_mut(&handle) else {
            return Ok(());
        };
        match link.state {
            LinkState::Attached => {}
            LinkState::DetachSent => return Ok(()),
            state => {
                return Err(violation(format!(
                    "flow for link '{}' in state {:?}",
                    link.name, state
                )))
            }
        }

        let echo = link.remote_flow(&flow);
        let is_sender = link.is_sender();
        let mut send_flow = echo || (!is_sender && link.replenish());

        if is_sender {
            session.pump(max_frame_size, &mut self.outbound)?;
            if let Some(link) = session.links.get_mut(&handle) {
                send_flow |= link.drain_credit();
            }
        }
        if send_flow {
            if let Some(flow) = session.link_flow(handle) {
                self.outbound.push_back(Frame::amqp(session.channel, flow));
            }
        }
        Ok(())
    }

    fn on_transfer(
        &mut self,
        remote_channel: u16,
        transfer: Transfer,
        payload: Bytes,
    ) -> Result<(), ClientError> {
        let Some(session) =
            inbound_session(&mut self.sessions, &self.remote_channels, remote_channel)?
        else {
            return Ok(());
        };
        let reopen_window = session.receive_window()?;
        let handle = session.local_handle(transfer.handle)?;

        if session
            .links
            .get(&handle)
            .is_some_and(|l| l.state == LinkState::DetachSent)
        {
            tracing::debug!("Dropping transfer for detaching link {}", handle);
        } else if let Some(incoming) = session.receive_transfer(handle, &transfer, payload)? {
            session.deliver(handle, incoming, &mut self.outbound);
            let replenish = session
                .links
                .get_mut(&handle)
                .is_some_and(|l| l.replenish());
            if replenish {
                if let Some(flow) = session.link_flow(handle) {
                    self.outbound.push_back(Frame::amqp(session.channel, flow));
                }
            }
        }

        if reopen_window {
            self.outbound
                .push_back(Frame::amqp(session.channel, session.flow()));
        }
        Ok(())
    }

    fn on_disposition(
        &mut self,
        remote_channel: u16,
        disposition: Disposition,
    ) -> Result<(), ClientError> {
        let Some(session) =
            inbound_session(&mut self.sessions, &self.remote_channels, remote_channel)?
        else {
            return Ok(());
        };
        session.remote_disposition(&disposition, &mut self.outbound);
        Ok(())
    }

    fn on_detach(&mut self, remote_channel: u16, detach: Detach) -> Result<(), ClientError> {
        let Some(session) =
            inbound_session(&mut self.sessions, &self.remote_channels, remote_channel)?
        else {
            return Ok(());
        };
        let handle = session.local_handle(detach.handle)?;
        session.unmap_remote_handle(detach.handle);
        let Some(mut link) = session.links.remove(&handle) else {
            return Ok(());
        };

        if link.state == LinkState::DetachSent {
            link.apply(Event::RecvClose)?;
            if let Some(reply) = link.detach_reply.take() {
                let _ = reply.send(Ok(()));
            }
            tracing::debug!("Link '{}' detached", link.name);
            return Ok(());
        }

        let err = match detach.error {
            Some(error) => {
                tracing::warn!("Link '{}' detached by peer: {}", link.name, error);
                ClientError::Remote(error)
            }
            None if link.refused => {
                ClientError::LinkDetached(format!("link '{}' refused by peer", link.name))
            }
            None => ClientError::LinkDetached(format!("link '{}' detached by peer", link.name)),
        };
        link.apply(Event::RecvClose)?;
        let reply = Detach {
            handle,
            closed: true,
            error: None,
        };
        self.outbound.push_back(Frame::amqp(session.channel, reply));
        link.apply(Event::SendClose)?;
        link.fail(&err, &ClientError::DeliveryFailed(err.to_string()));
        Ok(())
    }

    /// Runs one application request.
    pub fn handle_command(&mut self, command: Command) {
        match self.state {
            ConnectionState::Closed => {
                let err = self.error.clone().unwrap_or(ClientError::ConnectionClosed);
                command.fail(err);
                return;
            }
            ConnectionState::CloseSent | ConnectionState::CloseReceived => {
                if let Command::Close { reply: Some(reply) } = command {
                    self.close_replies.push(reply);
                } else {
                    command.fail(ClientError::ConnectionClosed);
                }
                return;
            }
            _ => {}
        }

        let max_frame_size = self.max_outbound_frame_size();
        match command {
            Command::Begin { reply } => self.begin(reply),
            Command::End { channel, reply } => self.end(channel, reply),
            Command::Attach {
                channel,
                spec,
                reply,
            } => self.attach(channel, spec, reply),
            Command::Detach {
                channel,
                handle,
                reply,
            } => self.detach(channel, handle, reply),
            Command::Send {
                channel,
                handle,
                payload,
                reply,
            } => {
                if let Err(err) = self.send(channel, handle, payload, reply, max_frame_size) {
                    self.violation(err);
                }
            }
            Command::Receive {
                channel,
                handle,
                reply,
            } => self.receive(channel, handle, reply),
            Command::Settle {
                channel,
                delivery_id,
                outcome,
                reply,
            } => match local_session(&mut self.sessions, channel) {
                Ok(session) => {
                    session.settle(delivery_id, outcome, &mut self.outbound);
                    let _ = reply.send(Ok(()));
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Command::Credit {
                channel,
                handle,
                credit,
                reply,
            } => self.credit(channel, handle, credit, reply),
            Command::Drain {
                channel,
                handle,
                reply,
            } => self.drain(channel, handle, reply),
            Command::Close { reply } => self.close(reply),
        }
    }

    fn begin(&mut self, reply: Reply<u16>) {
        let Some(channel) = self.allocate_channel() else {
            let _ = reply.send(Err(ClientError::InvalidArgument(
                "no free channel".to_string(),
            )));
            return;
        };
        let mut session = Session::new(channel);
        if let Err(err) = session.apply(Event::SendOpen) {
            let _ = reply.send(Err(err));
            return;
        }
        self.outbound.push_back(Frame::amqp(channel, session.begin()));
        session.begin_reply = Some(reply);
        self.sessions.insert(channel, session);
        tracing::debug!("Beginning session on channel {}", channel);
    }

    fn end(&mut self, channel: u16, reply: Reply<()>) {
        let Some(session) = self.sessions.get_mut(&channel) else {
            let _ = reply.send(Ok(()));
            return;
        };
        if let Err(err) = session.apply(Event::SendClose) {
            let _ = reply.send(Err(err));
            return;
        }
        self.outbound.push_back(Frame::amqp(channel, End::default()));
        session.fail(&ClientError::SessionEnded);
        session.end_reply = Some(reply);
        tracing::debug!("Ending session on channel {}", channel);
    }

    fn attach(&mut self, channel: u16, spec: LinkSpec, reply: Reply<Handle>) {
        let default_name = {
            let role = match spec.role {
                Role::Sender => "sender",
                Role::Receiver => "receiver",
            };
            format!("{}:{}", self.config.container_id, role)
        };
        let session = match local_session(&mut self.sessions, channel) {
            Ok(session) => session,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let Some(handle) = session.allocate_handle() else {
            let _ = reply.send(Err(ClientError::InvalidArgument(
                "no free link handle".to_string(),
            )));
            return;
        };
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", default_name, handle));

        let mut link = Link::new(handle, name, spec);
        if let Err(err) = link.apply(Event::SendOpen) {
            let _ = reply.send(Err(err));
            return;
        }
        tracing::debug!("Attaching link '{}' on handle {}", link.name, handle);
        self.outbound.push_back(Frame::amqp(channel, link.attach()));
        link.attach_reply = Some(reply);
        session.links.insert(handle, link);
    }

    fn detach(&mut self, channel: u16, handle: Handle, reply: Reply<()>) {
        let Some(link) = self
            .sessions
            .get_mut(&channel)
            .and_then(|s| s.links.get_mut(&handle))
        else {
            let _ = reply.send(Ok(()));
            return;
        };
        if let Err(err) = link.apply(Event::SendClose) {
            let _ = reply.send(Err(err));
            return;
        }
        let detach = Detach {
            handle,
            closed: true,
            error: None,
        };
        self.outbound.push_back(Frame::amqp(channel, detach));
        let closed = ClientError::LinkDetached(format!("link '{}' closed", link.name));
        link.fail(&closed, &ClientError::DeliveryFailed(closed.to_string()));
        link.detach_reply = Some(reply);
    }

    fn send(
        &mut self,
        channel: u16,
        handle: Handle,
        payload: Bytes,
        reply: SendReply,
        max_frame_size: u32,
    ) -> Result<(), ClientError> {
        let session = match local_link(&mut self.sessions, channel, handle) {
            Ok(found) => found,
            Err(err) => {
                let _ = reply.send(Err(err));
                return Ok(());
            }
        };
        let Some(link) = session.links.get_mut(&handle) else {
            return Ok(());
        };
        if !link.is_sender() {
            let _ = reply.send(Err(ClientError::InvalidArgument(format!(
                "link '{}' is not a sender",
                link.name
            ))));
            return Ok(());
        }
        let settled = link.presettled;
        link.queue.push_back(PendingSend::new(payload, settled, reply));
        session.pump(max_frame_size, &mut self.outbound)?;

        // Credit left over after a drain request is spent once the queue
        // empties.
        if session
            .links
            .get_mut(&handle)
            .is_some_and(|l| l.drain_credit())
        {
            if let Some(flow) = session.link_flow(handle) {
                self.outbound.push_back(Frame::amqp(channel, flow));
            }
        }
        Ok(())
    }

    fn receive(&mut self, channel: u16, handle: Handle, reply: ReceiveReply) {
        let session = match local_link(&mut self.sessions, channel, handle) {
            Ok(found) => found,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let Some(link) = session.links.get_mut(&handle) else {
            return;
        };
        if link.is_sender() {
            let _ = reply.send(Err(ClientError::InvalidArgument(format!(
                "link '{}' is not a receiver",
                link.name
            ))));
            return;
        }

        let mut accepted = None;
        match link.prefetched.pop_front() {
            Some(delivery) => {
                let (id, settled) = (delivery.delivery_id, delivery.settled);
                match reply.send(Ok(delivery)) {
                    Ok(()) => {
                        if link.auto_accept && !settled {
                            accepted = Some(id);
                        }
                    }
                    Err(Ok(delivery)) => link.prefetched.push_front(delivery),
                    Err(Err(_)) => {}
                }
            }
            None => link.waiters.push_back(reply),
        }
        let send_flow = link.replenish();

        if let Some(id) = accepted {
            session.settle(id, Outcome::Accepted, &mut self.outbound);
        }
        if send_flow {
            if let Some(flow) = session.link_flow(handle) {
                self.outbound.push_back(Frame::amqp(channel, flow));
            }
        }
    }

    fn credit(&mut self, channel: u16, handle: Handle, credit: u32, reply: Reply<()>) {
        let session = match local_link(&mut self.sessions, channel, handle) {
            Ok(found) => found,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        if let Some(link) = session.links.get_mut(&handle) {
            link.link_credit = link.link_credit.saturating_add(credit);
        }
        if let Some(flow) = session.link_flow(handle) {
            self.outbound.push_back(Frame::amqp(channel, flow));
        }
        let _ = reply.send(Ok(()));
    }

    fn drain(&mut self, channel: u16, handle: Handle, reply: Reply<()>) {
        let session = match local_link(&mut self.sessions, channel, handle) {
            Ok(found) => found,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let send_flow = session
            .links
            .get_mut(&handle)
            .is_some_and(|l| l.start_drain(reply));
        if send_flow {
            if let Some(flow) = session.link_flow(handle) {
                self.outbound.push_back(Frame::amqp(channel, flow));
            }
        }
    }

    /// Starts a local close. Receives blocked on any link wake up with
    /// `ConnectionClosed` right away.
    fn close(&mut self, reply: Option<Reply<()>>) {
        self.close_replies.extend(reply);
        match self.state {
            ConnectionState::OpenSent | ConnectionState::Opened => {
                tracing::debug!("Closing connection");
                self.outbound.push_back(Frame::amqp(0, Close::default()));
                self.state = ConnectionState::CloseSent;
                for session in self.sessions.values_mut() {
                    session.fail(&ClientError::ConnectionClosed);
                }
                if let Some(reply) = self.open_reply.take() {
                    let _ = reply.send(Err(ClientError::ConnectionClosed));
                }
            }
            // Nothing was opened; there is nobody to tell.
            _ => self.shutdown(ClientError::ConnectionClosed),
        }
    }

    /// Closes the connection with an error condition derived from `err`.
    pub fn violation(&mut self, err: ClientError) {
        if self.is_closed() {
            return;
        }
        tracing::error!("Closing connection: {}", err);
        let error = AmqpError::new(err.condition(), err.to_string());
        self.close_with(error, err);
    }

    /// The peer went quiet for longer than our idle timeout.
    pub fn idle_expired(&mut self) {
        if self.is_closed() {
            return;
        }
        tracing::warn!("No frames from peer within idle timeout, closing connection");
        let error = AmqpError::new(ErrorCondition::ResourceLimitExceeded, "idle timeout expired");
        self.close_with(error, ClientError::ConnectionClosed);
    }

    fn close_with(&mut self, error: AmqpError, err: ClientError) {
        if matches!(
            self.state,
            ConnectionState::OpenSent | ConnectionState::Opened | ConnectionState::CloseReceived
        ) {
            self.outbound.push_back(Frame::amqp(
                0,
                Close {
                    error: Some(error),
                },
            ));
        }
        self.shutdown(err);
    }

    /// The transport failed. Nothing more can be written.
    pub fn fail(&mut self, err: ClientError) {
        if self.is_closed() {
            return;
        }
        self.outbound.clear();
        self.shutdown(err);
    }

    fn shutdown(&mut self, err: ClientError) {
        self.state = ConnectionState::Closed;
        for (_, mut session) in std::mem::take(&mut self.sessions) {
            session.fail(&err);
        }
        self.remote_channels.clear();
        if let Some(reply) = self.open_reply.take() {
            let _ = reply.send(Err(err.clone()));
        }
        for reply in self.close_replies.drain(..) {
            let _ = reply.send(Ok(()));
        }
        self.error = Some(err);
    }
}
