//! Endpoint state machines.
//!
//! Each scope (connection, session, link) is a state enum plus a table of
//! `(from, event, to)` rows. Anything not in a table is a protocol
//! violation.

use crate::error::ClientError;
use std::fmt::Debug;

/// Something that happens to an endpoint: a performative sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    SendHeader,
    RecvHeader,
    SendOpen,
    RecvOpen,
    SendClose,
    RecvClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Start,
    HeaderSent,
    HeaderExchanged,
    OpenSent,
    OpenReceived,
    Opened,
    CloseSent,
    CloseReceived,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unmapped,
    BeginSent,
    BeginReceived,
    Mapped,
    EndSent,
    EndReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Detached,
    AttachSent,
    AttachReceived,
    Attached,
    DetachSent,
    DetachReceived,
}

/// Transition table row.
pub type Transition<S> = (S, Event, S);

pub const CONNECTION_TRANSITIONS: &[Transition<ConnectionState>] = {
    use ConnectionState::*;
    use Event::*;
    &[
        (Start, SendHeader, HeaderSent),
        (HeaderSent, RecvHeader, HeaderExchanged),
        (HeaderExchanged, SendOpen, OpenSent),
        (HeaderExchanged, RecvOpen, OpenReceived),
        (OpenSent, RecvOpen, Opened),
        (OpenReceived, SendOpen, Opened),
        (OpenSent, SendClose, CloseSent),
        (Opened, SendClose, CloseSent),
        (OpenSent, RecvClose, CloseReceived),
        (Opened, RecvClose, CloseReceived),
        (CloseSent, RecvClose, Closed),
        (CloseReceived, SendClose, Closed),
    ]
};

// Session and link tables reuse the open/close events for begin/end and
// attach/detach.
pub const SESSION_TRANSITIONS: &[Transition<SessionState>] = {
    use Event::*;
    use SessionState::*;
    &[
        (Unmapped, SendOpen, BeginSent),
        (Unmapped, RecvOpen, BeginReceived),
        (BeginSent, RecvOpen, Mapped),
        (BeginReceived, SendOpen, Mapped),
        (BeginSent, SendClose, EndSent),
        (Mapped, SendClose, EndSent),
        (Mapped, RecvClose, EndReceived),
        (EndSent, RecvClose, Unmapped),
        (EndReceived, SendClose, Unmapped),
    ]
};

pub const LINK_TRANSITIONS: &[Transition<LinkState>] = {
    use Event::*;
    use LinkState::*;
    &[
        (Detached, SendOpen, AttachSent),
        (Detached, RecvOpen, AttachReceived),
        (AttachSent, RecvOpen, Attached),
        (AttachReceived, SendOpen, Attached),
        (AttachSent, SendClose, DetachSent),
        (Attached, SendClose, DetachSent),
        (Attached, RecvClose, DetachReceived),
        (DetachSent, RecvClose, Detached),
        (DetachReceived, SendClose, Detached),
    ]
};

/// Looks up the next state, or reports a violation naming the scope.
pub fn transition<S>(
    table: &[Transition<S>],
    scope: &str,
    state: S,
    event: Event,
) -> Result<S, ClientError>
where
    S: Copy + PartialEq + Debug,
{
    table
        .iter()
        .find(|(from, ev, _)| *from == state && *ev == event)
        .map(|(_, _, to)| *to)
        .ok_or_else(|| {
            ClientError::ProtocolViolation(format!(
                "{} cannot handle {:?} in state {:?}",
                scope, event, state
            ))
        })
}
