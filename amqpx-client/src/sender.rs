//! Sender link handle.

use crate::driver::Shared;
use crate::engine::Command;
use crate::error::ClientError;
use amqpx_protocol::definitions::Handle;
use amqpx_protocol::{Message, Outcome};
use std::sync::Arc;

/// Options for attaching a sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderOptions {
    /// Link name. Generated from the container id when unset.
    pub name: Option<String>,
    /// Send every message settled; `send` then completes on transfer.
    pub presettled: bool,
}

impl SenderOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_presettled(mut self, presettled: bool) -> Self {
        self.presettled = presettled;
        self
    }
}

/// A link that sends messages to one address.
#[derive(Debug, Clone)]
pub struct Sender {
    shared: Arc<Shared>,
    channel: u16,
    handle: Handle,
    address: String,
}

impl Sender {
    pub(crate) fn new(shared: Arc<Shared>, channel: u16, handle: Handle, address: String) -> Self {
        Self {
            shared,
            channel,
            handle,
            address,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Sends `message` and waits until the peer settles it.
    ///
    /// Returns the peer's outcome, or `None` for a pre-settled send. The
    /// message's `to` property defaults to the link address. Messages
    /// larger than a frame are split across transfers.
    pub async fn send(&self, message: &Message) -> Result<Option<Outcome>, ClientError> {
        let payload = if message.properties.as_ref().is_some_and(|p| p.to.is_some()) {
            message.encode()?
        } else {
            let mut message = message.clone();
            message.properties_mut().to = Some(self.address.clone());
            message.encode()?
        };

        let (channel, handle) = (self.channel, self.handle);
        self.shared
            .request(|reply| Command::Send {
                channel,
                handle,
                payload,
                reply,
            })
            .await
    }

    /// Detaches the link. Deliveries already sent stay pending until the
    /// peer settles them or the session ends.
    pub async fn close(&self) -> Result<(), ClientError> {
        let (channel, handle) = (self.channel, self.handle);
        self.shared
            .request(|reply| Command::Detach {
                channel,
                handle,
                reply,
            })
            .await
    }
}
