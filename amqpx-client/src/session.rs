//! Session handle.

use crate::driver::Shared;
use crate::engine::link::LinkSpec;
use crate::engine::Command;
use crate::error::ClientError;
use crate::receiver::{Receiver, ReceiverOptions};
use crate::sender::{Sender, SenderOptions};
use amqpx_protocol::Role;
use std::sync::Arc;

/// A session on an open connection.
#[derive(Debug, Clone)]
pub struct Session {
    shared: Arc<Shared>,
    channel: u16,
    prefetch: u32,
}

impl Session {
    pub(crate) fn new(shared: Arc<Shared>, channel: u16, prefetch: u32) -> Self {
        Self {
            shared,
            channel,
            prefetch,
        }
    }

    /// Local channel number.
    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// Attaches a sender to `address` with default options.
    pub async fn create_sender(&self, address: impl Into<String>) -> Result<Sender, ClientError> {
        self.create_sender_with(address, SenderOptions::default())
            .await
    }

    pub async fn create_sender_with(
        &self,
        address: impl Into<String>,
        options: SenderOptions,
    ) -> Result<Sender, ClientError> {
        let address = address.into();
        let spec = LinkSpec {
            role: Role::Sender,
            address: address.clone(),
            name: options.name,
            presettled: options.presettled,
            prefetch: 0,
            auto_accept: false,
        };
        let handle = self.attach(spec).await?;
        Ok(Sender::new(self.shared.clone(), self.channel, handle, address))
    }

    /// Attaches a receiver to `address` using the connection's prefetch.
    pub async fn create_receiver(&self, address: impl Into<String>) -> Result<Receiver, ClientError> {
        let options = ReceiverOptions::default().with_prefetch(self.prefetch);
        self.create_receiver_with(address, options).await
    }

    pub async fn create_receiver_with(
        &self,
        address: impl Into<String>,
        options: ReceiverOptions,
    ) -> Result<Receiver, ClientError> {
        let address = address.into();
        let spec = LinkSpec {
            role: Role::Receiver,
            address: address.clone(),
            name: options.name,
            presettled: false,
            prefetch: options.prefetch,
            auto_accept: options.auto_accept,
        };
        let handle = self.attach(spec).await?;
        Ok(Receiver::new(self.shared.clone(), self.channel, handle, address))
    }

    async fn attach(&self, spec: LinkSpec) -> Result<u32, ClientError> {
        let channel = self.channel;
        self.shared
            .request(|reply| Command::Attach {
                channel,
                spec,
                reply,
            })
            .await
    }

    /// Ends the session. Unsettled sends fail with `DeliveryFailed`.
    pub async fn end(&self) -> Result<(), ClientError> {
        let channel = self.channel;
        self.shared
            .request(|reply| Command::End { channel, reply })
            .await
    }
}
