//! Receiver link handle.

use crate::connection::DEFAULT_PREFETCH;
use crate::driver::Shared;
use crate::engine::{Command, Delivery};
use crate::error::ClientError;
use amqpx_protocol::definitions::Handle;
use amqpx_protocol::{AmqpError, Outcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Options for attaching a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverOptions {
    /// Link name. Generated from the container id when unset.
    pub name: Option<String>,
    /// Credit kept open towards the sender. Zero grants one credit per
    /// pending `receive`.
    pub prefetch: u32,
    /// Accept each delivery as it is handed out.
    pub auto_accept: bool,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            name: None,
            prefetch: DEFAULT_PREFETCH,
            auto_accept: false,
        }
    }
}

impl ReceiverOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_auto_accept(mut self, auto_accept: bool) -> Self {
        self.auto_accept = auto_accept;
        self
    }
}

/// A link that receives messages from one address.
#[derive(Debug, Clone)]
pub struct Receiver {
    shared: Arc<Shared>,
    channel: u16,
    handle: Handle,
    address: String,
}

impl Receiver {
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

    /// Waits for the next delivery.
    pub async fn receive(&self) -> Result<Delivery, ClientError> {
        let (channel, handle) = (self.channel, self.handle);
        self.shared
            .request(|reply| Command::Receive {
                channel,
                handle,
                reply,
            })
            .await
    }

    /// Waits up to `timeout` for the next delivery. Returns `None` when
    /// nothing arrived in time.
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Option<Delivery>, ClientError> {
        let (tx, mut rx) = oneshot::channel();
        self.shared
            .submit(Command::Receive {
                channel: self.channel,
                handle: self.handle,
                reply: tx,
            })
            .await?;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(result) => result.map_err(|_| self.shared.closed_error())?.map(Some),
            Err(_) => {
                // Closing the slot makes the engine keep later deliveries;
                // one already handed over is still ours.
                rx.close();
                match rx.try_recv() {
                    Ok(result) => result.map(Some),
                    Err(_) => Ok(None),
                }
            }
        }
    }

    pub async fn accept(&self, delivery: &Delivery) -> Result<(), ClientError> {
        self.settle(delivery, Outcome::Accepted).await
    }

    pub async fn reject(
        &self,
        delivery: &Delivery,
        error: Option<AmqpError>,
    ) -> Result<(), ClientError> {
        self.settle(delivery, Outcome::Rejected(error)).await
    }

    pub async fn release(&self, delivery: &Delivery) -> Result<(), ClientError> {
        self.settle(delivery, Outcome::Released).await
    }

    pub async fn modify(
        &self,
        delivery: &Delivery,
        delivery_failed: bool,
        undeliverable_here: bool,
    ) -> Result<(), ClientError> {
        let outcome = Outcome::Modified {
            delivery_failed,
            undeliverable_here,
            message_annotations: None,
        };
        self.settle(delivery, outcome).await
    }

    /// Settles `delivery` with `outcome`. Pre-settled or already settled
    /// deliveries are left alone.
    pub async fn settle(&self, delivery: &Delivery, outcome: Outcome) -> Result<(), ClientError> {
        if delivery.settled {
            return Ok(());
        }
        let (channel, delivery_id) = (delivery.channel, delivery.delivery_id);
        self.shared
            .request(|reply| Command::Settle {
                channel,
                delivery_id,
                outcome,
                reply,
            })
            .await
    }

    /// Grants `credit` more deliveries on top of the current credit.
    pub async fn add_credit(&self, credit: u32) -> Result<(), ClientError> {
        let (channel, handle) = (self.channel, self.handle);
        self.shared
            .request(|reply| Command::Credit {
                channel,
                handle,
                credit,
                reply,
            })
            .await
    }

    /// Asks the sender to use up or give back all outstanding credit and
    /// waits until it has.
    pub async fn drain(&self) -> Result<(), ClientError> {
        let (channel, handle) = (self.channel, self.handle);
        self.shared
            .request(|reply| Command::Drain {
                channel,
                handle,
                reply,
            })
            .await
    }

    /// Detaches the link. Blocked receives fail with `LinkDetached`.
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
