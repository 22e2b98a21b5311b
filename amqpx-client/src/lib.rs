//! # amqpx-client
//!
//! AMQP 1.0 client engine.
//!
//! This crate provides:
//! - Plain TCP and TLS transports with configurable socket options
//! - SASL PLAIN and ANONYMOUS authentication
//! - Connection, session and link state machines driven by one task per
//!   connection
//! - Link credit, multi-frame transfers and delivery settlement
//! - YAML and environment based configuration
//!
//! ```no_run
//! use amqpx_client::{Connection, ConnectionConfig};
//! use amqpx_protocol::Message;
//!
//! # async fn run() -> Result<(), amqpx_client::ClientError> {
//! let connection = Connection::connect(ConnectionConfig::new("localhost", 5672)).await?;
//! let session = connection.begin_session().await?;
//! let sender = session.create_sender("queue://orders").await?;
//! sender.send(&Message::with_text("hello")).await?;
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub(crate) mod driver;
pub(crate) mod engine;
pub mod error;
pub mod options;
pub mod receiver;
pub mod sasl;
pub mod sender;
pub mod session;
pub mod stream;
pub mod tls;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{ClientConfig, ConfigError};
pub use connection::{Connection, ConnectionConfig};
pub use engine::Delivery;
pub use error::ClientError;
pub use options::{TransportConfig, TransportOptions, TransportSslOptions};
pub use receiver::{Receiver, ReceiverOptions};
pub use sasl::SaslCredentials;
pub use sender::{Sender, SenderOptions};
pub use session::Session;
pub use transport::Transport;
