//! Connection handle and its configuration.

use crate::driver::{self, Shared, COMMAND_CHANNEL_CAPACITY};
use crate::engine::{Command, Engine, EngineConfig};
use crate::error::ClientError;
use crate::options::TransportConfig;
use crate::sasl::{self, SaslCredentials};
use crate::session::Session;
use crate::transport::Transport;
use amqpx_protocol::{Decoder, ProtocolHeader, DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT, MIN_MAX_FRAME_SIZE};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Default receiver prefetch.
pub const DEFAULT_PREFETCH: u32 = 1000;

/// Default channel-max we announce.
pub const DEFAULT_CHANNEL_MAX: u16 = 32767;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Peer host name or address.
    pub host: String,
    pub port: u16,
    /// Socket and TLS settings.
    pub transport: TransportConfig,
    /// Our container id. A random one is generated by default.
    pub container_id: String,
    /// Virtual host sent in open and SASL init. Defaults to `host`.
    pub hostname: Option<String>,
    /// Largest frame we accept.
    pub max_frame_size: u32,
    pub channel_max: u16,
    /// Idle timeout we announce. `None` disables heartbeat checks.
    pub idle_timeout: Option<Duration>,
    /// Run SASL before the AMQP header.
    pub sasl: bool,
    /// Credentials for SASL PLAIN. Without them ANONYMOUS is used.
    pub credentials: Option<SaslCredentials>,
    /// Bound on SASL, header exchange and open.
    pub open_timeout: Duration,
    /// Receiver prefetch used when none is given per link.
    pub prefetch: u32,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            transport: TransportConfig::default(),
            container_id: format!("amqpx-{}", uuid::Uuid::new_v4()),
            hostname: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_max: DEFAULT_CHANNEL_MAX,
            idle_timeout: Some(Duration::from_secs(60)),
            sasl: true,
            credentials: None,
            open_timeout: Duration::from_secs(30),
            prefetch: DEFAULT_PREFETCH,
        }
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_container_id(mut self, id: impl Into<String>) -> Self {
        self.container_id = id.into();
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size.max(MIN_MAX_FRAME_SIZE);
        self
    }

    pub fn with_channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_sasl(mut self, enabled: bool) -> Self {
        self.sasl = enabled;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(SaslCredentials::new(username, password));
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = prefetch;
        self
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            container_id: self.container_id.clone(),
            hostname: Some(self.virtual_host().to_string()),
            max_frame_size: self.max_frame_size,
            channel_max: self.channel_max,
            idle_timeout: self.idle_timeout,
        }
    }

    fn virtual_host(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.host)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}

/// An open AMQP connection.
///
/// Dropping the connection and every session, sender and receiver made
/// from it closes the connection.
pub struct Connection {
    shared: Arc<Shared>,
    config: ConnectionConfig,
    peer_addr: SocketAddr,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connects, authenticates and exchanges open with the peer.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        tracing::info!("Connecting to {}:{}", config.host, config.port);
        let mut transport = Transport::connect(&config.host, config.port, &config.transport).await?;
        let peer_addr = transport.peer_addr();
        let mut decoder = Decoder::new(config.max_frame_size);

        let handshake = async {
            if config.sasl {
                sasl::negotiate(
                    &mut transport,
                    &mut decoder,
                    config.credentials.as_ref(),
                    Some(config.virtual_host()),
                )
                .await?;
            }
            let mut engine = Engine::new(config.engine_config());
            transport.write_header(ProtocolHeader::Amqp).await?;
            engine.header_sent()?;
            let header = transport.read_header(&mut decoder).await?;
            engine.header_received(header)?;
            Ok::<_, ClientError>(engine)
        };
        let mut engine = match tokio::time::timeout(config.open_timeout, handshake).await {
            Ok(Ok(engine)) => engine,
            Ok(Err(e)) => {
                transport.close().await;
                return Err(e);
            }
            Err(_) => {
                transport.close().await;
                return Err(ClientError::Timeout);
            }
        };

        let (open_tx, open_rx) = oneshot::channel();
        engine.open(open_tx)?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared::new(commands_tx));
        let task = tokio::spawn(driver::run(
            engine,
            transport,
            decoder,
            commands_rx,
            shared.clone(),
        ));

        match tokio::time::timeout(config.open_timeout, open_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(shared.closed_error()),
            Err(_) => {
                tracing::warn!("Peer did not answer open within {:?}", config.open_timeout);
                let _ = shared.submit(Command::Close { reply: None }).await;
                return Err(ClientError::Timeout);
            }
        }

        tracing::info!("Connected to {}", peer_addr);
        Ok(Self {
            shared,
            config,
            peer_addr,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Begins a new session.
    pub async fn begin_session(&self) -> Result<Session, ClientError> {
        let channel = self
            .shared
            .request(|reply| Command::Begin { reply })
            .await?;
        Ok(Session::new(self.shared.clone(), channel, self.config.prefetch))
    }

    /// Closes the connection and waits for the driver to stop. Pending
    /// operations fail with `ConnectionClosed`.
    pub async fn close(&self) -> Result<(), ClientError> {
        if !self.shared.is_closed() {
            // A driver that is already gone has closed the connection.
            let _ = self
                .shared
                .request(|reply| Command::Close { reply: Some(reply) })
                .await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        match self.shared.error() {
            Some(ClientError::ConnectionClosed) | None => Ok(()),
            Some(err) => Err(err),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// The error the connection ended with, once it has ended.
    pub fn error(&self) -> Option<ClientError> {
        self.shared.error()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .field("container_id", &self.config.container_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
