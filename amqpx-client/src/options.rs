//! Transport configuration.
//!
//! [`TransportOptions`] holds socket level settings and
//! [`TransportSslOptions`] adds TLS store material on top. Both are plain
//! values built with `with_*` methods: cloning yields an independent copy.
//! Nothing here touches the filesystem or the network; store files are only
//! opened when a TLS connection is attempted.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default connect timeout (60 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Socket options applied before connecting.
///
/// Unset options (`None`) leave the operating system default in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    send_buffer_size: Option<usize>,
    receive_buffer_size: Option<usize>,
    traffic_class: Option<u32>,
    tcp_no_delay: Option<bool>,
    tcp_keep_alive: Option<bool>,
    so_linger: Option<Duration>,
    so_timeout: Option<Duration>,
    connect_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            send_buffer_size: None,
            receive_buffer_size: None,
            traffic_class: None,
            tcp_no_delay: None,
            tcp_keep_alive: None,
            so_linger: None,
            so_timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl TransportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = Some(size);
        self
    }

    /// Sets the IP traffic class (TOS byte).
    pub fn with_traffic_class(mut self, traffic_class: u32) -> Self {
        self.traffic_class = Some(traffic_class);
        self
    }

    pub fn with_tcp_no_delay(mut self, no_delay: bool) -> Self {
        self.tcp_no_delay = Some(no_delay);
        self
    }

    pub fn with_tcp_keep_alive(mut self, keep_alive: bool) -> Self {
        self.tcp_keep_alive = Some(keep_alive);
        self
    }

    pub fn with_so_linger(mut self, linger: Duration) -> Self {
        self.so_linger = Some(linger);
        self
    }

    /// Bounds each socket write; a write that does not finish in time
    /// fails the connection.
    pub fn with_so_timeout(mut self, timeout: Duration) -> Self {
        self.so_timeout = Some(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn send_buffer_size(&self) -> Option<usize> {
        self.send_buffer_size
    }

    pub fn receive_buffer_size(&self) -> Option<usize> {
        self.receive_buffer_size
    }

    pub fn traffic_class(&self) -> Option<u32> {
        self.traffic_class
    }

    pub fn tcp_no_delay(&self) -> Option<bool> {
        self.tcp_no_delay
    }

    pub fn tcp_keep_alive(&self) -> Option<bool> {
        self.tcp_keep_alive
    }

    pub fn so_linger(&self) -> Option<Duration> {
        self.so_linger
    }

    pub fn so_timeout(&self) -> Option<Duration> {
        self.so_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

/// TLS options: socket options plus key/trust store material.
///
/// Stores are PEM files. The key store holds the client certificate chain
/// and private key; the trust store holds the CA certificates used to
/// verify the server. A store location without its password is rejected
/// when the store is opened.
#[derive(Clone, PartialEq, Eq)]
pub struct TransportSslOptions {
    socket: TransportOptions,
    key_store_location: Option<PathBuf>,
    key_store_password: Option<String>,
    trust_store_location: Option<PathBuf>,
    trust_store_password: Option<String>,
    store_type: String,
    trust_all: bool,
    verify_host: bool,
}

impl TransportSslOptions {
    pub const DEFAULT_STORE_TYPE: &'static str = "pem";
    pub const DEFAULT_TRUST_ALL: bool = false;
    pub const DEFAULT_VERIFY_HOST: bool = true;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_socket(mut self, socket: TransportOptions) -> Self {
        self.socket = socket;
        self
    }

    pub fn with_key_store(
        mut self,
        location: impl Into<PathBuf>,
        password: impl Into<String>,
    ) -> Self {
        self.key_store_location = Some(location.into());
        self.key_store_password = Some(password.into());
        self
    }

    pub fn with_key_store_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.key_store_location = Some(location.into());
        self
    }

    pub fn with_key_store_password(mut self, password: impl Into<String>) -> Self {
        self.key_store_password = Some(password.into());
        self
    }

    pub fn with_trust_store(
        mut self,
        location: impl Into<PathBuf>,
        password: impl Into<String>,
    ) -> Self {
        self.trust_store_location = Some(location.into());
        self.trust_store_password = Some(password.into());
        self
    }

    pub fn with_trust_store_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.trust_store_location = Some(location.into());
        self
    }

    pub fn with_trust_store_password(mut self, password: impl Into<String>) -> Self {
        self.trust_store_password = Some(password.into());
        self
    }

    pub fn with_store_type(mut self, store_type: impl Into<String>) -> Self {
        self.store_type = store_type.into();
        self
    }

    /// Accept any server certificate. Insecure.
    pub fn with_trust_all(mut self, trust_all: bool) -> Self {
        self.trust_all = trust_all;
        self
    }

    pub fn with_verify_host(mut self, verify_host: bool) -> Self {
        self.verify_host = verify_host;
        self
    }

    pub fn socket(&self) -> &TransportOptions {
        &self.socket
    }

    pub fn key_store_location(&self) -> Option<&Path> {
        self.key_store_location.as_deref()
    }

    pub fn key_store_password(&self) -> Option<&str> {
        self.key_store_password.as_deref()
    }

    pub fn trust_store_location(&self) -> Option<&Path> {
        self.trust_store_location.as_deref()
    }

    pub fn trust_store_password(&self) -> Option<&str> {
        self.trust_store_password.as_deref()
    }

    pub fn store_type(&self) -> &str {
        &self.store_type
    }

    pub fn is_trust_all(&self) -> bool {
        self.trust_all
    }

    pub fn is_verify_host(&self) -> bool {
        self.verify_host
    }
}

impl Default for TransportSslOptions {
    fn default() -> Self {
        Self {
            socket: TransportOptions::default(),
            key_store_location: None,
            key_store_password: None,
            trust_store_location: None,
            trust_store_password: None,
            store_type: Self::DEFAULT_STORE_TYPE.to_string(),
            trust_all: Self::DEFAULT_TRUST_ALL,
            verify_host: Self::DEFAULT_VERIFY_HOST,
        }
    }
}

// Passwords stay out of logs.
impl fmt::Debug for TransportSslOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |p: &Option<String>| p.as_ref().map(|_| "<redacted>");
        f.debug_struct("TransportSslOptions")
            .field("socket", &self.socket)
            .field("key_store_location", &self.key_store_location)
            .field("key_store_password", &redact(&self.key_store_password))
            .field("trust_store_location", &self.trust_store_location)
            .field("trust_store_password", &redact(&self.trust_store_password))
            .field("store_type", &self.store_type)
            .field("trust_all", &self.trust_all)
            .field("verify_host", &self.verify_host)
            .finish()
    }
}

/// Transport selection for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Plain(TransportOptions),
    Tls(TransportSslOptions),
}

impl TransportConfig {
    pub fn socket(&self) -> &TransportOptions {
        match self {
            TransportConfig::Plain(options) => options,
            TransportConfig::Tls(options) => options.socket(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, TransportConfig::Tls(_))
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Plain(TransportOptions::default())
    }
}
