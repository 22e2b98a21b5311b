//! Client configuration from file and environment.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via AMQPX_CONFIG or passed explicitly)
//! 3. Environment variables

use crate::connection::{ConnectionConfig, DEFAULT_CHANNEL_MAX, DEFAULT_PREFETCH};
use crate::options::{TransportConfig, TransportOptions, TransportSslOptions};
use amqpx_protocol::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_PORT, DEFAULT_SECURE_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the YAML config file.
pub const CONFIG_ENV: &str = "AMQPX_CONFIG";

/// Client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Peer address and connection parameters.
    pub connection: ConnectionSection,
    /// SASL settings.
    pub auth: AuthSection,
    /// TLS settings.
    pub tls: TlsSection,
    /// Socket options.
    pub socket: SocketSection,
}

impl ClientConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::ParseError(_, msg) => ConfigError::ParseError(path.to_path_buf(), msg),
            other => other,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError(PathBuf::from("<inline>"), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.connection.apply_overrides(&lookup);
        self.auth.apply_overrides(&lookup);
        self.tls.apply_overrides(&lookup);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.host.is_empty() {
            return Err(ConfigError::ValidationError("host is empty".to_string()));
        }
        if self.connection.port == Some(0) {
            return Err(ConfigError::ValidationError("port is 0".to_string()));
        }
        if self.auth.password.is_some() && self.auth.username.is_none() {
            return Err(ConfigError::ValidationError(
                "password set without username".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Port to dial: the configured one, else the IANA port for the
    /// chosen transport.
    pub fn port(&self) -> u16 {
        match self.connection.port {
            Some(port) => port,
            None if self.tls.enabled => DEFAULT_SECURE_PORT,
            None => DEFAULT_PORT,
        }
    }

    /// Builds the connection configuration. Touches no files or sockets.
    pub fn connection_config(&self) -> ConnectionConfig {
        let socket = self.socket.transport_options();
        let transport = if self.tls.enabled {
            TransportConfig::Tls(self.tls.ssl_options(socket))
        } else {
            TransportConfig::Plain(socket)
        };

        let c = &self.connection;
        let mut config = ConnectionConfig::new(c.host.clone(), self.port())
            .with_transport(transport)
            .with_max_frame_size(c.max_frame_size)
            .with_channel_max(c.channel_max)
            .with_idle_timeout(
                Some(Duration::from_millis(c.idle_timeout_ms)).filter(|t| !t.is_zero()),
            )
            .with_open_timeout(Duration::from_millis(c.open_timeout_ms))
            .with_prefetch(c.prefetch)
            .with_sasl(self.auth.sasl);
        if let Some(id) = &c.container_id {
            config = config.with_container_id(id.clone());
        }
        if let Some(hostname) = &c.hostname {
            config = config.with_hostname(hostname.clone());
        }
        if let Some(username) = &self.auth.username {
            config = config.with_credentials(
                username.clone(),
                self.auth.password.clone().unwrap_or_default(),
            );
        }
        config
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Connection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub host: String,
    /// 5671 with TLS, 5672 without, when unset.
    pub port: Option<u16>,
    /// Container id; random when unset.
    pub container_id: Option<String>,
    /// Virtual host; defaults to `host`.
    pub hostname: Option<String>,
    pub max_frame_size: u32,
    pub channel_max: u16,
    /// Idle timeout in milliseconds (0 = disabled).
    pub idle_timeout_ms: u64,
    pub open_timeout_ms: u64,
    /// Default receiver prefetch.
    pub prefetch: u32,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            container_id: None,
            hostname: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_max: DEFAULT_CHANNEL_MAX,
            idle_timeout_ms: 60_000,
            open_timeout_ms: 30_000,
            prefetch: DEFAULT_PREFETCH,
        }
    }
}

impl ConnectionSection {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("AMQPX_HOST") {
            self.host = host;
        }

        if let Some(port) = lookup("AMQPX_PORT") {
            if let Ok(port) = port.parse() {
                self.port = Some(port);
            }
        }

        if let Some(timeout) = lookup("AMQPX_IDLE_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.idle_timeout_ms = ms;
            }
        }
    }
}

/// SASL configuration.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Run SASL before the AMQP header.
    pub sasl: bool,
    /// Username for PLAIN. ANONYMOUS is used without one.
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            sasl: true,
            username: None,
            password: None,
        }
    }
}

impl std::fmt::Debug for AuthSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSection")
            .field("sasl", &self.sasl)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AuthSection {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(username) = lookup("AMQPX_USERNAME") {
            self.username = Some(username);
        }
        if let Some(password) = lookup("AMQPX_PASSWORD") {
            self.password = Some(password);
        }
    }
}

/// TLS configuration. Store files are only opened when connecting.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    pub enabled: bool,
    /// PEM file with the client certificate chain and private key.
    pub key_store: Option<PathBuf>,
    pub key_store_password: Option<String>,
    /// PEM file with trusted CA certificates.
    pub trust_store: Option<PathBuf>,
    pub trust_store_password: Option<String>,
    pub store_type: String,
    pub trust_all: bool,
    pub verify_host: bool,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            key_store: None,
            key_store_password: None,
            trust_store: None,
            trust_store_password: None,
            store_type: TransportSslOptions::DEFAULT_STORE_TYPE.to_string(),
            trust_all: TransportSslOptions::DEFAULT_TRUST_ALL,
            verify_host: TransportSslOptions::DEFAULT_VERIFY_HOST,
        }
    }
}

impl std::fmt::Debug for TlsSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |p: &Option<String>| p.as_ref().map(|_| "<redacted>");
        f.debug_struct("TlsSection")
            .field("enabled", &self.enabled)
            .field("key_store", &self.key_store)
            .field("key_store_password", &redact(&self.key_store_password))
            .field("trust_store", &self.trust_store)
            .field("trust_store_password", &redact(&self.trust_store_password))
            .field("store_type", &self.store_type)
            .field("trust_all", &self.trust_all)
            .field("verify_host", &self.verify_host)
            .finish()
    }
}

impl TlsSection {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = lookup("AMQPX_TLS") {
            self.enabled = parse_bool(&enabled);
        }
        if let Some(trust_all) = lookup("AMQPX_TRUST_ALL") {
            self.trust_all = parse_bool(&trust_all);
        }
        if let Some(verify_host) = lookup("AMQPX_VERIFY_HOST") {
            self.verify_host = parse_bool(&verify_host);
        }
    }

    fn ssl_options(&self, socket: TransportOptions) -> TransportSslOptions {
        let mut options = TransportSslOptions::new()
            .with_socket(socket)
            .with_store_type(self.store_type.clone())
            .with_trust_all(self.trust_all)
            .with_verify_host(self.verify_host);
        if let Some(path) = &self.key_store {
            options = options.with_key_store_location(path.clone());
        }
        if let Some(password) = &self.key_store_password {
            options = options.with_key_store_password(password.clone());
        }
        if let Some(path) = &self.trust_store {
            options = options.with_trust_store_location(path.clone());
        }
        if let Some(password) = &self.trust_store_password {
            options = options.with_trust_store_password(password.clone());
        }
        options
    }
}

/// Socket options. Unset values keep the platform default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketSection {
    pub send_buffer_size: Option<usize>,
    pub receive_buffer_size: Option<usize>,
    pub traffic_class: Option<u32>,
    pub tcp_no_delay: Option<bool>,
    pub tcp_keep_alive: Option<bool>,
    pub so_linger_secs: Option<u64>,
    pub so_timeout_ms: Option<u64>,
    pub connect_timeout_ms: u64,
}

impl Default for SocketSection {
    fn default() -> Self {
        Self {
            send_buffer_size: None,
            receive_buffer_size: None,
            traffic_class: None,
            tcp_no_delay: None,
            tcp_keep_alive: None,
            so_linger_secs: None,
            so_timeout_ms: None,
            connect_timeout_ms: crate::options::DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl SocketSection {
    fn transport_options(&self) -> TransportOptions {
        let mut options = TransportOptions::new()
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms));
        if let Some(size) = self.send_buffer_size {
            options = options.with_send_buffer_size(size);
        }
        if let Some(size) = self.receive_buffer_size {
            options = options.with_receive_buffer_size(size);
        }
        if let Some(class) = self.traffic_class {
            options = options.with_traffic_class(class);
        }
        if let Some(no_delay) = self.tcp_no_delay {
            options = options.with_tcp_no_delay(no_delay);
        }
        if let Some(keep_alive) = self.tcp_keep_alive {
            options = options.with_tcp_keep_alive(keep_alive);
        }
        if let Some(secs) = self.so_linger_secs {
            options = options.with_so_linger(Duration::from_secs(secs));
        }
        if let Some(ms) = self.so_timeout_ms {
            options = options.with_so_timeout(Duration::from_millis(ms));
        }
        options
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {1}", path = .0.display())]
    IoError(PathBuf, std::io::Error),

    #[error("failed to parse config file '{path}': {1}", path = .0.display())]
    ParseError(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.connection.host, "localhost");
        assert_eq!(config.connection.port, None);
        assert_eq!(config.port(), 5672);
        assert!(config.auth.sasl);
        assert!(!config.tls.enabled);
        assert!(config.tls.verify_host);
        assert_eq!(config.tls.store_type, "pem");
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = ClientConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed = ClientConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "connection:\n  host: broker\n  port: 5671\ntls:\n  enabled: true\n  trust_all: true\n";
        let config = ClientConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.connection.host, "broker");
        assert_eq!(config.connection.port, Some(5671));
        assert_eq!(config.connection.prefetch, DEFAULT_PREFETCH);
        assert!(config.tls.enabled);
        assert!(config.tls.trust_all);
        assert!(config.tls.verify_host);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("AMQPX_HOST", "mq.example"),
            ("AMQPX_PORT", "15672"),
            ("AMQPX_USERNAME", "alice"),
            ("AMQPX_PASSWORD", "s3cret"),
            ("AMQPX_TLS", "true"),
            ("AMQPX_VERIFY_HOST", "0"),
            ("AMQPX_IDLE_TIMEOUT_MS", "0"),
        ]
        .into_iter()
        .collect();

        let mut config = ClientConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.connection.host, "mq.example");
        assert_eq!(config.connection.port, Some(15672));
        assert_eq!(config.auth.username.as_deref(), Some("alice"));
        assert!(config.tls.enabled);
        assert!(!config.tls.verify_host);

        let connection = config.connection_config();
        assert_eq!(connection.host, "mq.example");
        assert_eq!(connection.port, 15672);
        assert_eq!(connection.idle_timeout, None);
        assert!(connection.transport.is_tls());
        assert_eq!(connection.credentials.unwrap().password, "s3cret");
    }

    #[test]
    fn test_bad_port_override_ignored() {
        let mut config = ClientConfig::default();
        config.apply_overrides(|name| (name == "AMQPX_PORT").then(|| "nope".to_string()));
        assert_eq!(config.connection.port, None);
    }

    #[test]
    fn test_connection_config_tls_options() {
        let mut config = ClientConfig::default();
        config.tls.enabled = true;
        config.tls.trust_store = Some(PathBuf::from("/etc/amqpx/ca.pem"));
        config.tls.trust_store_password = Some("pw".to_string());
        config.socket.tcp_no_delay = Some(true);
        config.socket.connect_timeout_ms = 90_000;

        match config.connection_config().transport {
            TransportConfig::Tls(ssl) => {
                assert_eq!(ssl.trust_store_location(), Some(Path::new("/etc/amqpx/ca.pem")));
                assert_eq!(ssl.trust_store_password(), Some("pw"));
                assert_eq!(ssl.key_store_location(), None);
                assert_eq!(ssl.socket().tcp_no_delay(), Some(true));
                assert_eq!(ssl.socket().connect_timeout(), Duration::from_secs(90));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_port_defaults_follow_tls() {
        let mut config = ClientConfig::default();
        assert_eq!(config.connection_config().port, DEFAULT_PORT);

        config.tls.enabled = true;
        assert_eq!(config.port(), 5671);
        assert_eq!(config.connection_config().port, DEFAULT_SECURE_PORT);

        config.connection.port = Some(15671);
        assert_eq!(config.connection_config().port, 15671);

        let config = ClientConfig::from_yaml("tls:\n  enabled: true\n").unwrap();
        assert_eq!(config.connection_config().port, 5671);
    }

    #[test]
    fn test_validation() {
        let mut config = ClientConfig::default();
        config.connection.port = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = ClientConfig::default();
        config.auth.password = Some("pw".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "connection:\n  host: filehost").unwrap();
        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.connection.host, "filehost");

        let err = ClientConfig::from_file("/nonexistent/amqpx.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_, _)));

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "connection: [").unwrap();
        match ClientConfig::from_file(bad.path()).unwrap_err() {
            ConfigError::ParseError(path, _) => assert_eq!(path, bad.path()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_debug_redacts_passwords() {
        let mut config = ClientConfig::default();
        config.auth.password = Some("hunter2".to_string());
        config.tls.key_store_password = Some("hunter3".to_string());
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("hunter3"));
    }
}
