//! amqpx - AMQP 1.0 command line client
//!
//! Sends messages to, or receives messages from, an AMQP 1.0 peer.

use amqpx_client::{ClientConfig, Connection};
use amqpx_protocol::{Body, Message};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "amqpx")]
#[command(about = "Send and receive AMQP 1.0 messages")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "AMQPX_CONFIG")]
    config: Option<PathBuf>,

    /// Peer host
    #[arg(long, env = "AMQPX_HOST")]
    host: Option<String>,

    /// Peer port
    #[arg(short, long, env = "AMQPX_PORT")]
    port: Option<u16>,

    /// SASL PLAIN username
    #[arg(short, long, env = "AMQPX_USERNAME")]
    username: Option<String>,

    /// SASL PLAIN password
    #[arg(long, env = "AMQPX_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    // ===== TLS Options =====
    /// Connect over TLS
    #[arg(long, env = "AMQPX_TLS")]
    tls: bool,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    trust_all: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one text message
    Send {
        /// Target address
        #[arg(short, long)]
        address: String,

        /// Message text (a null body when omitted)
        #[arg(short, long)]
        text: Option<String>,

        /// Application property as key=value (repeatable)
        #[arg(long = "property", value_parser = parse_property)]
        properties: Vec<(String, String)>,

        /// Mark the message durable
        #[arg(long)]
        durable: bool,
    },

    /// Receive and accept messages
    Receive {
        /// Source address
        #[arg(short, long)]
        address: String,

        /// Stop after this many messages
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,

        /// Give up waiting for a message after this many milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },
}

fn parse_property(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Config file first, then flags
    let mut config = match &cli.config {
        Some(path) => {
            let config = ClientConfig::from_file(path)?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => ClientConfig::default(),
    };
    if let Some(host) = cli.host {
        config.connection.host = host;
    }
    if let Some(port) = cli.port {
        config.connection.port = Some(port);
    }
    if cli.username.is_some() {
        config.auth.username = cli.username;
    }
    if cli.password.is_some() {
        config.auth.password = cli.password;
    }
    if cli.tls {
        config.tls.enabled = true;
    }
    if cli.trust_all {
        config.tls.trust_all = true;
    }
    config.validate()?;

    let connection = Connection::connect(config.connection_config()).await?;
    let result = match cli.command {
        Commands::Send {
            address,
            text,
            properties,
            durable,
        } => send(&connection, address, text, properties, durable).await,
        Commands::Receive {
            address,
            count,
            timeout_ms,
        } => receive(&connection, address, count, Duration::from_millis(timeout_ms)).await,
    };

    connection.close().await?;
    result
}

async fn send(
    connection: &Connection,
    address: String,
    text: Option<String>,
    properties: Vec<(String, String)>,
    durable: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = connection.begin_session().await?;
    let sender = session.create_sender(address).await?;

    let mut message = Message::new();
    message.set_text(text);
    if durable {
        message.header_mut().durable = true;
    }
    for (key, value) in properties {
        message.set_property(key, value)?;
    }

    match sender.send(&message).await? {
        Some(outcome) => println!("{}", outcome.name()),
        None => println!("sent"),
    }
    Ok(())
}

async fn receive(
    connection: &Connection,
    address: String,
    count: usize,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = connection.begin_session().await?;
    let receiver = session.create_receiver(address).await?;

    for _ in 0..count {
        let Some(delivery) = receiver.receive_timeout(timeout).await? else {
            tracing::info!("No message within {:?}", timeout);
            break;
        };
        print_message(delivery.message());
        receiver.accept(&delivery).await?;
    }
    Ok(())
}

fn print_message(message: &Message) {
    for name in message.property_names() {
        if let Some(value) = message.property(name) {
            println!("{} = {:?}", name, value);
        }
    }
    match &message.body {
        Body::Value(value) => match message.text() {
            Some(text) => println!("{}", text),
            None => println!("{:?}", value),
        },
        Body::Data(chunks) => {
            for chunk in chunks {
                println!("{}", String::from_utf8_lossy(chunk));
            }
        }
        Body::Sequence(sequences) => println!("{:?}", sequences),
    }
}
