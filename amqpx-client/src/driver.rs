//! Connection driver task.
//!
//! One task per connection owns the transport and the engine. Handles
//! talk to it over a bounded command channel and get answers back on
//! oneshot channels.

use crate::engine::link::Reply;
use crate::engine::{Command, Engine};
use crate::error::ClientError;
use crate::transport::Transport;
use amqpx_protocol::{Decoder, Frame};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Capacity of the command channel between handles and the driver.
pub const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// How long to wait for the peer to answer our close.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// State shared between the driver and every handle.
#[derive(Debug)]
pub(crate) struct Shared {
    commands: mpsc::Sender<Command>,
    /// Set once the driver has stopped.
    error: Mutex<Option<ClientError>>,
}

impl Shared {
    pub fn new(commands: mpsc::Sender<Command>) -> Self {
        Self {
            commands,
            error: Mutex::new(None),
        }
    }

    /// Queues a command for the driver.
    pub async fn submit(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| self.closed_error())
    }

    /// Sends a command built around a fresh reply slot and waits for the
    /// answer.
    pub async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.submit(make(tx)).await?;
        rx.await.map_err(|_| self.closed_error())?
    }

    /// The error the connection ended with.
    pub fn closed_error(&self) -> ClientError {
        self.error
            .lock()
            .clone()
            .unwrap_or(ClientError::ConnectionClosed)
    }

    pub fn error(&self) -> Option<ClientError> {
        self.error.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Feeds every complete frame in `decoder` to the engine.
fn process_frames(engine: &mut Engine, decoder: &mut Decoder) {
    while !engine.is_closed() {
        match decoder.decode_frame() {
            Ok(Some(frame)) => {
                tracing::debug!(channel = frame.channel, "RECV {}", frame.name());
                engine.handle_frame(frame);
            }
            Ok(None) => break,
            Err(e) => {
                engine.violation(e.into());
                break;
            }
        }
    }
}

/// Runs the connection until it closes.
pub(crate) async fn run(
    mut engine: Engine,
    mut transport: Transport,
    mut decoder: Decoder,
    mut commands: mpsc::Receiver<Command>,
    shared: std::sync::Arc<Shared>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut last_write = Instant::now();
    let mut last_read = Instant::now();
    let mut close_deadline: Option<Instant> = None;
    let mut commands_open = true;

    // Frames that arrived together with the protocol header.
    process_frames(&mut engine, &mut decoder);

    loop {
        let max_frame_size = engine.max_outbound_frame_size();
        while let Some(frame) = engine.pop_outbound() {
            if let Err(e) = transport.write_frame(&frame, max_frame_size).await {
                tracing::warn!("Write to {} failed: {}", transport.peer_addr(), e);
                engine.fail(e);
                break;
            }
            last_write = Instant::now();
        }
        if engine.is_closed() {
            break;
        }
        if engine.is_closing() && close_deadline.is_none() {
            close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
        }

        // Heartbeat at half the peer's timeout; enforce ours in full.
        let heartbeat_at = engine.remote_idle_timeout().map(|t| last_write + t / 2);
        let idle_deadline = engine.local_idle_timeout().map(|t| last_read + t);

        tokio::select! {
            command = commands.recv(), if commands_open => match command {
                Some(command) => engine.handle_command(command),
                None => {
                    tracing::debug!("All handles dropped, closing connection");
                    commands_open = false;
                    engine.handle_command(Command::Close { reply: None });
                }
            },
            result = transport.read(&mut buf) => match result {
                Ok(0) => {
                    let err = match decoder.finish() {
                        Ok(()) => ClientError::ConnectionClosed,
                        Err(e) => e.into(),
                    };
                    tracing::debug!("Peer closed the transport: {}", err);
                    engine.fail(err);
                }
                Ok(n) => {
                    last_read = Instant::now();
                    decoder.extend(&buf[..n]);
                    process_frames(&mut engine, &mut decoder);
                }
                Err(e) => {
                    tracing::warn!("Read from {} failed: {}", transport.peer_addr(), e);
                    engine.fail(e);
                }
            },
            _ = sleep_until(heartbeat_at) => {
                match transport.write_frame(&Frame::heartbeat(), max_frame_size).await {
                    Ok(()) => last_write = Instant::now(),
                    Err(e) => engine.fail(e),
                }
            }
            _ = sleep_until(idle_deadline) => engine.idle_expired(),
            _ = sleep_until(close_deadline) => {
                tracing::warn!("Peer did not answer close within {:?}", CLOSE_TIMEOUT);
                engine.fail(ClientError::ConnectionClosed);
            }
        }
    }

    // Publish the error before the channel closes so that late callers
    // see it.
    let err = engine
        .error()
        .cloned()
        .unwrap_or(ClientError::ConnectionClosed);
    *shared.error.lock() = Some(err);
    commands.close();
    while let Ok(command) = commands.try_recv() {
        engine.handle_command(command);
    }
    transport.close().await;
    tracing::info!("Connection to {} closed", transport.peer_addr());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_request_after_driver_stopped() {
        let (tx, rx) = mpsc::channel(1);
        let shared = Shared::new(tx);
        drop(rx);
        assert!(shared.is_closed());

        let err = tokio_test::block_on(shared.request(|reply| Command::Begin { reply }))
            .unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));

        *shared.error.lock() = Some(ClientError::ProtocolViolation("bad".to_string()));
        let err = tokio_test::block_on(shared.request(|reply| Command::Begin { reply }))
            .unwrap_err();
        assert!(matches!(err, ClientError::ProtocolViolation(_)));
    }

    #[test]
    fn test_dropped_reply_reports_closed() {
        let (tx, mut rx) = mpsc::channel(1);
        let shared = Shared::new(tx);

        let mut request = task::spawn(shared.request(|reply| Command::Begin { reply }));
        assert_pending!(request.poll());

        // The driver takes the command and goes away without answering.
        let command = rx.try_recv().unwrap();
        drop(command);
        let err = assert_ready!(request.poll()).unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
    }

    #[test]
    fn test_no_deadline_never_fires() {
        let mut sleep = task::spawn(sleep_until(None));
        assert_pending!(sleep.poll());
        assert_pending!(sleep.poll());
    }
}
