//! Byte transport for a single AMQP connection.
//!
//! [`Transport`] opens a TCP connection (optionally upgraded to TLS),
//! applies the configured socket options before connecting, and exposes
//! plain read/write/close operations to the connection driver.

use crate::error::ClientError;
use crate::options::{TransportConfig, TransportOptions};
use crate::stream::ClientStream;
use crate::tls::{create_tls_connector, handshake_error};
use amqpx_protocol::{Decoder, Encoder, Frame, ProtocolHeader};
use socket2::SockRef;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

/// An open byte channel to the peer.
pub struct Transport {
    stream: Option<ClientStream>,
    so_timeout: Option<Duration>,
    peer: SocketAddr,
}

impl Transport {
    /// Connects to `host:port`.
    ///
    /// The connect timeout covers name resolution, the TCP connect and the
    /// TLS handshake.
    pub async fn connect(
        host: &str,
        port: u16,
        config: &TransportConfig,
    ) -> Result<Self, ClientError> {
        let options = config.socket();
        let connect_timeout = options.connect_timeout();

        // Fail on bad store material before touching the network.
        let tls = match config {
            TransportConfig::Tls(ssl) => Some(create_tls_connector(ssl, host)?),
            TransportConfig::Plain(_) => None,
        };

        tracing::debug!("Connecting to {}:{}...", host, port);
        let stream = tokio::time::timeout(connect_timeout, async {
            let tcp = connect_tcp(host, port, options).await?;
            match tls {
                Some((connector, server_name)) => {
                    tracing::debug!("Performing TLS handshake...");
                    let stream = connector
                        .connect(server_name, tcp)
                        .await
                        .map_err(handshake_error)?;
                    tracing::debug!("TLS handshake complete");
                    Ok::<_, ClientError>(ClientStream::Tls { stream })
                }
                None => Ok(ClientStream::Plain { stream: tcp }),
            }
        })
        .await
        .map_err(|_| {
            tracing::debug!("Connect timeout after {:?}", connect_timeout);
            ClientError::ConnectTimeout(connect_timeout)
        })??;

        let peer = stream.peer_addr()?;
        tracing::debug!(tls = stream.is_tls(), "Connected to {}", peer);

        Ok(Self {
            stream: Some(stream),
            so_timeout: options.so_timeout(),
            peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_tls(&self) -> bool {
        self.stream.as_ref().is_some_and(ClientStream::is_tls)
    }

    /// Reads available bytes into `buf`. Returns 0 at end of stream.
    ///
    /// Cancel safe: dropping the future before it completes loses no data.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::ConnectionClosed)?;
        Ok(stream.read(buf).await?)
    }

    /// Writes all of `data`, or fails and closes the transport.
    ///
    /// Bounded by the configured so-timeout when one is set.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::ConnectionClosed)?;
        let result = match self.so_timeout {
            Some(limit) => match tokio::time::timeout(limit, write_flush(stream, data)).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout),
            },
            None => write_flush(stream, data).await,
        };
        if result.is_err() {
            // A half-written frame must never be followed by another.
            self.stream = None;
        }
        result
    }

    /// Writes a protocol header.
    pub(crate) async fn write_header(&mut self, header: ProtocolHeader) -> Result<(), ClientError> {
        tracing::debug!("SEND header {:?}", header);
        self.write(&Encoder::encode_header(header)).await
    }

    /// Writes a single frame.
    pub(crate) async fn write_frame(
        &mut self,
        frame: &Frame,
        max_frame_size: u32,
    ) -> Result<(), ClientError> {
        tracing::debug!(channel = frame.channel, "SEND {}", frame.name());
        let bytes = Encoder::encode_frame(frame, max_frame_size)?;
        self.write(&bytes).await
    }

    /// Reads until `decoder` yields a protocol header.
    pub(crate) async fn read_header(
        &mut self,
        decoder: &mut Decoder,
    ) -> Result<ProtocolHeader, ClientError> {
        loop {
            if let Some(header) = decoder.decode_header()? {
                tracing::debug!("RECV header {:?}", header);
                return Ok(header);
            }
            self.fill(decoder).await?;
        }
    }

    /// Reads until `decoder` yields a frame.
    pub(crate) async fn read_frame(&mut self, decoder: &mut Decoder) -> Result<Frame, ClientError> {
        loop {
            if let Some(frame) = decoder.decode_frame()? {
                tracing::debug!(channel = frame.channel, "RECV {}", frame.name());
                return Ok(frame);
            }
            self.fill(decoder).await?;
        }
    }

    async fn fill(&mut self, decoder: &mut Decoder) -> Result<(), ClientError> {
        let mut buf = [0u8; 4096];
        let n = self.read(&mut buf).await?;
        if n == 0 {
            decoder.finish()?;
            return Err(ClientError::ConnectionClosed);
        }
        decoder.extend(&buf[..n]);
        Ok(())
    }

    /// Closes the transport. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            tracing::debug!("Closing transport to {}", self.peer);
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("Transport shutdown failed: {}", e);
            }
        }
    }
}

async fn write_flush(stream: &mut ClientStream, data: &[u8]) -> Result<(), ClientError> {
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

async fn connect_tcp(
    host: &str,
    port: u16,
    options: &TransportOptions,
) -> Result<TcpStream, ClientError> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ClientError::TransportConnect(format!("cannot resolve {}: {}", host, e)))?;

    let mut last_error = None;
    for addr in addrs {
        match connect_addr(addr, options).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!("Connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        ClientError::TransportConnect(format!("no addresses found for {}", host))
    }))
}

async fn connect_addr(
    addr: SocketAddr,
    options: &TransportOptions,
) -> Result<TcpStream, ClientError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    apply_socket_options(&socket, addr, options)?;

    socket
        .connect(addr)
        .await
        .map_err(|e| ClientError::TransportConnect(format!("{}: {}", addr, e)))
}

fn apply_socket_options(
    socket: &TcpSocket,
    addr: SocketAddr,
    options: &TransportOptions,
) -> Result<(), ClientError> {
    let sock = SockRef::from(socket);
    let option_error =
        |name: &str, e: std::io::Error| ClientError::TransportConnect(format!("{}: {}", name, e));

    if let Some(size) = options.send_buffer_size() {
        sock.set_send_buffer_size(size)
            .map_err(|e| option_error("send buffer size", e))?;
    }
    if let Some(size) = options.receive_buffer_size() {
        sock.set_recv_buffer_size(size)
            .map_err(|e| option_error("receive buffer size", e))?;
    }
    if let Some(traffic_class) = options.traffic_class() {
        if addr.is_ipv4() {
            sock.set_tos(traffic_class)
                .map_err(|e| option_error("traffic class", e))?;
        } else {
            tracing::debug!("Traffic class is not applied to IPv6 sockets");
        }
    }
    if let Some(no_delay) = options.tcp_no_delay() {
        sock.set_nodelay(no_delay)
            .map_err(|e| option_error("tcp no delay", e))?;
    }
    if let Some(keep_alive) = options.tcp_keep_alive() {
        sock.set_keepalive(keep_alive)
            .map_err(|e| option_error("keep alive", e))?;
    }
    if let Some(linger) = options.so_linger() {
        sock.set_linger(Some(linger))
            .map_err(|e| option_error("linger", e))?;
    }
    Ok(())
}
