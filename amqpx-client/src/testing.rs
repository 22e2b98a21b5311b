//! Scripted AMQP peer for end-to-end tests of the client handles.
//!
//! The peer speaks raw frames over a loopback socket and answers exactly
//! what each test scripts, so the wire bytes the client produces can be
//! inspected directly.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use amqpx_protocol::definitions::Handle;
use amqpx_protocol::performative::{Attach, Begin, Close, Flow, Source, Target};
use amqpx_protocol::{Decoder, Encoder, Frame, FrameBody, Performative, ProtocolHeader, Role};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Channel the peer uses for its half of every session.
pub(crate) const PEER_CHANNEL: u16 = 3;

/// The peer's handle for a link is the client's handle plus this.
pub(crate) const PEER_HANDLE_OFFSET: Handle = 10;

pub(crate) async fn listen() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Client configuration matching the scripted peer: no SASL, no heartbeats.
pub(crate) fn client_config(port: u16) -> ConnectionConfig {
    ConnectionConfig::new("127.0.0.1", port)
        .with_sasl(false)
        .with_idle_timeout(None)
        .with_container_id("test-client")
}

pub(crate) async fn connect(port: u16) -> Result<Connection, ClientError> {
    Connection::connect(client_config(port)).await
}

pub(crate) struct ScriptedPeer {
    socket: TcpStream,
    decoder: Decoder,
}

impl ScriptedPeer {
    pub async fn accept(listener: &TcpListener) -> Self {
        let (socket, _) = listener.accept().await.unwrap();
        Self {
            socket,
            decoder: Decoder::default(),
        }
    }

    pub async fn write(&mut self, frame: Frame) {
        let bytes = Encoder::encode_frame(&frame, u32::MAX).unwrap();
        self.socket.write_all(&bytes).await.unwrap();
    }

    async fn fill(&mut self) {
        let mut buf = [0u8; 4096];
        let n = self.socket.read(&mut buf).await.unwrap();
        assert!(n > 0, "client hung up");
        self.decoder.extend(&buf[..n]);
    }

    /// Reads the next frame that is not a heartbeat.
    pub async fn read(&mut self) -> (u16, Performative, Bytes) {
        loop {
            match self.decoder.decode_frame().unwrap() {
                Some(Frame {
                    channel,
                    body:
                        FrameBody::Amqp {
                            performative,
                            payload,
                        },
                }) => return (channel, performative, payload),
                Some(_) => continue,
                None => self.fill().await,
            }
        }
    }

    /// Skips frames until one named `name` arrives.
    pub async fn until(&mut self, name: &str) -> (u16, Performative, Bytes) {
        loop {
            let (channel, performative, payload) = self.read().await;
            if performative.name() == name {
                return (channel, performative, payload);
            }
        }
    }

    /// Exchanges protocol headers and open frames.
    pub async fn handshake(&mut self) {
        let mut header = [0u8; 8];
        self.socket.read_exact(&mut header).await.unwrap();
        assert_eq!(header, ProtocolHeader::Amqp.to_bytes());
        self.socket
            .write_all(&ProtocolHeader::Amqp.to_bytes())
            .await
            .unwrap();

        match self.read().await {
            (0, Performative::Open(open), _) => assert_eq!(open.container_id, "test-client"),
            other => panic!("expected open, got {:?}", other),
        }
        self.write(Frame::amqp(0, amqpx_protocol::performative::Open::new("test-peer")))
            .await;
    }

    /// Answers the client's next begin. Returns the client's channel and
    /// its begin.
    pub async fn answer_begin(&mut self) -> (u16, Begin) {
        let (channel, begin) = match self.read().await {
            (channel, Performative::Begin(begin), _) => (channel, begin),
            other => panic!("expected begin, got {:?}", other),
        };
        let answer = Begin {
            remote_channel: Some(channel),
            next_outgoing_id: 0,
            incoming_window: 2048,
            outgoing_window: 2048,
            handle_max: 255,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        };
        self.write(Frame::amqp(PEER_CHANNEL, answer)).await;
        (channel, begin)
    }

    /// Answers the client's next attach with the opposite role.
    pub async fn answer_attach(&mut self) -> Attach {
        let attach = match self.read().await {
            (_, Performative::Attach(attach), _) => attach,
            other => panic!("expected attach, got {:?}", other),
        };
        let role = match attach.role {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        };
        let address = attach
            .target
            .as_ref()
            .and_then(|t| t.address.clone())
            .or_else(|| attach.source.as_ref().and_then(|s| s.address.clone()))
            .unwrap_or_default();
        let mut answer = Attach::new(
            attach.name.clone(),
            attach.handle + PEER_HANDLE_OFFSET,
            role,
        );
        answer.source = Some(Source::new(address.clone()));
        answer.target = Some(Target::new(address));
        if role == Role::Sender {
            answer.initial_delivery_count = Some(0);
        }
        self.write(Frame::amqp(PEER_CHANNEL, answer)).await;
        attach
    }

    /// Grants `credit` to the client's sender link `handle`.
    pub async fn grant(&mut self, begin: &Begin, handle: Handle, credit: u32) {
        let flow = Flow {
            next_incoming_id: Some(begin.next_outgoing_id),
            incoming_window: 2048,
            next_outgoing_id: 0,
            outgoing_window: 2048,
            handle: Some(handle + PEER_HANDLE_OFFSET),
            delivery_count: Some(0),
            link_credit: Some(credit),
            ..Default::default()
        };
        self.write(Frame::amqp(PEER_CHANNEL, flow)).await;
    }

    /// Waits for the client's close and answers it.
    pub async fn answer_close(&mut self) {
        match self.until("close").await {
            (_, Performative::Close(close), _) => assert_eq!(close.error, None),
            other => panic!("expected close, got {:?}", other),
        }
        self.write(Frame::amqp(0, Close::default())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqpx_protocol::performative::{Disposition, Transfer};
    use amqpx_protocol::{Body, DeliveryState, Message, Outcome, Value};
    use std::time::Duration;
    use tokio::sync::oneshot;

    const ADDRESS: &str = "queue://test";

    fn set_properties(message: &mut Message) {
        message.set_string_property("nullString", None).unwrap();
        message.set_string_property("string", Some("value")).unwrap();
        message.set_property("boolean", true).unwrap();
        message.set_property("byte", i8::MAX).unwrap();
        message.set_property("short", i16::MAX).unwrap();
        message.set_property("int", i32::MAX).unwrap();
        message.set_property("long", i64::MAX).unwrap();
        message.set_property("float", f32::MAX).unwrap();
        message.set_property("double", f64::MAX).unwrap();
    }

    fn assert_properties(message: &Message) {
        assert_eq!(message.property_names().count(), 9);
        for name in [
            "nullString",
            "string",
            "boolean",
            "byte",
            "short",
            "int",
            "long",
            "float",
            "double",
        ] {
            assert!(message.property_exists(name), "missing {}", name);
        }
        assert!(!message.property_exists("neverSet"));

        assert_eq!(message.property("nullString"), Some(&Value::Null));
        assert_eq!(message.string_property("nullString").unwrap(), None);
        assert_eq!(
            message.string_property("string").unwrap().as_deref(),
            Some("value")
        );
        assert_eq!(message.bool_property("boolean").unwrap(), Some(true));
        assert_eq!(message.byte_property("byte").unwrap(), Some(i8::MAX));
        assert_eq!(message.short_property("short").unwrap(), Some(i16::MAX));
        assert_eq!(message.int_property("int").unwrap(), Some(i32::MAX));
        assert_eq!(message.long_property("long").unwrap(), Some(i64::MAX));
        assert_eq!(message.float_property("float").unwrap(), Some(f32::MAX));
        assert_eq!(message.double_property("double").unwrap(), Some(f64::MAX));
    }

    /// Sends `message` to a peer that accepts it and returns the transfer
    /// payload as the peer saw it.
    async fn send_accepted(message: &Message) -> Bytes {
        let (listener, port) = listen().await;
        let peer = tokio::spawn(async move {
            let mut peer = ScriptedPeer::accept(&listener).await;
            peer.handshake().await;
            let (_, begin) = peer.answer_begin().await;
            let attach = peer.answer_attach().await;
            assert_eq!(attach.role, Role::Sender);
            peer.grant(&begin, attach.handle, 10).await;

            let (transfer, payload) = match peer.until("transfer").await {
                (_, Performative::Transfer(transfer), payload) => (transfer, payload),
                other => panic!("expected transfer, got {:?}", other),
            };
            assert_eq!(transfer.delivery_id, Some(0));
            assert_ne!(transfer.settled, Some(true));
            assert!(!transfer.more);

            let disposition = Disposition {
                role: Role::Receiver,
                first: 0,
                last: None,
                settled: true,
                state: Some(DeliveryState::Outcome(Outcome::Accepted)),
                batchable: false,
            };
            peer.write(Frame::amqp(PEER_CHANNEL, disposition)).await;
            peer.answer_close().await;
            payload
        });

        let connection = connect(port).await.unwrap();
        let session = connection.begin_session().await.unwrap();
        let sender = session.create_sender(ADDRESS).await.unwrap();

        let outcome = sender.send(message).await.unwrap();
        assert_eq!(outcome, Some(Outcome::Accepted));
        connection.close().await.unwrap();

        peer.await.unwrap()
    }

    #[tokio::test]
    async fn test_send_text_message_with_properties() {
        let mut message = Message::with_text("");
        message.header_mut().durable = true;
        set_properties(&mut message);

        let payload = send_accepted(&message).await;
        // The header section leads the payload.
        assert_eq!(&payload[..3], &[0x00, 0x53, 0x70]);

        let received = Message::decode(payload).unwrap();
        assert!(received.is_durable());
        assert_eq!(
            received.properties.as_ref().and_then(|p| p.to.as_deref()),
            Some(ADDRESS)
        );
        assert_eq!(received.text(), Some(""));
        assert_properties(&received);
    }

    #[tokio::test]
    async fn test_send_null_text_message_with_properties() {
        let mut message = Message::new();
        message.set_text(None);
        message.header_mut().durable = true;
        set_properties(&mut message);

        let payload = send_accepted(&message).await;
        assert_eq!(&payload[..3], &[0x00, 0x53, 0x70]);
        // amqp-value section holding null
        assert_eq!(&payload[payload.len() - 4..], &[0x00, 0x53, 0x77, 0x40]);

        let received = Message::decode(payload).unwrap();
        assert!(received.is_durable());
        assert_eq!(
            received.properties.as_ref().and_then(|p| p.to.as_deref()),
            Some(ADDRESS)
        );
        assert_eq!(received.body, Body::Value(Value::Null));
        assert_eq!(received.text(), None);
        assert_properties(&received);
    }

    #[tokio::test]
    async fn test_receive_null_text_with_properties() {
        let (listener, port) = listen().await;
        let peer = tokio::spawn(async move {
            let mut peer = ScriptedPeer::accept(&listener).await;
            peer.handshake().await;
            peer.answer_begin().await;
            let attach = peer.answer_attach().await;
            assert_eq!(attach.role, Role::Receiver);

            let credit = match peer.until("flow").await {
                (_, Performative::Flow(flow), _) => flow.link_credit,
                other => panic!("expected flow, got {:?}", other),
            };
            assert!(credit.is_some_and(|c| c > 0));

            let mut message = Message::new();
            message.set_text(None);
            message.properties_mut().to = Some(ADDRESS.to_string());
            set_properties(&mut message);
            let transfer = Transfer {
                handle: attach.handle + PEER_HANDLE_OFFSET,
                delivery_id: Some(0),
                delivery_tag: Some(Bytes::from_static(b"\x00")),
                message_format: Some(0),
                settled: Some(false),
                ..Default::default()
            };
            peer.write(Frame::transfer(
                PEER_CHANNEL,
                transfer,
                message.encode().unwrap(),
            ))
            .await;

            let disposition = match peer.until("disposition").await {
                (_, Performative::Disposition(disposition), _) => disposition,
                other => panic!("expected disposition, got {:?}", other),
            };
            peer.answer_close().await;
            disposition
        });

        let connection = connect(port).await.unwrap();
        let session = connection.begin_session().await.unwrap();
        let receiver = session.create_receiver(ADDRESS).await.unwrap();

        let delivery = receiver
            .receive_timeout(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("delivery");
        assert!(!delivery.settled);
        let message = delivery.message();
        assert_eq!(message.body, Body::Value(Value::Null));
        assert_eq!(message.text(), None);
        assert_properties(message);

        receiver.accept(&delivery).await.unwrap();
        connection.close().await.unwrap();

        let disposition = peer.await.unwrap();
        assert_eq!(disposition.role, Role::Receiver);
        assert_eq!(disposition.range(), 0..=0);
        assert!(disposition.settled);
        assert_eq!(
            disposition.state,
            Some(DeliveryState::Outcome(Outcome::Accepted))
        );
    }

    #[tokio::test]
    async fn test_receive_timeout_returns_none() {
        let (listener, port) = listen().await;
        let peer = tokio::spawn(async move {
            let mut peer = ScriptedPeer::accept(&listener).await;
            peer.handshake().await;
            peer.answer_begin().await;
            peer.answer_attach().await;
            peer.answer_close().await;
        });

        let connection = connect(port).await.unwrap();
        let session = connection.begin_session().await.unwrap();
        let receiver = session.create_receiver(ADDRESS).await.unwrap();

        let result = receiver
            .receive_timeout(Duration::from_millis(100))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(!connection.is_closed());

        connection.close().await.unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_receive() {
        let (listener, port) = listen().await;
        let peer = tokio::spawn(async move {
            let mut peer = ScriptedPeer::accept(&listener).await;
            peer.handshake().await;
            peer.answer_begin().await;
            peer.answer_attach().await;
            peer.answer_close().await;
        });

        let connection = connect(port).await.unwrap();
        let session = connection.begin_session().await.unwrap();
        let receiver = session.create_receiver(ADDRESS).await.unwrap();

        let waiter = {
            let receiver = receiver.clone();
            tokio::spawn(async move { receiver.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        connection.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("receive still blocked")
            .unwrap();
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));

        // Later calls fail straight away.
        let err = receiver.receive().await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_hangup_fails_pending_and_later_calls() {
        let (listener, port) = listen().await;
        let (hangup_tx, hangup_rx) = oneshot::channel::<()>();
        let peer = tokio::spawn(async move {
            let mut peer = ScriptedPeer::accept(&listener).await;
            peer.handshake().await;
            peer.answer_begin().await;
            peer.answer_attach().await;
            let _ = hangup_rx.await;
            drop(peer);
        });

        let connection = connect(port).await.unwrap();
        let session = connection.begin_session().await.unwrap();
        let receiver = session.create_receiver(ADDRESS).await.unwrap();

        let waiter = {
            let receiver = receiver.clone();
            tokio::spawn(async move { receiver.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        hangup_tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("receive still blocked")
            .unwrap();
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));

        let err = session.create_sender(ADDRESS).await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
        assert!(connection.is_closed());
        assert!(matches!(connection.error(), Some(ClientError::ConnectionClosed)));
        connection.close().await.unwrap();
        peer.await.unwrap();
    }
}
