//! Client side SASL negotiation (PLAIN and ANONYMOUS).

use crate::error::ClientError;
use crate::transport::Transport;
use amqpx_protocol::sasl::{SaslCode, SaslInit};
use amqpx_protocol::{Decoder, Frame, FrameBody, ProtocolHeader, SaslFrame, Symbol};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

pub const PLAIN: &str = "PLAIN";
pub const ANONYMOUS: &str = "ANONYMOUS";

/// Username and password for SASL PLAIN.
#[derive(Clone, PartialEq, Eq)]
pub struct SaslCredentials {
    pub username: String,
    pub password: String,
}

impl SaslCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for SaslCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Picks the mechanism to use from those the peer offers.
pub(crate) fn select_mechanism(
    offered: &[Symbol],
    credentials: Option<&SaslCredentials>,
) -> Result<&'static str, ClientError> {
    let offers = |name: &str| offered.iter().any(|m| m.as_str() == name);

    if credentials.is_some() && offers(PLAIN) {
        Ok(PLAIN)
    } else if offers(ANONYMOUS) {
        Ok(ANONYMOUS)
    } else {
        let names: Vec<&str> = offered.iter().map(Symbol::as_str).collect();
        Err(ClientError::Sasl(format!(
            "no supported mechanism offered: [{}]",
            names.join(", ")
        )))
    }
}

/// Builds the initial response for `mechanism`.
pub(crate) fn initial_response(
    mechanism: &str,
    credentials: Option<&SaslCredentials>,
) -> Option<Bytes> {
    match (mechanism, credentials) {
        (PLAIN, Some(creds)) => {
            let mut buf = BytesMut::with_capacity(creds.username.len() + creds.password.len() + 2);
            buf.put_u8(0);
            buf.put_slice(creds.username.as_bytes());
            buf.put_u8(0);
            buf.put_slice(creds.password.as_bytes());
            Some(buf.freeze())
        }
        _ => None,
    }
}

/// Runs the SASL exchange. On success the caller continues with the AMQP
/// protocol header.
pub(crate) async fn negotiate(
    transport: &mut Transport,
    decoder: &mut Decoder,
    credentials: Option<&SaslCredentials>,
    hostname: Option<&str>,
) -> Result<(), ClientError> {
    transport.write_header(ProtocolHeader::Sasl).await?;
    let header = transport.read_header(decoder).await?;
    if header != ProtocolHeader::Sasl {
        return Err(ClientError::Sasl(format!(
            "peer answered with {:?} header",
            header
        )));
    }

    let offered = match next_sasl_frame(transport, decoder).await? {
        SaslFrame::Mechanisms(mechanisms) => mechanisms.mechanisms,
        other => {
            return Err(ClientError::Sasl(format!(
                "expected sasl-mechanisms, got {}",
                other.name()
            )))
        }
    };

    let mechanism = select_mechanism(&offered, credentials)?;
    tracing::debug!("Using SASL mechanism {}", mechanism);

    let init = SaslInit {
        mechanism: Symbol::new(mechanism),
        initial_response: initial_response(mechanism, credentials),
        hostname: hostname.map(str::to_string),
    };
    transport
        .write_frame(&Frame::sasl(SaslFrame::Init(init)), decoder.max_frame_size())
        .await?;

    match next_sasl_frame(transport, decoder).await? {
        SaslFrame::Outcome(outcome) if outcome.code == SaslCode::Ok => {
            tracing::debug!("SASL authentication succeeded");
            Ok(())
        }
        SaslFrame::Outcome(outcome) => Err(ClientError::Sasl(format!(
            "authentication failed: {}",
            outcome.code
        ))),
        other => Err(ClientError::Sasl(format!(
            "unexpected {} for mechanism {}",
            other.name(),
            mechanism
        ))),
    }
}

async fn next_sasl_frame(
    transport: &mut Transport,
    decoder: &mut Decoder,
) -> Result<SaslFrame, ClientError> {
    let frame = transport.read_frame(decoder).await?;
    match frame.body {
        FrameBody::Sasl(sasl) => Ok(sasl),
        _ => Err(ClientError::Sasl(format!(
            "expected a SASL frame, got {}",
            frame.name()
        ))),
    }
}
