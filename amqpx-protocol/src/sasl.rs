//! SASL frame bodies exchanged before the AMQP protocol header.

use crate::composite::{split_described, Fields, FromValue, ListBuilder};
use crate::error::ProtocolError;
use crate::types::{Symbol, Value};
use bytes::Bytes;
use std::fmt;

pub const MECHANISMS: u64 = 0x40;
pub const INIT: u64 = 0x41;
pub const CHALLENGE: u64 = 0x42;
pub const RESPONSE: u64 = 0x43;
pub const OUTCOME: u64 = 0x44;

#[derive(Debug, Clone, PartialEq)]
pub struct SaslMechanisms {
    pub mechanisms: Vec<Symbol>,
}

#[derive(Clone, PartialEq)]
pub struct SaslInit {
    pub mechanism: Symbol,
    pub initial_response: Option<Bytes>,
    pub hostname: Option<String>,
}

// The initial response carries credentials.
impl fmt::Debug for SaslInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslInit")
            .field("mechanism", &self.mechanism)
            .field(
                "initial_response",
                &self.initial_response.as_ref().map(|_| "<redacted>"),
            )
            .field("hostname", &self.hostname)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaslChallenge {
    pub challenge: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaslResponse {
    pub response: Bytes,
}

/// Result code of a SASL exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslCode {
    Ok,
    Auth,
    Sys,
    SysPerm,
    SysTemp,
}

impl SaslCode {
    pub fn as_u8(self) -> u8 {
        match self {
            SaslCode::Ok => 0,
            SaslCode::Auth => 1,
            SaslCode::Sys => 2,
            SaslCode::SysPerm => 3,
            SaslCode::SysTemp => 4,
        }
    }
}

impl FromValue for SaslCode {
    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match u8::from_value(value)? {
            0 => Ok(SaslCode::Ok),
            1 => Ok(SaslCode::Auth),
            2 => Ok(SaslCode::Sys),
            3 => Ok(SaslCode::SysPerm),
            4 => Ok(SaslCode::SysTemp),
            other => Err(ProtocolError::InvalidSection(format!("sasl code {}", other))),
        }
    }
}

impl fmt::Display for SaslCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SaslCode::Ok => "ok",
            SaslCode::Auth => "auth",
            SaslCode::Sys => "sys",
            SaslCode::SysPerm => "sys-perm",
            SaslCode::SysTemp => "sys-temp",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaslOutcome {
    pub code: SaslCode,
    pub additional_data: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaslFrame {
    Mechanisms(SaslMechanisms),
    Init(SaslInit),
    Challenge(SaslChallenge),
    Response(SaslResponse),
    Outcome(SaslOutcome),
}

impl SaslFrame {
    pub fn name(&self) -> &'static str {
        match self {
            SaslFrame::Mechanisms(_) => "sasl-mechanisms",
            SaslFrame::Init(_) => "sasl-init",
            SaslFrame::Challenge(_) => "sasl-challenge",
            SaslFrame::Response(_) => "sasl-response",
            SaslFrame::Outcome(_) => "sasl-outcome",
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            SaslFrame::Mechanisms(m) => ListBuilder::new()
                .field(Value::Array(
                    m.mechanisms.iter().cloned().map(Value::Symbol).collect(),
                ))
                .describe(MECHANISMS),
            SaslFrame::Init(init) => ListBuilder::new()
                .field(init.mechanism.clone())
                .field(init.initial_response.clone())
                .field(init.hostname.clone())
                .describe(INIT),
            SaslFrame::Challenge(c) => ListBuilder::new()
                .field(c.challenge.clone())
                .describe(CHALLENGE),
            SaslFrame::Response(r) => ListBuilder::new()
                .field(r.response.clone())
                .describe(RESPONSE),
            SaslFrame::Outcome(o) => ListBuilder::new()
                .field(o.code.as_u8())
                .field(o.additional_data.clone())
                .describe(OUTCOME),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let (code, inner) = split_described(value)?;
        let mut f = Fields::from_value(inner)?;
        let frame = match code {
            MECHANISMS => SaslFrame::Mechanisms(SaslMechanisms {
                mechanisms: f.required("sasl-server-mechanisms")?,
            }),
            INIT => SaslFrame::Init(SaslInit {
                mechanism: f.required("mechanism")?,
                initial_response: f.optional()?,
                hostname: f.optional()?,
            }),
            CHALLENGE => SaslFrame::Challenge(SaslChallenge {
                challenge: f.required("challenge")?,
            }),
            RESPONSE => SaslFrame::Response(SaslResponse {
                response: f.required("response")?,
            }),
            OUTCOME => SaslFrame::Outcome(SaslOutcome {
                code: f.required("code")?,
                additional_data: f.optional()?,
            }),
            other => {
                return Err(ProtocolError::UnknownDescriptor(format!(
                    "sasl frame {:#x}",
                    other
                )))
            }
        };
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    fn through_wire(frame: &SaslFrame) -> SaslFrame {
        let bytes = codec::to_bytes(&frame.to_value()).unwrap();
        SaslFrame::from_value(codec::from_bytes(bytes).unwrap()).unwrap()
    }

    #[test]
    fn test_sasl_frames_survive_wire() {
        let frames = [
            SaslFrame::Mechanisms(SaslMechanisms {
                mechanisms: vec!["PLAIN".into(), "ANONYMOUS".into()],
            }),
            SaslFrame::Init(SaslInit {
                mechanism: "PLAIN".into(),
                initial_response: Some(Bytes::from_static(b"\0guest\0guest")),
                hostname: Some("localhost".into()),
            }),
            SaslFrame::Challenge(SaslChallenge {
                challenge: Bytes::from_static(b"nonce"),
            }),
            SaslFrame::Response(SaslResponse {
                response: Bytes::from_static(b"answer"),
            }),
            SaslFrame::Outcome(SaslOutcome {
                code: SaslCode::Auth,
                additional_data: None,
            }),
        ];
        for frame in &frames {
            assert_eq!(&through_wire(frame), frame);
        }
    }

    #[test]
    fn test_single_mechanism_symbol_accepted() {
        let value = Value::described(
            MECHANISMS,
            Value::List(vec![Value::Symbol("ANONYMOUS".into())]),
        );
        let SaslFrame::Mechanisms(m) = SaslFrame::from_value(value).unwrap() else {
            panic!("expected mechanisms");
        };
        assert_eq!(m.mechanisms, vec![Symbol::from("ANONYMOUS")]);
    }

    #[test]
    fn test_init_debug_redacts_response() {
        let init = SaslInit {
            mechanism: "PLAIN".into(),
            initial_response: Some(Bytes::from_static(b"\0user\0secret")),
            hostname: None,
        };
        let debug = format!("{:?}", init);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("redacted"));
    }
}
