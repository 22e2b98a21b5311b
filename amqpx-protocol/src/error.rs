//! Protocol error types and AMQP error conditions.

use std::fmt;
use thiserror::Error;

/// Errors raised while encoding or decoding AMQP data.
///
/// Decoding never panics on malformed input; every inconsistency in the
/// byte stream maps to one of these variants.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("invalid protocol header: {0:?}")]
    InvalidProtocolHeader([u8; 8]),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("invalid frame size: {0}")]
    InvalidFrameSize(u32),

    #[error("invalid data offset: {0}")]
    InvalidDataOffset(u8),

    #[error("unknown frame type: {0:#x}")]
    UnknownFrameType(u8),

    #[error("truncated data: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("invalid format code: {0:#x}")]
    InvalidFormatCode(u8),

    #[error("unsupported type: format code {0:#x}")]
    UnsupportedType(u8),

    #[error("invalid UTF-8 in string")]
    InvalidUtf8,

    #[error("invalid char value: {0:#x}")]
    InvalidChar(u32),

    #[error("invalid array: {0}")]
    InvalidArray(&'static str),

    #[error("values nested deeper than {0} levels")]
    NestingTooDeep(usize),

    #[error("unexpected type: expected {expected}, found {found}")]
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("unknown descriptor: {0}")]
    UnknownDescriptor(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid section: {0}")]
    InvalidSection(String),

    #[error("cannot read property '{key}' of type {found} as {requested}")]
    PropertyConversion {
        key: String,
        found: &'static str,
        requested: &'static str,
    },

    #[error("invalid property name: {0:?}")]
    InvalidPropertyName(String),
}

impl ProtocolError {
    /// Returns the AMQP condition a peer should be told about when this
    /// error terminates a connection.
    pub fn condition(&self) -> ErrorCondition {
        match self {
            ProtocolError::FrameTooLarge { .. }
            | ProtocolError::InvalidFrameSize(_)
            | ProtocolError::InvalidDataOffset(_)
            | ProtocolError::UnknownFrameType(_)
            | ProtocolError::InvalidProtocolHeader(_) => ErrorCondition::FramingError,
            _ => ErrorCondition::DecodeError,
        }
    }
}

/// AMQP 1.0 error conditions (section 2.8.15 to 2.8.18).
///
/// The symbolic names are part of the wire contract and must not change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCondition {
    // amqp-error
    InternalError,
    NotFound,
    UnauthorizedAccess,
    DecodeError,
    ResourceLimitExceeded,
    NotAllowed,
    InvalidField,
    NotImplemented,
    ResourceLocked,
    PreconditionFailed,
    ResourceDeleted,
    IllegalState,
    FrameSizeTooSmall,

    // connection-error
    ConnectionForced,
    FramingError,
    Redirect,

    // session-error
    WindowViolation,
    ErrantLink,
    HandleInUse,
    UnattachedHandle,

    // link-error
    DetachForced,
    TransferLimitExceeded,
    MessageSizeExceeded,
    LinkRedirect,
    Stolen,

    /// A condition this implementation does not know, kept verbatim.
    Other(String),
}

impl ErrorCondition {
    /// Returns the wire symbol for this condition.
    pub fn as_symbol(&self) -> &str {
        match self {
            ErrorCondition::InternalError => "amqp:internal-error",
            ErrorCondition::NotFound => "amqp:not-found",
            ErrorCondition::UnauthorizedAccess => "amqp:unauthorized-access",
            ErrorCondition::DecodeError => "amqp:decode-error",
            ErrorCondition::ResourceLimitExceeded => "amqp:resource-limit-exceeded",
            ErrorCondition::NotAllowed => "amqp:not-allowed",
            ErrorCondition::InvalidField => "amqp:invalid-field",
            ErrorCondition::NotImplemented => "amqp:not-implemented",
            ErrorCondition::ResourceLocked => "amqp:resource-locked",
            ErrorCondition::PreconditionFailed => "amqp:precondition-failed",
            ErrorCondition::ResourceDeleted => "amqp:resource-deleted",
            ErrorCondition::IllegalState => "amqp:illegal-state",
            ErrorCondition::FrameSizeTooSmall => "amqp:frame-size-too-small",
            ErrorCondition::ConnectionForced => "amqp:connection:forced",
            ErrorCondition::FramingError => "amqp:connection:framing-error",
            ErrorCondition::Redirect => "amqp:connection:redirect",
            ErrorCondition::WindowViolation => "amqp:session:window-violation",
            ErrorCondition::ErrantLink => "amqp:session:errant-link",
            ErrorCondition::HandleInUse => "amqp:session:handle-in-use",
            ErrorCondition::UnattachedHandle => "amqp:session:unattached-handle",
            ErrorCondition::DetachForced => "amqp:link:detach-forced",
            ErrorCondition::TransferLimitExceeded => "amqp:link:transfer-limit-exceeded",
            ErrorCondition::MessageSizeExceeded => "amqp:link:message-size-exceeded",
            ErrorCondition::LinkRedirect => "amqp:link:redirect",
            ErrorCondition::Stolen => "amqp:link:stolen",
            ErrorCondition::Other(symbol) => symbol,
        }
    }

    /// Looks up a condition by its wire symbol.
    pub fn from_symbol(symbol: &str) -> Self {
        match symbol {
            "amqp:internal-error" => ErrorCondition::InternalError,
            "amqp:not-found" => ErrorCondition::NotFound,
            "amqp:unauthorized-access" => ErrorCondition::UnauthorizedAccess,
            "amqp:decode-error" => ErrorCondition::DecodeError,
            "amqp:resource-limit-exceeded" => ErrorCondition::ResourceLimitExceeded,
            "amqp:not-allowed" => ErrorCondition::NotAllowed,
            "amqp:invalid-field" => ErrorCondition::InvalidField,
            "amqp:not-implemented" => ErrorCondition::NotImplemented,
            "amqp:resource-locked" => ErrorCondition::ResourceLocked,
            "amqp:precondition-failed" => ErrorCondition::PreconditionFailed,
            "amqp:resource-deleted" => ErrorCondition::ResourceDeleted,
            "amqp:illegal-state" => ErrorCondition::IllegalState,
            "amqp:frame-size-too-small" => ErrorCondition::FrameSizeTooSmall,
            "amqp:connection:forced" => ErrorCondition::ConnectionForced,
            "amqp:connection:framing-error" => ErrorCondition::FramingError,
            "amqp:connection:redirect" => ErrorCondition::Redirect,
            "amqp:session:window-violation" => ErrorCondition::WindowViolation,
            "amqp:session:errant-link" => ErrorCondition::ErrantLink,
            "amqp:session:handle-in-use" => ErrorCondition::HandleInUse,
            "amqp:session:unattached-handle" => ErrorCondition::UnattachedHandle,
            "amqp:link:detach-forced" => ErrorCondition::DetachForced,
            "amqp:link:transfer-limit-exceeded" => ErrorCondition::TransferLimitExceeded,
            "amqp:link:message-size-exceeded" => ErrorCondition::MessageSizeExceeded,
            "amqp:link:redirect" => ErrorCondition::LinkRedirect,
            "amqp:link:stolen" => ErrorCondition::Stolen,
            other => ErrorCondition::Other(other.to_string()),
        }
    }

    /// Returns whether an endpoint closed with this condition may be
    /// re-established by the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCondition::ResourceLimitExceeded
                | ErrorCondition::ResourceLocked
                | ErrorCondition::ConnectionForced
                | ErrorCondition::DetachForced
                | ErrorCondition::InternalError
        )
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_symbol())
    }
}
