//! Error taxonomy for the wire protocol.
//!
//! Core layers (codec, registry, channel, session) return [`ProtocolError`].
//! Outer layers (config, TCP setup, CLI) wrap it in `anyhow` with context.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while framing, decoding, or correlating messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A frame or field could not be parsed. Fatal to the exchange it belongs to.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The tag is unknown to the local registry (e.g. a newer agent's message).
    #[error("unsupported message type: tag {tag}")]
    UnsupportedMessageType { tag: i32 },

    /// A tag arrived from the wrong direction, or a reply did not match its command.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// I/O failure, peer EOF, or explicit local close.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// No reply within the caller's deadline. The channel stays open.
    #[error("no response to {command} within {timeout:?}")]
    ResponseTimeout {
        command: &'static str,
        timeout: Duration,
    },

    /// A value does not fit its wire representation.
    #[error("field {field} is too large to encode ({len} bytes)")]
    FieldTooLarge { field: &'static str, len: usize },

    /// The agent speaks a protocol revision older than we accept.
    #[error("agent protocol version {agent} is older than the minimum supported {minimum}")]
    IncompatibleVersion { agent: i32, minimum: i32 },

    /// The agent answered the command with an error acknowledgement.
    #[error("agent rejected {command}: {message}")]
    CommandRejected {
        command: &'static str,
        message: String,
    },
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage(reason.into())
    }

    pub(crate) fn closed(reason: impl Into<String>) -> Self {
        Self::ChannelClosed(reason.into())
    }

    pub(crate) fn violation(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation(reason.into())
    }

    /// Whether the connection can keep serving exchanges after this error.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedMessage(_)
                | Self::UnsupportedMessageType { .. }
                | Self::ResponseTimeout { .. }
                | Self::FieldTooLarge { .. }
                | Self::CommandRejected { .. }
        )
    }

    /// Short machine-readable name of the error kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MalformedMessage(_) => "malformed_message",
            Self::UnsupportedMessageType { .. } => "unsupported_message_type",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::ChannelClosed(_) => "channel_closed",
            Self::ResponseTimeout { .. } => "response_timeout",
            Self::FieldTooLarge { .. } => "field_too_large",
            Self::IncompatibleVersion { .. } => "incompatible_version",
            Self::CommandRejected { .. } => "command_rejected",
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::closed("unexpected end of stream"),
            _ => Self::closed(e.to_string()),
        }
    }
}

/// Result alias for protocol operations.
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;
