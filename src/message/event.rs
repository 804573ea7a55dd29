//! Unsolicited messages pushed by the agent.
//!
//! Events live in their own tag range so a pending command can never be
//! satisfied by one.

use crate::error::{ProtocolError, Result};
use crate::version::DecodeContext;
use crate::wire::{WireReader, WireWriter};

use super::{tags, WireMessage};

/// The agent flushed its event buffer; `data` is the raw buffer content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDumpedEvent {
    pub buffer_size: i32,
    pub data: Vec<u8>,
}

impl WireMessage for BufferDumpedEvent {
    const TAG: i32 = tags::BUFFER_DUMPED;
    const NAME: &'static str = "buffer_dumped";

    fn encode(&self, out: &mut WireWriter) -> Result<()> {
        out.put_i32(self.buffer_size);
        out.put_bytes("data", &self.data)
    }

    fn decode(input: &mut WireReader<'_>, _ctx: &DecodeContext) -> Result<Self> {
        Ok(Self {
            buffer_size: input.get_i32("buffer_size")?,
            data: input.get_bytes("data")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    const fn code(self) -> i32 {
        match self {
            Self::Info => 0,
            Self::Warning => 1,
            Self::Error => 2,
        }
    }

    fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Self::Info),
            1 => Ok(Self::Warning),
            2 => Ok(Self::Error),
            other => Err(ProtocolError::malformed(format!("level: unknown log level {other}"))),
        }
    }
}

/// Diagnostic text from the agent, for display to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLogEvent {
    pub level: LogLevel,
    pub text: String,
}

impl WireMessage for AgentLogEvent {
    const TAG: i32 = tags::AGENT_LOG;
    const NAME: &'static str = "agent_log";

    fn encode(&self, out: &mut WireWriter) -> Result<()> {
        out.put_i32(self.level.code());
        out.put_utf("text", &self.text)
    }

    fn decode(input: &mut WireReader<'_>, _ctx: &DecodeContext) -> Result<Self> {
        Ok(Self {
            level: LogLevel::from_code(input.get_i32("level")?)?,
            text: input.get_utf("text")?,
        })
    }
}

/// Every unsolicited message the agent can push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    BufferDumped(BufferDumpedEvent),
    AgentLog(AgentLogEvent),
}

impl Event {
    pub const fn tag(&self) -> i32 {
        match self {
            Self::BufferDumped(_) => BufferDumpedEvent::TAG,
            Self::AgentLog(_) => AgentLogEvent::TAG,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::BufferDumped(_) => BufferDumpedEvent::NAME,
            Self::AgentLog(_) => AgentLogEvent::NAME,
        }
    }

    pub(crate) fn encode_payload(&self, out: &mut WireWriter) -> Result<()> {
        match self {
            Self::BufferDumped(e) => e.encode(out),
            Self::AgentLog(e) => e.encode(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_log_roundtrips() {
        let event = AgentLogEvent {
            level: LogLevel::Warning,
            text: "class com.acme.Foo could not be instrumented".to_string(),
        };
        let mut out = WireWriter::new();
        event.encode(&mut out).unwrap();
        let bytes = out.freeze();
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);

        let decoded = AgentLogEvent::decode(&mut WireReader::new(&bytes), &DecodeContext::default())
            .unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn unknown_log_level_is_malformed() {
        let bytes = [0, 0, 0, 9, 0, 0];
        let err = AgentLogEvent::decode(&mut WireReader::new(&bytes), &DecodeContext::default())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }
}
