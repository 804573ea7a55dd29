//! Message type hierarchy.
//!
//! Three kinds share one tag space, split into disjoint ranges:
//! - **Commands** (controller → agent), each expecting exactly one reply
//! - **Responses** (agent → controller), solicited replies to a command
//! - **Events** (agent → controller), unsolicited pushes that never satisfy a pending command
//!
//! Each concrete type owns a hand-written codec ([`WireMessage`]); nothing is
//! derived from a self-describing format.

pub mod command;
pub mod event;
pub mod response;

pub use command::{Command, GetMethodNamesCommand, InitiateProfilingCommand};
pub use event::{AgentLogEvent, BufferDumpedEvent, Event, LogLevel};
pub use response::{
    AckResponse, DumpResultsResponse, MethodName, MethodNamesResponse, Response, VmFacts,
    VmPropertiesResponse,
};

use std::ops::RangeInclusive;

use crate::error::Result;
use crate::version::{DecodeContext, ProtocolVersion, CURRENT_PROTOCOL_VERSION};
use crate::wire::{Frame, WireReader, WireWriter};

/// Numeric type tags. Never reused for a different shape.
pub mod tags {
    pub const CHECK_CONNECTION: i32 = 1;
    pub const GET_VM_PROPERTIES: i32 = 2;
    pub const INITIATE_PROFILING: i32 = 3;
    pub const GET_METHOD_NAMES: i32 = 4;
    pub const DUMP_RESULTS: i32 = 5;
    pub const SUSPEND_TARGET_APP: i32 = 6;
    pub const RESUME_TARGET_APP: i32 = 7;
    pub const DETACH: i32 = 8;
    pub const TERMINATE_TARGET_JVM: i32 = 9;

    pub const ACK: i32 = 64;
    pub const VM_PROPERTIES: i32 = 65;
    pub const METHOD_NAMES: i32 = 66;
    pub const DUMP_RESULTS_RESPONSE: i32 = 67;

    pub const BUFFER_DUMPED: i32 = 128;
    pub const AGENT_LOG: i32 = 129;
}

/// Which family a tag belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Command,
    Response,
    Event,
}

impl MessageKind {
    pub const COMMAND_TAGS: RangeInclusive<i32> = 1..=63;
    pub const RESPONSE_TAGS: RangeInclusive<i32> = 64..=127;
    pub const EVENT_TAGS: RangeInclusive<i32> = 128..=191;

    /// Classify a tag by range. `None` means no known range claims it.
    pub fn of_tag(tag: i32) -> Option<Self> {
        if Self::COMMAND_TAGS.contains(&tag) {
            Some(Self::Command)
        } else if Self::RESPONSE_TAGS.contains(&tag) {
            Some(Self::Response)
        } else if Self::EVENT_TAGS.contains(&tag) {
            Some(Self::Event)
        } else {
            None
        }
    }

    pub fn tag_range(self) -> RangeInclusive<i32> {
        match self {
            Self::Command => Self::COMMAND_TAGS,
            Self::Response => Self::RESPONSE_TAGS,
            Self::Event => Self::EVENT_TAGS,
        }
    }
}

/// Which side of the connection a channel serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Drives the session: sends commands, receives responses and events.
    Controller,
    /// The profiled process: receives commands, sends responses and events.
    Agent,
}

impl Endpoint {
    pub const fn may_send(self, kind: MessageKind) -> bool {
        match self {
            Self::Controller => matches!(kind, MessageKind::Command),
            Self::Agent => matches!(kind, MessageKind::Response | MessageKind::Event),
        }
    }

    pub const fn may_receive(self, kind: MessageKind) -> bool {
        match self {
            Self::Controller => matches!(kind, MessageKind::Response | MessageKind::Event),
            Self::Agent => matches!(kind, MessageKind::Command),
        }
    }
}

/// Hand-written codec for one concrete message type.
pub trait WireMessage: Sized {
    const TAG: i32;
    const NAME: &'static str;

    /// Write fields in declared order.
    fn encode(&self, out: &mut WireWriter) -> Result<()>;

    /// Read fields in the same order, applying version shims from `ctx`.
    fn decode(input: &mut WireReader<'_>, ctx: &DecodeContext) -> Result<Self>;
}

/// Any message that can travel in a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Command(Command),
    Response(Response),
    Event(Event),
}

impl Message {
    pub fn tag(&self) -> i32 {
        match self {
            Self::Command(c) => c.tag(),
            Self::Response(r) => r.tag(),
            Self::Event(e) => e.tag(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Command(c) => c.name(),
            Self::Response(r) => r.name(),
            Self::Event(e) => e.name(),
        }
    }

    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Command(_) => MessageKind::Command,
            Self::Response(_) => MessageKind::Response,
            Self::Event(_) => MessageKind::Event,
        }
    }

    /// True for anything the agent originates, solicited or not.
    pub const fn is_response(&self) -> bool {
        !matches!(self, Self::Command(_))
    }

    /// Encode the payload in the current revision's shape and wrap it with
    /// this message's tag.
    pub fn to_frame(&self) -> Result<Frame> {
        self.to_frame_as(CURRENT_PROTOCOL_VERSION)
    }

    /// Encode the payload as a sender implementing `version` writes it.
    pub fn to_frame_as(&self, version: ProtocolVersion) -> Result<Frame> {
        let mut out = WireWriter::new();
        match self {
            Self::Command(c) => c.encode_payload(&mut out)?,
            Self::Response(r) => r.encode_payload(&mut out, version)?,
            Self::Event(e) => e.encode_payload(&mut out)?,
        }
        Ok(Frame::new(self.tag(), out.freeze()))
    }
}

impl From<Command> for Message {
    fn from(c: Command) -> Self {
        Self::Command(c)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Self::Response(r)
    }
}

impl From<Event> for Message {
    fn from(e: Event) -> Self {
        Self::Event(e)
    }
}
