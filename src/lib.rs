//! profiler-wire library
//!
//! Binary command/response protocol between a profiling controller and the
//! agent running inside the profiled process:
//! - Big-endian primitives and length-prefixed strings ([`wire`])
//! - Typed commands, replies, and events with hand-written codecs ([`message`])
//! - Tag → decoder dispatch ([`registry`])
//! - Framed duplex channels over any async stream or TCP ([`transport`])
//! - Strict-alternation command/reply correlation ([`correlator`])
//! - Version negotiation and compatibility shims ([`version`], [`session`])
//! - The serving loop for the agent side ([`agent`])

pub mod agent;
pub mod config;
pub mod correlator;
pub mod error;
pub mod message;
pub mod registry;
pub mod session;
pub mod transport;
pub mod version;
pub mod wire;

pub use error::{ProtocolError, Result};
pub use message::{Command, Event, Message, Response};
pub use session::{Session, SessionConfig};
pub use transport::{Channel, ChannelConfig};
