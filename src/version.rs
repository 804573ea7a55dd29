//! Protocol revisions and the version negotiated with a connected agent.
//!
//! The agent reports its revision as the first field of the VM properties
//! reply. Decoders consult the recorded revision to supply defaults for fields
//! an older agent never writes, and to skip fields it still writes but we no
//! longer use.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{ProtocolError, Result};

/// Revision of the wire protocol spoken by one side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(pub i32);

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Revision implemented by this build.
pub const CURRENT_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion(8);

/// Oldest agent revision a controller accepts by default.
pub const MIN_SUPPORTED_AGENT_VERSION: ProtocolVersion = ProtocolVersion(3);

/// VM properties carry the agent id from this revision on.
pub const AGENT_ID_SINCE: ProtocolVersion = ProtocolVersion(5);

/// Dump results stopped carrying the legacy buffer offset in this revision.
pub const DUMP_LEGACY_OFFSET_REMOVED_IN: ProtocolVersion = ProtocolVersion(4);

/// Dump results carry the truncation flag from this revision on.
pub const DUMP_TRUNCATED_FLAG_SINCE: ProtocolVersion = ProtocolVersion(6);

/// Version information threaded into a single decode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeContext {
    /// Revision this side implements.
    pub local: ProtocolVersion,
    /// Revision the peer reported, once negotiation has happened.
    pub peer: Option<ProtocolVersion>,
}

impl DecodeContext {
    pub const fn new(local: ProtocolVersion, peer: Option<ProtocolVersion>) -> Self {
        Self { local, peer }
    }

    /// Context for a peer known to speak exactly `version`.
    pub const fn for_peer(version: ProtocolVersion) -> Self {
        Self {
            local: CURRENT_PROTOCOL_VERSION,
            peer: Some(version),
        }
    }

    /// Revision decoders should assume the peer wrote.
    ///
    /// Before negotiation the local revision is assumed.
    pub fn effective(&self) -> ProtocolVersion {
        self.peer.unwrap_or(self.local)
    }

    /// Whether the peer writes fields introduced in `since`.
    pub fn peer_at_least(&self, since: ProtocolVersion) -> bool {
        self.effective() >= since
    }
}

impl Default for DecodeContext {
    fn default() -> Self {
        Self::new(CURRENT_PROTOCOL_VERSION, None)
    }
}

/// Peer revision recorded for the life of one connection.
///
/// Shared between the session (which records it) and the channel's decode
/// path (which reads it).
#[derive(Debug, Clone)]
pub struct NegotiatedVersion(Arc<AtomicI32>);

impl Default for NegotiatedVersion {
    fn default() -> Self {
        Self::new()
    }
}

impl NegotiatedVersion {
    const UNKNOWN: i32 = i32::MIN;

    pub fn new() -> Self {
        Self(Arc::new(AtomicI32::new(Self::UNKNOWN)))
    }

    pub fn get(&self) -> Option<ProtocolVersion> {
        match self.0.load(Ordering::Acquire) {
            Self::UNKNOWN => None,
            v => Some(ProtocolVersion(v)),
        }
    }

    pub fn record(&self, version: ProtocolVersion) {
        self.0.store(version.0, Ordering::Release);
    }
}

/// Validate the revision an agent reported against what we accept.
///
/// Older than `minimum` is rejected. Newer than `local` is accepted: the agent
/// may append fields our decoders skip, but it keeps the shapes we know.
pub fn check_agent_version(
    local: ProtocolVersion,
    minimum: ProtocolVersion,
    reported: ProtocolVersion,
) -> Result<ProtocolVersion> {
    if reported < minimum {
        return Err(ProtocolError::IncompatibleVersion {
            agent: reported.0,
            minimum: minimum.0,
        });
    }

    if reported > local {
        warn!(%reported, %local, "Agent speaks a newer protocol revision than this controller");
    } else {
        info!(%reported, "Negotiated agent protocol revision");
    }

    Ok(reported)
}
