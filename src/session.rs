//! Controller sessions.
//!
//! A session negotiates with the agent on establishment (the agent's version
//! is the first field of its VM properties reply), records the revision for
//! the channel's decoders, then exposes one typed call per command.
//! Commands from concurrent callers are serialized in arrival order.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::SessionSettings;
use crate::correlator::{Correlator, PendingResponse};
use crate::error::{ProtocolError, Result};
use crate::message::{
    Command, DumpResultsResponse, Endpoint, Event, GetMethodNamesCommand, InitiateProfilingCommand,
    MethodNamesResponse, Response, VmPropertiesResponse,
};
use crate::transport::Channel;
use crate::version::{check_agent_version, ProtocolVersion, MIN_SUPPORTED_AGENT_VERSION};

/// Parsed session configuration with `Duration` fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline for ordinary command replies. `None` waits until the reply
    /// arrives or the channel closes.
    pub response_timeout: Option<Duration>,

    /// How long the agent has to answer the negotiation request.
    pub negotiate_timeout: Duration,

    /// How long to wait for a TCP connection to the agent.
    pub connect_timeout: Duration,

    /// Events buffered before new ones are dropped.
    pub event_queue_depth: usize,

    /// Oldest agent revision accepted.
    pub min_agent_version: ProtocolVersion,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout: None,
            negotiate_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            event_queue_depth: 256,
            min_agent_version: MIN_SUPPORTED_AGENT_VERSION,
        }
    }
}

impl SessionConfig {
    /// Create from the JSON configuration values.
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            response_timeout: settings.response_timeout_seconds.map(Duration::from_secs),
            negotiate_timeout: Duration::from_secs(settings.negotiate_timeout_seconds),
            connect_timeout: Duration::from_secs(settings.connect_timeout_seconds),
            event_queue_depth: settings.event_queue_depth,
            ..Self::default()
        }
    }

    /// Create from environment variables, falling back to defaults.
    ///
    /// Reads `PROFILER_WIRE_RESPONSE_TIMEOUT` and
    /// `PROFILER_WIRE_NEGOTIATE_TIMEOUT` (in seconds).
    pub fn from_env() -> Self {
        let seconds = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
        };
        let defaults = Self::default();
        Self {
            response_timeout: seconds("PROFILER_WIRE_RESPONSE_TIMEOUT"),
            negotiate_timeout: seconds("PROFILER_WIRE_NEGOTIATE_TIMEOUT")
                .unwrap_or(defaults.negotiate_timeout),
            ..defaults
        }
    }
}

/// A negotiated connection to one agent.
pub struct Session {
    correlator: Correlator,
    config: SessionConfig,
    vm_properties: VmPropertiesResponse,
}

impl Session {
    /// Negotiate over a controller channel.
    ///
    /// Requests the agent's VM properties within `negotiate_timeout`, checks
    /// the reported revision, and records it on the channel. The channel is
    /// closed if negotiation fails.
    pub async fn establish(channel: impl Into<Arc<Channel>>, config: SessionConfig) -> Result<Self> {
        let channel = channel.into();
        if channel.endpoint() != Endpoint::Controller {
            return Err(ProtocolError::violation("sessions need a controller channel"));
        }

        let correlator = Correlator::new(Arc::clone(&channel), config.event_queue_depth);
        let reply = correlator
            .request(&Command::GetVmProperties, Some(config.negotiate_timeout))
            .await?
            .into_accepted("get_vm_properties")?;

        let vm_properties = match reply {
            Response::VmProperties(props) => props,
            other => return Err(unexpected_reply("get_vm_properties", &other)),
        };

        let version = check_agent_version(
            channel.config().protocol_version,
            config.min_agent_version,
            vm_properties.agent_version(),
        )
        .map_err(|e| {
            warn!(error = %e, "Refusing agent");
            e
        })?;
        channel.negotiated().record(version);

        info!(
            agent_version = %version,
            agent_id = vm_properties.agent_id(),
            jdk = vm_properties.jdk_version(),
            "Session established"
        );

        Ok(Self {
            correlator,
            config,
            vm_properties,
        })
    }

    /// The agent's reply to negotiation.
    pub const fn vm_properties(&self) -> &VmPropertiesResponse {
        &self.vm_properties
    }

    /// Revision the agent reported.
    pub const fn agent_version(&self) -> ProtocolVersion {
        self.vm_properties.agent_version()
    }

    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn channel(&self) -> &Arc<Channel> {
        self.correlator.channel()
    }

    /// Write a command without waiting for its reply.
    pub async fn submit(&self, command: &Command) -> Result<PendingResponse> {
        self.correlator.submit(command).await
    }

    /// Send a command and wait for its reply under the configured deadline.
    ///
    /// Error acknowledgements are returned as-is.
    pub async fn send(&self, command: &Command) -> Result<Response> {
        self.correlator
            .request(command, self.config.response_timeout)
            .await
    }

    async fn expect_ack(&self, command: Command) -> Result<()> {
        match self.send(&command).await?.into_accepted(command.name())? {
            Response::Ack(_) => Ok(()),
            other => Err(unexpected_reply(command.name(), &other)),
        }
    }

    pub async fn check_connection(&self) -> Result<()> {
        self.expect_ack(Command::CheckConnection).await
    }

    pub async fn initiate_profiling(&self, command: InitiateProfilingCommand) -> Result<()> {
        self.expect_ack(Command::InitiateProfiling(command)).await
    }

    pub async fn get_method_names(&self, method_ids: Vec<i32>) -> Result<MethodNamesResponse> {
        let command = Command::GetMethodNames(GetMethodNamesCommand { method_ids });
        match self.send(&command).await?.into_accepted(command.name())? {
            Response::MethodNames(names) => Ok(names),
            other => Err(unexpected_reply(command.name(), &other)),
        }
    }

    pub async fn dump_results(&self) -> Result<DumpResultsResponse> {
        let command = Command::DumpResults;
        match self.send(&command).await?.into_accepted(command.name())? {
            Response::DumpResults(results) => Ok(results),
            other => Err(unexpected_reply(command.name(), &other)),
        }
    }

    pub async fn suspend_target_app(&self) -> Result<()> {
        self.expect_ack(Command::SuspendTargetApp).await
    }

    pub async fn resume_target_app(&self) -> Result<()> {
        self.expect_ack(Command::ResumeTargetApp).await
    }

    /// Detach from the agent, leaving the target running, and close.
    pub async fn detach(self) -> Result<()> {
        self.expect_ack(Command::Detach).await?;
        self.channel().shutdown().await;
        debug!("Detached from agent");
        Ok(())
    }

    /// Ask the agent to terminate its host, then close.
    pub async fn terminate_target(self) -> Result<()> {
        self.expect_ack(Command::TerminateTargetJvm).await?;
        self.channel().shutdown().await;
        Ok(())
    }

    /// Next unsolicited event. `None` once the connection is gone.
    pub async fn next_event(&self) -> Option<Event> {
        self.correlator.next_event().await
    }

    /// Close the connection, failing any pending command.
    pub fn close(&self) {
        self.correlator.close();
    }

    pub fn is_closed(&self) -> bool {
        self.channel().is_closed()
    }
}

fn unexpected_reply(command: &str, reply: &Response) -> ProtocolError {
    ProtocolError::violation(format!("unexpected {} reply to {command}", reply.name()))
}
