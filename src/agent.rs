//! Agent side of the protocol.
//!
//! [`serve`] reads commands off a channel in arrival order, hands each to a
//! [`CommandHandler`], and writes exactly one reply per command.
//! [`EventPublisher`] pushes unsolicited events on the same channel.

mod process;

pub use process::ProcessAgent;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::error::{ProtocolError, Result};
use crate::message::{AckResponse, Command, Endpoint, Event, Message, Response};
use crate::transport::Channel;

/// Executes controller commands inside the profiled process.
///
/// A failed or unsupported command is answered with an error
/// [`AckResponse`], never by dropping the reply.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command) -> Response;
}

/// Serve one controller connection until it detaches or disconnects.
///
/// Commands are handled one at a time. A frame the agent cannot decode is
/// answered with an error acknowledgement so the controller's pending
/// command resolves. Returns `Ok` when the controller detaches, asks for
/// termination, or closes the connection.
#[instrument(skip_all, fields(endpoint = ?channel.endpoint()))]
pub async fn serve<H>(channel: Arc<Channel>, handler: &H) -> Result<()>
where
    H: CommandHandler + ?Sized,
{
    if channel.endpoint() != Endpoint::Agent {
        return Err(ProtocolError::violation("serve needs an agent channel"));
    }

    loop {
        let command = match channel.receive_next().await {
            Ok(Message::Command(command)) => command,
            Ok(other) => {
                channel.close();
                return Err(ProtocolError::violation(format!(
                    "agent received {}",
                    other.name()
                )));
            }
            Err(ProtocolError::ChannelClosed(reason)) => {
                debug!(%reason, "Controller disconnected");
                return Ok(());
            }
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Rejecting undecodable command");
                let reject = Response::Ack(AckResponse::error(e.to_string()));
                channel.send(&reject.into()).await?;
                continue;
            }
            Err(e) => return Err(e),
        };

        let name = command.name();
        let ends_session = command.ends_session();
        debug!(command = name, "Handling command");

        let response = handler.handle(command).await;
        let accepted = !matches!(&response, Response::Ack(ack) if !ack.ok);
        channel.send(&response.into()).await?;

        if ends_session && accepted {
            info!(command = name, "Controller ended the session");
            channel.shutdown().await;
            return Ok(());
        }
    }
}

/// Pushes events to the controller alongside command replies.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    channel: Arc<Channel>,
}

impl EventPublisher {
    pub const fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    pub async fn emit(&self, event: Event) -> Result<()> {
        self.channel.send(&event.into()).await
    }
}
