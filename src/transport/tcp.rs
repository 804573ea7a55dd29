//! TCP transport: the controller dials, the agent listens.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::debug;

use super::{Channel, ChannelConfig};
use crate::message::Endpoint;

/// Connect to an agent, giving up after `timeout`.
pub async fn connect<A>(addr: A, config: ChannelConfig, timeout: Duration) -> Result<Channel>
where
    A: ToSocketAddrs + std::fmt::Debug,
{
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| anyhow::anyhow!("Agent at {addr:?} did not accept within {timeout:?}"))?
        .with_context(|| format!("Failed to connect to agent at {addr:?}"))?;

    let peer = stream.peer_addr().ok();
    debug!(?peer, "Connected to agent");
    into_channel(stream, Endpoint::Controller, config)
}

/// Accept the next controller connection.
pub async fn accept(listener: &TcpListener, config: ChannelConfig) -> Result<(Channel, SocketAddr)> {
    let (stream, peer) = listener
        .accept()
        .await
        .context("Failed to accept controller connection")?;
    debug!(%peer, "Accepted controller connection");
    Ok((into_channel(stream, Endpoint::Agent, config)?, peer))
}

fn into_channel(stream: TcpStream, endpoint: Endpoint, config: ChannelConfig) -> Result<Channel> {
    stream
        .set_nodelay(true)
        .context("Failed to set TCP_NODELAY")?;
    let (reader, writer) = stream.into_split();
    Ok(Channel::new(reader, writer, endpoint, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AckResponse, Command, Message, Response};

    #[tokio::test]
    async fn exchange_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (agent, _) = accept(&listener, ChannelConfig::default()).await.unwrap();
            let received = agent.receive_next().await.unwrap();
            agent
                .send(&Response::Ack(AckResponse::ok()).into())
                .await
                .unwrap();
            received
        });

        let controller = connect(addr, ChannelConfig::default(), Duration::from_secs(5))
            .await
            .unwrap();
        controller.send(&Command::CheckConnection.into()).await.unwrap();
        let reply = controller.receive_next().await.unwrap();

        assert_eq!(reply, Message::from(Response::Ack(AckResponse::ok())));
        assert_eq!(server.await.unwrap(), Command::CheckConnection.into());
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(addr, ChannelConfig::default(), Duration::from_secs(5)).await;
        assert!(result.is_err());
    }
}
