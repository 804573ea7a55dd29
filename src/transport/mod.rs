//! Transport layer for controller ↔ agent communication.
//!
//! A [`Channel`] exclusively owns one duplex byte stream. It frames outgoing
//! messages, reads and decodes incoming frames through the [`Registry`], and
//! can be closed from any thread to abort in-flight I/O.
//! [`tcp`] builds channels over TCP sockets.

pub mod tcp;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{ProtocolError, Result};
use crate::message::{Endpoint, Message};
use crate::registry::Registry;
use crate::version::{DecodeContext, NegotiatedVersion, ProtocolVersion, CURRENT_PROTOCOL_VERSION};
use crate::wire::{read_frame, write_frame, DEFAULT_MAX_FRAME_SIZE};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Per-channel settings threaded in at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Revision this side implements.
    pub protocol_version: ProtocolVersion,
    /// Largest payload accepted or sent.
    pub max_frame_size: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            protocol_version: CURRENT_PROTOCOL_VERSION,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Framed, typed message stream over one connection.
///
/// Reads and writes are guarded separately so one task can block in
/// [`receive_next`](Self::receive_next) while another sends. Concurrent
/// senders serialize on the writer lock, so frames never interleave.
pub struct Channel {
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    registry: Arc<Registry>,
    endpoint: Endpoint,
    config: ChannelConfig,
    negotiated: NegotiatedVersion,
    closed: watch::Sender<bool>,
}

impl Channel {
    /// Wrap the two halves of a stream, using the standard registry.
    pub fn new<R, W>(reader: R, writer: W, endpoint: Endpoint, config: ChannelConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            registry: Arc::new(Registry::standard()),
            endpoint,
            config,
            negotiated: NegotiatedVersion::new(),
            closed,
        }
    }

    /// Wrap a single duplex stream.
    pub fn from_stream<S>(stream: S, endpoint: Endpoint, config: ChannelConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, endpoint, config)
    }

    /// Replace the decoder table.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    pub const fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub const fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Peer revision, shared with whoever performs negotiation.
    pub const fn negotiated(&self) -> &NegotiatedVersion {
        &self.negotiated
    }

    fn decode_context(&self) -> DecodeContext {
        DecodeContext::new(self.config.protocol_version, self.negotiated.get())
    }

    /// Frame and write one message.
    ///
    /// A message this endpoint may not originate is a [`ProtocolError::ProtocolViolation`]
    /// and nothing is written. A write failure closes the channel.
    pub async fn send(&self, message: &Message) -> Result<()> {
        if !self.endpoint.may_send(message.kind()) {
            return Err(ProtocolError::violation(format!(
                "{:?} may not send {} ({:?})",
                self.endpoint,
                message.name(),
                message.kind()
            )));
        }

        let frame = message.to_frame_as(self.config.protocol_version)?;
        if frame.payload.len() > self.config.max_frame_size as usize {
            return Err(ProtocolError::FieldTooLarge {
                field: "payload",
                len: frame.payload.len(),
            });
        }

        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(ProtocolError::closed("channel is closed"));
        }

        let mut writer = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = closed.wait_for(|c| *c) => return Err(ProtocolError::closed("channel is closed")),
        };

        // A write abandoned halfway leaves a torn frame on the stream.
        let torn = CloseOnDrop(self);
        let result = tokio::select! {
            res = write_frame(&mut *writer, &frame) => res,
            _ = closed.wait_for(|c| *c) => Err(ProtocolError::closed("channel closed during write")),
        };
        std::mem::forget(torn);

        match result {
            Ok(()) => {
                trace!(tag = frame.tag, len = frame.payload.len(), name = message.name(), "Sent frame");
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "Write failed, closing channel");
                self.close();
                Err(e)
            }
        }
    }

    /// Read and decode the next message, blocking until one arrives.
    ///
    /// An unknown tag or an unparseable payload inside a well-formed frame
    /// fails this call only; the next call reads the following frame. Lost
    /// framing, EOF, I/O failure, and wrong-direction tags close the channel.
    pub async fn receive_next(&self) -> Result<Message> {
        self.receive_tagged().await.1
    }

    /// Like [`receive_next`](Self::receive_next), also returning the tag of
    /// the frame when one was read in full, even if it failed to decode.
    pub async fn receive_tagged(&self) -> (Option<i32>, Result<Message>) {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return (None, Err(ProtocolError::closed("channel is closed")));
        }

        let mut reader = tokio::select! {
            guard = self.reader.lock() => guard,
            _ = closed.wait_for(|c| *c) => {
                return (None, Err(ProtocolError::closed("channel is closed")));
            }
        };

        let frame = tokio::select! {
            res = read_frame(&mut *reader, self.config.max_frame_size) => res,
            _ = closed.wait_for(|c| *c) => Err(ProtocolError::closed("channel closed during read")),
        };
        drop(reader);

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Read failed, closing channel");
                self.close();
                return (None, Err(e));
            }
        };
        trace!(tag = frame.tag, len = frame.payload.len(), "Received frame");

        let decoded = match self.registry.decode(self.endpoint, &frame, &self.decode_context()) {
            Ok(message) => Ok(message),
            Err(e @ ProtocolError::ProtocolViolation(_)) => {
                warn!(tag = frame.tag, error = %e, "Peer broke protocol, closing channel");
                self.close();
                Err(e)
            }
            Err(e) => {
                warn!(tag = frame.tag, error = %e, "Skipping undecodable frame");
                Err(e)
            }
        };
        (Some(frame.tag), decoded)
    }

    /// Close the channel. Idempotent, synchronous, callable from any thread.
    ///
    /// Blocked and future `send`/`receive_next` calls fail with
    /// [`ProtocolError::ChannelClosed`]. Returns true for the call that
    /// actually closed it.
    pub fn close(&self) -> bool {
        let closed_now = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if closed_now {
            debug!(endpoint = ?self.endpoint, "Channel closed");
        }
        closed_now
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the channel has been closed.
    pub async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|c| *c).await;
    }

    /// Close, then shut down the write half so the peer sees EOF.
    pub async fn shutdown(&self) {
        self.close();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "Write half shutdown failed");
        }
    }
}

/// Closes the channel unless forgotten.
struct CloseOnDrop<'a>(&'a Channel);

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        if self.0.close() {
            warn!("Write cancelled mid-frame, channel closed");
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("endpoint", &self.endpoint)
            .field("config", &self.config)
            .field("negotiated", &self.negotiated.get())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{
        tags, AckResponse, Command, DumpResultsResponse, InitiateProfilingCommand, Response,
    };
    use crate::wire::Frame;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn pair() -> (Channel, Channel) {
        let (a, b) = tokio::io::duplex(4096);
        (
            Channel::from_stream(a, Endpoint::Controller, ChannelConfig::default()),
            Channel::from_stream(b, Endpoint::Agent, ChannelConfig::default()),
        )
    }

    /// Controller channel plus the raw agent end of the pipe.
    fn controller_with_raw_peer() -> (Channel, DuplexStream) {
        let (a, b) = tokio::io::duplex(4096);
        (
            Channel::from_stream(a, Endpoint::Controller, ChannelConfig::default()),
            b,
        )
    }

    #[tokio::test]
    async fn command_and_reply_cross_the_pipe() {
        let (controller, agent) = pair();

        controller.send(&Command::CheckConnection.into()).await.unwrap();
        assert_eq!(agent.receive_next().await.unwrap(), Command::CheckConnection.into());

        let ack: Message = Response::Ack(AckResponse::ok()).into();
        agent.send(&ack).await.unwrap();
        assert_eq!(controller.receive_next().await.unwrap(), ack);
    }

    #[tokio::test]
    async fn unknown_tag_leaves_channel_usable() {
        let (controller, mut peer) = controller_with_raw_peer();

        write_frame(&mut peer, &Frame::new(120, vec![1, 2, 3, 4, 5])).await.unwrap();
        let ack: Message = Response::Ack(AckResponse::ok()).into();
        write_frame(&mut peer, &ack.to_frame().unwrap()).await.unwrap();

        assert_eq!(
            controller.receive_next().await.unwrap_err(),
            ProtocolError::UnsupportedMessageType { tag: 120 }
        );
        assert!(!controller.is_closed());
        assert_eq!(controller.receive_next().await.unwrap(), ack);
    }

    #[tokio::test]
    async fn bad_payload_leaves_channel_usable() {
        let (controller, mut peer) = controller_with_raw_peer();

        // ack whose message length runs past the payload
        write_frame(&mut peer, &Frame::new(tags::ACK, vec![0, 0, 9])).await.unwrap();
        let ack: Message = Response::Ack(AckResponse::error("busy")).into();
        write_frame(&mut peer, &ack.to_frame().unwrap()).await.unwrap();

        let err = controller.receive_next().await.unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
        assert_eq!(controller.receive_next().await.unwrap(), ack);
    }

    #[tokio::test]
    async fn eof_mid_frame_closes_channel() {
        let reader = tokio_test::io::Builder::new()
            .read(&[0, 0, 0, 64, 0, 0, 0, 10, 1, 0])
            .build();
        let writer = tokio_test::io::Builder::new().build();
        let channel = Channel::new(reader, writer, Endpoint::Controller, ChannelConfig::default());

        let err = channel.receive_next().await.unwrap_err();
        assert!(matches!(err, ProtocolError::ChannelClosed(_)));
        assert!(channel.is_closed());
        assert!(matches!(
            channel.receive_next().await.unwrap_err(),
            ProtocolError::ChannelClosed(_)
        ));
    }

    #[tokio::test]
    async fn negative_length_is_fatal() {
        let (controller, mut peer) = controller_with_raw_peer();
        peer.write_all(&[0, 0, 0, 64, 0xFF, 0xFF, 0xFF, 0xF0]).await.unwrap();

        let err = controller.receive_next().await.unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
        assert!(controller.is_closed());
    }

    #[tokio::test]
    async fn wrong_direction_is_a_violation() {
        let (controller, mut peer) = controller_with_raw_peer();

        let err = controller
            .send(&Response::Ack(AckResponse::ok()).into())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
        assert!(!controller.is_closed());

        // a command arriving at the controller means the peer is miswired
        let command: Message = Command::Detach.into();
        write_frame(&mut peer, &command.to_frame().unwrap()).await.unwrap();
        let err = controller.receive_next().await.unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
        assert!(controller.is_closed());
    }

    #[tokio::test]
    async fn close_unblocks_receiver_in_another_task() {
        let (controller, _agent) = pair();
        let controller = Arc::new(controller);

        let blocked = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.receive_next().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(controller.close());
        assert!(!controller.close());

        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ProtocolError::ChannelClosed(_))));
        assert!(matches!(
            controller.send(&Command::CheckConnection.into()).await,
            Err(ProtocolError::ChannelClosed(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_gives_peer_eof() {
        let (controller, agent) = pair();
        controller.shutdown().await;

        let err = agent.receive_next().await.unwrap_err();
        assert!(matches!(err, ProtocolError::ChannelClosed(_)));
    }

    #[tokio::test]
    async fn oversized_payload_is_refused() {
        let (a, _b) = tokio::io::duplex(64);
        let config = ChannelConfig {
            max_frame_size: 4,
            ..ChannelConfig::default()
        };
        let agent = Channel::from_stream(a, Endpoint::Agent, config);

        let err = agent
            .send(&Response::Ack(AckResponse::error("far too long for four bytes")).into())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FieldTooLarge { .. }));
        assert!(!agent.is_closed());
    }

    #[tokio::test]
    async fn receive_tagged_reports_tag_of_undecodable_frame() {
        let (controller, mut peer) = controller_with_raw_peer();

        // agent_log with level 9
        write_frame(&mut peer, &Frame::new(tags::AGENT_LOG, vec![0, 0, 0, 9, 0, 0])).await.unwrap();

        let (tag, result) = controller.receive_tagged().await;
        assert_eq!(tag, Some(tags::AGENT_LOG));
        assert!(matches!(result, Err(ProtocolError::MalformedMessage(_))));
        assert!(!controller.is_closed());
    }

    #[tokio::test]
    async fn agent_writes_dump_results_in_its_own_revision() {
        let (a, b) = tokio::io::duplex(4096);
        let v3 = ChannelConfig {
            protocol_version: ProtocolVersion(3),
            ..ChannelConfig::default()
        };
        let agent = Channel::from_stream(a, Endpoint::Agent, v3);
        let controller = Channel::from_stream(b, Endpoint::Controller, ChannelConfig::default());
        controller.negotiated().record(ProtocolVersion(3));

        let dump: Message = Response::DumpResults(DumpResultsResponse {
            data: vec![7, 8, 9],
            truncated: false,
        })
        .into();
        agent.send(&dump).await.unwrap();
        assert_eq!(controller.receive_next().await.unwrap(), dump);
    }

    #[tokio::test]
    async fn cancelled_write_closes_channel() {
        // nobody drains the peer end, so the write stalls after 64 bytes
        let (a, _peer) = tokio::io::duplex(64);
        let controller = Channel::from_stream(a, Endpoint::Controller, ChannelConfig::default());
        let command: Message = Command::InitiateProfiling(InitiateProfilingCommand {
            instr_type: 1,
            instrument_spawned_threads: true,
            root_classes: vec!["org.example.app.Root".repeat(50)],
        })
        .into();

        let sent = tokio::time::timeout(Duration::from_millis(50), controller.send(&command)).await;
        assert!(sent.is_err());
        assert!(controller.is_closed());
        assert!(matches!(
            controller.send(&Command::CheckConnection.into()).await,
            Err(ProtocolError::ChannelClosed(_))
        ));
    }
}
