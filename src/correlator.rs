//! Pairs each command with its reply.
//!
//! The wire carries no request ids, so correlation rests on strict
//! alternation: one command in flight per connection, replies in arrival
//! order. A background reader routes solicited replies to the pending slot
//! and unsolicited events to a bounded queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{ProtocolError, Result};
use crate::message::{tags, Command, Event, Message, MessageKind, Response};
use crate::transport::Channel;

/// The exchange currently awaiting its reply.
///
/// Holds the in-flight permit: the next command cannot be written until this
/// slot is resolved, even if the caller stopped waiting.
struct PendingSlot {
    id: u64,
    command: &'static str,
    expected: i32,
    reply: oneshot::Sender<Result<Response>>,
    _permit: OwnedSemaphorePermit,
}

struct Shared {
    channel: Arc<Channel>,
    pending: Mutex<Option<PendingSlot>>,
}

impl Shared {
    fn install(&self, slot: PendingSlot) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(slot);
    }

    fn take_pending(&self) -> Option<PendingSlot> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Take the pending slot only if it is still exchange `id`.
    fn take_if(&self, id: u64) -> Option<PendingSlot> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.as_ref().is_some_and(|slot| slot.id == id) {
            pending.take()
        } else {
            None
        }
    }

    fn fail_pending(&self, error: ProtocolError) {
        if let Some(slot) = self.take_pending() {
            debug!(command = slot.command, error = %error, "Failing pending exchange");
            let _ = slot.reply.send(Err(error));
        }
    }

    /// Hand a reply to the pending exchange. Returns false if the reply broke
    /// protocol and the channel was closed.
    fn deliver(&self, response: Response) -> bool {
        let Some(slot) = self.take_pending() else {
            warn!(name = response.name(), "Discarding reply with no pending command");
            return true;
        };

        let tag = response.tag();
        if tag != slot.expected && tag != tags::ACK {
            let error = ProtocolError::violation(format!(
                "{} answered with {}",
                slot.command,
                response.name()
            ));
            warn!(error = %error, "Mismatched reply, closing channel");
            self.channel.close();
            let _ = slot.reply.send(Err(error));
            return false;
        }

        trace!(command = slot.command, reply = response.name(), "Reply matched");
        if slot.reply.send(Ok(response)).is_err() {
            warn!(command = slot.command, "Discarding late reply");
        }
        true
    }
}

/// Withdraws a submitted exchange whose command never finished writing.
struct Unsent<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for Unsent<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.shared.take_if(self.id) {
            debug!(command = slot.command, "Exchange withdrawn before its command was written");
        }
    }
}

/// A command that has been written and awaits its reply.
///
/// Dropping it detaches the caller; the reply is still consumed off the wire
/// when it arrives.
#[must_use = "the reply is discarded unless waited for"]
pub struct PendingResponse {
    command: &'static str,
    reply: oneshot::Receiver<Result<Response>>,
}

impl PendingResponse {
    pub const fn command(&self) -> &'static str {
        self.command
    }

    /// Wait for the reply, optionally bounded by `deadline`.
    ///
    /// Expiry yields [`ProtocolError::ResponseTimeout`] and leaves the channel
    /// open. Closing the channel yields [`ProtocolError::ChannelClosed`].
    pub async fn wait(self, deadline: Option<Duration>) -> Result<Response> {
        let received = match deadline {
            None => self.reply.await,
            Some(timeout) => tokio::time::timeout(timeout, self.reply)
                .await
                .map_err(|_| ProtocolError::ResponseTimeout {
                    command: self.command,
                    timeout,
                })?,
        };
        received.unwrap_or_else(|_| Err(ProtocolError::closed("session dropped before reply")))
    }
}

/// Command/reply correlation over one controller channel.
pub struct Correlator {
    shared: Arc<Shared>,
    in_flight: Arc<Semaphore>,
    next_id: AtomicU64,
    events: tokio::sync::Mutex<mpsc::Receiver<Event>>,
    reader: JoinHandle<()>,
}

impl Correlator {
    /// Start routing incoming messages. Must be called inside a tokio runtime.
    pub fn new(channel: Arc<Channel>, event_queue_depth: usize) -> Self {
        let shared = Arc::new(Shared {
            channel,
            pending: Mutex::new(None),
        });
        let (events_tx, events_rx) = mpsc::channel(event_queue_depth.max(1));
        let reader = tokio::spawn(read_loop(Arc::clone(&shared), events_tx));

        Self {
            shared,
            in_flight: Arc::new(Semaphore::new(1)),
            next_id: AtomicU64::new(0),
            events: tokio::sync::Mutex::new(events_rx),
            reader,
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.shared.channel
    }

    /// Write `command` once the previous exchange has resolved.
    ///
    /// Waits for the in-flight token, installs the pending slot, then writes
    /// the frame. Fails with [`ProtocolError::ChannelClosed`] once the
    /// channel is closed. Dropping the future before the frame is written
    /// withdraws the exchange and releases the token.
    pub async fn submit(&self, command: &Command) -> Result<PendingResponse> {
        let channel = &self.shared.channel;
        let permit = tokio::select! {
            permit = Arc::clone(&self.in_flight).acquire_owned() => {
                permit.map_err(|_| ProtocolError::closed("session is closed"))?
            }
            () = channel.closed() => return Err(ProtocolError::closed("channel is closed")),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.install(PendingSlot {
            id,
            command: command.name(),
            expected: command.expected_reply(),
            reply: tx,
            _permit: permit,
        });

        let unsent = Unsent {
            shared: &self.shared,
            id,
        };

        // The reader drains the slot after closing; catch a close that raced
        // ahead of the install.
        if channel.is_closed() {
            return Err(ProtocolError::closed("channel is closed"));
        }

        channel.send(&Message::Command(command.clone())).await?;
        std::mem::forget(unsent);
        debug!(command = command.name(), "Command sent");

        Ok(PendingResponse {
            command: command.name(),
            reply: rx,
        })
    }

    /// Submit and wait in one step.
    pub async fn request(&self, command: &Command, deadline: Option<Duration>) -> Result<Response> {
        self.submit(command).await?.wait(deadline).await
    }

    /// Next unsolicited event. `None` once the channel is closed and drained.
    pub async fn next_event(&self) -> Option<Event> {
        self.events.lock().await.recv().await
    }

    /// Close the channel, failing any pending exchange.
    pub fn close(&self) {
        self.shared.channel.close();
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.shared.channel.close();
        self.reader.abort();
        self.shared
            .fail_pending(ProtocolError::closed("session dropped"));
    }
}

async fn read_loop(shared: Arc<Shared>, events: mpsc::Sender<Event>) {
    loop {
        let (tag, received) = shared.channel.receive_tagged().await;
        match received {
            Ok(Message::Response(response)) => {
                if !shared.deliver(response) {
                    break;
                }
            }
            Ok(Message::Event(event)) => match events.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    warn!(name = event.name(), "Event queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {}
            },
            Ok(Message::Command(command)) => {
                let error = ProtocolError::violation(format!(
                    "controller received command {}",
                    command.name()
                ));
                shared.channel.close();
                shared.fail_pending(error);
                break;
            }
            // an event nobody can read never answers the pending command
            Err(e)
                if e.is_recoverable()
                    && tag.and_then(MessageKind::of_tag) == Some(MessageKind::Event) =>
            {
                warn!(?tag, error = %e, "Skipping undecodable event");
            }
            Err(e) if e.is_recoverable() => shared.fail_pending(e),
            Err(e) => {
                shared.channel.close();
                shared.fail_pending(e);
                break;
            }
        }
    }
    debug!("Reader stopped");
}
