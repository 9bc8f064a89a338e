//! Multiplexed channels
//!
//! A [`Channel`] is one named, ordered message stream inside a teleport
//! session. Sending consumes credit granted by the remote receiver; a message
//! waits until enough credit is available. Receiving grants the consumed
//! bytes back. Messages larger than the window go out as fragments, each
//! sent once the receiver has made room for it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};

use super::frame::Frame;
use super::session::SessionInner;
use super::{TeleportError, TeleportResult};

#[derive(Debug, Clone)]
pub(super) enum EndReason {
    LocalClose,
    RemoteClose,
    Failed(TeleportError),
}

/// One frame's worth of a message
#[derive(Debug)]
pub(super) struct Fragment {
    pub(super) data: Vec<u8>,
    pub(super) more: bool,
}

#[derive(Debug)]
pub(super) struct ChannelShared {
    pub(super) id: u16,
    pub(super) name: String,
    /// Bytes we may still send
    pub(super) credit: Semaphore,
    /// Bytes the remote may still send us
    pub(super) recv_window: AtomicU64,
    /// Held for a whole message so fragments of two sends never interleave
    send_turn: tokio::sync::Mutex<()>,
    end: Mutex<Option<EndReason>>,
}

impl ChannelShared {
    pub(super) fn new(id: u16, name: String, initial_credit: u32) -> Self {
        Self {
            id,
            name,
            credit: Semaphore::new(initial_credit as usize),
            recv_window: AtomicU64::new(u64::from(initial_credit)),
            send_turn: tokio::sync::Mutex::new(()),
            end: Mutex::new(None),
        }
    }

    /// First reason wins.
    pub(super) fn end(&self, reason: EndReason) {
        let mut end = self.end.lock().unwrap_or_else(|p| p.into_inner());
        if end.is_none() {
            *end = Some(reason);
        }
        self.credit.close();
    }

    fn end_reason(&self) -> Option<EndReason> {
        self.end.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn send_error(&self) -> TeleportError {
        match self.end_reason() {
            Some(EndReason::Failed(err)) => err,
            _ => TeleportError::ChannelClosed,
        }
    }
}

/// Sending half. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    shared: Arc<ChannelShared>,
    session: Arc<SessionInner>,
}

impl ChannelSender {
    pub fn id(&self) -> u16 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Send one message. Waits for credit, fragment by fragment; fails if
    /// the message exceeds the session's `max_message_size`.
    pub async fn send(&self, data: Vec<u8>) -> TeleportResult<()> {
        let config = self.session.config();
        let max = config.max_message_size as usize;
        if data.len() > max {
            return Err(TeleportError::MessageTooLarge {
                size: data.len(),
                max,
            });
        }
        let window = (config.initial_credit as usize).max(1);

        let _turn = self.shared.send_turn.lock().await;
        if self.shared.end_reason().is_some() {
            return Err(self.shared.send_error());
        }
        if data.len() <= window {
            return self.send_fragment(data, false).await;
        }

        // A message cut short would corrupt the next one on this channel.
        let mut unfinished = Unfinished(Some(self));
        let mut chunks = data.chunks(window).peekable();
        while let Some(chunk) = chunks.next() {
            let more = chunks.peek().is_some();
            self.send_fragment(chunk.to_vec(), more).await?;
        }
        unfinished.0 = None;
        Ok(())
    }

    async fn send_fragment(&self, data: Vec<u8>, more: bool) -> TeleportResult<()> {
        if !data.is_empty() {
            let permit = self
                .shared
                .credit
                .acquire_many(data.len() as u32)
                .await
                .map_err(|_| self.shared.send_error())?;
            permit.forget();
        }
        self.session
            .enqueue(Frame::fragment(self.shared.id, data, more))
    }

    /// Close this channel. The transport stays open.
    pub fn close(&self) {
        self.session.close_channel(self.shared.id);
    }
}

/// Closes the channel if a fragmented send does not run to completion.
struct Unfinished<'a>(Option<&'a ChannelSender>);

impl Drop for Unfinished<'_> {
    fn drop(&mut self) {
        if let Some(sender) = self.0 {
            sender.close();
        }
    }
}

/// Receiving half
#[derive(Debug)]
pub struct ChannelReceiver {
    shared: Arc<ChannelShared>,
    session: Arc<SessionInner>,
    inbound: mpsc::UnboundedReceiver<Fragment>,
    /// Fragments of the message being reassembled
    partial: Vec<u8>,
}

impl ChannelReceiver {
    pub fn id(&self) -> u16 {
        self.shared.id
    }

    /// Next message. `Ok(None)` after an orderly close by either side;
    /// `Err` if the session failed underneath the channel.
    ///
    /// Cancel safe: fragments already taken stay buffered for the next call.
    pub async fn recv(&mut self) -> TeleportResult<Option<Vec<u8>>> {
        let max = self.session.config().max_message_size as usize;
        loop {
            let Some(fragment) = self.inbound.recv().await else {
                self.partial.clear();
                return match self.shared.end_reason() {
                    Some(EndReason::Failed(err)) => Err(err),
                    _ => Ok(None),
                };
            };
            self.grant(fragment.data.len());

            if self.partial.len() + fragment.data.len() > max {
                let size = self.partial.len() + fragment.data.len();
                self.partial = Vec::new();
                self.session.close_channel(self.shared.id);
                return Err(TeleportError::ProtocolViolation(format!(
                    "message of at least {} bytes exceeds limit of {} on channel {}",
                    size, max, self.shared.id
                )));
            }
            if !fragment.more && self.partial.is_empty() {
                return Ok(Some(fragment.data));
            }
            self.partial.extend_from_slice(&fragment.data);
            if !fragment.more {
                return Ok(Some(std::mem::take(&mut self.partial)));
            }
        }
    }

    fn grant(&self, consumed: usize) {
        if consumed == 0 {
            return;
        }
        self.shared
            .recv_window
            .fetch_add(consumed as u64, Ordering::SeqCst);
        // Fails only once the session is gone, and then nobody needs credit.
        let _ = self
            .session
            .enqueue(Frame::credit(self.shared.id, consumed as u32));
    }
}

#[derive(Debug)]
pub struct Channel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl Channel {
    pub(super) fn new(
        shared: Arc<ChannelShared>,
        session: Arc<SessionInner>,
        inbound: mpsc::UnboundedReceiver<Fragment>,
    ) -> Self {
        Self {
            sender: ChannelSender {
                shared: shared.clone(),
                session: session.clone(),
            },
            receiver: ChannelReceiver {
                shared,
                session,
                inbound,
                partial: Vec::new(),
            },
        }
    }

    pub fn id(&self) -> u16 {
        self.sender.id()
    }

    pub fn name(&self) -> &str {
        self.sender.name()
    }

    pub async fn send(&self, data: Vec<u8>) -> TeleportResult<()> {
        self.sender.send(data).await
    }

    pub async fn recv(&mut self) -> TeleportResult<Option<Vec<u8>>> {
        self.receiver.recv().await
    }

    pub fn close(&self) {
        self.sender.close();
    }

    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}
