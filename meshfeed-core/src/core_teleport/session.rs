/*
   Teleport session

   Multiplexes named channels over one Transport.

   Tasks:
   ┌──────────────┐   frames    ┌────────────────┐
   │ reader task  │────────────►│ channel table  │──► Channel::recv()
   │ (decoder)    │             │ (id -> entry)  │
   └──────────────┘             └────────────────┘
   ┌──────────────┐  Outbound
   │ writer task  │◄──────────── Channel::send(), credit grants, control
   └──────────────┘

   Messages above the credit window are split into fragments by the
   sender and put back together by the channel's receiver.

   Channel ids: 0 is control. The initiator allocates even ids, the
   responder odd ids, so both sides can open channels without coordination.

   Failure: a closed transport or a protocol violation ends the session.
   Every channel is ended with that error, accept() returns None and the
   transport is closed.
*/

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use super::channel::{Channel, ChannelShared, EndReason, Fragment};
use super::control::{ControlMessage, CONTROL_CHANNEL, MAX_CHANNEL_NAME};
use super::frame::{Frame, FrameDecoder};
use super::{TeleportError, TeleportResult};
use crate::config::TeleportConfig;
use crate::core_runtime::{spawn_owned, AbortingJoinHandle};
use crate::core_transport::Transport;

#[derive(Debug)]
pub(super) enum Outbound {
    Frame(Frame),
    Shutdown,
}

#[derive(Debug)]
struct ChannelEntry {
    shared: Arc<ChannelShared>,
    inbound: mpsc::UnboundedSender<Fragment>,
}

#[derive(Debug)]
struct SessionState {
    channels: HashMap<u16, ChannelEntry>,
    next_id: u32,
    incoming: Option<mpsc::UnboundedSender<Channel>>,
    failure: Option<TeleportError>,
}

#[derive(Debug)]
pub(super) struct SessionInner {
    initiator: bool,
    config: TeleportConfig,
    transport: Arc<dyn Transport>,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: Mutex<SessionState>,
    closed: watch::Sender<bool>,
}

impl SessionInner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(super) fn config(&self) -> &TeleportConfig {
        &self.config
    }

    pub(super) fn enqueue(&self, frame: Frame) -> TeleportResult<()> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TeleportError::TransportClosed)
    }

    fn register(self: &Arc<Self>, state: &mut SessionState, id: u16, name: String) -> Channel {
        let shared = Arc::new(ChannelShared::new(id, name, self.config.initial_credit));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        state.channels.insert(
            id,
            ChannelEntry {
                shared: shared.clone(),
                inbound: inbound_tx,
            },
        );
        Channel::new(shared, self.clone(), inbound_rx)
    }

    fn open_channel(self: &Arc<Self>, name: &str) -> TeleportResult<Channel> {
        if name.is_empty() || name.len() > MAX_CHANNEL_NAME {
            return Err(TeleportError::InvalidChannelName(name.to_string()));
        }
        let mut state = self.state();
        if let Some(err) = &state.failure {
            return Err(err.clone());
        }
        let id = u16::try_from(state.next_id).map_err(|_| TeleportError::ChannelLimit)?;
        state.next_id += 2;
        let channel = self.register(&mut state, id, name.to_string());
        drop(state);

        self.enqueue(Frame::data(
            CONTROL_CHANNEL,
            ControlMessage::Open {
                id,
                name: name.to_string(),
            }
            .encode(),
        ))?;
        debug!(channel = id, name, "Opened channel");
        Ok(channel)
    }

    pub(super) fn close_channel(&self, id: u16) {
        let Some(entry) = self.state().channels.remove(&id) else {
            return;
        };
        entry.shared.end(EndReason::LocalClose);
        let _ = self.enqueue(Frame::data(
            CONTROL_CHANNEL,
            ControlMessage::Close { id }.encode(),
        ));
        debug!(channel = id, "Closed channel");
    }

    fn remote_parity_ok(&self, id: u16) -> bool {
        // Remote is the responder when we are the initiator.
        let remote_odd = self.initiator;
        id != CONTROL_CHANNEL && (id % 2 == 1) == remote_odd
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame) -> TeleportResult<()> {
        if frame.channel == CONTROL_CHANNEL {
            if frame.credit.is_some() || frame.more {
                return Err(TeleportError::ProtocolViolation(
                    "credit or fragment on control channel".to_string(),
                ));
            }
            let message = ControlMessage::decode(&frame.data)
                .map_err(|e| TeleportError::ProtocolViolation(format!("control: {}", e)))?;
            return self.handle_control(message);
        }

        let mut state = self.state();
        let Some(entry) = state.channels.get(&frame.channel) else {
            // Late frames for a channel we already closed.
            trace!(channel = frame.channel, "Frame for unknown channel dropped");
            return Ok(());
        };

        if let Some(credit) = frame.credit {
            let available = entry.shared.credit.available_permits() as u64;
            if available + u64::from(credit) > u64::from(self.config.initial_credit) {
                return Err(TeleportError::ProtocolViolation(format!(
                    "credit grant of {} overflows window on channel {}",
                    credit, frame.channel
                )));
            }
            entry.shared.credit.add_permits(credit as usize);
            if frame.data.is_empty() {
                return Ok(());
            }
        }

        let len = frame.data.len() as u64;
        let window = entry.shared.recv_window.load(Ordering::SeqCst);
        if len > window {
            return Err(TeleportError::ProtocolViolation(format!(
                "{} bytes exceed receive window of {} on channel {}",
                len, window, frame.channel
            )));
        }
        entry.shared.recv_window.fetch_sub(len, Ordering::SeqCst);
        let fragment = Fragment {
            data: frame.data,
            more: frame.more,
        };
        if entry.inbound.send(fragment).is_err() {
            // Receiver half dropped; keep the channel for its sender.
            trace!(channel = frame.channel, "Receiver gone, message dropped");
        }
        drop(state);
        Ok(())
    }

    fn handle_control(self: &Arc<Self>, message: ControlMessage) -> TeleportResult<()> {
        match message {
            ControlMessage::Open { id, name } => {
                if !self.remote_parity_ok(id) {
                    return Err(TeleportError::ProtocolViolation(format!(
                        "remote opened channel {} with wrong parity",
                        id
                    )));
                }
                let mut state = self.state();
                if state.channels.contains_key(&id) {
                    return Err(TeleportError::ProtocolViolation(format!(
                        "channel {} opened twice",
                        id
                    )));
                }
                debug!(channel = id, name = %name, "Remote opened channel");
                let channel = self.register(&mut state, id, name);
                if let Some(incoming) = &state.incoming {
                    let _ = incoming.send(channel);
                }
                Ok(())
            }
            ControlMessage::Close { id } => {
                if let Some(entry) = self.state().channels.remove(&id) {
                    entry.shared.end(EndReason::RemoteClose);
                    debug!(channel = id, "Remote closed channel");
                }
                Ok(())
            }
        }
    }

    /// End the session. Idempotent; the first error is kept.
    fn shutdown(&self, reason: TeleportError) {
        let mut state = self.state();
        if state.failure.is_some() {
            return;
        }
        state.failure = Some(reason.clone());
        for (_, entry) in state.channels.drain() {
            entry.shared.end(EndReason::Failed(reason.clone()));
        }
        state.incoming = None;
        drop(state);

        let _ = self.outbound.send(Outbound::Shutdown);
        self.closed.send_replace(true);
    }
}

async fn read_loop(inner: Arc<SessionInner>) {
    let mut decoder = FrameDecoder::new(inner.config.max_frame_size);
    while let Some(chunk) = inner.transport.recv().await {
        decoder.push(&chunk);
        loop {
            match decoder.next_frame().and_then(|frame| match frame {
                Some(frame) => inner.handle_frame(frame).map(|()| true),
                None => Ok(false),
            }) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(err) => {
                    warn!(error = %err, "Teleport protocol violation, closing session");
                    inner.shutdown(err);
                    return;
                }
            }
        }
    }
    debug!("Transport closed under teleport session");
    inner.shutdown(TeleportError::TransportClosed);
}

async fn write_loop(
    transport: Arc<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inner: std::sync::Weak<SessionInner>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                if let Err(err) = transport.send(frame.encode()).await {
                    debug!(error = %err, "Teleport write failed");
                    if let Some(inner) = inner.upgrade() {
                        inner.shutdown(TeleportError::TransportClosed);
                    }
                    break;
                }
            }
            Outbound::Shutdown => break,
        }
    }
    transport.close().await;
}

/// One multiplexed session over a transport
#[derive(Debug)]
pub struct Teleport {
    inner: Arc<SessionInner>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Channel>>,
    _reader: AbortingJoinHandle<()>,
}

impl Teleport {
    /// Start a session. `initiator` decides channel id parity and must
    /// differ between the two ends.
    pub fn new(transport: Arc<dyn Transport>, initiator: bool, config: TeleportConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(SessionInner {
            initiator,
            config,
            transport: transport.clone(),
            outbound: outbound_tx,
            state: Mutex::new(SessionState {
                channels: HashMap::new(),
                next_id: if initiator { 2 } else { 1 },
                incoming: Some(incoming_tx),
                failure: None,
            }),
            closed,
        });

        // The writer exits on Outbound::Shutdown, which every session end
        // (including drop) enqueues, after flushing queued frames.
        tokio::spawn(write_loop(transport, outbound_rx, Arc::downgrade(&inner)));
        let reader = spawn_owned(read_loop(inner.clone()));

        Self {
            inner,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            _reader: reader,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.inner.initiator
    }

    pub fn open_channel(&self, name: &str) -> TeleportResult<Channel> {
        self.inner.open_channel(name)
    }

    /// Next channel opened by the remote side, `None` once the session ended.
    pub async fn accept(&self) -> Option<Channel> {
        self.incoming.lock().await.recv().await
    }

    /// Resolves once the session has ended for any reason.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Why the session ended, if it has.
    pub fn failure(&self) -> Option<TeleportError> {
        self.inner.state().failure.clone()
    }

    /// Close every channel and the transport.
    pub fn close(&self) {
        self.inner.shutdown(TeleportError::TransportClosed);
    }
}

impl Drop for Teleport {
    fn drop(&mut self) {
        self.inner.shutdown(TeleportError::TransportClosed);
    }
}
