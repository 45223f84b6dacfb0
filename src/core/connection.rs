//! Connection manager: peer connection lifecycle with manual signaling.
//!
//! One [`PeerLink`] owns one peer connection, its single data channel,
//! and the receiver-side inbox — no ambient globals. Descriptors are
//! exchanged out-of-band as pasteable codes (see [`crate::core::signal`]);
//! once both sides have applied them, ICE negotiation runs outside this
//! module's control until the channel opens.
//!
//! State machine: `Idle → Connecting → Connected`, with `Failed`
//! reachable from either, and `teardown` returning any state to `Idle`.
//! State is published on a `watch` channel and mutated only by the
//! lifecycle callbacks. Negotiation failures are surfaced, never
//! silently retried — reconnecting is the caller's decision after
//! teardown.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::timeout;
use tracing::{error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::RTCPeerConnection;

use crate::core::config::{DATA_CHANNEL_POLL, DATA_CHANNEL_TIMEOUT, ICE_GATHER_TIMEOUT};
use crate::core::error::{Result, TransferError};
use crate::core::session::{EventSender, Inbox, SessionEvent};
use crate::core::signal::{self, SignalDescriptor, SignalKind};
use crate::core::transport::RtcChannel;
use crate::utils::abort::AbortFlag;

// ── State ────────────────────────────────────────────────────────────────────

/// Lifecycle state of a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Failed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Which side of the handshake this link plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

// ── PeerLink ─────────────────────────────────────────────────────────────────

/// An owned peer session: connection handle, channel handle, and the
/// single active incoming-transfer slot.
pub struct PeerLink {
    pc: Arc<RTCPeerConnection>,
    role: Role,
    state_tx: watch::Sender<LinkState>,
    state_rx: watch::Receiver<LinkState>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    inbox: Arc<std::sync::Mutex<Inbox>>,
    events: EventSender,
    abort: AbortFlag,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("role", &self.role)
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl PeerLink {
    // ── Construction ─────────────────────────────────────────────────────

    fn default_ice_servers() -> Vec<RTCIceServer> {
        vec![
            RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".into()],
                ..Default::default()
            },
            RTCIceServer {
                urls: vec!["turn:openrelay.metered.ca:80".into()],
                username: "openrelayproject".into(),
                credential: "openrelayproject".into(),
                ..Default::default()
            },
        ]
    }

    async fn new_peer(role: Role, events: EventSender, abort: AbortFlag) -> Result<Self> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: Self::default_ice_servers(),
                ..Default::default()
            })
            .await?,
        );

        let (state_tx, state_rx) = watch::channel(LinkState::Idle);

        // Lifecycle callbacks are the only writers of the link state.
        {
            let state_tx = state_tx.clone();
            let events = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |s| {
                let state_tx = state_tx.clone();
                let events = events.clone();
                Box::pin(async move {
                    match s {
                        RTCPeerConnectionState::Connected => {
                            info!(event = "link_connected", "Peer connection established");
                            state_tx.send_replace(LinkState::Connected);
                            let _ = events.send(SessionEvent::Link(LinkState::Connected));
                        }
                        RTCPeerConnectionState::Failed => {
                            error!(event = "link_failed", "Peer connection failed");
                            state_tx.send_replace(LinkState::Failed);
                            let _ = events.send(SessionEvent::Link(LinkState::Failed));
                        }
                        RTCPeerConnectionState::Disconnected => {
                            warn!(
                                event = "link_disconnected",
                                "Transient disconnect (ICE may recover)"
                            );
                        }
                        RTCPeerConnectionState::Closed => {
                            info!(event = "link_closed", "Peer connection closed");
                        }
                        _ => {}
                    }
                })
            }));
        }

        let inbox = Arc::new(std::sync::Mutex::new(Inbox::new(events.clone())));

        Ok(Self {
            pc,
            role,
            state_tx,
            state_rx,
            channel: Arc::new(RwLock::new(None)),
            inbox,
            events,
            abort,
        })
    }

    // ── Handshake ────────────────────────────────────────────────────────

    /// Create the initiating side: builds the connection and its data
    /// channel, gathers candidates, and returns the link together with
    /// the encoded offer code to paste to the peer.
    pub async fn initiate(events: EventSender, abort: AbortFlag) -> Result<(Self, String)> {
        let link = Self::new_peer(Role::Initiator, events, abort).await?;

        // Ordered + fully reliable (SCTP default, no partial reliability).
        let dc = link
            .pc
            .create_data_channel(
                "data",
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        attach_channel_handlers(&dc, link.inbox.clone(), link.events.clone());
        *link.channel.write().await = Some(dc);

        let offer = link.pc.create_offer(None).await?;
        link.pc.set_local_description(offer).await?;
        let descriptor = link.gathered_local_description().await?;

        link.state_tx.send_replace(LinkState::Connecting);
        let _ = link.events.send(SessionEvent::Link(LinkState::Connecting));
        info!(event = "offer_ready", "Offer code generated");

        let code = signal::encode(&descriptor);
        Ok((link, code))
    }

    /// Create the responding side from a pasted offer code: applies the
    /// remote offer, gathers a local answer, and returns the link with
    /// the encoded answer code to paste back. The data channel arrives
    /// from the remote side via `on_data_channel`.
    pub async fn join(code: &str, events: EventSender, abort: AbortFlag) -> Result<(Self, String)> {
        let remote = expect_kind(signal::decode(code)?, SignalKind::Offer)?;

        let link = Self::new_peer(Role::Responder, events, abort).await?;

        {
            let channel = link.channel.clone();
            let inbox = link.inbox.clone();
            let events = link.events.clone();
            link.pc.on_data_channel(Box::new(move |dc| {
                let channel = channel.clone();
                let inbox = inbox.clone();
                let events = events.clone();
                Box::pin(async move {
                    info!(event = "channel_announced", label = %dc.label(), "Remote data channel arrived");
                    attach_channel_handlers(&dc, inbox, events);
                    *channel.write().await = Some(dc);
                })
            }));
        }

        link.pc.set_remote_description(remote.into_rtc()?).await?;
        let answer = link.pc.create_answer(None).await?;
        link.pc.set_local_description(answer).await?;
        let descriptor = link.gathered_local_description().await?;

        link.state_tx.send_replace(LinkState::Connecting);
        let _ = link.events.send(SessionEvent::Link(LinkState::Connecting));
        info!(event = "answer_ready", "Answer code generated");

        let code = signal::encode(&descriptor);
        Ok((link, code))
    }

    /// Apply the pasted answer code. Valid only on the initiator while
    /// `Connecting`; reaching `Connected` is observed through the state
    /// watch, not a bounded wait here.
    pub async fn apply_answer(&self, code: &str) -> Result<()> {
        if self.role != Role::Initiator {
            return Err(TransferError::NegotiationFailed(
                "only the offering side can apply an answer".into(),
            ));
        }
        let state = self.state();
        if state != LinkState::Connecting {
            return Err(TransferError::NegotiationFailed(format!(
                "no pending offer to answer (state: {state})"
            )));
        }

        let remote = expect_kind(signal::decode(code)?, SignalKind::Answer)?;
        self.pc.set_remote_description(remote.into_rtc()?).await?;
        info!(event = "answer_applied", "Remote answer applied, negotiating");
        Ok(())
    }

    /// Wait for the local description once ICE candidate gathering has
    /// completed, bounded by [`ICE_GATHER_TIMEOUT`].
    async fn gathered_local_description(&self) -> Result<SignalDescriptor> {
        if self.pc.ice_gathering_state() != RTCIceGatheringState::Complete {
            let (tx, rx) = oneshot::channel::<()>();
            let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
            self.pc.on_ice_gathering_state_change(Box::new(move |state| {
                let tx = tx.clone();
                Box::pin(async move {
                    if state == RTCIceGathererState::Complete {
                        if let Ok(mut guard) = tx.lock() {
                            if let Some(tx) = guard.take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                })
            }));

            // Gathering may have raced to completion before the callback
            // was installed.
            if self.pc.ice_gathering_state() != RTCIceGatheringState::Complete {
                timeout(ICE_GATHER_TIMEOUT, rx)
                    .await
                    .map_err(|_| TransferError::GatheringTimeout(ICE_GATHER_TIMEOUT))?
                    .map_err(|_| TransferError::GatheringTimeout(ICE_GATHER_TIMEOUT))?;
            }
        }

        let desc = self.pc.local_description().await.ok_or_else(|| {
            TransferError::NegotiationFailed("no local description after gathering".into())
        })?;
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SignalKind::Offer,
            RTCSdpType::Answer => SignalKind::Answer,
            other => {
                return Err(TransferError::NegotiationFailed(format!(
                    "unexpected local description type: {other:?}"
                )))
            }
        };
        Ok(SignalDescriptor { kind, sdp: desc.sdp })
    }

    // ── Observation ──────────────────────────────────────────────────────

    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Wait until the connection reaches `Connected`, aborting on
    /// `Failed` or session abort. Unbounded by design: negotiation time
    /// is governed by the underlying ICE exchange.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.state_rx.clone();
        loop {
            match *rx.borrow_and_update() {
                LinkState::Connected => return Ok(()),
                LinkState::Failed => {
                    return Err(TransferError::NegotiationFailed(
                        "connection failed during negotiation".into(),
                    ))
                }
                _ => {}
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(TransferError::NegotiationFailed(
                            "link dropped while waiting for connection".into(),
                        ));
                    }
                }
                _ = self.abort.aborted() => return Err(TransferError::TransferCancelled),
            }
        }
    }

    /// Wait for the data channel to exist and reach the open state,
    /// returning a sendable handle to it.
    pub async fn wait_channel_open(&self) -> Result<RtcChannel> {
        let dc = {
            let start = tokio::time::Instant::now();
            loop {
                if let Some(dc) = self.channel.read().await.clone() {
                    break dc;
                }
                if start.elapsed() > DATA_CHANNEL_TIMEOUT {
                    return Err(TransferError::ChannelClosed(
                        "data channel was never announced".into(),
                    ));
                }
                if self.abort.is_aborted() {
                    return Err(TransferError::TransferCancelled);
                }
                tokio::time::sleep(DATA_CHANNEL_POLL).await;
            }
        };

        match dc.ready_state() {
            RTCDataChannelState::Open => return Ok(RtcChannel::new(dc)),
            RTCDataChannelState::Closed => {
                return Err(TransferError::ChannelClosed(
                    "data channel is permanently closed".into(),
                ))
            }
            _ => {}
        }

        let (tx, mut rx) = mpsc::channel::<()>(1);
        dc.on_open(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(()).await;
            })
        }));

        // The channel may have opened between the state check and the
        // callback installation.
        if dc.ready_state() == RTCDataChannelState::Open {
            return Ok(RtcChannel::new(dc));
        }

        match timeout(DATA_CHANNEL_TIMEOUT, rx.recv()).await {
            Ok(_) => Ok(RtcChannel::new(dc)),
            Err(_) => match dc.ready_state() {
                RTCDataChannelState::Open => Ok(RtcChannel::new(dc)),
                state => Err(TransferError::ChannelClosed(format!(
                    "data channel open timeout (state: {state:?})"
                ))),
            },
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Release all resources: cancel in-flight transfers, discard any
    /// partial incoming accumulator, close channel and connection, and
    /// return the state machine to `Idle`.
    pub async fn teardown(&self) {
        self.abort.abort();
        if let Ok(mut inbox) = self.inbox.lock() {
            inbox.clear();
        }
        if let Err(e) = self.pc.close().await {
            warn!(event = "teardown_close_failed", %e, "Error closing peer connection");
        }
        self.state_tx.send_replace(LinkState::Idle);
        let _ = self.events.send(SessionEvent::Link(LinkState::Idle));
        info!(event = "link_teardown", "Peer link torn down");
    }
}

// ── Descriptor validation ────────────────────────────────────────────────────

fn expect_kind(descriptor: SignalDescriptor, kind: SignalKind) -> Result<SignalDescriptor> {
    if descriptor.kind != kind {
        return Err(TransferError::MalformedSignal(format!(
            "expected an {kind} code, got an {} code",
            descriptor.kind
        )));
    }
    Ok(descriptor)
}

// ── Channel handlers ─────────────────────────────────────────────────────────

/// Attach open/close/error/message callbacks to a data channel.
///
/// Inbound demultiplexing happens here: text frames are parsed as
/// control frames (malformed ones are dropped inside `decode_control`),
/// binary frames go to the inbox's active accumulator. The inbox mutex
/// is only ever held for synchronous, non-blocking work.
fn attach_channel_handlers(
    dc: &Arc<RTCDataChannel>,
    inbox: Arc<std::sync::Mutex<Inbox>>,
    events: EventSender,
) {
    {
        let events = events.clone();
        let label = dc.label().to_string();
        dc.on_open(Box::new(move || {
            let events = events.clone();
            let label = label.clone();
            Box::pin(async move {
                info!(event = "channel_open", channel = %label, "Data channel open");
                let _ = events.send(SessionEvent::ChannelOpen);
            })
        }));
    }

    {
        let events = events.clone();
        let label = dc.label().to_string();
        dc.on_close(Box::new(move || {
            let events = events.clone();
            let label = label.clone();
            Box::pin(async move {
                warn!(event = "channel_closed", channel = %label, "Data channel closed by transport");
                let _ = events.send(SessionEvent::ChannelClosed);
            })
        }));
    }

    {
        let label = dc.label().to_string();
        dc.on_error(Box::new(move |err| {
            let label = label.clone();
            Box::pin(async move {
                error!(event = "channel_error", channel = %label, %err, "Data channel transport error");
            })
        }));
    }

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let inbox = inbox.clone();
        Box::pin(async move {
            let Ok(mut inbox) = inbox.lock() else {
                return;
            };
            if msg.is_string {
                match std::str::from_utf8(&msg.data) {
                    Ok(text) => {
                        if let Some(frame) = crate::core::protocol::decode_control(text) {
                            inbox.on_control(frame);
                        }
                    }
                    Err(_) => {
                        tracing::debug!(
                            event = "control_frame_not_utf8",
                            bytes = msg.data.len(),
                            "Dropping non-UTF-8 text frame"
                        );
                    }
                }
            } else {
                inbox.on_chunk(msg.data);
            }
        })
    }));
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expect_kind_rejects_the_wrong_side() {
        let answer = SignalDescriptor::answer("v=0".into());
        let err = expect_kind(answer, SignalKind::Offer).unwrap_err();
        assert!(matches!(err, TransferError::MalformedSignal(_)));

        let offer = SignalDescriptor::offer("v=0".into());
        assert!(expect_kind(offer, SignalKind::Offer).is_ok());
    }

    #[tokio::test]
    async fn join_rejects_garbage_and_answer_codes() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let err = PeerLink::join("not a code", tx.clone(), AbortFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::MalformedSignal(_)));

        let answer_code = signal::encode(&SignalDescriptor::answer("v=0".into()));
        let err = PeerLink::join(&answer_code, tx, AbortFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::MalformedSignal(_)));
    }
}
