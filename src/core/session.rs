//! Transfer sessions: per-file bookkeeping on both sides of the channel.
//!
//! The sender side queues [`OutgoingTransfer`]s and drains them strictly
//! sequentially — one file fully completes, `end` frame included, before
//! the next begins. The receiver side is the [`Inbox`]: a single active
//! [`IncomingTransfer`] accumulator slot, driven by inbound control and
//! chunk frames.
//!
//! Exactly one incoming transfer may be active at a time. The protocol
//! has no per-chunk addressing, so interleaved transfers on one channel
//! are impossible by construction; the sequential outbound queue is what
//! preserves that invariant on the remote side.
//!
//! All observable state changes leave this module as [`SessionEvent`]s on
//! an unbounded mpsc channel — the transport tasks never touch observer
//! state directly.

use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::PROGRESS_INTERVAL;
use crate::core::connection::LinkState;
use crate::core::protocol::ControlFrame;
use crate::core::transport::{send_file, FrameChannel};
use crate::utils::abort::AbortFlag;

// ── Events ───────────────────────────────────────────────────────────────────

/// Events emitted by the transfer core toward the observer (the CLI).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The peer connection changed state.
    Link(LinkState),
    /// The data channel reached the open state.
    ChannelOpen,
    /// The data channel closed.
    ChannelClosed,
    /// Outbound progress snapshot (throttled).
    SendProgress {
        id: Uuid,
        name: String,
        done: u64,
        total: u64,
    },
    /// An outgoing file's `end` frame was flushed.
    SendComplete { id: Uuid, name: String },
    /// Inbound progress snapshot (throttled; a zero-progress event is
    /// emitted as soon as the `meta` frame arrives).
    ReceiveProgress {
        id: Uuid,
        name: String,
        done: u64,
        total: u64,
    },
    /// An incoming file was finalized.
    FileReceived(ReceivedFile),
    /// A non-fatal error the observer should display.
    Error(String),
}

/// Event sender handed to every task that reports into the session.
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

// ── Progress throttle ────────────────────────────────────────────────────────

/// Rate-limits progress reporting to once per [`PROGRESS_INTERVAL`].
///
/// Completion events bypass the gate; only intermediate snapshots are
/// throttled, so observers are never flooded by 16 KiB-granularity
/// updates.
#[derive(Debug, Default)]
pub struct ProgressGate {
    last: Option<tokio::time::Instant>,
}

impl ProgressGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when enough time has passed since the last accepted report.
    pub fn ready(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        match self.last {
            Some(prev) if now.duration_since(prev) < PROGRESS_INTERVAL => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

// ── Outgoing side ────────────────────────────────────────────────────────────

/// A file queued for sending. Created when the user requests a send,
/// destroyed when its `end` frame is flushed or the transfer aborts.
#[derive(Debug, Clone)]
pub struct OutgoingTransfer {
    /// Session-unique transfer id, never reused.
    pub id: Uuid,
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub mime: String,
}

impl OutgoingTransfer {
    /// Build a transfer from a local path, guessing the MIME type from
    /// the extension.
    pub fn from_path(path: PathBuf) -> std::io::Result<Self> {
        let meta = std::fs::metadata(&path)?;
        if !meta.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into());
        let mime = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self {
            id: Uuid::new_v4(),
            path,
            name,
            size: meta.len(),
            mime,
        })
    }
}

/// Drain a queue of outgoing transfers strictly sequentially.
///
/// Stops on the first transport-level failure; partial bytes already
/// sent are not retracted — the remote accumulator for an aborted file
/// is simply never finalized.
pub async fn run_send_queue<C: FrameChannel>(
    channel: C,
    mut queue: mpsc::Receiver<OutgoingTransfer>,
    events: EventSender,
    abort: AbortFlag,
) {
    while let Some(transfer) = queue.recv().await {
        if abort.is_aborted() {
            break;
        }

        let file = match tokio::fs::File::open(&transfer.path).await {
            Ok(f) => f,
            Err(e) => {
                warn!(event = "send_open_failed", path = %transfer.path.display(), %e,
                      "Cannot open queued file, skipping");
                let _ = events.send(SessionEvent::Error(format!(
                    "cannot open {}: {e}",
                    transfer.path.display()
                )));
                continue;
            }
        };

        let source = BufReader::new(file);
        match send_file(&channel, &transfer, source, &events, &abort).await {
            Ok(()) => {
                info!(event = "file_send_complete", id = %transfer.id, name = %transfer.name,
                      bytes = transfer.size, "File sent");
                let _ = events.send(SessionEvent::SendComplete {
                    id: transfer.id,
                    name: transfer.name.clone(),
                });
            }
            Err(e) => {
                warn!(event = "file_send_failed", id = %transfer.id, name = %transfer.name, %e,
                      "File send aborted");
                let _ = events.send(SessionEvent::Error(format!(
                    "sending {} failed: {e}",
                    transfer.name
                )));
                break;
            }
        }
    }
}

// ── Incoming side ────────────────────────────────────────────────────────────

/// A finalized incoming file: the chunk stream concatenated in arrival
/// order, tagged with the sender's declared name and MIME type.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub id: Uuid,
    pub name: String,
    pub mime: String,
    pub data: Bytes,
}

/// Accumulator for the file currently being received.
#[derive(Debug)]
struct IncomingTransfer {
    id: Uuid,
    name: String,
    size: u64,
    mime: String,
    received: u64,
    chunks: Vec<Bytes>,
    gate: ProgressGate,
}

impl IncomingTransfer {
    fn finalize(self) -> ReceivedFile {
        let mut data = BytesMut::with_capacity(self.received as usize);
        for chunk in &self.chunks {
            data.extend_from_slice(chunk);
        }
        ReceivedFile {
            id: self.id,
            name: self.name,
            mime: self.mime,
            data: data.freeze(),
        }
    }
}

/// Receiver-side reassembly state machine.
///
/// Owns the single active-accumulator slot; inbound frames that do not
/// fit the current state are protocol violations and are dropped without
/// mutating anything.
#[derive(Debug)]
pub struct Inbox {
    active: Option<IncomingTransfer>,
    events: EventSender,
}

impl Inbox {
    pub fn new(events: EventSender) -> Self {
        Self {
            active: None,
            events,
        }
    }

    /// Handle an inbound control frame.
    pub fn on_control(&mut self, frame: ControlFrame) {
        match frame {
            ControlFrame::Meta {
                id,
                name,
                size,
                mime,
            } => {
                if let Some(active) = &self.active {
                    // One transfer at a time: a second meta before the
                    // first end is a protocol violation and is rejected.
                    warn!(event = "meta_while_active", incoming = %id, active = %active.id,
                          "Ignoring meta frame while a transfer is already active");
                    return;
                }
                info!(event = "file_recv_start", %id, %name, size, %mime, "Incoming file announced");
                let _ = self.events.send(SessionEvent::ReceiveProgress {
                    id,
                    name: name.clone(),
                    done: 0,
                    total: size,
                });
                self.active = Some(IncomingTransfer {
                    id,
                    name,
                    size,
                    mime,
                    received: 0,
                    chunks: Vec::new(),
                    gate: ProgressGate::new(),
                });
            }
            ControlFrame::End { id } => {
                let transfer = match self.active.take() {
                    Some(active) if active.id == id => active,
                    Some(active) => {
                        warn!(event = "end_id_mismatch", incoming = %id, active = %active.id,
                              "Ignoring end frame for a different transfer");
                        self.active = Some(active);
                        return;
                    }
                    None => {
                        warn!(event = "end_without_meta", %id, "Ignoring end frame with no active transfer");
                        return;
                    }
                };
                let (done, total) = (transfer.received, transfer.size);
                let file = transfer.finalize();
                info!(event = "file_recv_complete", id = %file.id, name = %file.name,
                      bytes = file.data.len(), "Incoming file finalized");
                let _ = self.events.send(SessionEvent::ReceiveProgress {
                    id: file.id,
                    name: file.name.clone(),
                    done,
                    total,
                });
                let _ = self.events.send(SessionEvent::FileReceived(file));
            }
        }
    }

    /// Handle an inbound binary chunk frame.
    pub fn on_chunk(&mut self, data: Bytes) {
        let Some(active) = self.active.as_mut() else {
            debug!(
                event = "chunk_without_meta",
                bytes = data.len(),
                "Dropping chunk with no active transfer"
            );
            return;
        };

        active.received += data.len() as u64;
        active.chunks.push(data);

        if active.gate.ready() {
            let _ = self.events.send(SessionEvent::ReceiveProgress {
                id: active.id,
                name: active.name.clone(),
                done: active.received,
                total: active.size,
            });
        }
    }

    /// Discard any partially received transfer (session teardown).
    pub fn clear(&mut self) {
        if let Some(active) = self.active.take() {
            warn!(event = "recv_discarded", id = %active.id, name = %active.name,
                  received = active.received, "Discarding incomplete incoming transfer");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
