//! Centralized configuration constants for Pastedrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format details (control frame JSON shape)
//! stay in their respective modules.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Outbound chunk size in bytes (16 KiB).
///
/// Well under the 64 KB SCTP message ceiling used by webrtc-rs, so chunks
/// never need fragmentation and survive any conforming data channel
/// implementation without negotiating `a=max-message-size`.
pub const CHUNK_SIZE: usize = 16 * 1024;

// ── Flow control ─────────────────────────────────────────────────────────────

/// High water mark for the data channel SCTP send buffer (bytes).
/// When `buffered_amount` exceeds this value, the sender pauses chunk
/// transmission until the buffer drains below the low water mark.
pub const BUFFERED_AMOUNT_HIGH: usize = 16 * 1024 * 1024;

/// Low water mark: sends resume once the backlog reports at or below
/// this value. Half the ceiling, so a drained burst buys a full window.
pub const BUFFERED_AMOUNT_LOW: usize = BUFFERED_AMOUNT_HIGH / 2;

/// Maximum time the sender waits for the backlog to drain before the
/// transfer fails with `FlowControlTimeout`.
pub const FLOW_CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Backlog polling interval during a backpressure wait.
pub const FLOW_CONTROL_POLL: Duration = Duration::from_millis(10);

// ── Progress reporting ───────────────────────────────────────────────────────

/// Minimum interval between progress events for a single transfer.
/// Completion is always reported regardless of the throttle.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(120);

// ── Connection / Network ─────────────────────────────────────────────────────

/// Timeout for ICE candidate gathering; exceeding it fails the
/// connection attempt with `GatheringTimeout`.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout waiting for the data channel to reach the open state after
/// negotiation completes.
pub const DATA_CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Polling interval while waiting for the responder's inbound data
/// channel to be announced.
pub const DATA_CHANNEL_POLL: Duration = Duration::from_millis(100);
