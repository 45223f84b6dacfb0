//! Typed error taxonomy for the transfer core.
//!
//! Every failure surfaced to a caller carries a human-readable message.
//! None of these are retried automatically; recovery (regenerating a
//! connection code, tearing down and reconnecting) is the caller's
//! decision.

use std::time::Duration;
use thiserror::Error;

/// Failures the transfer core can surface.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A pasted connection code could not be decoded or validated.
    #[error("malformed connection code: {0}")]
    MalformedSignal(String),

    /// ICE candidate gathering did not complete within the bound.
    #[error("candidate gathering timed out after {0:?}")]
    GatheringTimeout(Duration),

    /// The peer connection transitioned to failed, or an operation was
    /// attempted in a state that cannot support it.
    #[error("peer negotiation failed: {0}")]
    NegotiationFailed(String),

    /// A send or receive was attempted on a channel that is not open.
    #[error("data channel closed: {0}")]
    ChannelClosed(String),

    /// The send buffer never drained below the low water mark.
    #[error("send buffer did not drain within the flow-control timeout")]
    FlowControlTimeout,

    /// The transfer was aborted by the local user or by teardown.
    #[error("transfer cancelled")]
    TransferCancelled,

    /// Underlying WebRTC stack error.
    #[error(transparent)]
    Rtc(#[from] webrtc::Error),

    /// Local file I/O error while reading a source file.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Control frame serialization error.
    #[error("control frame encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Convenience alias used throughout the core.
pub type Result<T, E = TransferError> = std::result::Result<T, E>;
