//! Signal codec: connection descriptors as copy-pasteable text codes.
//!
//! A descriptor is serialized to compact JSON (`{"type":"offer","sdp":…}`,
//! the same shape webrtc-rs uses for its session descriptions) and then
//! base64-encoded with the URL-safe, padding-free alphabet so the code
//! survives chat, email, and clipboards as a single line with no `+`,
//! `/`, or `=` characters.
//!
//! The decoder is forgiving about the outer transform: raw JSON pasted
//! directly is accepted too. It is strict about content — a code must
//! declare a recognized kind and a non-empty SDP payload.

use crate::core::error::TransferError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

// ── Types ────────────────────────────────────────────────────────────────────

/// Which side of the handshake a descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offer => f.write_str("offer"),
            Self::Answer => f.write_str("answer"),
        }
    }
}

/// The negotiation payload exchanged out-of-band, once per side.
/// Immutable once generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDescriptor {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub sdp: String,
}

impl SignalDescriptor {
    pub fn offer(sdp: String) -> Self {
        Self {
            kind: SignalKind::Offer,
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            kind: SignalKind::Answer,
            sdp,
        }
    }

    /// Convert into the webrtc-rs session description type.
    pub fn into_rtc(self) -> Result<RTCSessionDescription, TransferError> {
        let desc = match self.kind {
            SignalKind::Offer => RTCSessionDescription::offer(self.sdp)?,
            SignalKind::Answer => RTCSessionDescription::answer(self.sdp)?,
        };
        Ok(desc)
    }
}

// ── Codec ────────────────────────────────────────────────────────────────────

/// Encode a descriptor into a single-line pasteable code.
pub fn encode(descriptor: &SignalDescriptor) -> String {
    // Serialization of a two-field struct with string values cannot fail.
    let json = serde_json::to_vec(descriptor).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// Decode a pasted code (or raw descriptor JSON) into a descriptor.
///
/// Raw JSON is attempted first when the input looks like it; otherwise
/// the base64 transform is reversed. Every failure mode yields a
/// `MalformedSignal` with a reason suitable for showing to the user.
pub fn decode(input: &str) -> Result<SignalDescriptor, TransferError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(TransferError::MalformedSignal(
            "empty connection code".into(),
        ));
    }

    let json: Vec<u8> = if trimmed.starts_with('{') {
        trimmed.as_bytes().to_vec()
    } else {
        URL_SAFE_NO_PAD.decode(trimmed).map_err(|_| {
            TransferError::MalformedSignal("not a valid connection code token".into())
        })?
    };

    let descriptor: SignalDescriptor = serde_json::from_slice(&json).map_err(|_| {
        TransferError::MalformedSignal(
            "code does not contain an offer or answer descriptor".into(),
        )
    })?;

    if descriptor.sdp.trim().is_empty() {
        return Err(TransferError::MalformedSignal(
            "descriptor has an empty payload".into(),
        ));
    }

    Ok(descriptor)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: SignalKind) -> SignalDescriptor {
        SignalDescriptor {
            kind,
            sdp: "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\n".into(),
        }
    }

    #[test]
    fn round_trips_offer_and_answer() {
        for kind in [SignalKind::Offer, SignalKind::Answer] {
            let desc = sample(kind);
            let code = encode(&desc);
            assert_eq!(decode(&code).unwrap(), desc);
        }
    }

    #[test]
    fn encoded_code_is_single_line_and_paste_safe() {
        let code = encode(&sample(SignalKind::Offer));
        assert!(!code.contains('+'));
        assert!(!code.contains('/'));
        assert!(!code.contains('='));
        assert!(!code.contains('\n'));
    }

    #[test]
    fn accepts_raw_json_paste() {
        let desc = sample(SignalKind::Answer);
        let json = serde_json::to_string(&desc).unwrap();
        assert_eq!(decode(&json).unwrap(), desc);
    }

    #[test]
    fn tolerates_surrounding_whitespace() {
        let desc = sample(SignalKind::Offer);
        let code = format!("  {}\n", encode(&desc));
        assert_eq!(decode(&code).unwrap(), desc);
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(
            decode(""),
            Err(TransferError::MalformedSignal(_))
        ));
        assert!(matches!(
            decode("   \n"),
            Err(TransferError::MalformedSignal(_))
        ));
    }

    #[test]
    fn rejects_missing_sdp() {
        assert!(matches!(
            decode(r#"{"type":"offer"}"#),
            Err(TransferError::MalformedSignal(_))
        ));
        assert!(matches!(
            decode(r#"{"type":"offer","sdp":""}"#),
            Err(TransferError::MalformedSignal(_))
        ));
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(matches!(
            decode(r#"{"type":"rollback","sdp":"v=0"}"#),
            Err(TransferError::MalformedSignal(_))
        ));
    }

    #[test]
    fn rejects_garbage_token() {
        assert!(matches!(
            decode("!!!not-base64!!!"),
            Err(TransferError::MalformedSignal(_))
        ));
        // Valid base64 that decodes to non-JSON bytes.
        let token = URL_SAFE_NO_PAD.encode(b"\x00\x01\x02garbage");
        assert!(matches!(
            decode(&token),
            Err(TransferError::MalformedSignal(_))
        ));
    }
}
