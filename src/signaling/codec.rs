//! Signaling-Codec
//!
//! Zustandslose Übersetzung zwischen den webrtc-rs Verhandlungsobjekten und
//! den Feldern des geteilten Records. Candidate-Felder werden unverändert
//! übernommen, sonst passt ICE auf der Gegenseite nicht mehr.

use crate::record::{Candidate, SdpType, SessionDescription};
use thiserror::Error;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unsupported SDP type: {0}")]
    UnsupportedSdpType(String),

    #[error("Session description has no SDP")]
    EmptySdp,

    #[error("Malformed candidate: {0:?}")]
    MalformedCandidate(String),
}

// ============================================================================
// SESSION DESCRIPTIONS
// ============================================================================

/// Native Description → Record-Feld
pub fn encode_description(desc: &RTCSessionDescription) -> Result<SessionDescription, CodecError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        other => return Err(CodecError::UnsupportedSdpType(other.to_string())),
    };
    if desc.sdp.is_empty() {
        return Err(CodecError::EmptySdp);
    }

    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp.clone(),
    })
}

/// Record-Feld → native Description
///
/// Das SDP wird hier nicht geparst, das übernimmt die Peer Connection
/// beim Setzen.
pub fn decode_description(desc: &SessionDescription) -> Result<RTCSessionDescription, CodecError> {
    if desc.sdp.is_empty() {
        return Err(CodecError::EmptySdp);
    }

    let mut native = RTCSessionDescription::default();
    native.sdp_type = match desc.sdp_type {
        SdpType::Offer => RTCSdpType::Offer,
        SdpType::Answer => RTCSdpType::Answer,
    };
    native.sdp = desc.sdp.clone();
    Ok(native)
}

// ============================================================================
// CANDIDATES
// ============================================================================

/// Lokaler Candidate → Record-Eintrag
pub fn encode_candidate(
    init: &RTCIceCandidateInit,
    kind: RTCIceCandidateType,
) -> Result<Candidate, CodecError> {
    validate_candidate_string(&init.candidate)?;

    let kind = match kind {
        RTCIceCandidateType::Unspecified => String::new(),
        other => other.to_string(),
    };

    Ok(Candidate {
        kind,
        media_id: init.sdp_mid.clone(),
        media_line_index: init.sdp_mline_index,
        candidate_string: init.candidate.clone(),
    })
}

/// Record-Eintrag → Remote Candidate für die Peer Connection
pub fn decode_candidate(candidate: &Candidate) -> Result<RTCIceCandidateInit, CodecError> {
    validate_candidate_string(&candidate.candidate_string)?;

    Ok(RTCIceCandidateInit {
        candidate: candidate.candidate_string.clone(),
        sdp_mid: candidate.media_id.clone(),
        sdp_mline_index: candidate.media_line_index,
        username_fragment: None,
    })
}

fn validate_candidate_string(value: &str) -> Result<(), CodecError> {
    let body = value.strip_prefix("a=").unwrap_or(value);
    match body.strip_prefix("candidate:") {
        Some(rest) if !rest.trim().is_empty() => Ok(()),
        _ => Err(CodecError::MalformedCandidate(value.to_string())),
    }
}

// ============================================================================
// TESTS
// ============================================================================
