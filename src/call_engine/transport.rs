//! Schnittstelle zur Peer-Connection / Media-Engine
//!
//! Die Engine spricht nur über `TransportSession` mit WebRTC. Verhandlungs-
//! objekte sind die nativen webrtc-rs Typen; die Übersetzung in das Record-
//! Format übernimmt der Signaling-Codec.

use crate::config::CallConfig;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Lokale Medien nicht verfügbar (nicht fatal, Anruf läuft degradiert weiter)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("No local media requested")]
    NothingRequested,

    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Media access denied: {0}")]
    Denied(String),

    #[error("Media capture failed: {0}")]
    Capture(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Transport already closed")]
    Closed,

    #[error("Remote candidate rejected: {0}")]
    CandidateRejected(String),
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events die von der TransportSession ausgelöst werden
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Lokaler ICE Candidate gesammelt
    LocalCandidate {
        init: RTCIceCandidateInit,
        kind: RTCIceCandidateType,
    },

    /// Erste Remote-Medien empfangen
    RemoteTrack { track_id: String, kind: String },

    /// Zustand der Peer Connection
    ConnectionStateChanged(RTCPeerConnectionState),
}

// ============================================================================
// LOCAL MEDIA
// ============================================================================

/// Lokal erfasste Medien-Tracks
///
/// Leere Tracks bedeuten Empfangs-Modus ohne eigene Medien.
pub struct LocalMedia {
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    device: Option<String>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>, device: Option<String>) -> Self {
        Self { tracks, device }
    }

    /// Keine lokalen Medien (degradierter Modus)
    pub fn none() -> Self {
        Self {
            tracks: Vec::new(),
            device: None,
        }
    }

    pub fn tracks(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Name des Eingabegeräts, falls bekannt
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Gibt die Tracks frei
    pub fn release(self) {
        tracing::debug!("Releasing {} local track(s)", self.tracks.len());
        drop(self.tracks);
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field(
                "tracks",
                &self.tracks.iter().map(|t| t.id().to_string()).collect::<Vec<_>>(),
            )
            .field("device", &self.device)
            .finish()
    }
}

// ============================================================================
// TRANSPORT SESSION
// ============================================================================

#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Fordert lokale Medien an
    async fn acquire_local_media(&self) -> Result<LocalMedia, MediaError>;

    /// Hängt Tracks an; ohne Tracks wird nur empfangen
    async fn attach_tracks(&self, media: &LocalMedia) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<RTCSessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<RTCSessionDescription, TransportError>;

    async fn set_local_description(&self, desc: RTCSessionDescription)
        -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        desc: RTCSessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit)
        -> Result<(), TransportError>;

    /// Gibt einen Event-Receiver zurück
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Erstellt pro Anruf-Versuch eine neue TransportSession
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, config: &CallConfig)
        -> Result<Arc<dyn TransportSession>, TransportError>;
}
