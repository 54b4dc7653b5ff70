//! WebRTC Transport
//!
//! `TransportSession` auf Basis von webrtc-rs. Pro Versuch eine eigene
//! Peer Connection; ihre Callbacks werden in `TransportEvent`s übersetzt.

use super::transport::{
    LocalMedia, MediaError, TransportError, TransportEvent, TransportFactory, TransportSession,
};
use crate::config::{CallConfig, MediaConstraints};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Opus läuft immer mit 48 kHz
const OPUS_CLOCK_RATE: u32 = 48000;
const VP8_CLOCK_RATE: u32 = 90000;
const STREAM_ID: &str = "consult-call";

fn webrtc_err(e: webrtc::Error) -> TransportError {
    TransportError::WebRTC(e.to_string())
}

// ============================================================================
// TRANSPORT
// ============================================================================

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    media: MediaConstraints,
    event_tx: broadcast::Sender<TransportEvent>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    /// Erstellt eine neue Peer Connection mit den konfigurierten ICE Servern
    pub async fn new(config: &CallConfig) -> Result<Arc<Self>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.rtc_ice_servers(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(webrtc_err)?,
        );

        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let transport = Arc::new(Self {
            pc,
            media: config.media,
            event_tx,
            closed: AtomicBool::new(false),
        });
        transport.setup_handlers();

        Ok(transport)
    }

    /// Registriert die Callbacks der Peer Connection
    fn setup_handlers(&self) {
        let event_tx = self.event_tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                tracing::debug!("Peer connection state: {:?}", state);
                let _ = event_tx.send(TransportEvent::ConnectionStateChanged(state));
                Box::pin(async {})
            }));

        // Lokale Candidates; `None` markiert das Ende des Sammelns
        let event_tx = self.event_tx.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => {
                            let _ = event_tx.send(TransportEvent::LocalCandidate {
                                init,
                                kind: c.typ,
                            });
                        }
                        Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                    }
                } else {
                    tracing::debug!("ICE gathering complete");
                }
                Box::pin(async {})
            }));

        let event_tx = self.event_tx.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let event_tx = event_tx.clone();
                Box::pin(async move {
                    tracing::info!("Received remote track: {:?}", track.codec());
                    let _ = event_tx.send(TransportEvent::RemoteTrack {
                        track_id: track.id(),
                        kind: track.kind().to_string(),
                    });
                })
            },
        ));
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn audio_track() -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            STREAM_ID.to_string(),
        ))
    }

    fn video_track() -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: VP8_CLOCK_RATE,
                ..Default::default()
            },
            "video".to_string(),
            STREAM_ID.to_string(),
        ))
    }

    async fn add_receive_only(&self, kind: RTPCodecType) -> Result<(), TransportError> {
        self.pc
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(webrtc_err)?;
        Ok(())
    }
}

#[async_trait]
impl TransportSession for WebRtcTransport {
    async fn acquire_local_media(&self) -> Result<LocalMedia, MediaError> {
        if !self.media.audio && !self.media.video {
            return Err(MediaError::NothingRequested);
        }

        let mut tracks = Vec::new();
        let mut device = None;
        let mut audio_error = None;

        if self.media.audio {
            let probe = tokio::task::spawn_blocking(probe_input_device)
                .await
                .map_err(|e| MediaError::Capture(e.to_string()))?;
            match probe {
                Ok(name) => {
                    device = name;
                    tracks.push(Self::audio_track());
                }
                Err(e) => {
                    tracing::warn!("Audio input unavailable: {}", e);
                    audio_error = Some(e);
                }
            }
        }
        if self.media.video {
            tracks.push(Self::video_track());
        }

        match (tracks.is_empty(), audio_error) {
            (true, Some(e)) => Err(e),
            (true, None) => Err(MediaError::NothingRequested),
            _ => Ok(LocalMedia::new(tracks, device)),
        }
    }

    async fn attach_tracks(&self, media: &LocalMedia) -> Result<(), TransportError> {
        self.ensure_open()?;

        if media.is_empty() {
            tracing::info!("No local media, negotiating receive-only");
            self.add_receive_only(RTPCodecType::Audio).await?;
            return self.add_receive_only(RTPCodecType::Video).await;
        }

        for track in media.tracks() {
            self.pc
                .add_track(Arc::clone(track))
                .await
                .map_err(webrtc_err)?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription, TransportError> {
        self.ensure_open()?;
        self.pc.create_offer(None).await.map_err(webrtc_err)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, TransportError> {
        self.ensure_open()?;
        self.pc.create_answer(None).await.map_err(webrtc_err)
    }

    async fn set_local_description(
        &self,
        desc: RTCSessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.pc.set_local_description(desc).await.map_err(webrtc_err)
    }

    async fn set_remote_description(
        &self,
        desc: RTCSessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.pc.set_remote_description(desc).await.map_err(webrtc_err)
    }

    async fn add_remote_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| TransportError::CandidateRejected(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!("Closing peer connection");
        self.pc.close().await.map_err(webrtc_err)
    }
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("state", &self.pc.connection_state())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// FACTORY
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcTransportFactory;

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        config: &CallConfig,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let transport = WebRtcTransport::new(config).await?;
        Ok(transport as Arc<dyn TransportSession>)
    }
}

// ============================================================================
// GERÄTE-CHECK
// ============================================================================

/// Prüft ob ein Mikrofon verfügbar ist und gibt dessen Namen zurück
#[cfg(feature = "capture")]
fn probe_input_device() -> Result<Option<String>, MediaError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MediaError::NoInputDevice)?;
    device
        .default_input_config()
        .map_err(|e| MediaError::Denied(e.to_string()))?;

    let name = device.name().ok();
    tracing::info!("Using input device: {:?}", name);
    Ok(name)
}

/// Ohne `capture` wird kein Gerät geprüft
#[cfg(not(feature = "capture"))]
fn probe_input_device() -> Result<Option<String>, MediaError> {
    Ok(None)
}
