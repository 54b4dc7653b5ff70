//! Test-Hilfen: Mock-Transport und gemeinsame Fixtures

use crate::call_engine::{
    CallEvent, LocalMedia, MediaError, TransportError, TransportEvent, TransportFactory,
    TransportSession,
};
use crate::config::{CallConfig, RetryPolicy};
use crate::record::{Candidate, MemoryRecordStore, SessionRecord};
use crate::signaling::codec;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// FIXTURES
// ============================================================================

/// Konfiguration mit kurzen Backoffs und ohne ICE Server
pub fn fast_config() -> CallConfig {
    CallConfig {
        ice_servers: Vec::new(),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        },
        ..CallConfig::default()
    }
}

/// Host-Candidate wie ihn webrtc-rs meldet
pub fn native_candidate(ip: &str) -> (RTCIceCandidateInit, RTCIceCandidateType) {
    let init = RTCIceCandidateInit {
        candidate: format!("candidate:1 1 udp 2130706431 {} 50000 typ host", ip),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    };
    (init, RTCIceCandidateType::Host)
}

/// Derselbe Candidate im Record-Format
pub fn candidate(ip: &str) -> Candidate {
    let (init, kind) = native_candidate(ip);
    codec::encode_candidate(&init, kind).unwrap()
}

fn description(sdp_type: RTCSdpType, sdp: String) -> RTCSessionDescription {
    let mut desc = RTCSessionDescription::default();
    desc.sdp_type = sdp_type;
    desc.sdp = sdp;
    desc
}

/// Wartet auf ein passendes Engine-Event
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<CallEvent>, mut pred: F) -> CallEvent
where
    F: FnMut(&CallEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for call event")
}

/// Wartet bis der Record die Bedingung erfüllt
pub async fn wait_for_record<F>(store: &MemoryRecordStore, session_id: &str, mut pred: F) -> SessionRecord
where
    F: FnMut(&SessionRecord) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(record) = store.snapshot(session_id) {
                if pred(&record) {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("timed out waiting for record")
}

/// Wartet bis die Bedingung erfüllt ist
pub async fn wait_until<F>(mut pred: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("timed out waiting for condition")
}

// ============================================================================
// MOCK TRANSPORT
// ============================================================================

/// Aufgezeichneter Aufruf an den Transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    AcquireMedia,
    AttachTracks(usize),
    CreateOffer,
    CreateAnswer,
    SetLocal(String),
    SetRemote(String),
    AddCandidate(String),
    Close,
}

/// Transport ohne Netzwerk
///
/// Verhält sich wie eine Peer Connection: nach der lokalen Description
/// wird der eigene Host-Candidate gemeldet, sobald beide Descriptions
/// gesetzt sind ein Remote-Track.
pub struct MockTransport {
    name: String,
    host: Option<String>,
    media_error: Option<MediaError>,
    calls: Mutex<Vec<TransportCall>>,
    rejected: Mutex<HashSet<String>>,
    failing_remote: AtomicUsize,
    close_delay: Mutex<Duration>,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    closed: AtomicBool,
    event_tx: broadcast::Sender<TransportEvent>,
}

impl MockTransport {
    pub fn new(name: &str) -> Arc<Self> {
        Self::build(name, None, None)
    }

    /// Meldet nach der lokalen Description einen Host-Candidate mit `ip`
    pub fn with_host(name: &str, ip: &str) -> Arc<Self> {
        Self::build(name, Some(ip.to_string()), None)
    }

    /// Lokale Medien schlagen mit `error` fehl
    pub fn failing_media(name: &str, error: MediaError) -> Arc<Self> {
        Self::build(name, None, Some(error))
    }

    fn build(name: &str, host: Option<String>, media_error: Option<MediaError>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            name: name.to_string(),
            host,
            media_error,
            calls: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
            failing_remote: AtomicUsize::new(0),
            close_delay: Mutex::new(Duration::ZERO),
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            event_tx,
        })
    }

    pub fn offer_description(&self) -> RTCSessionDescription {
        description(RTCSdpType::Offer, format!("v=0 offer-from-{}", self.name))
    }

    pub fn answer_description(&self) -> RTCSessionDescription {
        description(RTCSdpType::Answer, format!("v=0 answer-from-{}", self.name))
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub fn count<F: Fn(&TransportCall) -> bool>(&self, pred: F) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    /// SDPs aller gesetzten Remote Descriptions
    pub fn remote_descriptions(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                TransportCall::SetRemote(sdp) => Some(sdp.clone()),
                _ => None,
            })
            .collect()
    }

    /// Akzeptierte Remote Candidates
    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                TransportCall::AddCandidate(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Candidate mit diesem String wird abgelehnt
    pub fn reject_candidate(&self, candidate_string: &str) {
        self.rejected.lock().insert(candidate_string.to_string());
    }

    /// Die nächsten `count` Remote Descriptions scheitern ohne Wirkung
    pub fn fail_next_remote_descriptions(&self, count: usize) {
        self.failing_remote.store(count, Ordering::SeqCst);
    }

    /// `close()` braucht so lange bis der Transport zu ist
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock() = delay;
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Meldet einen lokalen Host-Candidate
    pub fn gather(&self, ip: &str) {
        let (init, kind) = native_candidate(ip);
        self.emit(TransportEvent::LocalCandidate { init, kind });
    }

    pub fn deliver_remote_track(&self) {
        self.emit(TransportEvent::RemoteTrack {
            track_id: format!("{}-remote", self.name),
            kind: "audio".to_string(),
        });
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn maybe_connected(&self) {
        if self.local_set.load(Ordering::SeqCst) && self.remote_set.load(Ordering::SeqCst) {
            self.deliver_remote_track();
        }
    }
}

#[async_trait]
impl TransportSession for MockTransport {
    async fn acquire_local_media(&self) -> Result<LocalMedia, MediaError> {
        self.record(TransportCall::AcquireMedia);
        if let Some(error) = &self.media_error {
            return Err(error.clone());
        }
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            self.name.clone(),
        ));
        Ok(LocalMedia::new(vec![track], Some(format!("{}-mic", self.name))))
    }

    async fn attach_tracks(&self, media: &LocalMedia) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.record(TransportCall::AttachTracks(media.tracks().len()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription, TransportError> {
        self.ensure_open()?;
        self.record(TransportCall::CreateOffer);
        Ok(self.offer_description())
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, TransportError> {
        self.ensure_open()?;
        self.record(TransportCall::CreateAnswer);
        Ok(self.answer_description())
    }

    async fn set_local_description(
        &self,
        desc: RTCSessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.record(TransportCall::SetLocal(desc.sdp));
        self.local_set.store(true, Ordering::SeqCst);
        if let Some(ip) = &self.host {
            self.gather(ip);
        }
        self.maybe_connected();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: RTCSessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let injected = self
            .failing_remote
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::WebRTC("transient failure".to_string()));
        }
        self.record(TransportCall::SetRemote(desc.sdp));
        self.remote_set.store(true, Ordering::SeqCst);
        self.maybe_connected();
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.rejected.lock().contains(&candidate.candidate) {
            return Err(TransportError::CandidateRejected(candidate.candidate));
        }
        self.record(TransportCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let delay = *self.close_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record(TransportCall::Close);
        }
        Ok(())
    }
}

// ============================================================================
// MOCK FACTORY
// ============================================================================

/// Erstellt MockTransports und merkt sich alle erzeugten
pub struct MockFactory {
    name: String,
    host: Option<String>,
    media_error: Option<MediaError>,
    fail_create: AtomicBool,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn new(name: &str, host: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            host: host.map(str::to_string),
            media_error: None,
            fail_create: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn failing_media(name: &str, error: MediaError) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            host: None,
            media_error: Some(error),
            fail_create: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        _config: &CallConfig,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::WebRTC("peer connection refused".to_string()));
        }
        let transport = MockTransport::build(&self.name, self.host.clone(), self.media_error.clone());
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport as Arc<dyn TransportSession>)
    }
}
