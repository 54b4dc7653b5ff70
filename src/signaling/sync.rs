//! Signaling-Synchronisation über den geteilten Record
//!
//! Der Record liefert vollständige Snapshots, keine Nachrichten. Deshalb wird
//! jeder Snapshot idempotent abgeglichen:
//! - Remote Description höchstens einmal pro Versuch anwenden
//! - Candidates über ein lokales Seen-Set genau einmal anwenden
//! - Eigene Daten nur per Merge schreiben, nie ganze Listen überschreiben
//!
//! Ob etwas neu ist, entscheidet ausschließlich der lokale Zustand, nie das
//! Fehlen eines Feldes im Record.

use super::codec::{self, CodecError};
use super::presence::PresenceTracker;
use super::retry::with_backoff;
use super::role::{CalleeRole, CallerRole, NegotiationRole};
use crate::call_engine::{TransportError, TransportSession};
use crate::config::RetryPolicy;
use crate::record::{
    Candidate, RecordPatch, Role, SdpType, SessionRecord, SharedRecordStore, StoreError,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Signaling unavailable after {attempts} attempts: {last_error}")]
    SignalingUnavailable { attempts: u32, last_error: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Programmierfehler: zweites Offer/Answer im selben Versuch
    #[error("Duplicate {0} in the same attempt")]
    DuplicateApplyAttempt(&'static str),

    #[error("No remote offer observed yet")]
    OfferNotObserved,
}

// ============================================================================
// ATTEMPT STATE
// ============================================================================

/// Lokaler Zustand eines Versuchs
#[derive(Debug)]
struct AttemptState {
    /// Nach dem Teardown werden keine Daten mehr angewendet oder geschrieben
    active: bool,
    local_description_published: bool,
    /// Remote Description wurde beansprucht (Anwendung gestartet)
    remote_description_claimed: bool,
    /// Remote Description wurde erfolgreich angewendet
    remote_description_applied: bool,
    /// Alle bekannten Candidates beider Parteien
    seen_candidates: HashSet<Candidate>,
    applied_candidates: usize,
}

impl Default for AttemptState {
    fn default() -> Self {
        Self {
            active: true,
            local_description_published: false,
            remote_description_claimed: false,
            remote_description_applied: false,
            seen_candidates: HashSet::new(),
            applied_candidates: 0,
        }
    }
}

/// Ergebnis eines Snapshot-Abgleichs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub remote_online: bool,
    /// `Some` wenn sich das Presence-Flag der Gegenseite geändert hat
    pub remote_presence_changed: Option<bool>,
    pub description_applied: bool,
    pub candidates_applied: usize,
}

// ============================================================================
// SIGNALING SYNC
// ============================================================================

/// Signaling für einen Anruf-Versuch einer Rolle
///
/// `publish_local_offer` existiert nur für `SignalingSync<CallerRole>`,
/// `publish_local_answer` nur für `SignalingSync<CalleeRole>`.
pub struct SignalingSync<R: NegotiationRole> {
    session_id: String,
    attempt_id: Uuid,
    store: Arc<dyn SharedRecordStore>,
    transport: Arc<dyn TransportSession>,
    retry: RetryPolicy,
    presence: PresenceTracker,
    state: Mutex<AttemptState>,
    _role: PhantomData<R>,
}

impl<R: NegotiationRole> SignalingSync<R> {
    pub fn new(
        session_id: String,
        attempt_id: Uuid,
        store: Arc<dyn SharedRecordStore>,
        transport: Arc<dyn TransportSession>,
        retry: RetryPolicy,
    ) -> Self {
        let presence = PresenceTracker::new(
            session_id.clone(),
            R::ROLE,
            Arc::clone(&store),
            retry.clone(),
        );

        Self {
            session_id,
            attempt_id,
            store,
            transport,
            retry,
            presence,
            state: Mutex::new(AttemptState::default()),
            _role: PhantomData,
        }
    }

    pub fn role(&self) -> Role {
        R::ROLE
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Beendet den Versuch; spätere Lieferungen und Schreibvorgänge sind No-ops
    pub fn deactivate(&self) {
        self.state.lock().active = false;
        self.presence.deactivate();
    }

    pub fn remote_description_applied(&self) -> bool {
        self.state.lock().remote_description_applied
    }

    /// Alle bekannten Candidates (eigene und fremde)
    pub fn known_candidates(&self) -> HashSet<Candidate> {
        self.state.lock().seen_candidates.clone()
    }

    /// Anzahl der an den Transport übergebenen Remote Candidates
    pub fn applied_candidate_count(&self) -> usize {
        self.state.lock().applied_candidates
    }

    /// Startet die rollenabhängige Verhandlung (Medien sind angehängt)
    pub async fn begin_negotiation(&self) -> Result<(), SignalingError> {
        R::begin_negotiation(self).await
    }

    /// Hängt einen lokalen Candidate an die geteilte Liste an
    ///
    /// Gibt `false` zurück, wenn nichts geschrieben wurde (bereits bekannt
    /// oder Versuch beendet).
    pub async fn publish_local_candidate(
        &self,
        init: &RTCIceCandidateInit,
        kind: RTCIceCandidateType,
    ) -> Result<bool, SignalingError> {
        let candidate = codec::encode_candidate(init, kind)?;

        {
            let mut state = self.state.lock();
            if !state.active {
                return Ok(false);
            }
            if !state.seen_candidates.insert(candidate.clone()) {
                return Ok(false);
            }
        }

        tracing::debug!(
            attempt = %self.attempt_id,
            "Publishing local {} candidate",
            candidate.kind
        );
        self.write("candidate", RecordPatch::new().append_candidates(vec![candidate]))
            .await?;
        Ok(true)
    }

    /// Gleicht einen vollständigen Record-Snapshot ab
    ///
    /// Mehrfache oder umsortierte Lieferungen desselben Inhalts führen zu
    /// keinen weiteren Transport-Aufrufen.
    pub async fn on_record_changed(
        &self,
        record: &SessionRecord,
    ) -> Result<ReconcileOutcome, SignalingError> {
        let mut outcome = ReconcileOutcome {
            remote_online: self.presence.observe_remote_presence(record),
            remote_presence_changed: self.presence.track_remote_presence(record),
            ..Default::default()
        };

        if !self.is_active() {
            return Ok(outcome);
        }

        outcome.description_applied = R::reconcile_description(self, record).await?;
        outcome.candidates_applied = self.apply_remote_candidates(record).await;
        Ok(outcome)
    }

    // ========================================================================
    // ROLLEN-HELFER
    // ========================================================================

    pub(super) fn transport(&self) -> &Arc<dyn TransportSession> {
        &self.transport
    }

    /// Beansprucht die Remote Description; `false` wenn schon geschehen
    pub(super) fn claim_remote_description(&self) -> bool {
        let mut state = self.state.lock();
        if !state.active || state.remote_description_claimed {
            return false;
        }
        state.remote_description_claimed = true;
        true
    }

    pub(super) fn mark_remote_description_applied(&self) {
        self.state.lock().remote_description_applied = true;
    }

    /// Gibt den Anspruch nach einem fehlgeschlagenen Anwenden wieder frei
    pub(super) fn release_remote_description(&self) {
        let mut state = self.state.lock();
        if !state.remote_description_applied {
            state.remote_description_claimed = false;
        }
    }

    pub(super) fn local_description_published(&self) -> bool {
        self.state.lock().local_description_published
    }

    /// Beansprucht die lokale Description für diesen Versuch
    fn claim_local_description(&self, field: &'static str) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        if state.local_description_published {
            tracing::error!(
                attempt = %self.attempt_id,
                "Refusing to publish a second {} in the same attempt",
                field
            );
            return Err(SignalingError::DuplicateApplyAttempt(field));
        }
        state.local_description_published = true;
        Ok(())
    }

    /// Schreibt nur, solange der Versuch aktiv ist
    async fn write(&self, what: &'static str, patch: RecordPatch) -> Result<(), SignalingError> {
        if !self.is_active() {
            tracing::debug!("Dropping '{}' write after teardown", what);
            return Ok(());
        }

        let store = Arc::clone(&self.store);
        let session_id = self.session_id.clone();
        with_backoff(&self.retry, what, move || {
            let store = Arc::clone(&store);
            let session_id = session_id.clone();
            let patch = patch.clone();
            async move { store.patch(&session_id, patch).await }
        })
        .await
    }

    /// Wendet alle noch unbekannten Candidates an
    ///
    /// Erst nach der Remote Description; bis dahin bleiben sie im Snapshot
    /// und werden mit einer späteren Lieferung übernommen.
    async fn apply_remote_candidates(&self, record: &SessionRecord) -> usize {
        let fresh: Vec<Candidate> = {
            let mut state = self.state.lock();
            if !state.active || !state.remote_description_applied {
                return 0;
            }
            record
                .ice_candidates
                .iter()
                .filter(|c| state.seen_candidates.insert((*c).clone()))
                .cloned()
                .collect()
        };

        let mut applied = 0;
        for candidate in fresh {
            let init = match codec::decode_candidate(&candidate) {
                Ok(init) => init,
                Err(e) => {
                    tracing::warn!(attempt = %self.attempt_id, "Ignoring remote candidate: {}", e);
                    continue;
                }
            };

            match self.transport.add_remote_candidate(init).await {
                Ok(()) => {
                    tracing::debug!(
                        attempt = %self.attempt_id,
                        "Applied remote candidate {}",
                        candidate.candidate_string
                    );
                    applied += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = %self.attempt_id,
                        "Remote candidate not accepted, ignoring: {}",
                        e
                    );
                }
            }
        }

        self.state.lock().applied_candidates += applied;
        applied
    }
}

// ============================================================================
// CALLER
// ============================================================================

impl SignalingSync<CallerRole> {
    /// Schreibt das Offer (genau einmal pro Versuch)
    pub async fn publish_local_offer(
        &self,
        desc: &RTCSessionDescription,
    ) -> Result<(), SignalingError> {
        let offer = codec::encode_description(desc)?;
        if offer.sdp_type != SdpType::Offer {
            return Err(CodecError::UnsupportedSdpType(desc.sdp_type.to_string()).into());
        }
        self.claim_local_description("offer")?;

        tracing::info!(attempt = %self.attempt_id, "Publishing offer for session {}", self.session_id);
        self.write("offer", RecordPatch::new().offer(offer)).await
    }
}

// ============================================================================
// CALLEE
// ============================================================================

impl SignalingSync<CalleeRole> {
    /// Schreibt das Answer (erst nach einem angewendeten Offer)
    pub async fn publish_local_answer(
        &self,
        desc: &RTCSessionDescription,
    ) -> Result<(), SignalingError> {
        let answer = codec::encode_description(desc)?;
        if answer.sdp_type != SdpType::Answer {
            return Err(CodecError::UnsupportedSdpType(desc.sdp_type.to_string()).into());
        }
        if !self.remote_description_applied() {
            return Err(SignalingError::OfferNotObserved);
        }
        self.claim_local_description("answer")?;

        tracing::info!(attempt = %self.attempt_id, "Publishing answer for session {}", self.session_id);
        self.write("answer", RecordPatch::new().answer(answer)).await
    }
}

impl<R: NegotiationRole> std::fmt::Debug for SignalingSync<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingSync")
            .field("session_id", &self.session_id)
            .field("role", &R::ROLE)
            .field("attempt_id", &self.attempt_id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{MemoryRecordStore, SessionDescription, SessionStatus};
    use crate::testing::{candidate, fast_config, native_candidate, MockTransport, TransportCall};

    struct Fixture {
        store: Arc<MemoryRecordStore>,
        transport: Arc<MockTransport>,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            let store = Arc::new(MemoryRecordStore::new());
            let mut record = SessionRecord::booked();
            record.status = SessionStatus::InCall;
            store.insert("s1", record);
            Self {
                store,
                transport: MockTransport::new(name),
            }
        }

        fn sync<R: NegotiationRole>(&self) -> SignalingSync<R> {
            SignalingSync::new(
                "s1".to_string(),
                Uuid::new_v4(),
                Arc::clone(&self.store) as Arc<dyn SharedRecordStore>,
                Arc::clone(&self.transport) as Arc<dyn TransportSession>,
                fast_config().retry,
            )
        }

        fn record(&self) -> SessionRecord {
            self.store.snapshot("s1").unwrap()
        }
    }

    fn offer_record() -> SessionRecord {
        let mut record = SessionRecord::booked();
        record.status = SessionStatus::InCall;
        record.offer = Some(SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: "v=0 remote-offer".to_string(),
        });
        record
    }

    #[tokio::test]
    async fn test_caller_publishes_offer_once() {
        let fx = Fixture::new("caller");
        let sync: SignalingSync<CallerRole> = fx.sync();

        sync.begin_negotiation().await.unwrap();
        let offer = fx.record().offer.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);

        let again = fx.transport.offer_description();
        assert_eq!(
            sync.publish_local_offer(&again).await,
            Err(SignalingError::DuplicateApplyAttempt("offer"))
        );
        assert_eq!(fx.transport.count(|c| matches!(c, TransportCall::CreateOffer)), 1);
    }

    #[tokio::test]
    async fn test_callee_cannot_answer_before_offer() {
        let fx = Fixture::new("callee");
        let sync: SignalingSync<CalleeRole> = fx.sync();

        let answer = fx.transport.answer_description();
        assert_eq!(
            sync.publish_local_answer(&answer).await,
            Err(SignalingError::OfferNotObserved)
        );
        assert!(fx.record().answer.is_none());
    }

    #[tokio::test]
    async fn test_callee_applies_offer_exactly_once_and_answers() {
        let fx = Fixture::new("callee");
        let sync: SignalingSync<CalleeRole> = fx.sync();
        let record = offer_record();

        let first = sync.on_record_changed(&record).await.unwrap();
        assert!(first.description_applied);
        for _ in 0..3 {
            let again = sync.on_record_changed(&record).await.unwrap();
            assert!(!again.description_applied);
        }

        assert_eq!(fx.transport.remote_descriptions(), vec!["v=0 remote-offer".to_string()]);
        assert_eq!(fx.transport.count(|c| matches!(c, TransportCall::CreateAnswer)), 1);
        assert_eq!(fx.record().answer.unwrap().sdp_type, SdpType::Answer);
    }

    #[tokio::test]
    async fn test_failed_offer_apply_is_retried_on_redelivery() {
        let fx = Fixture::new("callee");
        let sync: SignalingSync<CalleeRole> = fx.sync();
        let record = offer_record();
        fx.transport.fail_next_remote_descriptions(1);

        let first = sync.on_record_changed(&record).await;
        assert!(matches!(first, Err(SignalingError::Transport(_))));
        assert!(!sync.remote_description_applied());
        assert!(fx.record().answer.is_none());

        let again = sync.on_record_changed(&record).await.unwrap();
        assert!(again.description_applied);
        assert_eq!(fx.transport.remote_descriptions().len(), 1);
        assert_eq!(fx.transport.count(|c| matches!(c, TransportCall::CreateAnswer)), 1);
        assert_eq!(fx.record().answer.unwrap().sdp_type, SdpType::Answer);
    }

    #[tokio::test]
    async fn test_failed_answer_apply_is_retried_on_redelivery() {
        let fx = Fixture::new("caller");
        let sync: SignalingSync<CallerRole> = fx.sync();
        let mut record = offer_record();
        record.answer = Some(SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: "v=0 remote-answer".to_string(),
        });
        fx.transport.fail_next_remote_descriptions(1);

        assert!(sync.on_record_changed(&record).await.is_err());
        assert!(sync.on_record_changed(&record).await.unwrap().description_applied);
        assert!(!sync.on_record_changed(&record).await.unwrap().description_applied);
        assert_eq!(fx.transport.remote_descriptions(), vec!["v=0 remote-answer".to_string()]);
    }

    #[tokio::test]
    async fn test_caller_ignores_offer_field_and_applies_answer_once() {
        let fx = Fixture::new("caller");
        let sync: SignalingSync<CallerRole> = fx.sync();

        let mut record = offer_record();
        let outcome = sync.on_record_changed(&record).await.unwrap();
        assert!(!outcome.description_applied);
        assert!(fx.transport.remote_descriptions().is_empty());

        record.answer = Some(SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: "v=0 remote-answer".to_string(),
        });
        assert!(sync.on_record_changed(&record).await.unwrap().description_applied);
        assert!(!sync.on_record_changed(&record).await.unwrap().description_applied);
        assert_eq!(fx.transport.remote_descriptions(), vec!["v=0 remote-answer".to_string()]);
    }

    #[tokio::test]
    async fn test_cleared_fields_do_not_undo_applied_state() {
        let fx = Fixture::new("callee");
        let sync: SignalingSync<CalleeRole> = fx.sync();

        let mut record = offer_record();
        record.ice_candidates.push(candidate("10.0.0.1"));
        sync.on_record_changed(&record).await.unwrap();

        // Ältere Lieferung ohne Verhandlungsdaten, danach wieder die neue
        let stale = SessionRecord::booked();
        sync.on_record_changed(&stale).await.unwrap();
        let outcome = sync.on_record_changed(&record).await.unwrap();

        assert!(!outcome.description_applied);
        assert_eq!(outcome.candidates_applied, 0);
        assert_eq!(fx.transport.remote_descriptions().len(), 1);
        assert_eq!(fx.transport.applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_candidates_wait_for_remote_description() {
        let fx = Fixture::new("caller");
        let sync: SignalingSync<CallerRole> = fx.sync();

        let mut record = offer_record();
        record.ice_candidates.push(candidate("10.0.0.2"));
        let early = sync.on_record_changed(&record).await.unwrap();
        assert_eq!(early.candidates_applied, 0);

        record.answer = Some(SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: "v=0 remote-answer".to_string(),
        });
        let later = sync.on_record_changed(&record).await.unwrap();
        assert_eq!(later.candidates_applied, 1);
        assert_eq!(fx.transport.applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_and_rejected_candidates_are_tolerated() {
        let fx = Fixture::new("callee");
        let sync: SignalingSync<CalleeRole> = fx.sync();

        let mut record = offer_record();
        let mut malformed = candidate("10.0.0.3");
        malformed.candidate_string = "not a candidate".to_string();
        let rejected = candidate("10.0.0.4");
        fx.transport.reject_candidate(&rejected.candidate_string);
        record.ice_candidates = vec![malformed, rejected, candidate("10.0.0.5")];

        let outcome = sync.on_record_changed(&record).await.unwrap();
        assert_eq!(outcome.candidates_applied, 1);

        // Auch bei erneuter Lieferung kein zweiter Versuch
        let again = sync.on_record_changed(&record).await.unwrap();
        assert_eq!(again.candidates_applied, 0);
        assert_eq!(sync.applied_candidate_count(), 1);
    }

    #[tokio::test]
    async fn test_local_candidates_merge_with_concurrent_peer_appends() {
        let fx = Fixture::new("caller");
        let sync: SignalingSync<CallerRole> = fx.sync();

        fx.store
            .patch(
                "s1",
                RecordPatch::new().append_candidates(vec![candidate("10.0.1.1")]),
            )
            .await
            .unwrap();

        let (init, kind) = native_candidate("10.0.0.9");
        assert!(sync.publish_local_candidate(&init, kind).await.unwrap());
        // Doppelt gemeldet: kein zweiter Schreibvorgang
        assert!(!sync.publish_local_candidate(&init, kind).await.unwrap());

        let record = fx.record();
        assert_eq!(record.ice_candidates.len(), 2);
        assert!(record.ice_candidates.contains(&candidate("10.0.1.1")));
    }

    #[tokio::test]
    async fn test_own_candidates_are_not_fed_back() {
        let fx = Fixture::new("callee");
        let sync: SignalingSync<CalleeRole> = fx.sync();

        let (init, kind) = native_candidate("10.0.0.7");
        sync.publish_local_candidate(&init, kind).await.unwrap();

        let mut record = fx.record();
        record.offer = offer_record().offer;
        let outcome = sync.on_record_changed(&record).await.unwrap();

        assert_eq!(outcome.candidates_applied, 0);
        assert!(fx.transport.applied_candidates().is_empty());
        assert_eq!(sync.known_candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_applied_after_deactivate() {
        let fx = Fixture::new("callee");
        let sync: SignalingSync<CalleeRole> = fx.sync();
        sync.deactivate();

        let mut record = offer_record();
        record.ice_candidates.push(candidate("10.0.0.8"));
        let outcome = sync.on_record_changed(&record).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome {
            remote_online: false,
            remote_presence_changed: Some(false),
            description_applied: false,
            candidates_applied: 0,
        });
        assert!(fx.transport.calls().is_empty());

        let (init, kind) = native_candidate("10.0.0.6");
        assert!(!sync.publish_local_candidate(&init, kind).await.unwrap());
        assert!(fx.record().ice_candidates.is_empty());
    }

    #[tokio::test]
    async fn test_offer_write_exhausts_retries() {
        let fx = Fixture::new("caller");
        let sync: SignalingSync<CallerRole> = fx.sync();
        fx.store.fail_next_writes(100);

        let result = sync.begin_negotiation().await;
        assert!(matches!(
            result,
            Err(SignalingError::SignalingUnavailable { attempts: 3, .. })
        ));
        assert!(fx.record().offer.is_none());
    }
}
