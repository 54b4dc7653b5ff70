//! Call Engine
//!
//! Steuert einen Anruf-Versuch einer Rolle: lokale Medien anfordern,
//! rollenabhängiges Signaling starten, Snapshots und Transport-Events
//! abarbeiten und beim Ende alles wieder abbauen.
//!
//! Beide Event-Quellen (Record-Feed und Transport) werden in einem einzigen
//! Task nacheinander verarbeitet. Der Teardown läuft in einem eigenen Task
//! und wird nie abgebrochen.

use super::state::{CallPhase, CallStateMachine};
use super::transport::{LocalMedia, TransportError, TransportEvent, TransportSession};
use crate::config::{CallConfig, RetryPolicy};
use crate::record::{
    RecordFeed, RecordPatch, SessionRecord, SessionStatus, SharedRecordStore, StoreError,
};
use crate::signaling::{with_backoff, NegotiationRole, SignalingError, SignalingSync};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallEngineError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Record subscription lost: {0}")]
    SubscriptionLost(StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Teardown task failed: {0}")]
    TeardownFailed(String),
}

// ============================================================================
// STATUS & EVENTS
// ============================================================================

/// Status für die UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Connecting,
    WaitingForPeer,
    Connected,
    MediaUnavailable,
    SignalingUnavailable,
    ConnectionLost,
    Ended,
}

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    PhaseChanged(CallPhase),
    Status(CallStatus),
    RemotePresence(bool),
    Error(String),
}

/// Warum ein Anruf endet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Lokal aufgelegt; setzt den Record zurück
    LocalHangup,
    /// Gegenseite hat aufgelegt (Record zurückgesetzt)
    RemoteEnded,
    /// Record-Feed abgebrochen
    SubscriptionLost,
}

// ============================================================================
// CALL ENGINE
// ============================================================================

pub struct CallEngine<R: NegotiationRole> {
    session_id: String,
    attempt_id: Uuid,
    store: Arc<dyn SharedRecordStore>,
    transport: Arc<dyn TransportSession>,
    sync: SignalingSync<R>,
    retry: RetryPolicy,
    machine: Mutex<CallStateMachine>,
    media: Mutex<Option<LocalMedia>>,
    /// `in_call` wurde in diesem Versuch schon gesehen
    seen_in_call: AtomicBool,
    event_tx: broadcast::Sender<CallEvent>,
    shutdown_tx: watch::Sender<bool>,
    /// Wird `true`, sobald der Teardown vollständig durchgelaufen ist
    ended_tx: watch::Sender<bool>,
}

impl<R: NegotiationRole> CallEngine<R> {
    /// Erstellt eine Engine für einen neuen Versuch
    pub fn new(
        session_id: String,
        store: Arc<dyn SharedRecordStore>,
        transport: Arc<dyn TransportSession>,
        config: &CallConfig,
    ) -> Arc<Self> {
        let attempt_id = Uuid::new_v4();
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        let (ended_tx, _) = watch::channel(false);
        let sync = SignalingSync::new(
            session_id.clone(),
            attempt_id,
            Arc::clone(&store),
            Arc::clone(&transport),
            config.retry.clone(),
        );

        Arc::new(Self {
            session_id,
            attempt_id,
            store,
            transport,
            sync,
            retry: config.retry.clone(),
            machine: Mutex::new(CallStateMachine::new()),
            media: Mutex::new(None),
            seen_in_call: AtomicBool::new(false),
            event_tx,
            shutdown_tx,
            ended_tx,
        })
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub fn phase(&self) -> CallPhase {
        self.machine.lock().phase()
    }

    pub fn is_degraded(&self) -> bool {
        self.machine.lock().is_degraded()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    pub fn sync(&self) -> &SignalingSync<R> {
        &self.sync
    }

    /// Startet den Anruf
    ///
    /// Markiert den Record als `in_call`, abonniert ihn und startet den
    /// Event-Task. Medien werden im Task angefordert.
    pub async fn start(self: &Arc<Self>) -> Result<(), CallEngineError> {
        self.machine
            .lock()
            .start()
            .map_err(|_| CallEngineError::AlreadyInCall)?;

        tracing::info!(
            attempt = %self.attempt_id,
            "Starting call for session {} as {}",
            self.session_id,
            R::ROLE
        );
        self.emit(CallEvent::PhaseChanged(CallPhase::AcquiringMedia));
        self.emit(CallEvent::Status(CallStatus::Connecting));

        // Transport-Events vor dem Anfordern der Medien abonnieren
        let transport_rx = self.transport.subscribe();
        let shutdown_rx = self.shutdown_tx.subscribe();

        let feed = match self.open_session().await {
            Ok(feed) => feed,
            Err(e) => {
                tracing::error!(attempt = %self.attempt_id, "Failed to open session: {}", e);
                self.machine.lock().end();
                self.sync.deactivate();
                let _ = self.transport.close().await;
                self.emit(CallEvent::PhaseChanged(CallPhase::Ended));
                self.emit(CallEvent::Status(match e {
                    CallEngineError::SubscriptionLost(_) => CallStatus::ConnectionLost,
                    _ => CallStatus::SignalingUnavailable,
                }));
                self.ended_tx.send_replace(true);
                return Err(e);
            }
        };

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run(feed, transport_rx, shutdown_rx).await;
        });

        Ok(())
    }

    /// Beendet den Anruf lokal und setzt den Record zurück
    ///
    /// Kehrt erst zurück, wenn der Abbau fertig ist, auch wenn er schon
    /// vom Event-Loop begonnen wurde. Wird der Aufrufer abgebrochen, läuft
    /// der Abbau trotzdem zu Ende.
    pub async fn end(self: &Arc<Self>) -> Result<(), CallEngineError> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.teardown(EndReason::LocalHangup).await })
            .await
            .map_err(|e| CallEngineError::TeardownFailed(e.to_string()))?
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Setzt `in_call` und abonniert den Record
    async fn open_session(&self) -> Result<RecordFeed, CallEngineError> {
        let store = Arc::clone(&self.store);
        let session_id = self.session_id.clone();
        with_backoff(&self.retry, "status", move || {
            let store = Arc::clone(&store);
            let session_id = session_id.clone();
            async move {
                store
                    .patch(&session_id, RecordPatch::new().status(SessionStatus::InCall))
                    .await
            }
        })
        .await?;

        self.store
            .subscribe(&self.session_id)
            .await
            .map_err(CallEngineError::SubscriptionLost)
    }

    /// Event-Loop des Versuchs
    async fn run(
        self: Arc<Self>,
        mut feed: RecordFeed,
        mut transport_rx: broadcast::Receiver<TransportEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        if !self.acquire_and_attach().await {
            return;
        }

        let mut transport_open = true;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,

                delivery = feed.next() => match delivery {
                    Some(Ok(record)) => {
                        if !self.handle_record(record).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(attempt = %self.attempt_id, "Record feed failed: {}", e);
                        self.end_internally(EndReason::SubscriptionLost).await;
                        break;
                    }
                    None => {
                        tracing::error!(attempt = %self.attempt_id, "Record feed closed unexpectedly");
                        self.end_internally(EndReason::SubscriptionLost).await;
                        break;
                    }
                },

                event = transport_rx.recv(), if transport_open => match event {
                    Ok(event) => self.handle_transport_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Transport event receiver lagged, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => transport_open = false,
                },
            }
        }

        tracing::debug!(attempt = %self.attempt_id, "Call event loop finished");
    }

    /// AcquiringMedia → Negotiating inklusive Presence und Signaling-Start
    ///
    /// Gibt `false` zurück, wenn der Anruf währenddessen beendet wurde.
    async fn acquire_and_attach(&self) -> bool {
        let media = match self.transport.acquire_local_media().await {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!(
                    attempt = %self.attempt_id,
                    "Local media unavailable, continuing receive-only: {}",
                    e
                );
                self.emit(CallEvent::Status(CallStatus::MediaUnavailable));
                LocalMedia::none()
            }
        };

        if let Err(e) = self.transport.attach_tracks(&media).await {
            tracing::error!(attempt = %self.attempt_id, "Failed to attach tracks: {}", e);
            self.emit(CallEvent::Error(e.to_string()));
        }

        let degraded = media.is_empty();
        {
            let mut machine = self.machine.lock();
            if machine.media_attached(degraded).is_err() {
                drop(machine);
                media.release();
                return false;
            }
            *self.media.lock() = Some(media);
        }
        self.emit(CallEvent::PhaseChanged(CallPhase::Negotiating));

        if let Err(e) = self.sync.presence().set_local_presence(true).await {
            self.report_signaling_error(e);
        }
        if let Err(e) = self.sync.begin_negotiation().await {
            self.report_signaling_error(e);
        }

        if self.phase() == CallPhase::Negotiating {
            let status = if self.sync.presence().remote_online() {
                CallStatus::Connecting
            } else {
                CallStatus::WaitingForPeer
            };
            self.emit(CallEvent::Status(status));
        }
        true
    }

    /// Verarbeitet einen Snapshot; `false` beendet den Event-Loop
    async fn handle_record(&self, record: SessionRecord) -> bool {
        if record.status == SessionStatus::InCall {
            self.seen_in_call.store(true, Ordering::SeqCst);
        } else if self.seen_in_call.load(Ordering::SeqCst) && Self::remote_ended(&record) {
            tracing::info!(
                attempt = %self.attempt_id,
                "Session {} was reset by the peer ({:?}), ending",
                self.session_id,
                record.status
            );
            self.end_internally(EndReason::RemoteEnded).await;
            return false;
        }

        let allowed = self.machine.lock().allows_signaling();
        if !allowed {
            return true;
        }

        match self.sync.on_record_changed(&record).await {
            Ok(outcome) => {
                if let Some(online) = outcome.remote_presence_changed {
                    tracing::info!(attempt = %self.attempt_id, "Peer presence: {}", online);
                    self.emit(CallEvent::RemotePresence(online));
                    if self.phase() == CallPhase::Negotiating {
                        self.emit(CallEvent::Status(if online {
                            CallStatus::Connecting
                        } else {
                            CallStatus::WaitingForPeer
                        }));
                    }
                }
            }
            Err(e) => self.report_signaling_error(e),
        }
        true
    }

    /// Hat die Gegenseite den Record nach einem `in_call` zurückgesetzt?
    ///
    /// `completed` allein beendet nichts: Notizen dürfen während des
    /// Gesprächs gespeichert werden. Erst ein `completed` ohne
    /// Verhandlungsdaten und ohne Presence ist ein Auflegen.
    fn remote_ended(record: &SessionRecord) -> bool {
        match record.status {
            SessionStatus::InCall => false,
            SessionStatus::Booked => true,
            SessionStatus::Completed => {
                !record.has_negotiation_data() && !record.caller_online && !record.callee_online
            }
        }
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate { init, kind } => {
                let allowed = self.machine.lock().allows_signaling();
                if !allowed {
                    tracing::debug!("Dropping local candidate outside negotiation");
                    return;
                }
                if let Err(e) = self.sync.publish_local_candidate(&init, kind).await {
                    self.report_signaling_error(e);
                }
            }

            TransportEvent::RemoteTrack { track_id, kind } => {
                let connected = self.machine.lock().remote_media_observed();
                if connected {
                    tracing::info!(
                        attempt = %self.attempt_id,
                        "Remote {} track {} received, call connected",
                        kind,
                        track_id
                    );
                    self.emit(CallEvent::PhaseChanged(CallPhase::Connected));
                    self.emit(CallEvent::Status(CallStatus::Connected));
                }
            }

            TransportEvent::ConnectionStateChanged(state) => {
                tracing::info!(attempt = %self.attempt_id, "Peer connection state: {:?}", state);
                if state == RTCPeerConnectionState::Failed {
                    self.emit(CallEvent::Error("Peer connection failed".to_string()));
                }
            }
        }
    }

    /// Abbau aus dem Event-Loop heraus
    async fn end_internally(&self, reason: EndReason) {
        if let Err(e) = self.teardown(reason).await {
            tracing::warn!(attempt = %self.attempt_id, "Teardown incomplete: {}", e);
        }
    }

    /// Any → Ended
    ///
    /// Medien und Transport werden immer freigegeben, die Presence wird auch
    /// dann zurückgesetzt, wenn das Schließen fehlschlägt.
    async fn teardown(&self, reason: EndReason) -> Result<(), CallEngineError> {
        let first = self.machine.lock().end();
        if !first {
            // Läuft bereits woanders; auf dessen Ende warten
            let mut ended_rx = self.ended_tx.subscribe();
            if ended_rx.wait_for(|done| *done).await.is_err() {
                tracing::warn!(attempt = %self.attempt_id, "Teardown signal dropped");
            }
            return Ok(());
        }
        tracing::info!(attempt = %self.attempt_id, "Ending call ({:?})", reason);

        self.sync.deactivate();
        let _ = self.shutdown_tx.send(true);
        self.emit(CallEvent::PhaseChanged(CallPhase::Ended));

        let media = self.media.lock().take();
        if let Some(media) = media {
            media.release();
        }
        if let Err(e) = self.transport.close().await {
            tracing::warn!(attempt = %self.attempt_id, "Failed to close transport: {}", e);
        }

        let presence = self.sync.presence().set_local_presence(false).await;
        if let Err(e) = &presence {
            tracing::warn!(attempt = %self.attempt_id, "Failed to clear presence: {}", e);
        }

        let reset = match reason {
            EndReason::LocalHangup => self.reset_record().await,
            EndReason::RemoteEnded => self.clear_leftovers().await,
            EndReason::SubscriptionLost => Ok(()),
        };

        self.emit(CallEvent::Status(match reason {
            EndReason::SubscriptionLost => CallStatus::ConnectionLost,
            _ => CallStatus::Ended,
        }));
        self.ended_tx.send_replace(true);

        reset?;
        presence?;
        Ok(())
    }

    /// Setzt die Verhandlungsfelder zurück
    ///
    /// Ein bereits abgeschlossener Termin bleibt `completed`, sonst `booked`.
    async fn reset_record(&self) -> Result<(), SignalingError> {
        let status = match self.store.get(&self.session_id).await {
            Ok(record) if record.status == SessionStatus::Completed => SessionStatus::Completed,
            Ok(_) => SessionStatus::Booked,
            Err(e) => {
                tracing::warn!("Could not read record before reset: {}", e);
                SessionStatus::Booked
            }
        };

        let store = Arc::clone(&self.store);
        let session_id = self.session_id.clone();
        with_backoff(&self.retry, "reset", move || {
            let store = Arc::clone(&store);
            let session_id = session_id.clone();
            async move { store.patch(&session_id, RecordPatch::reset(status)).await }
        })
        .await
    }

    /// Räumt Verhandlungsdaten auf, die nach dem Zurücksetzen der
    /// Gegenseite noch im Record stehen
    ///
    /// Ein Record, der schon wieder `in_call` ist, gehört einem neuen
    /// Versuch und bleibt unangetastet.
    async fn clear_leftovers(&self) -> Result<(), SignalingError> {
        let record = match self.store.get(&self.session_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Could not read record after remote end: {}", e);
                return Ok(());
            }
        };
        if record.status == SessionStatus::InCall || !record.has_negotiation_data() {
            return Ok(());
        }

        tracing::info!(
            attempt = %self.attempt_id,
            "Clearing leftover negotiation data for session {}",
            self.session_id
        );
        let status = record.status;
        let store = Arc::clone(&self.store);
        let session_id = self.session_id.clone();
        with_backoff(&self.retry, "reset", move || {
            let store = Arc::clone(&store);
            let session_id = session_id.clone();
            async move { store.patch(&session_id, RecordPatch::reset(status)).await }
        })
        .await
    }

    fn report_signaling_error(&self, error: SignalingError) {
        match error {
            SignalingError::SignalingUnavailable { .. } => {
                tracing::error!(attempt = %self.attempt_id, "{}", error);
                self.emit(CallEvent::Status(CallStatus::SignalingUnavailable));
            }
            SignalingError::DuplicateApplyAttempt(field) => {
                // Diagnose, nicht für die UI
                tracing::error!(attempt = %self.attempt_id, "Duplicate {} publication", field);
            }
            other => {
                tracing::warn!(attempt = %self.attempt_id, "Signaling error: {}", other);
                self.emit(CallEvent::Error(other.to_string()));
            }
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl<R: NegotiationRole> std::fmt::Debug for CallEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("session_id", &self.session_id)
            .field("role", &R::ROLE)
            .field("attempt_id", &self.attempt_id)
            .field("phase", &self.phase())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
