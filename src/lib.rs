//! Consult Call - Peer-to-Peer Beratungsgespräche
//!
//! Audio/Video-Anrufe zwischen zwei Parteien eines gebuchten Termins mit:
//! - WebRTC für die P2P-Medienverbindung
//! - Einem geteilten Session-Record als einzigem Signaling-Kanal
//! - Idempotentem Abgleich vollständiger Record-Snapshots
//!
//! Die Buchungs-/UI-Schicht spricht ausschließlich mit `CallService`.

pub mod call_engine;
pub mod config;
pub mod record;
pub mod signaling;

#[cfg(test)]
mod testing;

use call_engine::{
    CallEngine, CallEngineError, CallEvent, CallPhase, CallStatus, TransportError,
    TransportFactory, WebRtcTransportFactory,
};
use chrono::{DateTime, Utc};
use config::CallConfig;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use record::{RecordPatch, Role, SessionStatus, SharedRecordStore};
use serde::Serialize;
use signaling::{with_backoff, CalleeRole, CallerRole, NegotiationRole, SignalingError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

// ============================================================================
// LOGGING
// ============================================================================

static TRACING: OnceCell<()> = OnceCell::new();

/// Initialisiert das Logging (mehrfacher Aufruf ist harmlos)
///
/// `RUST_LOG` überschreibt die Defaults `consult_call=debug,webrtc=warn`.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("consult_call=debug,webrtc=warn"));
        if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
            tracing::debug!("Global subscriber already installed");
        }
    });
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Session {0} already has an active call")]
    AlreadyActive(String),

    #[error("Session {0} has no active call")]
    NotActive(String),

    #[error("Only the callee can save notes")]
    NotesRequireCallee,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Call error: {0}")]
    Call(#[from] CallEngineError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

// ============================================================================
// TYPES
// ============================================================================

/// Ein gebuchter Termin aus Sicht der lokalen Partei
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRef {
    pub session_id: String,
    pub local_role: Role,
}

impl SessionRef {
    pub fn caller(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            local_role: Role::Caller,
        }
    }

    pub fn callee(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            local_role: Role::Callee,
        }
    }
}

/// Statusmeldung an die UI
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub session_id: String,
    pub role: Role,
    pub status: CallStatus,
    pub at: DateTime<Utc>,
}

/// Laufender Anruf einer Rolle
#[derive(Clone)]
enum ActiveCall {
    Caller(Arc<CallEngine<CallerRole>>),
    Callee(Arc<CallEngine<CalleeRole>>),
}

impl ActiveCall {
    fn attempt_id(&self) -> Uuid {
        match self {
            ActiveCall::Caller(engine) => engine.attempt_id(),
            ActiveCall::Callee(engine) => engine.attempt_id(),
        }
    }

    fn phase(&self) -> CallPhase {
        match self {
            ActiveCall::Caller(engine) => engine.phase(),
            ActiveCall::Callee(engine) => engine.phase(),
        }
    }

    async fn end(&self) -> Result<(), CallEngineError> {
        match self {
            ActiveCall::Caller(engine) => engine.end().await,
            ActiveCall::Callee(engine) => engine.end().await,
        }
    }
}

type ActiveCalls = Arc<Mutex<HashMap<String, ActiveCall>>>;

// ============================================================================
// CALL SERVICE
// ============================================================================

/// Schnittstelle für die Buchungs-/UI-Schicht
pub struct CallService {
    config: CallConfig,
    store: Arc<dyn SharedRecordStore>,
    factory: Arc<dyn TransportFactory>,
    active: ActiveCalls,
    status_tx: broadcast::Sender<StatusUpdate>,
}

impl CallService {
    pub fn new(
        config: CallConfig,
        store: Arc<dyn SharedRecordStore>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            store,
            factory,
            active: Arc::new(Mutex::new(HashMap::new())),
            status_tx,
        }
    }

    /// Service mit webrtc-rs Peer Connections
    pub fn with_webrtc(config: CallConfig, store: Arc<dyn SharedRecordStore>) -> Self {
        Self::new(config, store, Arc::new(WebRtcTransportFactory))
    }

    /// Gibt einen Receiver für Statusmeldungen aller Sessions zurück
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.status_tx.subscribe()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.lock().contains_key(session_id)
    }

    /// Phase des aktiven Anrufs einer Session
    pub fn phase(&self, session_id: &str) -> Option<CallPhase> {
        self.active.lock().get(session_id).map(ActiveCall::phase)
    }

    /// Startet einen Anruf für die Session in der lokalen Rolle
    pub async fn start_session(&self, session: &SessionRef) -> Result<(), ServiceError> {
        if self.is_active(&session.session_id) {
            return Err(ServiceError::AlreadyActive(session.session_id.clone()));
        }

        tracing::info!(
            "Starting session {} as {}",
            session.session_id,
            session.local_role
        );
        let transport = self.factory.create(&self.config).await?;

        let result = match session.local_role {
            Role::Caller => {
                let engine = CallEngine::<CallerRole>::new(
                    session.session_id.clone(),
                    Arc::clone(&self.store),
                    transport,
                    &self.config,
                );
                self.launch(engine, ActiveCall::Caller).await
            }
            Role::Callee => {
                let engine = CallEngine::<CalleeRole>::new(
                    session.session_id.clone(),
                    Arc::clone(&self.store),
                    transport,
                    &self.config,
                );
                self.launch(engine, ActiveCall::Callee).await
            }
        };

        if let Err(e) = &result {
            tracing::error!("Failed to start session {}: {}", session.session_id, e);
        }
        result
    }

    /// Beendet den Anruf der Session lokal
    ///
    /// Setzt die Verhandlungsfelder zurück; Notizen bleiben erhalten.
    pub async fn end_session(&self, session_id: &str) -> Result<(), ServiceError> {
        let call = self
            .active
            .lock()
            .remove(session_id)
            .ok_or_else(|| ServiceError::NotActive(session_id.to_string()))?;

        tracing::info!("Ending session {}", session_id);
        call.end().await?;
        Ok(())
    }

    /// Speichert die Notizen und schließt den Termin ab (nur Callee)
    pub async fn save_notes(&self, session: &SessionRef, notes: String) -> Result<(), ServiceError> {
        if session.local_role != Role::Callee {
            return Err(ServiceError::NotesRequireCallee);
        }

        let store = Arc::clone(&self.store);
        let session_id = session.session_id.clone();
        let patch = RecordPatch::new()
            .notes(notes)
            .status(SessionStatus::Completed);
        with_backoff(&self.config.retry, "notes", move || {
            let store = Arc::clone(&store);
            let session_id = session_id.clone();
            let patch = patch.clone();
            async move { store.patch(&session_id, patch).await }
        })
        .await?;

        tracing::info!("Notes saved, session {} completed", session.session_id);
        Ok(())
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn launch<R, F>(&self, engine: Arc<CallEngine<R>>, wrap: F) -> Result<(), ServiceError>
    where
        R: NegotiationRole,
        F: FnOnce(Arc<CallEngine<R>>) -> ActiveCall,
    {
        let session_id = engine.session_id().to_string();
        let attempt_id = engine.attempt_id();

        {
            let mut active = self.active.lock();
            if active.contains_key(&session_id) {
                return Err(ServiceError::AlreadyActive(session_id));
            }
            active.insert(session_id.clone(), wrap(Arc::clone(&engine)));
        }

        self.spawn_forwarder(session_id.clone(), R::ROLE, attempt_id, engine.subscribe());

        if let Err(e) = engine.start().await {
            Self::forget(&self.active, &session_id, attempt_id);
            return Err(e.into());
        }
        Ok(())
    }

    /// Leitet Engine-Events als `StatusUpdate` weiter
    ///
    /// Endet der Anruf von selbst, wird er aus der Liste entfernt.
    fn spawn_forwarder(
        &self,
        session_id: String,
        role: Role,
        attempt_id: Uuid,
        mut events: broadcast::Receiver<CallEvent>,
    ) {
        let status_tx = self.status_tx.clone();
        let active = Arc::clone(&self.active);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(CallEvent::Status(status)) => {
                        let _ = status_tx.send(StatusUpdate {
                            session_id: session_id.clone(),
                            role,
                            status,
                            at: Utc::now(),
                        });
                        if matches!(status, CallStatus::Ended | CallStatus::ConnectionLost) {
                            Self::forget(&active, &session_id, attempt_id);
                            break;
                        }
                    }
                    Ok(CallEvent::RemotePresence(online)) => {
                        tracing::debug!("Session {}: peer online = {}", session_id, online);
                    }
                    Ok(CallEvent::Error(message)) => {
                        tracing::warn!("Session {}: {}", session_id, message);
                    }
                    Ok(CallEvent::PhaseChanged(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Status forwarder lagged, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Entfernt den Anruf, falls er noch zu diesem Versuch gehört
    fn forget(active: &ActiveCalls, session_id: &str, attempt_id: Uuid) {
        let mut active = active.lock();
        if active.get(session_id).map(ActiveCall::attempt_id) == Some(attempt_id) {
            active.remove(session_id);
        }
    }
}

impl std::fmt::Debug for CallService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallService")
            .field("active", &self.active.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
