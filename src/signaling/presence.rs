//! Presence-Flags im geteilten Record
//!
//! Jede Partei schreibt nur ihr eigenes Flag. Das Flag der Gegenseite wird
//! nur gelesen und dient der Statusanzeige, nie der Verhandlungslogik.

use super::retry::with_backoff;
use super::sync::SignalingError;
use crate::config::RetryPolicy;
use crate::record::{RecordPatch, Role, SessionRecord, SharedRecordStore};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct PresenceTracker {
    session_id: String,
    role: Role,
    store: Arc<dyn SharedRecordStore>,
    retry: RetryPolicy,
    /// Zuletzt beobachtetes Flag der Gegenseite
    remote_online: Mutex<Option<bool>>,
    /// Nach dem Teardown wird nur noch `false` geschrieben
    active: Arc<AtomicBool>,
}

impl PresenceTracker {
    pub fn new(
        session_id: String,
        role: Role,
        store: Arc<dyn SharedRecordStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            session_id,
            role,
            store,
            retry,
            remote_online: Mutex::new(None),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Ab jetzt sind nur noch Offline-Meldungen erlaubt
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Schreibt das Flag der lokalen Rolle
    ///
    /// `true` wird nach `deactivate()` nicht mehr geschrieben. Landet ein
    /// `true` erst nach dem Teardown, wird es mit `false` überschrieben.
    pub async fn set_local_presence(&self, online: bool) -> Result<(), SignalingError> {
        if online && !self.active.load(Ordering::SeqCst) {
            tracing::debug!("Skipping {} online write after teardown", self.role);
            return Ok(());
        }
        tracing::debug!(
            "Setting {} presence to {} for session {}",
            self.role,
            online,
            self.session_id
        );

        self.write(online).await?;

        if online && !self.active.load(Ordering::SeqCst) {
            tracing::debug!("Teardown raced {} online write, clearing again", self.role);
            self.write(false).await?;
        }
        Ok(())
    }

    async fn write(&self, online: bool) -> Result<(), SignalingError> {
        let store = Arc::clone(&self.store);
        let session_id = self.session_id.clone();
        let role = self.role;
        let active = Arc::clone(&self.active);
        with_backoff(&self.retry, "presence", move || {
            let store = Arc::clone(&store);
            let session_id = session_id.clone();
            let skip = online && !active.load(Ordering::SeqCst);
            async move {
                if skip {
                    return Ok(());
                }
                store
                    .patch(&session_id, RecordPatch::new().presence(role, online))
                    .await
            }
        })
        .await
    }

    /// Liest das Flag der Gegenseite aus einem Snapshot
    pub fn observe_remote_presence(&self, record: &SessionRecord) -> bool {
        record.is_online(self.role.peer())
    }

    /// Merkt sich das Flag der Gegenseite; `Some` bei einer Änderung
    pub fn track_remote_presence(&self, record: &SessionRecord) -> Option<bool> {
        let online = self.observe_remote_presence(record);
        let mut last = self.remote_online.lock();
        if *last == Some(online) {
            None
        } else {
            *last = Some(online);
            Some(online)
        }
    }

    /// Zuletzt beobachteter Stand der Gegenseite
    pub fn remote_online(&self) -> bool {
        self.remote_online.lock().unwrap_or(false)
    }
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("remote_online", &*self.remote_online.lock())
            .finish()
    }
}
