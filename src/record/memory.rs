//! In-Process Record-Store
//!
//! Hält Records in `watch`-Kanälen. Ein `watch`-Kanal liefert immer den
//! neuesten Stand und fasst schnelle Folgeänderungen zusammen, genau wie ein
//! Dokument-Store mit Snapshot-Abonnements.

use super::model::{RecordPatch, SessionRecord};
use super::store::{RecordFeed, SharedRecordStore, StoreError};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::watch;

/// Record-Store im Speicher (Thread-safe durch Mutex)
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, watch::Sender<SessionRecord>>>,
    /// Anzahl der nächsten Schreibvorgänge, die fehlschlagen sollen
    failing_writes: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            failing_writes: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Legt einen Record an oder ersetzt ihn komplett
    pub fn insert(&self, session_id: impl Into<String>, record: SessionRecord) {
        let session_id = session_id.into();
        let mut records = self.records.lock();
        match records.get(&session_id) {
            Some(sender) => {
                sender.send_replace(record);
            }
            None => {
                let (sender, _) = watch::channel(record);
                records.insert(session_id, sender);
            }
        }
    }

    /// Löscht einen Record; offene Feeds enden damit
    pub fn remove(&self, session_id: &str) -> Option<SessionRecord> {
        self.records
            .lock()
            .remove(session_id)
            .map(|sender| sender.borrow().clone())
    }

    /// Aktueller Stand ohne Abonnement
    pub fn snapshot(&self, session_id: &str) -> Option<SessionRecord> {
        self.records
            .lock()
            .get(session_id)
            .map(|sender| sender.borrow().clone())
    }

    /// Lässt die nächsten `count` Schreibvorgänge mit `WriteFailed` scheitern
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Anzahl erfolgreicher Schreibvorgänge
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedRecordStore for MemoryRecordStore {
    async fn get(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        self.snapshot(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    async fn patch(&self, session_id: &str, patch: RecordPatch) -> Result<(), StoreError> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::WriteFailed("injected failure".to_string()));
        }

        let records = self.records.lock();
        let sender = records
            .get(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        sender.send_modify(|record| patch.apply_to(record));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, session_id: &str) -> Result<RecordFeed, StoreError> {
        let rx = self
            .records
            .lock()
            .get(session_id)
            .map(|sender| sender.subscribe())
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        let initial = rx.borrow().clone();
        let updates = stream::unfold(rx, |mut rx| async move {
            match rx.changed().await {
                Ok(()) => {
                    let record = rx.borrow_and_update().clone();
                    Some((Ok(record), rx))
                }
                // Sender gedroppt: Record gelöscht
                Err(_) => None,
            }
        });

        Ok(stream::once(async move { Ok(initial) })
            .chain(updates)
            .boxed())
    }
}

impl std::fmt::Debug for MemoryRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRecordStore")
            .field("records", &self.records.lock().len())
            .field("writes", &self.write_count())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
