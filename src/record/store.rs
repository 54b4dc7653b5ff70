//! Schnittstelle zum geteilten Record-Store
//!
//! Der Store liefert bei jeder Änderung den vollständigen aktuellen Record,
//! keine Deltas. Mehrere Schreibvorgänge können zu einer Lieferung
//! zusammengefasst werden.

use super::model::{RecordPatch, SessionRecord};
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Session record not found: {0}")]
    NotFound(String),

    #[error("Record write failed: {0}")]
    WriteFailed(String),

    #[error("Change feed closed: {0}")]
    FeedClosed(String),
}

// ============================================================================
// STORE
// ============================================================================

/// Feed mit vollständigen Record-Snapshots
///
/// Droppen des Feeds beendet das Abonnement. Endet der Feed von selbst
/// oder liefert er einen Fehler, ist das Abonnement verloren.
pub type RecordFeed = BoxStream<'static, Result<SessionRecord, StoreError>>;

#[async_trait]
pub trait SharedRecordStore: Send + Sync {
    /// Liest den aktuellen Record
    async fn get(&self, session_id: &str) -> Result<SessionRecord, StoreError>;

    /// Schreibt Feld-Updates
    ///
    /// Candidate-Updates werden per Wert gemerged, nie ersetzt.
    async fn patch(&self, session_id: &str, patch: RecordPatch) -> Result<(), StoreError>;

    /// Abonniert Änderungen; die erste Lieferung ist der aktuelle Stand
    async fn subscribe(&self, session_id: &str) -> Result<RecordFeed, StoreError>;
}
