//! Signaling Module - Verhandlung über den geteilten Record
//!
//! Dieses Modul verbindet die Peer Connection mit dem Record-Store:
//! - Offer/Answer/Candidates in Record-Felder übersetzen
//! - Lokale Verhandlungsdaten veröffentlichen
//! - Snapshots idempotent abgleichen
//! - Presence-Flags pflegen
//!

pub mod codec;
mod presence;
mod retry;
mod role;
mod sync;

pub use codec::CodecError;
pub use presence::PresenceTracker;
pub use retry::with_backoff;
pub use role::{CalleeRole, CallerRole, NegotiationRole};
pub use sync::{ReconcileOutcome, SignalingError, SignalingSync};
