//! Record Module - Geteilter Session-Record
//!
//! Der Record ist der einzige prozessübergreifende Zustand eines Anrufs:
//! - Datenmodell mit dem persistierten Feld-Layout
//! - Store-Schnittstelle (get / patch / subscribe)
//! - In-Process Store mit Snapshot-Feeds
//!

mod memory;
mod model;
mod store;

pub use memory::MemoryRecordStore;
pub use model::*;
pub use store::{RecordFeed, SharedRecordStore, StoreError};
