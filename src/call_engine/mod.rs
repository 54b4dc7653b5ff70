//! Call Engine Module - Anruf-Ablauf und WebRTC
//!
//! Dieses Modul verwaltet:
//! - Zustandsmaschine eines Anruf-Versuchs
//! - Lokale Medien (mit degradiertem Empfangs-Modus)
//! - WebRTC Peer Connections
//! - Teardown und Zurücksetzen des Records

mod engine;
mod state;
mod transport;
mod webrtc;

pub use engine::{CallEngine, CallEngineError, CallEvent, CallStatus, EndReason};
pub use state::{CallPhase, CallStateMachine, InvalidTransition};
pub use transport::{
    LocalMedia, MediaError, TransportError, TransportEvent, TransportFactory, TransportSession,
};
pub use self::webrtc::{WebRtcTransport, WebRtcTransportFactory};
