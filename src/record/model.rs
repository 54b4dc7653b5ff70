//! Datenmodell des geteilten Session-Records
//!
//! Diese Strukturen spiegeln das Feld-Layout wider, das im Record-Store
//! persistiert wird (camelCase, wie es beide Clients lesen und schreiben).

use serde::{Deserialize, Serialize};

// ============================================================================
// ROLLEN
// ============================================================================

/// Rolle einer Partei innerhalb einer Session
///
/// Der Caller hat die Buchung angelegt und schreibt das Offer,
/// der Callee schreibt das Answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    /// Die jeweils andere Partei
    pub fn peer(self) -> Role {
        match self {
            Role::Caller => Role::Callee,
            Role::Callee => Role::Caller,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Caller => write!(f, "caller"),
            Role::Callee => write!(f, "callee"),
        }
    }
}

// ============================================================================
// SESSION STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Booked,
    InCall,
    Completed,
}

// ============================================================================
// NEGOTIATION FIELDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Offer oder Answer, wie es im Record steht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "sdpType")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// Ein ICE Candidate im Record
///
/// Gleichheit ist Wertgleichheit über alle vier Felder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub kind: String,
    pub media_id: Option<String>,
    pub media_line_index: Option<u16>,
    pub candidate_string: String,
}

// ============================================================================
// SESSION RECORD
// ============================================================================

/// Vollständiger Snapshot des geteilten Records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub status: SessionStatus,
    #[serde(default)]
    pub caller_online: bool,
    #[serde(default)]
    pub callee_online: bool,
    #[serde(default)]
    pub offer: Option<SessionDescription>,
    #[serde(default)]
    pub answer: Option<SessionDescription>,
    #[serde(default)]
    pub ice_candidates: Vec<Candidate>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SessionRecord {
    /// Record im Zustand direkt nach der Buchung
    pub fn booked() -> Self {
        Self {
            status: SessionStatus::Booked,
            caller_online: false,
            callee_online: false,
            offer: None,
            answer: None,
            ice_candidates: Vec::new(),
            notes: None,
        }
    }

    /// Presence-Flag einer Rolle
    pub fn is_online(&self, role: Role) -> bool {
        match role {
            Role::Caller => self.caller_online,
            Role::Callee => self.callee_online,
        }
    }

    /// Enthält der Record Verhandlungsdaten?
    pub fn has_negotiation_data(&self) -> bool {
        self.offer.is_some() || self.answer.is_some() || !self.ice_candidates.is_empty()
    }
}

// ============================================================================
// PATCHES
// ============================================================================

/// Änderung an der Candidate-Liste
///
/// `Union` ist ein Merge nach Wert, niemals ein Überschreiben der Liste.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateUpdate {
    Union(Vec<Candidate>),
    Clear,
}

/// Feld-Updates für `SharedRecordStore::patch`
///
/// `None` lässt ein Feld unverändert. Bei `offer`/`answer`/`notes`
/// bedeutet `Some(None)`, dass das Feld auf null gesetzt wird.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPatch {
    pub status: Option<SessionStatus>,
    pub caller_online: Option<bool>,
    pub callee_online: Option<bool>,
    pub offer: Option<Option<SessionDescription>>,
    pub answer: Option<Option<SessionDescription>>,
    pub candidates: Option<CandidateUpdate>,
    pub notes: Option<Option<String>>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Setzt ausschließlich das Presence-Flag der angegebenen Rolle
    pub fn presence(mut self, role: Role, online: bool) -> Self {
        match role {
            Role::Caller => self.caller_online = Some(online),
            Role::Callee => self.callee_online = Some(online),
        }
        self
    }

    pub fn offer(mut self, desc: SessionDescription) -> Self {
        self.offer = Some(Some(desc));
        self
    }

    pub fn answer(mut self, desc: SessionDescription) -> Self {
        self.answer = Some(Some(desc));
        self
    }

    pub fn append_candidates(mut self, candidates: Vec<Candidate>) -> Self {
        self.candidates = Some(CandidateUpdate::Union(candidates));
        self
    }

    pub fn notes(mut self, notes: String) -> Self {
        self.notes = Some(Some(notes));
        self
    }

    /// Setzt alle Verhandlungsfelder und beide Presence-Flags zurück
    ///
    /// `notes` bleibt unberührt.
    pub fn reset(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            caller_online: Some(false),
            callee_online: Some(false),
            offer: Some(None),
            answer: Some(None),
            candidates: Some(CandidateUpdate::Clear),
            notes: None,
        }
    }

    /// Wendet den Patch auf einen Record an
    ///
    /// Wird von Stores benutzt, die Patches lokal auswerten.
    pub fn apply_to(&self, record: &mut SessionRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(online) = self.caller_online {
            record.caller_online = online;
        }
        if let Some(online) = self.callee_online {
            record.callee_online = online;
        }
        if let Some(offer) = &self.offer {
            record.offer = offer.clone();
        }
        if let Some(answer) = &self.answer {
            record.answer = answer.clone();
        }
        match &self.candidates {
            Some(CandidateUpdate::Union(candidates)) => {
                for candidate in candidates {
                    if !record.ice_candidates.contains(candidate) {
                        record.ice_candidates.push(candidate.clone());
                    }
                }
            }
            Some(CandidateUpdate::Clear) => record.ice_candidates.clear(),
            None => {}
        }
        if let Some(notes) = &self.notes {
            record.notes = notes.clone();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
