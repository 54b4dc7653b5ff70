//! Zustandsmaschine eines Anruf-Versuchs
//!
//! Idle → AcquiringMedia → Negotiating → Connected → Ended
//!
//! Reine Übergangslogik ohne Seiteneffekte. Die Engine führt die
//! Seiteneffekte (Medien, Presence, Signaling, Cleanup) passend aus.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// Kein aktiver Versuch
    Idle,
    /// Lokale Medien angefordert
    AcquiringMedia,
    /// Medien angehängt, Offer/Answer-Austausch läuft
    Negotiating,
    /// Erste Remote-Medien empfangen
    Connected,
    /// Beendet (endgültig)
    Ended,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid transition {action} in phase {phase:?}")]
pub struct InvalidTransition {
    pub phase: CallPhase,
    pub action: &'static str,
}

#[derive(Debug, Clone)]
pub struct CallStateMachine {
    phase: CallPhase,
    /// Ohne lokale Medien verhandelt (nur Empfang)
    degraded: bool,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self {
            phase: CallPhase::Idle,
            degraded: false,
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Idle → AcquiringMedia
    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.transition(CallPhase::Idle, CallPhase::AcquiringMedia, "start")
    }

    /// AcquiringMedia → Negotiating
    ///
    /// `degraded` ist gesetzt, wenn keine lokalen Medien verfügbar waren.
    pub fn media_attached(&mut self, degraded: bool) -> Result<(), InvalidTransition> {
        self.transition(
            CallPhase::AcquiringMedia,
            CallPhase::Negotiating,
            "media_attached",
        )?;
        self.degraded = degraded;
        Ok(())
    }

    /// Negotiating → Connected
    ///
    /// Gibt `true` nur beim eigentlichen Übergang zurück. Wiederholte
    /// Remote-Tracks im Zustand Connected sind No-ops.
    pub fn remote_media_observed(&mut self) -> bool {
        match self.phase {
            CallPhase::Negotiating => {
                self.phase = CallPhase::Connected;
                true
            }
            _ => false,
        }
    }

    /// Jeder Zustand → Ended; `false` wenn bereits beendet
    pub fn end(&mut self) -> bool {
        if self.phase == CallPhase::Ended {
            return false;
        }
        self.phase = CallPhase::Ended;
        true
    }

    /// Dürfen Verhandlungsdaten gelesen/geschrieben werden?
    pub fn allows_signaling(&self) -> bool {
        matches!(self.phase, CallPhase::Negotiating | CallPhase::Connected)
    }

    fn transition(
        &mut self,
        from: CallPhase,
        to: CallPhase,
        action: &'static str,
    ) -> Result<(), InvalidTransition> {
        if self.phase != from {
            return Err(InvalidTransition {
                phase: self.phase,
                action,
            });
        }
        self.phase = to;
        Ok(())
    }
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
