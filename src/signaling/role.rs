//! Caller- und Callee-Variante des Verhandlungsprotokolls
//!
//! Pro Feld gibt es genau einen Schreiber: das Offer schreibt der Caller,
//! das Answer der Callee. Die Rolle ist ein Typparameter von
//! `SignalingSync`, damit ein Callee gar kein Offer veröffentlichen kann.

use super::codec;
use super::sync::{SignalingError, SignalingSync};
use crate::record::{Role, SdpType, SessionDescription, SessionRecord};
use async_trait::async_trait;

#[async_trait]
pub trait NegotiationRole: Send + Sync + Sized + 'static {
    const ROLE: Role;

    /// Wird einmal aufgerufen, sobald die Medien angehängt sind
    async fn begin_negotiation(sync: &SignalingSync<Self>) -> Result<(), SignalingError>;

    /// Übernimmt die Remote Description aus einem Snapshot
    ///
    /// Gibt `true` zurück, wenn sie mit diesem Aufruf angewendet wurde.
    async fn reconcile_description(
        sync: &SignalingSync<Self>,
        record: &SessionRecord,
    ) -> Result<bool, SignalingError>;
}

/// Anrufer: erstellt das Offer und wartet auf das Answer
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerRole;

/// Angerufener: wartet auf das Offer und antwortet
#[derive(Debug, Clone, Copy, Default)]
pub struct CalleeRole;

#[async_trait]
impl NegotiationRole for CallerRole {
    const ROLE: Role = Role::Caller;

    async fn begin_negotiation(sync: &SignalingSync<Self>) -> Result<(), SignalingError> {
        let offer = sync.transport().create_offer().await?;
        sync.transport()
            .set_local_description(offer.clone())
            .await?;
        sync.publish_local_offer(&offer).await
    }

    async fn reconcile_description(
        sync: &SignalingSync<Self>,
        record: &SessionRecord,
    ) -> Result<bool, SignalingError> {
        let answer = match &record.answer {
            Some(answer) if answer.sdp_type == SdpType::Answer => answer,
            Some(_) => {
                tracing::warn!("Ignoring answer field with wrong SDP type");
                return Ok(false);
            }
            None => return Ok(false),
        };
        if !sync.claim_remote_description() {
            return Ok(false);
        }

        tracing::info!(attempt = %sync.attempt_id(), "Answer received, applying remote description");
        apply_remote_description(sync, answer).await?;
        Ok(true)
    }
}

#[async_trait]
impl NegotiationRole for CalleeRole {
    const ROLE: Role = Role::Callee;

    async fn begin_negotiation(sync: &SignalingSync<Self>) -> Result<(), SignalingError> {
        tracing::info!(attempt = %sync.attempt_id(), "Waiting for caller's offer");
        Ok(())
    }

    async fn reconcile_description(
        sync: &SignalingSync<Self>,
        record: &SessionRecord,
    ) -> Result<bool, SignalingError> {
        let mut applied = false;
        match &record.offer {
            Some(offer) if offer.sdp_type == SdpType::Offer => {
                if sync.claim_remote_description() {
                    tracing::info!(attempt = %sync.attempt_id(), "Offer received, creating answer");
                    apply_remote_description(sync, offer).await?;
                    applied = true;
                }
            }
            Some(_) => tracing::warn!("Ignoring offer field with wrong SDP type"),
            None => {}
        }

        // Auch ein früher gescheitertes Answer wird hier nachgeholt
        if sync.is_active()
            && sync.remote_description_applied()
            && !sync.local_description_published()
        {
            let answer = sync.transport().create_answer().await?;
            sync.transport()
                .set_local_description(answer.clone())
                .await?;
            sync.publish_local_answer(&answer).await?;
        }
        Ok(applied)
    }
}

/// Dekodiert und setzt die Remote Description
///
/// Schlägt das fehl, wird der Anspruch freigegeben und die nächste
/// Lieferung versucht es erneut.
async fn apply_remote_description<R: NegotiationRole>(
    sync: &SignalingSync<R>,
    desc: &SessionDescription,
) -> Result<(), SignalingError> {
    let result = match codec::decode_description(desc) {
        Ok(native) => sync
            .transport()
            .set_remote_description(native)
            .await
            .map_err(SignalingError::from),
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(()) => {
            sync.mark_remote_description_applied();
            Ok(())
        }
        Err(e) => {
            tracing::warn!(
                attempt = %sync.attempt_id(),
                "Applying remote description failed, retrying on next delivery: {}",
                e
            );
            sync.release_remote_description();
            Err(e)
        }
    }
}
