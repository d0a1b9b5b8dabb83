use std::time::Instant;

use tracing::info;

use crate::model::*;
use crate::observability::record_operation;

use super::error::ConflictKind;
use super::{Engine, EngineError, JoinOutcome};

impl Engine {
    /// Admit `user_id` to a group session.
    ///
    /// Serialized per session. The count check, the insert and the
    /// `Open → Closed` transition at capacity are a single write, so the
    /// number of successful joins never exceeds capacity.
    pub async fn join_group_session(&self, slot_id: SlotId, user_id: UserId) -> Result<Admission, EngineError> {
        let started = Instant::now();
        let result = self.admit(slot_id, user_id).await;
        record_operation("join_group_session", started, &result);
        result
    }

    async fn admit(&self, slot_id: SlotId, user_id: UserId) -> Result<Admission, EngineError> {
        let slot = self.store.get_slot(slot_id).await?;
        if !slot.is_group() {
            return Err(EngineError::Validation("slot is not a group session"));
        }
        if slot.status == SlotStatus::Cancelled {
            return Err(EngineError::Validation("group session is cancelled"));
        }
        if slot.owner_id == user_id {
            return Err(EngineError::Validation("owner cannot join their own session"));
        }
        self.require_user(user_id).await?;

        // A Closed session is still admitted to the lock so the store reports
        // CapacityFull, or DuplicateJoin for someone already inside.
        let outcome = self
            .guard
            .with_session_lock(slot_id, |permit| async move {
                Ok(self
                    .store
                    .insert_participant_if_under_capacity(permit, slot_id, user_id)
                    .await?)
            })
            .await?;

        match outcome {
            JoinOutcome::Joined { participants, closed } => {
                info!(%slot_id, %user_id, participants, closed, "participant admitted");
                Ok(Admission {
                    slot_id,
                    participants,
                    closed,
                })
            }
            JoinOutcome::Duplicate => Err(ConflictKind::DuplicateJoin(user_id).into()),
            JoinOutcome::Full { capacity } => Err(ConflictKind::CapacityFull(capacity).into()),
            JoinOutcome::NotOpen => Err(EngineError::Validation("group session is not open")),
        }
    }
}
