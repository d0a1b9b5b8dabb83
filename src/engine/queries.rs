use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, StoreStats};

impl Engine {
    pub async fn get_slot(&self, slot_id: SlotId) -> Result<ReservationSlot, EngineError> {
        Ok(self.store.get_slot(slot_id).await?)
    }

    /// Every slot of `owner_id` overlapping `[start, end)`, cancelled ones
    /// included, in start order. An owner with no calendar yields nothing.
    pub async fn list_slots(&self, owner_id: OwnerId, start: Ms, end: Ms) -> Result<Vec<ReservationSlot>, EngineError> {
        let query = Span::checked(start, end).ok_or(EngineError::Validation("start must be before end"))?;
        if query.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        Ok(self.store.slots_in(owner_id, query).await)
    }

    pub async fn participants(&self, slot_id: SlotId) -> Result<Vec<Participant>, EngineError> {
        Ok(self.store.participants(slot_id).await?)
    }

    pub async fn participant_count(&self, slot_id: SlotId) -> Result<u32, EngineError> {
        Ok(self.store.count_participants(slot_id).await?)
    }

    pub async fn stats(&self) -> StoreStats {
        self.store.stats().await
    }
}
