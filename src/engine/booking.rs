use std::time::Instant;

use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::record_operation;

use super::conflict::{check_no_conflict, validate_span};
use super::{Engine, EngineError};

fn check_len(text: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if text.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn validate_group_detail(detail: &GroupDetail, capacity: u32) -> Result<(), EngineError> {
    if detail.title.trim().is_empty() {
        return Err(EngineError::Validation("group session needs a title"));
    }
    check_len(&detail.title, MAX_TITLE_LEN, "title too long")?;
    check_len(&detail.description, MAX_DESCRIPTION_LEN, "description too long")?;
    if let Some(image) = &detail.image {
        check_len(image, MAX_IMAGE_REF_LEN, "image reference too long")?;
    }
    if capacity == 0 {
        return Err(EngineError::Validation("capacity must be at least 1"));
    }
    if capacity > MAX_GROUP_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

impl Engine {
    /// Refuse new slots once an owner's calendar is full.
    pub(super) async fn ensure_calendar_room(&self, owner_id: OwnerId, adding: usize) -> Result<(), EngineError> {
        if self.store.slot_count(owner_id).await + adding > MAX_SLOTS_PER_OWNER {
            return Err(EngineError::LimitExceeded("too many slots on calendar"));
        }
        Ok(())
    }

    /// Book a one-on-one session on `owner_id`'s calendar for `requester_id`.
    ///
    /// Of any number of concurrent requests for overlapping windows on one
    /// owner, exactly one succeeds; the rest get `TimeConflict`.
    pub async fn request_individual_booking(
        &self,
        owner_id: OwnerId,
        requester_id: UserId,
        start: Ms,
        end: Ms,
        pre_notes: impl Into<String>,
    ) -> Result<SlotId, EngineError> {
        let started = Instant::now();
        let result = self
            .book_individual(owner_id, requester_id, start, end, pre_notes.into())
            .await;
        record_operation("request_individual_booking", started, &result);
        result
    }

    async fn book_individual(
        &self,
        owner_id: OwnerId,
        requester_id: UserId,
        start: Ms,
        end: Ms,
        pre_notes: String,
    ) -> Result<SlotId, EngineError> {
        let span = validate_span(start, end)?;
        check_len(&pre_notes, MAX_NOTES_LEN, "pre-session notes too long")?;
        if owner_id == requester_id {
            return Err(EngineError::Validation("coach cannot book their own calendar"));
        }
        self.require_coach(owner_id).await?;
        self.require_user(requester_id).await?;

        let slot_id = Ulid::new();
        self.guard
            .with_owner_lock(owner_id, |permit| async move {
                self.ensure_calendar_room(owner_id, 1).await?;
                let existing = self.store.find_overlapping(owner_id, span).await;
                check_no_conflict(&existing, &span)?;

                let slot = ReservationSlot::new(
                    slot_id,
                    owner_id,
                    span,
                    SlotKind::Individual(IndividualDetail {
                        pre_notes,
                        summary: None,
                    }),
                );
                let participant = Participant {
                    slot_id,
                    user_id: requester_id,
                };
                self.store
                    .insert_slot_with_participant(permit, slot, participant)
                    .await?;
                Ok(())
            })
            .await?;

        info!(%owner_id, %slot_id, %requester_id, "individual booking created");
        Ok(slot_id)
    }

    /// Open a group session on the owner's calendar. Shares the owner-scoped
    /// conflict check with individual bookings.
    pub async fn create_group_session(
        &self,
        owner_id: OwnerId,
        start: Ms,
        end: Ms,
        detail: GroupDetail,
        capacity: u32,
    ) -> Result<SlotId, EngineError> {
        let started = Instant::now();
        let result = self
            .open_group_session(owner_id, start, end, detail, capacity)
            .await;
        record_operation("create_group_session", started, &result);
        result
    }

    async fn open_group_session(
        &self,
        owner_id: OwnerId,
        start: Ms,
        end: Ms,
        detail: GroupDetail,
        capacity: u32,
    ) -> Result<SlotId, EngineError> {
        let span = validate_span(start, end)?;
        validate_group_detail(&detail, capacity)?;
        self.require_coach(owner_id).await?;

        let slot_id = Ulid::new();
        self.guard
            .with_owner_lock(owner_id, |permit| async move {
                self.ensure_calendar_room(owner_id, 1).await?;
                let existing = self.store.find_overlapping(owner_id, span).await;
                check_no_conflict(&existing, &span)?;

                let slot = ReservationSlot::new(
                    slot_id,
                    owner_id,
                    span,
                    SlotKind::Group { detail, capacity },
                );
                self.store.insert_slot_only(permit, slot).await?;
                Ok(())
            })
            .await?;

        info!(%owner_id, %slot_id, capacity, "group session created");
        Ok(slot_id)
    }

    /// Cancel a session. The owner may cancel any session; the participant of
    /// an individual session may cancel that one. Participants are removed in
    /// the same write that marks the slot cancelled.
    pub async fn cancel_booking(&self, slot_id: SlotId, actor_id: UserId) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self.cancel(slot_id, actor_id).await;
        record_operation("cancel_booking", started, &result);
        result
    }

    async fn cancel(&self, slot_id: SlotId, actor_id: UserId) -> Result<(), EngineError> {
        let slot = self.store.get_slot(slot_id).await?;
        let owner_id = slot.owner_id;
        let allowed = match &slot.kind {
            SlotKind::Block => {
                return Err(EngineError::Validation("blocks are removed with unblock_all"));
            }
            SlotKind::Individual(_) => {
                actor_id == owner_id
                    || self
                        .store
                        .participants(slot_id)
                        .await?
                        .iter()
                        .any(|p| p.user_id == actor_id)
            }
            SlotKind::Group { .. } => actor_id == owner_id,
        };
        if !allowed {
            return Err(EngineError::Unauthorized(
                "only the owner or the participant may cancel",
            ));
        }
        if slot.status == SlotStatus::Cancelled {
            return Err(EngineError::Validation("slot already cancelled"));
        }

        let is_group = slot.is_group();
        let kind = slot.kind.label();
        self.guard
            .with_owner_lock(owner_id, |owner_permit| async move {
                if is_group {
                    self.guard
                        .with_session_lock(slot_id, |session_permit| async move {
                            self.cancel_locked(vec![owner_permit, session_permit], owner_id, slot_id)
                                .await
                        })
                        .await
                } else {
                    self.cancel_locked(vec![owner_permit], owner_id, slot_id)
                        .await
                }
            })
            .await?;

        info!(%owner_id, %slot_id, %actor_id, kind, "slot cancelled");
        Ok(())
    }

    async fn cancel_locked(
        &self,
        permits: Vec<super::LockPermit>,
        owner_id: OwnerId,
        slot_id: SlotId,
    ) -> Result<(), EngineError> {
        // Another cancel may have won the lock first.
        if self.store.get_slot(slot_id).await?.status == SlotStatus::Cancelled {
            return Err(EngineError::Validation("slot already cancelled"));
        }
        self.store.cancel_slot(permits, owner_id, slot_id).await?;
        Ok(())
    }

    /// Store the handle issued by the video-session collaborator.
    pub async fn assign_session_handle(
        &self,
        slot_id: SlotId,
        session_id: impl Into<String>,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self.assign_handle(slot_id, session_id.into()).await;
        record_operation("assign_session_handle", started, &result);
        result
    }

    async fn assign_handle(&self, slot_id: SlotId, session_id: String) -> Result<(), EngineError> {
        if session_id.trim().is_empty() {
            return Err(EngineError::Validation("session handle is empty"));
        }
        check_len(&session_id, MAX_SESSION_HANDLE_LEN, "session handle too long")?;
        let slot = self.store.get_slot(slot_id).await?;
        if slot.is_block() {
            return Err(EngineError::Validation("blocks have no session"));
        }
        let owner_id = slot.owner_id;

        self.guard
            .with_owner_lock(owner_id, |permit| async move {
                if self.store.get_slot(slot_id).await?.status == SlotStatus::Cancelled {
                    return Err(EngineError::Validation("slot is cancelled"));
                }
                self.store
                    .set_session_handle(permit, owner_id, slot_id, session_id)
                    .await?;
                Ok(())
            })
            .await
    }

    /// Attach the coach's post-session summary to an individual session.
    pub async fn record_summary(
        &self,
        slot_id: SlotId,
        actor_id: UserId,
        summary: impl Into<String>,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self.write_summary(slot_id, actor_id, summary.into()).await;
        record_operation("record_summary", started, &result);
        result
    }

    async fn write_summary(&self, slot_id: SlotId, actor_id: UserId, summary: String) -> Result<(), EngineError> {
        check_len(&summary, MAX_SUMMARY_LEN, "summary too long")?;
        let slot = self.store.get_slot(slot_id).await?;
        if !matches!(slot.kind, SlotKind::Individual(_)) {
            return Err(EngineError::Validation("summaries belong to individual sessions"));
        }
        if actor_id != slot.owner_id {
            return Err(EngineError::Unauthorized("only the owner may record a summary"));
        }
        let owner_id = slot.owner_id;

        self.guard
            .with_owner_lock(owner_id, |permit| async move {
                if self.store.get_slot(slot_id).await?.status == SlotStatus::Cancelled {
                    return Err(EngineError::Validation("slot is cancelled"));
                }
                self.store.set_summary(permit, owner_id, slot_id, summary).await?;
                Ok(())
            })
            .await
    }
}
