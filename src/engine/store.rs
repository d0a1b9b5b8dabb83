use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::warn;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use super::conflict::LockPermit;
use super::error::StoreError;
use super::{wal_writer_loop, WalCommand};

pub type SharedCalendar = Arc<RwLock<Calendar>>;

/// Result of the conditional participant insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined { participants: u32, closed: bool },
    Duplicate,
    Full { capacity: u32 },
    /// Cancelled, or not a group session.
    NotOpen,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub owners: usize,
    pub slots: usize,
    pub participants: usize,
    /// Events read back from the log when the store was opened.
    pub replayed_events: usize,
    pub torn_tail: bool,
}

/// Apply an event to its owner's calendar (no locking; caller holds the lock).
fn apply_event(cal: &mut Calendar, event: &Event, slot_owner: &DashMap<SlotId, OwnerId>) {
    match event {
        Event::BookingCreated { slot, participant } => {
            slot_owner.insert(slot.id, slot.owner_id);
            cal.participants.insert(slot.id, vec![*participant]);
            cal.insert_slot(slot.clone());
        }
        Event::GroupSessionCreated { slot } => {
            slot_owner.insert(slot.id, slot.owner_id);
            cal.insert_slot(slot.clone());
        }
        Event::BlocksAdded { slots, .. } => {
            for slot in slots {
                slot_owner.insert(slot.id, slot.owner_id);
                cal.insert_slot(slot.clone());
            }
        }
        Event::BlocksRemoved { ids, .. } => {
            for id in ids {
                cal.remove_slot(*id);
                slot_owner.remove(id);
            }
        }
        Event::SlotCancelled { slot_id, .. } => {
            if let Some(slot) = cal.slot_mut(*slot_id) {
                slot.status = SlotStatus::Cancelled;
            }
            cal.participants.remove(slot_id);
        }
        Event::ParticipantJoined {
            slot_id,
            user_id,
            closes,
            ..
        } => {
            cal.participants.entry(*slot_id).or_default().push(*user_id);
            if *closes
                && let Some(slot) = cal.slot_mut(*slot_id)
            {
                slot.status = SlotStatus::Closed;
            }
        }
        Event::SessionHandleAssigned {
            slot_id,
            session_id,
            ..
        } => {
            if let Some(slot) = cal.slot_mut(*slot_id) {
                slot.session_id = Some(session_id.clone());
            }
        }
        Event::SummaryRecorded {
            slot_id, summary, ..
        } => {
            if let Some(slot) = cal.slot_mut(*slot_id)
                && let SlotKind::Individual(detail) = &mut slot.kind
            {
                detail.summary = Some(summary.clone());
            }
        }
        Event::SlotRestored { slot, participants } => {
            slot_owner.insert(slot.id, slot.owner_id);
            if !participants.is_empty() {
                cal.participants.insert(slot.id, participants.clone());
            }
            cal.insert_slot(slot.clone());
        }
    }
}

/// Durable reservation state: per-owner calendars in memory, every change
/// written ahead to the WAL.
///
/// Writes take a `LockPermit` from the conflict guard and go through
/// `commit`, which runs WAL append, apply and notify in a detached task that
/// owns the permit. A caller that gives up mid-commit therefore never leaves
/// a half-applied write, and the lock is only released once the write is done.
pub struct ReservationStore {
    calendars: DashMap<OwnerId, SharedCalendar>,
    /// Reverse lookup: slot id → owner id.
    slot_owner: DashMap<SlotId, OwnerId>,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
    /// Commits hold it shared; compaction holds it exclusively so no event
    /// lands between the snapshot and the file swap.
    commit_gate: RwLock<()>,
    replayed_events: usize,
    torn_tail: bool,
}

impl ReservationStore {
    /// Replay the WAL at `path` and start the group-commit writer.
    /// Must be called from within a tokio runtime.
    pub fn open(path: &Path, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let replay = Wal::replay(path)?;
        if replay.torn_tail {
            warn!(
                path = %path.display(),
                kept = replay.events.len(),
                "discarding torn final WAL record"
            );
            Wal::rewrite(path, &replay.events)?;
        }

        let slot_owner = DashMap::new();
        let mut calendars: HashMap<OwnerId, Calendar> = HashMap::new();
        for event in &replay.events {
            let owner_id = event.owner_id();
            let cal = calendars
                .entry(owner_id)
                .or_insert_with(|| Calendar::new(owner_id));
            apply_event(cal, event, &slot_owner);
        }

        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            calendars: calendars
                .into_iter()
                .map(|(id, cal)| (id, Arc::new(RwLock::new(cal))))
                .collect(),
            slot_owner,
            wal_tx,
            notify,
            commit_gate: RwLock::new(()),
            replayed_events: replay.events.len(),
            torn_tail: replay.torn_tail,
        })
    }

    // ── Lookup ───────────────────────────────────────────────

    fn calendar(&self, owner_id: OwnerId) -> Option<SharedCalendar> {
        self.calendars.get(&owner_id).map(|e| e.value().clone())
    }

    fn calendar_or_create(&self, owner_id: OwnerId) -> SharedCalendar {
        self.calendars
            .entry(owner_id)
            .or_insert_with(|| Arc::new(RwLock::new(Calendar::new(owner_id))))
            .clone()
    }

    pub fn owner_of(&self, slot_id: SlotId) -> Option<OwnerId> {
        self.slot_owner.get(&slot_id).map(|e| *e.value())
    }

    async fn with_slot<T>(
        &self,
        slot_id: SlotId,
        f: impl FnOnce(&Calendar, &ReservationSlot) -> T,
    ) -> Result<T, StoreError> {
        let owner_id = self.owner_of(slot_id).ok_or(StoreError::NotFound(slot_id))?;
        let cal = self.calendar(owner_id).ok_or(StoreError::NotFound(slot_id))?;
        let guard = cal.read().await;
        let slot = guard.slot(slot_id).ok_or(StoreError::NotFound(slot_id))?;
        Ok(f(&guard, slot))
    }

    // ── Reads ────────────────────────────────────────────────

    /// Slots of `owner_id` overlapping `span` that still occupy the calendar.
    pub async fn find_overlapping(&self, owner_id: OwnerId, span: Span) -> Vec<ReservationSlot> {
        let Some(cal) = self.calendar(owner_id) else {
            return Vec::new();
        };
        let guard = cal.read().await;
        guard
            .overlapping(&span)
            .filter(|s| s.occupies())
            .cloned()
            .collect()
    }

    /// Every slot overlapping `span`, cancelled ones included.
    pub async fn slots_in(&self, owner_id: OwnerId, span: Span) -> Vec<ReservationSlot> {
        let Some(cal) = self.calendar(owner_id) else {
            return Vec::new();
        };
        let guard = cal.read().await;
        guard.overlapping(&span).cloned().collect()
    }

    pub async fn get_slot(&self, slot_id: SlotId) -> Result<ReservationSlot, StoreError> {
        self.with_slot(slot_id, |_, slot| slot.clone()).await
    }

    pub async fn count_participants(&self, slot_id: SlotId) -> Result<u32, StoreError> {
        self.with_slot(slot_id, |cal, _| cal.participant_count(slot_id) as u32)
            .await
    }

    pub async fn participants(&self, slot_id: SlotId) -> Result<Vec<Participant>, StoreError> {
        self.with_slot(slot_id, |cal, _| {
            cal.participants
                .get(&slot_id)
                .map(|users| {
                    users
                        .iter()
                        .map(|&user_id| Participant { slot_id, user_id })
                        .collect()
                })
                .unwrap_or_default()
        })
        .await
    }

    pub async fn slot_count(&self, owner_id: OwnerId) -> usize {
        match self.calendar(owner_id) {
            Some(cal) => cal.read().await.slots.len(),
            None => 0,
        }
    }

    pub async fn stats(&self) -> StoreStats {
        let calendars: Vec<SharedCalendar> =
            self.calendars.iter().map(|e| e.value().clone()).collect();
        let mut stats = StoreStats {
            owners: calendars.len(),
            replayed_events: self.replayed_events,
            torn_tail: self.torn_tail,
            ..StoreStats::default()
        };
        for cal in calendars {
            let guard = cal.read().await;
            stats.slots += guard.slots.len();
            stats.participants += guard.participants.values().map(Vec::len).sum::<usize>();
        }
        stats
    }

    // ── Writes ───────────────────────────────────────────────

    /// WAL-append + apply + notify as one unit, holding `permits` until done.
    async fn commit(
        self: &Arc<Self>,
        event: Event,
        permits: Vec<LockPermit>,
    ) -> Result<(), StoreError> {
        let store = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _permits = permits;
            let _gate = store.commit_gate.read().await;
            store.wal_append(&event).await?;
            store.apply(&event).await;
            store.notify.send(&event);
            Ok::<(), StoreError>(())
        });
        task.await
            .map_err(|e| StoreError::Persistence(format!("commit task failed: {e}")))?
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Persistence(format!("WAL append failed: {e}")))
    }

    async fn apply(&self, event: &Event) {
        let cal = self.calendar_or_create(event.owner_id());
        let mut guard = cal.write().await;
        apply_event(&mut guard, event, &self.slot_owner);
    }

    /// New Individual slot together with its sole participant.
    pub async fn insert_slot_with_participant(
        self: &Arc<Self>,
        permit: LockPermit,
        slot: ReservationSlot,
        participant: Participant,
    ) -> Result<(), StoreError> {
        debug_assert_eq!(permit.key(), slot.owner_id);
        debug_assert_eq!(participant.slot_id, slot.id);
        let event = Event::BookingCreated {
            slot,
            participant: participant.user_id,
        };
        self.commit(event, vec![permit]).await
    }

    /// New Group or Block slot with no participants.
    pub async fn insert_slot_only(
        self: &Arc<Self>,
        permit: LockPermit,
        slot: ReservationSlot,
    ) -> Result<(), StoreError> {
        debug_assert_eq!(permit.key(), slot.owner_id);
        let event = match slot.kind {
            SlotKind::Group { .. } => Event::GroupSessionCreated { slot },
            SlotKind::Block => Event::BlocksAdded {
                owner_id: slot.owner_id,
                slots: vec![slot],
            },
            SlotKind::Individual(_) => {
                return Err(StoreError::Persistence(
                    "individual slots are written with their participant".into(),
                ));
            }
        };
        self.commit(event, vec![permit]).await
    }

    /// Several blocks as one write.
    pub async fn insert_blocks(
        self: &Arc<Self>,
        permit: LockPermit,
        owner_id: OwnerId,
        slots: Vec<ReservationSlot>,
    ) -> Result<(), StoreError> {
        debug_assert!(slots.iter().all(|s| s.is_block() && s.owner_id == owner_id));
        self.commit(Event::BlocksAdded { owner_id, slots }, vec![permit])
            .await
    }

    pub async fn remove_blocks(
        self: &Arc<Self>,
        permit: LockPermit,
        owner_id: OwnerId,
        ids: Vec<SlotId>,
    ) -> Result<(), StoreError> {
        self.commit(Event::BlocksRemoved { owner_id, ids }, vec![permit])
            .await
    }

    /// Status → Cancelled and participants deleted, in one write.
    pub async fn cancel_slot(
        self: &Arc<Self>,
        permits: Vec<LockPermit>,
        owner_id: OwnerId,
        slot_id: SlotId,
    ) -> Result<(), StoreError> {
        self.commit(Event::SlotCancelled { owner_id, slot_id }, permits)
            .await
    }

    /// Count check and insert as one conditional write. The caller holds the
    /// session permit, so nothing else changes this slot's participants or
    /// status between the check and the commit.
    pub async fn insert_participant_if_under_capacity(
        self: &Arc<Self>,
        permit: LockPermit,
        slot_id: SlotId,
        user_id: UserId,
    ) -> Result<JoinOutcome, StoreError> {
        debug_assert_eq!(permit.key(), slot_id);
        let (owner_id, count, capacity) = {
            let owner_id = self.owner_of(slot_id).ok_or(StoreError::NotFound(slot_id))?;
            let cal = self.calendar(owner_id).ok_or(StoreError::NotFound(slot_id))?;
            let guard = cal.read().await;
            let slot = guard.slot(slot_id).ok_or(StoreError::NotFound(slot_id))?;
            if !slot.is_group() || slot.status == SlotStatus::Cancelled {
                return Ok(JoinOutcome::NotOpen);
            }
            if guard.has_participant(slot_id, user_id) {
                return Ok(JoinOutcome::Duplicate);
            }
            let capacity = slot.kind.capacity();
            let count = guard.participant_count(slot_id) as u32;
            if slot.status == SlotStatus::Closed || count >= capacity {
                return Ok(JoinOutcome::Full { capacity });
            }
            (owner_id, count, capacity)
        };

        let participants = count + 1;
        let closed = participants == capacity;
        let event = Event::ParticipantJoined {
            owner_id,
            slot_id,
            user_id,
            closes: closed,
        };
        self.commit(event, vec![permit]).await?;
        Ok(JoinOutcome::Joined {
            participants,
            closed,
        })
    }

    pub async fn set_session_handle(
        self: &Arc<Self>,
        permit: LockPermit,
        owner_id: OwnerId,
        slot_id: SlotId,
        session_id: String,
    ) -> Result<(), StoreError> {
        let event = Event::SessionHandleAssigned {
            owner_id,
            slot_id,
            session_id,
        };
        self.commit(event, vec![permit]).await
    }

    pub async fn set_summary(
        self: &Arc<Self>,
        permit: LockPermit,
        owner_id: OwnerId,
        slot_id: SlotId,
        summary: String,
    ) -> Result<(), StoreError> {
        let event = Event::SummaryRecorded {
            owner_id,
            slot_id,
            summary,
        };
        self.commit(event, vec![permit]).await
    }

    // ── Maintenance ──────────────────────────────────────────

    /// Rewrite the WAL as one `SlotRestored` per live slot. Returns the
    /// number of events written.
    pub async fn compact(&self) -> Result<usize, StoreError> {
        let _gate = self.commit_gate.write().await;

        let calendars: Vec<SharedCalendar> =
            self.calendars.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for cal in calendars {
            let guard = cal.read().await;
            for slot in &guard.slots {
                events.push(Event::SlotRestored {
                    slot: slot.clone(),
                    participants: guard.participants.get(&slot.id).cloned().unwrap_or_default(),
                });
            }
        }
        let written = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Persistence(format!("WAL compaction failed: {e}")))?;
        Ok(written)
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
