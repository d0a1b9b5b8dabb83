use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub type OwnerId = Ulid;
pub type UserId = Ulid;
pub type SlotId = Ulid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Like `new`, but returns `None` for empty or inverted ranges.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndividualDetail {
    pub pre_notes: String,
    /// Written by the coach after the session.
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDetail {
    pub title: String,
    pub description: String,
    pub image: Option<String>,
}

/// What a slot represents on the owner's calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotKind {
    /// One-on-one session; capacity is always 1.
    Individual(IndividualDetail),
    /// Group session admitting up to `capacity` participants.
    Group { detail: GroupDetail, capacity: u32 },
    /// Owner's own unavailability.
    Block,
}

impl SlotKind {
    pub fn capacity(&self) -> u32 {
        match self {
            SlotKind::Individual(_) => 1,
            SlotKind::Group { capacity, .. } => *capacity,
            SlotKind::Block => 0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SlotKind::Individual(_) => "individual",
            SlotKind::Group { .. } => "group",
            SlotKind::Block => "block",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Open,
    Closed,
    Cancelled,
}

/// The unit of calendar occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSlot {
    pub id: SlotId,
    pub owner_id: OwnerId,
    pub span: Span,
    pub kind: SlotKind,
    pub status: SlotStatus,
    /// Handle issued by the video-session collaborator, if any.
    pub session_id: Option<String>,
}

impl ReservationSlot {
    pub fn new(id: SlotId, owner_id: OwnerId, span: Span, kind: SlotKind) -> Self {
        Self {
            id,
            owner_id,
            span,
            kind,
            status: SlotStatus::Open,
            session_id: None,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self.kind, SlotKind::Block)
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, SlotKind::Group { .. })
    }

    /// Blocks always occupy; sessions occupy until cancelled (a closed group
    /// session still takes place).
    pub fn occupies(&self) -> bool {
        self.is_block() || self.status != SlotStatus::Cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub slot_id: SlotId,
    pub user_id: UserId,
}

/// All slots and participants of one owner.
#[derive(Debug, Clone)]
pub struct Calendar {
    pub owner_id: OwnerId,
    /// Sorted by `span.start`.
    pub slots: Vec<ReservationSlot>,
    /// Join records, keyed by slot, in join order.
    pub participants: HashMap<SlotId, Vec<UserId>>,
}

impl Calendar {
    pub fn new(owner_id: OwnerId) -> Self {
        Self {
            owner_id,
            slots: Vec::new(),
            participants: HashMap::new(),
        }
    }

    /// Insert slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: ReservationSlot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, id: SlotId) -> Option<ReservationSlot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        self.participants.remove(&id);
        Some(self.slots.remove(pos))
    }

    pub fn slot(&self, id: SlotId) -> Option<&ReservationSlot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn slot_mut(&mut self, id: SlotId) -> Option<&mut ReservationSlot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }

    pub fn participant_count(&self, slot_id: SlotId) -> usize {
        self.participants.get(&slot_id).map_or(0, Vec::len)
    }

    pub fn has_participant(&self, slot_id: SlotId, user_id: UserId) -> bool {
        self.participants
            .get(&slot_id)
            .is_some_and(|users| users.contains(&user_id))
    }

    /// Every slot whose span overlaps the query window, in start order.
    /// Uses binary search to skip slots starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &ReservationSlot> {
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
/// Each event is one atomic write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Individual slot together with its sole participant.
    BookingCreated {
        slot: ReservationSlot,
        participant: UserId,
    },
    GroupSessionCreated {
        slot: ReservationSlot,
    },
    BlocksAdded {
        owner_id: OwnerId,
        slots: Vec<ReservationSlot>,
    },
    BlocksRemoved {
        owner_id: OwnerId,
        ids: Vec<SlotId>,
    },
    /// Status → Cancelled and all participants dropped.
    SlotCancelled {
        owner_id: OwnerId,
        slot_id: SlotId,
    },
    /// `closes` is set when this join fills the session.
    ParticipantJoined {
        owner_id: OwnerId,
        slot_id: SlotId,
        user_id: UserId,
        closes: bool,
    },
    SessionHandleAssigned {
        owner_id: OwnerId,
        slot_id: SlotId,
        session_id: String,
    },
    SummaryRecorded {
        owner_id: OwnerId,
        slot_id: SlotId,
        summary: String,
    },
    /// Written only by compaction: a slot as it stands, with its participants.
    SlotRestored {
        slot: ReservationSlot,
        participants: Vec<UserId>,
    },
}

impl Event {
    pub fn owner_id(&self) -> OwnerId {
        match self {
            Event::BookingCreated { slot, .. }
            | Event::GroupSessionCreated { slot }
            | Event::SlotRestored { slot, .. } => slot.owner_id,
            Event::BlocksAdded { owner_id, .. }
            | Event::BlocksRemoved { owner_id, .. }
            | Event::SlotCancelled { owner_id, .. }
            | Event::ParticipantJoined { owner_id, .. }
            | Event::SessionHandleAssigned { owner_id, .. }
            | Event::SummaryRecorded { owner_id, .. } => *owner_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Outcome of a successful group join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub slot_id: SlotId,
    /// Participant count after this join.
    pub participants: u32,
    /// True when this join filled the session.
    pub closed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(start: Ms, end: Ms, kind: SlotKind) -> ReservationSlot {
        ReservationSlot::new(Ulid::new(), Ulid::new(), Span::new(start, end), kind)
    }

    fn individual(start: Ms, end: Ms) -> ReservationSlot {
        slot(
            start,
            end,
            SlotKind::Individual(IndividualDetail {
                pre_notes: String::new(),
                summary: None,
            }),
        )
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_checked_rejects_empty() {
        assert!(Span::checked(100, 100).is_none());
        assert!(Span::checked(200, 100).is_none());
        assert_eq!(Span::checked(100, 200), Some(Span::new(100, 200)));
    }

    #[test]
    fn occupancy_rule() {
        let mut s = individual(0, 10);
        assert!(s.occupies());
        s.status = SlotStatus::Cancelled;
        assert!(!s.occupies());

        let mut g = slot(
            0,
            10,
            SlotKind::Group {
                detail: GroupDetail {
                    title: "Yoga".into(),
                    description: String::new(),
                    image: None,
                },
                capacity: 3,
            },
        );
        g.status = SlotStatus::Closed;
        assert!(g.occupies()); // session still happens

        let mut b = slot(0, 10, SlotKind::Block);
        b.status = SlotStatus::Cancelled;
        assert!(b.occupies());
    }

    #[test]
    fn slots_kept_sorted() {
        let mut cal = Calendar::new(Ulid::new());
        cal.insert_slot(individual(300, 400));
        cal.insert_slot(individual(100, 200));
        cal.insert_slot(individual(200, 300));
        let starts: Vec<Ms> = cal.slots.iter().map(|s| s.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut cal = Calendar::new(Ulid::new());
        cal.insert_slot(individual(100, 200));
        cal.insert_slot(individual(450, 600));
        cal.insert_slot(individual(1000, 1100));

        let hits: Vec<_> = cal.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut cal = Calendar::new(Ulid::new());
        cal.insert_slot(individual(100, 200));
        assert_eq!(cal.overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn remove_slot_drops_participants() {
        let mut cal = Calendar::new(Ulid::new());
        let s = individual(0, 10);
        let id = s.id;
        cal.insert_slot(s);
        cal.participants.insert(id, vec![Ulid::new()]);
        assert_eq!(cal.participant_count(id), 1);

        assert!(cal.remove_slot(id).is_some());
        assert_eq!(cal.participant_count(id), 0);
        assert!(cal.remove_slot(id).is_none());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            slot: individual(0, 3_600_000),
            participant: Ulid::new(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
