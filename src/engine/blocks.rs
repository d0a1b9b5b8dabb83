use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use tracing::info;
use ulid::Ulid;

use crate::config::{day_span, time_range_on};
use crate::limits::*;
use crate::model::*;
use crate::observability::record_operation;

use super::conflict::{check_no_conflict, validate_span};
use super::{Engine, EngineError};

/// Turn time-of-day pairs on `date` into sorted spans that do not overlap
/// each other.
fn block_spans(date: NaiveDate, intervals: &[(NaiveTime, NaiveTime)]) -> Result<Vec<Span>, EngineError> {
    if intervals.is_empty() {
        return Err(EngineError::Validation("no intervals to block"));
    }
    if intervals.len() > MAX_BLOCKS_PER_REQUEST {
        return Err(EngineError::LimitExceeded("too many intervals"));
    }
    let mut spans = intervals
        .iter()
        .map(|&(start, end)| {
            let span = time_range_on(date, start, end)
                .ok_or(EngineError::Validation("block start must be before end"))?;
            validate_span(span.start, span.end)
        })
        .collect::<Result<Vec<_>, _>>()?;
    spans.sort_by_key(|s| s.start);
    if spans.windows(2).any(|w| w[0].overlaps(&w[1])) {
        return Err(EngineError::Validation("block intervals overlap each other"));
    }
    Ok(spans)
}

impl Engine {
    /// Block out `intervals` on `date`. Either every block is created or none
    /// is; any interval that overlaps an occupying slot fails the request
    /// with `TimeConflict`.
    pub async fn block_time(
        &self,
        owner_id: OwnerId,
        date: NaiveDate,
        intervals: &[(NaiveTime, NaiveTime)],
    ) -> Result<Vec<SlotId>, EngineError> {
        let started = Instant::now();
        let result = self.add_blocks(owner_id, date, intervals).await;
        record_operation("block_time", started, &result);
        result
    }

    async fn add_blocks(
        &self,
        owner_id: OwnerId,
        date: NaiveDate,
        intervals: &[(NaiveTime, NaiveTime)],
    ) -> Result<Vec<SlotId>, EngineError> {
        let spans = block_spans(date, intervals)?;
        self.require_coach(owner_id).await?;

        let slots: Vec<ReservationSlot> = spans
            .into_iter()
            .map(|span| ReservationSlot::new(Ulid::new(), owner_id, span, SlotKind::Block))
            .collect();
        let ids: Vec<SlotId> = slots.iter().map(|s| s.id).collect();

        self.guard
            .with_owner_lock(owner_id, |permit| async move {
                self.ensure_calendar_room(owner_id, slots.len()).await?;
                let existing = self.store.find_overlapping(owner_id, day_span(date)).await;
                for slot in &slots {
                    check_no_conflict(&existing, &slot.span)?;
                }
                self.store.insert_blocks(permit, owner_id, slots).await?;
                Ok(())
            })
            .await?;

        info!(%owner_id, %date, count = ids.len(), "time blocked");
        Ok(ids)
    }

    /// Remove every block starting on `date`. Sessions are left alone.
    /// Returns the number of blocks removed.
    pub async fn unblock_all(&self, owner_id: OwnerId, date: NaiveDate) -> Result<usize, EngineError> {
        let started = Instant::now();
        let result = self.remove_day_blocks(owner_id, date).await;
        record_operation("unblock_all", started, &result);
        result
    }

    async fn remove_day_blocks(&self, owner_id: OwnerId, date: NaiveDate) -> Result<usize, EngineError> {
        self.require_coach(owner_id).await?;
        let day = day_span(date);

        let removed = self
            .guard
            .with_owner_lock(owner_id, |permit| async move {
                let ids: Vec<SlotId> = self
                    .store
                    .slots_in(owner_id, day)
                    .await
                    .into_iter()
                    .filter(|s| s.is_block() && day.start <= s.span.start)
                    .map(|s| s.id)
                    .collect();
                if ids.is_empty() {
                    return Ok(0);
                }
                let count = ids.len();
                self.store.remove_blocks(permit, owner_id, ids).await?;
                Ok(count)
            })
            .await?;

        if removed > 0 {
            info!(%owner_id, %date, removed, "blocks removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::day_start_ms;

    const H: Ms = 3_600_000;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn spans_are_sorted() {
        let day = day_start_ms(date());
        let spans = block_spans(date(), &[(t(15, 0), t(16, 0)), (t(9, 0), t(10, 30))]).unwrap();
        assert_eq!(
            spans,
            vec![
                Span::new(day + 9 * H, day + 10 * H + 30 * 60_000),
                Span::new(day + 15 * H, day + 16 * H),
            ]
        );
    }

    #[test]
    fn adjacent_intervals_are_fine() {
        assert!(block_spans(date(), &[(t(9, 0), t(10, 0)), (t(10, 0), t(11, 0))]).is_ok());
    }

    #[test]
    fn rejects_overlapping_inverted_and_empty() {
        assert!(matches!(
            block_spans(date(), &[(t(9, 0), t(11, 0)), (t(10, 0), t(12, 0))]),
            Err(EngineError::Validation("block intervals overlap each other"))
        ));
        assert!(matches!(
            block_spans(date(), &[(t(11, 0), t(10, 0))]),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(block_spans(date(), &[]), Err(EngineError::Validation(_))));
    }

    #[test]
    fn rejects_too_many_intervals() {
        let many: Vec<_> = (0..=MAX_BLOCKS_PER_REQUEST as u32)
            .map(|i| (t(i / 6, (i % 6) * 10), t(i / 6, (i % 6) * 10 + 5)))
            .collect();
        assert!(matches!(
            block_spans(date(), &many),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
