use std::time::Instant;

use chrono::NaiveDate;

use crate::config::day_span;
use crate::limits::*;
use crate::model::*;
use crate::observability::record_operation;

use super::{Engine, EngineError};

// ── Availability Algorithm ────────────────────────────────────────

/// Buckets that overlap none of `occupied`, in their original order.
///
/// `buckets` must be sorted and disjoint; `occupied` is sorted by start
/// (overlaps allowed).
pub fn free_buckets(buckets: &[Span], occupied: &[Span]) -> Vec<Span> {
    let busy = merge_overlapping(occupied);
    let mut result = Vec::with_capacity(buckets.len());
    let mut ri = 0;

    for &bucket in buckets {
        while ri < busy.len() && busy[ri].end <= bucket.start {
            ri += 1;
        }
        let taken = busy.get(ri).is_some_and(|b| b.overlaps(&bucket));
        if !taken {
            result.push(bucket);
        }
    }

    result
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

impl Engine {
    /// Occupied spans of `owner_id` on `date`, sorted by start.
    async fn occupied_on(&self, owner_id: OwnerId, date: NaiveDate) -> Vec<Span> {
        self.store
            .find_overlapping(owner_id, day_span(date))
            .await
            .into_iter()
            .map(|slot| slot.span)
            .collect()
    }

    /// Working-hours buckets on `date` not touched by any occupying slot.
    ///
    /// Takes no scoped lock. A commit that lands during the read may be
    /// missed, but a half-applied one is never seen.
    pub async fn compute_availability(&self, owner_id: OwnerId, date: NaiveDate) -> Result<Vec<Span>, EngineError> {
        let started = Instant::now();
        let result = async {
            self.require_coach(owner_id).await?;
            let buckets = self.working_hours.buckets(date);
            let occupied = self.occupied_on(owner_id, date).await;
            Ok::<_, EngineError>(free_buckets(&buckets, &occupied))
        }
        .await;
        record_operation("compute_availability", started, &result);
        result
    }

    /// Continuous free time within working hours on `date`, dropping
    /// windows shorter than `min_duration`.
    pub async fn compute_free_windows(
        &self,
        owner_id: OwnerId,
        date: NaiveDate,
        min_duration: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let started = Instant::now();
        let result = async {
            if let Some(min) = min_duration {
                if min <= 0 {
                    return Err(EngineError::Validation("min_duration must be positive"));
                }
                if min > MAX_SPAN_DURATION_MS {
                    return Err(EngineError::LimitExceeded("min_duration too long"));
                }
            }
            self.require_coach(owner_id).await?;
            let window = self.working_hours.window(date);
            let occupied = merge_overlapping(&self.occupied_on(owner_id, date).await);
            let mut free = subtract_intervals(&[window], &occupied);
            if let Some(min) = min_duration {
                free.retain(|s| s.duration_ms() >= min);
            }
            Ok(free)
        }
        .await;
        record_operation("compute_free_windows", started, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    fn hourly(from: Ms, to: Ms) -> Vec<Span> {
        (from..to).map(|h| Span::new(h * H, (h + 1) * H)).collect()
    }

    // ── free_buckets ──────────────────────────────────────

    #[test]
    fn free_buckets_nothing_occupied() {
        let buckets = hourly(9, 18);
        assert_eq!(free_buckets(&buckets, &[]), buckets);
    }

    #[test]
    fn free_buckets_drops_partially_covered() {
        let buckets = hourly(9, 13);
        // 10:30-11:15 touches both the 10:00 and 11:00 buckets.
        let occupied = vec![Span::new(10 * H + 30 * M, 11 * H + 15 * M)];
        assert_eq!(
            free_buckets(&buckets, &occupied),
            vec![Span::new(9 * H, 10 * H), Span::new(12 * H, 13 * H)]
        );
    }

    #[test]
    fn free_buckets_adjacent_slot_keeps_bucket() {
        let buckets = hourly(9, 11);
        let occupied = vec![Span::new(8 * H, 9 * H), Span::new(11 * H, 12 * H)];
        assert_eq!(free_buckets(&buckets, &occupied), buckets);
    }

    #[test]
    fn free_buckets_overlapping_occupied_spans() {
        let buckets = hourly(9, 15);
        let occupied = vec![
            Span::new(9 * H, 11 * H),
            Span::new(10 * H, 10 * H + 30 * M),
            Span::new(13 * H + 59 * M, 14 * H + M),
        ];
        assert_eq!(
            free_buckets(&buckets, &occupied),
            vec![Span::new(11 * H, 12 * H), Span::new(12 * H, 13 * H)]
        );
    }

    #[test]
    fn free_buckets_long_slot_covers_many() {
        let buckets = hourly(9, 18);
        let occupied = vec![Span::new(0, 24 * H)];
        assert!(free_buckets(&buckets, &occupied).is_empty());
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        let result = subtract_intervals(&base, &remove);
        assert_eq!(result, base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        let result = subtract_intervals(&base, &remove);
        assert!(result.is_empty());
    }

    #[test]
    fn subtract_partial_left() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 150)];
        let result = subtract_intervals(&base, &remove);
        assert_eq!(result, vec![Span::new(150, 200)]);
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Span::new(100, 300)];
        let remove = vec![Span::new(150, 200)];
        let result = subtract_intervals(&base, &remove);
        assert_eq!(result, vec![Span::new(100, 150), Span::new(200, 300)]);
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![
            Span::new(100, 200),
            Span::new(400, 500),
            Span::new(800, 900),
        ];
        let result = subtract_intervals(&base, &remove);
        assert_eq!(
            result,
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![
            Span::new(100, 300),
            Span::new(200, 400),
            Span::new(500, 600),
        ];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 400), Span::new(500, 600)]);
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 300)]);
    }
}
