use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::ConflictKind;
use super::EngineError;

/// Checks a requested `[start, end)` and returns it as a span.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::checked(start, end).ok_or(EngineError::Validation("start must be before end"))?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

/// The overlap rule: any occupying slot that overlaps `span` is a conflict.
/// Blocks occupy regardless of status; sessions until cancelled.
pub(crate) fn check_no_conflict<'a>(
    existing: impl IntoIterator<Item = &'a ReservationSlot>,
    span: &Span,
) -> Result<(), EngineError> {
    for slot in existing {
        if slot.occupies() && slot.span.overlaps(span) {
            return Err(ConflictKind::TimeConflict(slot.id).into());
        }
    }
    Ok(())
}

/// Proof that the holder is the only writer for `key`. Dropping it releases
/// the lock, so every exit path unlocks.
pub struct LockPermit {
    key: Ulid,
    scope: &'static str,
    _guard: OwnedMutexGuard<()>,
}

impl LockPermit {
    pub fn key(&self) -> Ulid {
        self.key
    }

    pub fn scope(&self) -> &'static str {
        self.scope
    }
}

/// One async mutex per key, created on first use and dropped again once
/// nobody holds or waits on it.
pub struct KeyedLocks {
    scope: &'static str,
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
    timeout: Duration,
    retries: u32,
}

impl KeyedLocks {
    pub fn new(scope: &'static str, timeout: Duration, retries: u32) -> Self {
        Self {
            scope,
            locks: DashMap::new(),
            timeout,
            retries,
        }
    }

    /// Wait up to `timeout` per attempt, `1 + retries` attempts in total.
    pub async fn acquire(&self, key: Ulid) -> Result<LockPermit, EngineError> {
        let mutex = self.locks.entry(key).or_default().clone();
        let started = Instant::now();
        let attempts = self.retries + 1;

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.timeout, mutex.clone().lock_owned()).await {
                Ok(guard) => {
                    metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS, "scope" => self.scope)
                        .record(started.elapsed().as_secs_f64());
                    return Ok(LockPermit {
                        key,
                        scope: self.scope,
                        _guard: guard,
                    });
                }
                Err(_) => {
                    metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL, "scope" => self.scope)
                        .increment(1);
                    warn!(scope = self.scope, %key, attempt, "lock wait timed out");
                }
            }
        }
        Err(EngineError::Concurrency { key, attempts })
    }

    /// Run `f` while holding the lock for `key`. `f` receives the permit and
    /// either hands it to a commit or drops it.
    pub async fn with_lock<F, Fut, T>(&self, key: Ulid, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(LockPermit) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let permit = self.acquire(key).await?;
        let result = f(permit).await;
        self.forget(&key);
        result
    }

    /// Drop the mutex for `key` unless someone holds or waits on it.
    fn forget(&self, key: &Ulid) {
        self.locks
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Serialization points for writes: one lock per calendar owner (bookings,
/// blocks, cancellation) and one per group session (admission).
///
/// Lock order is owner before session. Admission takes only the session
/// lock, so the two never deadlock.
pub struct ConflictGuard {
    owners: KeyedLocks,
    sessions: KeyedLocks,
}

impl ConflictGuard {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self {
            owners: KeyedLocks::new("owner", timeout, retries),
            sessions: KeyedLocks::new("session", timeout, retries),
        }
    }

    pub async fn with_owner_lock<F, Fut, T>(&self, owner_id: OwnerId, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(LockPermit) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.owners.with_lock(owner_id, f).await
    }

    pub async fn with_session_lock<F, Fut, T>(&self, slot_id: SlotId, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(LockPermit) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.sessions.with_lock(slot_id, f).await
    }

    pub fn owner_lock_count(&self) -> usize {
        self.owners.len()
    }

    pub fn session_lock_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const H: Ms = 3_600_000;
    const T0: Ms = 1_750_000_000_000;

    fn slot(start: Ms, end: Ms, kind: SlotKind, status: SlotStatus) -> ReservationSlot {
        let mut s = ReservationSlot::new(Ulid::new(), Ulid::new(), Span::new(start, end), kind);
        s.status = status;
        s
    }

    fn individual() -> SlotKind {
        SlotKind::Individual(IndividualDetail {
            pre_notes: String::new(),
            summary: None,
        })
    }

    #[test]
    fn validate_span_rejects_inverted_and_out_of_range() {
        assert!(matches!(validate_span(T0, T0), Err(EngineError::Validation(_))));
        assert!(matches!(validate_span(T0 + H, T0), Err(EngineError::Validation(_))));
        assert!(matches!(
            validate_span(0, H),
            Err(EngineError::LimitExceeded("timestamp out of range"))
        ));
        assert!(matches!(
            validate_span(T0, T0 + MAX_SPAN_DURATION_MS + 1),
            Err(EngineError::LimitExceeded("span too wide"))
        ));
        assert_eq!(validate_span(T0, T0 + H).unwrap(), Span::new(T0, T0 + H));
    }

    #[test]
    fn conflict_rule_by_kind_and_status() {
        let window = Span::new(T0, T0 + H);
        let open = slot(T0, T0 + H, individual(), SlotStatus::Open);
        let cancelled = slot(T0, T0 + H, individual(), SlotStatus::Cancelled);
        let cancelled_block = slot(T0, T0 + H, SlotKind::Block, SlotStatus::Cancelled);
        let adjacent = slot(T0 + H, T0 + 2 * H, SlotKind::Block, SlotStatus::Open);

        assert!(check_no_conflict([&cancelled], &window).is_ok());
        assert!(check_no_conflict([&adjacent], &window).is_ok());
        assert!(matches!(
            check_no_conflict([&cancelled, &open], &window),
            Err(EngineError::Conflict(ConflictKind::TimeConflict(id))) if id == open.id
        ));
        assert!(check_no_conflict([&cancelled_block], &window).is_err());
    }

    #[tokio::test]
    async fn lock_times_out_after_retries() {
        let locks = KeyedLocks::new("owner", Duration::from_millis(20), 2);
        let key = Ulid::new();
        let _held = locks.acquire(key).await.unwrap();

        let result = locks.acquire(key).await;
        match result {
            Err(EngineError::Concurrency { key: k, attempts }) => {
                assert_eq!(k, key);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected concurrency error, got {:?}", other.map(|p| p.key())),
        }
    }

    #[tokio::test]
    async fn lock_released_on_error_path() {
        let locks = KeyedLocks::new("owner", Duration::from_millis(50), 0);
        let key = Ulid::new();

        let result: Result<(), EngineError> = locks
            .with_lock(key, |_permit| async { Err(EngineError::Validation("boom")) })
            .await;
        assert!(result.is_err());

        // Would time out if the permit leaked.
        let permit = locks.acquire(key).await.unwrap();
        assert_eq!(permit.scope(), "owner");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn with_lock_serializes_same_key() {
        let locks = Arc::new(KeyedLocks::new("owner", Duration::from_secs(5), 0));
        let inside = Arc::new(AtomicU32::new(0));
        let max_inside = Arc::new(AtomicU32::new(0));
        let key = Ulid::new();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                locks
                    .with_lock(key, |permit| async move {
                        let _permit = permit;
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = KeyedLocks::new("owner", Duration::from_millis(20), 0);
        let _a = locks.acquire(Ulid::new()).await.unwrap();
        assert!(locks.acquire(Ulid::new()).await.is_ok());
    }

    #[tokio::test]
    async fn forget_keeps_held_locks() {
        let locks = KeyedLocks::new("session", Duration::from_millis(20), 0);
        let key = Ulid::new();
        let permit = locks.acquire(key).await.unwrap();
        locks.forget(&key);
        assert_eq!(locks.len(), 1);
        drop(permit);
        locks.forget(&key);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn with_lock_drops_idle_keys() {
        let locks = KeyedLocks::new("owner", Duration::from_millis(20), 0);
        for _ in 0..50 {
            locks
                .with_lock(Ulid::new(), |permit| async move {
                    drop(permit);
                    Ok(())
                })
                .await
                .unwrap();
        }
        let failed: Result<(), EngineError> = locks
            .with_lock(Ulid::new(), |_permit| async { Err(EngineError::Validation("boom")) })
            .await;
        assert!(failed.is_err());
        assert!(locks.is_empty());
    }
}
