mod admission;
mod availability;
mod blocks;
mod booking;
mod conflict;
mod error;
mod queries;
mod store;

pub use availability::{free_buckets, merge_overlapping, subtract_intervals};
pub use conflict::{ConflictGuard, KeyedLocks, LockPermit};
pub use error::{ConflictKind, EngineError, StoreError};
pub use store::{JoinOutcome, ReservationStore, StoreStats};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::config::{Config, WorkingHours};
use crate::identity::{Directory, Identity};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::record_operation;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Single flush_sync for the whole batch, rolled back on failure.
/// 4. Respond to every sender with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush failed for {} events: {e}", batch.len());
        }
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        // Compaction must see every append queued before it.
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    // All or nothing: a failed batch is cut back out of the file, so no
    // sender told `Err` can find its event on disk later.
    wal.append_batch(batch.iter().map(|(event, _)| event))
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The booking and admission engine for coach calendars.
///
/// Validation and identity checks run before any lock is taken. Writes are
/// serialized per owner (booking, blocking, cancellation) or per session
/// (admission) by the `ConflictGuard`; reads take no scoped lock.
pub struct Engine {
    pub(super) store: Arc<ReservationStore>,
    pub(super) guard: ConflictGuard,
    pub(super) directory: Arc<dyn Directory>,
    pub(super) working_hours: WorkingHours,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    /// Open the WAL at `wal_path`, replay it, and start the writer.
    /// Must be called from within a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        config: &Config,
        directory: Arc<dyn Directory>,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let store = ReservationStore::open(&wal_path, notify.clone())?;
        Ok(Self {
            store: Arc::new(store),
            guard: ConflictGuard::new(config.lock_timeout, config.lock_retries),
            directory,
            working_hours: config.working_hours,
            notify,
        })
    }

    /// Open the store under `config.data_dir`, creating the directory.
    pub fn open(config: &Config, directory: Arc<dyn Directory>) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        Self::new(config.wal_path(), config, directory, Arc::new(NotifyHub::new()))
    }

    pub fn working_hours(&self) -> WorkingHours {
        self.working_hours
    }

    /// The calendar owner must be known and hold coach capability.
    pub(super) async fn require_coach(&self, owner_id: OwnerId) -> Result<Identity, EngineError> {
        let identity = self
            .directory
            .resolve(owner_id)
            .await
            .ok_or(EngineError::NotFound(owner_id))?;
        if !identity.is_coach() {
            return Err(EngineError::Unauthorized("calendar owner must be a coach"));
        }
        Ok(identity)
    }

    pub(super) async fn require_user(&self, user_id: UserId) -> Result<Identity, EngineError> {
        self.directory
            .resolve(user_id)
            .await
            .ok_or(EngineError::NotFound(user_id))
    }

    /// Rewrite the WAL to the current state. Returns events written.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let started = Instant::now();
        let result = self.store.compact().await.map_err(EngineError::from);
        record_operation("compact_wal", started, &result);
        if let Ok(written) = &result {
            tracing::info!(written, "WAL compacted");
        }
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.store.appends_since_compact().await
    }
}
