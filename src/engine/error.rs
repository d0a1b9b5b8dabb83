use thiserror::Error;
use ulid::Ulid;

use crate::model::{SlotId, UserId};

/// Business-level collision, reported to the caller and never retried here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConflictKind {
    #[error("time conflict with slot {0}")]
    TimeConflict(SlotId),
    #[error("session full: capacity {0} reached")]
    CapacityFull(u32),
    #[error("user {0} already joined this session")]
    DuplicateJoin(UserId),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("not authorized: {0}")]
    Unauthorized(&'static str),
    #[error("conflict: {0}")]
    Conflict(#[from] ConflictKind),
    #[error("lock on {key} not acquired after {attempts} attempts")]
    Concurrency { key: Ulid, attempts: u32 },
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl EngineError {
    /// Only lock timeouts are worth retrying; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Concurrency { .. })
    }

    /// Short label for metrics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::Conflict(ConflictKind::TimeConflict(_)) => "time_conflict",
            EngineError::Conflict(ConflictKind::CapacityFull(_)) => "capacity_full",
            EngineError::Conflict(ConflictKind::DuplicateJoin(_)) => "duplicate_join",
            EngineError::Concurrency { .. } => "concurrency",
            EngineError::Persistence(_) => "persistence",
        }
    }
}

/// Failures reported by the reservation store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("{0}")]
    Persistence(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::Persistence(msg) => EngineError::Persistence(msg),
        }
    }
}
