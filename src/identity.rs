//! Identity and role lookup, owned by an external collaborator.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// May own a calendar.
    Coach,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub id: UserId,
    pub role: Role,
}

impl Identity {
    pub fn is_coach(&self) -> bool {
        self.role == Role::Coach
    }
}

/// Resolves a user id to a known identity.
#[async_trait]
pub trait Directory: Send + Sync + 'static {
    async fn resolve(&self, user_id: UserId) -> Option<Identity>;
}

/// Directory backed by a map, for embedding and tests.
#[derive(Default)]
pub struct InMemoryDirectory {
    users: DashMap<UserId, Role>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user_id: UserId, role: Role) {
        self.users.insert(user_id, role);
    }

    pub fn remove(&self, user_id: &UserId) {
        self.users.remove(user_id);
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn resolve(&self, user_id: UserId) -> Option<Identity> {
        self.users.get(&user_id).map(|role| Identity {
            id: user_id,
            role: *role,
        })
    }
}
