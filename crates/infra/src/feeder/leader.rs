use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

/// TTL-bounded leadership over one lock key.
///
/// Ownership is only ever proven by the store: creation with `SET NX`,
/// extension and release through the owner-checked atomic scripts. Losing
/// the lease is noticed only when a refresh fails.
pub struct LeaderLease<S: Store + ?Sized> {
    store: Arc<S>,
    key: String,
    owner: String,
    ttl: Duration,
    role: Role,
    last_refresh: Option<Instant>,
}

impl<S: Store + ?Sized> LeaderLease<S> {
    pub fn new(store: Arc<S>, key: impl Into<String>, owner: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            owner: owner.into(),
            ttl,
            role: Role::Follower,
            last_refresh: None,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Take or keep leadership.
    ///
    /// A leader refreshes its lease; a follower tries to create the lock and,
    /// failing that, to refresh it in case it still holds it from an earlier
    /// run with the same owner id. A store error demotes to follower.
    pub async fn ensure(&mut self) -> Result<Role, StoreError> {
        let result = match self.role {
            Role::Leader => self.refresh().await,
            Role::Follower => self.try_acquire().await,
        };
        match result {
            Ok(role) => Ok(role),
            Err(e) => {
                self.demote("store error while checking leadership");
                Err(e)
            }
        }
    }

    /// Refresh the lease if `interval` has passed since the last refresh.
    ///
    /// Called between dispatches of a long scan. Returns whether this
    /// process is still the leader.
    pub async fn refresh_if_due(&mut self, interval: Duration) -> Result<bool, StoreError> {
        if !self.is_leader() {
            return Ok(false);
        }
        if self.last_refresh.is_some_and(|at| at.elapsed() < interval) {
            return Ok(true);
        }
        match self.refresh().await {
            Ok(role) => Ok(role == Role::Leader),
            Err(e) => {
                self.demote("store error while refreshing lease");
                Err(e)
            }
        }
    }

    /// Give up leadership if held. Never deletes another owner's lock.
    pub async fn release(&mut self) -> Result<bool, StoreError> {
        if !self.is_leader() {
            return Ok(false);
        }
        self.role = Role::Follower;
        self.last_refresh = None;
        let released = self
            .store
            .release_leader_lock(&self.key, &self.owner)
            .await?;
        if released {
            tracing::info!(owner = %self.owner, "released feeder leadership");
        }
        Ok(released)
    }

    async fn try_acquire(&mut self) -> Result<Role, StoreError> {
        let acquired = self
            .store
            .set_if_absent(&self.key, &self.owner, self.ttl)
            .await?
            || self
                .store
                .refresh_leader_lock(&self.key, &self.owner, self.ttl)
                .await?;

        if acquired {
            tracing::info!(owner = %self.owner, ttl_secs = self.ttl.as_secs(), "acquired feeder leadership");
            self.role = Role::Leader;
            self.last_refresh = Some(Instant::now());
        } else {
            tracing::debug!(owner = %self.owner, "not leader");
        }
        Ok(self.role)
    }

    async fn refresh(&mut self) -> Result<Role, StoreError> {
        let refreshed = self
            .store
            .refresh_leader_lock(&self.key, &self.owner, self.ttl)
            .await?;
        if refreshed {
            self.last_refresh = Some(Instant::now());
        } else {
            self.demote("lease refresh rejected");
        }
        Ok(self.role)
    }

    fn demote(&mut self, reason: &'static str) {
        if self.role == Role::Leader {
            tracing::warn!(owner = %self.owner, reason, "lost feeder leadership");
        }
        self.role = Role::Follower;
        self.last_refresh = None;
    }
}
