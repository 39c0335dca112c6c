//! Resource throttle pool - bounds concurrent calls per external capacity unit

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Identifies one bounded resource, usually one API credential
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThrottleKey(String);

impl ThrottleKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ThrottleKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ThrottleKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&String> for ThrottleKey {
    fn from(key: &String) -> Self {
        Self(key.clone())
    }
}

/// Errors from acquiring throttle permits
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ThrottleError {
    #[error("Unknown throttle key: {0}")]
    UnknownKey(ThrottleKey),

    #[error("Throttle {0} is closed")]
    Closed(ThrottleKey),
}

/// Held permit for one throttle key; released on drop
#[derive(Debug)]
pub struct ThrottlePermit {
    key: ThrottleKey,
    _permit: OwnedSemaphorePermit,
}

impl ThrottlePermit {
    pub fn key(&self) -> &ThrottleKey {
        &self.key
    }
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        trace!(key = %self.key, "Throttle permit released");
    }
}

/// Permits for every key a step needs; released together on drop
#[derive(Debug, Default)]
pub struct PermitSet {
    permits: Vec<ThrottlePermit>,
}

impl PermitSet {
    pub fn len(&self) -> usize {
        self.permits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permits.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ThrottleKey> {
        self.permits.iter().map(ThrottlePermit::key)
    }
}

#[derive(Debug)]
struct Slot {
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

/// Fixed set of throttles, one counting semaphore per key
///
/// Capacities are set at construction and never change. Waiters are served
/// in FIFO order per key, and a waiter that is cancelled before it gets a
/// permit never holds one.
#[derive(Debug, Default)]
pub struct ThrottlePool {
    slots: HashMap<ThrottleKey, Slot>,
}

impl ThrottlePool {
    /// Create a pool from `(key, capacity)` pairs
    ///
    /// A zero capacity is raised to 1 so the key can never deadlock a step.
    pub fn new<I, K>(capacities: I) -> Self
    where
        I: IntoIterator<Item = (K, usize)>,
        K: Into<ThrottleKey>,
    {
        let slots = capacities
            .into_iter()
            .map(|(key, capacity)| {
                let capacity = capacity.max(1);
                (
                    key.into(),
                    Slot {
                        capacity,
                        semaphore: Arc::new(Semaphore::new(capacity)),
                    },
                )
            })
            .collect();
        Self { slots }
    }

    /// Create a pool from the `throttles` section of the settings
    pub fn from_settings(throttles: &BTreeMap<String, usize>) -> Self {
        Self::new(throttles.iter().map(|(key, capacity)| (key.clone(), *capacity)))
    }

    pub fn contains(&self, key: &ThrottleKey) -> bool {
        self.slots.contains_key(key)
    }

    /// Configured capacity of a key
    pub fn capacity(&self, key: &ThrottleKey) -> Option<usize> {
        self.slots.get(key).map(|slot| slot.capacity)
    }

    /// Permits currently free for a key
    pub fn available(&self, key: &ThrottleKey) -> Option<usize> {
        self.slots.get(key).map(|slot| slot.semaphore.available_permits())
    }

    /// Configured keys in sorted order
    pub fn keys(&self) -> Vec<&ThrottleKey> {
        let mut keys: Vec<_> = self.slots.keys().collect();
        keys.sort();
        keys
    }

    /// Wait for a permit on `key`
    ///
    /// Cancel-safe: dropping the returned future before it resolves leaves
    /// the waiter queue and the permit count untouched.
    pub async fn acquire(&self, key: &ThrottleKey) -> Result<ThrottlePermit, ThrottleError> {
        let slot = self
            .slots
            .get(key)
            .ok_or_else(|| ThrottleError::UnknownKey(key.clone()))?;

        let permit = slot
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ThrottleError::Closed(key.clone()))?;

        trace!(key = %key, "Throttle permit acquired");
        Ok(ThrottlePermit {
            key: key.clone(),
            _permit: permit,
        })
    }

    /// Acquire one permit for each distinct key
    ///
    /// Keys are taken in sorted order so that two callers with overlapping
    /// key sets cannot deadlock. Every key is checked before anything is
    /// acquired.
    pub async fn acquire_all(&self, keys: &[ThrottleKey]) -> Result<PermitSet, ThrottleError> {
        let mut ordered: Vec<&ThrottleKey> = keys.iter().collect();
        ordered.sort();
        ordered.dedup();

        if let Some(unknown) = ordered.iter().find(|key| !self.contains(key)) {
            return Err(ThrottleError::UnknownKey((*unknown).clone()));
        }

        let mut permits = Vec::with_capacity(ordered.len());
        for key in ordered {
            permits.push(self.acquire(key).await?);
        }
        Ok(PermitSet { permits })
    }
}
