//! In-process storage backend.
//!
//! Flow Overview:
//! 1) Entries live in a sharded `DashMap` together with their absolute expiry.
//! 2) Reads treat expired entries as absent and drop them on the spot.
//! 3) A supervised sweeper task deletes expired entries periodically, one
//!    shard at a time. A panic inside a sweep is logged and the sweeper is
//!    restarted; dropping the store stops it.
//!
//! Without a tokio runtime at construction time no sweeper is started and
//! expiry is purely lazy.

use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{glob_to_regex, Storage};
use crate::{context::Context, error::StorageError};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

type Entries = DashMap<String, Entry>;

#[derive(Debug)]
pub struct MemoryStorage {
    entries: Arc<Entries>,
    shutdown: CancellationToken,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    #[must_use]
    pub fn with_sweep_interval(interval: Duration) -> Self {
        let storage = Self {
            entries: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(supervise_sweeper(
                    Arc::downgrade(&storage.entries),
                    storage.shutdown.clone(),
                    interval.max(Duration::from_millis(1)),
                    sweep,
                ));
            }
            Err(_) => {
                warn!("No tokio runtime available, memory storage relies on lazy expiry only");
            }
        }

        storage
    }

    /// Number of stored entries, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry now. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        sweep(&self.entries)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn set(
        &self,
        ctx: &Context,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        ctx.check()?;
        let expires_at = expiry(Instant::now(), ttl);
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn set_existing(
        &self,
        ctx: &Context,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        ctx.check()?;
        let now = Instant::now();
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(false);
        };
        if entry.is_expired(now) {
            return Ok(false);
        }
        *entry = Entry {
            value,
            expires_at: expiry(now, ttl),
        };
        Ok(true)
    }

    async fn get(&self, ctx: &Context, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        ctx.check()?;
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        // The read guard is released above; the entry may have been replaced since.
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    async fn take(&self, ctx: &Context, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        ctx.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .and_then(|(_, entry)| (!entry.is_expired(now)).then_some(entry.value)))
    }

    async fn delete(&self, ctx: &Context, key: &str) -> Result<(), StorageError> {
        ctx.check()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, ctx: &Context, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(ctx, key).await?.is_some())
    }

    async fn scan(&self, ctx: &Context, pattern: &str) -> Result<Vec<String>, StorageError> {
        ctx.check()?;
        let matcher = glob_to_regex(pattern)?;
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now) && matcher.is_match(entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

fn expiry(now: Instant, ttl: Duration) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        now.checked_add(ttl)
    }
}

fn sweep(entries: &Entries) -> usize {
    let now = Instant::now();
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    before.saturating_sub(entries.len())
}

async fn supervise_sweeper<F>(
    entries: Weak<Entries>,
    shutdown: CancellationToken,
    interval: Duration,
    sweep: F,
) where
    F: Fn(&Entries) -> usize + Clone + Send + 'static,
{
    loop {
        let task = tokio::spawn(run_sweeper(
            entries.clone(),
            shutdown.clone(),
            interval,
            sweep.clone(),
        ));
        match task.await {
            Ok(()) => return,
            Err(err) if err.is_panic() => {
                error!("Memory storage sweeper panicked, restarting: {err}");
                if shutdown.is_cancelled() {
                    return;
                }
            }
            Err(err) => {
                debug!("Memory storage sweeper stopped: {err}");
                return;
            }
        }
    }
}

async fn run_sweeper<F>(
    entries: Weak<Entries>,
    shutdown: CancellationToken,
    interval: Duration,
    sweep: F,
) where
    F: Fn(&Entries) -> usize,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let Some(entries) = entries.upgrade() else {
                    return;
                };
                let removed = sweep(&entries);
                if removed > 0 {
                    debug!(removed, "Swept expired memory storage entries");
                }
            }
        }
    }
}
