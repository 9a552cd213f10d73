use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use super::keys::glob_match;
use super::{CacheBackend, CacheResult};

/// How often a write also sweeps out every expired entry.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// In-process cache for tests/dev and single-instance deployments.
///
/// Expired entries are dropped lazily on read and during pattern deletion, and swept in
/// bulk by the first write after each sweep interval, so keys that are never read again
/// do not accumulate.
#[derive(Debug)]
pub struct InMemoryCacheBackend {
    entries: RwLock<HashMap<String, (String, Instant)>>,
    sweep_interval: Duration,
    next_sweep: Mutex<Option<Instant>>,
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self {
            entries: RwLock::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            next_sweep: Mutex::new(None),
        }
    }
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Remove expired entries if the sweep interval has elapsed since the last sweep.
    fn sweep_if_due(&self, entries: &mut HashMap<String, (String, Instant)>, now: Instant) {
        let mut next_sweep = self.next_sweep.lock();
        match *next_sweep {
            Some(due) if now < due => return,
            None => {
                *next_sweep = Some(now + self.sweep_interval);
                return;
            }
            Some(_) => {}
        }
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        *next_sweep = Some(now + self.sweep_interval);
        tracing::trace!(removed = before - entries.len(), "expired entries swept");
    }

    /// Live (unexpired) entry count.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.read().values().filter(|(_, exp)| *exp > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some((value, expires_at)) if *expires_at > now => return Ok(Some(value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        self.entries.write().remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        self.sweep_if_due(&mut entries, now);
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        let mut live_matches = 0u64;
        entries.retain(|key, (_, expires_at)| {
            if !glob_match(pattern, key) {
                return *expires_at > now;
            }
            if *expires_at > now {
                live_matches += 1;
            }
            false
        });
        tracing::trace!(pattern, scanned = before, removed = live_matches, "pattern delete");
        Ok(live_matches)
    }

    async fn flush(&self) -> CacheResult<()> {
        self.entries.write().clear();
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}
