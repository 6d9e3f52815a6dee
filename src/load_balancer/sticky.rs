//! Session affinity.
//!
//! Maps a request key to the backend that last served it successfully, for a
//! sliding TTL. Lookups refresh the entry; expired entries are dropped on
//! access and swept at most once per `SWEEP_INTERVAL`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::load_balancer::backend::BackendId;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct StickyEntry {
    backend: BackendId,
    touched: Instant,
}

#[derive(Debug)]
pub struct StickySessions {
    enabled: AtomicBool,
    ttl_ms: AtomicU64,
    entries: DashMap<String, StickyEntry>,
    last_sweep: Mutex<Instant>,
}

impl StickySessions {
    pub fn new(enabled: bool, ttl: Duration) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            ttl_ms: AtomicU64::new(ttl.as_millis() as u64),
            entries: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.entries.clear();
        }
    }

    pub fn set_ttl(&self, ttl: Duration) {
        self.ttl_ms.store(ttl.as_millis() as u64, Ordering::Relaxed);
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }

    /// Backend bound to `key`, refreshing its TTL.
    pub fn get(&self, key: &str) -> Option<BackendId> {
        if !self.is_enabled() || key.is_empty() {
            return None;
        }
        let ttl = self.ttl();
        let now = Instant::now();

        let mut entry = self.entries.get_mut(key)?;
        if now.duration_since(entry.touched) >= ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        entry.touched = now;
        Some(entry.backend)
    }

    pub fn bind(&self, key: &str, backend: BackendId) {
        if !self.is_enabled() || key.is_empty() {
            return;
        }
        self.entries.insert(
            key.to_string(),
            StickyEntry {
                backend,
                touched: Instant::now(),
            },
        );
        self.sweep();
    }

    pub fn unbind(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep(&self) {
        let now = Instant::now();
        {
            let mut last = self.last_sweep.lock();
            if now.duration_since(*last) < SWEEP_INTERVAL {
                return;
            }
            *last = now;
        }
        let ttl = self.ttl();
        self.entries.retain(|_, e| now.duration_since(e.touched) < ttl);
    }
}
