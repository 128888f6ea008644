//! Progress reporting for bulk runs
//!
//! Bulk operations publish a [Progress] record under a key derived from the
//! operation and its scope. Records expire after a bounded TTL so finished
//! runs don't accumulate.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub status: ProgressStatus,
    pub processed: usize,
    pub total: usize,
    pub queued: usize,
    pub skipped: usize,
    pub errors: usize,
    /// Why the run as a whole failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Progress {
    pub fn running(total: usize) -> Self {
        Self {
            status: ProgressStatus::Running,
            processed: 0,
            total,
            queued: 0,
            skipped: 0,
            errors: 0,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status != ProgressStatus::Running
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressKind {
    Solve,
    Match,
}

impl fmt::Display for ProgressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProgressKind::Solve => "solve",
            ProgressKind::Match => "match",
        })
    }
}

pub fn progress_key(kind: ProgressKind, scope: &str) -> String {
    format!("bulk:{kind}:{scope}")
}

/// Key-value store for progress records
pub trait ProgressStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Progress>;

    /// Store a record. A new key lives for the store's default TTL; an
    /// existing key keeps its expiry.
    fn set(&self, key: &str, progress: Progress);

    fn expire(&self, key: &str, ttl: Duration);
}

/// Process-local [ProgressStore]
pub struct MemoryProgressStore {
    default_ttl: Duration,
    entries: Mutex<HashMap<String, (Progress, Instant)>>,
}

impl MemoryProgressStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl ProgressStore for MemoryProgressStore {
    fn get(&self, key: &str) -> Option<Progress> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, (_, deadline)| *deadline > now);
        entries.get(key).map(|(progress, _)| progress.clone())
    }

    fn set(&self, key: &str, mut progress: Progress) {
        progress.updated_at = Utc::now();
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some((stored, deadline)) if *deadline > now => *stored = progress,
            _ => {
                entries.insert(key.to_string(), (progress, now + self.default_ttl));
            }
        }
    }

    fn expire(&self, key: &str, ttl: Duration) {
        if let Some((_, deadline)) = self.entries.lock().get_mut(key) {
            *deadline = Instant::now() + ttl;
        }
    }
}
