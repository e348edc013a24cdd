//! Per-task deduplication map. Admission is a compare-and-set insert
//! under the write lock, which is what guarantees at-most-once
//! execution per task id within the process.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Observable states of a dedup entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupState {
    /// Execution admitted but not yet finished. `swept_at` records when
    /// a compaction pass first observed the entry; an entry still
    /// in-flight a full stuck-window later is presumed wedged and
    /// dropped so the task id can be admitted again.
    InFlight { swept_at: Option<Instant> },
    /// Execution finished (success or failure) at the recorded instant.
    Terminal { at: Instant },
}

pub struct DedupMap {
    entries: RwLock<HashMap<String, DedupState>>,
    last_compaction: RwLock<Instant>,
    terminal_ttl: Duration,
    stuck_ttl: Duration,
    compaction_interval: Duration,
}

impl DedupMap {
    pub fn new() -> Self {
        Self::with_windows(
            Duration::from_secs(24 * 3600),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        )
    }

    pub fn with_windows(
        terminal_ttl: Duration,
        stuck_ttl: Duration,
        compaction_interval: Duration,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            last_compaction: RwLock::new(Instant::now()),
            terminal_ttl,
            stuck_ttl,
            compaction_interval,
        }
    }

    /// Compare-and-set admission: inserts an in-flight marker and
    /// returns true iff this caller won. Any existing entry — in-flight
    /// or terminal — means the task has been seen and must be skipped.
    pub fn try_admit(&self, task_id: &str) -> bool {
        self.compact_if_due();

        let mut entries = self.entries.write().expect("dedup lock poisoned");
        if entries.contains_key(task_id) {
            return false;
        }
        entries.insert(
            task_id.to_string(),
            DedupState::InFlight { swept_at: None },
        );
        true
    }

    /// Transition an entry to terminal. Called exactly once per
    /// admitted task, after execution succeeded or failed.
    pub fn mark_terminal(&self, task_id: &str) {
        let mut entries = self.entries.write().expect("dedup lock poisoned");
        entries.insert(task_id.to_string(), DedupState::Terminal { at: Instant::now() });
    }

    pub fn state_of(&self, task_id: &str) -> Option<DedupState> {
        self.entries
            .read()
            .expect("dedup lock poisoned")
            .get(task_id)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("dedup lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expire old entries, at most once per compaction interval.
    /// Terminal entries age out after `terminal_ttl`; in-flight entries
    /// are stamped on first observation and dropped once that stamp is
    /// older than `stuck_ttl`.
    fn compact_if_due(&self) {
        {
            let last = self.last_compaction.read().expect("dedup lock poisoned");
            if last.elapsed() < self.compaction_interval {
                return;
            }
        }
        let mut last = self.last_compaction.write().expect("dedup lock poisoned");
        // Another admit may have compacted while we upgraded the lock.
        if last.elapsed() < self.compaction_interval {
            return;
        }
        *last = Instant::now();

        let now = Instant::now();
        let mut entries = self.entries.write().expect("dedup lock poisoned");
        let before = entries.len();
        entries.retain(|_, state| match state {
            DedupState::Terminal { at } => now.duration_since(*at) < self.terminal_ttl,
            DedupState::InFlight { swept_at } => match swept_at {
                Some(at) => now.duration_since(*at) < self.stuck_ttl,
                None => {
                    *swept_at = Some(now);
                    true
                }
            },
        });
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = entries.len(), "dedup map compacted");
        }
    }
}

impl Default for DedupMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_is_first_writer_wins() {
        let map = DedupMap::new();
        assert!(map.try_admit("t1"));
        assert!(!map.try_admit("t1"));
        map.mark_terminal("t1");
        assert!(!map.try_admit("t1"));
    }

    #[test]
    fn terminal_entries_expire() {
        let map = DedupMap::with_windows(
            Duration::from_millis(20),
            Duration::from_millis(100),
            Duration::from_millis(1),
        );
        assert!(map.try_admit("t1"));
        map.mark_terminal("t1");

        std::thread::sleep(Duration::from_millis(30));
        assert!(map.try_admit("t1"), "expired terminal entry should re-admit");
    }

    #[test]
    fn stuck_in_flight_entries_are_dropped_after_two_sweeps() {
        let map = DedupMap::with_windows(
            Duration::from_secs(3600),
            Duration::from_millis(20),
            Duration::from_millis(1),
        );
        assert!(map.try_admit("t1"));

        // First sweep stamps the entry, second (past the stuck window)
        // removes it. Sweeps piggyback on admission of other ids.
        std::thread::sleep(Duration::from_millis(5));
        assert!(map.try_admit("other-1"));
        assert!(!map.try_admit("t1"));

        std::thread::sleep(Duration::from_millis(25));
        assert!(map.try_admit("other-2"));
        assert!(map.try_admit("t1"), "stuck in-flight entry should be dropped");
    }
}
