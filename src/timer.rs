//! Explicit per-category timing collector.
//!
//! One tracker is created by the engine and passed through the
//! workers; when disabled every scope is a no-op. Times accumulate per
//! `(category, thread)` so the report can show each category's total
//! together with how many threads contributed to it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Accumulates wall time per category and contributing thread.
pub struct TimeTracker {
    enabled: bool,
    entries: Mutex<HashMap<(String, String), Duration>>,
}

impl TimeTracker {
    /// Creates a tracker; a disabled one records nothing.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether timings are being collected.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Starts timing a category; the elapsed time records when the
    /// returned scope drops.
    pub fn scope<'a>(&'a self, category: &str) -> TimeScope<'a> {
        TimeScope {
            inner: self
                .enabled
                .then(|| (self, category.to_string(), Instant::now())),
        }
    }

    fn record(&self, category: String, elapsed: Duration) {
        let thread = thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        let mut entries = self.entries.lock().unwrap();
        *entries.entry((category, thread)).or_default() += elapsed;
    }

    /// Report lines: per-category total time and contributing-thread
    /// count, sorted by category.
    pub fn report(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap();
        let mut per_category: HashMap<&str, (Duration, usize)> = HashMap::new();
        for ((category, _), elapsed) in entries.iter() {
            let slot = per_category.entry(category).or_default();
            slot.0 += *elapsed;
            slot.1 += 1;
        }
        let mut lines: Vec<(&str, (Duration, usize))> = per_category.into_iter().collect();
        lines.sort_by_key(|(category, _)| *category);
        lines
            .into_iter()
            .map(|(category, (total, threads))| {
                format!("{category}: {total:?} across {threads} thread(s)")
            })
            .collect()
    }
}

/// Guard recording the elapsed time of one category on drop.
pub struct TimeScope<'a> {
    inner: Option<(&'a TimeTracker, String, Instant)>,
}

impl Drop for TimeScope<'_> {
    fn drop(&mut self) {
        if let Some((tracker, category, start)) = self.inner.take() {
            tracker.record(category, start.elapsed());
        }
    }
}
