use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default minimum interval between two emissions of the same alert.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Entries older than `window * RETENTION_FACTOR` are evicted.
pub const RETENTION_FACTOR: u32 = 6;

/// Shared, time-windowed dedupe cache keyed by alert key.
///
/// `should_emit` is a single check-and-set under one lock, so two triggers
/// racing on the same key cannot both pass the window check.
pub struct NotificationDebouncer {
    window: Duration,
    retention: Duration,
    state: Mutex<DebounceState>,
}

struct DebounceState {
    last_emitted: HashMap<String, Instant>,
    last_sweep: Option<Instant>,
}

impl NotificationDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            retention: window * RETENTION_FACTOR,
            state: Mutex::new(DebounceState {
                last_emitted: HashMap::new(),
                last_sweep: None,
            }),
        }
    }

    /// Returns true (and records the emission) when `key` has not been
    /// emitted within the window.
    pub fn should_emit(&self, key: &str) -> bool {
        self.should_emit_at(key, Instant::now())
    }

    /// Same as [`should_emit`](Self::should_emit) with an explicit clock.
    pub fn should_emit_at(&self, key: &str, now: Instant) -> bool {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        self.sweep(&mut state, now);

        let fresh = match state.last_emitted.get(key) {
            Some(last) => now.saturating_duration_since(*last) < self.window,
            None => false,
        };

        if fresh {
            return false;
        }

        state.last_emitted.insert(key.to_string(), now);
        true
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        match self.state.lock() {
            Ok(guard) => guard.last_emitted.len(),
            Err(poisoned) => poisoned.into_inner().last_emitted.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop stale entries, at most once per window.
    fn sweep(&self, state: &mut DebounceState, now: Instant) {
        let due = match state.last_sweep {
            Some(last) => now.saturating_duration_since(last) >= self.window,
            None => true,
        };
        if !due {
            return;
        }

        let retention = self.retention;
        state
            .last_emitted
            .retain(|_, last| now.saturating_duration_since(*last) < retention);
        state.last_sweep = Some(now);
    }
}

impl Default for NotificationDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
