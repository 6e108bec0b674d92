use std::sync::atomic::{AtomicBool, Ordering};

/// Per-session flags. A fresh set is created for every `SyncSession`, so
/// nothing leaks across logout and login.
pub struct SessionGuards {
    online: AtomicBool,
    initialized: AtomicBool,
    refresh_in_flight: AtomicBool,
    replay_in_flight: AtomicBool,
}

impl Default for SessionGuards {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears its flag when dropped.
#[must_use]
pub struct InFlight<'a> {
    flag: &'a AtomicBool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

fn try_begin(flag: &AtomicBool) -> Option<InFlight<'_>> {
    flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .ok()
        .map(|_| InFlight { flag })
}

impl SessionGuards {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            initialized: AtomicBool::new(false),
            refresh_in_flight: AtomicBool::new(false),
            replay_in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }

    /// True only for the first caller after creation or `reset`.
    pub fn mark_initialized(&self) -> bool {
        !self.initialized.swap(true, Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn try_begin_refresh(&self) -> Option<InFlight<'_>> {
        try_begin(&self.refresh_in_flight)
    }

    pub fn try_begin_replay(&self) -> Option<InFlight<'_>> {
        try_begin(&self.replay_in_flight)
    }

    pub fn reset(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.refresh_in_flight.store(false, Ordering::SeqCst);
        self.replay_in_flight.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[path = "tests/guards_tests.rs"]
mod tests;
