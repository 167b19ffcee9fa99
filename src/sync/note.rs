use std::time::Duration;

use super::monitor::Monitor;

/// One-shot sleep/wakeup event.
///
/// `sleep` blocks until some thread called `wakeup`; the event then stays
/// signalled until `clear`. Exactly one thread may sleep on a note.
pub struct Note {
    key: Monitor<bool>,
}

impl Note {
    pub fn new() -> Self {
        Self {
            key: Monitor::new(false),
        }
    }

    pub fn clear(&self) {
        *self.key.lock() = false;
    }

    pub fn wakeup(&self) {
        let mut key = self.key.lock();
        *key = true;
        key.notify_all();
    }

    pub fn sleep(&self) {
        self.key.lock().wait_while(|signalled| !*signalled);
    }

    /// Sleeps at most `timeout`; returns whether the note was signalled.
    pub fn sleep_timeout(&self, timeout: Duration) -> bool {
        self.key
            .lock()
            .wait_while_for(timeout, |signalled| !*signalled)
    }

    pub fn is_signalled(&self) -> bool {
        *self.key.lock()
    }
}

impl Default for Note {
    fn default() -> Self {
        Self::new()
    }
}
