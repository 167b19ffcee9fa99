use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// A mutex paired with a condition variable.
pub struct Monitor<T> {
    lock: Mutex<T>,
    condvar: Condvar,
}

impl<T> Monitor<T> {
    pub fn new(val: T) -> Self {
        Self {
            lock: Mutex::new(val),
            condvar: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MonitorLock<'_, T> {
        MonitorLock {
            guard: self.lock.lock(),
            condvar: &self.condvar,
        }
    }
}

pub struct MonitorLock<'a, T> {
    guard: MutexGuard<'a, T>,
    condvar: &'a Condvar,
}

impl<T> MonitorLock<'_, T> {
    /// Sleeps until notified. Wakeups may be spurious.
    pub fn wait(&mut self) {
        self.condvar.wait(&mut self.guard);
    }

    pub fn wait_timeout(&mut self, timeout: Duration) {
        self.condvar.wait_for(&mut self.guard, timeout);
    }

    /// Sleeps for as long as `blocked` holds.
    pub fn wait_while(&mut self, mut blocked: impl FnMut(&mut T) -> bool) {
        while blocked(&mut self.guard) {
            self.condvar.wait(&mut self.guard);
        }
    }

    /// Like [`wait_while`](Self::wait_while) but gives up after `timeout`.
    /// Returns false on timeout.
    pub fn wait_while_for(
        &mut self,
        timeout: Duration,
        mut blocked: impl FnMut(&mut T) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while blocked(&mut self.guard) {
            if self.condvar.wait_until(&mut self.guard, deadline).timed_out() {
                return !blocked(&mut self.guard);
            }
        }
        true
    }

    pub fn notify_all(&self) {
        self.condvar.notify_all();
    }
}

impl<T> Deref for MonitorLock<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for MonitorLock<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn wait_while_sees_the_update() {
        let m = Arc::new(Monitor::new(0u32));
        let m2 = m.clone();
        let h = std::thread::spawn(move || {
            let mut v = m2.lock();
            v.wait_while(|v| *v < 3);
            *v
        });
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(2));
            let mut v = m.lock();
            *v += 1;
            v.notify_all();
        }
        assert_eq!(h.join().unwrap(), 3);
    }

    #[test]
    fn wait_while_for_times_out() {
        let m = Monitor::new(false);
        let mut v = m.lock();
        assert!(!v.wait_while_for(Duration::from_millis(5), |v| !*v));
        *v = true;
        assert!(v.wait_while_for(Duration::from_millis(5), |v| !*v));
    }
}
