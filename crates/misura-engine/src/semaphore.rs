//! The task admission gate.
//!
//! A binary semaphore serializing task execution: measurements perturb
//! each other, so one task holds the gate for its entire run. The
//! process-global instance is the default; tests inject their own scope
//! through [`Task::start_with_semaphore`].
//!
//! [`Task::start_with_semaphore`]: crate::Task::start_with_semaphore

use std::sync::{Arc, Condvar, Mutex, OnceLock};

pub struct Semaphore {
    active: Mutex<bool>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Semaphore {
        Semaphore {
            active: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Block until the gate is free, then take it.
    pub fn acquire(&self) {
        let guard = self.active.lock().unwrap();
        let mut guard = self.cond.wait_while(guard, |active| *active).unwrap();
        *guard = true;
    }

    /// Free the gate and wake one waiter.
    pub fn release(&self) {
        {
            let mut active = self.active.lock().unwrap();
            *active = false;
        }
        self.cond.notify_one();
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Semaphore::new()
    }
}

/// The process-wide admission gate.
pub fn global() -> Arc<Semaphore> {
    static GLOBAL: OnceLock<Arc<Semaphore>> = OnceLock::new();
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(Semaphore::new())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_blocks_until_release() {
        let semaphore = Arc::new(Semaphore::new());
        semaphore.acquire();

        let other = Arc::clone(&semaphore);
        let handle = thread::spawn(move || {
            other.acquire();
            other.release();
        });

        // The second acquire must still be parked.
        thread::sleep(Duration::from_millis(100));
        assert!(!handle.is_finished());

        semaphore.release();
        handle.join().unwrap();
    }

    #[test]
    fn global_is_one_instance() {
        assert!(Arc::ptr_eq(&global(), &global()));
    }
}
