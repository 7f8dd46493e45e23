//! Bounded wait for asynchronous mimic completions.
//!
//! The engine acknowledges a mimic request later, from one of its own threads.
//! A caller issues the request and then sleeps on a condition variable until
//! the completion arrives or the deadline passes. Completions that arrive
//! when nobody is waiting are dropped.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{check, DrakeError, Result};

#[derive(Default)]
struct Pending {
    waiting: bool,
    outcome: Option<bool>,
}

#[derive(Default)]
pub struct MimicSignal {
    /// Held for the whole request; one mimic in flight at a time.
    request: Mutex<()>,
    pending: Mutex<Pending>,
    done: Condvar,
}

impl MimicSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a request with `issue` and wait up to `timeout` for its completion.
    ///
    /// `issue` runs without any signal lock held, so an engine that completes
    /// inline on the calling thread does not deadlock.
    pub fn run(&self, timeout: Duration, issue: impl FnOnce() -> i32) -> Result<()> {
        let _request = self
            .request
            .try_lock_for(timeout)
            .ok_or(DrakeError::MimicBusy)?;

        {
            let mut pending = self.pending.lock();
            pending.waiting = true;
            pending.outcome = None;
        }

        if let Err(e) = check("mimic", issue()) {
            self.pending.lock().waiting = false;
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        while pending.outcome.is_none() {
            if self.done.wait_until(&mut pending, deadline).timed_out() {
                break;
            }
        }
        pending.waiting = false;
        match pending.outcome.take() {
            Some(true) => Ok(()),
            Some(false) => Err(DrakeError::MimicFailed),
            None => Err(DrakeError::MimicTimeout(timeout)),
        }
    }

    /// Deliver a completion. Returns false if no request was waiting.
    pub fn complete(&self, success: bool) -> bool {
        let mut pending = self.pending.lock();
        if !pending.waiting {
            debug!(success, "mimic completion with no waiter");
            return false;
        }
        pending.outcome = Some(success);
        self.done.notify_all();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn inline_completion_is_not_lost() {
        let signal = MimicSignal::new();
        let result = signal.run(WAIT, || {
            assert!(signal.complete(true));
            0
        });
        assert!(result.is_ok());
    }

    #[test]
    fn completion_from_another_thread_wakes_the_caller() {
        let signal = Arc::new(MimicSignal::new());
        let remote = Arc::clone(&signal);
        let result = signal.run(WAIT, move || {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                remote.complete(false);
            });
            0
        });
        assert!(matches!(result, Err(DrakeError::MimicFailed)));
    }

    #[test]
    fn dropped_completion_times_out() {
        let signal = MimicSignal::new();
        let started = Instant::now();
        let result = signal.run(Duration::from_millis(50), || 0);
        assert!(matches!(result, Err(DrakeError::MimicTimeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(50));

        // A late completion after the timeout finds nobody waiting.
        assert!(!signal.complete(true));
    }

    #[test]
    fn rejected_request_does_not_wait() {
        let signal = MimicSignal::new();
        let result = signal.run(WAIT, || -2);
        assert!(matches!(result, Err(DrakeError::Engine { code: -2, .. })));
        assert!(!signal.complete(true));
    }

    #[test]
    fn second_caller_is_busy_while_a_request_is_in_flight() {
        let signal = Arc::new(MimicSignal::new());
        let issued = Arc::new(Barrier::new(2));

        let first = {
            let signal = Arc::clone(&signal);
            let issued = Arc::clone(&issued);
            thread::spawn(move || {
                signal.run(Duration::from_millis(300), || {
                    issued.wait();
                    0
                })
            })
        };

        issued.wait();
        let mut reissued = false;
        let second = signal.run(Duration::from_millis(20), || {
            reissued = true;
            0
        });
        assert!(matches!(second, Err(DrakeError::MimicBusy)));
        assert!(!reissued);

        let first = first.join().expect("first caller panicked");
        assert!(matches!(first, Err(DrakeError::MimicTimeout(_))));
    }
}
