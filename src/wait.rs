//! Spin-wait idle policies.
//!
//! Every wait in the communication engine is a busy poll: the caller keeps
//! calling a `test` operation until it succeeds. [`BackoffPolicy`] decides
//! what a rank does between two unsuccessful polls.

use std::hint;
use std::thread;

/// What to do between two unsuccessful polls.
#[derive(Debug, Clone, Copy, Default)]
pub enum BackoffPolicy {
    /// Issue a CPU pause hint and poll again.
    #[default]
    Pause,
    /// Yield the time slice to the OS scheduler.
    Yield,
    /// Pause for `spins` polls, then yield on every further poll.
    SpinThenYield {
        /// Number of pause-hint polls before yielding.
        spins: u32,
    },
    /// Call a user function with the number of failed polls so far.
    Custom(fn(u32)),
}

impl PartialEq for BackoffPolicy {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Pause, Self::Pause) | (Self::Yield, Self::Yield) => true,
            (Self::SpinThenYield { spins: a }, Self::SpinThenYield { spins: b }) => a == b,
            // Equal addresses mean the same function; one function may still
            // have several addresses, which compares unequal.
            (Self::Custom(a), Self::Custom(b)) => *a as usize == *b as usize,
            _ => false,
        }
    }
}

impl Eq for BackoffPolicy {}

/// Per-wait state of a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Start a new wait.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Idle once after an unsuccessful poll.
    #[inline]
    pub fn snooze(&mut self) {
        match self.policy {
            BackoffPolicy::Pause => hint::spin_loop(),
            BackoffPolicy::Yield => thread::yield_now(),
            BackoffPolicy::SpinThenYield { spins } => {
                if self.attempt < spins {
                    hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }
            BackoffPolicy::Custom(idle) => idle(self.attempt),
        }
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Forget previous failures, e.g. after partial progress.
    #[inline]
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Poll `ready` until it returns true, idling with `policy` in between.
#[inline]
pub fn spin_until(policy: BackoffPolicy, mut ready: impl FnMut() -> bool) {
    let mut backoff = Backoff::new(policy);
    while !ready() {
        backoff.snooze();
    }
}
