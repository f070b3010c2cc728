//! Bounded-concurrency primitive with error propagation.
//!
//! Workers call [`Throttle::acquire`] before starting and [`Throttle::done`]
//! when finished, optionally reporting an error. Once any worker has
//! reported an error, further `acquire` calls return it, and
//! [`Throttle::finish`] surfaces the first error after all workers drained.

use std::sync::{Condvar, Mutex};

use crate::error::{Error, Result};

struct ThrottleState {
    running: usize,
    first_error: Option<Error>,
}

pub struct Throttle {
    max: usize,
    state: Mutex<ThrottleState>,
    cond: Condvar,
}

impl Throttle {
    /// A throttle admitting at most `max` concurrent workers.
    pub fn new(max: usize) -> Throttle {
        Throttle {
            max,
            state: Mutex::new(ThrottleState {
                running: 0,
                first_error: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Blocks until a worker slot is free. Returns the first recorded error
    /// instead of admitting new work once a worker has failed.
    pub fn acquire(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        loop {
            if let Some(err) = &state.first_error {
                return Err(err.clone());
            }
            if state.running < self.max {
                state.running += 1;
                return Ok(());
            }
            state = self.cond.wait(state)?;
        }
    }

    /// Releases a slot, recording the worker's error status.
    pub fn done(&self, result: Result<()>) {
        let mut state = self.state.lock().expect("throttle poisoned");
        if let Err(err) = result {
            if state.first_error.is_none() {
                state.first_error = Some(err);
            }
        }
        state.running -= 1;
        self.cond.notify_all();
    }

    /// Waits until all admitted workers called [`Throttle::done`] and
    /// returns the first error any of them reported.
    pub fn finish(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        while state.running > 0 {
            state = self.cond.wait(state)?;
        }
        match &state.first_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
