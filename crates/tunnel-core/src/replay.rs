//! Anti-replay sliding window
//!
//! Tracks the highest accepted counter plus a 64-bit bitmap of the
//! counters just below it. Bit `k` set means `last_counter - k` was seen.
//!
//! - Counter 0 is never accepted
//! - A counter is never accepted twice
//! - Counters 64 or more behind the high-water mark are rejected

use std::sync::{Mutex, MutexGuard};

/// Number of counters the bitmap covers
pub const WINDOW_SIZE: u64 = 64;

#[derive(Debug, Default, Clone, Copy)]
struct WindowState {
    last_counter: u64,
    bitmap: u64,
}

/// Verdict for a counter that is not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Counter 0
    Zero,
    /// Too far behind the high-water mark
    TooOld,
    /// Already seen
    Duplicate,
}

impl WindowState {
    fn classify(&self, counter: u64) -> Result<(), Rejection> {
        if counter == 0 {
            return Err(Rejection::Zero);
        }
        if counter > self.last_counter {
            return Ok(());
        }

        let diff = self.last_counter - counter;
        if diff >= WINDOW_SIZE {
            return Err(Rejection::TooOld);
        }
        if self.bitmap & (1u64 << diff) != 0 {
            return Err(Rejection::Duplicate);
        }
        Ok(())
    }

    fn accept(&mut self, counter: u64) {
        if counter > self.last_counter {
            let shift = counter - self.last_counter;
            if shift >= WINDOW_SIZE {
                self.bitmap = 1;
            } else {
                self.bitmap = (self.bitmap << shift) | 1;
            }
            self.last_counter = counter;
        } else {
            self.bitmap |= 1u64 << (self.last_counter - counter);
        }
    }
}

/// Sliding-window replay detector.
///
/// Check-and-update is atomic under an internal lock, so the window can
/// be shared between the receive loop and observers on other threads.
#[derive(Debug, Default)]
pub struct ReplayWindow {
    state: Mutex<WindowState>,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accept `counter` and record it, or reject it without changes
    pub fn check_and_update(&self, counter: u64) -> bool {
        self.check_and_update_detailed(counter).is_ok()
    }

    /// Like [`check_and_update`](Self::check_and_update), reporting why a
    /// counter was rejected
    pub fn check_and_update_detailed(&self, counter: u64) -> Result<(), Rejection> {
        let mut state = self.lock();
        state.classify(counter)?;
        state.accept(counter);
        Ok(())
    }

    /// Would `counter` be accepted? Does not modify the window.
    pub fn is_valid(&self, counter: u64) -> bool {
        self.classify(counter).is_ok()
    }

    /// Non-mutating classification of `counter`
    pub fn classify(&self, counter: u64) -> Result<(), Rejection> {
        self.lock().classify(counter)
    }

    /// Highest accepted counter
    pub fn current_counter(&self) -> u64 {
        self.lock().last_counter
    }

    /// Forget everything. Only for re-keying or a new session.
    pub fn reset(&self) {
        *self.lock() = WindowState::default();
    }
}
