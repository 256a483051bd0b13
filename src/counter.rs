//! The shared counter.
//!
//! A single signed value owned by the event loop and handed to the command
//! interpreter by `&mut`. All access happens on the loop thread, so there is
//! no locking.

/// Process-lifetime counter state.
///
/// Arithmetic wraps at the `i64` boundary instead of panicking or
/// saturating.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    value: i64,
}

impl Counter {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value.
    pub fn get(&self) -> i64 {
        self.value
    }

    pub fn incr(&mut self) {
        self.value = self.value.wrapping_add(1);
    }

    pub fn decr(&mut self) {
        self.value = self.value.wrapping_sub(1);
    }

    pub fn reset(&mut self) {
        self.value = 0;
    }
}
