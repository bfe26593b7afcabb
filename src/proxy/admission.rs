//! Admission control: a process-wide sliding-window request counter.
//!
//! The handler only sees the [`AdmissionController`] trait, so the in-process
//! [`SlidingWindowLimiter`] can be replaced by a shared-store counter without
//! touching request handling.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Decides whether a request may proceed before any upstream work begins.
pub trait AdmissionController: Send + Sync {
    /// Admit the request, recording it, or reject it without recording.
    fn try_admit(&self) -> bool;

    /// Number of admissions currently counted in the window.
    fn in_window(&self) -> usize;
}

/// Single-process limiter over a trailing window.
///
/// Admission instants are kept in insertion order, so expired entries are
/// always at the front. Eviction, the capacity check and the append all happen
/// under one lock acquisition; concurrent callers can never push the window
/// past `max_requests`.
pub struct SlidingWindowLimiter {
    window: Duration,
    max_requests: usize,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            timestamps: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    fn evict_expired(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        // Before the runtime has been up for `window`, nothing can be expired.
        let Some(cutoff) = now.checked_sub(window) else {
            return;
        };
        while timestamps.front().is_some_and(|t| *t < cutoff) {
            timestamps.pop_front();
        }
    }
}

impl AdmissionController for SlidingWindowLimiter {
    fn try_admit(&self) -> bool {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict_expired(&mut timestamps, now, self.window);

        if timestamps.len() >= self.max_requests {
            tracing::debug!(
                in_window = timestamps.len(),
                max_requests = self.max_requests,
                "admission rejected"
            );
            return false;
        }

        timestamps.push_back(now);
        true
    }

    fn in_window(&self) -> usize {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict_expired(&mut timestamps, now, self.window);
        timestamps.len()
    }
}
