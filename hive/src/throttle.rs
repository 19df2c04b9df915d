/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A valve for rate-limited logging.
//!
//! Admits up to `max_events` per rolling window. When a new window opens,
//! the first admission reports how many events the previous window dropped,
//! so log lines can account for the suppressed volume.

use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

#[derive(Debug)]
struct ThrottleState {
    window_start: Instant,
    seen: u64,
}

/// A sliding-window admission valve.
#[derive(Debug)]
pub struct Throttle {
    max_events: u64,
    window: Duration,
    state: Mutex<ThrottleState>,
}

impl Throttle {
    /// Create a valve admitting `max_events` per `window`.
    pub fn new(max_events: u64, window: Duration) -> Self {
        Self {
            max_events,
            window,
            state: Mutex::new(ThrottleState {
                window_start: Instant::now(),
                seen: 0,
            }),
        }
    }

    /// Request admission. `Some(dropped)` admits the event and reports how
    /// many events the previous window suppressed; `None` rejects it.
    pub fn admit(&self) -> Option<u64> {
        let mut state = self.state.lock().expect("throttle lock poisoned");
        let now = Instant::now();
        if now.duration_since(state.window_start) >= self.window {
            let dropped = state.seen.saturating_sub(self.max_events);
            state.window_start = now;
            state.seen = 1;
            return Some(dropped);
        }
        state.seen += 1;
        if state.seen <= self.max_events {
            Some(0)
        } else {
            None
        }
    }
}
