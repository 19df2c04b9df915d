/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The block list: members treated as unreachable for a bounded time.
//!
//! Entries carry the instant they were added and expire on read, so an
//! unresponsive member that recovers re-enters the cluster after the
//! configured duration without any explicit unblocking.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

#[derive(Debug, Clone)]
struct BlockEntry {
    address: String,
    blocked_at: Instant,
}

/// A time-bounded set of blocked member ids.
#[derive(Debug)]
pub struct BlockList {
    duration: Duration,
    entries: Mutex<HashMap<String, BlockEntry>>,
}

impl BlockList {
    /// Create a block list whose entries expire after `duration`.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Block a member, identified by id and last-known address.
    pub fn block(&self, member_id: impl Into<String>, address: impl Into<String>) {
        let mut entries = self.entries.lock().expect("block list lock poisoned");
        entries.insert(
            member_id.into(),
            BlockEntry {
                address: address.into(),
                blocked_at: Instant::now(),
            },
        );
    }

    /// Tells whether the member id is currently blocked.
    pub fn is_blocked(&self, member_id: &str) -> bool {
        let mut entries = self.entries.lock().expect("block list lock poisoned");
        Self::expire(&mut entries, self.duration);
        entries.contains_key(member_id)
    }

    /// Tells whether any blocked member was last known at `address`.
    pub fn is_blocked_address(&self, address: &str) -> bool {
        let mut entries = self.entries.lock().expect("block list lock poisoned");
        Self::expire(&mut entries, self.duration);
        entries.values().any(|entry| entry.address == address)
    }

    /// The currently blocked member ids.
    pub fn blocked_ids(&self) -> Vec<String> {
        let mut entries = self.entries.lock().expect("block list lock poisoned");
        Self::expire(&mut entries, self.duration);
        entries.keys().cloned().collect()
    }

    fn expire(entries: &mut HashMap<String, BlockEntry>, duration: Duration) {
        entries.retain(|_, entry| entry.blocked_at.elapsed() < duration);
    }
}
