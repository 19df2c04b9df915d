/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The pid cache: a bounded, process-local map from cluster identities to
//! their last-resolved pids.
//!
//! Hits skip the identity lookup entirely. Entries are evicted least
//! recently used when the bound is reached, invalidated on delivery
//! failures, and pruned on topology changes.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use hive::Pid;

use crate::identity::ClusterIdentity;

struct PidCacheState {
    map: HashMap<ClusterIdentity, Pid>,
    order: VecDeque<ClusterIdentity>,
}

/// A bounded `ClusterIdentity -> Pid` map with LRU eviction.
pub struct PidCache {
    capacity: usize,
    state: Mutex<PidCacheState>,
}

impl PidCache {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(PidCacheState {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Look up an identity, refreshing its recency on a hit.
    pub fn get(&self, identity: &ClusterIdentity) -> Option<Pid> {
        let mut state = self.state.lock().expect("pid cache lock poisoned");
        let pid = state.map.get(identity).cloned()?;
        Self::touch(&mut state.order, identity);
        Some(pid)
    }

    /// Record a resolution, evicting the least recently used entry past
    /// the bound.
    pub fn set(&self, identity: ClusterIdentity, pid: Pid) {
        let mut state = self.state.lock().expect("pid cache lock poisoned");
        if state.map.insert(identity.clone(), pid).is_some() {
            Self::touch(&mut state.order, &identity);
        } else {
            state.order.push_back(identity);
        }
        while state.map.len() > self.capacity {
            let Some(evicted) = state.order.pop_front() else {
                break;
            };
            state.map.remove(&evicted);
        }
    }

    /// Drop one entry.
    pub fn invalidate(&self, identity: &ClusterIdentity) {
        let mut state = self.state.lock().expect("pid cache lock poisoned");
        if state.map.remove(identity).is_some() {
            state.order.retain(|entry| entry != identity);
        }
    }

    /// Keep only entries the predicate accepts. Used to drain the cache on
    /// topology changes.
    pub fn retain(&self, mut keep: impl FnMut(&ClusterIdentity, &Pid) -> bool) {
        let mut state = self.state.lock().expect("pid cache lock poisoned");
        state.map.retain(|identity, pid| keep(identity, pid));
        let map = std::mem::take(&mut state.map);
        state.order.retain(|identity| map.contains_key(identity));
        state.map = map;
    }

    /// The number of cached entries.
    pub fn len(&self) -> usize {
        self.state.lock().expect("pid cache lock poisoned").map.len()
    }

    /// Tells whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn touch(order: &mut VecDeque<ClusterIdentity>, identity: &ClusterIdentity) {
        if let Some(position) = order.iter().position(|entry| entry == identity) {
            order.remove(position);
            order.push_back(identity.clone());
        }
    }
}
