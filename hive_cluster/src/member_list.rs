/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The member list: turns provider snapshots into topology events.
//!
//! Providers push full membership snapshots. The member list refreshes the
//! TTL of every member present in a snapshot, expires members whose TTL
//! lapsed, filters blocked members, and publishes a new versioned
//! [`ClusterTopology`] on the event stream whenever the effective
//! membership changed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use hive::ActorSystem;

use crate::block_list::BlockList;
use crate::events::ClusterTopologyEvent;
use crate::events::MemberJoinedEvent;
use crate::events::MemberLeftEvent;
use crate::member::Member;
use crate::topology::topology_hash;
use crate::topology::ClusterTopology;

struct MemberListState {
    members: HashMap<String, (Member, Instant)>,
    version: u64,
    last_hash: u64,
}

/// Tracks live members for one actor system and publishes topology
/// changes.
pub struct MemberList {
    system: ActorSystem,
    block_list: Arc<BlockList>,
    ttl: Duration,
    state: Mutex<MemberListState>,
}

impl MemberList {
    /// Create a member list publishing to `system`'s event stream. Members
    /// absent from snapshots expire after `ttl`.
    pub fn new(system: ActorSystem, block_list: Arc<BlockList>, ttl: Duration) -> Self {
        Self {
            system,
            block_list,
            ttl,
            state: Mutex::new(MemberListState {
                members: HashMap::new(),
                version: 0,
                last_hash: topology_hash(&[]),
            }),
        }
    }

    /// Apply a provider snapshot: refresh TTLs for members present, expire
    /// the rest, and publish a topology event if the effective membership
    /// changed.
    pub fn apply(&self, snapshot: Vec<Member>) {
        let (joined, left, topology) = {
            let mut state = self.state.lock().expect("member list lock poisoned");
            let now = Instant::now();
            let deadline = now + self.ttl;

            let mut joined = Vec::new();
            for member in snapshot {
                if self.block_list.is_blocked(&member.id) {
                    continue;
                }
                if state.members.insert(member.id.clone(), (member.clone(), deadline)).is_none() {
                    joined.push(member);
                }
            }

            let mut left = Vec::new();
            state.members.retain(|_, (member, expiry)| {
                let keep = *expiry > now && !self.block_list.is_blocked(&member.id);
                if !keep {
                    left.push(member.clone());
                }
                keep
            });

            let mut members: Vec<Member> =
                state.members.values().map(|(member, _)| member.clone()).collect();
            members.sort_by(|a, b| a.id.cmp(&b.id));

            let hash = topology_hash(&members);
            if hash == state.last_hash {
                return;
            }
            state.last_hash = hash;
            state.version += 1;
            (joined, left, ClusterTopology::new(state.version, members))
        };

        for member in joined {
            tracing::info!(%member, "member joined");
            self.system.event_stream().publish(&MemberJoinedEvent(member));
        }
        for member in left {
            tracing::info!(%member, "member left");
            self.system.event_stream().publish(&MemberLeftEvent(member));
        }
        tracing::debug!(
            version = topology.version,
            members = topology.members.len(),
            "publishing topology"
        );
        self.system
            .event_stream()
            .publish(&ClusterTopologyEvent(topology));
    }

    /// The currently known live members.
    pub fn members(&self) -> Vec<Member> {
        let state = self.state.lock().expect("member list lock poisoned");
        state.members.values().map(|(member, _)| member.clone()).collect()
    }
}
