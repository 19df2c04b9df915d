/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Topology snapshots.
//!
//! A topology is an immutable view of the live member set, stamped with a
//! monotonically increasing version and an order-independent hash.
//! Subscribers always observe one coherent snapshot; updates replace the
//! whole record.

use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use rustc_hash::FxHasher;

use crate::member::Member;

/// An immutable snapshot of the live member set.
#[derive(Debug, Clone, Default)]
pub struct ClusterTopology {
    /// Monotonic snapshot version, local to this member.
    pub version: u64,
    /// An order-independent hash of the member ids; two members observing
    /// the same membership compute the same hash.
    pub hash: u64,
    /// The live, unblocked members.
    pub members: Arc<Vec<Member>>,
}

impl ClusterTopology {
    /// Build a snapshot over `members` with the given version.
    pub fn new(version: u64, members: Vec<Member>) -> Self {
        let hash = topology_hash(&members);
        Self {
            version,
            hash,
            members: Arc::new(members),
        }
    }

    /// The members that can activate `kind`.
    pub fn members_with_kind(&self, kind: &str) -> Vec<Member> {
        self.members
            .iter()
            .filter(|member| member.has_kind(kind))
            .cloned()
            .collect()
    }

    /// Look up a member by its address.
    pub fn member_at(&self, address: &str) -> Option<&Member> {
        self.members.iter().find(|member| member.address() == address)
    }
}

/// The order-independent hash over a member set.
pub fn topology_hash(members: &[Member]) -> u64 {
    members
        .iter()
        .map(|member| {
            let mut hasher = FxHasher::default();
            member.id.hash(&mut hasher);
            member.address().hash(&mut hasher);
            hasher.finish()
        })
        .fold(0u64, |acc, h| acc ^ h)
}
