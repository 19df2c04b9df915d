/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Cluster kinds: the activation recipes registered on a member.

use hive::Props;

/// Where a kind's activations are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Activate on the member that owns the identity's directory
    /// partition. Ownership moves rebalance the activation.
    OwnerLocal,
    /// Activate on any member carrying the kind, chosen deterministically
    /// per identity; the activation stays put across ownership moves.
    AnyMember,
}

/// A named activation recipe: the props grains of this kind are spawned
/// from, plus the placement policy.
#[derive(Clone)]
pub struct ClusterKind {
    /// The kind name, matched against [`crate::identity::ClusterIdentity::kind`].
    pub name: String,
    /// The props each activation is spawned from.
    pub props: Props,
    /// The placement policy.
    pub placement: Placement,
}

impl ClusterKind {
    /// Create a kind with owner-local placement.
    pub fn new(name: impl Into<String>, props: Props) -> Self {
        Self {
            name: name.into(),
            props,
            placement: Placement::OwnerLocal,
        }
    }

    /// Override the placement policy.
    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }
}

impl std::fmt::Debug for ClusterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterKind")
            .field("name", &self.name)
            .field("placement", &self.placement)
            .finish_non_exhaustive()
    }
}
