/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A consistent hash ring.
//!
//! Nodes are inserted under a string key and spread across the ring with a
//! fixed number of replicas. A lookup hashes its key onto the ring and
//! walks clockwise to the first node; hash collisions are broken by node
//! key, so placement is deterministic across processes.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::hash::Hash;
use std::hash::Hasher;

use rustc_hash::FxHasher;

const DEFAULT_REPLICAS: usize = 50;

/// A consistent hash ring over nodes of type `T`.
#[derive(Debug, Clone)]
pub struct HashRing<T: Clone> {
    ring: BTreeMap<u64, (String, T)>,
    nodes: BTreeSet<String>,
    replicas: usize,
}

impl<T: Clone> Default for HashRing<T> {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}

impl<T: Clone> HashRing<T> {
    /// Create an empty ring with `replicas` points per node.
    pub fn new(replicas: usize) -> Self {
        Self {
            ring: BTreeMap::new(),
            nodes: BTreeSet::new(),
            replicas: replicas.max(1),
        }
    }

    /// Build a ring from `(key, node)` pairs with the default replica
    /// count.
    pub fn from_nodes(nodes: impl IntoIterator<Item = (String, T)>) -> Self {
        let mut ring = Self::default();
        for (key, node) in nodes {
            ring.insert(&key, node);
        }
        ring
    }

    /// Insert a node under `key`.
    pub fn insert(&mut self, key: &str, node: T) {
        self.nodes.insert(key.to_string());
        for replica in 0..self.replicas {
            let point = ring_hash(&format!("{}#{}", key, replica));
            match self.ring.get(&point) {
                // Collisions are broken by node key so that every ring
                // built from the same node set agrees.
                Some((existing, _)) if existing.as_str() <= key => {}
                _ => {
                    self.ring.insert(point, (key.to_string(), node.clone()));
                }
            }
        }
    }

    /// Remove the node inserted under `key`.
    pub fn remove(&mut self, key: &str) {
        self.nodes.remove(key);
        self.ring.retain(|_, (node_key, _)| node_key != key);
    }

    /// The node owning `key`, walking clockwise from the key's hash.
    pub fn get(&self, key: &str) -> Option<&T> {
        if self.ring.is_empty() {
            return None;
        }
        let point = ring_hash(key);
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, (_, node))| node)
    }

    /// The number of nodes on the ring.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Tells whether the ring has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn ring_hash(key: &str) -> u64 {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}
