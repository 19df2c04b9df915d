/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Partitioned identity lookup: the default directory strategy.
//!
//! Every kind has, on each member, a partition actor holding the
//! authoritative `identity -> pid` map for the identities that member owns
//! in the current topology generation. Ownership is the consistent hash of
//! the identity over the members carrying the kind, so all members agree
//! without coordination.
//!
//! A lookup asks the owner's partition actor. The partition actor answers
//! from its map, or drives an activation through the placed member's
//! activator; concurrent requests for the same identity collapse onto the
//! in-flight activation, and the actor stays responsive while it waits by
//! re-entering through the activation future's continuation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hive::message::Started;
use hive::message::Terminated;
use hive::Actor;
use hive::Context;
use hive::Pid;

use crate::activator::activator_pid;
use crate::cluster::Cluster;
use crate::identity::ClusterIdentity;
use crate::kind::Placement;
use crate::messages::Activate;
use crate::messages::ActivationRequest;
use crate::messages::ActivationResponse;
use crate::messages::DeactivateActivation;
use crate::topology::ClusterTopology;

/// The well-known name of the partition actor for `kind`.
pub fn partition_actor_name(kind: &str) -> String {
    format!("partition/{}", kind)
}

/// The pid of `kind`'s partition actor on the member at `address`.
pub(crate) fn partition_pid(address: &str, kind: &str) -> Pid {
    Pid::new(address, partition_actor_name(kind))
}

/// Resolves cluster identities to live pids, activating on demand.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// Resolve `identity` to a live pid, or `None` if resolution is not
    /// currently possible (the caller retries within its deadline).
    async fn get(&self, cluster: &Cluster, identity: &ClusterIdentity) -> Option<Pid>;
}

/// The default lookup: ask the owner member's partition actor.
#[derive(Debug, Default)]
pub struct PartitionLookup;

#[async_trait]
impl IdentityLookup for PartitionLookup {
    async fn get(&self, cluster: &Cluster, identity: &ClusterIdentity) -> Option<Pid> {
        let owner = cluster.owner_for(identity)?;
        let request = ActivationRequest {
            identity: identity.clone(),
            topology_hash: cluster.topology().hash,
        };
        let target = partition_pid(&owner.address(), &identity.kind);
        let future = cluster.system().root().request_future(
            &target,
            Arc::new(request),
            cluster.config().activation_timeout,
        );
        match future.result().await {
            Ok(envelope) => envelope
                .downcast_ref::<ActivationResponse>()
                .and_then(|response| response.pid.clone()),
            Err(err) => {
                tracing::debug!(identity = %identity, %err, "identity lookup failed");
                None
            }
        }
    }
}

/// Internal: the outcome of an activation driven by this partition actor,
/// re-entered as a user message so the actor can update its map and answer
/// the collapsed waiters.
#[derive(Debug, Clone)]
struct ActivationCompleted {
    identity: ClusterIdentity,
    pid: Option<Pid>,
}

pub(crate) struct PartitionActor {
    cluster: Cluster,
    kind: String,
    identities: HashMap<String, Pid>,
    pending: HashMap<String, Vec<Pid>>,
    topology_hash: u64,
}

impl PartitionActor {
    pub(crate) fn new(cluster: Cluster, kind: String) -> Self {
        Self {
            cluster,
            kind,
            identities: HashMap::new(),
            pending: HashMap::new(),
            topology_hash: 0,
        }
    }

    fn handle_request(&mut self, cx: &mut dyn Context, request: ActivationRequest) {
        let Some(reply_to) = cx.sender().cloned() else {
            tracing::warn!(identity = %request.identity, "activation request without sender");
            return;
        };

        if request.topology_hash != self.topology_hash {
            // Another generation; the requester re-resolves once the views
            // converge.
            cx.send(&reply_to, Arc::new(ActivationResponse { pid: None }));
            return;
        }

        let key = request.identity.identity.clone();
        if let Some(pid) = self.identities.get(&key) {
            cx.send(
                &reply_to,
                Arc::new(ActivationResponse {
                    pid: Some(pid.clone()),
                }),
            );
            return;
        }

        if let Some(waiters) = self.pending.get_mut(&key) {
            waiters.push(reply_to);
            return;
        }

        let Some(host) = self.cluster.placement_for(&request.identity) else {
            cx.send(&reply_to, Arc::new(ActivationResponse { pid: None }));
            return;
        };

        self.pending.insert(key, vec![reply_to]);
        let identity = request.identity.clone();
        let future = cx.request_future(
            &activator_pid(&host.address()),
            Arc::new(Activate {
                identity: identity.clone(),
            }),
            self.cluster.config().activation_timeout,
        );
        let self_pid = cx.self_pid().clone();
        cx.reenter_after(
            future,
            Box::new(move |ctx: &mut dyn Context, result| {
                let pid = result.ok().and_then(|envelope| {
                    envelope
                        .downcast_ref::<ActivationResponse>()
                        .and_then(|response| response.pid.clone())
                });
                ctx.send(&self_pid, Arc::new(ActivationCompleted { identity, pid }));
            }),
        );
    }

    fn handle_completed(&mut self, cx: &dyn Context, completed: ActivationCompleted) {
        let key = completed.identity.identity.clone();
        let waiters = self.pending.remove(&key).unwrap_or_default();
        if let Some(pid) = &completed.pid {
            self.identities.insert(key, pid.clone());
            // Track the activation's lifetime so the map never serves a
            // terminated pid.
            cx.watch(pid);
        }
        for waiter in waiters {
            cx.send(
                &waiter,
                Arc::new(ActivationResponse {
                    pid: completed.pid.clone(),
                }),
            );
        }
    }

    fn handle_topology(&mut self, cx: &dyn Context, topology: &ClusterTopology) {
        self.topology_hash = topology.hash;

        let my_address = self.cluster.address();
        let owner_local = self
            .cluster
            .kind(&self.kind)
            .map(|kind| kind.placement == Placement::OwnerLocal)
            .unwrap_or(false);

        let mut dropped: Vec<(String, Pid)> = Vec::new();
        self.identities.retain(|key, pid| {
            let identity = ClusterIdentity::new(self.kind.clone(), key.clone());
            let owned = self
                .cluster
                .owner_for(&identity)
                .is_some_and(|owner| owner.address() == my_address);
            if !owned {
                dropped.push((key.clone(), pid.clone()));
            }
            owned
        });

        for (key, pid) in dropped {
            let identity = ClusterIdentity::new(self.kind.clone(), key);
            tracing::debug!(identity = %identity, "forgetting moved identity");
            // Owner-local activations must follow their directory entry;
            // tell the hosting member to retire the stale activation.
            if owner_local {
                cx.send(
                    &activator_pid(pid.address()),
                    Arc::new(DeactivateActivation { identity }),
                );
            }
        }
    }
}

#[async_trait]
impl Actor for PartitionActor {
    async fn receive(&mut self, cx: &mut dyn Context) -> Result<(), anyhow::Error> {
        let envelope = match cx.envelope() {
            Some(envelope) => envelope.clone(),
            None => return Ok(()),
        };

        if envelope.is::<Started>() {
            self.topology_hash = self.cluster.topology().hash;
        } else if let Some(request) = envelope.downcast_ref::<ActivationRequest>() {
            let request = request.clone();
            self.handle_request(cx, request);
        } else if let Some(completed) = envelope.downcast_ref::<ActivationCompleted>() {
            let completed = completed.clone();
            self.handle_completed(cx, completed);
        } else if let Some(topology) = envelope.downcast_ref::<ClusterTopology>() {
            let topology = topology.clone();
            self.handle_topology(cx, &topology);
        } else if let Some(terminated) = envelope.downcast_ref::<Terminated>() {
            let who = terminated.who.clone();
            self.identities.retain(|_, pid| *pid != who);
        }
        Ok(())
    }
}
