/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The activator: one per member, spawns and retires grain activations.
//!
//! Activations are children of the activator, so the member's activations
//! cascade-stop with it, and their terminations flow back here to keep the
//! local activation table accurate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hive::message::MessageEnvelope;
use hive::message::PoisonPill;
use hive::message::Terminated;
use hive::registry::SpawnError;
use hive::Actor;
use hive::Context;
use hive::Pid;

use crate::cluster::Cluster;
use crate::events::ActivationTerminatedEvent;
use crate::identity::ClusterIdentity;
use crate::kind::Placement;
use crate::messages::Activate;
use crate::messages::ActivationResponse;
use crate::messages::ClusterInit;
use crate::messages::DeactivateActivation;
use crate::topology::ClusterTopology;

/// The well-known name the activator is registered under on every member.
pub const ACTIVATOR_NAME: &str = "activator";

/// The pid of the activator on the member at `address`.
pub(crate) fn activator_pid(address: &str) -> Pid {
    Pid::new(address, ACTIVATOR_NAME)
}

pub(crate) struct ActivatorActor {
    cluster: Cluster,
    activations: HashMap<ClusterIdentity, Pid>,
}

impl ActivatorActor {
    pub(crate) fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            activations: HashMap::new(),
        }
    }

    fn activate(
        &mut self,
        cx: &mut dyn Context,
        identity: &ClusterIdentity,
    ) -> Option<Pid> {
        if let Some(pid) = self.activations.get(identity) {
            return Some(pid.clone());
        }
        let kind = self.cluster.kind(&identity.kind)?;
        let name = format!("{}/{}", identity.kind, identity.identity);
        let pid = match cx.spawn_named(kind.props.clone(), &name) {
            Ok(pid) => pid,
            Err(SpawnError::NameExists(_)) => {
                // A concurrent request won the spawn; the registered child
                // is the activation.
                let child_id = format!("{}/{}", cx.self_pid().id(), name);
                cx.system().registry().get_local(&child_id)?;
                Pid::new(cx.self_pid().address(), child_id)
            }
        };
        cx.send(
            &pid,
            Arc::new(ClusterInit {
                identity: identity.clone(),
            }),
        );
        self.activations.insert(identity.clone(), pid.clone());
        tracing::info!(identity = %identity, %pid, "activated");
        Some(pid)
    }

    fn schedule_deactivation(&self, cx: &dyn Context, identity: &ClusterIdentity) {
        let Some(pid) = self.activations.get(identity).cloned() else {
            return;
        };
        let system = cx.system().clone();
        let delay = self.cluster.config().quiescence_delay;
        let identity = identity.clone();
        // Graceful: in-flight user messages drain ahead of the pill.
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::info!(identity = %identity, %pid, "deactivating");
            pid.send_user_message(&system, MessageEnvelope::new(PoisonPill));
        });
    }

    fn handle_topology(&mut self, cx: &dyn Context, _topology: &ClusterTopology) {
        let my_address = cx.self_pid().address().to_string();
        let moved: Vec<ClusterIdentity> = self
            .activations
            .keys()
            .filter(|identity| {
                let Some(kind) = self.cluster.kind(&identity.kind) else {
                    return false;
                };
                if kind.placement != Placement::OwnerLocal {
                    return false;
                }
                match self.cluster.owner_for(identity) {
                    Some(owner) => owner.address() != my_address,
                    None => false,
                }
            })
            .cloned()
            .collect();
        for identity in moved {
            self.schedule_deactivation(cx, &identity);
        }
    }
}

#[async_trait]
impl Actor for ActivatorActor {
    async fn receive(&mut self, cx: &mut dyn Context) -> Result<(), anyhow::Error> {
        let envelope = match cx.envelope() {
            Some(envelope) => envelope.clone(),
            None => return Ok(()),
        };

        if let Some(Activate { identity }) = envelope.downcast_ref::<Activate>() {
            let identity = identity.clone();
            let pid = self.activate(cx, &identity);
            cx.respond(Arc::new(ActivationResponse { pid }));
        } else if let Some(request) = envelope.downcast_ref::<DeactivateActivation>() {
            let identity = request.identity.clone();
            self.schedule_deactivation(cx, &identity);
        } else if let Some(topology) = envelope.downcast_ref::<ClusterTopology>() {
            let topology = topology.clone();
            self.handle_topology(cx, &topology);
        } else if let Some(terminated) = envelope.downcast_ref::<Terminated>() {
            let who = terminated.who.clone();
            if let Some(identity) = self
                .activations
                .iter()
                .find(|(_, pid)| **pid == who)
                .map(|(identity, _)| identity.clone())
            {
                self.activations.remove(&identity);
                cx.system()
                    .event_stream()
                    .publish(&ActivationTerminatedEvent { identity, pid: who });
            }
        }
        Ok(())
    }
}
