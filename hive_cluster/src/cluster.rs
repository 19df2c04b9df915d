/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The cluster facade: membership, the identity directory, and the
//! virtual-actor request path.
//!
//! A [`Cluster`] layers over one [`ActorSystem`]: it registers the member
//! with the membership provider, hosts the activator and the per-kind
//! partition actors, applies topology snapshots (rebuilding ownership
//! rings, pruning the pid cache, retiring moved activations), and exposes
//! [`Cluster::request`], which turns `(kind, identity)` calls into
//! activated-actor invocations with bounded retries.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use hive::event_stream::Subscription;
use hive::hashring::HashRing;
use hive::message::DeadLetterResponse;
use hive::ActorSystem;
use hive::AskError;
use hive::Message;
use hive::Pid;
use hive::Props;
use uuid::Uuid;

use crate::activator::ActivatorActor;
use crate::activator::ACTIVATOR_NAME;
use crate::block_list::BlockList;
use crate::events::ClusterTopologyEvent;
use crate::events::MemberBlockedEvent;
use crate::events::TopologyApplied;
use crate::identity::ClusterIdentity;
use crate::kind::ClusterKind;
use crate::kind::Placement;
use crate::member::Member;
use crate::member_list::MemberList;
use crate::messages::GrainErrorResponse;
use crate::partition::partition_actor_name;
use crate::partition::IdentityLookup;
use crate::partition::PartitionActor;
use crate::partition::PartitionLookup;
use crate::pid_cache::PidCache;
use crate::provider::ClusterProvider;
use crate::topology::ClusterTopology;

/// Errors surfaced by the cluster request path.
#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    /// Retries were exhausted without reaching a live activation.
    #[error("identity {identity} unavailable after {attempts} attempts")]
    IdentityUnavailable {
        /// The unresolvable identity.
        identity: ClusterIdentity,
        /// How many attempts were made.
        attempts: u32,
    },

    /// The grain answered with an application error; propagated verbatim,
    /// never retried.
    #[error("grain error {code}: {message}")]
    Grain {
        /// The grain's error code.
        code: String,
        /// The grain's error message.
        message: String,
    },

    /// The target member is on the block list.
    #[error("member at {0} is blocked")]
    MemberBlocked(String),
}

/// Cluster configuration.
#[derive(Clone)]
pub struct ClusterConfig {
    /// The host this member binds its identity to.
    pub host: String,
    /// The port this member binds its identity to.
    pub port: u16,
    /// The member id; generated when unset.
    pub member_id: Option<String>,
    /// The kinds this member can activate.
    pub kinds: Vec<ClusterKind>,
    /// Deadline for requests issued without an explicit timeout; falls
    /// back to the system's `actor_request_timeout` when unset.
    pub request_timeout: Option<Duration>,
    /// Attempts per request before reporting the identity unavailable.
    pub max_request_attempts: u32,
    /// Pause between attempts that failed to resolve a pid.
    pub request_retry_delay: Duration,
    /// Deadline for directory and activation round trips.
    pub activation_timeout: Duration,
    /// Grace period before a moved activation is retired; in-flight
    /// messages drain during it.
    pub quiescence_delay: Duration,
    /// How long a member stays live without a provider refresh.
    pub member_ttl: Duration,
    /// Override the identity lookup strategy.
    pub identity_lookup: Option<Arc<dyn IdentityLookup>>,
}

impl ClusterConfig {
    /// Create a configuration for a member at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            member_id: None,
            kinds: Vec::new(),
            request_timeout: None,
            max_request_attempts: 5,
            request_retry_delay: Duration::from_millis(50),
            activation_timeout: Duration::from_secs(3),
            quiescence_delay: Duration::from_secs(1),
            member_ttl: Duration::from_secs(15),
            identity_lookup: None,
        }
    }

    /// Register a kind.
    pub fn with_kind(mut self, kind: ClusterKind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Fix the member id instead of generating one.
    pub fn with_member_id(mut self, member_id: impl Into<String>) -> Self {
        self.member_id = Some(member_id.into());
        self
    }

    /// Override the quiescence delay.
    pub fn with_quiescence_delay(mut self, delay: Duration) -> Self {
        self.quiescence_delay = delay;
        self
    }

    /// Override the member TTL.
    pub fn with_member_ttl(mut self, ttl: Duration) -> Self {
        self.member_ttl = ttl;
        self
    }
}

impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("member_id", &self.member_id)
            .field("kinds", &self.kinds.iter().map(|k| &k.name).collect::<Vec<_>>())
            .field("max_request_attempts", &self.max_request_attempts)
            .finish_non_exhaustive()
    }
}

struct ClusterActors {
    activator: Pid,
    partitions: HashMap<String, Pid>,
}

struct ClusterInner {
    system: ActorSystem,
    config: ClusterConfig,
    member: Member,
    provider: Arc<dyn ClusterProvider>,
    lookup: Arc<dyn IdentityLookup>,
    kinds: HashMap<String, ClusterKind>,
    pid_cache: PidCache,
    block_list: Arc<BlockList>,
    member_list: OnceLock<Arc<MemberList>>,
    topology: RwLock<ClusterTopology>,
    rings: RwLock<HashMap<String, Arc<HashRing<Member>>>>,
    actors: OnceLock<ClusterActors>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// A handle to a running cluster member. Cheap to clone.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// Join the cluster: assign the system's address, spawn the cluster
    /// actors, subscribe to topology changes, and register with the
    /// membership provider.
    pub async fn start(
        system: ActorSystem,
        config: ClusterConfig,
        provider: Arc<dyn ClusterProvider>,
    ) -> Result<Cluster, anyhow::Error> {
        system.set_address(format!("{}:{}", config.host, config.port));

        let member_id = config
            .member_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let kind_names: Vec<String> = config.kinds.iter().map(|kind| kind.name.clone()).collect();
        let member = Member::new(member_id, config.host.clone(), config.port, kind_names);

        let mut kinds = HashMap::new();
        for kind in &config.kinds {
            if kinds.insert(kind.name.clone(), kind.clone()).is_some() {
                anyhow::bail!("kind '{}' registered twice", kind.name);
            }
        }

        let lookup = config
            .identity_lookup
            .clone()
            .unwrap_or_else(|| Arc::new(PartitionLookup));
        let block_list = Arc::new(BlockList::new(system.config().blocked_member_duration));

        let cluster = Cluster {
            inner: Arc::new(ClusterInner {
                system: system.clone(),
                config,
                member: member.clone(),
                provider: provider.clone(),
                lookup,
                kinds,
                pid_cache: PidCache::new(4096),
                block_list: block_list.clone(),
                member_list: OnceLock::new(),
                topology: RwLock::new(ClusterTopology::default()),
                rings: RwLock::new(HashMap::new()),
                actors: OnceLock::new(),
                subscriptions: Mutex::new(Vec::new()),
            }),
        };

        let root = system.root();
        let activator_cluster = cluster.clone();
        let activator = root.spawn_named(
            Props::from_producer(move |_| {
                Box::new(ActivatorActor::new(activator_cluster.clone()))
            }),
            ACTIVATOR_NAME,
        )?;
        let mut partitions = HashMap::new();
        for kind in cluster.inner.kinds.keys() {
            let partition_cluster = cluster.clone();
            let kind_name = kind.clone();
            let pid = root.spawn_named(
                Props::from_producer(move |_| {
                    Box::new(PartitionActor::new(
                        partition_cluster.clone(),
                        kind_name.clone(),
                    ))
                }),
                &partition_actor_name(kind),
            )?;
            partitions.insert(kind.clone(), pid);
        }
        let _ = cluster.inner.actors.set(ClusterActors {
            activator,
            partitions,
        });

        let topology_cluster = cluster.clone();
        let subscription = system
            .event_stream()
            .subscribe::<ClusterTopologyEvent>(move |event| {
                topology_cluster.apply_topology(event.0.clone());
            });
        cluster
            .inner
            .subscriptions
            .lock()
            .expect("cluster subscriptions lock poisoned")
            .push(subscription);

        let member_list = Arc::new(MemberList::new(
            system.clone(),
            block_list,
            cluster.inner.config.member_ttl,
        ));
        let _ = cluster.inner.member_list.set(member_list.clone());

        tracing::info!(%member, "joining cluster");
        provider.start_member(member, member_list).await?;
        Ok(cluster)
    }

    /// The owning actor system.
    pub fn system(&self) -> &ActorSystem {
        &self.inner.system
    }

    /// The cluster configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// This member's identity record.
    pub fn member(&self) -> &Member {
        &self.inner.member
    }

    /// This member's address.
    pub fn address(&self) -> String {
        self.inner.member.address()
    }

    /// The current topology snapshot.
    pub fn topology(&self) -> ClusterTopology {
        self.inner
            .topology
            .read()
            .expect("cluster topology lock poisoned")
            .clone()
    }

    /// The registered kind, if any.
    pub fn kind(&self, name: &str) -> Option<ClusterKind> {
        self.inner.kinds.get(name).cloned()
    }

    /// The pid cache.
    pub fn pid_cache(&self) -> &PidCache {
        &self.inner.pid_cache
    }

    /// The block list.
    pub fn block_list(&self) -> &BlockList {
        &self.inner.block_list
    }

    /// The directory owner of `identity` in the current topology: the
    /// consistent hash of the identity over the members carrying its kind.
    pub fn owner_for(&self, identity: &ClusterIdentity) -> Option<Member> {
        let rings = self.inner.rings.read().expect("cluster rings lock poisoned");
        rings.get(&identity.kind)?.get(&identity.identity).cloned()
    }

    /// The member an activation of `identity` should be placed on,
    /// according to its kind's placement policy.
    pub(crate) fn placement_for(&self, identity: &ClusterIdentity) -> Option<Member> {
        match self.kind(&identity.kind)?.placement {
            Placement::OwnerLocal => self.owner_for(identity),
            Placement::AnyMember => {
                let rings = self.inner.rings.read().expect("cluster rings lock poisoned");
                // A salted key decorrelates placement from ownership.
                rings
                    .get(&identity.kind)?
                    .get(&format!("{}&placement", identity.identity))
                    .cloned()
            }
        }
    }

    /// Block `member_id` for the configured duration and drop it from the
    /// live set. Sends towards it short-circuit until the block expires.
    pub fn block_member(&self, member_id: &str) {
        let address = self
            .topology()
            .members
            .iter()
            .find(|member| member.id == member_id)
            .map(|member| member.address())
            .unwrap_or_default();
        self.inner.block_list.block(member_id, address);
        self.inner.system.event_stream().publish(&MemberBlockedEvent {
            member_id: member_id.to_string(),
        });
        if let Some(member_list) = self.inner.member_list.get() {
            // Reapply the current membership so the block takes effect in
            // the topology immediately.
            member_list.apply(member_list.members());
        }
    }

    /// Issue a request against a virtual actor with the default deadline.
    pub async fn request(
        &self,
        identity: &ClusterIdentity,
        message: Arc<dyn Message>,
    ) -> Result<Arc<dyn Message>, ClusterError> {
        let timeout = self
            .inner
            .config
            .request_timeout
            .unwrap_or_else(|| self.inner.system.config().actor_request_timeout);
        self.request_with_timeout(identity, message, timeout).await
    }

    /// Issue a request against a virtual actor.
    ///
    /// The identity is resolved through the pid cache and the identity
    /// lookup, the message is asked against the resolved pid, and
    /// transient failures (dead letter, not found, topology change) are
    /// retried with the cache invalidated, up to `max_request_attempts` within
    /// `timeout`. Application errors from the grain are returned without
    /// retry.
    pub async fn request_with_timeout(
        &self,
        identity: &ClusterIdentity,
        message: Arc<dyn Message>,
        timeout: Duration,
    ) -> Result<Arc<dyn Message>, ClusterError> {
        let started = Instant::now();
        let mut attempts = 0;

        while attempts < self.inner.config.max_request_attempts {
            let Some(remaining) = timeout.checked_sub(started.elapsed()) else {
                break;
            };
            attempts += 1;

            let pid = match self.inner.pid_cache.get(identity) {
                Some(pid) => pid,
                None => match self.inner.lookup.get(self, identity).await {
                    Some(pid) => {
                        self.inner.pid_cache.set(identity.clone(), pid.clone());
                        pid
                    }
                    None => {
                        tokio::time::sleep(self.inner.config.request_retry_delay).await;
                        continue;
                    }
                },
            };

            if self.inner.block_list.is_blocked_address(pid.address()) {
                self.inner.pid_cache.invalidate(identity);
                return Err(ClusterError::MemberBlocked(pid.address().to_string()));
            }

            let future =
                self.inner
                    .system
                    .root()
                    .request_future(&pid, message.clone(), remaining);
            match future.result().await {
                Ok(envelope) if envelope.is::<DeadLetterResponse>() => {
                    self.inner.pid_cache.invalidate(identity);
                }
                Ok(envelope) => {
                    if let Some(error) = envelope.downcast_ref::<GrainErrorResponse>() {
                        return Err(ClusterError::Grain {
                            code: error.code.clone(),
                            message: error.message.clone(),
                        });
                    }
                    return Ok(envelope.message().clone());
                }
                Err(AskError::DeadLetter) | Err(AskError::Timeout) => {
                    self.inner.pid_cache.invalidate(identity);
                }
            }
        }

        Err(ClusterError::IdentityUnavailable {
            identity: identity.clone(),
            attempts,
        })
    }

    /// Leave the cluster: deregister from the provider, retire the cluster
    /// actors (cascade-stopping local activations), and honor
    /// `exit_on_shutdown`.
    pub async fn shutdown(&self) -> Result<(), anyhow::Error> {
        tracing::info!(member = %self.inner.member, "cluster shutting down");
        self.inner
            .provider
            .shutdown_member(&self.inner.member.id)
            .await?;

        for subscription in self
            .inner
            .subscriptions
            .lock()
            .expect("cluster subscriptions lock poisoned")
            .drain(..)
        {
            subscription.unsubscribe();
        }

        if let Some(actors) = self.inner.actors.get() {
            let root = self.inner.system.root();
            for pid in actors.partitions.values() {
                let _ = root.stop_future(pid, Duration::from_secs(5)).result().await;
            }
            let _ = root
                .poison_future(&actors.activator, Duration::from_secs(10))
                .result()
                .await;
        }

        if self.inner.system.config().exit_on_shutdown {
            tracing::info!("exit_on_shutdown set, terminating process");
            std::process::exit(0);
        }
        Ok(())
    }

    fn apply_topology(&self, topology: ClusterTopology) {
        {
            let mut current = self
                .inner
                .topology
                .write()
                .expect("cluster topology lock poisoned");
            if topology.version <= current.version && topology.hash == current.hash {
                return;
            }
            *current = topology.clone();
        }
        tracing::info!(
            version = topology.version,
            members = topology.members.len(),
            "applying topology"
        );

        let mut rings = HashMap::new();
        for kind in self.inner.kinds.keys() {
            let members = topology.members_with_kind(kind);
            let ring = HashRing::from_nodes(
                members.into_iter().map(|member| (member.id.clone(), member)),
            );
            rings.insert(kind.clone(), Arc::new(ring));
        }
        *self.inner.rings.write().expect("cluster rings lock poisoned") = rings;

        // Drain stale cache entries: dead members, and owner-local
        // activations whose directory owner moved.
        let live: HashSet<String> = topology
            .members
            .iter()
            .map(|member| member.address())
            .collect();
        self.inner.pid_cache.retain(|identity, pid| {
            if !live.contains(pid.address()) {
                return false;
            }
            match self.inner.kinds.get(&identity.kind).map(|kind| kind.placement) {
                Some(Placement::OwnerLocal) => self
                    .owner_for(identity)
                    .is_some_and(|owner| owner.address() == pid.address()),
                _ => true,
            }
        });

        if let Some(actors) = self.inner.actors.get() {
            let root = self.inner.system.root();
            root.send(&actors.activator, Arc::new(topology.clone()));
            for pid in actors.partitions.values() {
                root.send(pid, Arc::new(topology.clone()));
            }
        }

        self.inner.system.event_stream().publish(&TopologyApplied {
            version: topology.version,
        });
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("member", &self.inner.member)
            .field("kinds", &self.inner.kinds.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClusterConfig::new("127.0.0.1", 7001);
        assert_eq!(config.max_request_attempts, 5);
        assert_eq!(config.activation_timeout, Duration::from_secs(3));
        assert_eq!(config.member_ttl, Duration::from_secs(15));
        assert!(config.member_id.is_none());
        assert!(config.kinds.is_empty());
    }
}
