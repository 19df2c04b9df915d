/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Routers: stateless fan-out over a shared routee set.
//!
//! A group router is addressed like any actor, but its process routes user
//! messages directly through a [`RouterState`] without a mailbox hop.
//! Management messages ([`AddRoutee`], [`RemoveRoutee`], [`GetRoutees`])
//! are diverted to an internal management actor, which serializes changes
//! and publishes a new immutable routee set.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use rand::Rng;

use crate::actor::Actor;
use crate::actor_system::ActorSystem;
use crate::actor_system::WeakActorSystem;
use crate::context::Context;
use crate::hashring::HashRing;
use crate::message::MessageEnvelope;
use crate::pid::Pid;
use crate::process::Process;
use crate::props::default_spawn;
use crate::props::Props;
use crate::system_messages::SystemMessage;

/// Add a routee to the router's set.
#[derive(Debug, Clone)]
pub struct AddRoutee(pub Pid);

/// Remove a routee from the router's set.
#[derive(Debug, Clone)]
pub struct RemoveRoutee(pub Pid);

/// Ask the router for its current routee set; answered with [`Routees`].
#[derive(Debug, Clone)]
pub struct GetRoutees;

/// The router's current routee set.
#[derive(Debug, Clone)]
pub struct Routees(pub Vec<Pid>);

/// Shared routing state: an immutable routee set plus the variant's routing
/// decision.
pub trait RouterState: Send + Sync {
    /// Route one user envelope to the appropriate routee(s).
    fn route_message(&self, system: &ActorSystem, envelope: MessageEnvelope);

    /// Publish a new immutable routee set.
    fn set_routees(&self, routees: Arc<Vec<Pid>>);

    /// The current routee set.
    fn routees(&self) -> Arc<Vec<Pid>>;
}

/// Extracts the routing key for consistent-hash routing.
pub type RouteKeyFn = Arc<dyn Fn(&MessageEnvelope) -> Option<String> + Send + Sync>;

/// Props for a group router that sends every message to all routees.
pub fn broadcast_group(routees: Vec<Pid>) -> Props {
    group_props(Arc::new(BroadcastState::default()), routees)
}

/// Props for a group router that cycles through routees in order.
pub fn round_robin_group(routees: Vec<Pid>) -> Props {
    group_props(Arc::new(RoundRobinState::default()), routees)
}

/// Props for a group router that picks a routee uniformly at random.
pub fn random_group(routees: Vec<Pid>) -> Props {
    group_props(Arc::new(RandomState::default()), routees)
}

/// Props for a group router that routes by a message key on a hash ring.
/// Messages without a key are dropped with a warning.
pub fn consistent_hash_group(routees: Vec<Pid>, key_fn: RouteKeyFn) -> Props {
    group_props(Arc::new(ConsistentHashState::new(key_fn)), routees)
}

fn group_props(state: Arc<dyn RouterState>, routees: Vec<Pid>) -> Props {
    let producer_state = state.clone();
    Props::from_producer(move |_| {
        Box::new(RouterActor {
            state: producer_state.clone(),
        })
    })
    .with_spawner(Arc::new(move |system, name, props, parent| {
        state.set_routees(Arc::new(routees.clone()));

        let management_name = format!("{}/router", name);
        let management = default_spawn(system, &management_name, props, parent)?;

        let process = Arc::new(RouterProcess {
            system: system.downgrade(),
            state: state.clone(),
            management,
        });
        system.registry().add(name, process)
    }))
}

/// The process registered under the router's pid: management messages hop
/// to the management actor, everything else routes directly.
struct RouterProcess {
    system: WeakActorSystem,
    state: Arc<dyn RouterState>,
    management: Pid,
}

impl RouterProcess {
    fn is_management(envelope: &MessageEnvelope) -> bool {
        envelope.is::<AddRoutee>() || envelope.is::<RemoveRoutee>() || envelope.is::<GetRoutees>()
    }
}

impl Process for RouterProcess {
    fn send_user_message(&self, _target: &Pid, envelope: MessageEnvelope) {
        let Some(system) = self.system.upgrade() else {
            return;
        };
        if Self::is_management(&envelope) {
            self.management.send_user_message(&system, envelope);
        } else {
            self.state.route_message(&system, envelope);
        }
    }

    fn send_system_message(&self, target: &Pid, message: SystemMessage) {
        let Some(system) = self.system.upgrade() else {
            return;
        };
        if matches!(message, SystemMessage::Stop) {
            system.registry().remove(target);
        }
        self.management.send_system_message(&system, message);
    }
}

/// The management actor behind a group router: mutates the shared state
/// and answers [`GetRoutees`].
struct RouterActor {
    state: Arc<dyn RouterState>,
}

#[async_trait]
impl Actor for RouterActor {
    async fn receive(&mut self, cx: &mut dyn Context) -> Result<(), anyhow::Error> {
        if let Some(envelope) = cx.envelope() {
            if let Some(AddRoutee(pid)) = envelope.downcast_ref::<AddRoutee>() {
                let mut routees = self.state.routees().as_ref().clone();
                if !routees.contains(pid) {
                    routees.push(pid.clone());
                    self.state.set_routees(Arc::new(routees));
                }
            } else if let Some(RemoveRoutee(pid)) = envelope.downcast_ref::<RemoveRoutee>() {
                let mut routees = self.state.routees().as_ref().clone();
                routees.retain(|routee| routee != pid);
                self.state.set_routees(Arc::new(routees));
            } else if envelope.is::<GetRoutees>() {
                let routees = self.state.routees().as_ref().clone();
                cx.respond(Arc::new(Routees(routees)));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct BroadcastState {
    routees: RwLock<Arc<Vec<Pid>>>,
}

impl RouterState for BroadcastState {
    fn route_message(&self, system: &ActorSystem, envelope: MessageEnvelope) {
        let routees = self.routees();
        for routee in routees.iter() {
            routee.send_user_message(system, envelope.clone());
        }
    }

    fn set_routees(&self, routees: Arc<Vec<Pid>>) {
        *self.routees.write().expect("router state lock poisoned") = routees;
    }

    fn routees(&self) -> Arc<Vec<Pid>> {
        self.routees.read().expect("router state lock poisoned").clone()
    }
}

#[derive(Default)]
struct RoundRobinState {
    routees: RwLock<Arc<Vec<Pid>>>,
    index: AtomicUsize,
}

impl RouterState for RoundRobinState {
    fn route_message(&self, system: &ActorSystem, envelope: MessageEnvelope) {
        let routees = self.routees();
        if routees.is_empty() {
            tracing::warn!("round robin router has no routees, dropping message");
            return;
        }
        let index = self.index.fetch_add(1, Ordering::Relaxed) % routees.len();
        routees[index].send_user_message(system, envelope);
    }

    fn set_routees(&self, routees: Arc<Vec<Pid>>) {
        *self.routees.write().expect("router state lock poisoned") = routees;
        self.index.store(0, Ordering::Relaxed);
    }

    fn routees(&self) -> Arc<Vec<Pid>> {
        self.routees.read().expect("router state lock poisoned").clone()
    }
}

#[derive(Default)]
struct RandomState {
    routees: RwLock<Arc<Vec<Pid>>>,
}

impl RouterState for RandomState {
    fn route_message(&self, system: &ActorSystem, envelope: MessageEnvelope) {
        let routees = self.routees();
        if routees.is_empty() {
            tracing::warn!("random router has no routees, dropping message");
            return;
        }
        let index = rand::thread_rng().gen_range(0..routees.len());
        routees[index].send_user_message(system, envelope);
    }

    fn set_routees(&self, routees: Arc<Vec<Pid>>) {
        *self.routees.write().expect("router state lock poisoned") = routees;
    }

    fn routees(&self) -> Arc<Vec<Pid>> {
        self.routees.read().expect("router state lock poisoned").clone()
    }
}

struct ConsistentHashState {
    routees: RwLock<Arc<Vec<Pid>>>,
    ring: RwLock<HashRing<Pid>>,
    key_fn: RouteKeyFn,
}

impl ConsistentHashState {
    fn new(key_fn: RouteKeyFn) -> Self {
        Self {
            routees: RwLock::new(Arc::new(Vec::new())),
            ring: RwLock::new(HashRing::default()),
            key_fn,
        }
    }
}

impl RouterState for ConsistentHashState {
    fn route_message(&self, system: &ActorSystem, envelope: MessageEnvelope) {
        let Some(key) = (self.key_fn)(&envelope) else {
            tracing::warn!("message without a routing key, dropping");
            return;
        };
        let ring = self.ring.read().expect("router state lock poisoned");
        match ring.get(&key) {
            Some(routee) => routee.send_user_message(system, envelope),
            None => tracing::warn!("consistent hash router has no routees, dropping message"),
        }
    }

    fn set_routees(&self, routees: Arc<Vec<Pid>>) {
        let mut ring = HashRing::default();
        for routee in routees.iter() {
            ring.insert(routee.id(), routee.clone());
        }
        *self.ring.write().expect("router state lock poisoned") = ring;
        *self.routees.write().expect("router state lock poisoned") = routees;
    }

    fn routees(&self) -> Arc<Vec<Pid>> {
        self.routees.read().expect("router state lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    type Deliveries = Arc<Mutex<Vec<(String, String)>>>;

    struct Collector {
        name: String,
        deliveries: Deliveries,
    }

    #[async_trait]
    impl Actor for Collector {
        async fn receive(&mut self, cx: &mut dyn Context) -> Result<(), anyhow::Error> {
            if let Some(text) = cx.envelope().and_then(|e| e.downcast_ref::<String>()) {
                self.deliveries
                    .lock()
                    .unwrap()
                    .push((self.name.clone(), text.clone()));
            }
            Ok(())
        }
    }

    fn spawn_collectors(
        system: &ActorSystem,
        count: usize,
    ) -> (Vec<Pid>, Deliveries) {
        let deliveries: Deliveries = Arc::new(Mutex::new(Vec::new()));
        let root = system.root();
        let pids = (0..count)
            .map(|i| {
                let name = format!("collector-{}", i);
                let deliveries = deliveries.clone();
                let actor_name = name.clone();
                root.spawn_named(
                    Props::from_producer(move |_| {
                        Box::new(Collector {
                            name: actor_name.clone(),
                            deliveries: deliveries.clone(),
                        })
                    }),
                    &name,
                )
                .unwrap()
            })
            .collect();
        (pids, deliveries)
    }

    async fn wait_for_deliveries(deliveries: &Deliveries, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if deliveries.lock().unwrap().len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("deliveries did not arrive in time");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_routee() {
        let system = ActorSystem::new();
        let (pids, deliveries) = spawn_collectors(&system, 3);
        let router = system
            .root()
            .spawn_named(broadcast_group(pids), "bcast")
            .unwrap();

        system.root().send(&router, Arc::new("hello".to_string()));
        wait_for_deliveries(&deliveries, 3).await;

        let mut names: Vec<String> = deliveries
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        assert_eq!(names, vec!["collector-0", "collector-1", "collector-2"]);
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let system = ActorSystem::new();
        let (pids, deliveries) = spawn_collectors(&system, 3);
        let router = system
            .root()
            .spawn_named(round_robin_group(pids), "rr")
            .unwrap();

        for i in 0..6 {
            system.root().send(&router, Arc::new(format!("m{}", i)));
        }
        wait_for_deliveries(&deliveries, 6).await;

        let mut per_routee: HashMap<String, usize> = HashMap::new();
        for (name, _) in deliveries.lock().unwrap().iter() {
            *per_routee.entry(name.clone()).or_default() += 1;
        }
        assert_eq!(per_routee.len(), 3);
        assert!(per_routee.values().all(|count| *count == 2));
    }

    #[tokio::test]
    async fn test_random_delivers_everything() {
        let system = ActorSystem::new();
        let (pids, deliveries) = spawn_collectors(&system, 3);
        let router = system
            .root()
            .spawn_named(random_group(pids), "rand")
            .unwrap();

        for i in 0..10 {
            system.root().send(&router, Arc::new(format!("m{}", i)));
        }
        wait_for_deliveries(&deliveries, 10).await;
        assert_eq!(deliveries.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_consistent_hash_is_sticky_per_key() {
        let system = ActorSystem::new();
        let (pids, deliveries) = spawn_collectors(&system, 3);
        let key_fn: RouteKeyFn =
            Arc::new(|envelope| envelope.downcast_ref::<String>().cloned());
        let router = system
            .root()
            .spawn_named(consistent_hash_group(pids, key_fn), "chash")
            .unwrap();

        for _ in 0..3 {
            system.root().send(&router, Arc::new("k1".to_string()));
            system.root().send(&router, Arc::new("k2".to_string()));
        }
        wait_for_deliveries(&deliveries, 6).await;

        let deliveries = deliveries.lock().unwrap();
        for key in ["k1", "k2"] {
            let owners: std::collections::HashSet<&String> = deliveries
                .iter()
                .filter(|(_, text)| text == key)
                .map(|(name, _)| name)
                .collect();
            assert_eq!(owners.len(), 1, "key {} landed on multiple routees", key);
        }
    }

    #[tokio::test]
    async fn test_management_messages_update_routees() {
        let system = ActorSystem::new();
        let (pids, deliveries) = spawn_collectors(&system, 2);
        let router = system
            .root()
            .spawn_named(broadcast_group(vec![pids[0].clone()]), "managed")
            .unwrap();

        let reply = system
            .root()
            .request_future(&router, Arc::new(GetRoutees), Duration::from_secs(2))
            .result()
            .await
            .unwrap();
        assert_eq!(reply.downcast_ref::<Routees>().unwrap().0.len(), 1);

        system
            .root()
            .send(&router, Arc::new(AddRoutee(pids[1].clone())));
        let reply = system
            .root()
            .request_future(&router, Arc::new(GetRoutees), Duration::from_secs(2))
            .result()
            .await
            .unwrap();
        assert_eq!(reply.downcast_ref::<Routees>().unwrap().0.len(), 2);

        system.root().send(&router, Arc::new("fanout".to_string()));
        wait_for_deliveries(&deliveries, 2).await;

        system
            .root()
            .send(&router, Arc::new(RemoveRoutee(pids[0].clone())));
        let reply = system
            .root()
            .request_future(&router, Arc::new(GetRoutees), Duration::from_secs(2))
            .result()
            .await
            .unwrap();
        assert_eq!(reply.downcast_ref::<Routees>().unwrap().0.len(), 1);
    }
}
