/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end cluster scenarios over in-process members.
//!
//! Members are full actor systems wired together with address resolvers,
//! so every cross-member interaction (directory asks, activations, grain
//! requests, watches) exercises the same paths a transport would.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive::Actor;
use hive::ActorSystem;
use hive::Context;
use hive::Message;
use hive::Props;
use hive_cluster::Cluster;
use hive_cluster::ClusterConfig;
use hive_cluster::ClusterError;
use hive_cluster::ClusterIdentity;
use hive_cluster::ClusterKind;
use hive_cluster::GrainErrorResponse;
use hive_cluster::LocalProvider;

#[derive(Default)]
struct GrainCounters {
    active: AtomicUsize,
    activations: AtomicUsize,
}

struct EchoGrain {
    counters: Arc<GrainCounters>,
}

#[async_trait]
impl Actor for EchoGrain {
    async fn receive(&mut self, cx: &mut dyn Context) -> Result<(), anyhow::Error> {
        let envelope = match cx.envelope() {
            Some(envelope) => envelope.clone(),
            None => return Ok(()),
        };
        if envelope.is::<hive::message::Started>() {
            self.counters.active.fetch_add(1, Ordering::SeqCst);
            self.counters.activations.fetch_add(1, Ordering::SeqCst);
        } else if envelope.is::<hive::message::Stopped>() {
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
        } else if let Some(text) = envelope.downcast_ref::<String>() {
            match text.as_str() {
                "ping" => cx.respond(Arc::new("pong".to_string())),
                "fail" => cx.respond(Arc::new(GrainErrorResponse::new("bad", "nope"))),
                _ => {}
            }
        }
        Ok(())
    }
}

fn echo_kind(counters: Arc<GrainCounters>) -> ClusterKind {
    ClusterKind::new(
        "echo",
        Props::from_producer(move |_| {
            Box::new(EchoGrain {
                counters: counters.clone(),
            })
        }),
    )
}

/// Wire two systems together so pids with the peer's address resolve into
/// the peer's registry.
fn bridge(a: &ActorSystem, b: &ActorSystem) {
    let b_address = b.address();
    let b_system = b.clone();
    a.registry().register_resolver(Arc::new(move |pid| {
        (pid.address() == b_address)
            .then(|| b_system.registry().get_local(pid.id()))
            .flatten()
    }));
    let a_address = a.address();
    let a_system = a.clone();
    b.registry().register_resolver(Arc::new(move |pid| {
        (pid.address() == a_address)
            .then(|| a_system.registry().get_local(pid.id()))
            .flatten()
    }));
}

async fn start_member(
    provider: &Arc<LocalProvider>,
    member_id: &str,
    port: u16,
    counters: Arc<GrainCounters>,
) -> (ActorSystem, Cluster) {
    let system = ActorSystem::new();
    let config = ClusterConfig::new("127.0.0.1", port)
        .with_member_id(member_id)
        .with_quiescence_delay(Duration::from_millis(100))
        .with_kind(echo_kind(counters));
    let cluster = Cluster::start(system.clone(), config, provider.clone())
        .await
        .unwrap();
    (system, cluster)
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

async fn wait_for_members(cluster: &Cluster, count: usize) {
    wait_for("membership to settle", || {
        cluster.topology().members.len() == count
    })
    .await;
}

/// Request with client-side retries, for windows where the directory is
/// converging on a new topology.
async fn request_text(cluster: &Cluster, identity: &ClusterIdentity, text: &str) -> String {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        match cluster.request(identity, Arc::new(text.to_string())).await {
            Ok(reply) => {
                return reply
                    .as_any()
                    .downcast_ref::<String>()
                    .expect("string reply")
                    .clone();
            }
            Err(err) => {
                assert!(
                    std::time::Instant::now() < deadline,
                    "request never succeeded: {}",
                    err
                );
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

#[tokio::test]
async fn test_first_request_activates_then_reuses_cached_pid() {
    let provider = Arc::new(LocalProvider::new(
        Duration::from_secs(15),
        Duration::from_millis(100),
    ));
    let counters = Arc::new(GrainCounters::default());
    let (_system, cluster) = start_member(&provider, "m1", 7101, counters.clone()).await;
    wait_for_members(&cluster, 1).await;

    let identity = ClusterIdentity::new("echo", "k1");
    assert_eq!(request_text(&cluster, &identity, "ping").await, "pong");
    assert_eq!(counters.activations.load(Ordering::SeqCst), 1);
    assert!(cluster.pid_cache().get(&identity).is_some());

    // The second call is answered by the same activation through the
    // cache.
    assert_eq!(request_text(&cluster, &identity, "ping").await, "pong");
    assert_eq!(counters.activations.load(Ordering::SeqCst), 1);

    cluster.shutdown().await.unwrap();
    wait_for("activations to stop with the cluster", || {
        counters.active.load(Ordering::SeqCst) == 0
    })
    .await;
}

#[tokio::test]
async fn test_grain_errors_propagate_without_retry() {
    let provider = Arc::new(LocalProvider::new(
        Duration::from_secs(15),
        Duration::from_millis(100),
    ));
    let counters = Arc::new(GrainCounters::default());
    let (_system, cluster) = start_member(&provider, "m1", 7501, counters.clone()).await;
    wait_for_members(&cluster, 1).await;

    let identity = ClusterIdentity::new("echo", "failing");
    // Activate first so the error round trip is a single attempt.
    assert_eq!(request_text(&cluster, &identity, "ping").await, "pong");

    match cluster.request(&identity, Arc::new("fail".to_string())).await {
        Err(ClusterError::Grain { code, message }) => {
            assert_eq!(code, "bad");
            assert_eq!(message, "nope");
        }
        other => panic!("expected grain error, got {:?}", other.map(|_| ())),
    }
    assert_eq!(counters.activations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_first_requests_collapse_to_one_activation() {
    let provider = Arc::new(LocalProvider::new(
        Duration::from_secs(15),
        Duration::from_millis(100),
    ));
    let counters = Arc::new(GrainCounters::default());
    let (_system, cluster) = start_member(&provider, "m1", 7401, counters.clone()).await;
    wait_for_members(&cluster, 1).await;

    let identity = ClusterIdentity::new("echo", "hot");
    let requests: Vec<_> = (0..8)
        .map(|_| {
            let cluster = cluster.clone();
            let identity = identity.clone();
            tokio::spawn(async move { request_text(&cluster, &identity, "ping").await })
        })
        .collect();
    for request in requests {
        assert_eq!(request.await.unwrap(), "pong");
    }
    assert_eq!(counters.activations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cross_member_request_and_rebalance_on_member_loss() {
    let provider = Arc::new(LocalProvider::new(
        Duration::from_secs(15),
        Duration::from_millis(100),
    ));
    let counters_a = Arc::new(GrainCounters::default());
    let counters_b = Arc::new(GrainCounters::default());
    let (system_a, cluster_a) = start_member(&provider, "m1", 7201, counters_a.clone()).await;
    let (system_b, cluster_b) = start_member(&provider, "m2", 7202, counters_b.clone()).await;
    bridge(&system_a, &system_b);
    wait_for_members(&cluster_a, 2).await;
    wait_for_members(&cluster_b, 2).await;

    // Pick an identity whose directory partition is owned by m1; both
    // members compute ownership from the same ring, so they agree.
    let identity = (0..)
        .map(|i| ClusterIdentity::new("echo", format!("k{}", i)))
        .find(|identity| {
            cluster_a
                .owner_for(identity)
                .is_some_and(|owner| owner.id == "m1")
        })
        .unwrap();
    assert_eq!(
        cluster_b.owner_for(&identity).unwrap().id,
        "m1",
        "members disagree on ownership"
    );

    // Requesting from m2 activates on the owner, m1.
    assert_eq!(request_text(&cluster_b, &identity, "ping").await, "pong");
    assert_eq!(counters_a.activations.load(Ordering::SeqCst), 1);
    assert_eq!(counters_b.activations.load(Ordering::SeqCst), 0);
    let cached = cluster_b.pid_cache().get(&identity).unwrap();
    assert_eq!(cached.address(), cluster_a.address());

    // m1 drops out of membership (a crash as far as the provider can
    // tell); its actors keep running.
    provider.fail_member("m1");
    wait_for_members(&cluster_b, 1).await;

    // The next request re-resolves onto m2 and activates there.
    assert_eq!(request_text(&cluster_b, &identity, "ping").await, "pong");
    wait_for("activation on the new owner", || {
        counters_b.activations.load(Ordering::SeqCst) == 1
    })
    .await;
    let cached = cluster_b.pid_cache().get(&identity).unwrap();
    assert_eq!(cached.address(), cluster_b.address());

    // The stale activation on m1 is asked to stop once m1 observes the
    // topology without itself, within the quiescence window.
    wait_for_members(&cluster_a, 1).await;
    wait_for("stale activation to retire", || {
        counters_a.active.load(Ordering::SeqCst) == 0
    })
    .await;
}

#[tokio::test]
async fn test_sends_to_blocked_members_short_circuit() {
    let provider = Arc::new(LocalProvider::new(
        Duration::from_secs(15),
        Duration::from_millis(100),
    ));
    let counters_a = Arc::new(GrainCounters::default());
    let counters_b = Arc::new(GrainCounters::default());
    let (system_a, cluster_a) = start_member(&provider, "m1", 7301, counters_a.clone()).await;
    let (system_b, cluster_b) = start_member(&provider, "m2", 7302, counters_b.clone()).await;
    bridge(&system_a, &system_b);
    wait_for_members(&cluster_a, 2).await;
    wait_for_members(&cluster_b, 2).await;

    let identity = (0..)
        .map(|i| ClusterIdentity::new("echo", format!("b{}", i)))
        .find(|identity| {
            cluster_b
                .owner_for(identity)
                .is_some_and(|owner| owner.id == "m1")
        })
        .unwrap();
    assert_eq!(request_text(&cluster_b, &identity, "ping").await, "pong");
    assert!(cluster_b.pid_cache().get(&identity).is_some());

    // Block m1 on the raw block list, leaving the cached pid in place:
    // the next send short-circuits instead of going to the wire.
    cluster_b
        .block_list()
        .block("m1", cluster_a.address());
    match cluster_b.request(&identity, Arc::new("ping".to_string())).await {
        Err(ClusterError::MemberBlocked(address)) => {
            assert_eq!(address, cluster_a.address());
        }
        other => panic!("expected member blocked, got {:?}", other.map(|_| ())),
    }
    // The short circuit also invalidated the cached entry.
    assert!(cluster_b.pid_cache().get(&identity).is_none());
}
