/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Membership providers.
//!
//! A provider is the cluster's source of membership truth: it registers
//! the local member, keeps its registration fresh, and pushes full
//! snapshots into each member's [`MemberList`] on changes and on periodic
//! refresh, with at-least-once delivery of the latest snapshot.
//!
//! [`LocalProvider`] is the in-process implementation, suitable for tests
//! and single-process deployments; production clusters plug in an external
//! source behind the same trait.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::member::Member;
use crate::member_list::MemberList;

/// A pluggable membership source.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Register `member` and begin pushing snapshots into `member_list`.
    async fn start_member(
        &self,
        member: Member,
        member_list: Arc<MemberList>,
    ) -> Result<(), anyhow::Error>;

    /// Deregister the member and stop refreshing it.
    async fn shutdown_member(&self, member_id: &str) -> Result<(), anyhow::Error>;
}

struct Registration {
    member: Member,
    deadline: Instant,
    heartbeat: CancellationToken,
}

struct LocalProviderState {
    registrations: Mutex<HashMap<String, Registration>>,
    subscribers: Mutex<Vec<Arc<MemberList>>>,
    ttl: Duration,
    refresh: Duration,
}

/// An in-process membership provider shared by every member of an
/// in-process cluster. Registrations are kept alive by heartbeat tasks and
/// expire after the TTL when a heartbeat stops.
#[derive(Clone)]
pub struct LocalProvider {
    state: Arc<LocalProviderState>,
}

impl Default for LocalProvider {
    fn default() -> Self {
        // Test-fixture defaults; production providers refresh against an
        // external source with their own cadence.
        Self::new(Duration::from_secs(15), Duration::from_secs(3))
    }
}

impl LocalProvider {
    /// Create a provider with the given registration TTL and heartbeat
    /// refresh interval.
    pub fn new(ttl: Duration, refresh: Duration) -> Self {
        Self {
            state: Arc::new(LocalProviderState {
                registrations: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                ttl,
                refresh,
            }),
        }
    }

    /// Failure-injection hook: drop a member without deregistering it
    /// gracefully, as a crashed process would. Its actors keep running;
    /// membership simply stops seeing it.
    pub fn fail_member(&self, member_id: &str) {
        if let Some(registration) = self
            .state
            .registrations
            .lock()
            .expect("provider lock poisoned")
            .remove(member_id)
        {
            registration.heartbeat.cancel();
        }
        self.publish();
    }

    fn publish(&self) {
        let snapshot = self.live_members();
        let subscribers = self
            .state
            .subscribers
            .lock()
            .expect("provider lock poisoned")
            .clone();
        for subscriber in subscribers {
            subscriber.apply(snapshot.clone());
        }
    }

    fn live_members(&self) -> Vec<Member> {
        let mut registrations = self
            .state
            .registrations
            .lock()
            .expect("provider lock poisoned");
        let now = Instant::now();
        registrations.retain(|_, registration| registration.deadline > now);
        registrations
            .values()
            .map(|registration| registration.member.clone())
            .collect()
    }

    fn refresh_member(&self, member_id: &str) {
        let mut registrations = self
            .state
            .registrations
            .lock()
            .expect("provider lock poisoned");
        if let Some(registration) = registrations.get_mut(member_id) {
            registration.deadline = Instant::now() + self.state.ttl;
        }
    }
}

#[async_trait]
impl ClusterProvider for LocalProvider {
    async fn start_member(
        &self,
        member: Member,
        member_list: Arc<MemberList>,
    ) -> Result<(), anyhow::Error> {
        let heartbeat = CancellationToken::new();
        {
            let mut registrations = self
                .state
                .registrations
                .lock()
                .expect("provider lock poisoned");
            registrations.insert(
                member.id.clone(),
                Registration {
                    member: member.clone(),
                    deadline: Instant::now() + self.state.ttl,
                    heartbeat: heartbeat.clone(),
                },
            );
        }
        self.state
            .subscribers
            .lock()
            .expect("provider lock poisoned")
            .push(member_list);

        let provider = self.clone();
        let member_id = member.id.clone();
        let refresh = self.state.refresh;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = heartbeat.cancelled() => return,
                    _ = tokio::time::sleep(refresh) => {
                        provider.refresh_member(&member_id);
                        provider.publish();
                    }
                }
            }
        });

        self.publish();
        Ok(())
    }

    async fn shutdown_member(&self, member_id: &str) -> Result<(), anyhow::Error> {
        self.fail_member(member_id);
        Ok(())
    }
}
