/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Virtual-actor clustering for the hive actor runtime.
//!
//! This crate turns a set of [`hive::ActorSystem`]s into a distributed
//! directory of automatically activated virtual actors ("grains"). A grain
//! is addressed by a [`ClusterIdentity`], a `(kind, identity)` pair; the
//! first request activates it on the member that owns the identity's
//! directory partition, and later requests are routed through a bounded
//! pid cache.
//!
//! Membership comes from a pluggable [`provider::ClusterProvider`].
//! Topology snapshots flow through the member list onto the event stream;
//! applying one rebuilds the per-kind ownership rings, prunes the pid
//! cache, and retires activations whose placement moved, after a
//! quiescence delay.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hive::{ActorSystem, Props};
//! use hive_cluster::{Cluster, ClusterConfig, ClusterIdentity, ClusterKind, LocalProvider};
//!
//! # struct EchoGrain;
//! # #[async_trait::async_trait]
//! # impl hive::Actor for EchoGrain {
//! #     async fn receive(&mut self, _cx: &mut dyn hive::Context) -> Result<(), anyhow::Error> {
//! #         Ok(())
//! #     }
//! # }
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let system = ActorSystem::new();
//! let config = ClusterConfig::new("127.0.0.1", 7001)
//!     .with_kind(ClusterKind::new("echo", Props::from_producer(|_| Box::new(EchoGrain))));
//! let cluster = Cluster::start(system, config, Arc::new(LocalProvider::default())).await?;
//!
//! let reply = cluster
//!     .request(&ClusterIdentity::new("echo", "greeter-1"), Arc::new("hi".to_string()))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod activator;
pub mod block_list;
pub mod cluster;
pub mod events;
pub mod identity;
pub mod kind;
pub mod member;
pub mod member_list;
pub mod messages;
pub mod partition;
pub mod pid_cache;
pub mod provider;
pub mod topology;

pub use block_list::BlockList;
pub use cluster::Cluster;
pub use cluster::ClusterConfig;
pub use cluster::ClusterError;
pub use identity::ClusterIdentity;
pub use kind::ClusterKind;
pub use kind::Placement;
pub use member::Member;
pub use member_list::MemberList;
pub use messages::ClusterInit;
pub use messages::GrainErrorResponse;
pub use partition::IdentityLookup;
pub use partition::PartitionLookup;
pub use pid_cache::PidCache;
pub use provider::ClusterProvider;
pub use provider::LocalProvider;
pub use topology::ClusterTopology;
