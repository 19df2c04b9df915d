/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Hive is a supervised actor runtime with cooperative per-actor
//! scheduling.
//!
//! # Model
//!
//! Actors are addressed by [`Pid`]s, spawned from immutable [`Props`], and
//! served one message at a time from a dual-queue [`mailbox::Mailbox`]:
//! system messages (lifecycle signals, watches, failures) strictly precede
//! user messages within every mailbox run. Failures never unwind the
//! dispatch loop; they suspend the failing actor's mailbox and escalate to
//! its parent, whose [`supervision`] strategy resumes, restarts, or stops
//! the affected children, or escalates further.
//!
//! Request/response is bridged over one-shot pids: an ask allocates a
//! [`future::ActorFuture`] whose pid rides along as the envelope sender,
//! and the first reply completes it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use hive::{Actor, ActorSystem, Context, Props};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Actor for Echo {
//!     async fn receive(&mut self, cx: &mut dyn Context) -> Result<(), anyhow::Error> {
//!         if let Some(text) = cx.envelope().and_then(|e| e.downcast_ref::<String>()) {
//!             let reply = text.clone();
//!             cx.respond(Arc::new(reply));
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let system = ActorSystem::new();
//! let pid = system.root().spawn(Props::from_producer(|_| Box::new(Echo)))?;
//! let reply = system
//!     .root()
//!     .request_future(&pid, Arc::new("hi".to_string()), std::time::Duration::from_secs(1))
//!     .result()
//!     .await?;
//! assert_eq!(reply.downcast_ref::<String>().unwrap(), "hi");
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod actor;
pub mod actor_system;
pub mod config;
pub mod context;
pub mod event_stream;
pub mod future;
pub mod hashring;
pub mod mailbox;
pub mod message;
pub mod pid;
pub mod process;
pub mod props;
pub mod registry;
pub mod root_context;
pub mod router;
pub mod supervision;
pub mod system_messages;
pub mod throttle;

pub use actor::Actor;
pub use actor_system::ActorSystem;
pub use config::Config;
pub use context::ActorContext;
pub use context::Context;
pub use event_stream::EventStream;
pub use event_stream::Subscription;
pub use future::ActorFuture;
pub use future::AskError;
pub use message::Message;
pub use message::MessageEnvelope;
pub use pid::Pid;
pub use process::DeadLetterEvent;
pub use props::Props;
pub use registry::SpawnError;
pub use root_context::RootContext;
pub use system_messages::SystemMessage;
