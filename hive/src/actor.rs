/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The actor trait.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::supervision::SupervisorStrategy;

/// An actor: an addressable unit processing one message at a time.
///
/// The runtime owns the actor instance: it is produced by its props, fed
/// messages through [`Actor::receive`], and may be disposed and re-created
/// on restart. The message being processed, and every operation available
/// while processing it, is reached through the [`Context`].
///
/// Errors returned from `receive` become supervision events; they are
/// escalated to the actor's parent and never unwind the mailbox loop.
#[async_trait]
pub trait Actor: Send + 'static {
    /// Process the current message. The message, its sender, and the full
    /// operation table are available on `cx`.
    async fn receive(&mut self, cx: &mut dyn Context) -> Result<(), anyhow::Error>;

    /// The strategy this actor applies to failures of its children.
    /// Overrides the strategy configured on its props.
    fn supervisor_strategy(&self) -> Option<Arc<dyn SupervisorStrategy>> {
        None
    }
}
