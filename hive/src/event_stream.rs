/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A process-wide publish/subscribe bus, one per actor system.
//!
//! Handlers are keyed by the event's concrete type and invoked synchronously
//! in subscription order from the publisher's task. A publisher observes its
//! own events in publish order; no ordering holds between concurrent
//! publishers. Handler panics are caught and logged so one subscriber cannot
//! take down a publisher.

use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::Weak;

struct Handler {
    id: u64,
    invoke: Arc<dyn Fn(&dyn Any) + Send + Sync>,
}

#[derive(Default)]
struct EventStreamInner {
    handlers: RwLock<HashMap<TypeId, Vec<Handler>>>,
    next_id: AtomicU64,
}

/// A synchronous, type-keyed event bus. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct EventStream {
    inner: Arc<EventStreamInner>,
}

impl EventStream {
    /// Create a new, empty event stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events of type `T`. The handler runs synchronously on
    /// the publisher's task; keep it brief. The subscription stays active
    /// until [`Subscription::unsubscribe`] is called.
    pub fn subscribe<T: Any>(
        &self,
        handler: impl Fn(&T) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let invoke = Arc::new(move |event: &dyn Any| {
            if let Some(event) = event.downcast_ref::<T>() {
                handler(event);
            }
        });
        let type_id = TypeId::of::<T>();
        self.inner
            .handlers
            .write()
            .expect("event stream lock poisoned")
            .entry(type_id)
            .or_default()
            .push(Handler { id, invoke });
        Subscription {
            stream: Arc::downgrade(&self.inner),
            type_id,
            id,
        }
    }

    /// Publish an event to every subscriber of its type.
    pub fn publish<T: Any>(&self, event: &T) {
        let handlers = {
            let handlers = self
                .inner
                .handlers
                .read()
                .expect("event stream lock poisoned");
            match handlers.get(&TypeId::of::<T>()) {
                Some(list) => list.iter().map(|h| h.invoke.clone()).collect::<Vec<_>>(),
                None => return,
            }
        };
        for invoke in handlers {
            let result =
                std::panic::catch_unwind(AssertUnwindSafe(|| invoke(event as &dyn Any)));
            if result.is_err() {
                tracing::error!(
                    event_type = std::any::type_name::<T>(),
                    "event stream handler panicked"
                );
            }
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count: usize = self
            .inner
            .handlers
            .read()
            .map(|h| h.values().map(Vec::len).sum())
            .unwrap_or(0);
        f.debug_struct("EventStream").field("handlers", &count).finish()
    }
}

/// A handle to an active subscription.
#[derive(Debug)]
pub struct Subscription {
    stream: Weak<EventStreamInner>,
    type_id: TypeId,
    id: u64,
}

impl Subscription {
    /// Remove this subscription from the stream. Idempotent.
    pub fn unsubscribe(&self) {
        let Some(inner) = self.stream.upgrade() else {
            return;
        };
        let mut handlers = inner.handlers.write().expect("event stream lock poisoned");
        if let Some(list) = handlers.get_mut(&self.type_id) {
            list.retain(|handler| handler.id != self.id);
        }
    }
}
