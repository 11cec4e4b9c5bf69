// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A double-ended queue of scaling intents.
//!
//! Producers enqueue without blocking; the single consumer either blocks
//! ([`IntentQueue::pop_front`]) or polls ([`IntentQueue::try_pop`]). Front
//! pushes make the queue a priority channel: a retried intent pushed to the
//! front is dispatched before any work that was already waiting.
//!
//! Every operation takes the queue's one mutex for a single step and never
//! holds it across a suspension point.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

/// An unbounded double-ended FIFO.
#[derive(Debug, Default)]
pub struct IntentQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Notify,
}

impl<T> IntentQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> IntentQueue<T> {
        IntentQueue {
            items: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }

    /// Enqueues an item at the front, ahead of everything already queued.
    pub async fn push_front(&self, item: T) {
        self.items.lock().await.push_front(item);
        self.ready.notify_one();
    }

    /// Enqueues an item at the back.
    pub async fn push_back(&self, item: T) {
        self.items.lock().await.push_back(item);
        self.ready.notify_one();
    }

    /// Dequeues the front item, waiting until one is available.
    pub async fn pop_front(&self) -> T {
        loop {
            // Arm the notification before checking, so a push between the
            // check and the await is not lost.
            let ready = self.ready.notified();
            if let Some(item) = self.items.lock().await.pop_front() {
                return item;
            }
            ready.await;
        }
    }

    /// Dequeues the back item, waiting until one is available.
    pub async fn pop_back(&self) -> T {
        loop {
            let ready = self.ready.notified();
            if let Some(item) = self.items.lock().await.pop_back() {
                return item;
            }
            ready.await;
        }
    }

    /// Dequeues the front item if one is immediately available.
    pub async fn try_pop(&self) -> Option<T> {
        self.items.lock().await.pop_front()
    }

    /// Reports whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}
