//! Append-only event queues with independent consumer cursors.
//!
//! The queue is a forward-linked chain of nodes ending in an empty tail
//! placeholder. Submitting fills the placeholder and links a fresh one, so a
//! cursor created at time T starts at the then-current placeholder and sees
//! exactly the events submitted at or after T, in submit order. Nodes are
//! reclaimed once no cursor references them; producers never block on
//! consumers, and submission is skipped entirely while nobody listens.

use crate::record::RecordBuf;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) struct EventNode {
    payload: RwLock<Option<RecordBuf>>,
    next: RwLock<Option<Arc<EventNode>>>,
}

impl EventNode {
    fn placeholder() -> Arc<EventNode> {
        Arc::new(EventNode {
            payload: RwLock::new(None),
            next: RwLock::new(None),
        })
    }
}

impl Drop for EventNode {
    fn drop(&mut self) {
        // unlink iteratively so long unread chains do not recurse
        let mut next = self.next.get_mut().take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut inner) => next = inner.next.get_mut().take(),
                Err(_) => break,
            }
        }
    }
}

pub(crate) struct EventQueue {
    tail: Mutex<Arc<EventNode>>,
    consumers: AtomicUsize,
}

impl EventQueue {
    pub(crate) fn new() -> EventQueue {
        EventQueue {
            tail: Mutex::new(EventNode::placeholder()),
            consumers: AtomicUsize::new(0),
        }
    }

    /// Appends an event. Returns false when no consumer is attached and the
    /// event was dropped.
    pub(crate) fn submit(&self, event: RecordBuf) -> bool {
        if self.consumers.load(Ordering::Acquire) == 0 {
            return false;
        }
        let mut tail = self.tail.lock();
        *tail.payload.write() = Some(event);
        let fresh = EventNode::placeholder();
        *tail.next.write() = Some(fresh.clone());
        *tail = fresh;
        true
    }

    fn attach(&self) -> Arc<EventNode> {
        self.consumers.fetch_add(1, Ordering::AcqRel);
        self.tail.lock().clone()
    }

    fn detach(&self) {
        self.consumers.fetch_sub(1, Ordering::AcqRel);
    }

    #[cfg(test)]
    pub(crate) fn consumer_count(&self) -> usize {
        self.consumers.load(Ordering::Acquire)
    }
}

/// A consumer position inside an event queue.
pub struct EventCursor {
    queue: Arc<EventQueue>,
    node: Arc<EventNode>,
}

impl EventCursor {
    pub(crate) fn new(queue: Arc<EventQueue>) -> EventCursor {
        let node = queue.attach();
        EventCursor { queue, node }
    }

    /// Returns the next event in submit order, advancing past it, or None
    /// when the queue is drained.
    pub fn read(&mut self) -> Option<RecordBuf> {
        // a node is complete once its successor is linked; gate on that so a
        // partially written payload is never observed
        let next = self.node.next.read().clone();
        match next {
            Some(successor) => {
                let event = self
                    .node
                    .payload
                    .read()
                    .clone()
                    .expect("event node linked before payload was written");
                self.node = successor;
                Some(event)
            }
            None => None,
        }
    }
}

impl Drop for EventCursor {
    fn drop(&mut self) {
        self.queue.detach();
    }
}
