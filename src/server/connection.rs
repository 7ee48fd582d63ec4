//! Per-connection state and outbound notification queues.
//!
//! Event notifications are captured under the database lock and pushed
//! here; the connection's I/O task drains the queue between requests, so
//! the writer never blocks on a slow consumer. A queue grows by doubling
//! from a small start up to a hard cap; past the cap notifications are
//! dropped and counted, and the count rides along with the next delivered
//! notification.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};

use crate::events::{Notification, QUEUE_MAX, QUEUE_START};
use crate::logger::Topics;
use crate::protocol::event_frame;
use crate::topic_log;

#[derive(Debug)]
struct QueueInner {
    queue: VecDeque<Notification>,
    capacity: usize,
    missed: u32,
}

/// Bounded outbound notification queue for one connection.
#[derive(Debug)]
pub struct NotifyQueue {
    inner: Mutex<QueueInner>,
    signal: Notify,
}

impl NotifyQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::with_capacity(QUEUE_START),
                capacity: QUEUE_START,
                missed: 0,
            }),
            signal: Notify::new(),
        }
    }

    /// Enqueue a notification, growing up to the cap and counting drops
    /// past it.
    pub fn push(&self, n: Notification) {
        let mut inner = self.inner.lock();
        if inner.queue.len() >= inner.capacity {
            if inner.capacity < QUEUE_MAX {
                inner.capacity = (inner.capacity * 2).min(QUEUE_MAX);
            } else {
                inner.missed = inner.missed.saturating_add(1);
                drop(inner);
                self.signal.notify_one();
                return;
            }
        }
        inner.queue.push_back(n);
        drop(inner);
        self.signal.notify_one();
    }

    /// Dequeue the oldest notification along with the number of
    /// notifications dropped since the last delivery.
    pub fn pop(&self) -> Option<(Notification, u32)> {
        let mut inner = self.inner.lock();
        let n = inner.queue.pop_front()?;
        let missed = inner.missed;
        inner.missed = 0;
        Some((n, missed))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Wait until a push signals new work.
    pub async fn wait(&self) {
        self.signal.notified().await;
    }
}

impl Default for NotifyQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// One accepted connection.
#[derive(Debug)]
pub struct ConnState {
    pub id: u32,
    pub notify: NotifyQueue,
    // serializes queue drains so two tasks cannot reorder event frames
    drain_lock: Mutex<()>,
}

impl ConnState {
    /// Move every pending notification onto the connection's outbound
    /// frame channel, preserving arrival order. Returns false when the
    /// writer is gone.
    pub fn drain_into(&self, frames: &mpsc::UnboundedSender<Vec<u8>>) -> bool {
        let _guard = self.drain_lock.lock();
        while let Some((n, missed)) = self.notify.pop() {
            let frame = event_frame(n.event_id, n.tag, missed, n.udata, &n.data);
            if frames.send(frame).is_err() {
                return false;
            }
        }
        true
    }
}

/// Registry of live connections, used to route captured notifications.
#[derive(Debug)]
pub struct Connections {
    map: RwLock<HashMap<u32, Arc<ConnState>>>,
    next_id: AtomicU32,
}

impl Connections {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            // connection ids start at 1; 0 is reserved for the server
            next_id: AtomicU32::new(1),
        }
    }

    pub fn register(&self) -> Arc<ConnState> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ConnState {
            id,
            notify: NotifyQueue::new(),
            drain_lock: Mutex::new(()),
        });
        self.map.write().insert(id, state.clone());
        topic_log!(Topics::COMM, "connection {} opened", id);
        state
    }

    pub fn remove(&self, id: u32) {
        if self.map.write().remove(&id).is_some() {
            topic_log!(Topics::COMM, "connection {} closed", id);
        }
    }

    pub fn get(&self, id: u32) -> Option<Arc<ConnState>> {
        self.map.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Push captured notifications onto their owners' queues.
    pub fn route(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let map = self.map.read();
        for n in notifications {
            if let Some(conn) = map.get(&n.conn) {
                conn.notify.push(n);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(conn: u32, id: u32) -> Notification {
        Notification {
            conn,
            event_id: id,
            tag: 0,
            udata: 0,
            data: vec![],
        }
    }

    #[test]
    fn test_queue_fifo_and_growth() {
        let q = NotifyQueue::new();
        // push through several doublings
        for n in 0..100 {
            q.push(note(1, n));
        }
        for n in 0..100 {
            let (got, missed) = q.pop().unwrap();
            assert_eq!(got.event_id, n);
            assert_eq!(missed, 0);
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_queue_overflow_counts_missed() {
        let q = NotifyQueue::new();
        for n in 0..(QUEUE_MAX as u32 + 5) {
            q.push(note(1, n));
        }
        let (first, missed) = q.pop().unwrap();
        assert_eq!(first.event_id, 0);
        assert_eq!(missed, 5);
        // the count resets after delivery
        let (_, missed) = q.pop().unwrap();
        assert_eq!(missed, 0);
    }

    #[test]
    fn test_routing() {
        let conns = Connections::new();
        let a = conns.register();
        let b = conns.register();
        conns.route(vec![note(a.id, 1), note(b.id, 2), note(999, 3)]);
        assert_eq!(a.notify.pop().unwrap().0.event_id, 1);
        assert_eq!(b.notify.pop().unwrap().0.event_id, 2);
        assert!(a.notify.pop().is_none());
        conns.remove(a.id);
        assert!(conns.get(a.id).is_none());
        assert_eq!(conns.len(), 1);
    }
}
