//! In-memory transport: a hub of per-process queues, with link controls so
//! tests can cut a process off and reconnect it later.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use log::debug;

use crate::paxos::{Message, ProcessId, Value};

use super::Transport;

/// Shared hub connecting every member's endpoint.
pub struct LocalNetwork<T> {
    inner: Mutex<Hub<T>>,
}

struct Hub<T> {
    queues: HashMap<ProcessId, Sender<Message<T>>>,
    cut: HashSet<ProcessId>,
}

impl<T: Value> LocalNetwork<T> {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(LocalNetwork {
            inner: Mutex::new(Hub {
                queues: HashMap::new(),
                cut: HashSet::new(),
            }),
        })
    }

    /// Register `id` with the hub and hand back its endpoint.
    pub fn join(self: &Arc<Self>, id: impl Into<ProcessId>) -> Arc<LocalTransport<T>> {
        let id = id.into();
        let (tx, rx) = mpsc::channel();
        self.inner.lock().unwrap().queues.insert(id.clone(), tx);
        Arc::new(LocalTransport {
            hub: Arc::clone(self),
            me: id,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        })
    }

    /// Drop all traffic to and from `id` until [`LocalNetwork::heal`].
    pub fn partition(&self, id: &ProcessId) {
        self.inner.lock().unwrap().cut.insert(id.clone());
    }

    pub fn heal(&self, id: &ProcessId) {
        self.inner.lock().unwrap().cut.remove(id);
    }

    /// Enqueue `msg` for every reachable member in one step, so a broadcast
    /// is never interleaved with another broadcast's deliveries.
    fn post_all(&self, from: &ProcessId, msg: Message<T>) {
        let hub = self.inner.lock().unwrap();
        if hub.cut.contains(from) {
            debug!("dropping broadcast from {from}, link cut");
            return;
        }
        for (to, tx) in &hub.queues {
            if hub.cut.contains(to) {
                debug!("dropping {from} -> {to}, link cut");
                continue;
            }
            // A closed receiver means the process is down; best effort.
            let _ = tx.send(msg.clone());
        }
    }

    fn post(&self, from: &ProcessId, to: &ProcessId, msg: Message<T>) {
        let hub = self.inner.lock().unwrap();
        if hub.cut.contains(from) || hub.cut.contains(to) {
            debug!("dropping {from} -> {to}, link cut");
            return;
        }
        if let Some(tx) = hub.queues.get(to) {
            let _ = tx.send(msg);
        }
    }
}

/// One member's endpoint on the hub.
pub struct LocalTransport<T> {
    hub: Arc<LocalNetwork<T>>,
    me: ProcessId,
    rx: Mutex<Receiver<Message<T>>>,
    closed: AtomicBool,
}

impl<T: Value> Transport<T> for LocalTransport<T> {
    fn broadcast(&self, msg: Message<T>) {
        self.hub.post_all(&self.me, msg);
    }

    fn send(&self, msg: Message<T>, to: &ProcessId) {
        self.hub.post(&self.me, to, msg);
    }

    fn recv(&self) -> Option<Message<T>> {
        let rx = self.rx.lock().unwrap();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            match rx.recv_timeout(Duration::from_millis(25)) {
                Ok(msg) => return Some(msg),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::BallotId;

    fn ping(seq: u64) -> Message<String> {
        Message::AcceptAck {
            ballot: BallotId::new(seq, ProcessId::from("p1")),
            from: ProcessId::from("p1"),
        }
    }

    #[test]
    fn broadcast_reaches_every_member_including_sender() {
        let hub = LocalNetwork::new();
        let a = hub.join("a");
        let b = hub.join("b");
        a.broadcast(ping(1));
        assert!(a.recv().is_some());
        assert!(b.recv().is_some());
    }

    #[test]
    fn partitioned_member_is_unreachable_until_healed() {
        let hub = LocalNetwork::new();
        let a = hub.join("a");
        let b = hub.join("b");
        hub.partition(&ProcessId::from("b"));

        a.send(ping(1), &ProcessId::from("b"));
        b.close();
        assert!(b.recv().is_none());

        let b = hub.join("b");
        hub.heal(&ProcessId::from("b"));
        a.send(ping(2), &ProcessId::from("b"));
        assert!(b.recv().is_some());
    }

    #[test]
    fn close_unblocks_recv() {
        let hub = LocalNetwork::<String>::new();
        let a = hub.join("a");
        a.close();
        assert!(a.recv().is_none());
    }
}
