//! Achieve consensus on a sequence of opaque values using the Paxos algorithm.
//!
//! Every process runs both protocol roles at once. The proposer role drives
//! [`Paxos::broadcast`] through the prepare and accept phases; the acceptor
//! role answers protocol messages arriving from any proposer; a dispatcher
//! thread routes inbound traffic between the two. Confirmed values come back
//! out of [`Paxos::deliver`] in the agreed total order.

pub mod acceptor;
pub mod dispatch;
pub mod proposer;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use itertools::Itertools;
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use thread_tryjoin::TryJoinHandle;

use crate::fail::FailCheck;
use crate::transport::Transport;
use crate::{Config, Error};

use self::acceptor::Acceptor;
use self::proposer::{Outcome, Proposer};

/// Application payloads the group can agree on.
pub trait Value: Clone + fmt::Debug + Send + serde::Serialize + DeserializeOwned + 'static {}

impl<T> Value for T where T: Clone + fmt::Debug + Send + serde::Serialize + DeserializeOwned + 'static {}

/// Name of one process in the fixed group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub String);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProcessId {
    fn from(name: &str) -> Self {
        ProcessId(name.to_owned())
    }
}

/// Ballot identifier, ordered by sequence first and proposer name second, so
/// no two processes can ever mint the same winning ballot for different
/// proposals.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BallotId {
    pub seq: u64,
    pub proposer: ProcessId,
}

impl BallotId {
    pub fn new(seq: u64, proposer: ProcessId) -> Self {
        BallotId { seq, proposer }
    }
}

impl fmt::Display for BallotId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.seq, self.proposer)
    }
}

/// Identity of one broadcast call. Stable across proposer retries and across
/// adoption by a competing proposer, which is what lets duplicate confirms be
/// recognized even when they arrive under different ballots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecreeId {
    pub origin: ProcessId,
    pub seq: u64,
}

impl fmt::Display for DecreeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.seq)
    }
}

/// A broadcast value tagged with its identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decree<T> {
    pub id: DecreeId,
    pub value: T,
}

/// A decree some acceptor already voted for, carried inside `Promise` so the
/// proposer can adopt it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Accepted<T> {
    pub ballot: BallotId,
    pub decree: Decree<T>,
}

/// Wire protocol. Replies name the responding acceptor so a proposer counts a
/// quorum of distinct processes, not distinct messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message<T> {
    Propose {
        ballot: BallotId,
        decree: Decree<T>,
    },
    Promise {
        ballot: BallotId,
        from: ProcessId,
        accepted: Option<Accepted<T>>,
    },
    RejectPropose {
        ballot: BallotId,
        from: ProcessId,
        promised: BallotId,
    },
    Accept {
        ballot: BallotId,
        decree: Decree<T>,
    },
    AcceptAck {
        ballot: BallotId,
        from: ProcessId,
    },
    RejectAccept {
        ballot: BallotId,
        from: ProcessId,
        promised: BallotId,
    },
    Confirm {
        ballot: BallotId,
        decree: Decree<T>,
    },
}

impl<T> Message<T> {
    /// The ballot this message is about.
    pub fn ballot(&self) -> &BallotId {
        match self {
            Message::Propose { ballot, .. }
            | Message::Promise { ballot, .. }
            | Message::RejectPropose { ballot, .. }
            | Message::Accept { ballot, .. }
            | Message::AcceptAck { ballot, .. }
            | Message::RejectAccept { ballot, .. }
            | Message::Confirm { ballot, .. } => ballot,
        }
    }
}

/// State shared between the caller-facing engine and its background threads.
pub(crate) struct Shared<T: Value> {
    pub(crate) me: ProcessId,
    pub(crate) majority: usize,
    pub(crate) transport: Arc<dyn Transport<T>>,
    pub(crate) fail: Arc<dyn FailCheck>,
    pub(crate) acceptor: Mutex<Acceptor<T>>,
    pub(crate) shutdown: AtomicBool,
}

impl<T: Value> Shared<T> {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// One process's consensus engine.
pub struct Paxos<T: Value> {
    shared: Arc<Shared<T>>,
    config: Config,
    proposer: Mutex<Proposer<T>>,
    delivery: Mutex<Receiver<T>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Value> Paxos<T> {
    /// Start the engine for `me`. The group is fixed for the lifetime of the
    /// engine; a majority is `group.len() / 2 + 1`.
    pub fn new(
        me: impl Into<ProcessId>,
        group: &[ProcessId],
        transport: Arc<dyn Transport<T>>,
        fail: Arc<dyn FailCheck>,
        config: Config,
    ) -> Self {
        let me = me.into();
        let majority = group.len() / 2 + 1;
        info!(
            "{me}: starting, group [{}], majority {majority}",
            group.iter().join(", ")
        );

        let (delivery_tx, delivery_rx) = mpsc::channel();
        let (prepare_tx, prepare_rx) = mpsc::channel();
        let (accept_tx, accept_rx) = mpsc::channel();

        let shared = Arc::new(Shared {
            me: me.clone(),
            majority,
            transport,
            fail,
            acceptor: Mutex::new(Acceptor::new(me.clone(), delivery_tx)),
            shutdown: AtomicBool::new(false),
        });

        let (work_tx, work_rx) = mpsc::channel();
        let work_rx = Arc::new(Mutex::new(work_rx));
        let mut workers = Vec::with_capacity(config.workers);
        for n in 0..config.workers {
            let shared = Arc::clone(&shared);
            let work_rx = Arc::clone(&work_rx);
            workers.push(std::thread::spawn(move || {
                dispatch::worker_loop(n, shared, work_rx)
            }));
        }

        let dispatcher = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                dispatch::dispatcher_loop(shared, work_tx, prepare_tx, accept_tx)
            })
        };

        let proposer = Proposer::new(me, majority, prepare_rx, accept_rx);

        Paxos {
            shared,
            config,
            proposer: Mutex::new(proposer),
            delivery: Mutex::new(delivery_rx),
            dispatcher: Mutex::new(Some(dispatcher)),
            workers: Mutex::new(workers),
        }
    }

    /// Blocks until `value` has been chosen by a majority and the confirm has
    /// been broadcast. Contention and timeouts are retried indefinitely with
    /// fresh ballots; only shutdown surfaces as an error.
    ///
    /// Concurrent calls from the same process serialize, so each gets its own
    /// run of ballot sequence numbers.
    pub fn broadcast(&self, value: T) -> Result<(), Error> {
        let mut proposer = self.proposer.lock().unwrap();
        let decree = proposer.mint(value);
        loop {
            if self.shared.is_shutting_down() {
                return Err(Error::ShuttingDown);
            }
            match proposer.attempt(&self.shared, &self.config, &decree)? {
                Outcome::Chosen => return Ok(()),
                // A previously accepted foreign decree won this round; ours
                // still needs one of its own.
                Outcome::ChoseOther => continue,
                Outcome::Superseded | Outcome::TimedOut => proposer.backoff(&self.config),
            }
        }
    }

    /// Blocks until the next value in the total order has been confirmed,
    /// then returns it. Values come out in the same order on every process.
    pub fn deliver(&self) -> Result<T, Error> {
        let rx = self.delivery.lock().unwrap();
        loop {
            if self.shared.is_shutting_down() {
                return Err(Error::ShuttingDown);
            }
            match rx.recv_timeout(Duration::from_millis(25)) {
                Ok(value) => return Ok(value),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(Error::ShuttingDown),
            }
        }
    }

    /// Stops the dispatcher and worker pool and closes the transport. Queued
    /// but unprocessed protocol messages are discarded; confirms already
    /// returned to callers stand.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{}: shutting down", self.shared.me);
        self.shared.transport.close();
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            // Bounded wait: the dispatcher unblocks once the transport closes.
            if handle.try_timed_join(Duration::from_millis(500)).is_err() {
                warn!("{}: dispatcher did not stop in time", self.shared.me);
            }
        }
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl<T: Value> Drop for Paxos<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ballot(seq: u64, proposer: &str) -> BallotId {
        BallotId::new(seq, ProcessId::from(proposer))
    }

    #[test]
    fn ballots_order_by_sequence_first() {
        assert!(ballot(2, "p1") > ballot(1, "p9"));
        assert!(ballot(1, "p1") < ballot(2, "p1"));
    }

    #[test]
    fn equal_sequences_break_ties_by_proposer() {
        assert!(ballot(3, "p2") > ballot(3, "p1"));
        assert_eq!(ballot(3, "p2"), ballot(3, "p2"));
    }

    #[test]
    fn no_two_processes_share_a_ballot() {
        // Strictness of the order: distinct proposers can never be equal.
        assert_ne!(ballot(5, "p1"), ballot(5, "p2"));
        assert_eq!(
            ballot(5, "p1").cmp(&ballot(5, "p2")),
            std::cmp::Ordering::Less
        );
    }

    #[test]
    fn message_exposes_its_ballot() {
        let msg: Message<String> = Message::AcceptAck {
            ballot: ballot(7, "p3"),
            from: ProcessId::from("p2"),
        };
        assert_eq!(*msg.ballot(), ballot(7, "p3"));
    }
}
