//! Proposer role: drives one decree at a time through the prepare and accept
//! phases, retrying with fresh ballots until it is chosen.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use hashbrown::HashSet;
use log::{debug, info, warn};
use rand::Rng;

use crate::fail::FailPoint;
use crate::{Config, Error};

use super::{Accepted, BallotId, Decree, DecreeId, Message, ProcessId, Shared, Value};

/// Result of one ballot attempt.
pub(super) enum Outcome {
    /// The caller's own decree was confirmed.
    Chosen,
    /// A previously accepted foreign decree was adopted and confirmed
    /// instead; the caller's decree still needs a round of its own.
    ChoseOther,
    /// A higher ballot, or a majority of rejections, ended the attempt.
    Superseded,
    /// Not enough responses before the phase timeout.
    TimedOut,
}

enum Prepared<T> {
    /// Majority promised; carries the highest-ballot decree already accepted
    /// by anyone in the quorum, if there was one.
    Ready(Option<Accepted<T>>),
    Superseded,
    TimedOut,
}

enum Voted {
    Done,
    Superseded,
    TimedOut,
}

/// Per-process proposer state. One outstanding broadcast at a time owns this
/// through the engine's proposer lock.
pub(super) struct Proposer<T> {
    me: ProcessId,
    majority: usize,
    /// Local ballot sequence counter.
    seq: u64,
    /// Highest ballot sequence observed in any response.
    observed: u64,
    /// Decrees minted by this process so far.
    minted: u64,
    prepare_rx: Receiver<Message<T>>,
    accept_rx: Receiver<Message<T>>,
}

impl<T: Value> Proposer<T> {
    pub(super) fn new(
        me: ProcessId,
        majority: usize,
        prepare_rx: Receiver<Message<T>>,
        accept_rx: Receiver<Message<T>>,
    ) -> Self {
        Proposer {
            me,
            majority,
            seq: 0,
            observed: 0,
            minted: 0,
            prepare_rx,
            accept_rx,
        }
    }

    /// Wrap a value in a fresh decree identity.
    pub(super) fn mint(&mut self, value: T) -> Decree<T> {
        self.minted += 1;
        Decree {
            id: DecreeId {
                origin: self.me.clone(),
                seq: self.minted,
            },
            value,
        }
    }

    /// A ballot strictly above everything this proposer has used or seen.
    fn next_ballot(&mut self) -> BallotId {
        self.seq = self.seq.max(self.observed) + 1;
        BallotId::new(self.seq, self.me.clone())
    }

    fn observe(&mut self, promised: &BallotId) {
        self.observed = self.observed.max(promised.seq);
    }

    /// Run one full prepare/accept/confirm attempt for `decree`.
    pub(super) fn attempt(
        &mut self,
        shared: &Shared<T>,
        config: &Config,
        decree: &Decree<T>,
    ) -> Result<Outcome, Error> {
        self.drain_stale();
        let ballot = self.next_ballot();
        debug!("{}: proposing {} under {ballot}", self.me, decree.id);
        shared.transport.broadcast(Message::Propose {
            ballot: ballot.clone(),
            decree: decree.clone(),
        });
        shared.fail.checkpoint(FailPoint::AfterSendPropose);

        let adopted = match self.await_promises(shared, config, &ballot)? {
            Prepared::Ready(adopted) => adopted,
            Prepared::Superseded => return Ok(Outcome::Superseded),
            Prepared::TimedOut => return Ok(Outcome::TimedOut),
        };
        shared.fail.checkpoint(FailPoint::AfterBecomingLeader);

        // Safety rule: if anyone in the quorum already voted for a decree,
        // that decree must be driven to confirmation before our own.
        let chosen = match adopted {
            Some(prev) => {
                info!(
                    "{}: adopting {} accepted under {}",
                    self.me, prev.decree.id, prev.ballot
                );
                prev.decree
            }
            None => decree.clone(),
        };

        shared.transport.broadcast(Message::Accept {
            ballot: ballot.clone(),
            decree: chosen.clone(),
        });
        match self.await_acks(shared, config, &ballot)? {
            Voted::Done => {}
            Voted::Superseded => return Ok(Outcome::Superseded),
            Voted::TimedOut => return Ok(Outcome::TimedOut),
        }
        shared.fail.checkpoint(FailPoint::AfterValueAccept);

        let ours = chosen.id == decree.id;
        shared.transport.broadcast(Message::Confirm {
            ballot,
            decree: chosen,
        });
        Ok(if ours {
            Outcome::Chosen
        } else {
            Outcome::ChoseOther
        })
    }

    /// Collect prepare-phase responses until a majority of distinct acceptors
    /// promise this exact ballot, a majority reject it, a response reveals a
    /// strictly higher ballot, or the timeout elapses.
    fn await_promises(
        &mut self,
        shared: &Shared<T>,
        config: &Config,
        ballot: &BallotId,
    ) -> Result<Prepared<T>, Error> {
        let deadline = Instant::now() + config.promise_timeout;
        let mut promised: HashSet<ProcessId> = HashSet::new();
        let mut rejected: HashSet<ProcessId> = HashSet::new();
        let mut adopted: Option<Accepted<T>> = None;

        loop {
            let msg = match poll(&self.prepare_rx, shared, deadline)? {
                Some(msg) => msg,
                None => {
                    warn!("{}: no promise majority for {ballot} in time", self.me);
                    return Ok(Prepared::TimedOut);
                }
            };
            // Responses to an abandoned lower ballot are stale; they count
            // toward neither majority.
            if msg.ballot() < ballot {
                debug!("{}: ignoring stale {msg:?}", self.me);
                continue;
            }
            match msg {
                Message::Promise {
                    ballot: b,
                    from,
                    accepted,
                } if b == *ballot => {
                    if let Some(prev) = accepted {
                        adopted = match adopted.take() {
                            Some(cur) if cur.ballot >= prev.ballot => Some(cur),
                            _ => Some(prev),
                        };
                    }
                    promised.insert(from);
                    if promised.len() >= self.majority {
                        debug!("{}: promise majority for {ballot}", self.me);
                        return Ok(Prepared::Ready(adopted));
                    }
                }
                Message::RejectPropose {
                    ballot: b,
                    from,
                    promised: higher,
                } if b == *ballot => {
                    self.observe(&higher);
                    if higher > *ballot {
                        // Someone promised past us; waiting cannot help.
                        debug!("{}: {ballot} superseded by {higher}", self.me);
                        return Ok(Prepared::Superseded);
                    }
                    rejected.insert(from);
                    if rejected.len() >= self.majority {
                        return Ok(Prepared::Superseded);
                    }
                }
                other => debug!("{}: unexpected prepare response {other:?}", self.me),
            }
        }
    }

    /// Collect accept-phase responses until a majority of distinct acceptors
    /// ack this exact ballot, a majority reject it, a response reveals a
    /// strictly higher ballot, or the timeout elapses.
    fn await_acks(
        &mut self,
        shared: &Shared<T>,
        config: &Config,
        ballot: &BallotId,
    ) -> Result<Voted, Error> {
        let deadline = Instant::now() + config.accept_timeout;
        let mut acked: HashSet<ProcessId> = HashSet::new();
        let mut rejected: HashSet<ProcessId> = HashSet::new();

        loop {
            let msg = match poll(&self.accept_rx, shared, deadline)? {
                Some(msg) => msg,
                None => {
                    warn!("{}: no ack majority for {ballot} in time", self.me);
                    return Ok(Voted::TimedOut);
                }
            };
            if msg.ballot() < ballot {
                debug!("{}: ignoring stale {msg:?}", self.me);
                continue;
            }
            match msg {
                Message::AcceptAck { ballot: b, from } if b == *ballot => {
                    acked.insert(from);
                    if acked.len() >= self.majority {
                        debug!("{}: ack majority for {ballot}", self.me);
                        return Ok(Voted::Done);
                    }
                }
                Message::RejectAccept {
                    ballot: b,
                    from,
                    promised: higher,
                } if b == *ballot => {
                    self.observe(&higher);
                    if higher > *ballot {
                        debug!("{}: {ballot} superseded by {higher}", self.me);
                        return Ok(Voted::Superseded);
                    }
                    rejected.insert(from);
                    if rejected.len() >= self.majority {
                        return Ok(Voted::Superseded);
                    }
                }
                other => debug!("{}: unexpected accept response {other:?}", self.me),
            }
        }
    }

    /// Flush responses left over from an abandoned ballot before minting the
    /// next one, keeping the observed ballot ceiling fresh along the way.
    fn drain_stale(&mut self) {
        while let Ok(leftover) = self.prepare_rx.try_recv() {
            if let Message::RejectPropose { promised, .. } = leftover {
                self.observe(&promised);
            }
        }
        while let Ok(leftover) = self.accept_rx.try_recv() {
            if let Message::RejectAccept { promised, .. } = leftover {
                self.observe(&promised);
            }
        }
    }

    /// Randomized delay between attempts so competing proposers stop
    /// colliding head to head.
    pub(super) fn backoff(&self, config: &Config) {
        let ms = rand::thread_rng().gen_range(config.backoff.clone());
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Wait for the next response, slicing the wait so a shutdown request is
/// observed promptly. `None` means the deadline passed.
fn poll<T: Value>(
    rx: &Receiver<Message<T>>,
    shared: &Shared<T>,
    deadline: Instant,
) -> Result<Option<Message<T>>, Error> {
    loop {
        if shared.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        let slice = (deadline - now).min(Duration::from_millis(25));
        match rx.recv_timeout(slice) {
            Ok(msg) => return Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Err(Error::ShuttingDown),
        }
    }
}
