//! Acceptor role: promises ballots, votes on decrees, and feeds confirmed
//! values into the delivery queue.

use std::sync::mpsc::Sender;

use hashbrown::HashSet;
use log::{debug, info, warn};

use super::{Accepted, BallotId, Decree, DecreeId, Message, ProcessId, Value};

/// Long-lived acceptor state for this process.
///
/// Every handler runs under the engine's single acceptor lock, so a PROPOSE
/// and an ACCEPT arriving concurrently from different proposers are strictly
/// serialized and cannot produce an inconsistent promise/accept pair.
pub struct Acceptor<T> {
    me: ProcessId,
    /// Highest ballot ever promised. Non-decreasing.
    max_ballot: Option<BallotId>,
    /// Decree voted for under `max_ballot`, if any. Cleared once the round is
    /// confirmed.
    accepted: Option<Accepted<T>>,
    /// Decrees already handed to the delivery queue.
    delivered: HashSet<DecreeId>,
    delivery: Sender<T>,
}

impl<T: Value> Acceptor<T> {
    pub fn new(me: ProcessId, delivery: Sender<T>) -> Self {
        Acceptor {
            me,
            max_ballot: None,
            accepted: None,
            delivered: HashSet::new(),
            delivery,
        }
    }

    /// Handle one acceptor-bound message, returning the unicast reply (if
    /// any) and the proposer it goes back to.
    pub fn handle(&mut self, msg: Message<T>) -> Option<(Message<T>, ProcessId)> {
        match msg {
            Message::Propose { ballot, .. } => Some(self.on_propose(ballot)),
            Message::Accept { ballot, decree } => Some(self.on_accept(ballot, decree)),
            Message::Confirm { decree, .. } => {
                self.on_confirm(decree);
                None
            }
            other => {
                warn!("{}: acceptor discarding unexpected {other:?}", self.me);
                None
            }
        }
    }

    /// Promise any ballot above the highest promised so far; reject the rest.
    /// The promise carries whatever decree this acceptor already voted for,
    /// so the proposer can adopt it instead of its own.
    fn on_propose(&mut self, ballot: BallotId) -> (Message<T>, ProcessId) {
        let to = ballot.proposer.clone();
        match &self.max_ballot {
            Some(max) if *max >= ballot => {
                debug!("{}: rejecting {ballot}, already promised {max}", self.me);
                (
                    Message::RejectPropose {
                        ballot,
                        from: self.me.clone(),
                        promised: max.clone(),
                    },
                    to,
                )
            }
            _ => {
                debug!("{}: promising {ballot}", self.me);
                self.max_ballot = Some(ballot.clone());
                (
                    Message::Promise {
                        ballot,
                        from: self.me.clone(),
                        accepted: self.accepted.clone(),
                    },
                    to,
                )
            }
        }
    }

    /// Vote only for the exact ballot currently promised.
    fn on_accept(&mut self, ballot: BallotId, decree: Decree<T>) -> (Message<T>, ProcessId) {
        let to = ballot.proposer.clone();
        if self.max_ballot.as_ref() == Some(&ballot) {
            debug!("{}: voting for {} under {ballot}", self.me, decree.id);
            self.accepted = Some(Accepted {
                ballot: ballot.clone(),
                decree,
            });
            (
                Message::AcceptAck {
                    ballot,
                    from: self.me.clone(),
                },
                to,
            )
        } else {
            let promised = self.max_ballot.clone().unwrap_or_else(|| ballot.clone());
            debug!("{}: rejecting vote for {ballot}, promised {promised}", self.me);
            (
                Message::RejectAccept {
                    ballot,
                    from: self.me.clone(),
                    promised,
                },
                to,
            )
        }
    }

    /// A confirmed decree is the next value in the total order. Confirms may
    /// be received more than once (retransmission, or re-proposal of an
    /// already chosen decree under a later ballot); each decree is delivered
    /// exactly once.
    fn on_confirm(&mut self, decree: Decree<T>) {
        // Clear the vote for this round only. A late confirm must not erase a
        // newer vote that a crashed proposer's decree may still depend on.
        if self
            .accepted
            .as_ref()
            .map_or(false, |prev| prev.decree.id == decree.id)
        {
            self.accepted = None;
        }
        if !self.delivered.insert(decree.id.clone()) {
            debug!("{}: duplicate confirm for {}", self.me, decree.id);
            return;
        }
        info!("{}: delivering {}", self.me, decree.id);
        if self.delivery.send(decree.value).is_err() {
            warn!("{}: delivery queue closed, dropping {}", self.me, decree.id);
        }
    }

    #[cfg(test)]
    fn promised(&self) -> Option<&BallotId> {
        self.max_ballot.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{self, Receiver};

    use super::super::ProcessId;
    use super::*;

    fn ballot(seq: u64, proposer: &str) -> BallotId {
        BallotId::new(seq, ProcessId::from(proposer))
    }

    fn decree(origin: &str, seq: u64, value: &str) -> Decree<String> {
        Decree {
            id: DecreeId {
                origin: ProcessId::from(origin),
                seq,
            },
            value: value.to_owned(),
        }
    }

    fn acceptor() -> (Acceptor<String>, Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        (Acceptor::new(ProcessId::from("a1"), tx), rx)
    }

    #[test]
    fn promises_higher_ballots_and_rejects_lower() {
        let (mut acc, _rx) = acceptor();
        let reply = acc.handle(Message::Propose {
            ballot: ballot(2, "p1"),
            decree: decree("p1", 0, "x"),
        });
        assert!(matches!(reply, Some((Message::Promise { .. }, _))));

        let reply = acc.handle(Message::Propose {
            ballot: ballot(1, "p2"),
            decree: decree("p2", 0, "y"),
        });
        let Some((Message::RejectPropose { promised, .. }, to)) = reply else {
            panic!("expected rejection");
        };
        assert_eq!(promised, ballot(2, "p1"));
        assert_eq!(to, ProcessId::from("p2"));
    }

    #[test]
    fn promised_ballot_never_decreases() {
        let (mut acc, _rx) = acceptor();
        for seq in [3, 1, 5, 2, 4] {
            acc.handle(Message::Propose {
                ballot: ballot(seq, "p1"),
                decree: decree("p1", 0, "x"),
            });
        }
        assert_eq!(acc.promised(), Some(&ballot(5, "p1")));
    }

    #[test]
    fn votes_only_for_the_promised_ballot() {
        let (mut acc, _rx) = acceptor();
        acc.handle(Message::Propose {
            ballot: ballot(3, "p1"),
            decree: decree("p1", 0, "x"),
        });

        let stale = acc.handle(Message::Accept {
            ballot: ballot(2, "p2"),
            decree: decree("p2", 0, "y"),
        });
        assert!(matches!(stale, Some((Message::RejectAccept { .. }, _))));

        let ack = acc.handle(Message::Accept {
            ballot: ballot(3, "p1"),
            decree: decree("p1", 0, "x"),
        });
        assert!(matches!(ack, Some((Message::AcceptAck { .. }, _))));
    }

    #[test]
    fn promise_carries_the_accepted_decree() {
        let (mut acc, _rx) = acceptor();
        acc.handle(Message::Propose {
            ballot: ballot(1, "p1"),
            decree: decree("p1", 0, "x"),
        });
        acc.handle(Message::Accept {
            ballot: ballot(1, "p1"),
            decree: decree("p1", 0, "x"),
        });

        let reply = acc.handle(Message::Propose {
            ballot: ballot(2, "p2"),
            decree: decree("p2", 0, "y"),
        });
        let Some((Message::Promise { accepted, .. }, _)) = reply else {
            panic!("expected promise");
        };
        let accepted = accepted.expect("previously accepted decree must be forwarded");
        assert_eq!(accepted.ballot, ballot(1, "p1"));
        assert_eq!(accepted.decree.value, "x");
    }

    #[test]
    fn confirm_delivers_once_and_clears_the_round() {
        let (mut acc, rx) = acceptor();
        acc.handle(Message::Propose {
            ballot: ballot(1, "p1"),
            decree: decree("p1", 0, "x"),
        });
        acc.handle(Message::Accept {
            ballot: ballot(1, "p1"),
            decree: decree("p1", 0, "x"),
        });

        acc.handle(Message::Confirm {
            ballot: ballot(1, "p1"),
            decree: decree("p1", 0, "x"),
        });
        // Same decree confirmed again under a later ballot.
        acc.handle(Message::Confirm {
            ballot: ballot(4, "p2"),
            decree: decree("p1", 0, "x"),
        });

        assert_eq!(rx.try_recv().unwrap(), "x");
        assert!(rx.try_recv().is_err());

        // Next prepare sees no leftover accepted decree.
        let reply = acc.handle(Message::Propose {
            ballot: ballot(5, "p2"),
            decree: decree("p2", 0, "y"),
        });
        let Some((Message::Promise { accepted, .. }, _)) = reply else {
            panic!("expected promise");
        };
        assert!(accepted.is_none());
    }

    #[test]
    fn late_confirm_does_not_erase_a_newer_vote() {
        let (mut acc, _rx) = acceptor();
        acc.handle(Message::Propose {
            ballot: ballot(2, "p2"),
            decree: decree("p2", 1, "newer"),
        });
        acc.handle(Message::Accept {
            ballot: ballot(2, "p2"),
            decree: decree("p2", 1, "newer"),
        });

        // Confirm for an older round arrives after the newer vote.
        acc.handle(Message::Confirm {
            ballot: ballot(1, "p1"),
            decree: decree("p1", 1, "older"),
        });

        let reply = acc.handle(Message::Propose {
            ballot: ballot(3, "p3"),
            decree: decree("p3", 1, "z"),
        });
        let Some((Message::Promise { accepted, .. }, _)) = reply else {
            panic!("expected promise");
        };
        assert_eq!(accepted.expect("vote must survive").decree.value, "newer");
    }
}
