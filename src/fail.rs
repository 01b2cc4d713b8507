//! Deterministic fault-injection checkpoints.
//!
//! A test harness can register a [`FailCheck`] that terminates or otherwise
//! sabotages the process at a named protocol point, so crash scenarios are
//! reproducible instead of depending on scheduling luck.

/// Protocol points at which a checkpoint fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// Proposer, right after broadcasting PROPOSE.
    AfterSendPropose,
    /// Proposer, after collecting a majority of promises.
    AfterBecomingLeader,
    /// Proposer, after a majority of accept acks but before CONFIRM.
    AfterValueAccept,
    /// Acceptor, after replying with an accept ack.
    AfterSendVote,
    /// Acceptor, on receipt of a PROPOSE.
    OnReceivePropose,
}

pub trait FailCheck: Send + Sync {
    fn checkpoint(&self, point: FailPoint);
}

/// Production hook: every checkpoint is a no-op.
pub struct NoFail;

impl FailCheck for NoFail {
    fn checkpoint(&self, _point: FailPoint) {}
}
