//! Total-order broadcast for a fixed group of processes, built on
//! single-decree Paxos.
//!
//! Every process runs a [`paxos::Paxos`] engine over some
//! [`transport::Transport`]. Any process may [`paxos::Paxos::broadcast`] an
//! opaque value; every process (the sender included) hands back all broadcast
//! values in the same order through [`paxos::Paxos::deliver`].

use std::ops::Range;
use std::time::Duration;

use thiserror::Error;

pub mod fail;
pub mod paxos;
pub mod transport;

/// Tuning knobs for one engine instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a proposer waits for a majority of promises before it gives
    /// up on a ballot.
    pub promise_timeout: Duration,
    /// How long a proposer waits for a majority of accept acks.
    pub accept_timeout: Duration,
    /// Millisecond range for the randomized delay between retry attempts.
    pub backoff: Range<u64>,
    /// Worker threads handling acceptor-side messages.
    pub workers: usize,
}

impl Config {
    /// Defaults scaled to the group size: larger groups wait longer per phase.
    pub fn for_group(n: usize) -> Self {
        let n = n.max(1) as u64;
        Self {
            promise_timeout: Duration::from_millis(150 * n),
            accept_timeout: Duration::from_millis(150 * n),
            backoff: 20..120,
            workers: 2,
        }
    }
}

/// The only failure surfaced to the application; everything else is retried
/// internally with a fresh ballot.
#[derive(Debug, Error)]
pub enum Error {
    #[error("paxos engine is shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_scales_with_group_size() {
        let small = Config::for_group(3);
        let large = Config::for_group(9);
        assert!(large.promise_timeout > small.promise_timeout);
        assert!(large.accept_timeout > small.accept_timeout);
    }
}
