//! Group-communication seam consumed by the engine.
//!
//! Delivery is best effort: the protocol tolerates loss through its own
//! retry and timeout logic, and assumes nothing about ordering across
//! processes.

pub mod local;
pub mod net;

use crate::paxos::{Message, ProcessId};

pub trait Transport<T>: Send + Sync {
    /// Deliver to every process in the group, including the sender.
    fn broadcast(&self, msg: Message<T>);

    /// Deliver to a single process.
    fn send(&self, msg: Message<T>, to: &ProcessId);

    /// Block until the next inbound message for this process arrives.
    /// Returns `None` once the transport has been closed.
    fn recv(&self) -> Option<Message<T>>;

    /// Stop delivering and unblock any pending `recv`.
    fn close(&self);
}
