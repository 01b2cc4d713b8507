//! Inbound message routing: a single dispatcher thread reads everything the
//! transport delivers and fans it out to the acceptor worker pool or the
//! proposer's per-phase response queues.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::fail::FailPoint;

use super::{Message, Shared, Value};

/// Reads the transport until it closes or shutdown is requested.
///
/// PROPOSE and ACCEPT go to the worker pool; promise/ack/reject responses go
/// to the proposer's queues. All queues are unbounded so a slow proposer-side
/// consumer can never stall the acceptor path. CONFIRM is applied inline:
/// confirms establish the delivery order, so they must be handled in arrival
/// order rather than racing each other through the pool.
pub(super) fn dispatcher_loop<T: Value>(
    shared: Arc<Shared<T>>,
    work_tx: Sender<Message<T>>,
    prepare_tx: Sender<Message<T>>,
    accept_tx: Sender<Message<T>>,
) {
    while !shared.is_shutting_down() {
        let Some(msg) = shared.transport.recv() else {
            break;
        };
        let routed = match &msg {
            Message::Confirm { .. } => {
                let _ = shared.acceptor.lock().unwrap().handle(msg);
                continue;
            }
            Message::Propose { .. } | Message::Accept { .. } => work_tx.send(msg),
            Message::Promise { .. } | Message::RejectPropose { .. } => prepare_tx.send(msg),
            Message::AcceptAck { .. } | Message::RejectAccept { .. } => accept_tx.send(msg),
        };
        if routed.is_err() {
            warn!("{}: consumer gone, dropping message", shared.me);
        }
    }
    info!("{}: dispatcher stopped", shared.me);
}

/// One acceptor-pool worker. Handling is side-effect-light and runs under the
/// acceptor lock, so any number of workers is safe.
pub(super) fn worker_loop<T: Value>(
    n: usize,
    shared: Arc<Shared<T>>,
    work_rx: Arc<Mutex<Receiver<Message<T>>>>,
) {
    loop {
        let msg = {
            let rx = work_rx.lock().unwrap();
            match rx.recv() {
                Ok(msg) => msg,
                // Dispatcher gone; nothing more will arrive.
                Err(_) => break,
            }
        };
        if shared.is_shutting_down() {
            break;
        }
        if matches!(msg, Message::Propose { .. }) {
            shared.fail.checkpoint(FailPoint::OnReceivePropose);
        }
        let reply = shared.acceptor.lock().unwrap().handle(msg);
        if let Some((reply, to)) = reply {
            let voted = matches!(reply, Message::AcceptAck { .. });
            shared.transport.send(reply, &to);
            if voted {
                shared.fail.checkpoint(FailPoint::AfterSendVote);
            }
        }
    }
    debug!("{}: acceptor worker {n} stopped", shared.me);
}
