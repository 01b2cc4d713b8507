//! TCP transport over message-io: one endpoint per group member, addressed
//! through a static id-to-address map fixed at construction.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use hashbrown::HashMap;
use log::{debug, warn};
use message_io::network::{Endpoint, NetEvent, SendStatus, Transport as Wire};
use message_io::node::{self, NodeHandler};
use serde_json::{from_slice, to_vec};

use crate::paxos::{Message, ProcessId, Value};

use super::Transport;

pub struct NetTransport<T> {
    me: ProcessId,
    handler: NodeHandler<()>,
    peers: HashMap<ProcessId, Endpoint>,
    /// Messages to ourselves skip the network entirely.
    loopback: Sender<Message<T>>,
    rx: Mutex<Receiver<Message<T>>>,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Value> NetTransport<T> {
    /// Listen on `me`'s address from `group` and connect to every peer.
    ///
    /// Connections are established in the background; sends to a peer that
    /// has not come up yet are dropped, which the protocol's retries absorb.
    pub fn bind(
        me: impl Into<ProcessId>,
        group: &HashMap<ProcessId, SocketAddr>,
    ) -> io::Result<Arc<Self>> {
        let me = me.into();
        let addr = group
            .get(&me)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{me} not in group")))?;

        let (handler, listener) = node::split::<()>();
        handler.network().listen(Wire::FramedTcp, addr)?;

        let mut peers = HashMap::new();
        for (id, addr) in group {
            if *id == me {
                continue;
            }
            let (endpoint, _) = handler.network().connect(Wire::FramedTcp, *addr)?;
            peers.insert(id.clone(), endpoint);
        }

        let (tx, rx) = mpsc::channel();
        let pump = {
            let tx = tx.clone();
            let me = me.clone();
            std::thread::spawn(move || {
                listener.for_each(move |event| match event.network() {
                    NetEvent::Message(_, data) => match from_slice::<Message<T>>(data) {
                        Ok(msg) => {
                            let _ = tx.send(msg);
                        }
                        Err(err) => warn!("{me}: discarding malformed message: {err}"),
                    },
                    NetEvent::Connected(endpoint, established) => {
                        if established {
                            debug!("{me}: connected to {endpoint}");
                        } else {
                            warn!("{me}: could not reach {endpoint}");
                        }
                    }
                    NetEvent::Accepted(endpoint, _) => debug!("{me}: accepted {endpoint}"),
                    NetEvent::Disconnected(endpoint) => debug!("{me}: lost {endpoint}"),
                });
            })
        };

        Ok(Arc::new(NetTransport {
            me,
            handler,
            peers,
            loopback: tx,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
            pump: Mutex::new(Some(pump)),
        }))
    }

    fn wire(&self, msg: &Message<T>, id: &ProcessId, endpoint: Endpoint, buf: &[u8]) {
        let status = self.handler.network().send(endpoint, buf);
        if !matches!(status, SendStatus::Sent) {
            debug!("{}: send of {msg:?} to {id} failed: {status:?}", self.me);
        }
    }
}

impl<T: Value> Transport<T> for NetTransport<T> {
    fn broadcast(&self, msg: Message<T>) {
        match to_vec(&msg) {
            Ok(buf) => {
                for (id, endpoint) in &self.peers {
                    self.wire(&msg, id, *endpoint, &buf);
                }
            }
            Err(err) => {
                warn!("{}: failed to encode broadcast: {err}", self.me);
                return;
            }
        }
        // A broadcast includes the sender.
        let _ = self.loopback.send(msg);
    }

    fn send(&self, msg: Message<T>, to: &ProcessId) {
        if *to == self.me {
            let _ = self.loopback.send(msg);
            return;
        }
        let buf = match to_vec(&msg) {
            Ok(buf) => buf,
            Err(err) => {
                warn!("{}: failed to encode message for {to}: {err}", self.me);
                return;
            }
        };
        match self.peers.get(to) {
            Some(endpoint) => self.wire(&msg, to, *endpoint, &buf),
            None => warn!("{}: unknown destination {to}", self.me),
        }
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
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handler.stop();
        if let Some(pump) = self.pump.lock().unwrap().take() {
            let _ = pump.join();
        }
    }
}
