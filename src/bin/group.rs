//! Run a whole three-member group in one OS process, each member on the real
//! TCP transport, and have every member broadcast one value.
//!
//! ```sh
//! RUST_LOG=info cargo r --bin group
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;

use tobcast::fail::NoFail;
use tobcast::paxos::{Paxos, ProcessId};
use tobcast::transport::net::NetTransport;
use tobcast::Config;

const NAMES: [&str; 3] = ["alpha", "beta", "gamma"];
const BASE_PORT: u16 = 4510;

fn main() {
    env_logger::init();

    let mut addrs: HashMap<ProcessId, SocketAddr> = HashMap::new();
    for (i, name) in NAMES.iter().enumerate() {
        let addr = format!("127.0.0.1:{}", BASE_PORT + i as u16).parse().unwrap();
        addrs.insert(ProcessId::from(*name), addr);
    }
    let members: Vec<ProcessId> = NAMES.iter().map(|name| ProcessId::from(*name)).collect();

    let mut handles = vec![];
    for name in NAMES {
        let addrs = addrs.clone();
        let members = members.clone();
        handles.push(thread::spawn(move || {
            let transport = NetTransport::bind(name, &addrs).unwrap();
            // Let the rest of the group come up before proposing.
            thread::sleep(Duration::from_millis(300));
            let engine = Arc::new(Paxos::new(
                name,
                &members,
                transport,
                Arc::new(NoFail),
                Config::for_group(members.len()),
            ));

            let sender = {
                let engine = Arc::clone(&engine);
                thread::spawn(move || engine.broadcast(format!("hello from {name}")))
            };

            let mut order = vec![];
            for _ in 0..NAMES.len() {
                order.push(engine.deliver().unwrap());
            }
            sender.join().unwrap().unwrap();
            println!("{name} delivered: {order:?}");
            engine.shutdown();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}
