//! A deterministic fake `Transport` for integration tests, mirroring the
//! `NullTransport` used by `endpoint.rs`'s own unit tests but addressable
//! from outside the crate: the test holds a `MockTransportFactory` handle
//! and uses it to push `TransportEvent`s onto the endpoint's channel exactly
//! as `Lib60870Transport`'s callbacks would.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use iec104_client_connector::codec::{Transport, TransportEvent, WireCommand};

/// Shared state a `MockTransportFactory` and its spawned `MockTransport`s
/// both see: the event sender captured when the endpoint calls the factory,
/// and a log of every command handed to `send_command` (for asserting on
/// what actually reached the wire).
struct Shared {
    sender: Option<Sender<TransportEvent>>,
    commands_sent: Vec<WireCommand>,
    connect_should_fail: bool,
}

/// Handed to `Endpoint::new` as the `transport_factory` closure's owner.
/// Cloning shares the same underlying state, so the test and the endpoint's
/// own thread see the same `Sender`.
#[derive(Clone)]
pub struct MockTransportFactory {
    inner: Arc<Mutex<Shared>>,
}

impl MockTransportFactory {
    pub fn new() -> MockTransportFactory {
        MockTransportFactory {
            inner: Arc::new(Mutex::new(Shared {
                sender: None,
                commands_sent: Vec::new(),
                connect_should_fail: false,
            })),
        }
    }

    /// Makes every subsequent `connect()` call fail (simulates a downstream
    /// that refuses the TCP connection).
    pub fn fail_next_connect(&self) {
        self.inner.lock().unwrap().connect_should_fail = true;
    }

    /// The boxed closure `Endpoint::new` expects.
    #[allow(clippy::type_complexity)]
    pub fn factory(&self) -> Box<dyn Fn(Sender<TransportEvent>) -> Option<Box<dyn Transport>> + Send + Sync> {
        let inner = self.inner.clone();
        Box::new(move |tx| {
            let mut guard = inner.lock().unwrap();
            if guard.connect_should_fail {
                guard.connect_should_fail = false;
                return None;
            }
            guard.sender = Some(tx);
            Some(Box::new(MockTransport { inner: inner.clone() }) as Box<dyn Transport>)
        })
    }

    /// Injects a transport event as if it arrived from the wire. Panics if
    /// called before the endpoint has connected (no sender captured yet).
    pub fn push_event(&self, event: TransportEvent) {
        let sender = self.inner.lock().unwrap().sender.clone();
        let sender = sender.expect("push_event called before the endpoint connected");
        sender.send(event).expect("endpoint event channel closed");
    }

    pub fn commands_sent(&self) -> Vec<WireCommand> {
        self.inner.lock().unwrap().commands_sent.clone()
    }
}

struct MockTransport {
    inner: Arc<Mutex<Shared>>,
}

impl Transport for MockTransport {
    fn connect(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn send_start_dt(&mut self) {}

    fn send_stop_dt(&mut self) {}

    fn send_interrogation(&mut self, _ca: u16) -> bool {
        true
    }

    fn send_clock_sync(&mut self, _ca: u16) -> bool {
        true
    }

    fn send_command(&mut self, cmd: WireCommand) -> bool {
        self.inner.lock().unwrap().commands_sent.push(cmd);
        true
    }

    fn is_connected(&self) -> bool {
        true
    }
}
