//! In-memory transports for deterministic loop tests

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use super::transport::{Acceptor, Connector, Transport};

#[derive(Default)]
struct PipeState {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    connected: bool,
    closed: bool,
    /// Bytes the peer still accepts; `None` is unlimited
    write_budget: Option<usize>,
}

/// Test-side view of a [`MockTransport`]
#[derive(Clone)]
pub struct MockPeer {
    state: Arc<Mutex<PipeState>>,
}

impl MockPeer {
    /// Make bytes available to the server side
    pub fn send(&self, data: &[u8]) {
        self.state.lock().inbound.extend(data);
    }

    /// Take everything the server side wrote so far
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().outbound)
    }

    /// Simulate the peer hanging up
    pub fn disconnect(&self) {
        self.state.lock().connected = false;
    }

    /// Stop (or resume) accepting bytes without hanging up
    pub fn set_stalled(&self, stalled: bool) {
        self.state.lock().write_budget = if stalled { Some(0) } else { None };
    }

    /// Accept only `bytes` more bytes, then stall
    pub fn limit_output(&self, bytes: usize) {
        self.state.lock().write_budget = Some(bytes);
    }

    /// Whether the server side called `close`
    pub fn was_closed(&self) -> bool {
        self.state.lock().closed
    }
}

pub struct MockTransport {
    state: Arc<Mutex<PipeState>>,
    name: String,
}

/// Create a connected transport and its test-side peer
pub fn pipe(name: &str) -> (MockTransport, MockPeer) {
    let state = Arc::new(Mutex::new(PipeState {
        connected: true,
        ..Default::default()
    }));
    (
        MockTransport {
            state: state.clone(),
            name: name.to_string(),
        },
        MockPeer { state },
    )
}

impl Transport for MockTransport {
    fn is_connected(&mut self) -> bool {
        let state = self.state.lock();
        state.connected && !state.closed
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_bytes(&mut self, data: &[u8]) -> usize {
        let mut state = self.state.lock();
        if !state.connected || state.closed {
            return 0;
        }
        let n = state.write_budget.map_or(data.len(), |budget| budget.min(data.len()));
        if let Some(budget) = state.write_budget.as_mut() {
            *budget -= n;
        }
        state.outbound.extend_from_slice(&data[..n]);
        n
    }

    fn write_available(&mut self, data: &[u8]) -> usize {
        self.write_bytes(data)
    }

    fn close(&mut self) {
        self.state.lock().closed = true;
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}

/// Acceptor fed by the test
#[derive(Clone, Default)]
pub struct MockAcceptor {
    pending: Arc<Mutex<VecDeque<MockTransport>>>,
}

impl MockAcceptor {
    /// Queue a new inbound connection and return its peer
    pub fn connect(&self, name: &str) -> MockPeer {
        let (transport, peer) = pipe(name);
        self.pending.lock().push_back(transport);
        peer
    }
}

impl Acceptor for MockAcceptor {
    fn accept_pending(&mut self) -> Option<Box<dyn Transport>> {
        self.pending
            .lock()
            .pop_front()
            .map(|t| Box::new(t) as Box<dyn Transport>)
    }
}

/// Connector that hands out pre-arranged peers
#[derive(Clone, Default)]
pub struct MockConnector {
    outcomes: Arc<Mutex<VecDeque<Option<MockTransport>>>>,
    attempts: Arc<Mutex<Vec<(String, u16)>>>,
}

impl MockConnector {
    /// Next connect succeeds; returns the remote side
    pub fn accept_next(&self, name: &str) -> MockPeer {
        let (transport, peer) = pipe(name);
        self.outcomes.lock().push_back(Some(transport));
        peer
    }

    /// Next connect is refused
    pub fn refuse_next(&self) {
        self.outcomes.lock().push_back(None);
    }

    /// Hosts and ports dialled so far
    pub fn attempts(&self) -> Vec<(String, u16)> {
        self.attempts.lock().clone()
    }
}

impl Connector for MockConnector {
    fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn Transport>> {
        self.attempts.lock().push((host.to_string(), port));
        match self.outcomes.lock().pop_front().flatten() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
        }
    }
}
