//! Connection slots and the fixed-capacity connection table

use std::time::{Duration, Instant};

use crate::error::ConnectionError;
use crate::network::transport::Transport;
use crate::settings::DeviceEvent;

/// What a connection is currently used for
///
/// A free slot is simply `None` in the table, so a slot never holds a
/// socket without a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Accepted, first request not yet classified
    Unknown,
    /// File response sent; lingers for follow-up requests until idle
    GetPending,
    /// Upgraded WebSocket control channel
    WebSocket,
    /// Local MP3 listener
    Mp3Local,
    /// Outbound Icecast relay
    Mp3Icecast,
}

impl ConnectionKind {
    /// Whether this connection receives the MP3 fan-out
    pub fn is_mp3(self) -> bool {
        matches!(self, Self::Mp3Local | Self::Mp3Icecast)
    }

    /// Whether the idle timeout applies
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Unknown | Self::GetPending)
    }
}

/// One occupied slot
pub struct Connection {
    pub transport: Box<dyn Transport>,
    pub kind: ConnectionKind,
    pub last_activity: Instant,
    /// Published when the connection is freed
    pub close_notice: Option<DeviceEvent>,
    /// Audio slots in a row the peer did not take in full
    pub stalled_slots: u32,
    id: u64,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, kind: ConnectionKind, now: Instant, id: u64) -> Self {
        Self {
            transport,
            kind,
            last_activity: now,
            close_notice: None,
            stalled_slots: 0,
            id,
        }
    }

    /// Monotonic connection number for logging
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Record activity
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Response sent; close after the idle grace period unless reused
    pub fn set_timed_close(&mut self, now: Instant) {
        self.kind = ConnectionKind::GetPending;
        self.last_activity = now;
    }

    /// Count a short audio write, or reset the count after a full one
    ///
    /// Returns the number of short writes in a row.
    pub fn note_audio_write(&mut self, complete: bool) -> u32 {
        self.stalled_slots = if complete { 0 } else { self.stalled_slots + 1 };
        self.stalled_slots
    }

    /// Whether a transient connection has been idle longer than `timeout`
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        self.kind.is_transient() && now.saturating_duration_since(self.last_activity) > timeout
    }
}

/// Fixed-capacity pool of connection slots
pub struct ConnectionTable {
    slots: Vec<Option<Connection>>,
    next_id: u64,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, next_id: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|s| s.is_some())
    }

    /// Place a transport in the first free slot
    ///
    /// When the table is full the transport is closed and dropped; existing
    /// connections are untouched.
    pub fn insert(
        &mut self,
        mut transport: Box<dyn Transport>,
        kind: ConnectionKind,
        now: Instant,
    ) -> Result<usize, ConnectionError> {
        let Some(index) = self.slots.iter().position(|s| s.is_none()) else {
            transport.close();
            return Err(ConnectionError::TableFull(self.slots.len()));
        };
        self.next_id += 1;
        self.slots[index] = Some(Connection::new(transport, kind, now, self.next_id));
        Ok(index)
    }

    /// Accept a new inbound connection as [`ConnectionKind::Unknown`]
    pub fn accept(&mut self, transport: Box<dyn Transport>, now: Instant) -> Result<usize, ConnectionError> {
        self.insert(transport, ConnectionKind::Unknown, now)
    }

    /// Close and remove the connection in `index`
    pub fn free(&mut self, index: usize) -> Option<Connection> {
        let mut connection = self.slots.get_mut(index)?.take()?;
        connection.transport.close();
        Some(connection)
    }

    pub fn get(&self, index: usize) -> Option<&Connection> {
        self.slots.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Connection> {
        self.slots.get_mut(index)?.as_mut()
    }

    /// Take a connection out while it is being handled
    pub(crate) fn checkout(&mut self, index: usize) -> Option<Connection> {
        self.slots.get_mut(index)?.take()
    }

    /// Put a checked-out connection back into its slot
    pub(crate) fn restore(&mut self, index: usize, connection: Connection) {
        debug_assert!(self.slots[index].is_none());
        self.slots[index] = Some(connection);
    }

    /// Indices of occupied slots
    pub fn occupied(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Connection)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|c| (i, c)))
    }

    /// Number of connections of `kind`
    pub fn count_kind(&self, kind: ConnectionKind) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|c| c.kind == kind)
            .count()
    }

    /// Index of the first connection of `kind`
    pub fn find_kind(&self, kind: ConnectionKind) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|c| c.kind == kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::mock::pipe;

    fn transport(name: &str) -> Box<dyn Transport> {
        Box::new(pipe(name).0)
    }

    #[test]
    fn test_full_table_rejects_without_disturbing_others() {
        let now = Instant::now();
        let mut table = ConnectionTable::new(30);
        for i in 0..30 {
            assert_eq!(table.accept(transport(&format!("c{}", i)), now), Ok(i));
        }
        assert!(table.is_full());

        let (extra, extra_peer) = pipe("extra");
        assert_eq!(
            table.accept(Box::new(extra), now),
            Err(ConnectionError::TableFull(30))
        );
        assert!(extra_peer.was_closed());
        assert_eq!(table.len(), 30);
        for i in 0..30 {
            assert_eq!(table.get(i).unwrap().transport.peer(), format!("c{}", i));
        }

        table.free(7).unwrap();
        assert_eq!(table.accept(transport("again"), now), Ok(7));
        assert!(table.accept(transport("one-too-many"), now).is_err());
    }

    #[test]
    fn test_short_writes_counted_in_a_row() {
        let mut conn = Connection::new(transport("slow"), ConnectionKind::Mp3Local, Instant::now(), 1);
        assert_eq!(conn.note_audio_write(false), 1);
        assert_eq!(conn.note_audio_write(false), 2);
        assert_eq!(conn.note_audio_write(true), 0);
        assert_eq!(conn.note_audio_write(false), 1);
    }

    #[test]
    fn test_free_closes_transport() {
        let mut table = ConnectionTable::new(2);
        let (t, peer) = pipe("a");
        let index = table.accept(Box::new(t), Instant::now()).unwrap();
        let closed = table.free(index).unwrap();
        assert_eq!(closed.kind, ConnectionKind::Unknown);
        assert!(peer.was_closed());
        assert!(table.free(index).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_idle_applies_only_to_transient_kinds() {
        let start = Instant::now();
        let timeout = Duration::from_millis(1000);
        let mut conn = Connection::new(transport("x"), ConnectionKind::Unknown, start, 1);
        let later = start + Duration::from_millis(1500);
        assert!(conn.is_idle(later, timeout));

        conn.kind = ConnectionKind::WebSocket;
        assert!(!conn.is_idle(later, timeout));

        conn.set_timed_close(later);
        assert_eq!(conn.kind, ConnectionKind::GetPending);
        assert!(!conn.is_idle(later + Duration::from_millis(10), timeout));
        assert!(conn.is_idle(later + Duration::from_millis(1001), timeout));
    }

    #[test]
    fn test_kind_lookup() {
        let now = Instant::now();
        let mut table = ConnectionTable::new(4);
        table.accept(transport("a"), now).unwrap();
        let relay = table.insert(transport("r"), ConnectionKind::Mp3Icecast, now).unwrap();
        assert_eq!(table.find_kind(ConnectionKind::Mp3Icecast), Some(relay));
        assert_eq!(table.count_kind(ConnectionKind::Unknown), 1);
        assert!(ConnectionKind::Mp3Icecast.is_mp3());
        assert!(!ConnectionKind::WebSocket.is_mp3());
    }
}
