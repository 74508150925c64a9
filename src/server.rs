//! The network loop
//!
//! [`RelayServer`] owns every piece of per-connection state and performs one
//! non-blocking pass per [`tick`](RelayServer::tick):
//!
//! 1. drain queued control inputs (volume knob, kiosk switch)
//! 2. accept pending sockets into the connection table
//! 3. service each occupied slot according to its [`ConnectionKind`]
//! 4. in listener mode, move the remote stream into the audio ring
//! 5. fan the next ready audio slot out to every MP3 connection, dropping
//!    peers that stopped taking audio
//! 6. keep the Icecast relay connected when enabled
//!
//! Reads never wait and audio writes take only what the socket accepts. The
//! only pause inside a tick is the bounded upload retry budget: Icecast
//! connects and handshakes run on helper threads and are polled here.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::{AudioSource, RingWriter};
use crate::config::{AppConfig, UploadConfig};
use crate::constants::MAX_STALLED_SLOTS;
use crate::error::{RelayError, UploadError};
use crate::network::{
    spawn_listen, spawn_login, Acceptor, Connection, ConnectionKind, ConnectionTable, Connector, IcyClient,
    ListenTarget, PendingConnect, RelaySupervisor, RelayTarget, TcpConnector, Transport,
};
use crate::settings::{ControlInput, DeviceEvent, RunMode, SettingsService, SettingsStore};
use crate::storage::Storage;
use crate::web::{self, http, websocket, RequestClass, WsMessage};

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// Counters kept by the loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub ticks: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub evicted_idle: u64,
    pub dropped_disconnected: u64,
    pub files_served: u64,
    pub uploads: u64,
    pub slots_relayed: u64,
    pub audio_bytes_sent: u64,
    pub dropped_stalled: u64,
    pub listener_bytes: u64,
    pub open_connections: usize,
    pub websocket_clients: usize,
    pub mp3_listeners: usize,
    pub relay_connected: bool,
    pub listener_connected: bool,
}

/// Connection multiplexer and owner of the control-plane state
pub struct RelayServer {
    table: ConnectionTable,
    acceptor: Box<dyn Acceptor>,
    source: Option<Box<dyn AudioSource>>,
    storage: Box<dyn Storage>,
    settings: SettingsService,
    control: Option<Receiver<ControlInput>>,
    connector: Arc<dyn Connector>,
    icy: IcyClient,
    run_mode: RunMode,
    supervisor: RelaySupervisor,
    relay_login: Option<PendingConnect<Box<dyn Transport>>>,
    listen_supervisor: RelaySupervisor,
    listen_connect: Option<PendingConnect<(Box<dyn Transport>, Vec<u8>)>>,
    listener: Option<Box<dyn Transport>>,
    listen_output: Option<RingWriter>,
    kiosk: bool,
    idle_timeout: Duration,
    tick_interval: Duration,
    reconnect_delay_ms: u64,
    upload: UploadConfig,
    scratch: Vec<u8>,
    chunk: Vec<u8>,
    stats: ServerStats,
}

impl RelayServer {
    /// Create a server; settings are loaded from `storage`
    ///
    /// `startup_auto_mode` picks the [`RunMode`]. The relay is kept up in
    /// transmitter mode or whenever `relay.enabled` is set; the listener
    /// only in listener mode.
    pub fn new(config: &AppConfig, acceptor: Box<dyn Acceptor>, storage: Box<dyn Storage>) -> Self {
        let settings = SettingsService::load(storage.as_ref());
        let run_mode = RunMode::from_settings(settings.store());
        let reconnect_delay = Duration::from_millis(config.relay.reconnect_delay_ms);
        tracing::info!("Starting in {:?} mode", run_mode);
        Self {
            table: ConnectionTable::new(config.server.max_connections),
            acceptor,
            source: None,
            storage,
            settings,
            control: None,
            connector: Arc::new(TcpConnector::new(Duration::from_millis(config.relay.connect_timeout_ms))),
            icy: IcyClient::new(&config.relay),
            run_mode,
            supervisor: RelaySupervisor::new(
                config.relay.enabled || run_mode == RunMode::Transmitter,
                reconnect_delay,
            ),
            relay_login: None,
            listen_supervisor: RelaySupervisor::new(run_mode == RunMode::Listener, reconnect_delay),
            listen_connect: None,
            listener: None,
            listen_output: None,
            kiosk: false,
            idle_timeout: Duration::from_millis(config.server.idle_timeout_ms),
            tick_interval: Duration::from_millis(config.server.tick_interval_ms),
            reconnect_delay_ms: config.relay.reconnect_delay_ms,
            upload: config.upload.clone(),
            scratch: vec![0u8; config.server.packet_size],
            chunk: vec![0u8; crate::constants::FILE_CHUNK_SIZE],
            stats: ServerStats::default(),
        }
    }

    /// Pull audio from `source`
    pub fn with_audio_source(mut self, source: Box<dyn AudioSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Dial Icecast servers through `connector`
    pub fn with_connector(mut self, connector: Box<dyn Connector>) -> Self {
        self.connector = Arc::from(connector);
        self
    }

    /// Write the listened stream into `writer`
    pub fn with_listener_output(mut self, writer: RingWriter) -> Self {
        self.listen_output = Some(writer);
        self
    }

    /// Drain control inputs from `rx` every tick
    pub fn with_control(mut self, rx: Receiver<ControlInput>) -> Self {
        self.control = Some(rx);
        self
    }

    /// Publish device events to `tx`
    pub fn with_events(mut self, tx: Sender<DeviceEvent>) -> Self {
        self.settings.set_event_sender(tx);
        self
    }

    pub fn settings(&self) -> &SettingsStore {
        self.settings.store()
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.table
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    pub fn is_kiosk(&self) -> bool {
        self.kiosk
    }

    pub fn set_kiosk(&mut self, on: bool) {
        if self.kiosk != on {
            tracing::info!("Kiosk mode {}", if on { "on" } else { "off" });
        }
        self.kiosk = on;
    }

    /// Enable or disable the Icecast relay
    pub fn set_relay_enabled(&mut self, enabled: bool) {
        self.supervisor.set_enabled(enabled);
    }

    /// Counters plus a snapshot of the connection table
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            open_connections: self.table.len(),
            websocket_clients: self.table.count_kind(ConnectionKind::WebSocket),
            mp3_listeners: self.table.count_kind(ConnectionKind::Mp3Local),
            relay_connected: self.is_icecast_broadcast_connected(),
            listener_connected: self.is_listener_connected(),
            ..self.stats.clone()
        }
    }

    /// Tick until `running` is cleared, then close every connection
    ///
    /// A stats snapshot is published to `snapshot` about once per second.
    pub fn run(&mut self, running: &AtomicBool, snapshot: &Mutex<ServerStats>) {
        tracing::info!("Network loop started ({} connection slots)", self.table.capacity());
        let mut last_snapshot = Instant::now();
        while running.load(Ordering::Relaxed) {
            let now = Instant::now();
            self.tick(now);
            if now.saturating_duration_since(last_snapshot) >= SNAPSHOT_INTERVAL {
                *snapshot.lock() = self.stats();
                last_snapshot = now;
            }
            thread::sleep(self.tick_interval);
        }
        *snapshot.lock() = self.stats();
        self.shutdown();
        tracing::info!("Network loop stopped");
    }

    /// Close every open connection
    ///
    /// Pending connect attempts are abandoned; their helpers close whatever
    /// they opened once they notice.
    pub fn shutdown(&mut self) {
        for index in self.table.occupied() {
            if let Some(conn) = self.table.checkout(index) {
                self.retire(index, conn, "shutdown", Instant::now());
            }
        }
        self.relay_login = None;
        self.listen_connect = None;
        if let Some(mut listener) = self.listener.take() {
            listener.close();
        }
    }

    /// One pass over all connections
    pub fn tick(&mut self, now: Instant) {
        self.stats.ticks += 1;
        self.drain_control();
        self.accept_pending(now);
        for index in self.table.occupied() {
            self.service(index, now);
        }
        self.pump_listener(now);
        self.fan_out_audio(now);
        self.supervise_relay(now);
    }

    /// Update, persist and broadcast a setting
    ///
    /// Every update path ends here, so persistence and broadcast happen in
    /// the order updates were received.
    pub fn apply_setting(&mut self, name: &str, value: &str) {
        self.settings.apply(self.storage.as_ref(), name, value);
        let sent = websocket::broadcast_setting(&mut self.table, name, value);
        tracing::debug!("Setting {} broadcast to {} client(s)", name, sent);
        self.settings.publish(DeviceEvent::SettingChanged {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    /// Start connecting and logging in to the configured Icecast server
    ///
    /// The login runs on a helper thread; later ticks pick up the result.
    /// On success the relay occupies a connection slot as
    /// [`ConnectionKind::Mp3Icecast`] and receives the same audio as local
    /// listeners.
    pub fn start_icecast_broadcast(&mut self, now: Instant) -> Result<(), RelayError> {
        if self.relay_login.is_some() {
            return Err(RelayError::InProgress);
        }
        self.supervisor.mark_attempt(now);
        if self.table.is_full() {
            return Err(RelayError::TableFull);
        }
        let target = RelayTarget::from_settings(self.settings.store())?;
        self.relay_login = Some(spawn_login(&self.icy, &self.connector, target)?);
        Ok(())
    }

    /// Whether a relay connection currently occupies a slot
    pub fn is_icecast_broadcast_connected(&self) -> bool {
        self.table.find_kind(ConnectionKind::Mp3Icecast).is_some()
    }

    /// Whether a relay login is still running
    pub fn is_icecast_login_pending(&self) -> bool {
        self.relay_login.is_some()
    }

    /// Start connecting to the stream named by the `listen_icecast_*`
    /// settings
    ///
    /// Like the relay login this runs on a helper thread.
    pub fn start_listener(&mut self, now: Instant) -> Result<(), RelayError> {
        if self.listen_connect.is_some() {
            return Err(RelayError::InProgress);
        }
        self.listen_supervisor.mark_attempt(now);
        let target = ListenTarget::from_settings(self.settings.store())?;
        self.listen_connect = Some(spawn_listen(&self.icy, &self.connector, target)?);
        Ok(())
    }

    /// Whether a remote stream is being received
    pub fn is_listener_connected(&self) -> bool {
        self.listener.is_some()
    }

    /// Whether a listener connection is still being set up
    pub fn is_listener_pending(&self) -> bool {
        self.listen_connect.is_some()
    }

    fn drain_control(&mut self) {
        let Some(rx) = &self.control else {
            return;
        };
        let inputs: Vec<ControlInput> = rx.try_iter().collect();
        for input in inputs {
            match input {
                ControlInput::SetSetting { name, value } => self.apply_setting(&name, &value),
                ControlInput::SetKiosk(on) => self.set_kiosk(on),
            }
        }
    }

    fn accept_pending(&mut self, now: Instant) {
        while let Some(transport) = self.acceptor.accept_pending() {
            let peer = transport.peer();
            match self.table.accept(transport, now) {
                Ok(index) => {
                    self.stats.accepted += 1;
                    tracing::debug!("Accepted {} into slot {}", peer, index);
                }
                Err(e) => {
                    self.stats.rejected += 1;
                    tracing::warn!("Rejected {}: {}", peer, e);
                }
            }
        }
    }

    fn service(&mut self, index: usize, now: Instant) {
        // Checked out so handlers can broadcast to the rest of the table.
        let Some(mut conn) = self.table.checkout(index) else {
            return;
        };

        if !conn.transport.is_connected() {
            self.stats.dropped_disconnected += 1;
            self.retire(index, conn, "peer disconnected", now);
            return;
        }
        if conn.is_idle(now, self.idle_timeout) {
            self.stats.evicted_idle += 1;
            self.retire(index, conn, "idle", now);
            return;
        }

        let keep = match conn.kind {
            ConnectionKind::Unknown | ConnectionKind::GetPending => self.handle_request(&mut conn, now),
            ConnectionKind::WebSocket => self.handle_websocket(&mut conn, now),
            ConnectionKind::Mp3Local => true,
            ConnectionKind::Mp3Icecast => {
                self.drain_relay_reply(&mut conn);
                true
            }
        };

        if keep {
            self.table.restore(index, conn);
        } else {
            self.retire(index, conn, "closed", now);
        }
    }

    fn retire(&mut self, index: usize, mut conn: Connection, reason: &str, now: Instant) {
        conn.transport.close();
        tracing::debug!(
            "Slot {} (#{} {:?} {}) freed: {}",
            index,
            conn.id(),
            conn.kind,
            conn.transport.peer(),
            reason
        );
        if let Some(notice) = conn.close_notice.take() {
            if notice == DeviceEvent::RelayClosed {
                tracing::warn!("Icecast relay connection lost ({})", reason);
                self.supervisor.mark_closed(now);
            }
            self.settings.publish(notice);
        }
    }

    fn handle_request(&mut self, conn: &mut Connection, now: Instant) -> bool {
        let mut scratch = std::mem::take(&mut self.scratch);
        let keep = match conn.transport.read_available(&mut scratch) {
            Ok(0) => true,
            Ok(n) => {
                conn.touch(now);
                self.dispatch_request(conn, &scratch[..n], now)
            }
            Err(e) => {
                tracing::debug!("Read from {} failed: {}", conn.transport.peer(), e);
                false
            }
        };
        self.scratch = scratch;
        keep
    }

    fn dispatch_request(&mut self, conn: &mut Connection, request: &[u8], now: Instant) -> bool {
        let peer = conn.transport.peer();
        match web::classify(request) {
            RequestClass::Post { path } => {
                match http::receive_upload(
                    conn.transport.as_mut(),
                    self.storage.as_ref(),
                    request,
                    &self.upload,
                    &mut self.chunk,
                ) {
                    Ok(report) => {
                        self.stats.uploads += 1;
                        tracing::info!(
                            "Stored upload {} ({} bytes{}) from {}",
                            report.filename,
                            report.bytes_written,
                            if report.complete { "" } else { ", incomplete" },
                            peer
                        );
                        http::send_response(conn.transport.as_mut(), 201, "text/plain", b"File was uploaded!");
                        conn.set_timed_close(now);
                        true
                    }
                    Err(e @ UploadError::Storage { .. }) => {
                        tracing::error!("Upload from {} failed: {}", peer, e);
                        http::send_response(conn.transport.as_mut(), e.status_code(), "text/plain", b"");
                        false
                    }
                    Err(e) => {
                        tracing::warn!("Upload to {} from {} rejected: {}", path, peer, e);
                        http::send_response(conn.transport.as_mut(), e.status_code(), "text/plain", b"");
                        false
                    }
                }
            }
            RequestClass::WebSocket { key } => {
                conn.kind = ConnectionKind::WebSocket;
                let response = websocket::handshake_response(&key);
                if conn.transport.write_bytes(response.as_bytes()) != response.len() {
                    return false;
                }
                let dump = websocket::encode_text_frame(self.settings.dump().as_bytes());
                let sent = conn.transport.write_bytes(&dump);
                if sent != dump.len() {
                    // A cut frame leaves the client out of sync.
                    tracing::warn!(
                        "Settings dump to WebSocket {} cut short ({} of {} bytes)",
                        peer,
                        sent,
                        dump.len()
                    );
                    return false;
                }
                tracing::info!("WebSocket client {} connected", peer);
                true
            }
            RequestClass::Mp3 { path } => {
                conn.kind = ConnectionKind::Mp3Local;
                tracing::info!("Listener {} started {}", peer, path);
                http::send_stream_header(conn.transport.as_mut())
            }
            RequestClass::File { path } => {
                let status = http::serve_file(
                    conn.transport.as_mut(),
                    self.storage.as_ref(),
                    &path,
                    self.kiosk,
                    &mut self.chunk,
                );
                self.stats.files_served += 1;
                tracing::debug!("GET {} from {} -> {}", path, peer, status);
                conn.set_timed_close(now);
                true
            }
            RequestClass::Ignore => {
                tracing::debug!("Ignoring request from {}", peer);
                false
            }
        }
    }

    fn handle_websocket(&mut self, conn: &mut Connection, now: Instant) -> bool {
        let mut scratch = std::mem::take(&mut self.scratch);
        let keep = match conn.transport.read_available(&mut scratch) {
            Ok(0) => true,
            Ok(n) => {
                conn.touch(now);
                let decoded = websocket::decode_messages(&mut scratch[..n]);
                let mut keep = true;
                for message in decoded.messages {
                    match message {
                        WsMessage::Setting { name, value } => self.apply_setting(&name, &value),
                        WsMessage::Command(command) => {
                            tracing::info!("Device command {:?} from {}", command, conn.transport.peer());
                            self.settings.publish(DeviceEvent::Command(command));
                        }
                        WsMessage::UnknownCommand(name) => {
                            tracing::warn!("Unknown command {} from {}", name, conn.transport.peer());
                        }
                        WsMessage::Close => {
                            keep = false;
                            break;
                        }
                    }
                }
                if let Some(e) = decoded.error.filter(|_| keep) {
                    tracing::warn!("Closing WebSocket {}: {}", conn.transport.peer(), e);
                    keep = false;
                }
                keep
            }
            Err(e) => {
                tracing::debug!("WebSocket read from {} failed: {}", conn.transport.peer(), e);
                false
            }
        };
        self.scratch = scratch;
        keep
    }

    fn drain_relay_reply(&mut self, conn: &mut Connection) {
        match conn.transport.read_available(&mut self.chunk) {
            Ok(0) => {}
            Ok(n) => tracing::debug!(
                "Icecast server says: {}",
                String::from_utf8_lossy(&self.chunk[..n]).trim_end()
            ),
            Err(e) => tracing::debug!("Icecast read failed: {}", e),
        }
    }

    fn pump_listener(&mut self, now: Instant) {
        if let Some(pending) = self.listen_connect.take() {
            match pending.poll() {
                None => self.listen_connect = Some(pending),
                Some(Ok((transport, audio))) => {
                    tracing::info!("Listening to {}", pending.label());
                    self.stats.listener_bytes += audio.len() as u64;
                    if let Some(output) = self.listen_output.as_mut() {
                        output.write(&audio);
                    }
                    self.listener = Some(transport);
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        "Listener connection to {} failed: {}; retrying in {} ms",
                        pending.label(),
                        e,
                        self.reconnect_delay_ms
                    );
                    self.listen_supervisor.mark_closed(now);
                }
            }
        }

        if let Some(transport) = self.listener.as_mut() {
            let lost = match transport.read_available(&mut self.chunk) {
                Ok(0) => !transport.is_connected(),
                Ok(n) => {
                    self.stats.listener_bytes += n as u64;
                    if let Some(output) = self.listen_output.as_mut() {
                        output.write(&self.chunk[..n]);
                    }
                    false
                }
                Err(e) => {
                    tracing::debug!("Listener read from {} failed: {}", transport.peer(), e);
                    true
                }
            };
            if lost {
                transport.close();
                tracing::warn!("Listened stream from {} ended; reconnecting", transport.peer());
                self.listener = None;
                self.listen_supervisor.mark_closed(now);
            }
        }

        if self.listener.is_some() || self.listen_connect.is_some() || !self.listen_supervisor.is_due(now) {
            return;
        }
        if let Err(e) = self.start_listener(now) {
            tracing::warn!("Listener unavailable: {}; retrying in {} ms", e, self.reconnect_delay_ms);
        }
    }

    fn fan_out_audio(&mut self, now: Instant) {
        let Some(source) = self.source.as_mut() else {
            return;
        };
        let Some(slot) = source.poll_ready_slot() else {
            return;
        };
        self.stats.slots_relayed += 1;
        let mut stalled = Vec::new();
        for (index, conn) in self.table.iter_mut() {
            if !conn.kind.is_mp3() {
                continue;
            }
            let written = conn.transport.write_available(&slot);
            self.stats.audio_bytes_sent += written as u64;
            if written != slot.len() {
                tracing::debug!("Slot {} took {} of {} audio bytes", index, written, slot.len());
            }
            if conn.note_audio_write(written == slot.len()) >= MAX_STALLED_SLOTS {
                stalled.push(index);
            }
        }
        for index in stalled {
            if let Some(conn) = self.table.checkout(index) {
                self.stats.dropped_stalled += 1;
                self.retire(index, conn, "stalled", now);
            }
        }
    }

    fn supervise_relay(&mut self, now: Instant) {
        if let Some(pending) = self.relay_login.take() {
            match pending.poll() {
                None => {
                    self.relay_login = Some(pending);
                    return;
                }
                Some(Ok(transport)) => self.install_relay(transport, pending.label(), now),
                Some(Err(e)) => {
                    tracing::warn!(
                        "Icecast relay to {} failed: {}; retrying in {} ms",
                        pending.label(),
                        e,
                        self.reconnect_delay_ms
                    );
                    self.supervisor.mark_closed(now);
                }
            }
        }

        if !self.supervisor.is_due(now) || self.is_icecast_broadcast_connected() {
            return;
        }
        match self.start_icecast_broadcast(now) {
            Ok(()) => {}
            Err(e @ RelayError::NotConfigured(_)) => tracing::debug!("Icecast relay idle: {}", e),
            Err(e) => {
                tracing::warn!("Icecast relay unavailable: {}; retrying in {} ms", e, self.reconnect_delay_ms)
            }
        }
    }

    fn install_relay(&mut self, transport: Box<dyn Transport>, label: &str, now: Instant) {
        match self.table.insert(transport, ConnectionKind::Mp3Icecast, now) {
            Ok(index) => {
                if let Some(conn) = self.table.get_mut(index) {
                    conn.close_notice = Some(DeviceEvent::RelayClosed);
                }
                tracing::info!("Relaying to {} from slot {}", label, index);
            }
            Err(e) => {
                tracing::warn!("No slot for the relay to {}: {}", label, e);
                self.supervisor.mark_closed(now);
            }
        }
    }
}
