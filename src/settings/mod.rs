//! Device settings: store, persistence and the update path

pub mod control;
pub mod store;

pub use control::{control_channel, ControlHandle, ControlInput, DeviceCommand, DeviceEvent};
pub use store::{parse_setting, SettingsStore, DEFAULT_SETTINGS};

use crossbeam_channel::Sender;

use crate::constants::SETTINGS_PATH;
use crate::storage::Storage;

/// What the appliance does with audio after boot
///
/// Read once from `startup_auto_mode` at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// No audio until the user picks a mode
    Waiting,
    /// Pull a remote stream and play it
    Listener,
    /// Encode local audio and serve it to listeners and the relay
    Transmitter,
}

impl RunMode {
    /// Anything other than `waiting` or `listener` means transmitter
    pub fn from_settings(store: &SettingsStore) -> Self {
        match store.get("startup_auto_mode").map(str::trim) {
            Some("waiting") => Self::Waiting,
            Some("listener") => Self::Listener,
            _ => Self::Transmitter,
        }
    }
}

/// Settings store plus persistence and event publication
///
/// Lives inside the network loop; every mutation goes through
/// [`SettingsService::apply`].
pub struct SettingsService {
    store: SettingsStore,
    events: Option<Sender<DeviceEvent>>,
}

impl SettingsService {
    pub fn new(store: SettingsStore) -> Self {
        Self {
            store,
            events: None,
        }
    }

    /// Load persisted settings, seeding defaults when none are stored
    pub fn load(storage: &dyn Storage) -> Self {
        let mut store = SettingsStore::from_text(DEFAULT_SETTINGS);
        match storage.read_all(SETTINGS_PATH) {
            Ok(data) => {
                store.load_text(&String::from_utf8_lossy(&data));
                tracing::info!("Loaded {} settings from {}", store.len(), SETTINGS_PATH);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No stored settings, using defaults");
            }
            Err(e) => {
                tracing::warn!("Failed to read {}: {}, using defaults", SETTINGS_PATH, e);
            }
        }
        Self::new(store)
    }

    /// Publish device events to `tx`
    pub fn set_event_sender(&mut self, tx: Sender<DeviceEvent>) {
        self.events = Some(tx);
    }

    pub fn store(&self) -> &SettingsStore {
        &self.store
    }

    /// Update a setting and persist the whole store
    ///
    /// Persistence failures are logged; the in-memory value still changes.
    pub fn apply(&mut self, storage: &dyn Storage, name: &str, value: &str) {
        self.store.update_or_add(name, value);
        if let Err(e) = self.persist(storage) {
            tracing::error!("Failed to persist setting {}: {}", name, e);
        }
        tracing::debug!("Setting {} = {}", name, value);
    }

    /// Write the store to storage
    pub fn persist(&self, storage: &dyn Storage) -> std::io::Result<()> {
        storage.write_all(SETTINGS_PATH, self.store.to_text().as_bytes())
    }

    /// Publish a device event if anyone listens
    pub fn publish(&self, event: DeviceEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                tracing::trace!("Device event dropped: no receiver");
            }
        }
    }

    /// Serialized settings dump
    pub fn dump(&self) -> String {
        self.store.to_text()
    }
}
