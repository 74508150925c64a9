//! Inputs into and events out of the network loop
//!
//! Hardware-input contexts (volume knob, kiosk switch) never touch the
//! settings store directly. They enqueue [`ControlInput`]s through a
//! [`ControlHandle`]; the network loop drains the queue once per tick, so
//! their updates are persisted and broadcast in the same order as
//! WebSocket-originated ones. Device-facing effects leave the loop as
//! [`DeviceEvent`]s.

use crossbeam_channel::{unbounded, Receiver, Sender, TrySendError};

/// Device commands sent as `$NAME` WebSocket messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    Restart,
}

impl DeviceCommand {
    /// Parse a `$`-prefixed command name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "$RESET" | "$RESTART" => Some(Self::Restart),
            _ => None,
        }
    }
}

/// Requests from contexts outside the network loop
#[derive(Debug, Clone, PartialEq)]
pub enum ControlInput {
    /// Update, persist and broadcast a setting
    SetSetting { name: String, value: String },
    /// Physical switch position
    SetKiosk(bool),
}

/// Events published by the network loop
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A setting changed (after persistence and broadcast)
    SettingChanged { name: String, value: String },
    /// A device command arrived
    Command(DeviceCommand),
    /// The Icecast relay connection closed
    RelayClosed,
}

/// Cloneable sender for [`ControlInput`]s
#[derive(Clone)]
pub struct ControlHandle {
    tx: Sender<ControlInput>,
}

impl ControlHandle {
    /// Queue a setting update
    pub fn set_setting(&self, name: impl Into<String>, value: impl Into<String>) -> bool {
        self.send(ControlInput::SetSetting {
            name: name.into(),
            value: value.into(),
        })
    }

    /// Queue a kiosk switch change
    pub fn set_kiosk(&self, on: bool) -> bool {
        self.send(ControlInput::SetKiosk(on))
    }

    fn send(&self, input: ControlInput) -> bool {
        match self.tx.try_send(input) {
            Ok(()) => true,
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!("Control input dropped: network loop has stopped");
                false
            }
            Err(TrySendError::Full(_)) => false,
        }
    }
}

/// Create the control input queue
pub fn control_channel() -> (ControlHandle, Receiver<ControlInput>) {
    let (tx, rx) = unbounded();
    (ControlHandle { tx }, rx)
}

/// Volume knob reading as the `listen_volume` value text
///
/// `raw` is a 12-bit ADC sample. The reading is quantised to twenty steps
/// to suppress noise on the line.
pub fn volume_knob_value(raw: u16) -> String {
    let steps = u32::from(raw.clamp(6, 4086) - 6) * 20 / 4080;
    format!("{:1.2}", steps as f64 / 20.0)
}
