//! Ordered `name = value` settings store
//!
//! Text format, one setting per line:
//!
//! ```text
//! # comment
//! listen_volume = 0.88
//! remote_icecast_port 8080
//! ```
//!
//! Name and value are separated by any run of spaces, tabs and `=`; each
//! ends at the next separator or the end of the line.

/// Longest stored name in bytes
pub const MAX_NAME_LENGTH: usize = 64;

/// Longest stored value in bytes
pub const MAX_VALUE_LENGTH: usize = 192;

/// Settings seeded when storage holds no settings file
pub const DEFAULT_SETTINGS: &str = "\
wifi_router_SSID = \n\
wifi_router_password = YourLocalPassword\n\
wifi_toolkit_hostname = RadioRelay\n\
wifi_toolkit_AP_SSID = RadioRelay_AP\n\
listen_icecast_url = audio.example.org\n\
listen_icecast_port = 8000\n\
listen_icecast_mountpoint = /live.mp3\n\
listen_volume = 0.88\n\
remote_icecast_url = relay.example.net\n\
remote_icecast_port = 8080\n\
remote_icecast_user = source\n\
remote_icecast_password = YourIcecastPassword\n\
remote_icecast_mountpoint = live\n\
mic_not_line = 0\n\
channels = 1\n\
bitrate = 128\n\
sample_rate = 44100\n\
agc_not_manual = 1\n\
manual_gain_level = 32.0\n\
agc_maximum_gain = 24.0\n\
startup_auto_mode = waiting\n";

fn is_separator(c: char) -> bool {
    matches!(c, ' ' | '\t' | '=')
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Parse one line into `(name, value)`
///
/// Returns `None` for blank lines. A name without a value yields an empty
/// value. Comment handling is left to the caller.
pub fn parse_setting(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let rest = line.trim_start_matches(is_separator);
    if rest.is_empty() {
        return None;
    }

    let name_end = rest.find(is_separator).unwrap_or(rest.len());
    let name = &rest[..name_end];

    let rest = rest[name_end..].trim_start_matches(is_separator);
    let value_end = rest.find(is_separator).unwrap_or(rest.len());
    let value = &rest[..value_end];

    Some((truncate(name, MAX_NAME_LENGTH), truncate(value, MAX_VALUE_LENGTH)))
}

/// Insertion-ordered settings map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsStore {
    entries: Vec<(String, String)>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from settings text
    pub fn from_text(text: &str) -> Self {
        let mut store = Self::new();
        store.load_text(text);
        store
    }

    /// Merge settings text into the store
    ///
    /// `#` lines and blank lines are skipped; a name seen again updates the
    /// earlier entry in place.
    pub fn load_text(&mut self, text: &str) {
        for line in text.lines() {
            if line.trim_start().starts_with('#') {
                continue;
            }
            if let Some((name, value)) = parse_setting(line) {
                self.update_or_add(name, value);
            }
        }
    }

    /// Serialize as `name = value\n` lines in insertion order
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for (name, value) in &self.entries {
            text.push_str(name);
            text.push_str(" = ");
            text.push_str(value);
            text.push('\n');
        }
        text
    }

    /// Update a setting in place or append it
    pub fn update_or_add(&mut self, name: &str, value: &str) {
        let name = truncate(name, MAX_NAME_LENGTH);
        let value = truncate(value, MAX_VALUE_LENGTH).to_string();
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Non-empty string setting
    pub fn get_nonempty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.is_empty())
    }

    pub fn get_u16(&self, name: &str, default: u16) -> u16 {
        self.get(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn get_f32(&self, name: &str, default: f32) -> f32 {
        self.get(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_setting_forms() {
        assert_eq!(parse_setting("a = 1"), Some(("a", "1")));
        assert_eq!(parse_setting("  a\t2\r\n"), Some(("a", "2")));
        assert_eq!(parse_setting("a=3 trailing"), Some(("a", "3")));
        assert_eq!(parse_setting("password = "), Some(("password", "")));
        assert_eq!(parse_setting("   "), None);
        assert_eq!(parse_setting(""), None);
    }

    #[test]
    fn test_load_skips_comments_and_blanks() {
        let store = SettingsStore::from_text("# header\n\nvolume = 0.5\r\n#x = y\nport = 8000\n");
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("volume"), Some("0.5"));
        assert_eq!(store.get_u16("port", 1), 8000);
        assert_eq!(store.get("x"), None);
    }

    #[test]
    fn test_update_keeps_order() {
        let mut store = SettingsStore::from_text("a = 1\nb = 2\n");
        store.update_or_add("a", "9");
        store.update_or_add("c", "3");
        assert_eq!(store.to_text(), "a = 9\nb = 2\nc = 3\n");
    }

    #[test]
    fn test_typed_getters_fall_back() {
        let store = SettingsStore::from_text("vol = loud\nport = 70000\n");
        assert_eq!(store.get_f32("vol", 0.9), 0.9);
        assert_eq!(store.get_u16("port", 8000), 8000);
        assert_eq!(store.get_f32("missing", 0.5), 0.5);
    }

    #[test]
    fn test_default_settings_parse() {
        let store = SettingsStore::from_text(DEFAULT_SETTINGS);
        assert_eq!(store.get("wifi_router_SSID"), Some(""));
        assert_eq!(store.get_u16("remote_icecast_port", 0), 8080);
        assert_eq!(store.get("remote_icecast_mountpoint"), Some("live"));
    }

    #[test]
    fn test_values_are_truncated() {
        let mut store = SettingsStore::new();
        store.update_or_add("long", &"x".repeat(500));
        assert_eq!(store.get("long").unwrap().len(), MAX_VALUE_LENGTH);
    }

    fn pairs() -> impl Strategy<Value = Vec<(String, String)>> {
        proptest::collection::vec(("[a-zA-Z_$][a-zA-Z0-9_.]{0,20}", "[a-zA-Z0-9_./:-]{0,30}"), 0..20)
            .prop_map(|mut pairs| {
                let mut seen = std::collections::HashSet::new();
                pairs.retain(|(name, _)| seen.insert(name.clone()));
                pairs
            })
    }

    proptest! {
        #[test]
        fn test_serialize_reload_round_trip(pairs in pairs()) {
            let mut store = SettingsStore::new();
            for (name, value) in &pairs {
                store.update_or_add(name, value);
            }
            let reloaded = SettingsStore::from_text(&store.to_text());
            let got: Vec<(String, String)> = reloaded
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect();
            prop_assert_eq!(got, pairs);
        }
    }
}
