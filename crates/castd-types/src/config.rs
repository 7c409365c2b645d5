//! Typed entries for the encoder `Configure` call.
//!
//! The wire form is an ordered array of `{ "k": <u32>, "v": <value> }`
//! pairs. Each key's value type is fixed at compile time by the
//! [`ConfigEntry`] variant, so a payload can never carry a mistyped value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One configuration entry with its integer wire key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEntry {
    /// Key 0: network address the worker streams to.
    PeerAddress(String),
    /// Key 1: primary RTP port on the peer.
    RtpPort(u32),
    /// Key 2: RTCP port on the peer, when negotiated.
    PeerRtcpPort(u32),
    /// Key 3: network address the worker binds locally.
    LocalAddress(String),
    /// Key 4: local RTCP port, when negotiated.
    LocalRtcpPort(u32),
    /// Key 5: x origin of the captured display region.
    X(u32),
    /// Key 6: y origin of the captured display region.
    Y(u32),
    /// Key 7: width of the captured display region.
    Width(u32),
    /// Key 8: height of the captured display region.
    Height(u32),
}

impl ConfigEntry {
    #[must_use]
    pub fn key(&self) -> u32 {
        match self {
            Self::PeerAddress(_) => 0,
            Self::RtpPort(_) => 1,
            Self::PeerRtcpPort(_) => 2,
            Self::LocalAddress(_) => 3,
            Self::LocalRtcpPort(_) => 4,
            Self::X(_) => 5,
            Self::Y(_) => 6,
            Self::Width(_) => 7,
            Self::Height(_) => 8,
        }
    }

    #[must_use]
    pub fn value(&self) -> Value {
        match self {
            Self::PeerAddress(s) | Self::LocalAddress(s) => Value::from(s.clone()),
            Self::RtpPort(n)
            | Self::PeerRtcpPort(n)
            | Self::LocalRtcpPort(n)
            | Self::X(n)
            | Self::Y(n)
            | Self::Width(n)
            | Self::Height(n) => Value::from(*n),
        }
    }
}

/// Wire shape of a single entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEntry {
    k: u32,
    v: Value,
}

/// Ordered `Configure` payload built one typed entry at a time.
///
/// Entries with no applicable value are simply never appended; the wire
/// payload carries no placeholder for them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigureParams {
    entries: Vec<ConfigEntry>,
}

impl ConfigureParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ConfigEntry) {
        self.entries.push(entry);
    }

    #[must_use]
    pub fn entries(&self) -> &[ConfigEntry] {
        &self.entries
    }

    #[must_use]
    pub fn contains_key(&self, key: u32) -> bool {
        self.entries.iter().any(|e| e.key() == key)
    }

    /// Serialize to the ordered wire array.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        let wire: Vec<WireEntry> = self
            .entries
            .iter()
            .map(|e| WireEntry {
                k: e.key(),
                v: e.value(),
            })
            .collect();
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_keys_are_stable() {
        assert_eq!(ConfigEntry::PeerAddress(String::new()).key(), 0);
        assert_eq!(ConfigEntry::RtpPort(0).key(), 1);
        assert_eq!(ConfigEntry::PeerRtcpPort(0).key(), 2);
        assert_eq!(ConfigEntry::LocalAddress(String::new()).key(), 3);
        assert_eq!(ConfigEntry::LocalRtcpPort(0).key(), 4);
        assert_eq!(ConfigEntry::X(0).key(), 5);
        assert_eq!(ConfigEntry::Y(0).key(), 6);
        assert_eq!(ConfigEntry::Width(0).key(), 7);
        assert_eq!(ConfigEntry::Height(0).key(), 8);
    }

    #[test]
    fn test_wire_preserves_order() {
        let mut params = ConfigureParams::new();
        params.push(ConfigEntry::PeerAddress("10.0.0.5".to_string()));
        params.push(ConfigEntry::RtpPort(1991));
        params.push(ConfigEntry::LocalAddress("10.0.0.2".to_string()));

        let wire = params.to_wire();
        let arr = wire.as_array().unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(arr[0]["k"], 0);
        assert_eq!(arr[0]["v"], "10.0.0.5");
        assert_eq!(arr[1]["k"], 1);
        assert_eq!(arr[1]["v"], 1991);
        assert_eq!(arr[2]["k"], 3);
        assert_eq!(arr[2]["v"], "10.0.0.2");
    }

    #[test]
    fn test_absent_entries_are_not_serialized() {
        let mut params = ConfigureParams::new();
        params.push(ConfigEntry::PeerAddress("10.0.0.5".to_string()));
        params.push(ConfigEntry::RtpPort(1991));

        assert!(!params.contains_key(2));
        assert!(!params.contains_key(4));

        let wire = params.to_wire();
        let arr = wire.as_array().unwrap();
        assert!(arr.iter().all(|e| e["k"] != 2 && e["k"] != 4));
    }

    #[test]
    fn test_rectangle_entries() {
        let mut params = ConfigureParams::new();
        params.push(ConfigEntry::X(0));
        params.push(ConfigEntry::Y(0));
        params.push(ConfigEntry::Width(1920));
        params.push(ConfigEntry::Height(1080));

        let wire = params.to_wire();
        let arr = wire.as_array().unwrap();
        assert_eq!(arr[2]["k"], 7);
        assert_eq!(arr[2]["v"], 1920);
        assert_eq!(arr[3]["k"], 8);
        assert_eq!(arr[3]["v"], 1080);
    }

    #[test]
    fn test_empty_params_serialize_to_empty_array() {
        let params = ConfigureParams::new();
        assert_eq!(params.to_wire(), serde_json::json!([]));
    }
}
