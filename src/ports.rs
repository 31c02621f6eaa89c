use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Attribute snapshot of one serial port present on the system.
///
/// The attribute set is an open schema: a mapping from lowercase attribute
/// name to raw string value. Well-known keys (`device`, `vid_pid`,
/// `serial_number`, ...) get accessors, but anything the enumeration
/// provider reports is kept. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAttributes {
    device: String,
    attrs: BTreeMap<String, String>,
}

/// Attribute keys with agreed-upon meaning across providers.
///
/// Scoped match terms check their attribute prefix against this list at
/// compile time so that e.g. `v=...` is rejected as ambiguous.
pub const WELL_KNOWN_KEYS: &[&str] = &[
    "device",
    "name",
    "description",
    "hwid",
    "vid",
    "pid",
    "vid_pid",
    "serial_number",
    "location",
    "manufacturer",
    "product",
    "interface",
    "subsystem",
    "device_path",
    "usb_device_path",
    "usb_interface_path",
];

impl PortAttributes {
    /// Describe a port.
    ///
    /// Keys are normalized to lowercase (some hosts report mixed-case
    /// attribute names). `device` and its basename `name` are always
    /// present in the resulting map.
    pub fn new<K, V>(device: &str, attrs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut map: BTreeMap<String, String> = attrs
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_lowercase(), v.into()))
            .collect();

        map.insert("device".into(), device.to_string());
        map.entry("name".into()).or_insert_with(|| {
            device
                .rsplit('/')
                .next()
                .unwrap_or(device)
                .to_string()
        });

        Self {
            device: device.to_string(),
            attrs: map,
        }
    }

    /// The OS device identifier, e.g. `/dev/ttyUSB3` or `COM4`.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Look up an attribute by name. Lookup is case-insensitive; values
    /// are returned verbatim.
    pub fn get(&self, key: &str) -> Option<&str> {
        if key.chars().any(|c| c.is_ascii_uppercase()) {
            self.attrs.get(&key.to_lowercase()).map(String::as_str)
        } else {
            self.attrs.get(key).map(String::as_str)
        }
    }

    /// Iterate over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// Whether the map is empty (it never is for enumerated ports).
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// The `vid_pid` attribute (`vvvv:pppp`, hex), if known.
    pub fn vid_pid(&self) -> Option<&str> {
        self.get("vid_pid")
    }

    /// The USB serial number, if known.
    pub fn serial_number(&self) -> Option<&str> {
        self.get("serial_number")
    }

    /// The manufacturer string, if known.
    pub fn manufacturer(&self) -> Option<&str> {
        self.get("manufacturer")
    }

    /// The product string, if known.
    pub fn product(&self) -> Option<&str> {
        self.get("product")
    }

    /// The free-form description, if known.
    pub fn description(&self) -> Option<&str> {
        self.get("description")
    }
}

impl Display for PortAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.device)
    }
}
