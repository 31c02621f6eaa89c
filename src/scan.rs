use std::collections::BTreeMap;

use serialport::{SerialPortInfo, SerialPortType};
use tracing::{debug, warn};

use crate::{error::Error, ports::PortAttributes};

/// Environment variable holding a JSON array of attribute maps which, when
/// set, replaces live enumeration. Intended for testing.
pub const SCAN_OVERRIDE_ENV: &str = "OK_SERIAL_SCAN_OVERRIDE";

/// Something which can produce a point-in-time snapshot of present ports.
///
/// The library scans through this seam so tests can inject fixed or
/// changing port sets; [`Scanner`] is the stock implementation.
pub trait ScanProvider: Send + Sync {
    /// A snapshot of the ports present right now, sorted by device name.
    fn scan(&self) -> Result<Vec<PortAttributes>, Error>;
}

#[derive(Debug, Clone)]
enum Source {
    /// Ask the host OS.
    System,
    /// A fixed snapshot, from the override variable or from a test.
    Fixed(Vec<PortAttributes>),
    /// The override variable was set but unusable; surfaced per scan.
    Invalid(String),
}

/// The stock enumeration provider.
///
/// `$OK_SERIAL_SCAN_OVERRIDE` is read once, at construction, never per
/// call; pass the scanner around to keep behavior consistent.
#[derive(Debug, Clone)]
pub struct Scanner {
    source: Source,
}

impl Scanner {
    /// A scanner honoring `$OK_SERIAL_SCAN_OVERRIDE` if set, otherwise
    /// delegating to the host OS enumeration facility.
    pub fn from_env() -> Self {
        let source = match std::env::var(SCAN_OVERRIDE_ENV) {
            Err(_) => Source::System,
            Ok(text) => match parse_override(&text) {
                Ok(ports) => {
                    debug!(ports = ports.len(), "using ${SCAN_OVERRIDE_ENV}");
                    Source::Fixed(ports)
                }
                Err(reason) => {
                    warn!(%reason, "bad ${SCAN_OVERRIDE_ENV}");
                    Source::Invalid(reason)
                }
            },
        };
        Self { source }
    }

    /// A scanner that always reports exactly the given ports.
    pub fn fixed(ports: Vec<PortAttributes>) -> Self {
        Self {
            source: Source::Fixed(ports),
        }
    }
}

impl ScanProvider for Scanner {
    fn scan(&self) -> Result<Vec<PortAttributes>, Error> {
        let mut out = match &self.source {
            Source::System => system_scan()?,
            Source::Fixed(ports) => ports.clone(),
            Source::Invalid(reason) => {
                return Err(Error::Scan(format!("bad ${SCAN_OVERRIDE_ENV}: {reason}")))
            }
        };
        out.sort_by(|a, b| a.device().cmp(b.device()));
        debug!(found = out.len(), "scanned serial ports");
        Ok(out)
    }
}

fn system_scan() -> Result<Vec<PortAttributes>, Error> {
    let infos = serialport::available_ports().map_err(|e| Error::Scan(e.to_string()))?;
    Ok(infos.iter().map(port_from_system).collect())
}

/// Flatten the OS port description into the open attribute schema.
///
/// `vid`/`pid` are decimal strings (matching what raw providers report)
/// while `vid_pid` is the conventional `vvvv:pppp` hex pair, so both
/// spellings are searchable.
fn port_from_system(info: &SerialPortInfo) -> PortAttributes {
    let mut attrs: Vec<(String, String)> = Vec::new();
    let mut push = |k: &str, v: String| {
        if !v.is_empty() && v != "n/a" {
            attrs.push((k.to_string(), v));
        }
    };

    match &info.port_type {
        SerialPortType::UsbPort(usb) => {
            push("subsystem", "usb".into());
            push("vid", usb.vid.to_string());
            push("pid", usb.pid.to_string());
            push("vid_pid", format!("{:04x}:{:04x}", usb.vid, usb.pid));
            if let Some(sn) = &usb.serial_number {
                push("serial_number", sn.clone());
            }
            if let Some(m) = &usb.manufacturer {
                push("manufacturer", m.clone());
            }
            if let Some(p) = &usb.product {
                push("product", p.clone());
                push("description", p.clone());
            }
        }
        SerialPortType::PciPort => push("subsystem", "pci".into()),
        SerialPortType::BluetoothPort => push("subsystem", "bluetooth".into()),
        SerialPortType::Unknown => {}
    }

    PortAttributes::new(&info.port_name, attrs)
}

fn parse_override(text: &str) -> Result<Vec<PortAttributes>, String> {
    let maps: Vec<BTreeMap<String, String>> =
        serde_json::from_str(text).map_err(|e| e.to_string())?;

    maps.into_iter()
        .map(|mut map| {
            let device = map
                .remove("device")
                .ok_or_else(|| "entry is missing a `device` attribute".to_string())?;
            Ok(PortAttributes::new(&device, map))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn override_text_parses_into_ports() {
        let ports = parse_override(
            r#"[
                {"device": "/dev/ttyACM1", "manufacturer": "Adafruit"},
                {"device": "/dev/ttyACM0"}
            ]"#,
        )
        .unwrap();

        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].device(), "/dev/ttyACM1");
        assert_eq!(ports[0].manufacturer(), Some("Adafruit"));
        assert_eq!(ports[1].get("name"), Some("ttyACM0"));
    }

    #[test]
    fn override_entries_need_a_device() {
        let err = parse_override(r#"[{"manufacturer": "Adafruit"}]"#).unwrap_err();
        assert!(err.contains("device"));
    }

    #[test]
    fn override_must_be_a_json_array() {
        assert!(parse_override("not json").is_err());
        assert!(parse_override(r#"{"device": "/dev/x"}"#).is_err());
        assert!(parse_override(r#"[{"device": 3}]"#).is_err());
    }

    #[test]
    fn fixed_snapshots_come_back_sorted() {
        let scanner = Scanner::fixed(vec![
            PortAttributes::new("/dev/ttyUSB1", Vec::<(&str, &str)>::new()),
            PortAttributes::new("/dev/ttyUSB0", Vec::<(&str, &str)>::new()),
        ]);

        let devices: Vec<String> = scanner
            .scan()
            .unwrap()
            .iter()
            .map(|p| p.device().to_string())
            .collect();
        assert_eq!(devices, vec!["/dev/ttyUSB0", "/dev/ttyUSB1"]);
    }

    #[test]
    fn invalid_override_surfaces_as_scan_error() {
        let scanner = Scanner {
            source: Source::Invalid("boom".into()),
        };
        assert!(matches!(scanner.scan(), Err(Error::Scan(_))));
    }
}
