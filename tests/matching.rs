//! Selection end to end: enumerate, match, and open exactly one port.

use pretty_assertions::assert_eq;

use okserial::{Connection, Error, Matcher, PortAttributes, ScanProvider, Scanner};

mod common;
use common::pty_pair;

fn port(device: &str, attrs: &[(&str, &str)]) -> PortAttributes {
    PortAttributes::new(device, attrs.to_vec())
}

#[test]
fn open_matching_selects_the_single_match() {
    let (_control, path) = pty_pair();
    let scanner = Scanner::fixed(vec![
        port(&path, &[("manufacturer", "Adafruit"), ("vid", "9114")]),
        port("/dev/ttyS0", &[("subsystem", "platform")]),
    ]);

    let matcher = Matcher::new("adafruit 0x239a").unwrap();
    let conn = Connection::open_matched(&scanner, &matcher, &common::options()).unwrap();
    assert_eq!(conn.device(), path);
}

#[test]
fn zero_matches_is_an_error() {
    let scanner = Scanner::fixed(vec![port("/dev/ttyS0", &[("subsystem", "platform")])]);
    let matcher = Matcher::new("adafruit").unwrap();

    let result = Connection::open_matched(&scanner, &matcher, &common::options());
    match result {
        Err(Error::NoMatch { expression }) => assert_eq!(expression, "adafruit"),
        other => panic!("expected NoMatch, got {other:?}"),
    }
}

#[test]
fn several_matches_are_reported_in_device_order() {
    let scanner = Scanner::fixed(vec![
        port("/dev/ttyUSB1", &[("manufacturer", "FTDI")]),
        port("/dev/ttyUSB0", &[("manufacturer", "FTDI")]),
    ]);
    let matcher = Matcher::new("ftdi").unwrap();

    let result = Connection::open_matched(&scanner, &matcher, &common::options());
    match result {
        Err(Error::AmbiguousMatch { candidates, .. }) => {
            assert_eq!(candidates, vec!["/dev/ttyUSB0", "/dev/ttyUSB1"]);
        }
        other => panic!("expected AmbiguousMatch, got {other:?}"),
    }
}

#[test]
fn bad_expressions_fail_before_scanning() {
    let result = Connection::open_matching("~/unterminated", &common::options());
    assert!(matches!(result, Err(Error::Parse { .. })), "{result:?}");
}

#[test]
fn scan_override_replaces_live_enumeration() {
    // Only this test touches the variable, and integration test binaries
    // run as their own processes.
    std::env::set_var(
        okserial::scan::SCAN_OVERRIDE_ENV,
        r#"[
            {"device": "/dev/ttyFAKE1", "manufacturer": "Imaginary", "vid": "9114"},
            {"device": "/dev/ttyFAKE0", "manufacturer": "Imaginary"}
        ]"#,
    );
    let scanner = Scanner::from_env();
    std::env::remove_var(okserial::scan::SCAN_OVERRIDE_ENV);

    let snapshot = scanner.scan().unwrap();
    let devices: Vec<&str> = snapshot.iter().map(|p| p.device()).collect();
    assert_eq!(devices, vec!["/dev/ttyFAKE0", "/dev/ttyFAKE1"]);

    // The capture is point-in-time: clearing the variable after
    // construction changes nothing.
    assert_eq!(scanner.scan().unwrap().len(), 2);

    let matcher = Matcher::new("0x239a").unwrap();
    let matched = matcher.filter(&snapshot);
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].device(), "/dev/ttyFAKE1");
}
