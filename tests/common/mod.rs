//! Shared pseudo-terminal harness: the test drives the `control` end
//! while the library opens the other end like any serial device.
#![allow(dead_code)] // not every test binary uses every helper

use std::io::Read;
use std::time::{Duration, Instant};

use serialport::{SerialPort, TTYPort};

use okserial::{Connection, ConnectionOptions};

/// A pty pair: the control handle and the device path of its other end.
///
/// The library reopens the device path itself, so the harness's own
/// handle must not leave the exclusive-use flag behind.
pub fn pty_pair() -> (TTYPort, String) {
    let (mut control, mut simulated) = TTYPort::pair().expect("pseudo-terminal pair");
    control
        .set_timeout(Duration::from_millis(200))
        .expect("control timeout");
    simulated.set_exclusive(false).ok();
    let path = simulated.name().expect("pty device path");
    (control, path)
}

/// Connection options safe for tests: lockfiles land in the system temp
/// directory instead of /var/lock.
pub fn options() -> ConnectionOptions {
    ConnectionOptions::default().with_lock_dir(std::env::temp_dir())
}

pub fn open_connection(path: &str) -> Connection {
    Connection::open_device(path, &options()).expect("open pty connection")
}

/// Read exactly `n` bytes from the control end, riding out poll timeouts.
pub fn read_exactly(port: &mut TTYPort, n: usize) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut out = Vec::with_capacity(n);
    let mut buf = [0u8; 4096];
    while out.len() < n {
        assert!(Instant::now() < deadline, "timed out after {} bytes", out.len());
        match port.read(&mut buf) {
            Ok(count) => out.extend(&buf[..count]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => panic!("control side read failed: {e}"),
        }
    }
    out.truncate(n);
    out
}
