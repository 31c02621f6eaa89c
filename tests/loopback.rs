//! End-to-end connection behavior over a pseudo-terminal pair: one end
//! is driven by the test, the other is opened as an ordinary device.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use okserial::{Connection, ConnectionOptions, Error};

mod common;
use common::{open_connection, pty_pair, read_exactly};

#[test]
fn echo_loopback() {
    let (mut control, path) = pty_pair();
    let conn = open_connection(&path);

    assert_eq!(conn.write(b"hello\n").unwrap(), 6);
    conn.drain_sync(Some(Duration::from_secs(1))).unwrap();
    assert_eq!(read_exactly(&mut control, 6), b"hello\n");

    control.write_all(b"world").unwrap();
    let mut got = Vec::new();
    while got.len() < 5 {
        got.extend(conn.read_sync(Some(Duration::from_secs(2)), 4096).unwrap());
    }
    assert_eq!(got, b"world");

    // Close is idempotent.
    conn.close();
    conn.close();
}

#[test]
fn read_timeout_is_not_an_error() {
    let (_control, path) = pty_pair();
    let conn = open_connection(&path);

    let start = Instant::now();
    let data = conn
        .read_sync(Some(Duration::from_millis(100)), 4096)
        .unwrap();
    assert!(data.is_empty());
    assert!(start.elapsed() >= Duration::from_millis(90));
    assert!(start.elapsed() < Duration::from_secs(2));

    assert!(conn.read_nowait(4096).unwrap().is_empty());
    assert_eq!(conn.fault(), None);
}

#[test]
fn zero_timeout_returns_immediately() {
    let (_control, path) = pty_pair();
    let conn = open_connection(&path);

    let start = Instant::now();
    assert!(conn
        .read_sync(Some(Duration::ZERO), 4096)
        .unwrap()
        .is_empty());
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[test]
fn interrupt_unblocks_a_pending_reader() {
    let (_control, path) = pty_pair();
    let conn = Arc::new(open_connection(&path));

    let reader = {
        let conn = Arc::clone(&conn);
        std::thread::spawn(move || conn.read_sync(Some(Duration::from_secs(60)), 4096))
    };

    std::thread::sleep(Duration::from_millis(50));
    let start = Instant::now();
    conn.interrupt();
    let result = reader.join().unwrap();

    assert!(matches!(result, Err(Error::Interrupted { .. })), "{result:?}");
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn max_bytes_bounds_each_read() {
    let (mut control, path) = pty_pair();
    let conn = open_connection(&path);

    control.write_all(b"abcdefgh").unwrap();
    let mut got = Vec::new();
    while got.len() < 8 {
        let chunk = conn.read_sync(Some(Duration::from_secs(2)), 3).unwrap();
        assert!(chunk.len() <= 3, "{chunk:?}");
        got.extend(chunk);
    }
    assert_eq!(got, b"abcdefgh");
}

#[test]
fn reads_consume_in_arrival_order() {
    let (mut control, path) = pty_pair();
    let conn = open_connection(&path);

    for chunk in [b"one".as_slice(), b"two", b"three"] {
        control.write_all(chunk).unwrap();
    }

    let mut got = Vec::new();
    while got.len() < 11 {
        got.extend(conn.read_sync(Some(Duration::from_secs(2)), 4096).unwrap());
    }
    assert_eq!(got, b"onetwothree");
}

#[test]
fn concurrent_readers_split_without_loss_or_duplication() {
    let (mut control, path) = pty_pair();
    let conn = Arc::new(open_connection(&path));

    const TOTAL: usize = 2048;
    let sent: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let conn = Arc::clone(&conn);
            std::thread::spawn(move || {
                let mut got = Vec::new();
                let mut quiet = 0;
                while quiet < 3 {
                    let chunk = conn
                        .read_sync(Some(Duration::from_millis(200)), 64)
                        .unwrap();
                    if chunk.is_empty() {
                        quiet += 1;
                    } else {
                        quiet = 0;
                        got.extend(chunk);
                    }
                }
                got
            })
        })
        .collect();

    for chunk in sent.chunks(256) {
        control.write_all(chunk).unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }

    let mut received: Vec<u8> = Vec::new();
    for reader in readers {
        received.extend(reader.join().unwrap());
    }

    // No byte delivered twice, none skipped: the multisets agree.
    assert_eq!(received.len(), TOTAL);
    let mut expected = sent.clone();
    let mut actual = received;
    expected.sort_unstable();
    actual.sort_unstable();
    assert_eq!(actual, expected);
}

#[test]
fn drain_waits_for_slow_consumers() {
    let (mut control, path) = pty_pair();
    let conn = open_connection(&path);

    // Much more than a pty buffer holds, so the writer must cycle.
    const TOTAL: usize = 64 * 1024;
    let consumer = std::thread::spawn(move || {
        let mut seen = 0;
        let mut buf = [0u8; 4096];
        while seen < TOTAL {
            match control.read(&mut buf) {
                Ok(n) => seen += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => panic!("control side read failed: {e}"),
            }
        }
        seen
    });

    let payload = vec![0x55u8; TOTAL];
    assert_eq!(conn.write(&payload).unwrap(), TOTAL);
    conn.drain_sync(Some(Duration::from_secs(10))).unwrap();
    assert_eq!(conn.outgoing_size(), 0);
    assert_eq!(consumer.join().unwrap(), TOTAL);
}

#[test]
fn drain_timeout_is_an_error() {
    let (_control, path) = pty_pair();
    let conn = open_connection(&path);

    // Nobody consumes the control side, and a pty only buffers so much.
    conn.write(&vec![0u8; 256 * 1024]).unwrap();
    let result = conn.drain_sync(Some(Duration::from_millis(100)));
    assert!(matches!(result, Err(Error::Timeout(_))), "{result:?}");
}

#[test]
fn operations_after_close_replay_the_terminal_error() {
    let (_control, path) = pty_pair();
    let conn = open_connection(&path);
    conn.close();

    assert!(matches!(conn.write(b"x"), Err(Error::Interrupted { .. })));
    assert!(matches!(
        conn.read_sync(Some(Duration::from_millis(10)), 16),
        Err(Error::Interrupted { .. })
    ));
    assert!(matches!(
        conn.drain_sync(Some(Duration::from_millis(10))),
        Err(Error::Interrupted { .. })
    ));
    assert!(matches!(conn.read_nowait(16), Err(Error::Interrupted { .. })));
    assert!(matches!(conn.get_signals(), Err(Error::Interrupted { .. })));
}

#[test]
fn disconnect_is_sticky_until_close() {
    let (control, path) = pty_pair();
    let conn = open_connection(&path);

    // Hang up the control side; the reader worker hits end-of-stream.
    drop(control);

    let error = loop {
        match conn.read_sync(Some(Duration::from_secs(2)), 4096) {
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert!(matches!(error, Error::Disconnected { .. }), "{error:?}");

    // Every operation now reports the same cause.
    assert_eq!(conn.write(b"x").unwrap_err(), error);
    assert_eq!(conn.fault(), Some(error.clone()));
    assert_eq!(
        conn.drain_sync(Some(Duration::from_millis(10))).unwrap_err(),
        error
    );

    // Close does not rewrite history.
    conn.close();
    assert_eq!(conn.write(b"x").unwrap_err(), error);
}

#[test]
fn buffered_bytes_survive_termination() {
    let (mut control, path) = pty_pair();
    let conn = open_connection(&path);

    control.write_all(b"leftover").unwrap();
    // Wait for the engine to buffer it.
    let deadline = Instant::now() + Duration::from_secs(5);
    while conn.incoming_size() < 8 {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(10));
    }

    drop(control);
    std::thread::sleep(Duration::from_millis(300));

    // Remaining bytes come out first, the terminal error after.
    let got = conn.read_nowait(4096).unwrap();
    assert_eq!(got, b"leftover");
    assert!(matches!(
        conn.read_nowait(4096),
        Err(Error::Disconnected { .. })
    ));
}

#[test]
fn empty_write_probes_liveness() {
    let (_control, path) = pty_pair();
    let conn = open_connection(&path);
    assert_eq!(conn.write(b"").unwrap(), 0);
    conn.close();
    assert!(conn.write(b"").is_err());
}

#[test]
fn open_rejects_bad_line_parameters() {
    let (_control, path) = pty_pair();
    let opts = ConnectionOptions {
        baud: 0,
        ..common::options()
    };
    let result = Connection::open_device(&path, &opts);
    assert!(matches!(result, Err(Error::Configuration(_))), "{result:?}");
}

#[test]
fn control_signal_failures_become_the_terminal_error() {
    let (_control, path) = pty_pair();
    let conn = open_connection(&path);

    // Ptys have no modem lines; whether the host fakes them or refuses,
    // the contract holds: either both reads agree, or the refusal is
    // recorded as this connection's terminal error.
    match conn.get_signals() {
        Ok(signals) => {
            assert_eq!(conn.get_signals().unwrap(), signals);
            assert_eq!(conn.fault(), None);
        }
        Err(error) => {
            assert!(matches!(error, Error::Io { .. }), "{error:?}");
            assert_eq!(conn.fault(), Some(error));
        }
    }
}
