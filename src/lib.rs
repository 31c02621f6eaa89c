#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// Port attribute snapshots and the well-known attribute keys.
pub mod ports;

/// Enumeration of present serial ports, with a test override hook.
pub mod scan;

/// The port match expression language.
pub mod matcher;

/// Sharing modes and the lockfile/advisory-lock/ioctl protocol.
pub mod locking;

/// Open connections: worker threads, buffers, sync and async I/O.
pub mod connection;

/// Keeping a connection alive across unplug/replug events.
pub mod tracker;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;

/// The command line interface.
pub mod cli;

pub use connection::{Connection, ConnectionOptions, ControlSignals, DrainFuture, ReadFuture};
pub use error::Error;
pub use locking::SharingMode;
pub use matcher::Matcher;
pub use ports::PortAttributes;
pub use scan::{ScanProvider, Scanner};
pub use tracker::{ConnectedFuture, Tracker, TrackerOptions};
