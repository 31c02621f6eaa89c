use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits, TTYPort};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    error::Error,
    locking::{LockSet, SharingMode},
    matcher::Matcher,
    scan::{ScanProvider, Scanner},
};

pub(crate) mod engine;

pub use engine::{DrainFuture, ReadFuture};
use engine::{Engine, Monitor, POLL_TIMEOUT};

/// How long to wait between open attempts while a busy port is being
/// retried under an open timeout.
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Optional parameters for a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// The baud rate to configure.
    pub baud: u32,
    /// Data bits per character.
    pub data_bits: DataBits,
    /// Parity checking mode.
    pub parity: Parity,
    /// Stop bits per character.
    pub stop_bits: StopBits,
    /// Flow control mode.
    pub flow_control: FlowControl,
    /// Port access negotiation policy.
    pub sharing: SharingMode,
    /// How long to keep retrying a busy port before giving up. `None`
    /// fails fast on the first conflict.
    pub open_timeout: Option<Duration>,
    /// Largest single read request made against the OS handle.
    pub read_chunk: usize,
    /// Largest single write handed to the OS handle.
    pub write_chunk: usize,
    /// Where UUCP lockfiles live. A missing directory disables them.
    pub lock_dir: PathBuf,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            baud: 115_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            sharing: SharingMode::default(),
            open_timeout: None,
            read_chunk: 1024,
            write_chunk: 256,
            lock_dir: PathBuf::from("/var/lock"),
        }
    }
}

impl ConnectionOptions {
    /// Default options at the given baud rate.
    pub fn new(baud: u32) -> Self {
        Self {
            baud,
            ..Default::default()
        }
    }

    /// Set the sharing mode.
    pub fn with_sharing(mut self, sharing: SharingMode) -> Self {
        self.sharing = sharing;
        self
    }

    /// Set the open timeout.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = Some(timeout);
        self
    }

    /// Set the lockfile directory.
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.baud == 0 {
            return Err(Error::Configuration("baud rate must be nonzero".into()));
        }
        Ok(())
    }
}

/// Incoming RS-232 control line state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSignals {
    /// Clear To Send.
    pub cts: bool,
    /// Data Set Ready.
    pub dsr: bool,
    /// Ring Indicator.
    pub ri: bool,
    /// Carrier Detect.
    pub cd: bool,
}

/// What `close` must tear down, in order: stop the engine, release the
/// locks, drop the handle.
struct Teardown {
    engine: Engine,
    port: TTYPort,
    locks: LockSet,
}

/// An open connection to a serial port.
///
/// Two worker threads pump the port behind unbounded buffers; callers
/// interact through non-blocking, blocking-with-timeout, and future
/// returning operations, all safe to use from multiple threads. The
/// first unrecoverable error becomes *the* terminal error: every pending
/// and later operation reports the same cause until the connection is
/// closed.
pub struct Connection {
    device: String,
    monitor: Arc<Monitor>,
    teardown: Mutex<Option<Teardown>>,
}

impl Connection {
    /// Enumerate ports, select the single one matching `expression`, and
    /// open it.
    ///
    /// Zero matches fail with [`Error::NoMatch`] and several with
    /// [`Error::AmbiguousMatch`]; use the `okserial` tool to preview what
    /// an expression selects.
    pub fn open_matching(expression: &str, opts: &ConnectionOptions) -> Result<Self, Error> {
        let matcher = Matcher::new(expression)?;
        Self::open_matched(&Scanner::from_env(), &matcher, opts)
    }

    /// Like [`Connection::open_matching`], with an explicit matcher and
    /// enumeration provider.
    pub fn open_matched(
        provider: &dyn ScanProvider,
        matcher: &Matcher,
        opts: &ConnectionOptions,
    ) -> Result<Self, Error> {
        let snapshot = provider.scan()?;
        let matched = matcher.filter(&snapshot);
        match matched.as_slice() {
            [] => Err(Error::NoMatch {
                expression: matcher.expression().to_string(),
            }),
            [port] => {
                debug!(device = %port.device(), expression = %matcher, "matched one port");
                Self::open_device(port.device(), opts)
            }
            many => Err(Error::AmbiguousMatch {
                expression: matcher.expression().to_string(),
                candidates: many.iter().map(|p| p.device().to_string()).collect(),
            }),
        }
    }

    /// Open an explicit device path, e.g. `/dev/ttyACM0`.
    pub fn open_device(device: &str, opts: &ConnectionOptions) -> Result<Self, Error> {
        opts.validate()?;
        let deadline = opts.open_timeout.map(|t| Instant::now() + t);
        loop {
            match Self::try_open(device, opts) {
                Err(error @ Error::SharingConflict { .. }) => match deadline {
                    Some(d) if Instant::now() < d => {
                        debug!(%device, "port is busy, retrying");
                        std::thread::sleep(OPEN_RETRY_DELAY);
                    }
                    _ => return Err(error),
                },
                other => return other,
            }
        }
    }

    /// One pass of the open sequence; each failure rolls back whatever
    /// was acquired before it.
    fn try_open(device: &str, opts: &ConnectionOptions) -> Result<Self, Error> {
        let mut locks = LockSet::claim_lock_file(device, &opts.lock_dir, opts.sharing)?;

        let mut port = match serialport::new(device, opts.baud)
            .data_bits(opts.data_bits)
            .parity(opts.parity)
            .stop_bits(opts.stop_bits)
            .flow_control(opts.flow_control)
            .timeout(POLL_TIMEOUT)
            .open_native()
        {
            Ok(port) => port,
            Err(e) => {
                locks.release(None);
                return Err(map_open_error(&e, device));
            }
        };

        // The driver layer asserts exclusive use at open; sharing modes
        // that promise not to hold it must let go before anything else.
        if matches!(opts.sharing, SharingMode::Oblivious | SharingMode::Polite) {
            if let Err(e) = port.set_exclusive(false) {
                warn!(%device, error = %e, "can't clear exclusive use");
            }
        }

        if let Err(error) = locks.lock_handle(&mut port) {
            locks.release(Some(&mut port));
            return Err(error);
        }

        let engine = match Engine::start(&port, device, opts.read_chunk, opts.write_chunk) {
            Ok(engine) => engine,
            Err(error) => {
                locks.release(Some(&mut port));
                return Err(error);
            }
        };

        info!(%device, baud = opts.baud, sharing = %opts.sharing, "opened serial port");
        Ok(Self {
            device: device.to_string(),
            monitor: engine.monitor(),
            teardown: Mutex::new(Some(Teardown {
                engine,
                port,
                locks,
            })),
        })
    }

    /// The opened device path.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Append `data` to the outgoing buffer, to be sent as fast as the
    /// port takes it. Never blocks and never accepts partially: the
    /// buffer grows without bound (use [`Connection::drain_sync`] or
    /// [`Connection::outgoing_size`] to manage it). Returns the number of
    /// bytes accepted.
    pub fn write(&self, data: &[u8]) -> Result<usize, Error> {
        self.monitor.write(data)
    }

    /// Wait up to `timeout` (forever for `None`) for received data, then
    /// return at least one and at most `max_bytes` bytes. A timeout with
    /// nothing buffered returns an empty vec, not an error.
    pub fn read_sync(
        &self,
        timeout: Option<Duration>,
        max_bytes: usize,
    ) -> Result<Vec<u8>, Error> {
        self.monitor.read_sync(timeout, max_bytes)
    }

    /// Return any already-buffered data immediately, up to `max_bytes`.
    pub fn read_nowait(&self, max_bytes: usize) -> Result<Vec<u8>, Error> {
        self.monitor.read_nowait(max_bytes)
    }

    /// Like [`Connection::read_sync`] without the timeout, as a future.
    /// Dropping the future cancels the wait with no other effect.
    pub fn read_async(&self, max_bytes: usize) -> ReadFuture {
        ReadFuture::new(&self.monitor, max_bytes)
    }

    /// Wait up to `timeout` (forever for `None`) until everything
    /// accepted by previous [`Connection::write`] calls has reached the
    /// OS handle. A timeout here *is* an error.
    pub fn drain_sync(&self, timeout: Option<Duration>) -> Result<(), Error> {
        self.monitor.drain_sync(timeout)
    }

    /// Like [`Connection::drain_sync`] without the timeout, as a future.
    pub fn drain_async(&self) -> DrainFuture {
        DrainFuture::new(&self.monitor)
    }

    /// Bytes received and not yet consumed by a read.
    pub fn incoming_size(&self) -> usize {
        self.monitor.incoming_size()
    }

    /// Bytes accepted and not yet handed to the OS.
    pub fn outgoing_size(&self) -> usize {
        self.monitor.outgoing_size()
    }

    /// The terminal error, if the connection has hit one.
    pub fn fault(&self) -> Option<Error> {
        self.monitor.fault()
    }

    /// Set outgoing control lines; `None` leaves a line unchanged.
    pub fn set_signals(
        &self,
        dtr: Option<bool>,
        rts: Option<bool>,
        send_break: Option<bool>,
    ) -> Result<(), Error> {
        self.with_port(|port| {
            if let Some(dtr) = dtr {
                port.write_data_terminal_ready(dtr)?;
            }
            if let Some(rts) = rts {
                port.write_request_to_send(rts)?;
            }
            match send_break {
                Some(true) => port.set_break()?,
                Some(false) => port.clear_break()?,
                None => {}
            }
            Ok(())
        })
    }

    /// Read the incoming control line state.
    pub fn get_signals(&self) -> Result<ControlSignals, Error> {
        self.with_port(|port| {
            Ok(ControlSignals {
                cts: port.read_clear_to_send()?,
                dsr: port.read_data_set_ready()?,
                ri: port.read_ring_indicator()?,
                cd: port.read_carrier_detect()?,
            })
        })
    }

    fn with_port<T>(
        &self,
        body: impl FnOnce(&mut TTYPort) -> serialport::Result<T>,
    ) -> Result<T, Error> {
        if let Some(fault) = self.monitor.fault() {
            return Err(fault);
        }
        let mut guard = self.teardown.lock().unwrap_or_else(|e| e.into_inner());
        let teardown = guard
            .as_mut()
            .ok_or_else(|| self.monitor.fault().unwrap_or_else(|| self.closed_error()))?;
        body(&mut teardown.port).map_err(|e| {
            let error = Error::Io {
                device: self.device.clone(),
                reason: format!("control signals: {e}"),
            };
            warn!(device = %self.device, error = %e, "control signal access failed");
            self.monitor.record_external_fault(error.clone());
            error
        })
    }

    /// Release the port and all associated locks.
    ///
    /// Idempotent; pending and subsequent operations fail with the
    /// terminal error (a synthetic closed error if nothing had failed
    /// before).
    pub fn close(&self) {
        self.shut_down_with(self.closed_error());
    }

    /// Terminate the connection from outside, unblocking every pending
    /// waiter. Equivalent to [`Connection::close`]; idempotent.
    pub fn interrupt(&self) {
        self.shut_down_with(self.closed_error());
    }

    fn closed_error(&self) -> Error {
        Error::Interrupted {
            device: self.device.clone(),
        }
    }

    fn shut_down_with(&self, cause: Error) {
        let mut guard = self.teardown.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut teardown) = guard.take() {
            teardown.engine.shut_down(cause);
            teardown.locks.release(Some(&mut teardown.port));
            teardown.engine.mark_closed();
            debug!(device = %self.device, "closed serial port");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("device", &self.device)
            .field("fault", &self.fault())
            .finish()
    }
}

fn map_open_error(e: &serialport::Error, device: &str) -> Error {
    let text = e.to_string();
    let lowered = text.to_lowercase();
    if lowered.contains("busy") || lowered.contains("denied") {
        Error::SharingConflict {
            device: device.to_string(),
            reason: text,
        }
    } else if e.kind() == serialport::ErrorKind::NoDevice {
        Error::Disconnected {
            device: device.to_string(),
        }
    } else {
        Error::Io {
            device: device.to_string(),
            reason: text,
        }
    }
}
