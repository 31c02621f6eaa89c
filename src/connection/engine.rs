//! The per-connection I/O engine: two worker threads pumping the OS
//! handle, unbounded buffers, and a monitor coordinating blocking
//! callers, futures and cancellation.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io::{Read, Write};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use serialport::{SerialPort, TTYPort};
use tracing::{debug, trace, warn};

use crate::error::Error;

/// How long the workers block in one OS call before re-checking the
/// engine status. Bounds how long `close` waits to join them.
pub(crate) const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Engine lifecycle. Transitions are monotonic:
/// `Running` → `Closing` → `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Status {
    Running,
    Closing,
    Closed,
}

/// Everything the monitor mutex protects.
struct State {
    status: Status,
    /// Bytes received from the OS handle, awaiting a read operation.
    incoming: VecDeque<u8>,
    /// Bytes accepted by `write`, awaiting the writer thread.
    outgoing: VecDeque<u8>,
    /// The writer holds an in-flight chunk; drain is not complete.
    writing: bool,
    /// The first unrecoverable error, replayed to every operation.
    fault: Option<Error>,
    /// Wakers of pending futures, keyed by waiter identity.
    wakers: HashMap<u64, Waker>,
    next_waiter: u64,
}

/// The monitor: one mutex and one condition variable coordinating the
/// workers, blocking callers and futures. All caller-facing operations
/// live here so they keep working (and failing consistently) while the
/// engine is being torn down.
pub(crate) struct Monitor {
    device: String,
    state: Mutex<State>,
    cond: Condvar,
}

impl Monitor {
    fn new(device: &str) -> Arc<Self> {
        Arc::new(Self {
            device: device.to_string(),
            state: Mutex::new(State {
                status: Status::Running,
                incoming: VecDeque::new(),
                outgoing: VecDeque::new(),
                writing: false,
                fault: None,
                wakers: HashMap::new(),
                next_waiter: 0,
            }),
            cond: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wake every waiter: blocking callers via the condition variable,
    /// futures by firing their registered wakers (each re-polls and
    /// re-registers if its predicate still isn't satisfied).
    fn wake_all(&self, state: &mut State) {
        self.cond.notify_all();
        for (_, waker) in state.wakers.drain() {
            waker.wake();
        }
    }

    /// Record a terminal error once and leave `Running`.
    fn record_fault(&self, state: &mut State, error: Error) {
        if state.fault.is_none() {
            state.fault = Some(error);
        }
        if state.status == Status::Running {
            state.status = Status::Closing;
        }
        self.wake_all(state);
    }

    /// Append to the outgoing buffer. Never blocks; fails only with the
    /// terminal error once the engine has left `Running`.
    pub(crate) fn write(&self, data: &[u8]) -> Result<usize, Error> {
        let mut state = self.lock();
        if let Some(fault) = &state.fault {
            return Err(fault.clone());
        }
        if !data.is_empty() {
            state.outgoing.extend(data);
            self.wake_all(&mut state);
        }
        Ok(data.len())
    }

    /// Block until at least one byte is buffered, then take up to
    /// `max_bytes`. Timeout with nothing buffered returns empty; engine
    /// termination with nothing buffered returns the terminal error.
    pub(crate) fn read_sync(
        &self,
        timeout: Option<Duration>,
        max_bytes: usize,
    ) -> Result<Vec<u8>, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            if !state.incoming.is_empty() {
                return Ok(take_incoming(&mut state, max_bytes));
            }
            if let Some(fault) = &state.fault {
                return Err(fault.clone());
            }
            state = match wait_deadline(&self.cond, state, deadline) {
                Some(state) => state,
                None => return Ok(Vec::new()),
            };
        }
    }

    /// Whatever is buffered right now, up to `max_bytes`; empty is not an
    /// error unless the engine has terminated.
    pub(crate) fn read_nowait(&self, max_bytes: usize) -> Result<Vec<u8>, Error> {
        let mut state = self.lock();
        if !state.incoming.is_empty() {
            Ok(take_incoming(&mut state, max_bytes))
        } else if let Some(fault) = &state.fault {
            Err(fault.clone())
        } else {
            Ok(Vec::new())
        }
    }

    /// Block until every byte accepted before this call has left for the
    /// OS handle and the handle reports no pending output.
    pub(crate) fn drain_sync(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            if let Some(fault) = &state.fault {
                return Err(fault.clone());
            }
            if state.outgoing.is_empty() && !state.writing {
                return Ok(());
            }
            state = match wait_deadline(&self.cond, state, deadline) {
                Some(state) => state,
                None => return Err(Error::Timeout(format!("drain of {}", self.device))),
            };
        }
    }

    fn new_waiter(&self) -> u64 {
        let mut state = self.lock();
        let id = state.next_waiter;
        state.next_waiter += 1;
        id
    }

    pub(crate) fn incoming_size(&self) -> usize {
        self.lock().incoming.len()
    }

    pub(crate) fn outgoing_size(&self) -> usize {
        self.lock().outgoing.len()
    }

    /// The terminal error, if one has been recorded.
    pub(crate) fn fault(&self) -> Option<Error> {
        self.lock().fault.clone()
    }

    /// Record a fault observed outside the workers (e.g. a control-signal
    /// failure on the caller's handle).
    pub(crate) fn record_external_fault(&self, error: Error) {
        let mut state = self.lock();
        self.record_fault(&mut state, error);
    }
}

/// The engine owning the worker threads for one open port.
pub(crate) struct Engine {
    monitor: Arc<Monitor>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Engine {
    /// Clone the port for each worker and start the pumps.
    ///
    /// The original handle stays with the caller for control signals and
    /// lock release; the workers never touch anything but their clones.
    pub(crate) fn start(
        port: &TTYPort,
        device: &str,
        read_chunk: usize,
        write_chunk: usize,
    ) -> Result<Self, Error> {
        let monitor = Monitor::new(device);

        let mut reader_port = clone_port(port, device)?;
        let mut writer_port = clone_port(port, device)?;
        reader_port
            .set_timeout(POLL_TIMEOUT)
            .map_err(|e| io_error(device, &e.to_string()))?;
        writer_port
            .set_timeout(POLL_TIMEOUT)
            .map_err(|e| io_error(device, &e.to_string()))?;

        let reader = spawn_worker(format!("{device} reader"), device, {
            let monitor = Arc::clone(&monitor);
            let device = device.to_string();
            move || read_loop(reader_port, monitor, read_chunk, device)
        })?;
        let writer = match spawn_worker(format!("{device} writer"), device, {
            let monitor = Arc::clone(&monitor);
            let device = device.to_string();
            move || write_loop(writer_port, monitor, write_chunk, device)
        }) {
            Ok(writer) => writer,
            Err(error) => {
                // Don't leave the reader pumping a half-built engine.
                let mut partial = Self {
                    monitor,
                    reader: Some(reader),
                    writer: None,
                };
                partial.shut_down(error.clone());
                return Err(error);
            }
        };

        Ok(Self {
            monitor,
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    pub(crate) fn monitor(&self) -> Arc<Monitor> {
        Arc::clone(&self.monitor)
    }

    /// Set the terminal error (first cause wins), leave `Running`, wake
    /// everyone, and join both workers. Idempotent.
    pub(crate) fn shut_down(&mut self, cause: Error) {
        {
            let mut state = self.monitor.lock();
            if state.status == Status::Closed {
                return;
            }
            self.monitor.record_fault(&mut state, cause);
        }

        debug!(device = %self.monitor.device, "joining worker threads");
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }

    /// Final transition, entered once the lock set has been released.
    pub(crate) fn mark_closed(&self) {
        let mut state = self.monitor.lock();
        state.status = Status::Closed;
        self.monitor.wake_all(&mut state);
    }
}

fn clone_port(port: &TTYPort, device: &str) -> Result<TTYPort, Error> {
    port.try_clone_native()
        .map_err(|e| io_error(device, &format!("can't clone handle: {e}")))
}

fn spawn_worker(
    name: String,
    device: &str,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, Error> {
    std::thread::Builder::new()
        .name(name)
        .spawn(body)
        .map_err(|e| io_error(device, &format!("can't spawn worker: {e}")))
}

fn io_error(device: &str, reason: &str) -> Error {
    Error::Io {
        device: device.to_string(),
        reason: reason.to_string(),
    }
}

fn take_incoming(state: &mut State, max_bytes: usize) -> Vec<u8> {
    let n = state.incoming.len().min(max_bytes.max(1));
    state.incoming.drain(..n).collect()
}

/// Condvar wait against an optional deadline. `None` when the deadline
/// has passed.
fn wait_deadline<'a>(
    cond: &Condvar,
    state: MutexGuard<'a, State>,
    deadline: Option<Instant>,
) -> Option<MutexGuard<'a, State>> {
    match deadline {
        None => Some(cond.wait(state).unwrap_or_else(|e| e.into_inner())),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (state, _) = cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            Some(state)
        }
    }
}

/// Reader worker: pull bounded chunks from the OS handle into the
/// incoming buffer until the engine stops or the handle dies.
fn read_loop(mut port: TTYPort, monitor: Arc<Monitor>, chunk: usize, device: String) {
    debug!(%device, "reader thread running");
    let mut buf = vec![0u8; chunk.max(1)];

    loop {
        if monitor.lock().status != Status::Running {
            break;
        }

        match port.read(&mut buf) {
            Ok(0) => {
                debug!(%device, "end of stream");
                let mut state = monitor.lock();
                monitor.record_fault(&mut state, Error::Disconnected { device: device.clone() });
                break;
            }
            Ok(n) => {
                let mut state = monitor.lock();
                if state.fault.is_some() {
                    break;
                }
                state.incoming.extend(&buf[..n]);
                trace!(%device, bytes = n, buffered = state.incoming.len(), "received");
                monitor.wake_all(&mut state);
            }
            Err(e) if retryable(&e) => continue,
            Err(e) => {
                warn!(%device, error = %e, "read failed");
                let error = map_os_error(&e, &device);
                let mut state = monitor.lock();
                monitor.record_fault(&mut state, error);
                break;
            }
        }
    }
    debug!(%device, "reader thread exiting");
}

/// Writer worker: wait for outgoing bytes, emit them in bounded chunks,
/// flush when a chunk is out so drain means "on the wire".
fn write_loop(mut port: TTYPort, monitor: Arc<Monitor>, chunk: usize, device: String) {
    debug!(%device, "writer thread running");

    loop {
        let pending: Vec<u8> = {
            let mut state = monitor.lock();
            loop {
                if state.status != Status::Running || state.fault.is_some() {
                    debug!(%device, "writer thread exiting");
                    return;
                }
                if !state.outgoing.is_empty() {
                    break;
                }
                state = monitor.cond.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            let n = state.outgoing.len().min(chunk.max(1));
            state.writing = true;
            state.outgoing.iter().take(n).copied().collect()
        };

        // The monitor is never held across the OS calls.
        match port.write(&pending) {
            Ok(n) => {
                let flushed = port.flush();
                let mut state = monitor.lock();
                // Consume exactly what the handle accepted; a partial
                // write leaves the tail at the head of the buffer.
                let drain_to = n.min(state.outgoing.len());
                state.outgoing.drain(..drain_to);
                state.writing = false;
                trace!(%device, wrote = n, pending = state.outgoing.len(), "sent");
                if let Err(e) = flushed {
                    warn!(%device, error = %e, "flush failed");
                    let error = map_os_error(&e, &device);
                    monitor.record_fault(&mut state, error);
                    return;
                }
                monitor.wake_all(&mut state);
            }
            Err(e) if retryable(&e) => {
                let mut state = monitor.lock();
                state.writing = false;
            }
            Err(e) => {
                warn!(%device, error = %e, "write failed");
                let error = map_os_error(&e, &device);
                let mut state = monitor.lock();
                state.writing = false;
                monitor.record_fault(&mut state, error);
                return;
            }
        }
    }
}

fn retryable(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

/// A gone-away device shows up as one of a few errnos depending on the
/// driver; everything else is an ordinary I/O fault.
fn map_os_error(e: &std::io::Error, device: &str) -> Error {
    match e.raw_os_error().map(Errno::from_i32) {
        Some(Errno::EIO | Errno::ENXIO | Errno::ENODEV) => Error::Disconnected {
            device: device.to_string(),
        },
        _ => io_error(device, &e.to_string()),
    }
}

/// Future returned by `read_async`: resolves with up to `max_bytes`
/// buffered bytes, or the terminal error. Dropping it deregisters the
/// waiter with no other effect; it holds the monitor, never the engine.
pub struct ReadFuture {
    monitor: Arc<Monitor>,
    waiter: u64,
    max_bytes: usize,
}

impl ReadFuture {
    pub(crate) fn new(monitor: &Arc<Monitor>, max_bytes: usize) -> Self {
        Self {
            waiter: monitor.new_waiter(),
            monitor: Arc::clone(monitor),
            max_bytes,
        }
    }
}

impl Future for ReadFuture {
    type Output = Result<Vec<u8>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.monitor.lock();
        if !state.incoming.is_empty() {
            let out = take_incoming(&mut state, self.max_bytes);
            state.wakers.remove(&self.waiter);
            return Poll::Ready(Ok(out));
        }
        if let Some(fault) = &state.fault {
            let fault = fault.clone();
            state.wakers.remove(&self.waiter);
            return Poll::Ready(Err(fault));
        }
        state.wakers.insert(self.waiter, cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for ReadFuture {
    fn drop(&mut self) {
        self.monitor.lock().wakers.remove(&self.waiter);
    }
}

/// Future returned by `drain_async`: resolves when the write buffer has
/// drained to the OS handle, or with the terminal error.
pub struct DrainFuture {
    monitor: Arc<Monitor>,
    waiter: u64,
}

impl DrainFuture {
    pub(crate) fn new(monitor: &Arc<Monitor>) -> Self {
        Self {
            waiter: monitor.new_waiter(),
            monitor: Arc::clone(monitor),
        }
    }
}

impl Future for DrainFuture {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.monitor.lock();
        if let Some(fault) = &state.fault {
            let fault = fault.clone();
            state.wakers.remove(&self.waiter);
            return Poll::Ready(Err(fault));
        }
        if state.outgoing.is_empty() && !state.writing {
            state.wakers.remove(&self.waiter);
            return Poll::Ready(Ok(()));
        }
        state.wakers.insert(self.waiter, cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for DrainFuture {
    fn drop(&mut self) {
        self.monitor.lock().wakers.remove(&self.waiter);
    }
}
