use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionOptions},
    error::Error,
    matcher::Matcher,
    scan::{ScanProvider, Scanner},
};

/// Optional parameters for a [`Tracker`].
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// How often to re-scan while healthy.
    pub poll_interval: Duration,
    /// Upper bound for the backed-off interval after repeated failures.
    pub max_poll_interval: Duration,
    /// How to open the connection once a port matches.
    pub connection: ConnectionOptions,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_poll_interval: Duration::from_secs(5),
            connection: ConnectionOptions::default(),
        }
    }
}

struct TrackerState {
    current: Option<Arc<Connection>>,
    /// Bumped on every successful open, so clients can tell a reconnect
    /// from the connection they already had.
    generation: u64,
    last_device: Option<String>,
    fatal: Option<Error>,
    stopping: bool,
    wakers: HashMap<u64, Waker>,
    next_waiter: u64,
}

struct Shared {
    state: Mutex<TrackerState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wake_all(&self, state: &mut TrackerState) {
        self.cond.notify_all();
        for (_, waker) in state.wakers.drain() {
            waker.wake();
        }
    }
}

/// Keeps a logical connection to a matching port alive across physical
/// unplug/replug events.
///
/// A control-loop thread periodically enumerates, opens the single
/// matching port when there is no live connection, and discards a
/// connection once it records a terminal error. Consecutive failures back
/// the poll interval off exponentially up to a cap; any success resets
/// it. Clients obtain the live connection with
/// [`Tracker::wait_connected`] or [`Tracker::connected`], using the
/// generation counter to detect reconnects.
pub struct Tracker {
    matcher: Matcher,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Tracker {
    /// Track the single port matching `expression`, with default options.
    pub fn new(expression: &str) -> Result<Self, Error> {
        Self::with_options(expression, TrackerOptions::default())
    }

    /// Track with explicit options.
    pub fn with_options(expression: &str, opts: TrackerOptions) -> Result<Self, Error> {
        let matcher = Matcher::new(expression)?;
        Ok(Self::with_provider(
            matcher,
            opts,
            Arc::new(Scanner::from_env()),
        ))
    }

    /// Track against an injected enumeration provider. This is how tests
    /// simulate ports coming and going.
    pub fn with_provider(
        matcher: Matcher,
        opts: TrackerOptions,
        provider: Arc<dyn ScanProvider>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(TrackerState {
                current: None,
                generation: 0,
                last_device: None,
                fatal: None,
                stopping: false,
                wakers: HashMap::new(),
                next_waiter: 0,
            }),
            cond: Condvar::new(),
        });

        debug!(expression = %matcher, "tracking serial ports");
        let thread = {
            let shared = Arc::clone(&shared);
            let matcher = matcher.clone();
            std::thread::Builder::new()
                .name(format!("tracker {matcher}"))
                .spawn(move || control_loop(shared, matcher, opts, provider))
                .expect("spawning the tracker control loop")
        };

        Self {
            matcher,
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// The matcher this tracker selects ports with.
    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// The current generation: how many successful opens have happened.
    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    /// The live connection, if there is one right now.
    pub fn current(&self) -> Option<Arc<Connection>> {
        self.shared.lock().current.clone()
    }

    /// The device of the most recent connection, live or not.
    pub fn last_device(&self) -> Option<String> {
        self.shared.lock().last_device.clone()
    }

    /// Block up to `timeout` (forever for `None`) until a live connection
    /// with generation ≥ `min_generation` exists, and return it.
    ///
    /// Pass `1` for "any connection", or `generation() + 1` to insist on
    /// a reconnect. Fatal tracker errors (a bad expression or
    /// configuration) surface here instead of a connection.
    pub fn wait_connected(
        &self,
        min_generation: u64,
        timeout: Option<Duration>,
    ) -> Result<Arc<Connection>, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.lock();
        loop {
            if state.generation >= min_generation {
                if let Some(conn) = &state.current {
                    return Ok(Arc::clone(conn));
                }
            }
            if let Some(fatal) = &state.fatal {
                return Err(fatal.clone());
            }

            let wait = match deadline {
                None => None,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::Timeout(format!(
                            "connection matching `{}`",
                            self.matcher
                        )));
                    }
                    Some(d - now)
                }
            };
            state = match wait {
                None => self
                    .shared
                    .cond
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner()),
                Some(t) => {
                    self.shared
                        .cond
                        .wait_timeout(state, t)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// Like [`Tracker::wait_connected`] without the timeout, as a future.
    /// Dropping the future detaches it with no other effect.
    pub fn connected(&self, min_generation: u64) -> ConnectedFuture {
        let waiter = {
            let mut state = self.shared.lock();
            let id = state.next_waiter;
            state.next_waiter += 1;
            id
        };
        ConnectedFuture {
            shared: Arc::clone(&self.shared),
            waiter,
            min_generation,
        }
    }

    /// Stop the control loop and close any current connection. Pending
    /// waiters without a live connection to return are failed.
    pub fn close(&self) {
        {
            let mut state = self.shared.lock();
            state.stopping = true;
            if state.fatal.is_none() {
                state.fatal = Some(Error::Interrupted {
                    device: format!("tracker `{}`", self.matcher),
                });
            }
            self.shared.wake_all(&mut state);
        }
        if let Some(thread) = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = thread.join();
        }
        let current = self.shared.lock().current.take();
        if let Some(conn) = current {
            conn.close();
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.close();
    }
}

fn control_loop(
    shared: Arc<Shared>,
    matcher: Matcher,
    opts: TrackerOptions,
    provider: Arc<dyn ScanProvider>,
) {
    let mut interval = opts.poll_interval;

    loop {
        {
            let state = shared.lock();
            if state.stopping {
                break;
            }
        }

        // A connection that has recorded a terminal error is gone;
        // release it and go back to scanning.
        let dead = {
            let mut state = shared.lock();
            let failure = state
                .current
                .as_ref()
                .and_then(|conn| conn.fault().map(|e| (conn.device().to_string(), e)));
            match failure {
                Some((device, error)) => {
                    warn!(%device, %error, "tracked connection failed");
                    state.current.take()
                }
                None => None,
            }
        };
        if let Some(dead) = dead {
            dead.close();
        }
        let have_current = shared.lock().current.is_some();

        if !have_current {
            match attempt_open(&matcher, &opts.connection, provider.as_ref()) {
                Ok(Some(conn)) => {
                    info!(device = conn.device(), "tracker connected");
                    let mut state = shared.lock();
                    state.last_device = Some(conn.device().to_string());
                    state.current = Some(Arc::new(conn));
                    state.generation += 1;
                    shared.wake_all(&mut state);
                    interval = opts.poll_interval;
                }
                Ok(None) => {
                    // Nothing (or too much) matched; keep scanning at the
                    // base cadence.
                    interval = opts.poll_interval;
                }
                Err(error) if error.is_fatal() => {
                    warn!(%error, "tracker cannot proceed");
                    let mut state = shared.lock();
                    state.fatal = Some(error);
                    shared.wake_all(&mut state);
                    break;
                }
                Err(error) => {
                    debug!(%error, "tracker open failed, backing off");
                    interval = (interval * 2).min(opts.max_poll_interval);
                }
            }
        }

        let state = shared.lock();
        if state.stopping {
            break;
        }
        let _unused = shared
            .cond
            .wait_timeout(state, interval)
            .unwrap_or_else(|e| e.into_inner());
    }

    debug!(expression = %matcher, "tracker control loop exiting");
}

/// One poll: scan, and open iff exactly one port matches. `Ok(None)`
/// means "nothing to do yet" (zero or several matches).
fn attempt_open(
    matcher: &Matcher,
    opts: &ConnectionOptions,
    provider: &dyn ScanProvider,
) -> Result<Option<Connection>, Error> {
    let snapshot = provider.scan()?;
    let matched = matcher.filter(&snapshot);
    match matched.as_slice() {
        [port] => Connection::open_device(port.device(), opts).map(Some),
        other => {
            debug!(matched = other.len(), expression = %matcher, "not exactly one match");
            Ok(None)
        }
    }
}

/// Future returned by [`Tracker::connected`]: resolves with the live
/// connection once one exists at or past the requested generation, or
/// with the tracker's fatal error.
pub struct ConnectedFuture {
    shared: Arc<Shared>,
    waiter: u64,
    min_generation: u64,
}

impl Future for ConnectedFuture {
    type Output = Result<Arc<Connection>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.lock();
        if state.generation >= self.min_generation {
            if let Some(conn) = &state.current {
                let conn = Arc::clone(conn);
                state.wakers.remove(&self.waiter);
                return Poll::Ready(Ok(conn));
            }
        }
        if let Some(fatal) = &state.fatal {
            let fatal = fatal.clone();
            state.wakers.remove(&self.waiter);
            return Poll::Ready(Err(fatal));
        }
        state.wakers.insert(self.waiter, cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for ConnectedFuture {
    fn drop(&mut self) {
        self.shared.lock().wakers.remove(&self.waiter);
    }
}
