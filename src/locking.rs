use std::fmt::Display;
use std::io::Write as _;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serialport::TTYPort;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Error;

/// How long `stomp` waits after signalling a lockfile holder before
/// taking the lock anyway.
const STOMP_GRACE: Duration = Duration::from_millis(100);

/// How many lockfile creation races to ride out before giving up.
const LOCKFILE_RETRIES: usize = 10;

/// Port access negotiation policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingMode {
    /// Don't perform any locking.
    Oblivious,
    /// Defer to other users: honor lockfiles, take only a shared
    /// advisory lock, never claim exclusive use.
    Polite,
    /// Require exclusive access; lock the port or fail.
    #[default]
    Exclusive,
    /// Try to kill other users, lock what can be locked, and open the
    /// port regardless. Use with care.
    Stomp,
}

impl Display for SharingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SharingMode::Oblivious => "oblivious",
            SharingMode::Polite => "polite",
            SharingMode::Exclusive => "exclusive",
            SharingMode::Stomp => "stomp",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SharingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oblivious" => Ok(SharingMode::Oblivious),
            "polite" => Ok(SharingMode::Polite),
            "exclusive" => Ok(SharingMode::Exclusive),
            "stomp" => Ok(SharingMode::Stomp),
            other => Err(Error::Configuration(format!("unknown sharing mode `{other}`"))),
        }
    }
}

/// The OS-level locking resources held for one open port.
///
/// Acquired in two steps around the driver open (lockfile before, handle
/// locks after), released exactly once in reverse order by
/// [`LockSet::release`]; release failures are logged but never stop the
/// remaining steps.
#[derive(Debug)]
pub(crate) struct LockSet {
    device: String,
    mode: SharingMode,
    lockfile: Option<PathBuf>,
    flocked: bool,
    exclusive: bool,
    released: bool,
}

impl LockSet {
    /// Run the lockfile half of the open-time protocol.
    ///
    /// In every mode but `oblivious`: PID-test a present lockfile, reap it
    /// if stale, refuse (or in `stomp`, signal the holder) if live, then
    /// claim it with our own PID. A missing lock directory disables the
    /// step.
    pub(crate) fn claim_lock_file(
        device: &str,
        lock_dir: &Path,
        mode: SharingMode,
    ) -> Result<Self, Error> {
        let mut set = Self {
            device: device.to_string(),
            mode,
            lockfile: None,
            flocked: false,
            exclusive: false,
            released: false,
        };

        if mode == SharingMode::Oblivious {
            return Ok(set);
        }
        if !lock_dir.is_dir() {
            debug!(%device, lock_dir = %lock_dir.display(), "no lock directory, skipping lockfile");
            return Ok(set);
        }

        let path = lock_dir.join(lock_file_name(device));
        for _ in 0..LOCKFILE_RETRIES {
            if try_claim(device, &path, mode)? {
                set.lockfile = Some(path);
                return Ok(set);
            }
        }

        Err(Error::SharingConflict {
            device: device.to_string(),
            reason: "lockfile contention retries exceeded".into(),
        })
    }

    /// Run the handle half of the open-time protocol on the freshly
    /// opened port: advisory lock, then exclusive-use ioctl, per mode.
    pub(crate) fn lock_handle(&mut self, port: &mut TTYPort) -> Result<(), Error> {
        let device = self.device.clone();
        let fd = port.as_raw_fd();
        let best_effort = self.mode == SharingMode::Stomp;

        let arg = match self.mode {
            SharingMode::Oblivious => None,
            SharingMode::Polite => {
                // Probe for an exclusive holder first, then settle on a
                // shared lock.
                match flock(fd, FlockArg::LockExclusiveNonblock) {
                    Ok(()) => {
                        let _ = flock(fd, FlockArg::UnlockNonblock);
                    }
                    Err(e) => self.flock_failed(e, false)?,
                }
                Some(FlockArg::LockSharedNonblock)
            }
            SharingMode::Exclusive | SharingMode::Stomp => Some(FlockArg::LockExclusiveNonblock),
        };

        if let Some(arg) = arg {
            match flock(fd, arg) {
                Ok(()) => {
                    debug!(%device, mode = %self.mode, "acquired advisory lock");
                    self.flocked = true;
                }
                Err(e) => self.flock_failed(e, best_effort)?,
            }
        }

        if matches!(self.mode, SharingMode::Exclusive | SharingMode::Stomp) {
            match port.set_exclusive(true) {
                Ok(()) => {
                    debug!(%device, "asserted exclusive use");
                    self.exclusive = true;
                }
                Err(e) if best_effort => {
                    warn!(%device, error = %e, "can't assert exclusive use");
                }
                Err(e) => {
                    return Err(Error::Locking {
                        device,
                        reason: format!("exclusive-use ioctl: {e}"),
                    });
                }
            }
        }

        Ok(())
    }

    fn flock_failed(&self, errno: Errno, best_effort: bool) -> Result<(), Error> {
        match errno {
            Errno::EWOULDBLOCK if best_effort => {
                warn!(device = %self.device, "port is advisory-locked elsewhere, proceeding anyway");
                Ok(())
            }
            Errno::EWOULDBLOCK => Err(Error::SharingConflict {
                device: self.device.clone(),
                reason: "advisory lock held elsewhere".into(),
            }),
            // Filesystems without advisory locks degrade to no lock.
            Errno::ENOTSUP | Errno::EINVAL | Errno::ENOLCK => {
                warn!(device = %self.device, %errno, "advisory locks unsupported here");
                Ok(())
            }
            errno if best_effort => {
                warn!(device = %self.device, %errno, "can't take advisory lock");
                Ok(())
            }
            errno => Err(Error::Locking {
                device: self.device.clone(),
                reason: format!("flock: {errno}"),
            }),
        }
    }

    /// Release everything held, in reverse order of acquisition. Safe to
    /// call more than once and without the port (when the driver open
    /// itself failed). Individual failures are logged and skipped.
    pub(crate) fn release(&mut self, port: Option<&mut TTYPort>) {
        if self.released {
            return;
        }
        self.released = true;
        let device = &self.device;

        if let Some(port) = port {
            if self.exclusive {
                match port.set_exclusive(false) {
                    Ok(()) => debug!(%device, "released exclusive use"),
                    Err(e) => warn!(%device, error = %e, "can't release exclusive use"),
                }
            }
            if self.flocked {
                match flock(port.as_raw_fd(), FlockArg::UnlockNonblock) {
                    Ok(()) => debug!(%device, "released advisory lock"),
                    Err(e) => warn!(%device, errno = %e, "can't release advisory lock"),
                }
            }
        }

        if let Some(path) = self.lockfile.take() {
            // Only reap a lockfile that still names us; a successor may
            // have replaced it already.
            if read_lock_pid(&path) == Some(std::process::id() as i32) {
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!(%device, path = %path.display(), "released lockfile"),
                    Err(e) => warn!(%device, error = %e, "can't remove lockfile"),
                }
            }
        }
    }
}

/// The UUCP-style lockfile name for a device: `/dev/ttyUSB0` becomes
/// `LCK..ttyUSB0`, and nested device paths like `/dev/pts/5` become
/// `LCK..pts.5`.
pub(crate) fn lock_file_name(device: &str) -> String {
    let tail = device.strip_prefix("/dev/").unwrap_or(device);
    let tail = tail.trim_start_matches('/').replace('/', ".");
    format!("LCK..{tail}")
}

/// One attempt at claiming the lockfile. `Ok(false)` means a creation
/// race was lost and the caller should retry.
fn try_claim(device: &str, path: &Path, mode: SharingMode) -> Result<bool, Error> {
    if let Some(owner) = lock_file_owner(path) {
        if owner == std::process::id() as i32 {
            debug!(%device, path = %path.display(), "lockfile already ours");
            return Ok(true);
        }

        if mode == SharingMode::Stomp {
            match kill(Pid::from_raw(owner), Signal::SIGTERM) {
                Ok(()) => {
                    debug!(%device, pid = owner, "terminated lockfile holder");
                    std::thread::sleep(STOMP_GRACE);
                }
                Err(e) => warn!(%device, pid = owner, errno = %e, "can't terminate lockfile holder"),
            }
        } else {
            debug!(%device, pid = owner, path = %path.display(), "lockfile is held");
            return Err(Error::SharingConflict {
                device: device.to_string(),
                reason: format!("{}: pid={owner}", path.display()),
            });
        }
    }

    let mut open = std::fs::OpenOptions::new();
    open.write(true);
    if mode == SharingMode::Stomp {
        open.create(true).truncate(true);
    } else {
        open.create_new(true);
    }

    match open.open(path).and_then(|mut f| {
        // Decimal PID, right-justified in ten characters, per the UUCP
        // convention cooperating tools expect.
        writeln!(f, "{:>10}", std::process::id())
    }) {
        Ok(()) => {
            debug!(%device, path = %path.display(), "claimed lockfile");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            warn!(%device, path = %path.display(), "lost lockfile creation race");
            Ok(false)
        }
        Err(e) if mode == SharingMode::Exclusive => Err(Error::Locking {
            device: device.to_string(),
            reason: format!("can't write {}: {e}", path.display()),
        }),
        Err(e) => {
            warn!(%device, path = %path.display(), error = %e, "can't write lockfile, proceeding");
            Ok(true)
        }
    }
}

/// The live owner of a lockfile, if any. Stale and malformed lockfiles
/// are reaped here as a side effect.
fn lock_file_owner(path: &Path) -> Option<i32> {
    let pid = match read_lock_pid(path) {
        None if !path.exists() => return None,
        None => {
            // Malformed content is treated as stale.
            reap(path, "malformed");
            return None;
        }
        Some(pid) => pid,
    };

    match kill(Pid::from_raw(pid), None) {
        // EPERM means the process exists but belongs to someone we can't
        // signal; it could still have created the lockfile, so honor it.
        Ok(()) | Err(Errno::EPERM) => Some(pid),
        Err(Errno::ESRCH) => {
            reap(path, "stale");
            None
        }
        Err(errno) => {
            warn!(path = %path.display(), pid, %errno, "can't probe lockfile owner");
            None
        }
    }
}

fn reap(path: &Path, why: &str) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed {why} lockfile"),
        Err(e) => warn!(path = %path.display(), error = %e, "can't remove {why} lockfile"),
    }
}

/// Parse a lockfile's PID, tolerating leading whitespace and a trailing
/// newline. `None` for unreadable or malformed content.
fn read_lock_pid(path: &Path) -> Option<i32> {
    let text = std::fs::read_to_string(path).ok()?;
    text.trim().parse().ok()
}
