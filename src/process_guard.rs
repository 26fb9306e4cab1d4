//! Process lifecycle management for rsync children
//!
//! # Problem Solved
//! An rsync interrupted half-way leaves a module tree partly mirrored and
//! partly deleted. A Ctrl+C must therefore not tear down the transfer in
//! flight; it only stops the run from starting new ones.
//!
//! # Solution
//! - Spawn every rsync in its own process group, so a terminal Ctrl+C reaches
//!   only this process, and with a parent-death signal, so it cannot outlive
//!   us if we are killed outright
//! - Track child PIDs in a global registry
//! - First SIGINT/SIGTERM/SIGHUP: flip the `CancelToken`; the orchestrator
//!   skips every transfer not yet started and still writes its report
//! - Second signal: SIGTERM the tracked process groups, SIGKILL after a grace
//!   period, exit with 128 + signal

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();
static CANCEL_TOKEN: OnceLock<CancelToken> = OnceLock::new();

/// Shared "do not start new work" flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token flipped by the process signal handlers
    pub fn global() -> Self {
        CANCEL_TOKEN.get_or_init(CancelToken::new).clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// PIDs of the rsync processes currently running.
///
/// Each PID is also the ID of that transfer's process group, which holds the
/// ssh transport rsync spawned.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    /// Set by the first `terminate_all`; the abort path runs once
    cleanup_initiated: bool,
}

impl ChildRegistry {
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!("Tracking rsync PID {}", pid);
    }

    /// Forget a transfer that exited on its own.
    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!("rsync PID {} exited", pid);
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Abort every tracked transfer.
    ///
    /// Each transfer's group gets SIGTERM so rsync can remove its partial
    /// temp files; groups still running after `grace_period` get SIGKILL.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            debug!("Transfers already being aborted");
            return;
        }
        self.cleanup_initiated = true;

        let transfers: Vec<u32> = self.pids.drain().collect();
        if transfers.is_empty() {
            debug!("No rsync transfer in flight");
            return;
        }

        info!("Aborting {} rsync transfer(s)", transfers.len());
        for &pid in &transfers {
            signal_transfer(pid, Signal::SIGTERM);
        }

        let deadline = Instant::now() + grace_period;
        while Instant::now() < deadline {
            if !transfers.iter().any(|&pid| is_process_alive(pid)) {
                info!("rsync stopped after SIGTERM");
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in transfers.iter().filter(|&&pid| is_process_alive(pid)) {
            warn!("rsync {} still running after {:?}, killing", pid, grace_period);
            signal_transfer(pid, Signal::SIGKILL);
        }
    }
}

/// Signal a transfer's whole group, or just rsync if the group is gone.
fn signal_transfer(pid: u32, sig: Signal) {
    // Negative PID addresses the process group
    if let Err(group_err) = signal::kill(Pid::from_raw(-(pid as i32)), sig) {
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
            warn!("Cannot send {} to rsync {}: {} (group: {})", sig.as_str(), pid, e, group_err);
        }
    }
}

/// True while `pid` exists and is not a zombie.
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Third field of /proc/<pid>/stat is the state
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| stat.split_whitespace().nth(2).map(|state| !matches!(state, "Z" | "X")))
        .unwrap_or(true)
}

/// Install SIGINT/SIGTERM/SIGHUP handling for a backup run.
///
/// The first signal cancels `token`; the second terminates tracked children
/// and exits. Call once at program start.
pub fn init_signal_handlers(token: CancelToken) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::spawn(move || {
        for sig in signals.forever() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };

            if !token.is_cancelled() {
                warn!(
                    "Received {}: finishing the current transfer, no new transfers will start \
                     (send again to abort immediately)",
                    signal_name
                );
                token.cancel();
                continue;
            }

            error!("Received {} again, aborting", signal_name);
            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(Duration::from_secs(3));
            }
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Run the command as leader of its own process group, terminated if
    /// this process dies
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}
