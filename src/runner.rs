//! rsync process execution.
//!
//! `RsyncRunner` is the only place that spawns the synchronization tool.
//! Every call:
//!
//! - passes the argument list directly to the program (no shell), so host
//!   names and paths from the configuration are never interpreted
//! - runs the child in its own process group and registers its PID with
//!   `ChildRegistry::global()`
//! - streams stdout to the console as it arrives, treating both `\n` and the
//!   `\r` used by `--info=progress2` as line ends
//! - captures stderr separately and returns it inside `TransferError` on a
//!   non-zero exit
//!
//! Calls block until the child exits; one transfer is in flight at a time.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, trace, warn};

use crate::command::Invocation;
use crate::error::TransferError;
use crate::process_guard::{ChildRegistry, CommandProcessGroup};

/// Executes one invocation to completion.
///
/// The orchestrator and host-config backupper depend on this trait rather
/// than on `RsyncRunner`, so runs can be driven by a fake in tests.
pub trait SyncRunner {
    fn execute(&self, invocation: &Invocation) -> Result<(), TransferError>;
}

/// Runs the real rsync binary named by `Invocation::program`.
#[derive(Debug, Clone)]
pub struct RsyncRunner {
    echo_output: bool,
}

impl Default for RsyncRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl RsyncRunner {
    /// Runner that echoes rsync progress to the terminal.
    pub fn new() -> Self {
        Self { echo_output: true }
    }

    /// Runner that only traces rsync output.
    pub fn quiet() -> Self {
        Self { echo_output: false }
    }
}

impl SyncRunner for RsyncRunner {
    fn execute(&self, invocation: &Invocation) -> Result<(), TransferError> {
        debug!("Executing: {}", invocation);

        let mut child = Command::new(&invocation.program)
            .args(invocation.to_cli_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group()
            .spawn()
            .map_err(|e| TransferError::launch_failed(e.to_string()))?;
        let pid = child.id();

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }

        // Drained on its own thread so a chatty stderr cannot block stdout
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                // rsync prints remote file names as raw bytes
                let mut captured = Vec::new();
                if let Err(e) = stderr.read_to_end(&mut captured) {
                    warn!("Failed to read rsync stderr: {}", e);
                }
                String::from_utf8_lossy(&captured).into_owned()
            })
        });

        let stream_result = match child.stdout.take() {
            Some(stdout) => self.stream_stdout(stdout),
            None => Ok(()),
        };

        // Always reap the child, even if reading stdout failed
        let status = child.wait();

        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(pid);
        }

        let captured = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        let status = status.map_err(|e| TransferError::launch_failed(e.to_string()))?;
        if let Err(e) = stream_result {
            debug!("Lost rsync stdout for {}: {}", invocation.source, e);
        }

        if status.success() {
            Ok(())
        } else {
            Err(TransferError::exited(status.code(), captured))
        }
    }
}

impl RsyncRunner {
    fn stream_stdout(&self, stdout: impl Read) -> io::Result<()> {
        let echo = self.echo_output;
        let mut console = io::stdout();
        let mut pending_progress = false;

        let result = for_each_segment(BufReader::new(stdout), |text, is_progress| {
            trace!(target: "rsync", "{}", text);
            if !echo {
                return;
            }
            let _ = if is_progress {
                write!(console, "\r{text}")
            } else {
                writeln!(console, "\r{text}")
            };
            let _ = console.flush();
            pending_progress = is_progress;
        });

        if echo && pending_progress {
            let _ = writeln!(console);
        }
        result
    }
}

/// Split a byte stream on `\n` and `\r`, calling `on_segment(text, ended_by_cr)`
/// for each non-empty segment as soon as its terminator arrives.
pub fn for_each_segment<R, F>(mut reader: R, mut on_segment: F) -> io::Result<()>
where
    R: BufRead,
    F: FnMut(&str, bool),
{
    let mut segment: Vec<u8> = Vec::new();
    loop {
        let chunk = reader.fill_buf()?;
        if chunk.is_empty() {
            break;
        }
        let consumed = chunk.len();
        for &byte in chunk {
            match byte {
                b'\n' | b'\r' => {
                    if !segment.is_empty() {
                        on_segment(&String::from_utf8_lossy(&segment), byte == b'\r');
                        segment.clear();
                    }
                }
                _ => segment.push(byte),
            }
        }
        reader.consume(consumed);
    }
    if !segment.is_empty() {
        on_segment(&String::from_utf8_lossy(&segment), false);
    }
    Ok(())
}
