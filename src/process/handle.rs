use std::process::Child;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::process::signal::ExitInfo;
use crate::runtime::runtime_error::{RuntimeError, RuntimeResult};

/// `close` polls starting at the first interval and doubling up to the
/// second, so short commands are reaped quickly and long ones cost little.
const POLL_INITIAL: Duration = Duration::from_millis(1);
const POLL_MAX: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct HandleState {
    child: Option<Child>,
    exit: Option<ExitInfo>,
}

/// Owner of a spawned OS process.
///
/// Every path that observes completion (a blocking wait on the main thread,
/// a completion thread for background calls) goes through [`close`], which
/// records the exit and releases the child under a single lock. Whichever
/// path gets there first does the cleanup; later callers read the recorded
/// exit.
///
/// [`close`]: ProcessHandle::close
#[derive(Debug)]
pub struct ProcessHandle {
    program: String,
    state: Mutex<HandleState>,
    dispose_count: AtomicUsize,
}

impl ProcessHandle {
    pub fn new(program: impl Into<String>, child: Child) -> Self {
        ProcessHandle {
            program: program.into(),
            state: Mutex::new(HandleState {
                child: Some(child),
                exit: None,
            }),
            dispose_count: AtomicUsize::new(0),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Block until the process exits and return its exit info.
    ///
    /// The lock is released between polls so that `stop` can still reach
    /// the child while someone is waiting on it.
    pub fn close(&self) -> RuntimeResult<ExitInfo> {
        let mut interval = POLL_INITIAL;
        loop {
            {
                let mut state = self.state.lock();
                if let Some(exit) = state.exit {
                    return Ok(exit);
                }

                let child = state.child.as_mut().ok_or_else(|| {
                    RuntimeError::internal(format!(
                        "process handle for '{}' has neither a child nor an exit",
                        self.program
                    ))
                })?;

                if let Some(status) = child.try_wait()? {
                    let exit = ExitInfo::from_status(status);
                    state.exit = Some(exit);
                    state.child = None;
                    self.dispose_count.fetch_add(1, Ordering::SeqCst);
                    debug!(program = %self.program, code = ?exit.code, signal = ?exit.signal, "process closed");
                    return Ok(exit);
                }
            }

            thread::sleep(interval);
            interval = (interval * 2).min(POLL_MAX);
        }
    }

    /// Exit info if the process has already been closed.
    pub fn exit(&self) -> Option<ExitInfo> {
        self.state.lock().exit
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().exit.is_none()
    }

    /// Kill the process. Does nothing if it already exited.
    pub fn stop(&self) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        if let Some(child) = state.child.as_mut() {
            debug!(program = %self.program, "stopping process");
            match child.kill() {
                Ok(()) => {}
                // Already exited but not yet reaped.
                Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// How many times the child has been released. Never more than one.
    pub fn dispose_count(&self) -> usize {
        self.dispose_count.load(Ordering::SeqCst)
    }
}
