use std::process::ExitStatus;

use crate::runtime::runtime_error::{ErrorKind, RuntimeError};

/// Exit codes at or above this value conventionally mean "terminated by
/// signal `code - SIGNAL_EXIT_BASE`".
pub const SIGNAL_EXIT_BASE: i32 = 128;

pub fn signal_name(signal: i32) -> Option<&'static str> {
    let name = match signal {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        5 => "SIGTRAP",
        6 => "SIGABRT",
        7 => "SIGBUS",
        8 => "SIGFPE",
        9 => "SIGKILL",
        10 => "SIGUSR1",
        11 => "SIGSEGV",
        12 => "SIGUSR2",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        _ => return None,
    };
    Some(name)
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_code(code: i32) -> Self {
        ExitInfo {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        ExitInfo {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }

    /// Signal that ended the process, either reported directly by the OS
    /// or encoded in the exit code by a shell.
    pub fn terminating_signal(&self) -> Option<i32> {
        self.signal.or_else(|| {
            self.code
                .filter(|code| *code > SIGNAL_EXIT_BASE)
                .map(|code| code - SIGNAL_EXIT_BASE)
                .filter(|signal| signal_name(*signal).is_some())
        })
    }

    /// The error a failed exit raises, or `None` on success.
    pub fn to_error(&self, program: &str) -> Option<RuntimeError> {
        if self.success() {
            return None;
        }

        let kind = match self.terminating_signal() {
            Some(signal) => ErrorKind::Signal {
                program: program.to_string(),
                signal: signal_name(signal)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("signal {}", signal)),
            },
            None => ErrorKind::NonZeroExit {
                program: program.to_string(),
                code: self.code.unwrap_or(-1),
            },
        };
        Some(kind.into())
    }
}
