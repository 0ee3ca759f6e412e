use std::sync::Arc;
use std::sync::mpsc::Receiver;

use parking_lot::Mutex;
use tracing::trace;

use crate::process::handle::ProcessHandle;
use crate::process::signal::ExitInfo;
use crate::process::{OutputMode, ProgramCall, Spawned, spawn};
use crate::runtime::runtime_error::{RuntimeError, RuntimeResult};

#[derive(Debug)]
enum Source {
    /// Not spawned yet; starts on first pull.
    Pending { call: ProgramCall, mode: OutputMode },
    Running(Arc<ProcessHandle>),
    Finished {
        handle: Option<Arc<ProcessHandle>>,
        exit: Option<ExitInfo>,
    },
}

#[derive(Debug)]
struct StreamState {
    lines: Vec<String>,
    source: Source,
}

/// Output of an external process, read lazily line by line.
///
/// Lines already read are kept, so the stream can be indexed and iterated
/// more than once. When `raise_on_exit` is set, reaching the end of a
/// process that exited unsuccessfully raises the exit error once.
///
/// Readers take `output` for as long as they block on the process. `state`
/// is only held briefly, so `stop` gets through while a read is pending.
#[derive(Debug)]
pub struct ProcessStream {
    program: String,
    raise_on_exit: bool,
    output: Mutex<Option<Receiver<String>>>,
    state: Mutex<StreamState>,
}

impl ProcessStream {
    pub(crate) fn started(program: String, spawned: Spawned, raise_on_exit: bool) -> Self {
        ProcessStream {
            program,
            raise_on_exit,
            output: Mutex::new(spawned.output),
            state: Mutex::new(StreamState {
                lines: Vec::new(),
                source: Source::Running(spawned.handle),
            }),
        }
    }

    pub(crate) fn deferred(call: ProgramCall, mode: OutputMode, raise_on_exit: bool) -> Self {
        ProcessStream {
            program: call.program.clone(),
            raise_on_exit,
            output: Mutex::new(None),
            state: Mutex::new(StreamState {
                lines: Vec::new(),
                source: Source::Pending { call, mode },
            }),
        }
    }

    /// A stream over fixed lines with no process behind it.
    pub fn from_lines(program: impl Into<String>, lines: Vec<String>) -> Self {
        ProcessStream {
            program: program.into(),
            raise_on_exit: false,
            output: Mutex::new(None),
            state: Mutex::new(StreamState {
                lines,
                source: Source::Finished {
                    handle: None,
                    exit: Some(ExitInfo::from_code(0)),
                },
            }),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Line at `index`, reading from the process until it is available.
    /// `Ok(None)` once the output is exhausted.
    pub fn pull(&self, index: usize) -> RuntimeResult<Option<String>> {
        loop {
            if let Some(line) = self.state.lock().lines.get(index) {
                return Ok(Some(line.clone()));
            }
            if !self.advance()? {
                return Ok(self.state.lock().lines.get(index).cloned());
            }
        }
    }

    /// Read the whole output.
    pub fn lines(&self) -> RuntimeResult<Vec<String>> {
        while self.advance()? {}
        Ok(self.state.lock().lines.clone())
    }

    /// Read the whole output and wait for the process, without raising on a
    /// failed exit.
    pub fn wait(&self) -> RuntimeResult<ExitInfo> {
        loop {
            match self.advance() {
                Ok(true) => {}
                Ok(false) => break,
                // The exit error; the exit itself is recorded below.
                Err(_) if self.is_finished() => break,
                Err(err) => return Err(err),
            }
        }

        match &self.state.lock().source {
            Source::Finished {
                exit: Some(exit), ..
            } => Ok(*exit),
            _ => Err(RuntimeError::internal(format!(
                "process '{}' finished without an exit status",
                self.program
            ))),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.wait().is_ok_and(|exit| exit.success())
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state.lock().source, Source::Finished { .. })
    }

    /// Kill the process, or cancel it if it has not started yet.
    pub fn stop(&self) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        match &state.source {
            Source::Pending { .. } => {
                state.source = Source::Finished {
                    handle: None,
                    exit: None,
                };
                Ok(())
            }
            Source::Running(handle)
            | Source::Finished {
                handle: Some(handle),
                ..
            } => handle.stop(),
            Source::Finished { handle: None, .. } => Ok(()),
        }
    }

    /// Read one more line into the buffer. Returns false when there is
    /// nothing left to read.
    fn advance(&self) -> RuntimeResult<bool> {
        let mut output = self.output.lock();

        let handle = {
            let mut state = self.state.lock();
            match &state.source {
                Source::Pending { call, mode } => {
                    let spawned = spawn(call, *mode)?;
                    trace!(program = %self.program, "deferred process started");
                    *output = spawned.output;
                    state.source = Source::Running(Arc::clone(&spawned.handle));
                    spawned.handle
                }
                Source::Running(handle) => Arc::clone(handle),
                Source::Finished { .. } => return Ok(false),
            }
        };

        if let Some(line) = output.as_ref().and_then(|output| output.recv().ok()) {
            self.state.lock().lines.push(line);
            return Ok(true);
        }
        *output = None;

        let exit = handle.close()?;
        {
            let mut state = self.state.lock();
            trace!(program = %self.program, lines = state.lines.len(), "process stream exhausted");
            state.source = Source::Finished {
                handle: Some(handle),
                exit: Some(exit),
            };
        }

        if self.raise_on_exit {
            if let Some(err) = exit.to_error(&self.program) {
                return Err(err);
            }
        }
        Ok(false)
    }
}

impl std::fmt::Display for ProcessStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        match state.source {
            Source::Finished { .. } => write!(f, "{}", state.lines.join("\n")),
            _ => write!(f, "<process {}>", self.program),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::process::{CallFlags, run};
    use crate::lang::value::Value;
    use crate::runtime::runtime_error::ErrorKind;

    fn lazy(script: &str) -> Arc<ProcessStream> {
        let call = ProgramCall::new("sh").arg("-c").arg(script);
        let flags = CallFlags::AUTO_START.with(CallFlags::DISABLE_BUFFERING, true);
        match run(call, flags, false).unwrap() {
            Value::ProcessStream(stream) => stream,
            other => panic!("expected a stream, got {:?}", other),
        }
    }

    #[test]
    fn test_pull_reads_on_demand() {
        let stream = lazy("echo first; echo second");
        assert_eq!(stream.pull(0).unwrap().as_deref(), Some("first"));
        assert_eq!(stream.pull(1).unwrap().as_deref(), Some("second"));
        assert_eq!(stream.pull(2).unwrap(), None);
        assert!(stream.is_finished());
        assert_eq!(stream.to_string(), "first\nsecond");
    }

    #[test]
    fn test_unbuffered_failure_raises_at_end() {
        let stream = lazy("echo partial; exit 2");
        assert_eq!(stream.pull(0).unwrap().as_deref(), Some("partial"));

        let err = stream.pull(1).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::NonZeroExit { code: 2, .. }));

        // The error is raised once; afterwards the buffered lines remain.
        assert_eq!(stream.lines().unwrap(), vec!["partial"]);
        assert!(!stream.succeeded());
    }

    #[test]
    fn test_deferred_stream_starts_on_first_pull() {
        let call = ProgramCall::new("sh").arg("-c").arg("echo late");
        let value = run(call, CallFlags::empty(), false).unwrap();
        let Value::ProcessStream(stream) = value else {
            panic!("expected a stream");
        };
        assert!(!stream.is_finished());
        assert_eq!(stream.to_string(), "<process sh>");
        assert_eq!(stream.lines().unwrap(), vec!["late"]);
    }

    #[test]
    fn test_stop_running_process() {
        let stream = lazy("exec sleep 5");
        stream.stop().unwrap();
        let exit = stream.wait().unwrap();
        assert_eq!(exit.signal, Some(9));
    }

    #[test]
    fn test_stop_while_another_thread_is_pulling() {
        let stream = lazy("exec sleep 5");
        let started = Instant::now();
        let reader = {
            let stream = Arc::clone(&stream);
            thread::spawn(move || stream.pull(0))
        };
        thread::sleep(Duration::from_millis(100));

        stream.stop().unwrap();
        let pulled = reader.join().unwrap();

        assert!(!matches!(pulled, Ok(Some(_))));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(stream.wait().unwrap().signal, Some(9));
    }

    #[test]
    fn test_stop_cancels_deferred_stream() {
        let call = ProgramCall::new("sh").arg("-c").arg("echo never");
        let Value::ProcessStream(stream) = run(call, CallFlags::empty(), false).unwrap() else {
            panic!("expected a stream");
        };
        stream.stop().unwrap();
        assert!(stream.is_finished());
        assert_eq!(stream.pull(0).unwrap(), None);
    }

    #[test]
    fn test_fixed_lines() {
        let stream = ProcessStream::from_lines("fixed", vec!["a".to_string()]);
        assert!(stream.succeeded());
        assert_eq!(stream.pull(0).unwrap().as_deref(), Some("a"));
        assert_eq!(stream.pull(1).unwrap(), None);
    }
}
