//! External process bridge.
//!
//! `CallProgram`-family instructions land here: the executor hands over a
//! [`ProgramCall`] built from the popped operands together with the flags
//! word and whether the call sits in root position.

pub mod handle;
pub mod signal;
pub mod stream;

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use tracing::{debug, warn};

use crate::lang::value::Value;
use crate::runtime::runtime_error::{ErrorKind, RuntimeError, RuntimeResult};

pub use handle::ProcessHandle;
pub use signal::ExitInfo;
pub use stream::ProcessStream;

/// Flags word carried by `CallProgram` instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallFlags(u16);

impl CallFlags {
    pub const HAS_PIPED_VALUE: CallFlags = CallFlags(1 << 0);
    pub const REDIRECT_STDOUT: CallFlags = CallFlags(1 << 1);
    pub const REDIRECT_STDERR: CallFlags = CallFlags(1 << 2);
    pub const DISABLE_BUFFERING: CallFlags = CallFlags(1 << 3);
    pub const AUTO_START: CallFlags = CallFlags(1 << 4);
    pub const BACKGROUND: CallFlags = CallFlags(1 << 5);

    pub const fn empty() -> Self {
        CallFlags(0)
    }

    pub const fn from_bits(bits: u16) -> Self {
        CallFlags(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: CallFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: CallFlags) {
        self.0 |= other.0;
    }

    pub fn with(mut self, other: CallFlags, enabled: bool) -> Self {
        if enabled {
            self.insert(other);
        }
        self
    }

    pub fn names(self) -> Vec<&'static str> {
        [
            (CallFlags::HAS_PIPED_VALUE, "piped"),
            (CallFlags::REDIRECT_STDOUT, "stdout"),
            (CallFlags::REDIRECT_STDERR, "stderr"),
            (CallFlags::DISABLE_BUFFERING, "unbuffered"),
            (CallFlags::AUTO_START, "autostart"),
            (CallFlags::BACKGROUND, "background"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect()
    }
}

/// Input fed to a process's stdin.
#[derive(Debug, Clone)]
pub enum PipedInput {
    Text(String),
    Lines(Vec<String>),
    /// Output of another process, forwarded line by line as it arrives.
    Stream(Arc<ProcessStream>),
}

impl PipedInput {
    pub fn from_value(value: &Value) -> RuntimeResult<PipedInput> {
        match value {
            Value::ProcessStream(stream) => Ok(PipedInput::Stream(Arc::clone(stream))),
            Value::List(_) | Value::Tuple(_) | Value::Set(_) | Value::Range(_) => {
                let lines = value
                    .collect_items()?
                    .iter()
                    .map(Value::to_text)
                    .collect::<RuntimeResult<_>>()?;
                Ok(PipedInput::Lines(lines))
            }
            other => Ok(PipedInput::Text(other.to_text()?)),
        }
    }
}

/// Everything needed to start one program.
#[derive(Debug, Clone)]
pub struct ProgramCall {
    pub program: String,
    pub arguments: Vec<String>,
    pub environment: Vec<(String, String)>,
    pub piped: Option<PipedInput>,
}

impl ProgramCall {
    pub fn new(program: impl Into<String>) -> Self {
        ProgramCall {
            program: program.into(),
            arguments: Vec::new(),
            environment: Vec::new(),
            piped: None,
        }
    }

    pub fn arg(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    /// Append a script value as arguments. Lists and tuples are flattened.
    pub fn push_value_argument(&mut self, value: &Value) -> RuntimeResult<()> {
        match value {
            Value::List(_) | Value::Tuple(_) => {
                for item in value.collect_items()? {
                    self.push_value_argument(&item)?;
                }
            }
            other => self.arguments.push(other.to_text()?),
        }
        Ok(())
    }
}

/// Where a spawned process's output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputMode {
    Inherit,
    Capture { merge_stderr: bool },
}

pub(crate) struct Spawned {
    pub handle: Arc<ProcessHandle>,
    pub output: Option<Receiver<String>>,
}

/// Run a program call and produce the value of the call expression.
///
/// Root calls stream straight to the terminal and yield nil. Captured calls
/// yield a [`ProcessStream`]; unless buffering is disabled the stream is
/// read to the end before returning, so a failing exit raises right here.
pub fn run(call: ProgramCall, flags: CallFlags, root: bool) -> RuntimeResult<Value> {
    let capture = !root || flags.contains(CallFlags::REDIRECT_STDOUT);
    let mode = if capture {
        OutputMode::Capture {
            merge_stderr: flags.contains(CallFlags::REDIRECT_STDERR),
        }
    } else {
        OutputMode::Inherit
    };
    let background = flags.contains(CallFlags::BACKGROUND);

    if !capture {
        let spawned = spawn(&call, mode)?;
        if background {
            detach(spawned.handle);
            return Ok(Value::Nil);
        }
        let exit = spawned.handle.close()?;
        return match exit.to_error(&call.program) {
            Some(err) => Err(err),
            None => Ok(Value::Nil),
        };
    }

    let raise_on_exit = !background;
    if !flags.contains(CallFlags::AUTO_START) && !background {
        return Ok(Value::ProcessStream(Arc::new(ProcessStream::deferred(
            call,
            mode,
            raise_on_exit,
        ))));
    }

    let spawned = spawn(&call, mode)?;
    if background {
        detach(Arc::clone(&spawned.handle));
    }

    let stream = Arc::new(ProcessStream::started(
        call.program,
        spawned,
        raise_on_exit,
    ));
    if !background && !flags.contains(CallFlags::DISABLE_BUFFERING) {
        stream.lines()?;
    }
    Ok(Value::ProcessStream(stream))
}

/// Close the process from a completion thread once it exits.
fn detach(handle: Arc<ProcessHandle>) {
    thread::spawn(move || {
        if let Err(err) = handle.close() {
            warn!(program = %handle.program(), error = %err, "background process close failed");
        }
    });
}

pub(crate) fn spawn(call: &ProgramCall, mode: OutputMode) -> RuntimeResult<Spawned> {
    let mut command = Command::new(&call.program);
    command
        .args(&call.arguments)
        .envs(call.environment.iter().map(|(k, v)| (k, v)));

    command.stdin(if call.piped.is_some() {
        Stdio::piped()
    } else {
        Stdio::inherit()
    });
    match mode {
        OutputMode::Inherit => {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        OutputMode::Capture { merge_stderr } => {
            command.stdout(Stdio::piped());
            command.stderr(if merge_stderr {
                Stdio::piped()
            } else {
                Stdio::inherit()
            });
        }
    }

    let mut child = command.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            RuntimeError::new(ErrorKind::ProgramNotFound(call.program.clone()))
        } else {
            RuntimeError::from(err)
        }
    })?;
    debug!(program = %call.program, pid = child.id(), args = ?call.arguments, "spawned process");

    if let (Some(stdin), Some(input)) = (child.stdin.take(), call.piped.clone()) {
        let program = call.program.clone();
        thread::spawn(move || feed(&program, stdin, input));
    }

    let output = match mode {
        OutputMode::Inherit => None,
        OutputMode::Capture { .. } => {
            let (sender, receiver) = mpsc::channel();
            if let Some(stdout) = child.stdout.take() {
                forward_lines(stdout, sender.clone());
            }
            if let Some(stderr) = child.stderr.take() {
                forward_lines(stderr, sender.clone());
            }
            Some(receiver)
        }
    };

    Ok(Spawned {
        handle: Arc::new(ProcessHandle::new(call.program.clone(), child)),
        output,
    })
}

fn forward_lines(source: impl Read + Send + 'static, sender: Sender<String>) {
    thread::spawn(move || {
        for line in BufReader::new(source).lines() {
            let Ok(line) = line else { break };
            if sender.send(line).is_err() {
                break;
            }
        }
    });
}

/// Write piped input to a child's stdin. A closed pipe means the reader is
/// gone, which is an ordinary outcome and only stops feeding.
fn feed(program: &str, mut stdin: ChildStdin, input: PipedInput) {
    let result = match input {
        PipedInput::Text(text) => writeln!(stdin, "{}", text),
        PipedInput::Lines(lines) => lines
            .iter()
            .try_for_each(|line| writeln!(stdin, "{}", line)),
        PipedInput::Stream(upstream) => feed_stream(&mut stdin, &upstream),
    };

    match result {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
            debug!(program, "stdin closed by process, stopped feeding");
        }
        Err(err) => warn!(program, error = %err, "failed to feed process stdin"),
    }
}

fn feed_stream(stdin: &mut ChildStdin, upstream: &ProcessStream) -> std::io::Result<()> {
    let mut index = 0;
    loop {
        match upstream.pull(index) {
            Ok(Some(line)) => writeln!(stdin, "{}", line)?,
            Ok(None) => return Ok(()),
            Err(err) => {
                warn!(program = %upstream.program(), error = %err, "upstream process failed");
                return Ok(());
            }
        }
        index += 1;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn captured(program: &str, args: &[&str]) -> RuntimeResult<Value> {
        let mut call = ProgramCall::new(program);
        call.arguments = args.iter().map(|a| a.to_string()).collect();
        run(call, CallFlags::AUTO_START, false)
    }

    #[test]
    fn test_captured_output() {
        let value = captured("sh", &["-c", "echo one; echo two"]).unwrap();
        assert_eq!(value.to_text().unwrap(), "one\ntwo");
        assert_eq!(value.collect_items().unwrap().len(), 2);
    }

    #[test]
    fn test_captured_failure_raises() {
        let err = captured("false", &[]).unwrap_err();
        assert!(err.is_catchable());
        assert_eq!(
            err.kind,
            ErrorKind::NonZeroExit {
                program: "false".to_string(),
                code: 1
            }
        );
    }

    #[test]
    fn test_background_failure_does_not_raise() {
        let flags = CallFlags::AUTO_START.with(CallFlags::BACKGROUND, true);
        let value = run(ProgramCall::new("false"), flags, false).unwrap();
        let Value::ProcessStream(stream) = value else {
            panic!("expected a process stream");
        };
        let exit = stream.wait().unwrap();
        assert_eq!(exit.code, Some(1));
        assert!(stream.lines().is_ok());
    }

    #[test]
    fn test_root_background_yields_nil() {
        let flags = CallFlags::AUTO_START.with(CallFlags::BACKGROUND, true);
        let value = run(ProgramCall::new("false"), flags, true).unwrap();
        assert!(value.is_nil());
    }

    #[test]
    fn test_root_failure_raises() {
        let err = run(ProgramCall::new("false"), CallFlags::AUTO_START, true).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::NonZeroExit { code: 1, .. }));
    }

    #[test]
    fn test_program_not_found() {
        let err = captured("definitely-not-a-program-xyz", &[]).unwrap_err();
        assert_eq!(
            err.message(),
            "program not found: definitely-not-a-program-xyz"
        );
    }

    #[test]
    fn test_piped_value_and_environment() {
        let mut call = ProgramCall::new("sh").arg("-c").arg("read line; echo \"$line-$SUFFIX\"");
        call.environment.push(("SUFFIX".to_string(), "x".to_string()));
        call.piped = Some(PipedInput::Text("abc".to_string()));

        let flags = CallFlags::AUTO_START.with(CallFlags::HAS_PIPED_VALUE, true);
        let value = run(call, flags, false).unwrap();
        assert_eq!(value.to_text().unwrap(), "abc-x");
    }

    #[test]
    fn test_lazy_pipeline() {
        let upstream = run(
            ProgramCall::new("sh").arg("-c").arg("echo a; echo b; echo c"),
            CallFlags::empty(),
            false,
        )
        .unwrap();

        let mut downstream = ProgramCall::new("cat");
        downstream.piped = Some(PipedInput::from_value(&upstream).unwrap());
        let flags = CallFlags::AUTO_START.with(CallFlags::HAS_PIPED_VALUE, true);
        let value = run(downstream, flags, false).unwrap();
        assert_eq!(value.to_text().unwrap(), "a\nb\nc");
    }

    #[test]
    fn test_broken_pipe_is_absorbed() {
        let lines = (0..100_000).map(|i| i.to_string()).collect();
        let mut call = ProgramCall::new("sh").arg("-c").arg("exit 0");
        call.piped = Some(PipedInput::Lines(lines));

        let flags = CallFlags::AUTO_START.with(CallFlags::HAS_PIPED_VALUE, true);
        let value = run(call, flags, false).unwrap();
        assert_eq!(value.to_text().unwrap(), "");
    }

    #[test]
    fn test_list_arguments_are_flattened() {
        let mut call = ProgramCall::new("echo");
        call.push_value_argument(&Value::list(vec![
            Value::string("a"),
            Value::Integer(2),
        ]))
        .unwrap();
        call.push_value_argument(&Value::string("c")).unwrap();
        assert_eq!(call.arguments, vec!["a", "2", "c"]);
    }

    #[test]
    fn test_flag_names() {
        let flags = CallFlags::AUTO_START.with(CallFlags::REDIRECT_STDERR, true);
        assert_eq!(flags.names(), vec!["stderr", "autostart"]);
        assert_eq!(CallFlags::from_bits(flags.bits()), flags);
    }
}
