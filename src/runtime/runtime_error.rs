use thiserror::Error;

/// What went wrong while executing bytecode.
///
/// Everything except [`ErrorKind::Internal`] can be caught by a `try`
/// region in the script.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    #[error("cannot cast {from} to {to}")]
    Cast { from: &'static str, to: &'static str },

    #[error("cannot apply '{op}' to {lhs} and {rhs}")]
    InvalidBinaryOperation {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },

    #[error("cannot apply '{op}' to {operand}")]
    InvalidUnaryOperation {
        op: &'static str,
        operand: &'static str,
    },

    #[error("unable to index {0}")]
    NotIndexable(&'static str),

    #[error("{0} is immutable and cannot be assigned to by index")]
    Immutable(&'static str),

    #[error("index {index} is out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("no field '{field}' on struct {name}")]
    FieldNotFound { name: String, field: String },

    #[error("{0} is not hashable")]
    Unhashable(&'static str),

    #[error("{0} is not iterable")]
    NotIterable(&'static str),

    #[error("{0} is not callable")]
    NotCallable(&'static str),

    #[error("{name} expects {expected} argument(s), got {got}")]
    ArgumentCount {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow in '{0}'")]
    IntegerOverflow(&'static str),

    #[error("range has no end and cannot be collected")]
    InfiniteRange,

    #[error("expected {expected} values to unpack, got {got}")]
    Unpack { expected: usize, got: usize },

    #[error("{limit} limit of {max} exceeded")]
    LimitExceeded { limit: &'static str, max: usize },

    #[error("program not found: {0}")]
    ProgramNotFound(String),

    #[error("program '{program}' returned a non-zero exit code ({code})")]
    NonZeroExit { program: String, code: i32 },

    #[error("program '{program}' was terminated by {signal}")]
    Signal { program: String, signal: String },

    #[error("i/o error: {0}")]
    Io(String),

    #[error("{0}")]
    Custom(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ErrorKind {
    pub fn is_catchable(&self) -> bool {
        !matches!(self, ErrorKind::Internal(_))
    }
}

/// One entry of a call trace: the page that was executing and the source
/// line of the instruction in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub page: String,
    pub line: Option<u32>,
}

impl std::fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.page, line),
            None => write!(f, "{}", self.page),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    /// Innermost frame first.
    pub trace: Vec<TraceFrame>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "runtime error: {}", self.kind)?;

        if !self.trace.is_empty() {
            write!(f, "\n  call stack:")?;

            for (i, frame) in self.trace.iter().enumerate() {
                write!(f, "\n    {}: {}", i, frame)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

impl From<ErrorKind> for RuntimeError {
    fn from(kind: ErrorKind) -> Self {
        RuntimeError::new(kind)
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::Io(err.to_string()).into()
    }
}

impl RuntimeError {
    pub fn new(kind: ErrorKind) -> Self {
        RuntimeError {
            kind,
            trace: Vec::new(),
        }
    }

    /// An error raised by library code with a free-form message.
    pub fn custom(message: impl Into<String>) -> Self {
        ErrorKind::Custom(message.into()).into()
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal(message.into()).into()
    }

    pub fn message(&self) -> String {
        self.kind.to_string()
    }

    pub fn is_catchable(&self) -> bool {
        self.kind.is_catchable()
    }

    pub fn with_trace(mut self, trace: Vec<TraceFrame>) -> Self {
        if self.trace.is_empty() {
            self.trace = trace;
        }
        self
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
