use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::lang::std_fn::StdFunction;
use crate::process::ProcessStream;
use crate::runtime::runtime_error::{ErrorKind, RuntimeResult, TraceFrame};

/// Tag of a runtime [`Value`], used for casts, parameter descriptors and
/// error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Nil,
    Boolean,
    Integer,
    Float,
    String,
    List,
    Tuple,
    Dictionary,
    Set,
    Range,
    Struct,
    Function,
    Error,
    ProcessStream,
}

impl ValueType {
    /// Every type in tag order; `tag` indexes into this.
    pub const ALL: [ValueType; 14] = [
        ValueType::Nil,
        ValueType::Boolean,
        ValueType::Integer,
        ValueType::Float,
        ValueType::String,
        ValueType::List,
        ValueType::Tuple,
        ValueType::Dictionary,
        ValueType::Set,
        ValueType::Range,
        ValueType::Struct,
        ValueType::Function,
        ValueType::Error,
        ValueType::ProcessStream,
    ];

    /// Byte encoding used by the `Cast` instruction.
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<ValueType> {
        ValueType::ALL.get(usize::from(tag)).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Nil => "Nil",
            ValueType::Boolean => "Boolean",
            ValueType::Integer => "Integer",
            ValueType::Float => "Float",
            ValueType::String => "String",
            ValueType::List => "List",
            ValueType::Tuple => "Tuple",
            ValueType::Dictionary => "Dictionary",
            ValueType::Set => "Set",
            ValueType::Range => "Range",
            ValueType::Struct => "Struct",
            ValueType::Function => "Function",
            ValueType::Error => "Error",
            ValueType::ProcessStream => "ProcessStream",
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Runtime value.
///
/// List, Dictionary, Set and Struct are shared mutable containers: cloning
/// the `Value` clones the handle, so every holder observes writes made
/// through any other holder. All other variants are immutable.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<[Value]>),
    Dictionary(Rc<RefCell<IndexMap<HashKey, Value>>>),
    Set(Rc<RefCell<IndexSet<HashKey>>>),
    Range(Range),
    Struct(Rc<StructValue>),
    Function(Function),
    Error(Rc<ErrorValue>),
    ProcessStream(Arc<ProcessStream>),
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Value {
        Value::String(Rc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::from(items))
    }

    pub fn dictionary(entries: IndexMap<HashKey, Value>) -> Value {
        Value::Dictionary(Rc::new(RefCell::new(entries)))
    }

    pub fn set(items: IndexSet<HashKey>) -> Value {
        Value::Set(Rc::new(RefCell::new(items)))
    }

    pub fn error(value: Value, trace: Option<Vec<TraceFrame>>) -> Value {
        Value::Error(Rc::new(ErrorValue { value, trace }))
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Nil => ValueType::Nil,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Integer(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::String(_) => ValueType::String,
            Value::List(_) => ValueType::List,
            Value::Tuple(_) => ValueType::Tuple,
            Value::Dictionary(_) => ValueType::Dictionary,
            Value::Set(_) => ValueType::Set,
            Value::Range(_) => ValueType::Range,
            Value::Struct(_) => ValueType::Struct,
            Value::Function(_) => ValueType::Function,
            Value::Error(_) => ValueType::Error,
            Value::ProcessStream(_) => ValueType::ProcessStream,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.value_type().name()
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Wrap this value as a dictionary/set key. Fails for variants that are
    /// not hashable (Nil, Float and the mutable containers among others).
    pub fn to_hash_key(&self) -> RuntimeResult<HashKey> {
        if self.is_hashable() {
            Ok(HashKey(self.clone()))
        } else {
            Err(ErrorKind::Unhashable(self.type_name()).into())
        }
    }

    fn is_hashable(&self) -> bool {
        match self {
            Value::Boolean(_) | Value::Integer(_) | Value::String(_) | Value::Range(_) => true,
            Value::Tuple(items) => items.iter().all(Value::is_hashable),
            _ => false,
        }
    }

    /// String form used when a value is embedded inside a collection:
    /// strings are quoted, everything else matches `Display`.
    pub fn debug_string(&self) -> String {
        match self {
            Value::String(s) => format!("{:?}", s),
            other => other.to_string(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
                *a as f64 == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Dictionary(a), Value::Dictionary(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => {
                Rc::ptr_eq(a, b) || (a.name == b.name && *a.fields.borrow() == *b.fields.borrow())
            }
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a.value == b.value,
            (Value::ProcessStream(a), Value::ProcessStream(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A hashable [`Value`] used as a dictionary or set key. Only values that
/// pass [`Value::to_hash_key`] are ever wrapped.
#[derive(Debug, Clone, PartialEq)]
pub struct HashKey(Value);

impl HashKey {
    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl Eq for HashKey {}

impl Hash for HashKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_value(&self.0, state);
    }
}

fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Boolean(b) => {
            0u8.hash(state);
            b.hash(state);
        }
        Value::Integer(n) => {
            1u8.hash(state);
            n.hash(state);
        }
        Value::String(s) => {
            2u8.hash(state);
            s.hash(state);
        }
        Value::Tuple(items) => {
            3u8.hash(state);
            items.len().hash(state);
            for item in items.iter() {
                hash_value(item, state);
            }
        }
        Value::Range(range) => {
            4u8.hash(state);
            range.hash(state);
        }
        other => other.type_name().hash(state),
    }
}

/// Integer range. `to` is exclusive unless `inclusive` is set; missing
/// bounds make the range open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub step: Option<i64>,
    pub inclusive: bool,
}

impl Range {
    pub fn new(from: Option<i64>, to: Option<i64>, step: Option<i64>) -> Self {
        Range {
            from,
            to,
            step,
            inclusive: false,
        }
    }

    /// `from..=to`
    pub fn inclusive(from: Option<i64>, to: Option<i64>, step: Option<i64>) -> Self {
        Range {
            inclusive: true,
            ..Range::new(from, to, step)
        }
    }

    pub fn start(&self) -> i64 {
        self.from.unwrap_or(0)
    }

    /// Explicit step, or 1 / -1 depending on the direction of the bounds.
    pub fn effective_step(&self) -> i64 {
        match (self.step, self.to) {
            (Some(step), _) => step,
            (None, Some(to)) if to < self.start() => -1,
            _ => 1,
        }
    }

    /// Number of elements, or `None` when the range has no end.
    pub fn len(&self) -> Option<usize> {
        let to = self.to?;
        let step = self.effective_step();
        let start = self.start();
        if step == 0 {
            return Some(0);
        }
        let span = if step > 0 {
            i128::from(to) - i128::from(start)
        } else {
            i128::from(start) - i128::from(to)
        };
        let step = i128::from(step.unsigned_abs());
        let count = match self.inclusive {
            true if span >= 0 => span / step + 1,
            false if span > 0 => (span + step - 1) / step,
            _ => 0,
        };
        Some(usize::try_from(count).unwrap_or(usize::MAX))
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        if let Some(len) = self.len() {
            if index >= len {
                return None;
            }
        }
        let offset = (index as i64).checked_mul(self.effective_step())?;
        self.start().checked_add(offset)
    }

    pub fn contains(&self, n: i64) -> bool {
        let step = self.effective_step();
        let start = self.start();
        if step == 0 {
            return false;
        }
        let before_end = |to: i64| match (step > 0, self.inclusive) {
            (true, true) => n <= to,
            (true, false) => n < to,
            (false, true) => n >= to,
            (false, false) => n > to,
        };
        let in_bounds = if step > 0 { n >= start } else { n <= start };
        let in_bounds = in_bounds && self.to.is_none_or(before_end);
        in_bounds && (i128::from(n) - i128::from(start)) % i128::from(step) == 0
    }

    pub fn iter(&self) -> RangeIter {
        RangeIter {
            next: Some(self.start()),
            to: self.to,
            step: self.effective_step(),
            inclusive: self.inclusive,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RangeIter {
    next: Option<i64>,
    to: Option<i64>,
    step: i64,
    inclusive: bool,
}

impl Iterator for RangeIter {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        let current = self.next?;
        if self.step == 0 {
            return None;
        }
        let done = match self.to {
            Some(to) if self.inclusive && self.step > 0 => current > to,
            Some(to) if self.inclusive => current < to,
            Some(to) if self.step > 0 => current >= to,
            Some(to) => current <= to,
            None => false,
        };
        if done {
            self.next = None;
            return None;
        }
        self.next = current.checked_add(self.step);
        Some(current)
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(from) = self.from {
            write!(f, "{}", from)?;
        }
        write!(f, "{}", if self.inclusive { "..=" } else { ".." })?;
        if let Some(to) = self.to {
            write!(f, "{}", to)?;
        }
        if let Some(step) = self.step {
            write!(f, " step {}", step)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct StructValue {
    pub name: String,
    pub fields: RefCell<IndexMap<String, Value>>,
}

impl StructValue {
    pub fn new(name: impl Into<String>, fields: IndexMap<String, Value>) -> Self {
        StructValue {
            name: name.into(),
            fields: RefCell::new(fields),
        }
    }
}

/// A variable shared between the page that declared it and the closures
/// that captured it.
pub type Cell = Rc<RefCell<Value>>;

/// A callable value.
#[derive(Debug, Clone)]
pub enum Function {
    /// A user-defined function compiled to the page at `index`.
    Page { index: u16, name: Rc<str> },

    /// A closure page plus the cells of the variables it captured. Writes
    /// through a cell are seen by the declaring page and by every closure
    /// holding the same cell.
    Closure {
        index: u16,
        environment: Rc<[Cell]>,
    },

    /// A library function descriptor.
    Std(Arc<StdFunction>),
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Function::Page { name, .. } => name,
            Function::Closure { .. } => "<closure>",
            Function::Std(function) => function.name(),
        }
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Function::Page { index: a, .. }, Function::Page { index: b, .. }) => a == b,
            (
                Function::Closure {
                    environment: a, ..
                },
                Function::Closure {
                    environment: b, ..
                },
            ) => Rc::ptr_eq(a, b),
            (Function::Std(a), Function::Std(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// An error that was caught and turned into a value.
#[derive(Debug)]
pub struct ErrorValue {
    pub value: Value,
    pub trace: Option<Vec<TraceFrame>>,
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                write_items(f, items.borrow().iter())?;
                write!(f, "]")
            }
            Value::Tuple(items) => {
                write!(f, "(")?;
                write_items(f, items.iter())?;
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Value::Dictionary(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key.value().debug_string(), value.debug_string())?;
                }
                write!(f, "}}")
            }
            Value::Set(items) => {
                write!(f, "{{")?;
                write_items(f, items.borrow().iter().map(HashKey::value))?;
                write!(f, "}}")
            }
            Value::Range(range) => write!(f, "{}", range),
            Value::Struct(s) => {
                write!(f, "{} {{ ", s.name)?;
                for (i, (name, value)) in s.fields.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, value.debug_string())?;
                }
                write!(f, " }}")
            }
            Value::Function(function) => write!(f, "<function {}>", function.name()),
            Value::Error(error) => write!(f, "Error: {}", error.value),
            Value::ProcessStream(stream) => write!(f, "{}", stream),
        }
    }
}

fn write_items<'a>(
    f: &mut std::fmt::Formatter<'_>,
    items: impl Iterator<Item = &'a Value>,
) -> std::fmt::Result {
    for (i, item) in items.enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item.debug_string())?;
    }
    Ok(())
}
