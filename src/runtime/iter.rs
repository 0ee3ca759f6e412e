use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::lang::value::{RangeIter, Value};
use crate::process::ProcessStream;
use crate::runtime::runtime_error::{ErrorKind, RuntimeResult};

/// Iterator object created by `GetIter` and advanced by `ForIter`.
///
/// Lists are walked live, so items appended inside the loop body are
/// visited. Dictionaries and sets are snapshotted when the loop starts.
#[derive(Debug)]
pub enum Iter {
    List {
        items: Rc<RefCell<Vec<Value>>>,
        next: usize,
    },
    Snapshot(std::vec::IntoIter<Value>),
    Range(RangeIter),
    Chars(std::vec::IntoIter<char>),
    /// Lines pulled from a process as the loop asks for them.
    Lines {
        stream: Arc<ProcessStream>,
        next: usize,
    },
}

impl Iter {
    pub fn new(value: &Value) -> RuntimeResult<Iter> {
        Ok(match value {
            Value::List(items) => Iter::List {
                items: Rc::clone(items),
                next: 0,
            },
            Value::Range(range) => Iter::Range(range.iter()),
            Value::String(s) => Iter::Chars(s.chars().collect::<Vec<_>>().into_iter()),
            Value::ProcessStream(stream) => Iter::Lines {
                stream: Arc::clone(stream),
                next: 0,
            },
            Value::Tuple(_) | Value::Dictionary(_) | Value::Set(_) => {
                Iter::Snapshot(value.collect_items()?.into_iter())
            }
            other => return Err(ErrorKind::NotIterable(other.type_name()).into()),
        })
    }

    pub fn next(&mut self) -> RuntimeResult<Option<Value>> {
        Ok(match self {
            Iter::List { items, next } => {
                let item = items.borrow().get(*next).cloned();
                if item.is_some() {
                    *next += 1;
                }
                item
            }
            Iter::Snapshot(items) => items.next(),
            Iter::Range(range) => range.next().map(Value::Integer),
            Iter::Chars(chars) => chars.next().map(|c| Value::string(c.to_string())),
            Iter::Lines { stream, next } => {
                let line = stream.pull(*next)?;
                if line.is_some() {
                    *next += 1;
                }
                line.map(Value::string)
            }
        })
    }
}
