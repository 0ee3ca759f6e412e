//! Container index contract used by `Index` and `IndexStore`.

use crate::lang::value::{Range, Value};
use crate::runtime::runtime_error::{ErrorKind, RuntimeError, RuntimeResult};

impl Value {
    pub fn index(&self, index: &Value) -> RuntimeResult<Value> {
        match (self, index) {
            (Value::List(items), Value::Integer(i)) => {
                let items = items.borrow();
                let at = resolve_index(*i, items.len())?;
                Ok(items[at].clone())
            }
            (Value::List(items), Value::Range(range)) => {
                let items = items.borrow();
                let picked = slice_positions(range, items.len())?
                    .map(|at| items[at].clone())
                    .collect();
                Ok(Value::list(picked))
            }
            (Value::Tuple(items), Value::Integer(i)) => {
                let at = resolve_index(*i, items.len())?;
                Ok(items[at].clone())
            }
            (Value::Tuple(items), Value::Range(range)) => {
                let picked = slice_positions(range, items.len())?
                    .map(|at| items[at].clone())
                    .collect();
                Ok(Value::tuple(picked))
            }
            (Value::String(s), Value::Integer(i)) => {
                let chars: Vec<char> = s.chars().collect();
                let at = resolve_index(*i, chars.len())?;
                Ok(Value::string(chars[at].to_string()))
            }
            (Value::String(s), Value::Range(range)) => {
                let chars: Vec<char> = s.chars().collect();
                let picked: String = slice_positions(range, chars.len())?
                    .map(|at| chars[at])
                    .collect();
                Ok(Value::string(picked))
            }
            (Value::Range(range), Value::Integer(i)) => {
                let found = match (range.len(), usize::try_from(*i)) {
                    (Some(len), _) => range.get(resolve_index(*i, len)?),
                    (None, Ok(at)) => range.get(at),
                    (None, Err(_)) => None,
                };
                found.map(Value::Integer).ok_or_else(|| {
                    ErrorKind::IndexOutOfRange {
                        index: *i,
                        len: range.len().unwrap_or(usize::MAX),
                    }
                    .into()
                })
            }
            // Missing keys read as nil.
            (Value::Dictionary(entries), key) => {
                let key = key.to_hash_key()?;
                Ok(entries.borrow().get(&key).cloned().unwrap_or(Value::Nil))
            }
            (Value::Struct(s), Value::String(field)) => {
                s.fields.borrow().get(&**field).cloned().ok_or_else(|| {
                    ErrorKind::FieldNotFound {
                        name: s.name.clone(),
                        field: field.to_string(),
                    }
                    .into()
                })
            }
            (Value::ProcessStream(stream), Value::Integer(i)) => {
                let lines = stream.lines()?;
                let at = resolve_index(*i, lines.len())?;
                Ok(Value::string(&lines[at]))
            }
            (Value::List(_) | Value::Tuple(_) | Value::String(_) | Value::Range(_), other)
            | (Value::Struct(_) | Value::ProcessStream(_), other) => {
                Err(ErrorKind::Cast {
                    from: other.type_name(),
                    to: "index",
                }
                .into())
            }
            (other, _) => Err(ErrorKind::NotIndexable(other.type_name()).into()),
        }
    }

    /// Assign through an index. Only the mutable containers accept this;
    /// the backing storage is shared, so every holder observes the write.
    pub fn index_store(&self, index: &Value, value: Value) -> RuntimeResult<()> {
        match (self, index) {
            (Value::List(items), Value::Integer(i)) => {
                let mut items = items.borrow_mut();
                let at = resolve_index(*i, items.len())?;
                items[at] = value;
                Ok(())
            }
            (Value::Dictionary(entries), key) => {
                let key = key.to_hash_key()?;
                entries.borrow_mut().insert(key, value);
                Ok(())
            }
            (Value::Struct(s), Value::String(field)) => {
                let mut fields = s.fields.borrow_mut();
                match fields.get_mut(&**field) {
                    Some(slot) => {
                        *slot = value;
                        Ok(())
                    }
                    None => Err(ErrorKind::FieldNotFound {
                        name: s.name.clone(),
                        field: field.to_string(),
                    }
                    .into()),
                }
            }
            (Value::String(_) | Value::Tuple(_) | Value::Range(_), _) => {
                Err(ErrorKind::Immutable(self.type_name()).into())
            }
            (Value::List(_) | Value::Struct(_), other) => Err(ErrorKind::Cast {
                from: other.type_name(),
                to: "index",
            }
            .into()),
            (other, _) => Err(ErrorKind::NotIndexable(other.type_name()).into()),
        }
    }
}

/// Negative indices count from the end.
fn resolve_index(index: i64, len: usize) -> RuntimeResult<usize> {
    let resolved = if index < 0 {
        i64::try_from(len).ok().and_then(|len| len.checked_add(index))
    } else {
        Some(index)
    };

    resolved
        .and_then(|at| usize::try_from(at).ok())
        .filter(|at| *at < len)
        .ok_or_else(|| RuntimeError::from(ErrorKind::IndexOutOfRange { index, len }))
}

/// Positions selected by a range used as a slice. Negative bounds count
/// from the end, an inclusive end is resolved before it is widened, and
/// the result is clamped to the container.
fn slice_positions(range: &Range, len: usize) -> RuntimeResult<impl Iterator<Item = usize>> {
    let len = i64::try_from(len).map_err(|_| RuntimeError::internal("container too large"))?;
    let resolve = |bound: i64| if bound < 0 { len + bound } else { bound };

    let from = resolve(range.from.unwrap_or(0)).clamp(0, len);
    let to = match range.to {
        Some(to) if range.inclusive => resolve(to).saturating_add(1),
        Some(to) => resolve(to),
        None => len,
    }
    .clamp(0, len);
    let step = range.step.unwrap_or(1);
    if step <= 0 {
        return Err(RuntimeError::custom(format!(
            "slice step must be positive, got {}",
            step
        )));
    }

    Ok(Range::new(Some(from), Some(to.max(from)), Some(step))
        .iter()
        .filter_map(|at| usize::try_from(at).ok()))
}
