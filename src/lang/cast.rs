//! Cast table between runtime value types.
//!
//! Casting a value to its own type is always the identity. Every value can
//! be cast to `String` and `Boolean`; the remaining pairs are listed in
//! [`Value::cast`].

use indexmap::{IndexMap, IndexSet};

use crate::lang::value::{Value, ValueType};
use crate::runtime::runtime_error::{ErrorKind, RuntimeResult};

impl Value {
    pub fn cast(&self, to: ValueType) -> RuntimeResult<Value> {
        if self.value_type() == to {
            return Ok(self.clone());
        }

        let cast = match (self, to) {
            (_, ValueType::String) => Some(Value::string(self.to_text()?)),
            (_, ValueType::Boolean) => Some(Value::Boolean(self.to_bool())),

            (Value::Integer(n), ValueType::Float) => Some(Value::Float(*n as f64)),
            (Value::Boolean(b), ValueType::Integer) => Some(Value::Integer(i64::from(*b))),
            (Value::Float(n), ValueType::Integer) if n.is_finite() => {
                Some(Value::Integer(n.trunc() as i64))
            }
            (Value::String(s), ValueType::Integer) => s.trim().parse().ok().map(Value::Integer),
            (Value::String(s), ValueType::Float) => s.trim().parse().ok().map(Value::Float),
            (Value::ProcessStream(_), ValueType::Integer) => {
                self.to_text()?.trim().parse().ok().map(Value::Integer)
            }
            (Value::ProcessStream(_), ValueType::Float) => {
                self.to_text()?.trim().parse().ok().map(Value::Float)
            }

            (
                Value::String(_)
                | Value::Tuple(_)
                | Value::Set(_)
                | Value::Dictionary(_)
                | Value::Range(_)
                | Value::ProcessStream(_),
                ValueType::List,
            ) => Some(Value::list(self.collect_items()?)),
            (
                Value::List(_) | Value::Set(_) | Value::Range(_) | Value::ProcessStream(_),
                ValueType::Tuple,
            ) => Some(Value::tuple(self.collect_items()?)),
            (
                Value::List(_) | Value::Tuple(_) | Value::Range(_) | Value::String(_),
                ValueType::Set,
            ) => {
                let keys = self
                    .collect_items()?
                    .iter()
                    .map(Value::to_hash_key)
                    .collect::<RuntimeResult<IndexSet<_>>>()?;
                Some(Value::set(keys))
            }
            (Value::Struct(s), ValueType::Dictionary) => {
                let mut entries = IndexMap::new();
                for (name, value) in s.fields.borrow().iter() {
                    entries.insert(Value::string(name).to_hash_key()?, value.clone());
                }
                Some(Value::dictionary(entries))
            }
            _ => None,
        };

        cast.ok_or_else(|| {
            ErrorKind::Cast {
                from: self.type_name(),
                to: to.name(),
            }
            .into()
        })
    }

    /// Truthiness used by conditions and by casts to Boolean.
    pub fn to_bool(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Boolean(b) => *b,
            Value::Integer(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dictionary(entries) => !entries.borrow().is_empty(),
            Value::Set(items) => !items.borrow().is_empty(),
            Value::Range(range) => range.len() != Some(0),
            Value::Struct(_) | Value::Function(_) => true,
            Value::Error(_) => false,
            Value::ProcessStream(stream) => stream.succeeded(),
        }
    }

    /// Plain text of a value. For process streams this drains the stream
    /// and joins its lines.
    pub fn to_text(&self) -> RuntimeResult<String> {
        match self {
            Value::ProcessStream(stream) => Ok(stream.lines()?.join("\n")),
            Value::Error(error) => Ok(error.value.to_string()),
            other => Ok(other.to_string()),
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Eagerly materialize the elements of an iterable value.
    pub fn collect_items(&self) -> RuntimeResult<Vec<Value>> {
        match self {
            Value::List(items) => Ok(items.borrow().clone()),
            Value::Tuple(items) => Ok(items.to_vec()),
            Value::Set(items) => Ok(items.borrow().iter().map(|k| k.value().clone()).collect()),
            Value::Dictionary(entries) => Ok(entries
                .borrow()
                .iter()
                .map(|(k, v)| Value::tuple(vec![k.value().clone(), v.clone()]))
                .collect()),
            Value::Range(range) => {
                if range.len().is_none() {
                    return Err(ErrorKind::InfiniteRange.into());
                }
                Ok(range.iter().map(Value::Integer).collect())
            }
            Value::String(s) => Ok(s.chars().map(|c| Value::string(c.to_string())).collect()),
            Value::ProcessStream(stream) => {
                Ok(stream.lines()?.into_iter().map(Value::string).collect())
            }
            other => Err(ErrorKind::NotIterable(other.type_name()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::value::Range;

    fn all_samples() -> Vec<Value> {
        vec![
            Value::Nil,
            Value::Boolean(true),
            Value::Integer(7),
            Value::Float(1.5),
            Value::string("text"),
            Value::list(vec![Value::Integer(1)]),
            Value::tuple(vec![Value::Integer(1), Value::Integer(2)]),
            Value::Range(Range::new(Some(0), Some(3), None)),
        ]
    }

    #[test]
    fn test_cast_to_own_type_is_identity() {
        for value in all_samples() {
            let cast = value.cast(value.value_type()).unwrap();
            assert_eq!(cast, value);
            assert_eq!(cast.cast(cast.value_type()).unwrap(), value);
        }
    }

    #[test]
    fn test_cast_own_type_keeps_shared_list() {
        let list = Value::list(vec![]);
        let cast = list.cast(ValueType::List).unwrap();
        if let (Value::List(a), Value::List(b)) = (&list, &cast) {
            assert!(std::rc::Rc::ptr_eq(a, b));
        } else {
            panic!("expected lists");
        }
    }

    #[test]
    fn test_integer_to_float_always_succeeds() {
        assert_eq!(
            Value::Integer(-4).cast(ValueType::Float).unwrap(),
            Value::Float(-4.0)
        );
    }

    #[test]
    fn test_string_to_integer() {
        assert_eq!(
            Value::string(" 42 ").cast(ValueType::Integer).unwrap(),
            Value::Integer(42)
        );

        let err = Value::string("4x2").cast(ValueType::Integer).unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::Cast {
                from: "String",
                to: "Integer"
            }
        );
    }

    #[test]
    fn test_float_to_integer_truncates() {
        assert_eq!(
            Value::Float(-2.9).cast(ValueType::Integer).unwrap(),
            Value::Integer(-2)
        );
        assert!(Value::Float(f64::NAN).cast(ValueType::Integer).is_err());
    }

    #[test]
    fn test_everything_casts_to_string_and_boolean() {
        for value in all_samples() {
            assert!(value.cast(ValueType::String).is_ok());
            assert!(value.cast(ValueType::Boolean).is_ok());
        }
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.to_bool());
        assert!(!Value::Integer(0).to_bool());
        assert!(Value::Integer(3).to_bool());
        assert!(!Value::string("").to_bool());
        assert!(!Value::list(vec![]).to_bool());
        assert!(Value::list(vec![Value::Nil]).to_bool());
        assert!(!Value::Range(Range::new(Some(2), Some(2), None)).to_bool());
    }

    #[test]
    fn test_collection_casts() {
        let list = Value::list(vec![Value::Integer(1), Value::Integer(1), Value::Integer(2)]);
        let set = list.cast(ValueType::Set).unwrap();
        assert_eq!(set.to_string(), "{1, 2}");

        let tuple = list.cast(ValueType::Tuple).unwrap();
        assert_eq!(tuple.to_string(), "(1, 1, 2)");

        let chars = Value::string("ab").cast(ValueType::List).unwrap();
        assert_eq!(chars, Value::list(vec![Value::string("a"), Value::string("b")]));
    }

    #[test]
    fn test_unsupported_cast() {
        let err = Value::Nil.cast(ValueType::Integer).unwrap_err();
        assert!(err.to_string().contains("cannot cast Nil to Integer"));

        let err = Value::list(vec![Value::Float(1.0)])
            .cast(ValueType::Set)
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Unhashable("Float")));
    }

    #[test]
    fn test_open_range_cannot_be_collected() {
        let err = Value::Range(Range::new(Some(0), None, None))
            .cast(ValueType::List)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InfiniteRange);
    }
}
