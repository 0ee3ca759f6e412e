use std::cmp::Ordering;

use indexmap::IndexSet;

use crate::lang::value::Value;
use crate::runtime::runtime_error::{ErrorKind, RuntimeError, RuntimeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperation {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
    In,
}

impl BinaryOperation {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOperation::Add => "+",
            BinaryOperation::Subtract => "-",
            BinaryOperation::Multiply => "*",
            BinaryOperation::Divide => "/",
            BinaryOperation::Modulo => "%",
            BinaryOperation::Power => "^",
            BinaryOperation::Equal => "==",
            BinaryOperation::NotEqual => "!=",
            BinaryOperation::Less => "<",
            BinaryOperation::LessEqual => "<=",
            BinaryOperation::Greater => ">",
            BinaryOperation::GreaterEqual => ">=",
            BinaryOperation::And => "and",
            BinaryOperation::Or => "or",
            BinaryOperation::In => "in",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOperation {
    Negate,
    Not,
}

impl UnaryOperation {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOperation::Negate => "-",
            UnaryOperation::Not => "not",
        }
    }
}

impl Value {
    pub fn binary_op(&self, op: BinaryOperation, other: &Value) -> RuntimeResult<Value> {
        use BinaryOperation::*;

        match op {
            Equal => Ok(Value::Boolean(self == other)),
            NotEqual => Ok(Value::Boolean(self != other)),
            And => Ok(Value::Boolean(self.to_bool() && other.to_bool())),
            Or => Ok(Value::Boolean(self.to_bool() || other.to_bool())),
            In => other.contains(self).map(Value::Boolean),
            Less => self.less_than(other, op).map(Value::Boolean),
            LessEqual => Ok(Value::Boolean(
                self == other || self.less_than(other, op)?,
            )),
            Greater => other.less_than(self, op).map(Value::Boolean),
            GreaterEqual => Ok(Value::Boolean(
                self == other || other.less_than(self, op)?,
            )),
            Add | Subtract | Multiply | Divide | Modulo | Power => self.arithmetic(op, other),
        }
    }

    pub fn unary_op(&self, op: UnaryOperation) -> RuntimeResult<Value> {
        match (op, self) {
            (UnaryOperation::Not, value) => Ok(Value::Boolean(!value.to_bool())),
            (UnaryOperation::Negate, Value::Integer(n)) => n
                .checked_neg()
                .map(Value::Integer)
                .ok_or_else(|| ErrorKind::IntegerOverflow("-").into()),
            (UnaryOperation::Negate, Value::Float(n)) => Ok(Value::Float(-n)),
            (UnaryOperation::Negate, other) => Err(ErrorKind::InvalidUnaryOperation {
                op: op.symbol(),
                operand: other.type_name(),
            }
            .into()),
        }
    }

    /// Total order used for sorting, expressed through the `Less` and
    /// `Equal` operators.
    pub fn compare(&self, other: &Value) -> RuntimeResult<Ordering> {
        if self.binary_op(BinaryOperation::Less, other)?.to_bool() {
            Ok(Ordering::Less)
        } else if self.binary_op(BinaryOperation::Equal, other)?.to_bool() {
            Ok(Ordering::Equal)
        } else {
            Ok(Ordering::Greater)
        }
    }

    fn less_than(&self, other: &Value, op: BinaryOperation) -> RuntimeResult<bool> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Ok(a < b),
            (Value::String(a), Value::String(b)) => Ok(a < b),
            (Value::Boolean(a), Value::Boolean(b)) => Ok(a < b),
            (Value::List(a), Value::List(b)) => {
                let (a, b) = (a.borrow().clone(), b.borrow().clone());
                less_than_sequence(&a, &b, op)
            }
            (Value::Tuple(a), Value::Tuple(b)) => less_than_sequence(a, b, op),
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => Ok(a < b),
                _ => Err(invalid_binary(op, self, other)),
            },
        }
    }

    fn arithmetic(&self, op: BinaryOperation, other: &Value) -> RuntimeResult<Value> {
        use BinaryOperation::*;

        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => integer_arithmetic(op, *a, *b),
            (Value::String(a), _) if op == Add => {
                Ok(Value::string(format!("{}{}", a, other.to_text()?)))
            }
            (Value::String(s), Value::Integer(n)) if op == Multiply => {
                let count = repeat_count(s.len(), *n)?;
                Ok(Value::string(s.repeat(count)))
            }
            (Value::List(a), Value::List(b)) if op == Add => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Ok(Value::list(items))
            }
            (Value::List(a), Value::Integer(n)) if op == Multiply => {
                let items = a.borrow();
                let count = repeat_count(items.len(), *n)?;
                let mut repeated = Vec::with_capacity(items.len() * count);
                for _ in 0..count {
                    repeated.extend(items.iter().cloned());
                }
                Ok(Value::list(repeated))
            }
            (Value::Tuple(a), Value::Tuple(b)) if op == Add => {
                Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect()))
            }
            (Value::Set(a), Value::Set(b)) if op == Add || op == Subtract => {
                let (a, b) = (a.borrow(), b.borrow());
                let result: IndexSet<_> = if op == Add {
                    a.union(&b).cloned().collect()
                } else {
                    a.difference(&b).cloned().collect()
                };
                Ok(Value::set(result))
            }
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => float_arithmetic(op, a, b),
                _ => Err(invalid_binary(op, self, other)),
            },
        }
    }

    /// Membership test backing the `in` operator: `needle in self`.
    fn contains(&self, needle: &Value) -> RuntimeResult<bool> {
        match self {
            Value::List(items) => Ok(items.borrow().iter().any(|item| item == needle)),
            Value::Tuple(items) => Ok(items.iter().any(|item| item == needle)),
            Value::Set(items) => Ok(needle
                .to_hash_key()
                .map(|key| items.borrow().contains(&key))
                .unwrap_or(false)),
            Value::Dictionary(entries) => Ok(needle
                .to_hash_key()
                .map(|key| entries.borrow().contains_key(&key))
                .unwrap_or(false)),
            Value::String(haystack) => match needle {
                Value::String(n) => Ok(haystack.contains(&**n)),
                other => Err(invalid_binary(BinaryOperation::In, other, self)),
            },
            Value::Range(range) => Ok(needle.as_integer().is_some_and(|n| range.contains(n))),
            Value::ProcessStream(stream) => {
                let text = needle.to_text()?;
                Ok(stream.lines()?.iter().any(|line| *line == text))
            }
            other => Err(invalid_binary(BinaryOperation::In, needle, other)),
        }
    }
}

/// Largest string (in bytes) or list (in items) that `*` may produce.
pub const MAX_REPEAT_LEN: usize = 1 << 28;

/// Number of copies for `sequence * n`. Counts below one and empty
/// sequences give an empty result.
fn repeat_count(len: usize, n: i64) -> RuntimeResult<usize> {
    let count = match usize::try_from(n) {
        Ok(count) if len > 0 => count,
        _ => return Ok(0),
    };
    let total = len
        .checked_mul(count)
        .ok_or(ErrorKind::IntegerOverflow("*"))?;
    if total > MAX_REPEAT_LEN {
        return Err(ErrorKind::LimitExceeded {
            limit: "repeated length",
            max: MAX_REPEAT_LEN,
        }
        .into());
    }
    Ok(count)
}

fn less_than_sequence(a: &[Value], b: &[Value], op: BinaryOperation) -> RuntimeResult<bool> {
    for (x, y) in a.iter().zip(b.iter()) {
        if x == y {
            continue;
        }
        return x.less_than(y, op);
    }
    Ok(a.len() < b.len())
}

fn integer_arithmetic(op: BinaryOperation, a: i64, b: i64) -> RuntimeResult<Value> {
    use BinaryOperation::*;

    let overflow = || RuntimeError::from(ErrorKind::IntegerOverflow(op.symbol()));
    match op {
        Add => a.checked_add(b).map(Value::Integer).ok_or_else(overflow),
        Subtract => a.checked_sub(b).map(Value::Integer).ok_or_else(overflow),
        Multiply => a.checked_mul(b).map(Value::Integer).ok_or_else(overflow),
        Divide => float_arithmetic(op, a as f64, b as f64),
        Modulo => {
            if b == 0 {
                return Err(ErrorKind::DivisionByZero.into());
            }
            a.checked_rem(b).map(Value::Integer).ok_or_else(overflow)
        }
        Power => match u32::try_from(b) {
            Ok(exp) => a.checked_pow(exp).map(Value::Integer).ok_or_else(overflow),
            Err(_) => float_arithmetic(op, a as f64, b as f64),
        },
        _ => Err(RuntimeError::internal(format!(
            "'{}' is not an arithmetic operator",
            op.symbol()
        ))),
    }
}

fn float_arithmetic(op: BinaryOperation, a: f64, b: f64) -> RuntimeResult<Value> {
    use BinaryOperation::*;

    let result = match op {
        Add => a + b,
        Subtract => a - b,
        Multiply => a * b,
        Divide | Modulo if b == 0.0 => return Err(ErrorKind::DivisionByZero.into()),
        Divide => a / b,
        Modulo => a % b,
        Power => a.powf(b),
        _ => {
            return Err(RuntimeError::internal(format!(
                "'{}' is not an arithmetic operator",
                op.symbol()
            )));
        }
    };
    Ok(Value::Float(result))
}

fn invalid_binary(op: BinaryOperation, lhs: &Value, rhs: &Value) -> RuntimeError {
    ErrorKind::InvalidBinaryOperation {
        op: op.symbol(),
        lhs: lhs.type_name(),
        rhs: rhs.type_name(),
    }
    .into()
}
