//! Library function descriptors.
//!
//! The executor treats library functions as opaque: it only sees the
//! arity bounds, the variadic marker, the parameter types used for argument
//! coercion and the entry point.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::lang::value::{Value, ValueType};
use crate::runtime::runtime_error::{ErrorKind, RuntimeError, RuntimeResult};

pub type StdInvoke = dyn Fn(Vec<Value>) -> RuntimeResult<Value> + Send + Sync;

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    /// Arguments are cast to this type before the call. `None` accepts
    /// anything unchanged.
    pub kind: Option<ValueType>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, kind: Option<ValueType>) -> Self {
        Parameter {
            name: name.into(),
            kind,
        }
    }
}

pub struct StdFunction {
    name: String,
    min_args: usize,
    max_args: Option<usize>,
    variadic_start: Option<usize>,
    parameters: Vec<Parameter>,
    invoke: Box<StdInvoke>,
}

impl std::fmt::Debug for StdFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdFunction")
            .field("name", &self.name)
            .field("min_args", &self.min_args)
            .field("max_args", &self.max_args)
            .field("variadic_start", &self.variadic_start)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

impl StdFunction {
    pub fn new(
        name: impl Into<String>,
        invoke: impl Fn(Vec<Value>) -> RuntimeResult<Value> + Send + Sync + 'static,
    ) -> Self {
        StdFunction {
            name: name.into(),
            min_args: 0,
            max_args: None,
            variadic_start: None,
            parameters: Vec::new(),
            invoke: Box::new(invoke),
        }
    }

    pub fn with_arity(mut self, min: usize, max: Option<usize>) -> Self {
        self.min_args = min;
        self.max_args = max;
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<Parameter>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Arguments from `start` on are packed into one List argument.
    pub fn variadic(mut self, start: usize) -> Self {
        self.variadic_start = Some(start);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_args(&self) -> usize {
        self.min_args
    }

    pub fn max_args(&self) -> Option<usize> {
        self.max_args
    }

    pub fn call(&self, arguments: Vec<Value>) -> RuntimeResult<Value> {
        let arguments = self.prepare_arguments(arguments)?;
        (self.invoke)(arguments)
    }

    fn prepare_arguments(&self, mut arguments: Vec<Value>) -> RuntimeResult<Vec<Value>> {
        let got = arguments.len();
        if got < self.min_args || self.max_args.is_some_and(|max| got > max) {
            return Err(ErrorKind::ArgumentCount {
                name: self.name.clone(),
                expected: self.expected_description(),
                got,
            }
            .into());
        }

        if let Some(start) = self.variadic_start {
            let rest = arguments.split_off(start.min(got));
            arguments.push(Value::list(rest));
        }

        for (argument, parameter) in arguments.iter_mut().zip(&self.parameters) {
            if let Some(kind) = parameter.kind {
                if argument.value_type() != kind {
                    *argument = argument.cast(kind)?;
                }
            }
        }

        Ok(arguments)
    }

    fn expected_description(&self) -> String {
        match self.max_args {
            Some(max) if max == self.min_args => max.to_string(),
            Some(max) => format!("{} to {}", self.min_args, max),
            None => format!("at least {}", self.min_args),
        }
    }
}

/// Name-keyed set of library functions a program is bound against.
#[derive(Debug, Default, Clone)]
pub struct Library {
    functions: IndexMap<String, Arc<StdFunction>>,
}

impl Library {
    pub fn new() -> Self {
        Library::default()
    }

    pub fn register(&mut self, function: StdFunction) -> Arc<StdFunction> {
        let function = Arc::new(function);
        self.functions
            .insert(function.name().to_string(), Arc::clone(&function));
        function
    }

    pub fn get(&self, name: &str) -> Option<&Arc<StdFunction>> {
        self.functions.get(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// The handful of functions the developer binary binds programs to.
    pub fn prelude() -> Self {
        let mut library = Library::new();

        library.register(
            StdFunction::new("print", |args| {
                let text = args[0]
                    .collect_items()?
                    .iter()
                    .map(Value::to_text)
                    .collect::<RuntimeResult<Vec<_>>>()?
                    .join(" ");
                println!("{}", text);
                Ok(Value::Nil)
            })
            .variadic(0),
        );

        library.register(
            StdFunction::new("len", |args| {
                let len = match &args[0] {
                    Value::String(s) => s.chars().count(),
                    Value::Range(range) => range.len().ok_or(ErrorKind::InfiniteRange)?,
                    other => other.collect_items()?.len(),
                };
                i64::try_from(len)
                    .map(Value::Integer)
                    .map_err(|_| RuntimeError::new(ErrorKind::IntegerOverflow("len")))
            })
            .with_arity(1, Some(1)),
        );

        library.register(
            StdFunction::new("type", |args| Ok(Value::string(args[0].type_name())))
                .with_arity(1, Some(1)),
        );

        library.register(
            StdFunction::new("str", |args| Ok(args[0].clone()))
                .with_arity(1, Some(1))
                .with_parameters(vec![Parameter::new("value", Some(ValueType::String))]),
        );

        library.register(
            StdFunction::new("push", |args| match &args[0] {
                Value::List(items) => {
                    items.borrow_mut().push(args[1].clone());
                    Ok(args[0].clone())
                }
                other => Err(ErrorKind::Cast {
                    from: other.type_name(),
                    to: "List",
                }
                .into()),
            })
            .with_arity(2, Some(2)),
        );

        library.register(
            StdFunction::new("error", |args| Err(RuntimeError::custom(args[0].to_text()?)))
                .with_arity(1, Some(1)),
        );

        library
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(name: &str) -> StdFunction {
        StdFunction::new(name, |args| Ok(Value::list(args)))
    }

    #[test]
    fn test_arity_bounds() {
        let f = echo("pair").with_arity(2, Some(2));
        assert!(f.call(vec![Value::Integer(1), Value::Integer(2)]).is_ok());

        let err = f.call(vec![Value::Integer(1)]).unwrap_err();
        assert_eq!(err.to_string(), "runtime error: pair expects 2 argument(s), got 1");

        let f = echo("many").with_arity(1, None);
        let err = f.call(vec![]).unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn test_variadic_arguments_are_packed() {
        let f = echo("join").variadic(1);
        let result = f
            .call(vec![
                Value::string(","),
                Value::Integer(1),
                Value::Integer(2),
            ])
            .unwrap();

        assert_eq!(
            result,
            Value::list(vec![
                Value::string(","),
                Value::list(vec![Value::Integer(1), Value::Integer(2)]),
            ])
        );
    }

    #[test]
    fn test_variadic_with_no_trailing_arguments() {
        let f = echo("join").variadic(1);
        let result = f.call(vec![Value::string(",")]).unwrap();
        assert_eq!(
            result,
            Value::list(vec![Value::string(","), Value::list(vec![])])
        );
    }

    #[test]
    fn test_parameter_types_coerce_arguments() {
        let f = echo("num").with_parameters(vec![Parameter::new("n", Some(ValueType::Integer))]);
        let result = f.call(vec![Value::string("12")]).unwrap();
        assert_eq!(result, Value::list(vec![Value::Integer(12)]));

        let err = f.call(vec![Value::string("x")]).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Cast { .. }));
    }

    #[test]
    fn test_prelude_functions() {
        let library = Library::prelude();
        let len = library.get("len").unwrap();
        assert_eq!(
            len.call(vec![Value::string("héllo")]).unwrap(),
            Value::Integer(5)
        );

        let str_fn = library.get("str").unwrap();
        assert_eq!(
            str_fn.call(vec![Value::Integer(4)]).unwrap(),
            Value::string("4")
        );

        let error = library.get("error").unwrap();
        let err = error.call(vec![Value::string("boom")]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Custom("boom".to_string()));
    }
}
