use std::sync::Arc;

use crate::lang::operator::{BinaryOperation, UnaryOperation};
use crate::lang::std_fn::StdFunction;
use crate::lang::value::ValueType;

/// Identifier the analyzer gives every user-defined function. Calls carry
/// the id of the definition they resolved to.
pub type FunctionId = usize;

/// Analyzed expression node.
///
/// Names are already resolved by the front end: every `Variable` refers to
/// a local in scope or to a capture of the enclosing closure, and every
/// call knows what kind of callee it targets.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    // ───────────────────────────── Literals ─────────────────────────────
    Literal(Literal),

    /// Parts are converted to strings and concatenated.
    StringInterpolation(Vec<Expr>),

    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dictionary(Vec<(Expr, Expr)>),
    Set(Vec<Expr>),

    /// `from..to`, or `from..=to` when `inclusive`. Either bound may be
    /// missing.
    Range {
        from: Option<Box<Expr>>,
        to: Option<Box<Expr>>,
        inclusive: bool,
    },

    Struct {
        name: String,
        fields: Vec<(String, Expr)>,
    },

    // ───────────────────────────── Variables ────────────────────────────
    Variable(String),

    /// `let a = value`, or `let a, b = value` which unpacks a sequence.
    /// Produces no value.
    Let {
        names: Vec<String>,
        value: Box<Expr>,
    },

    /// Target must be a variable, an indexer or a field access.
    Assignment {
        target: Box<Expr>,
        value: Box<Expr>,
    },

    // ───────────────────────────── Operators ────────────────────────────
    /// `And` and `Or` short-circuit.
    Binary {
        op: BinaryOperation,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },

    Unary {
        op: UnaryOperation,
        operand: Box<Expr>,
    },

    Cast {
        value: Box<Expr>,
        to: ValueType,
    },

    Indexer {
        target: Box<Expr>,
        index: Box<Expr>,
    },

    /// The field name is the runtime string key.
    FieldAccess {
        target: Box<Expr>,
        field: String,
    },

    // ─────────────────────────── Control flow ───────────────────────────
    /// Value of the last expression, or nil.
    Block(Vec<Expr>),

    If {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Option<Box<Expr>>,
    },

    While {
        condition: Box<Expr>,
        body: Box<Expr>,
    },

    /// More than one name unpacks each item.
    For {
        names: Vec<String>,
        iterable: Box<Expr>,
        body: Box<Expr>,
    },

    Break,
    Continue,
    Return(Option<Box<Expr>>),

    /// `try body catch binding { catch_body }`. The binding receives the
    /// error value.
    Try {
        body: Box<Expr>,
        catch_binding: Option<String>,
        catch_body: Box<Expr>,
    },

    // ───────────────────────────── Functions ────────────────────────────
    FunctionDefinition {
        id: FunctionId,
        name: String,
        parameters: Vec<String>,
        body: Box<Expr>,
    },

    /// Anonymous function. `captures` lists the enclosing variables the
    /// body reads or writes, as computed by the analyzer.
    Closure {
        parameters: Vec<String>,
        captures: Vec<String>,
        body: Box<Expr>,
    },

    Call {
        target: CallTarget,
        arguments: Vec<Expr>,
        /// Set by the analyzer when the call is the value of a top-level
        /// statement.
        is_root: bool,
    },
}

#[derive(Debug, Clone)]
pub enum CallTarget {
    /// A user-defined function.
    Function(FunctionId),
    /// Whatever function value the expression evaluates to.
    Value(Box<Expr>),
    Std(Arc<StdFunction>),
    Program(ProgramTarget),
}

/// An external program invocation.
#[derive(Debug, Clone)]
pub struct ProgramTarget {
    pub name: Box<Expr>,
    pub piped: Option<Box<Expr>>,
    pub environment: Vec<(String, Expr)>,
    pub redirect_stdout: bool,
    pub redirect_stderr: bool,
    pub disable_buffering: bool,
    /// Cleared for the upstream side of a lazy pipeline.
    pub auto_start: bool,
    pub background: bool,
}

impl ProgramTarget {
    pub fn new(name: &str) -> Self {
        ProgramTarget {
            name: Box::new(Expr::string(name)),
            piped: None,
            environment: Vec::new(),
            redirect_stdout: false,
            redirect_stderr: false,
            disable_buffering: false,
            auto_start: true,
            background: false,
        }
    }
}

impl ExprKind {
    /// Human-readable node name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ExprKind::Literal(_) => "literal",
            ExprKind::StringInterpolation(_) => "string",
            ExprKind::List(_) => "list",
            ExprKind::Tuple(_) => "tuple",
            ExprKind::Dictionary(_) => "dictionary",
            ExprKind::Set(_) => "set",
            ExprKind::Range { .. } => "range",
            ExprKind::Struct { .. } => "struct",
            ExprKind::Variable(_) => "variable",
            ExprKind::Let { .. } => "let",
            ExprKind::Assignment { .. } => "assignment",
            ExprKind::Binary { .. } => "binary expression",
            ExprKind::Unary { .. } => "unary expression",
            ExprKind::Cast { .. } => "cast",
            ExprKind::Indexer { .. } => "indexer",
            ExprKind::FieldAccess { .. } => "field access",
            ExprKind::Block(_) => "block",
            ExprKind::If { .. } => "if",
            ExprKind::While { .. } => "while",
            ExprKind::For { .. } => "for",
            ExprKind::Break => "break",
            ExprKind::Continue => "continue",
            ExprKind::Return(_) => "return",
            ExprKind::Try { .. } => "try",
            ExprKind::FunctionDefinition { .. } => "function definition",
            ExprKind::Closure { .. } => "closure",
            ExprKind::Call { .. } => "call",
        }
    }
}

impl Expr {
    /// Direct subexpressions that run as part of this node, in evaluation
    /// order. Function and closure bodies run in their own page and are
    /// not included.
    pub fn children(&self) -> Vec<&Expr> {
        fn boxed(expr: &Option<Box<Expr>>) -> Option<&Expr> {
            expr.as_deref()
        }

        match &self.kind {
            ExprKind::Literal(_)
            | ExprKind::Variable(_)
            | ExprKind::Break
            | ExprKind::Continue
            | ExprKind::FunctionDefinition { .. }
            | ExprKind::Closure { .. } => Vec::new(),
            ExprKind::StringInterpolation(items)
            | ExprKind::List(items)
            | ExprKind::Tuple(items)
            | ExprKind::Set(items)
            | ExprKind::Block(items) => items.iter().collect(),
            ExprKind::Dictionary(pairs) => pairs.iter().flat_map(|(k, v)| [k, v]).collect(),
            ExprKind::Range { from, to, .. } => boxed(from).into_iter().chain(boxed(to)).collect(),
            ExprKind::Struct { fields, .. } => fields.iter().map(|(_, value)| value).collect(),
            ExprKind::Let { value, .. } => vec![&**value],
            ExprKind::Assignment { target, value } => vec![&**target, &**value],
            ExprKind::Binary { lhs, rhs, .. } => vec![&**lhs, &**rhs],
            ExprKind::Unary { operand, .. } => vec![&**operand],
            ExprKind::Cast { value, .. } => vec![&**value],
            ExprKind::Indexer { target, index } => vec![&**target, &**index],
            ExprKind::FieldAccess { target, .. } => vec![&**target],
            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => [&**condition, &**then_branch]
                .into_iter()
                .chain(boxed(else_branch))
                .collect(),
            ExprKind::While { condition, body } => vec![&**condition, &**body],
            ExprKind::For { iterable, body, .. } => vec![&**iterable, &**body],
            ExprKind::Return(value) => boxed(value).into_iter().collect(),
            ExprKind::Try {
                body, catch_body, ..
            } => vec![&**body, &**catch_body],
            ExprKind::Call {
                target, arguments, ..
            } => {
                let mut children = Vec::new();
                match target {
                    CallTarget::Value(callee) => children.push(&**callee),
                    CallTarget::Program(program) => children.push(&*program.name),
                    CallTarget::Function(_) | CallTarget::Std(_) => {}
                }
                children.extend(arguments);
                if let CallTarget::Program(program) = target {
                    children.extend(boxed(&program.piped));
                    children.extend(program.environment.iter().map(|(_, value)| value));
                }
                children
            }
        }
    }

    pub fn new(kind: ExprKind, line: u32) -> Self {
        Expr { kind, line }
    }

    pub fn at(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    pub fn nil() -> Self {
        Expr::new(ExprKind::Literal(Literal::Nil), 0)
    }

    pub fn bool(value: bool) -> Self {
        Expr::new(ExprKind::Literal(Literal::Boolean(value)), 0)
    }

    pub fn int(value: i64) -> Self {
        Expr::new(ExprKind::Literal(Literal::Integer(value)), 0)
    }

    pub fn float(value: f64) -> Self {
        Expr::new(ExprKind::Literal(Literal::Float(value)), 0)
    }

    pub fn string(value: &str) -> Self {
        Expr::new(ExprKind::Literal(Literal::String(value.to_string())), 0)
    }

    pub fn var(name: &str) -> Self {
        Expr::new(ExprKind::Variable(name.to_string()), 0)
    }

    pub fn list(items: Vec<Expr>) -> Self {
        Expr::new(ExprKind::List(items), 0)
    }

    pub fn let_(name: &str, value: Expr) -> Self {
        Expr::new(
            ExprKind::Let {
                names: vec![name.to_string()],
                value: Box::new(value),
            },
            0,
        )
    }

    pub fn assign(target: Expr, value: Expr) -> Self {
        Expr::new(
            ExprKind::Assignment {
                target: Box::new(target),
                value: Box::new(value),
            },
            0,
        )
    }

    pub fn binary(lhs: Expr, op: BinaryOperation, rhs: Expr) -> Self {
        Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            0,
        )
    }

    pub fn unary(op: UnaryOperation, operand: Expr) -> Self {
        Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            0,
        )
    }

    pub fn index(target: Expr, index: Expr) -> Self {
        Expr::new(
            ExprKind::Indexer {
                target: Box::new(target),
                index: Box::new(index),
            },
            0,
        )
    }

    pub fn block(items: Vec<Expr>) -> Self {
        Expr::new(ExprKind::Block(items), 0)
    }

    pub fn if_(condition: Expr, then_branch: Expr, else_branch: Option<Expr>) -> Self {
        Expr::new(
            ExprKind::If {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch: else_branch.map(Box::new),
            },
            0,
        )
    }

    pub fn while_(condition: Expr, body: Expr) -> Self {
        Expr::new(
            ExprKind::While {
                condition: Box::new(condition),
                body: Box::new(body),
            },
            0,
        )
    }

    pub fn for_(name: &str, iterable: Expr, body: Expr) -> Self {
        Expr::new(
            ExprKind::For {
                names: vec![name.to_string()],
                iterable: Box::new(iterable),
                body: Box::new(body),
            },
            0,
        )
    }

    pub fn function(id: FunctionId, name: &str, parameters: &[&str], body: Expr) -> Self {
        Expr::new(
            ExprKind::FunctionDefinition {
                id,
                name: name.to_string(),
                parameters: parameters.iter().map(|p| p.to_string()).collect(),
                body: Box::new(body),
            },
            0,
        )
    }

    pub fn call(target: CallTarget, arguments: Vec<Expr>) -> Self {
        Expr::new(
            ExprKind::Call {
                target,
                arguments,
                is_root: false,
            },
            0,
        )
    }

    pub fn root_call(target: CallTarget, arguments: Vec<Expr>) -> Self {
        Expr::new(
            ExprKind::Call {
                target,
                arguments,
                is_root: true,
            },
            0,
        )
    }

    /// Whether evaluating this node leaves a value on the stack.
    pub fn produces_value(&self) -> bool {
        !matches!(
            self.kind,
            ExprKind::Let { .. }
                | ExprKind::While { .. }
                | ExprKind::For { .. }
                | ExprKind::FunctionDefinition { .. }
                | ExprKind::Break
                | ExprKind::Continue
                | ExprKind::Return(_)
        )
    }
}
