use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, trace};

use crate::bytecode::ir::{Constant, Page, Program};
use crate::bytecode::op::{Instruction, Op, RANGE_HAS_FROM, RANGE_HAS_TO, RANGE_INCLUSIVE};
use crate::lang::operator::{BinaryOperation, UnaryOperation};
use crate::lang::value::{Cell, Function, Range, StructValue, Value, ValueType};
use crate::process::{self, CallFlags, PipedInput, ProgramCall};
use crate::runtime::frame::{Frame, Handler};
use crate::runtime::iter::Iter;
use crate::runtime::runtime_error::{ErrorKind, RuntimeError, RuntimeResult, TraceFrame};

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub max_stack_size: usize,
    pub max_steps: Option<usize>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 1000,
            max_stack_size: 100_000,
            max_steps: None,
        }
    }
}

/// Stack machine executing compiled pages.
///
/// Calls push a [`Frame`] instead of recursing, so native stack usage does
/// not grow with script call depth.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    iterators: Vec<Iter>,
    handlers: Vec<Handler>,
    /// Cells queued by `CaptureLocal`/`CaptureOuter` for the next closure.
    pending_captures: Vec<Cell>,
    config: VmConfig,
    steps: usize,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Vm {
            stack: Vec::new(),
            frames: Vec::new(),
            iterators: Vec::new(),
            handlers: Vec::new(),
            pending_captures: Vec::new(),
            config,
            steps: 0,
        }
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn reset_execution_state(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.iterators.clear();
        self.handlers.clear();
        self.pending_captures.clear();
        self.steps = 0;
    }

    /// Run the page at `entry` as a root frame and return its value.
    pub fn execute(&mut self, program: &Program, entry: u16) -> RuntimeResult<Value> {
        self.reset_execution_state();
        if program.page(entry).is_none() {
            return Err(RuntimeError::internal(format!(
                "entry page {} does not exist",
                entry
            )));
        }

        self.frames.push(Frame::new(entry, 0, true));
        let result = self.run(program).map(|()| self.stack.pop().unwrap_or(Value::Nil));
        self.reset_execution_state();
        result
    }

    /// Call a function value from the host. The call gets its own stacks,
    /// so it may be made while another execution is suspended.
    pub fn call_function(
        &self,
        program: &Program,
        function: &Value,
        arguments: Vec<Value>,
    ) -> RuntimeResult<Value> {
        let mut vm = Vm::with_config(self.config.clone());
        let argc = arguments.len();
        vm.stack.extend(arguments);
        vm.call(program, function.clone(), argc, false)?;
        vm.run(program)?;
        vm.pop()
    }

    fn run(&mut self, program: &Program) -> RuntimeResult<()> {
        while !self.frames.is_empty() {
            if let Err(err) = self.step(program) {
                self.recover(program, err)?;
            }
        }
        Ok(())
    }

    /// Unwind to the innermost `try` region, or give the error back with
    /// its call trace when there is none.
    fn recover(&mut self, program: &Program, err: RuntimeError) -> RuntimeResult<()> {
        let err = err.with_trace(self.trace(program));
        if !err.is_catchable() {
            return Err(err);
        }
        let Some(handler) = self.handlers.pop() else {
            return Err(err);
        };

        debug!(error = %err.kind, depth = handler.frame_depth, "caught runtime error");
        self.frames.truncate(handler.frame_depth);
        self.stack.truncate(handler.stack_height);
        self.iterators.truncate(handler.iter_depth);
        self.jump(handler.catch_ip)?;
        self.stack
            .push(Value::error(Value::string(err.message()), Some(err.trace)));
        Ok(())
    }

    fn trace(&self, program: &Program) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let page = program.page(frame.page);
                TraceFrame {
                    page: page
                        .map(|p| p.name.clone())
                        .unwrap_or_else(|| format!("<page {}>", frame.page)),
                    line: page.and_then(|p| p.line_at(frame.ip.saturating_sub(1))),
                }
            })
            .collect()
    }

    fn check_limits(&mut self) -> RuntimeResult<()> {
        self.steps += 1;
        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                return Err(ErrorKind::LimitExceeded { limit: "step", max }.into());
            }
        }
        if self.stack.len() > self.config.max_stack_size {
            return Err(ErrorKind::LimitExceeded {
                limit: "stack size",
                max: self.config.max_stack_size,
            }
            .into());
        }
        Ok(())
    }

    fn step(&mut self, program: &Program) -> RuntimeResult<()> {
        self.check_limits()?;

        let frame = self.frame_mut()?;
        let page = program
            .page(frame.page)
            .ok_or_else(|| RuntimeError::internal(format!("page {} does not exist", frame.page)))?;

        let offset = frame.ip;
        if offset >= page.code.len() {
            self.pop_frame();
            return Ok(());
        }

        let op = Op::try_from(page.code[offset]).map_err(|byte| {
            RuntimeError::internal(format!("unknown opcode 0x{:02x} at {}", byte, offset))
        })?;
        let end = offset + 1 + op.operand_width();
        let operands = page.code.get(offset + 1..end).ok_or_else(|| {
            RuntimeError::internal(format!("truncated {} instruction at {}", op, offset))
        })?;
        frame.ip = end;

        self.execute_instruction(
            program,
            page,
            Instruction {
                offset,
                op,
                operands,
            },
        )
    }

    fn pop_frame(&mut self) {
        if let Some(frame) = self.frames.pop() {
            trace!(page = frame.page, depth = self.frames.len(), "frame popped");
        }
        let depth = self.frames.len();
        self.handlers.retain(|handler| handler.frame_depth <= depth);
    }

    fn execute_instruction(
        &mut self,
        program: &Program,
        page: &Page,
        instruction: Instruction<'_>,
    ) -> RuntimeResult<()> {
        match instruction.op {
            // ─────────────────────── Stack operations ───────────────────────
            Op::Nop => {}
            Op::Pop => {
                self.pop()?;
            }
            Op::PopN => {
                self.pop_n(usize::from(instruction.byte(0)))?;
            }
            Op::Unwind => {
                let top = self.pop()?;
                self.pop_n(usize::from(instruction.byte(0)))?;
                self.stack.push(top);
            }
            Op::Const => {
                let value = self.constant_value(program, page, instruction.word(0))?;
                self.stack.push(value);
            }
            Op::Load => {
                let slot = self.slot(instruction.byte(0))?;
                let value = self.stack[slot].clone();
                self.stack.push(value);
            }
            Op::Store => {
                let slot = self.slot(instruction.byte(0))?;
                let value = self.peek()?.clone();
                self.stack[slot] = value;
            }
            Op::LoadCapture => {
                let value = self.capture(instruction.byte(0))?.borrow().clone();
                self.stack.push(value);
            }
            Op::StoreCapture => {
                let value = self.peek()?.clone();
                *self.capture(instruction.byte(0))?.borrow_mut() = value;
            }
            Op::MakeCell => {
                let slot = instruction.byte(0);
                let value = self.stack[self.slot(slot)?].clone();
                self.frame_mut()?.set_cell(slot, Rc::new(RefCell::new(value)));
            }
            Op::LoadCell => {
                let value = self.cell(instruction.byte(0))?.borrow().clone();
                self.stack.push(value);
            }
            Op::StoreCell => {
                let value = self.peek()?.clone();
                *self.cell(instruction.byte(0))?.borrow_mut() = value;
            }
            Op::CaptureLocal => {
                let cell = self.cell(instruction.byte(0))?;
                self.pending_captures.push(cell);
            }
            Op::CaptureOuter => {
                let cell = self.capture(instruction.byte(0))?;
                self.pending_captures.push(cell);
            }

            // ─────────────────────── Indexing ───────────────────────────────
            Op::Index => {
                let index = self.pop()?;
                let target = self.pop()?;
                self.stack.push(target.index(&index)?);
            }
            Op::IndexStore => {
                let index = self.pop()?;
                let target = self.pop()?;
                let value = self.pop()?;
                target.index_store(&index, value.clone())?;
                self.stack.push(value);
            }

            // ─────────────────────── Operators ──────────────────────────────
            Op::Negate | Op::Not => {
                let operand = self.pop()?;
                let op = if instruction.op == Op::Negate {
                    UnaryOperation::Negate
                } else {
                    UnaryOperation::Not
                };
                self.stack.push(operand.unary_op(op)?);
            }
            Op::Cast => {
                let to = ValueType::from_tag(instruction.byte(0)).ok_or_else(|| {
                    RuntimeError::internal(format!("unknown type tag {}", instruction.byte(0)))
                })?;
                let value = self.pop()?;
                self.stack.push(value.cast(to)?);
            }

            // ─────────────────────── Builders ───────────────────────────────
            Op::BuildList => {
                let items = self.pop_n(usize::from(instruction.word(0)))?;
                self.stack.push(Value::list(items));
            }
            Op::BuildTuple => {
                let items = self.pop_n(usize::from(instruction.word(0)))?;
                self.stack.push(Value::tuple(items));
            }
            Op::BuildSet => {
                let items = self.pop_n(usize::from(instruction.word(0)))?;
                let keys = items
                    .iter()
                    .map(Value::to_hash_key)
                    .collect::<RuntimeResult<IndexSet<_>>>()?;
                self.stack.push(Value::set(keys));
            }
            Op::BuildDict => {
                let items = self.pop_n(usize::from(instruction.word(0)) * 2)?;
                let mut entries = IndexMap::new();
                let mut items = items.into_iter();
                while let (Some(key), Some(value)) = (items.next(), items.next()) {
                    entries.insert(key.to_hash_key()?, value);
                }
                self.stack.push(Value::dictionary(entries));
            }
            Op::BuildString => {
                let parts = self.pop_n(usize::from(instruction.word(0)))?;
                let mut text = String::new();
                for part in &parts {
                    text.push_str(&part.to_text()?);
                }
                self.stack.push(Value::string(text));
            }
            Op::BuildRange => {
                let flags = instruction.byte(0);
                let to = match flags & RANGE_HAS_TO != 0 {
                    true => Some(range_bound(self.pop()?)?),
                    false => None,
                };
                let from = match flags & RANGE_HAS_FROM != 0 {
                    true => Some(range_bound(self.pop()?)?),
                    false => None,
                };
                let range = if flags & RANGE_INCLUSIVE != 0 {
                    Range::inclusive(from, to, None)
                } else {
                    Range::new(from, to, None)
                };
                self.stack.push(Value::Range(range));
            }
            Op::BuildStruct => {
                let Some(Constant::StructShape { name, fields }) =
                    page.constants.get(instruction.word(0))
                else {
                    return Err(RuntimeError::internal("BuildStruct without a struct shape"));
                };
                let values = self.pop_n(fields.len())?;
                let fields: IndexMap<String, Value> =
                    fields.iter().cloned().zip(values).collect();
                self.stack
                    .push(Value::Struct(Rc::new(StructValue::new(name.clone(), fields))));
            }
            Op::Unpack => {
                let expected = usize::from(instruction.byte(0));
                let items = self.pop()?.collect_items()?;
                if items.len() != expected {
                    return Err(ErrorKind::Unpack {
                        expected,
                        got: items.len(),
                    }
                    .into());
                }
                self.stack.extend(items);
            }
            Op::MakeClosure => {
                let Some(Constant::Page(index)) = page.constants.get(instruction.word(0)) else {
                    return Err(RuntimeError::internal("MakeClosure without a page"));
                };
                let count = usize::from(instruction.byte(2));
                let start = self
                    .pending_captures
                    .len()
                    .checked_sub(count)
                    .ok_or_else(|| RuntimeError::internal("MakeClosure without its captures"))?;
                let environment: Rc<[Cell]> = self.pending_captures.drain(start..).collect();
                self.stack.push(Value::Function(Function::Closure {
                    index: *index,
                    environment,
                }));
            }

            // ─────────────────────── Jumps ──────────────────────────────────
            Op::Jump | Op::JumpBackward => self.jump_to(&instruction)?,
            Op::JumpIf | Op::JumpIfNot => {
                let truthy = self.peek()?.to_bool();
                if truthy == (instruction.op == Op::JumpIf) {
                    self.jump_to(&instruction)?;
                }
            }
            Op::PopJumpIf | Op::PopJumpIfNot => {
                let truthy = self.pop()?.to_bool();
                if truthy == (instruction.op == Op::PopJumpIf) {
                    self.jump_to(&instruction)?;
                }
            }

            // ─────────────────────── Iteration ──────────────────────────────
            Op::GetIter => {
                let iterable = self.pop()?;
                self.iterators.push(Iter::new(&iterable)?);
            }
            Op::ForIter => {
                let iter = self
                    .iterators
                    .last_mut()
                    .ok_or_else(|| RuntimeError::internal("ForIter without an iterator"))?;
                match iter.next()? {
                    Some(item) => self.stack.push(item),
                    None => self.jump_to(&instruction)?,
                }
            }
            Op::EndFor => {
                self.iterators
                    .pop()
                    .ok_or_else(|| RuntimeError::internal("EndFor without an iterator"))?;
            }

            // ─────────────────────── Calls ──────────────────────────────────
            Op::Call | Op::RootCall | Op::MaybeRootCall => {
                let argc = usize::from(instruction.byte(0));
                let root = self.root_flag(instruction.op)?;
                let callee_at = self
                    .stack
                    .len()
                    .checked_sub(argc + 1)
                    .ok_or_else(stack_underflow)?;
                let callee = self.stack.remove(callee_at);
                self.call(program, callee, argc, root)?;
            }
            Op::CallStd => {
                let Some(Constant::StdFunction(index)) = page.constants.get(instruction.word(0))
                else {
                    return Err(RuntimeError::internal("CallStd without a library function"));
                };
                let function = program.library_function(*index)?;
                let arguments = self.pop_n(usize::from(instruction.byte(2)))?;
                trace!(function = function.name(), "library call");
                self.stack.push(function.call(arguments)?);
            }
            Op::CallProgram | Op::RootCallProgram | Op::MaybeRootCallProgram => {
                let root = self.root_flag(instruction.op)?;
                let value = self.call_program(&instruction, root)?;
                self.stack.push(value);
            }
            Op::Ret => {
                self.frame_mut()?.ip = page.code.len();
            }

            // ─────────────────────── Error boundaries ───────────────────────
            Op::Try => {
                let catch_ip = instruction
                    .jump_target()
                    .ok_or_else(|| RuntimeError::internal("Try without a target"))?;
                self.handlers.push(Handler {
                    frame_depth: self.frames.len(),
                    stack_height: self.stack.len(),
                    iter_depth: self.iterators.len(),
                    catch_ip,
                });
            }
            Op::EndTry => {
                self.handlers
                    .pop()
                    .ok_or_else(|| RuntimeError::internal("EndTry without a try region"))?;
            }

            op => {
                let operation = binary_operation(op)
                    .ok_or_else(|| RuntimeError::internal(format!("unhandled opcode {}", op)))?;
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.stack.push(lhs.binary_op(operation, &rhs)?);
            }
        }
        Ok(())
    }

    // ─────────────────────────── Calls ──────────────────────────────────

    /// Root-ness of a call: explicit for `Call`/`RootCall`, inherited from
    /// the calling frame for the `MaybeRoot` variants.
    fn root_flag(&self, op: Op) -> RuntimeResult<bool> {
        Ok(match op {
            Op::RootCall | Op::RootCallProgram => true,
            Op::MaybeRootCall | Op::MaybeRootCallProgram => self.frame()?.is_root,
            _ => false,
        })
    }

    /// Call `callee` with the top `argc` values as arguments. Pages get a
    /// new frame; library functions run to completion here.
    fn call(&mut self, program: &Program, callee: Value, argc: usize, root: bool) -> RuntimeResult<()> {
        let (index, captures) = match callee {
            Value::Function(Function::Page { index, .. }) => (index, None),
            Value::Function(Function::Closure { index, environment }) => (index, Some(environment)),
            Value::Function(Function::Std(function)) => {
                let arguments = self.pop_n(argc)?;
                self.stack.push(function.call(arguments)?);
                return Ok(());
            }
            other => return Err(ErrorKind::NotCallable(other.type_name()).into()),
        };

        let page = program
            .page(index)
            .ok_or_else(|| RuntimeError::internal(format!("page {} does not exist", index)))?;
        if argc != usize::from(page.arity) {
            return Err(ErrorKind::ArgumentCount {
                name: page.name.clone(),
                expected: page.arity.to_string(),
                got: argc,
            }
            .into());
        }
        if self.frames.len() >= self.config.max_call_depth {
            return Err(ErrorKind::LimitExceeded {
                limit: "call depth",
                max: self.config.max_call_depth,
            }
            .into());
        }

        let base = self.stack.len().checked_sub(argc).ok_or_else(stack_underflow)?;
        trace!(page = %page.name, argc, root, depth = self.frames.len() + 1, "call");
        self.frames
            .push(Frame::new(index, base, root).with_captures(captures));
        Ok(())
    }

    /// Pops, top first: environment pairs, the piped value, the arguments
    /// and the program name.
    fn call_program(&mut self, instruction: &Instruction<'_>, root: bool) -> RuntimeResult<Value> {
        let argc = usize::from(instruction.byte(0));
        let flags = CallFlags::from_bits(instruction.word(1));
        let envc = usize::from(instruction.byte(3));

        let environment = self.pop_n(envc * 2)?;
        let piped = match flags.contains(CallFlags::HAS_PIPED_VALUE) {
            true => Some(self.pop()?),
            false => None,
        };
        let arguments = self.pop_n(argc)?;
        let name = self.pop()?.to_text()?;

        let mut call = ProgramCall::new(name);
        for argument in &arguments {
            call.push_value_argument(argument)?;
        }
        for pair in environment.chunks(2) {
            if let [key, value] = pair {
                call.environment.push((key.to_text()?, value.to_text()?));
            }
        }
        if let Some(piped) = &piped {
            call.piped = Some(PipedInput::from_value(piped)?);
        }

        process::run(call, flags, root)
    }

    // ─────────────────────────── Helpers ────────────────────────────────

    fn frame(&self) -> RuntimeResult<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| RuntimeError::internal("no active frame"))
    }

    fn frame_mut(&mut self) -> RuntimeResult<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| RuntimeError::internal("no active frame"))
    }

    fn jump(&mut self, target: usize) -> RuntimeResult<()> {
        self.frame_mut()?.ip = target;
        Ok(())
    }

    fn jump_to(&mut self, instruction: &Instruction<'_>) -> RuntimeResult<()> {
        let target = instruction.jump_target().ok_or_else(|| {
            RuntimeError::internal(format!("jump before page start at {}", instruction.offset))
        })?;
        self.jump(target)
    }

    /// Absolute stack index of a local slot.
    fn slot(&self, slot: u8) -> RuntimeResult<usize> {
        let index = self.frame()?.base + usize::from(slot);
        if index >= self.stack.len() {
            return Err(RuntimeError::internal(format!("local slot {} is not on the stack", slot)));
        }
        Ok(index)
    }

    /// Cell of a captured variable in the current closure's environment.
    fn capture(&self, index: u8) -> RuntimeResult<Cell> {
        let captures = self
            .frame()?
            .captures
            .as_ref()
            .ok_or_else(|| RuntimeError::internal("capture access outside a closure"))?;
        captures
            .get(usize::from(index))
            .cloned()
            .ok_or_else(|| RuntimeError::internal("capture index out of range"))
    }

    /// Cell of a boxed local in the current frame.
    fn cell(&self, slot: u8) -> RuntimeResult<Cell> {
        self.frame()?
            .cell(slot)
            .cloned()
            .ok_or_else(|| RuntimeError::internal(format!("local slot {} is not boxed", slot)))
    }

    fn constant_value(&self, program: &Program, page: &Page, key: u16) -> RuntimeResult<Value> {
        let constant = page
            .constants
            .get(key)
            .ok_or_else(|| RuntimeError::internal(format!("constant {} out of range", key)))?;

        Ok(match constant {
            Constant::Nil => Value::Nil,
            Constant::Boolean(b) => Value::Boolean(*b),
            Constant::Integer(n) => Value::Integer(*n),
            Constant::Float(n) => Value::Float(*n),
            Constant::String(s) => Value::string(s),
            Constant::Page(index) => {
                let name = program
                    .page(*index)
                    .map(|p| p.name.as_str())
                    .unwrap_or("<function>");
                Value::Function(Function::Page {
                    index: *index,
                    name: Rc::from(name),
                })
            }
            Constant::StdFunction(index) => {
                Value::Function(Function::Std(Arc::clone(program.library_function(*index)?)))
            }
            Constant::StructShape { .. } => {
                return Err(RuntimeError::internal("struct shape used as a value"));
            }
        })
    }

    fn pop(&mut self) -> RuntimeResult<Value> {
        self.stack.pop().ok_or_else(stack_underflow)
    }

    fn peek(&self) -> RuntimeResult<&Value> {
        self.stack.last().ok_or_else(stack_underflow)
    }

    /// Remove the top `count` values, oldest first.
    fn pop_n(&mut self, count: usize) -> RuntimeResult<Vec<Value>> {
        let at = self
            .stack
            .len()
            .checked_sub(count)
            .ok_or_else(stack_underflow)?;
        Ok(self.stack.split_off(at))
    }
}

fn stack_underflow() -> RuntimeError {
    RuntimeError::internal("operand stack underflow")
}

fn range_bound(value: Value) -> RuntimeResult<i64> {
    value.as_integer().ok_or_else(|| {
        ErrorKind::Cast {
            from: value.type_name(),
            to: "Integer",
        }
        .into()
    })
}

fn binary_operation(op: Op) -> Option<BinaryOperation> {
    Some(match op {
        Op::Add => BinaryOperation::Add,
        Op::Sub => BinaryOperation::Subtract,
        Op::Mul => BinaryOperation::Multiply,
        Op::Div => BinaryOperation::Divide,
        Op::Mod => BinaryOperation::Modulo,
        Op::Pow => BinaryOperation::Power,
        Op::Equal => BinaryOperation::Equal,
        Op::NotEqual => BinaryOperation::NotEqual,
        Op::Less => BinaryOperation::Less,
        Op::LessEqual => BinaryOperation::LessEqual,
        Op::Greater => BinaryOperation::Greater,
        Op::GreaterEqual => BinaryOperation::GreaterEqual,
        Op::And => BinaryOperation::And,
        Op::Or => BinaryOperation::Or,
        Op::Contains => BinaryOperation::In,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::Compiler;
    use crate::lang::node::{CallTarget, Expr, ExprKind, ProgramTarget};
    use crate::lang::std_fn::Library;

    fn run_with_config(ast: &Expr, config: VmConfig) -> RuntimeResult<Value> {
        let program = Compiler::new().compile_program(ast).unwrap();
        let mut vm = Vm::with_config(config);
        let result = vm.execute(&program, 0);
        assert!(vm.stack().is_empty());
        result
    }

    fn run(ast: &Expr) -> RuntimeResult<Value> {
        run_with_config(ast, VmConfig::default())
    }

    fn assert_value(ast: Expr, expected: Value) {
        assert_eq!(run(&ast).unwrap(), expected);
    }

    fn assert_error(ast: Expr, error_contains: &str) {
        match run(&ast) {
            Ok(value) => panic!("expected error containing '{}', got {}", error_contains, value),
            Err(err) => assert!(
                err.to_string().contains(error_contains),
                "expected error containing '{}', got: {}",
                error_contains,
                err
            ),
        }
    }

    fn bin(lhs: Expr, op: BinaryOperation, rhs: Expr) -> Expr {
        Expr::binary(lhs, op, rhs)
    }

    fn ret(value: Expr) -> Expr {
        Expr::new(ExprKind::Return(Some(Box::new(value))), 0)
    }

    fn try_catch(body: Expr, binding: Option<&str>, catch_body: Expr) -> Expr {
        Expr::new(
            ExprKind::Try {
                body: Box::new(body),
                catch_binding: binding.map(str::to_string),
                catch_body: Box::new(catch_body),
            },
            0,
        )
    }

    fn closure(parameters: &[&str], captures: &[&str], body: Expr) -> Expr {
        Expr::new(
            ExprKind::Closure {
                parameters: parameters.iter().map(|p| p.to_string()).collect(),
                captures: captures.iter().map(|c| c.to_string()).collect(),
                body: Box::new(body),
            },
            0,
        )
    }

    fn increment(name: &str, by: Expr) -> Expr {
        Expr::assign(Expr::var(name), bin(Expr::var(name), BinaryOperation::Add, by))
    }

    fn program(name: &str, arguments: &[&str]) -> (ProgramTarget, Vec<Expr>) {
        (
            ProgramTarget::new(name),
            arguments.iter().map(|a| Expr::string(a)).collect(),
        )
    }

    fn program_call(target: ProgramTarget, arguments: Vec<Expr>) -> Expr {
        Expr::call(CallTarget::Program(target), arguments)
    }

    // ─────────────────────────── Expressions ────────────────────────────

    #[test]
    fn test_addition() {
        assert_value(bin(Expr::int(1), BinaryOperation::Add, Expr::int(2)), Value::Integer(3));
    }

    #[test]
    fn test_division_yields_float() {
        assert_value(
            bin(Expr::int(7), BinaryOperation::Divide, Expr::int(2)),
            Value::Float(3.5),
        );
    }

    #[test]
    fn test_division_by_zero() {
        assert_error(
            bin(Expr::int(1), BinaryOperation::Divide, Expr::int(0)),
            "division by zero",
        );
    }

    #[test]
    fn test_locals_and_assignment() {
        assert_value(
            Expr::block(vec![
                Expr::let_("x", Expr::int(5)),
                increment("x", Expr::int(1)),
                Expr::var("x"),
            ]),
            Value::Integer(6),
        );
    }

    #[test]
    fn test_nested_block_scopes() {
        // let a = 1; let b = { let a = 10; a + 1 }; a + b
        assert_value(
            Expr::block(vec![
                Expr::let_("a", Expr::int(1)),
                Expr::let_(
                    "b",
                    Expr::block(vec![
                        Expr::let_("a", Expr::int(10)),
                        bin(Expr::var("a"), BinaryOperation::Add, Expr::int(1)),
                    ]),
                ),
                bin(Expr::var("a"), BinaryOperation::Add, Expr::var("b")),
            ]),
            Value::Integer(12),
        );
    }

    #[test]
    fn test_short_circuit() {
        // nil and (1 / 0)
        assert_value(
            bin(
                Expr::nil(),
                BinaryOperation::And,
                bin(Expr::int(1), BinaryOperation::Divide, Expr::int(0)),
            ),
            Value::Boolean(false),
        );
        assert_value(
            bin(Expr::bool(false), BinaryOperation::Or, Expr::string("x")),
            Value::Boolean(true),
        );
    }

    #[test]
    fn test_in_operator() {
        assert_value(
            bin(
                Expr::int(2),
                BinaryOperation::In,
                Expr::list(vec![Expr::int(1), Expr::int(2)]),
            ),
            Value::Boolean(true),
        );
    }

    #[test]
    fn test_string_interpolation() {
        let ast = Expr::new(
            ExprKind::StringInterpolation(vec![Expr::string("a"), Expr::int(1), Expr::string("b")]),
            0,
        );
        assert_value(ast, Value::string("a1b"));
    }

    #[test]
    fn test_cast() {
        let ast = Expr::new(
            ExprKind::Cast {
                value: Box::new(Expr::string("42")),
                to: ValueType::Integer,
            },
            0,
        );
        assert_value(ast, Value::Integer(42));
    }

    #[test]
    fn test_inclusive_ranges() {
        let range = |from, to| {
            Expr::new(
                ExprKind::Range {
                    from: Some(Box::new(Expr::int(from))),
                    to: Some(Box::new(Expr::int(to))),
                    inclusive: true,
                },
                0,
            )
        };
        assert_value(range(1, 3), Value::Range(Range::inclusive(Some(1), Some(3), None)));
        assert_value(range(3, 1), Value::Range(Range::inclusive(Some(3), Some(1), None)));

        // let xs = [1, 2, 3]; xs[0..=-1]
        let ast = Expr::block(vec![
            Expr::let_("xs", Expr::list(vec![Expr::int(1), Expr::int(2), Expr::int(3)])),
            Expr::index(Expr::var("xs"), range(0, -1)),
        ]);
        assert_value(
            ast,
            Value::list(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]),
        );
    }

    #[test]
    fn test_list_index_store() {
        let ast = Expr::block(vec![
            Expr::let_("l", Expr::list(vec![Expr::int(1), Expr::int(2)])),
            Expr::assign(Expr::index(Expr::var("l"), Expr::int(0)), Expr::int(5)),
            Expr::index(Expr::var("l"), Expr::int(-2)),
        ]);
        assert_value(ast, Value::Integer(5));
    }

    #[test]
    fn test_struct_fields() {
        let point = Expr::new(
            ExprKind::Struct {
                name: "Point".to_string(),
                fields: vec![("x".to_string(), Expr::int(1)), ("y".to_string(), Expr::int(2))],
            },
            0,
        );
        let field = |name: &str| {
            Expr::new(
                ExprKind::FieldAccess {
                    target: Box::new(Expr::var("p")),
                    field: name.to_string(),
                },
                0,
            )
        };
        let ast = Expr::block(vec![
            Expr::let_("p", point),
            Expr::assign(field("x"), Expr::int(10)),
            bin(field("x"), BinaryOperation::Add, field("y")),
        ]);
        assert_value(ast, Value::Integer(12));
    }

    #[test]
    fn test_destructuring_let() {
        let ast = Expr::block(vec![
            Expr::new(
                ExprKind::Let {
                    names: vec!["a".to_string(), "b".to_string()],
                    value: Box::new(Expr::new(
                        ExprKind::Tuple(vec![Expr::int(3), Expr::int(4)]),
                        0,
                    )),
                },
                0,
            ),
            bin(Expr::var("a"), BinaryOperation::Multiply, Expr::var("b")),
        ]);
        assert_value(ast, Value::Integer(12));
    }

    #[test]
    fn test_unpack_count_mismatch() {
        let ast = Expr::new(
            ExprKind::Let {
                names: vec!["a".to_string(), "b".to_string()],
                value: Box::new(Expr::list(vec![Expr::int(1)])),
            },
            0,
        );
        assert_error(ast, "expected 2 values to unpack, got 1");
    }

    // ─────────────────────────── Loops ──────────────────────────────────

    #[test]
    fn test_while_loop() {
        let ast = Expr::block(vec![
            Expr::let_("i", Expr::int(0)),
            Expr::let_("sum", Expr::int(0)),
            Expr::while_(
                bin(Expr::var("i"), BinaryOperation::Less, Expr::int(5)),
                Expr::block(vec![increment("sum", Expr::var("i")), increment("i", Expr::int(1))]),
            ),
            Expr::var("sum"),
        ]);
        assert_value(ast, Value::Integer(10));
    }

    #[test]
    fn test_while_false_runs_zero_times() {
        let ast = Expr::block(vec![
            Expr::let_("n", Expr::int(0)),
            Expr::while_(Expr::bool(false), increment("n", Expr::int(1))),
            Expr::var("n"),
        ]);
        assert_value(ast, Value::Integer(0));
    }

    #[test]
    fn test_empty_for_keeps_stack_height() {
        let ast = Expr::block(vec![
            Expr::let_("a", Expr::int(1)),
            Expr::for_("x", Expr::list(vec![]), Expr::var("x")),
            Expr::let_("b", Expr::int(2)),
            bin(Expr::var("a"), BinaryOperation::Add, Expr::var("b")),
        ]);
        assert_value(ast, Value::Integer(3));
    }

    #[test]
    fn test_for_over_range() {
        let range = Expr::new(
            ExprKind::Range {
                from: Some(Box::new(Expr::int(0))),
                to: Some(Box::new(Expr::int(5))),
                inclusive: false,
            },
            0,
        );
        let ast = Expr::block(vec![
            Expr::let_("sum", Expr::int(0)),
            Expr::for_("x", range, increment("sum", Expr::var("x"))),
            Expr::var("sum"),
        ]);
        assert_value(ast, Value::Integer(10));
    }

    #[test]
    fn test_for_with_break_and_continue() {
        // for x in [1, 2, 3, 4, 5] { if x == 2 { continue }; if x == 4 { break }; sum = sum + x }
        let is = |n| bin(Expr::var("x"), BinaryOperation::Equal, Expr::int(n));
        let body = Expr::block(vec![
            Expr::if_(is(2), Expr::new(ExprKind::Continue, 0), None),
            Expr::if_(is(4), Expr::new(ExprKind::Break, 0), None),
            increment("sum", Expr::var("x")),
        ]);
        let ast = Expr::block(vec![
            Expr::let_("sum", Expr::int(0)),
            Expr::for_("x", Expr::list((1..=5).map(Expr::int).collect()), body),
            Expr::var("sum"),
        ]);
        assert_value(ast, Value::Integer(4));
    }

    #[test]
    fn test_for_destructures_dictionary_entries() {
        let dict = Expr::new(
            ExprKind::Dictionary(vec![
                (Expr::string("a"), Expr::int(1)),
                (Expr::string("b"), Expr::int(2)),
            ]),
            0,
        );
        let ast = Expr::block(vec![
            Expr::let_("sum", Expr::int(0)),
            Expr::new(
                ExprKind::For {
                    names: vec!["k".to_string(), "v".to_string()],
                    iterable: Box::new(dict),
                    body: Box::new(increment("sum", Expr::var("v"))),
                },
                0,
            ),
            Expr::var("sum"),
        ]);
        assert_value(ast, Value::Integer(3));
    }

    #[test]
    fn test_nested_loops_with_break() {
        let inner = Expr::for_(
            "y",
            Expr::list(vec![Expr::int(10), Expr::int(20)]),
            Expr::block(vec![
                increment("sum", Expr::var("y")),
                Expr::new(ExprKind::Break, 0),
            ]),
        );
        let ast = Expr::block(vec![
            Expr::let_("sum", Expr::int(0)),
            Expr::for_("x", Expr::list(vec![Expr::int(1), Expr::int(2)]), inner),
            Expr::var("sum"),
        ]);
        assert_value(ast, Value::Integer(20));
    }

    // ─────────────────────────── Functions ──────────────────────────────

    #[test]
    fn test_function_call() {
        let ast = Expr::block(vec![
            Expr::function(
                0,
                "add",
                &["a", "b"],
                bin(Expr::var("a"), BinaryOperation::Add, Expr::var("b")),
            ),
            Expr::call(CallTarget::Function(0), vec![Expr::int(1), Expr::int(2)]),
        ]);
        assert_value(ast, Value::Integer(3));
    }

    #[test]
    fn test_recursion() {
        let n = || Expr::var("n");
        let fib = |offset| {
            Expr::call(
                CallTarget::Function(0),
                vec![bin(n(), BinaryOperation::Subtract, Expr::int(offset))],
            )
        };
        let body = Expr::block(vec![
            Expr::if_(bin(n(), BinaryOperation::Less, Expr::int(2)), ret(n()), None),
            bin(fib(1), BinaryOperation::Add, fib(2)),
        ]);
        let ast = Expr::block(vec![
            Expr::function(0, "fib", &["n"], body),
            Expr::call(CallTarget::Function(0), vec![Expr::int(10)]),
        ]);
        assert_value(ast, Value::Integer(55));
    }

    #[test]
    fn test_return_from_inside_loop() {
        // fn first_big(xs) { for x in xs { if x > 2 { return x } }; 0 }
        let body = Expr::block(vec![
            Expr::for_(
                "x",
                Expr::var("xs"),
                Expr::if_(
                    bin(Expr::var("x"), BinaryOperation::Greater, Expr::int(2)),
                    ret(Expr::var("x")),
                    None,
                ),
            ),
            Expr::int(0),
        ]);
        let ast = Expr::block(vec![
            Expr::function(0, "first_big", &["xs"], body),
            Expr::let_(
                "r",
                Expr::call(
                    CallTarget::Function(0),
                    vec![Expr::list(vec![Expr::int(1), Expr::int(5), Expr::int(9)])],
                ),
            ),
            // The loop's iterator must be gone: a second loop works normally.
            Expr::for_("y", Expr::list(vec![Expr::int(1)]), increment("r", Expr::var("y"))),
            Expr::var("r"),
        ]);
        assert_value(ast, Value::Integer(6));
    }

    #[test]
    fn test_closure_environment_is_shared_between_calls() {
        let counter = closure(&[], &["n"], increment("n", Expr::int(1)));
        let call = || Expr::call(CallTarget::Value(Box::new(Expr::var("inc"))), vec![]);
        let ast = Expr::block(vec![
            Expr::let_("n", Expr::int(0)),
            Expr::let_("inc", counter),
            call(),
            call(),
        ]);
        assert_value(ast, Value::Integer(2));
    }

    #[test]
    fn test_closure_sees_assignment_after_creation() {
        // let n = 1; let f = || n; n = 2; f()
        let ast = Expr::block(vec![
            Expr::let_("n", Expr::int(1)),
            Expr::let_("f", closure(&[], &["n"], Expr::var("n"))),
            Expr::assign(Expr::var("n"), Expr::int(2)),
            Expr::call(CallTarget::Value(Box::new(Expr::var("f"))), vec![]),
        ]);
        assert_value(ast, Value::Integer(2));
    }

    #[test]
    fn test_closure_assignment_is_seen_by_declaring_scope() {
        // let n = 0; let inc = || n = n + 1; inc(); n
        let ast = Expr::block(vec![
            Expr::let_("n", Expr::int(0)),
            Expr::let_("inc", closure(&[], &["n"], increment("n", Expr::int(1)))),
            Expr::call(CallTarget::Value(Box::new(Expr::var("inc"))), vec![]),
            Expr::var("n"),
        ]);
        assert_value(ast, Value::Integer(1));
    }

    #[test]
    fn test_captured_parameter_is_shared() {
        // fn counter(n) { let inc = || n = n + 1; inc(); inc(); n }; counter(5)
        let body = Expr::block(vec![
            Expr::let_("inc", closure(&[], &["n"], increment("n", Expr::int(1)))),
            Expr::call(CallTarget::Value(Box::new(Expr::var("inc"))), vec![]),
            Expr::call(CallTarget::Value(Box::new(Expr::var("inc"))), vec![]),
            Expr::var("n"),
        ]);
        let ast = Expr::block(vec![
            Expr::function(0, "counter", &["n"], body),
            Expr::call(CallTarget::Function(0), vec![Expr::int(5)]),
        ]);
        assert_value(ast, Value::Integer(7));
    }

    #[test]
    fn test_each_iteration_captures_its_own_variable() {
        // let fs = [nil, nil, nil]; for i in 0..3 { fs[i] = || i }; fs[0]() + fs[2]()
        let call_at = |i| {
            Expr::call(
                CallTarget::Value(Box::new(Expr::index(Expr::var("fs"), Expr::int(i)))),
                vec![],
            )
        };
        let ast = Expr::block(vec![
            Expr::let_("fs", Expr::list(vec![Expr::nil(), Expr::nil(), Expr::nil()])),
            Expr::new(
                ExprKind::For {
                    names: vec!["i".to_string()],
                    iterable: Box::new(Expr::new(
                        ExprKind::Range {
                            from: Some(Box::new(Expr::int(0))),
                            to: Some(Box::new(Expr::int(3))),
                            inclusive: false,
                        },
                        0,
                    )),
                    body: Box::new(Expr::assign(
                        Expr::index(Expr::var("fs"), Expr::var("i")),
                        closure(&[], &["i"], Expr::var("i")),
                    )),
                },
                0,
            ),
            bin(call_at(0), BinaryOperation::Add, call_at(2)),
        ]);
        assert_value(ast, Value::Integer(2));
    }

    #[test]
    fn test_wrong_argument_count() {
        let ast = Expr::block(vec![
            Expr::function(0, "one", &["a"], Expr::var("a")),
            Expr::call(CallTarget::Function(0), vec![]),
        ]);
        assert_error(ast, "one expects 1 argument(s), got 0");
    }

    #[test]
    fn test_calling_a_non_function() {
        assert_error(
            Expr::call(CallTarget::Value(Box::new(Expr::int(5))), vec![]),
            "Integer is not callable",
        );
    }

    #[test]
    fn test_library_call() {
        let library = Library::prelude();
        let len = Arc::clone(library.get("len").unwrap());
        let ast = Expr::call(
            CallTarget::Std(len),
            vec![Expr::list(vec![Expr::int(1), Expr::int(2), Expr::int(3)])],
        );
        assert_value(ast, Value::Integer(3));
    }

    #[test]
    fn test_library_error_is_catchable() {
        let library = Library::prelude();
        let error = Arc::clone(library.get("error").unwrap());
        let ast = try_catch(
            Expr::call(CallTarget::Std(error), vec![Expr::string("boom")]),
            Some("e"),
            Expr::new(
                ExprKind::Cast {
                    value: Box::new(Expr::var("e")),
                    to: ValueType::String,
                },
                0,
            ),
        );
        assert_value(ast, Value::string("boom"));
    }

    #[test]
    fn test_call_function_from_host() {
        let ast = closure(&["x"], &[], bin(Expr::var("x"), BinaryOperation::Multiply, Expr::int(2)));
        let program = Compiler::new().compile_program(&ast).unwrap();
        let mut vm = Vm::new();

        let double = vm.execute(&program, 0).unwrap();
        let result = vm
            .call_function(&program, &double, vec![Value::Integer(21)])
            .unwrap();
        assert_eq!(result, Value::Integer(42));

        let err = vm.call_function(&program, &double, vec![]).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ArgumentCount { .. }));
    }

    // ─────────────────────────── Errors ─────────────────────────────────

    #[test]
    fn test_try_catch_binds_error_value() {
        let ast = try_catch(
            bin(Expr::int(1), BinaryOperation::Divide, Expr::int(0)),
            Some("e"),
            Expr::var("e"),
        );
        match run(&ast).unwrap() {
            Value::Error(error) => {
                assert_eq!(error.value, Value::string("division by zero"));
                assert!(error.trace.is_some());
            }
            other => panic!("expected an error value, got {}", other),
        }
    }

    #[test]
    fn test_error_in_callee_is_caught_by_caller() {
        let ast = Expr::block(vec![
            Expr::function(
                0,
                "fail",
                &["a"],
                bin(Expr::var("a"), BinaryOperation::Modulo, Expr::int(0)),
            ),
            Expr::let_("keep", Expr::int(40)),
            Expr::let_(
                "r",
                try_catch(
                    Expr::call(CallTarget::Function(0), vec![Expr::int(1)]),
                    None,
                    Expr::int(2),
                ),
            ),
            bin(Expr::var("keep"), BinaryOperation::Add, Expr::var("r")),
        ]);
        assert_value(ast, Value::Integer(42));
    }

    #[test]
    fn test_break_out_of_try_closes_region() {
        // for x in [1, 2, 3] { try { if x == 2 { break }; r = r + x } catch { nil } }
        // then an uncaught error must not land in the stale region.
        let body = try_catch(
            Expr::block(vec![
                Expr::if_(
                    bin(Expr::var("x"), BinaryOperation::Equal, Expr::int(2)),
                    Expr::new(ExprKind::Break, 0),
                    None,
                ),
                increment("r", Expr::var("x")),
            ]),
            None,
            Expr::nil(),
        );
        let ast = Expr::block(vec![
            Expr::let_("r", Expr::int(0)),
            Expr::for_(
                "x",
                Expr::list(vec![Expr::int(1), Expr::int(2), Expr::int(3)]),
                body,
            ),
            Expr::var("r"),
        ]);
        assert_value(ast.clone(), Value::Integer(1));

        let failing = Expr::block(vec![
            ast,
            bin(Expr::int(1), BinaryOperation::Divide, Expr::int(0)),
        ]);
        assert_error(failing, "division by zero");
    }

    #[test]
    fn test_uncaught_error_has_trace() {
        let body = bin(Expr::var("a"), BinaryOperation::Divide, Expr::int(0)).at(3);
        let ast = Expr::block(vec![
            Expr::function(0, "divide", &["a"], body).at(2),
            Expr::call(CallTarget::Function(0), vec![Expr::int(1)]).at(5),
        ]);

        let err = run(&ast).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DivisionByZero);
        assert_eq!(
            err.trace,
            vec![
                TraceFrame {
                    page: "divide".to_string(),
                    line: Some(3),
                },
                TraceFrame {
                    page: "<main>".to_string(),
                    line: Some(5),
                },
            ]
        );
    }

    #[test]
    fn test_call_depth_limit() {
        let ast = Expr::block(vec![
            Expr::function(0, "forever", &[], Expr::call(CallTarget::Function(0), vec![])),
            Expr::call(CallTarget::Function(0), vec![]),
        ]);
        let config = VmConfig {
            max_call_depth: 50,
            ..VmConfig::default()
        };
        let err = run_with_config(&ast, config).unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::LimitExceeded {
                limit: "call depth",
                max: 50
            }
        );
    }

    #[test]
    fn test_step_limit() {
        let ast = Expr::while_(Expr::bool(true), Expr::nil());
        let config = VmConfig {
            max_steps: Some(1000),
            ..VmConfig::default()
        };
        let err = run_with_config(&ast, config).unwrap_err();
        assert!(err.to_string().contains("step limit of 1000 exceeded"));
    }

    #[test]
    fn test_unknown_opcode_is_internal() {
        let mut program = Program::new();
        let mut page = Page::new("<main>", 0);
        page.code = vec![0xee];
        program.pages.push(page);

        let err = Vm::new().execute(&program, 0).unwrap_err();
        assert!(!err.is_catchable());
        assert!(err.to_string().contains("unknown opcode 0xee"));
    }

    // ─────────────────────────── Programs ───────────────────────────────

    #[cfg(unix)]
    #[test]
    fn test_captured_program_output() {
        let (target, arguments) = program("echo", &["hi"]);
        let value = run(&program_call(target, arguments)).unwrap();

        assert!(matches!(value, Value::ProcessStream(_)));
        assert_eq!(value.to_text().unwrap(), "hi");
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_captured_program_is_catchable() {
        let (target, arguments) = program("false", &[]);
        let ast = try_catch(program_call(target, arguments), Some("e"), Expr::var("e"));

        match run(&ast).unwrap() {
            Value::Error(error) => {
                assert!(error.value.to_string().contains("non-zero exit code (1)"));
            }
            other => panic!("expected an error value, got {}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_background_program_does_not_raise() {
        let (mut target, arguments) = program("false", &[]);
        target.background = true;
        assert!(run(&program_call(target, arguments)).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_program_not_found() {
        let (target, arguments) = program("definitely-not-a-real-program-elk", &[]);
        assert_error(
            program_call(target, arguments),
            "program not found: definitely-not-a-real-program-elk",
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_iterating_process_lines() {
        let (target, arguments) = program("sh", &["-c", "printf 'a\\nb\\nc\\n'"]);
        let ast = Expr::block(vec![
            Expr::let_("count", Expr::int(0)),
            Expr::for_(
                "line",
                program_call(target, arguments),
                increment("count", Expr::int(1)),
            ),
            Expr::var("count"),
        ]);
        assert_value(ast, Value::Integer(3));
    }

    #[cfg(unix)]
    #[test]
    fn test_piped_value_and_environment() {
        let (mut target, arguments) = program("sh", &["-c", "cat; echo $GREETING"]);
        target.piped = Some(Box::new(Expr::list(vec![Expr::string("x"), Expr::string("y")])));
        target.environment = vec![("GREETING".to_string(), Expr::string("hello"))];

        let value = run(&program_call(target, arguments)).unwrap();
        assert_eq!(value.to_text().unwrap(), "x\ny\nhello");
    }

    #[cfg(unix)]
    #[test]
    fn test_root_ness_is_inherited_by_maybe_root_calls() {
        // fn run_true() { true }  with `true` in root position of the body
        let (target, arguments) = program("true", &[]);
        let body = Expr::root_call(CallTarget::Program(target), arguments);
        let definition = Expr::function(0, "run_true", &[], body);

        let as_root = Expr::block(vec![
            definition.clone(),
            Expr::root_call(CallTarget::Function(0), vec![]),
        ]);
        assert_value(as_root, Value::Nil);

        let captured = Expr::block(vec![definition, Expr::call(CallTarget::Function(0), vec![])]);
        assert!(matches!(run(&captured).unwrap(), Value::ProcessStream(_)));
    }
}
