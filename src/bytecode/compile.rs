use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::{
    bytecode::{
        compile_error::CompileError,
        ir::{Constant, NIL_CONSTANT, Page, Program},
        op::{Op, RANGE_HAS_FROM, RANGE_HAS_TO, RANGE_INCLUSIVE},
    },
    lang::{
        node::{CallTarget, Expr, ExprKind, FunctionId, Literal, ProgramTarget},
        operator::{BinaryOperation, UnaryOperation},
        value::ValueType,
    },
    process::CallFlags,
};

pub const ENTRY_PAGE_NAME: &str = "<main>";

#[derive(Debug)]
struct Local {
    name: String,
    depth: usize,
    slot: u8,
    /// Lives in a shared cell because a closure captures it.
    boxed: bool,
}

/// A region the executor tracks state for, which has to be closed when
/// control jumps out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Try,
    For,
}

#[derive(Debug)]
struct LoopContext {
    /// Target of `continue`.
    start: usize,
    /// Stack height `break` and `continue` unwind to.
    height: usize,
    /// Number of open regions when the body starts.
    regions: usize,
    /// Patch sites of `break` jumps.
    breaks: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
enum Variable {
    Local(u8),
    Cell(u8),
    Capture(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Plain,
    Root,
    MaybeRoot,
}

/// Generator state for the page currently being written.
#[derive(Debug)]
struct PageBuilder {
    page: Page,
    locals: Vec<Local>,
    captures: Vec<String>,
    /// Names captured by closures created in this page.
    captured: HashSet<String>,
    /// Shadow of the executor's stack height relative to the frame base.
    height: usize,
    depth: usize,
    loops: Vec<LoopContext>,
    regions: Vec<Region>,
    is_entry: bool,
}

impl PageBuilder {
    fn new(page: Page, is_entry: bool) -> Self {
        PageBuilder {
            page,
            locals: Vec::new(),
            captures: Vec::new(),
            captured: HashSet::new(),
            height: 0,
            depth: 0,
            loops: Vec::new(),
            regions: Vec::new(),
            is_entry,
        }
    }
}

/// Lowers analyzed expression trees into bytecode pages.
///
/// A compiler can be reused across calls to [`Compiler::compile_incremental`]
/// so that functions defined by earlier entries stay callable from later
/// ones.
pub struct Compiler {
    program: Program,
    /// Page reserved for every function id seen so far.
    functions: HashMap<FunctionId, u16>,
    /// Function ids whose definition has been compiled.
    defined: HashSet<FunctionId>,
    /// Pages replaced by redefinitions in the entry being compiled, as
    /// they were before. Restored if the entry fails.
    replaced: Vec<(u16, Page)>,
    current: PageBuilder,
    enclosing: Vec<PageBuilder>,
}

impl Default for Compiler {
    fn default() -> Self {
        Compiler::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Compiler {
            program: Program::new(),
            functions: HashMap::new(),
            defined: HashSet::new(),
            replaced: Vec::new(),
            current: PageBuilder::new(Page::new(ENTRY_PAGE_NAME, 0), true),
            enclosing: Vec::new(),
        }
    }

    /// Compile a whole program. The entry point is `pages[0]`.
    pub fn compile_program(mut self, ast: &Expr) -> Result<Program, CompileError> {
        self.compile_incremental(ast)?;
        Ok(self.program)
    }

    /// Compile one more top-level entry into the same program and return
    /// the index of its entry page. Functions defined again replace the
    /// body of their earlier page, so existing references stay valid.
    ///
    /// On error the program is left as it was before the call.
    pub fn compile_incremental(&mut self, ast: &Expr) -> Result<u16, CompileError> {
        let pages = self.program.pages.len();
        let library = self.program.library.len();
        self.replaced.clear();

        let result = self.compile_entry(ast);
        if result.is_err() {
            for (index, page) in self.replaced.drain(..).rev() {
                if let Some(slot) = self.program.pages.get_mut(usize::from(index)) {
                    *slot = page;
                }
            }
            self.program.pages.truncate(pages);
            self.program.library.truncate(library);
            self.functions.retain(|_, index| usize::from(*index) < pages);
            self.defined.retain(|id| self.functions.contains_key(id));
        }
        result
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn into_program(self) -> Program {
        self.program
    }

    fn compile_entry(&mut self, ast: &Expr) -> Result<u16, CompileError> {
        let index = self.reserve_page(ENTRY_PAGE_NAME)?;
        self.enclosing.clear();
        self.current = PageBuilder::new(Page::new(ENTRY_PAGE_NAME, 0), true);
        collect_captured(ast, &mut self.current.captured);

        self.compile_value(ast)?;

        let builder = std::mem::replace(
            &mut self.current,
            PageBuilder::new(Page::new(ENTRY_PAGE_NAME, 0), true),
        );
        self.install(index, builder.page)?;

        if let Some(id) = self
            .functions
            .keys()
            .find(|id| !self.defined.contains(*id))
        {
            return Err(CompileError::internal(format!(
                "function {} is called but never defined",
                id
            )));
        }

        debug!(entry = index, pages = self.program.pages.len(), "compiled entry");
        Ok(index)
    }

    // ─────────────────────────── Pages ──────────────────────────────────

    fn reserve_page(&mut self, name: &str) -> Result<u16, CompileError> {
        let count = self.program.pages.len();
        let index = u16::try_from(count)
            .map_err(|_| CompileError::too_many_operands("pages", count + 1, usize::from(u16::MAX)))?;
        self.program.pages.push(Page::new(name, 0));
        Ok(index)
    }

    fn function_page(&mut self, id: FunctionId) -> Result<u16, CompileError> {
        if let Some(index) = self.functions.get(&id) {
            return Ok(*index);
        }
        let index = self.reserve_page(&format!("<function {}>", id))?;
        self.functions.insert(id, index);
        Ok(index)
    }

    fn install(&mut self, index: u16, page: Page) -> Result<(), CompileError> {
        let slot = self
            .program
            .pages
            .get_mut(usize::from(index))
            .ok_or_else(|| CompileError::internal(format!("page {} was never reserved", index)))?;
        *slot = page;
        Ok(())
    }

    /// Compile `body` into a fresh page. Parameters occupy the first
    /// local slots; captures are reached through the closure environment.
    fn compile_page(
        &mut self,
        name: &str,
        parameters: &[String],
        captures: &[String],
        body: &Expr,
    ) -> Result<Page, CompileError> {
        let arity = u8::try_from(parameters.len()).map_err(|_| {
            CompileError::too_many_operands("parameters", parameters.len(), usize::from(u8::MAX))
        })?;

        let builder = PageBuilder::new(Page::new(name, arity), false);
        let outer = std::mem::replace(&mut self.current, builder);
        self.enclosing.push(outer);

        let result = self.compile_page_body(parameters, captures, body);

        let outer = self
            .enclosing
            .pop()
            .ok_or_else(|| CompileError::internal("page builder stack is empty"))?;
        let builder = std::mem::replace(&mut self.current, outer);
        result?;

        debug!(
            page = %builder.page.name,
            bytes = builder.page.code.len(),
            constants = builder.page.constants.len(),
            "generated page"
        );
        Ok(builder.page)
    }

    fn compile_page_body(
        &mut self,
        parameters: &[String],
        captures: &[String],
        body: &Expr,
    ) -> Result<(), CompileError> {
        self.current.captures = captures.to_vec();
        collect_captured(body, &mut self.current.captured);
        for (slot, name) in parameters.iter().enumerate() {
            self.declare_local(name, slot)?;
        }
        self.current.height = parameters.len();

        self.compile_value(body)?;
        if !parameters.is_empty() {
            self.emit_u8(Op::Unwind, parameters.len(), "parameters")?;
        }
        Ok(())
    }

    // ─────────────────────────── Emission ───────────────────────────────

    fn code_len(&self) -> usize {
        self.current.page.code.len()
    }

    /// Append an instruction and track its stack effect. Returns the
    /// offset of the opcode.
    fn emit(&mut self, op: Op, operands: &[u8]) -> Result<usize, CompileError> {
        let offset = self.code_len();
        self.current.page.code.push(op as u8);
        self.current.page.code.extend_from_slice(operands);

        if let Some((pops, pushes)) = op.stack_effect(operands) {
            self.pop_height(pops)?;
            self.current.height += pushes;
        }
        Ok(offset)
    }

    fn pop_height(&mut self, count: usize) -> Result<(), CompileError> {
        self.current.height = self.current.height.checked_sub(count).ok_or_else(|| {
            CompileError::internal(format!("stack underflow in '{}'", self.current.page.name))
        })?;
        Ok(())
    }

    fn emit_u8(&mut self, op: Op, value: usize, what: &'static str) -> Result<usize, CompileError> {
        let byte = u8::try_from(value)
            .map_err(|_| CompileError::too_many_operands(what, value, usize::from(u8::MAX)))?;
        self.emit(op, &[byte])
    }

    fn emit_u16(&mut self, op: Op, value: usize, what: &'static str) -> Result<usize, CompileError> {
        let word = u16::try_from(value)
            .map_err(|_| CompileError::too_many_operands(what, value, usize::from(u16::MAX)))?;
        self.emit(op, &word.to_be_bytes())
    }

    fn emit_constant(&mut self, constant: Constant) -> Result<(), CompileError> {
        let key = self.current.page.constants.add(constant)?;
        self.emit(Op::Const, &key.to_be_bytes())?;
        Ok(())
    }

    fn emit_nil(&mut self) -> Result<(), CompileError> {
        self.emit(Op::Const, &NIL_CONSTANT.to_be_bytes())?;
        Ok(())
    }

    fn emit_pop(&mut self) -> Result<(), CompileError> {
        self.emit(Op::Pop, &[])?;
        Ok(())
    }

    /// Emit a forward jump with a placeholder offset. Returns the patch
    /// site, the offset of its operand.
    fn emit_jump(&mut self, op: Op) -> Result<usize, CompileError> {
        Ok(self.emit(op, &[0, 0])? + 1)
    }

    /// Point the jump at `site` to the current end of the code.
    fn patch_jump(&mut self, site: usize) -> Result<(), CompileError> {
        let distance = self.code_len() - (site + 2);
        let word = u16::try_from(distance)
            .map_err(|_| CompileError::jump_too_far(distance, &self.current.page.name))?;
        self.current.page.code[site..site + 2].copy_from_slice(&word.to_be_bytes());
        Ok(())
    }

    fn emit_jump_backward(&mut self, target: usize) -> Result<(), CompileError> {
        let distance = self.code_len() + 3 - target;
        let word = u16::try_from(distance)
            .map_err(|_| CompileError::jump_too_far(distance, &self.current.page.name))?;
        self.emit(Op::JumpBackward, &word.to_be_bytes())?;
        Ok(())
    }

    /// Close every region above `from`, innermost first.
    fn close_regions(&mut self, from: usize) -> Result<(), CompileError> {
        let ops: Vec<Op> = self.current.regions[from..]
            .iter()
            .rev()
            .map(|region| match region {
                Region::Try => Op::EndTry,
                Region::For => Op::EndFor,
            })
            .collect();
        for op in ops {
            self.emit(op, &[])?;
        }
        Ok(())
    }

    // ─────────────────────────── Scopes ─────────────────────────────────

    fn begin_scope(&mut self) {
        self.current.depth += 1;
    }

    /// Drop the locals of the innermost scope. With `keep_value` the value
    /// on top of them survives.
    fn end_scope(&mut self, keep_value: bool) -> Result<(), CompileError> {
        let depth = self.current.depth;
        let count = self
            .current
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth == depth)
            .count();
        let remaining = self.current.locals.len() - count;
        self.current.locals.truncate(remaining);
        self.current.depth -= 1;

        if count > 0 {
            let op = if keep_value { Op::Unwind } else { Op::PopN };
            self.emit_u8(op, count, "local variables")?;
        }
        Ok(())
    }

    fn declare_local(&mut self, name: &str, slot: usize) -> Result<(), CompileError> {
        let slot = u8::try_from(slot).map_err(|_| CompileError::too_many_locals(slot + 1))?;
        let boxed = self.current.captured.contains(name);
        if boxed {
            self.emit(Op::MakeCell, &[slot])?;
        }
        self.current.locals.push(Local {
            name: name.to_string(),
            depth: self.current.depth,
            slot,
            boxed,
        });
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<Variable, CompileError> {
        if let Some(local) = self.current.locals.iter().rev().find(|l| l.name == name) {
            return Ok(if local.boxed {
                Variable::Cell(local.slot)
            } else {
                Variable::Local(local.slot)
            });
        }
        if let Some(i) = self.current.captures.iter().position(|c| c == name) {
            return u8::try_from(i)
                .map(Variable::Capture)
                .map_err(|_| CompileError::too_many_operands("captures", i + 1, usize::from(u8::MAX)));
        }
        Err(CompileError::internal(format!("unresolved variable '{}'", name)))
    }

    fn emit_load(&mut self, name: &str) -> Result<(), CompileError> {
        match self.resolve(name)? {
            Variable::Local(slot) => self.emit(Op::Load, &[slot])?,
            Variable::Cell(slot) => self.emit(Op::LoadCell, &[slot])?,
            Variable::Capture(i) => self.emit(Op::LoadCapture, &[i])?,
        };
        Ok(())
    }

    // ─────────────────────────── Expressions ────────────────────────────

    /// Compile `expr` so that exactly one value is left on the stack.
    fn compile_value(&mut self, expr: &Expr) -> Result<(), CompileError> {
        if expr.produces_value() {
            self.compile_expr(expr)
        } else {
            self.compile_block(std::slice::from_ref(expr))
        }
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        if expr.line > 0 {
            self.current.page.mark_line(expr.line);
        }

        match &expr.kind {
            ExprKind::Literal(literal) => self.emit_constant(literal_constant(literal)),
            ExprKind::StringInterpolation(parts) => {
                self.compile_values(parts)?;
                self.emit_u16(Op::BuildString, parts.len(), "interpolated parts")?;
                Ok(())
            }
            ExprKind::List(items) => self.compile_collection(items, Op::BuildList),
            ExprKind::Tuple(items) => self.compile_collection(items, Op::BuildTuple),
            ExprKind::Set(items) => self.compile_collection(items, Op::BuildSet),
            ExprKind::Dictionary(entries) => {
                for (key, value) in entries {
                    self.compile_value(key)?;
                    self.compile_value(value)?;
                }
                self.emit_u16(Op::BuildDict, entries.len(), "dictionary entries")?;
                Ok(())
            }
            ExprKind::Range {
                from,
                to,
                inclusive,
            } => {
                let mut flags = 0;
                if let Some(from) = from {
                    self.compile_value(from)?;
                    flags |= RANGE_HAS_FROM;
                }
                if let Some(to) = to {
                    self.compile_value(to)?;
                    flags |= RANGE_HAS_TO;
                }
                if *inclusive {
                    flags |= RANGE_INCLUSIVE;
                }
                self.emit(Op::BuildRange, &[flags])?;
                Ok(())
            }
            ExprKind::Struct { name, fields } => {
                for (_, value) in fields {
                    self.compile_value(value)?;
                }
                let shape = Constant::StructShape {
                    name: name.clone(),
                    fields: fields.iter().map(|(field, _)| field.clone()).collect(),
                };
                let key = self.current.page.constants.add(shape)?;
                self.emit(Op::BuildStruct, &key.to_be_bytes())?;
                self.pop_height(fields.len())?;
                self.current.height += 1;
                Ok(())
            }
            ExprKind::Variable(name) => self.emit_load(name),
            ExprKind::Let { names, value } => self.compile_let(names, value),
            ExprKind::Assignment { target, value } => {
                self.compile_assignment(target, value, expr.line)
            }
            ExprKind::Binary { op, lhs, rhs } => self.compile_binary(*op, lhs, rhs),
            ExprKind::Unary { op, operand } => {
                self.compile_value(operand)?;
                let op = match op {
                    UnaryOperation::Negate => Op::Negate,
                    UnaryOperation::Not => Op::Not,
                };
                self.emit(op, &[])?;
                Ok(())
            }
            ExprKind::Cast { value, to } => {
                self.compile_value(value)?;
                self.emit(Op::Cast, &[to.tag()])?;
                Ok(())
            }
            ExprKind::Indexer { target, index } => {
                self.compile_value(target)?;
                self.compile_value(index)?;
                self.emit(Op::Index, &[])?;
                Ok(())
            }
            ExprKind::FieldAccess { target, field } => {
                self.compile_value(target)?;
                self.emit_constant(Constant::String(field.clone()))?;
                self.emit(Op::Index, &[])?;
                Ok(())
            }
            ExprKind::Block(items) => self.compile_block(items),
            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => self.compile_if(condition, then_branch, else_branch.as_deref()),
            ExprKind::While { condition, body } => self.compile_while(condition, body),
            ExprKind::For {
                names,
                iterable,
                body,
            } => self.compile_for(names, iterable, body),
            ExprKind::Break => self.compile_break(),
            ExprKind::Continue => self.compile_continue(),
            ExprKind::Return(value) => self.compile_return(value.as_deref()),
            ExprKind::Try {
                body,
                catch_binding,
                catch_body,
            } => self.compile_try(body, catch_binding.as_deref(), catch_body),
            ExprKind::FunctionDefinition {
                id,
                name,
                parameters,
                body,
            } => self.compile_function(*id, name, parameters, body),
            ExprKind::Closure {
                parameters,
                captures,
                body,
            } => self.compile_closure(parameters, captures, body),
            ExprKind::Call {
                target,
                arguments,
                is_root,
            } => self.compile_call(target, arguments, *is_root),
        }
    }

    fn compile_values(&mut self, items: &[Expr]) -> Result<(), CompileError> {
        for item in items {
            self.compile_value(item)?;
        }
        Ok(())
    }

    fn compile_collection(&mut self, items: &[Expr], op: Op) -> Result<(), CompileError> {
        self.compile_values(items)?;
        self.emit_u16(op, items.len(), "collection items")?;
        Ok(())
    }

    /// Value of the last item, or nil. Locals declared inside are dropped
    /// at the end with the value kept on top.
    fn compile_block(&mut self, items: &[Expr]) -> Result<(), CompileError> {
        self.begin_scope();

        let mut has_value = false;
        for (i, item) in items.iter().enumerate() {
            self.compile_expr(item)?;
            has_value = item.produces_value();
            if has_value && i + 1 < items.len() {
                self.emit_pop()?;
            }
        }
        if !has_value {
            self.emit_nil()?;
        }

        self.end_scope(true)
    }

    fn compile_let(&mut self, names: &[String], value: &Expr) -> Result<(), CompileError> {
        self.compile_value(value)?;

        if let [name] = names {
            let slot = self.current.height - 1;
            return self.declare_local(name, slot);
        }

        self.emit_u8(Op::Unpack, names.len(), "unpacked names")?;
        let first = self.current.height - names.len();
        for (i, name) in names.iter().enumerate() {
            self.declare_local(name, first + i)?;
        }
        Ok(())
    }

    fn compile_assignment(&mut self, target: &Expr, value: &Expr, line: u32) -> Result<(), CompileError> {
        match &target.kind {
            ExprKind::Variable(name) => {
                let variable = self.resolve(name)?;
                self.compile_value(value)?;
                match variable {
                    Variable::Local(slot) => self.emit(Op::Store, &[slot])?,
                    Variable::Cell(slot) => self.emit(Op::StoreCell, &[slot])?,
                    Variable::Capture(i) => self.emit(Op::StoreCapture, &[i])?,
                };
            }
            ExprKind::Indexer {
                target: container,
                index,
            } => {
                self.compile_value(value)?;
                self.compile_value(container)?;
                self.compile_value(index)?;
                self.emit(Op::IndexStore, &[])?;
            }
            ExprKind::FieldAccess {
                target: container,
                field,
            } => {
                self.compile_value(value)?;
                self.compile_value(container)?;
                self.emit_constant(Constant::String(field.clone()))?;
                self.emit(Op::IndexStore, &[])?;
            }
            other => {
                let line = if target.line > 0 { target.line } else { line };
                return Err(CompileError::invalid_assignment(other.name(), line));
            }
        }
        Ok(())
    }

    fn compile_binary(&mut self, op: BinaryOperation, lhs: &Expr, rhs: &Expr) -> Result<(), CompileError> {
        if matches!(op, BinaryOperation::And | BinaryOperation::Or) {
            self.compile_value(lhs)?;
            let jump = if op == BinaryOperation::And {
                Op::JumpIfNot
            } else {
                Op::JumpIf
            };
            let site = self.emit_jump(jump)?;
            self.emit_pop()?;
            self.compile_value(rhs)?;
            self.patch_jump(site)?;
            self.emit(Op::Cast, &[ValueType::Boolean.tag()])?;
            return Ok(());
        }

        self.compile_value(lhs)?;
        self.compile_value(rhs)?;
        self.emit(binary_opcode(op), &[])?;
        Ok(())
    }

    // ─────────────────────────── Control flow ───────────────────────────

    fn compile_if(
        &mut self,
        condition: &Expr,
        then_branch: &Expr,
        else_branch: Option<&Expr>,
    ) -> Result<(), CompileError> {
        self.compile_value(condition)?;
        let else_jump = self.emit_jump(Op::PopJumpIfNot)?;
        let height = self.current.height;

        self.compile_value(then_branch)?;
        let end_jump = self.emit_jump(Op::Jump)?;

        self.patch_jump(else_jump)?;
        self.current.height = height;
        match else_branch {
            Some(else_branch) => self.compile_value(else_branch)?,
            None => self.emit_nil()?,
        }
        self.patch_jump(end_jump)
    }

    fn compile_while(&mut self, condition: &Expr, body: &Expr) -> Result<(), CompileError> {
        let height = self.current.height;
        let start = self.code_len();

        self.compile_value(condition)?;
        let exit = self.emit_jump(Op::PopJumpIfNot)?;

        self.current.loops.push(LoopContext {
            start,
            height,
            regions: self.current.regions.len(),
            breaks: Vec::new(),
        });
        self.compile_value(body)?;
        self.emit_pop()?;
        self.emit_jump_backward(start)?;
        let context = self.pop_loop()?;

        self.patch_jump(exit)?;
        for site in context.breaks {
            self.patch_jump(site)?;
        }
        Ok(())
    }

    fn compile_for(&mut self, names: &[String], iterable: &Expr, body: &Expr) -> Result<(), CompileError> {
        self.compile_value(iterable)?;
        self.emit(Op::GetIter, &[])?;

        let height = self.current.height;
        let exit = self.emit_jump(Op::ForIter)?;
        let start = exit - 1;

        self.current.regions.push(Region::For);
        self.current.loops.push(LoopContext {
            start,
            height,
            regions: self.current.regions.len(),
            breaks: Vec::new(),
        });

        self.begin_scope();
        if let [name] = names {
            self.declare_local(name, height)?;
        } else {
            self.emit_u8(Op::Unpack, names.len(), "unpacked names")?;
            for (i, name) in names.iter().enumerate() {
                self.declare_local(name, height + i)?;
            }
        }
        self.compile_value(body)?;
        self.emit_pop()?;
        self.end_scope(false)?;
        self.emit_jump_backward(start)?;

        let context = self.pop_loop()?;
        self.current.regions.pop();

        self.patch_jump(exit)?;
        for site in context.breaks {
            self.patch_jump(site)?;
        }
        self.emit(Op::EndFor, &[])?;
        Ok(())
    }

    fn pop_loop(&mut self) -> Result<LoopContext, CompileError> {
        self.current
            .loops
            .pop()
            .ok_or_else(|| CompileError::internal("loop context stack is empty"))
    }

    /// Emit the unwinding shared by `break` and `continue` and return the
    /// innermost loop's start.
    fn unwind_to_loop(&mut self, keyword: &'static str) -> Result<usize, CompileError> {
        let context = self
            .current
            .loops
            .last()
            .ok_or_else(|| CompileError::outside_loop(keyword))?;
        let (start, height, regions) = (context.start, context.height, context.regions);

        self.close_regions(regions)?;
        let extra = self.current.height - height;
        if extra > 0 {
            self.emit_u8(Op::PopN, extra, "local variables")?;
        }
        Ok(start)
    }

    fn compile_break(&mut self) -> Result<(), CompileError> {
        let height = self.current.height;
        self.unwind_to_loop("break")?;
        let site = self.emit_jump(Op::Jump)?;
        if let Some(context) = self.current.loops.last_mut() {
            context.breaks.push(site);
        }
        self.current.height = height;
        Ok(())
    }

    fn compile_continue(&mut self) -> Result<(), CompileError> {
        let height = self.current.height;
        let start = self.unwind_to_loop("continue")?;
        self.emit_jump_backward(start)?;
        self.current.height = height;
        Ok(())
    }

    fn compile_return(&mut self, value: Option<&Expr>) -> Result<(), CompileError> {
        let height = self.current.height;
        match value {
            Some(value) => self.compile_value(value)?,
            None => self.emit_nil()?,
        }

        self.close_regions(0)?;
        let below = self.current.height - 1;
        if below > 0 {
            self.emit_u8(Op::Unwind, below, "local variables")?;
        }
        self.emit(Op::Ret, &[])?;
        self.current.height = height;
        Ok(())
    }

    fn compile_try(
        &mut self,
        body: &Expr,
        catch_binding: Option<&str>,
        catch_body: &Expr,
    ) -> Result<(), CompileError> {
        let height = self.current.height;
        let catch_site = self.emit_jump(Op::Try)?;

        self.current.regions.push(Region::Try);
        self.compile_value(body)?;
        self.current.regions.pop();
        self.emit(Op::EndTry, &[])?;
        let end = self.emit_jump(Op::Jump)?;

        // The executor pushes the error value before jumping here.
        self.patch_jump(catch_site)?;
        self.current.height = height + 1;
        match catch_binding {
            Some(name) => {
                self.begin_scope();
                self.declare_local(name, height)?;
                self.compile_value(catch_body)?;
                self.end_scope(true)?;
            }
            None => {
                self.emit_pop()?;
                self.compile_value(catch_body)?;
            }
        }

        self.patch_jump(end)
    }

    // ─────────────────────────── Functions ──────────────────────────────

    fn compile_function(
        &mut self,
        id: FunctionId,
        name: &str,
        parameters: &[String],
        body: &Expr,
    ) -> Result<(), CompileError> {
        let index = self.function_page(id)?;
        let page = self.compile_page(name, parameters, &[], body)?;

        if self.defined.insert(id) {
            self.install(index, page)?;
        } else {
            debug!(function = name, page = index, "redefined function");
            let slot = self
                .program
                .pages
                .get_mut(usize::from(index))
                .ok_or_else(|| CompileError::internal(format!("page {} was never reserved", index)))?;
            self.replaced.push((index, slot.clone()));
            slot.replace_body(page);
        }
        Ok(())
    }

    fn compile_closure(
        &mut self,
        parameters: &[String],
        captures: &[String],
        body: &Expr,
    ) -> Result<(), CompileError> {
        for name in captures {
            match self.resolve(name)? {
                Variable::Cell(slot) => self.emit(Op::CaptureLocal, &[slot])?,
                Variable::Capture(i) => self.emit(Op::CaptureOuter, &[i])?,
                Variable::Local(_) => {
                    return Err(CompileError::internal(format!(
                        "captured variable '{}' was not boxed",
                        name
                    )));
                }
            };
        }
        let count = u8::try_from(captures.len()).map_err(|_| {
            CompileError::too_many_operands("captures", captures.len(), usize::from(u8::MAX))
        })?;

        let index = self.reserve_page("<closure>")?;
        let page = self.compile_page("<closure>", parameters, captures, body)?;
        self.install(index, page)?;

        let key = self.current.page.constants.add(Constant::Page(index))?;
        let [hi, lo] = key.to_be_bytes();
        self.emit(Op::MakeClosure, &[hi, lo, count])?;
        Ok(())
    }

    fn compile_call(
        &mut self,
        target: &CallTarget,
        arguments: &[Expr],
        is_root: bool,
    ) -> Result<(), CompileError> {
        let kind = match (is_root, self.current.is_entry) {
            (false, _) => CallKind::Plain,
            (true, true) => CallKind::Root,
            (true, false) => CallKind::MaybeRoot,
        };

        match target {
            CallTarget::Function(id) => {
                let index = self.function_page(*id)?;
                self.emit_constant(Constant::Page(index))?;
                self.compile_user_call(arguments, kind)
            }
            CallTarget::Value(callee) => {
                self.compile_value(callee)?;
                self.compile_user_call(arguments, kind)
            }
            CallTarget::Std(function) => {
                let library_index = self.program.library_index(function)?;
                let key = self
                    .current
                    .page
                    .constants
                    .add(Constant::StdFunction(library_index))?;
                self.compile_values(arguments)?;

                let argc = argument_count(arguments)?;
                let [hi, lo] = key.to_be_bytes();
                self.emit(Op::CallStd, &[hi, lo, argc])?;
                Ok(())
            }
            CallTarget::Program(program) => self.compile_program_call(program, arguments, kind),
        }
    }

    /// Callee is already on the stack.
    fn compile_user_call(&mut self, arguments: &[Expr], kind: CallKind) -> Result<(), CompileError> {
        self.compile_values(arguments)?;
        let op = match kind {
            CallKind::Plain => Op::Call,
            CallKind::Root => Op::RootCall,
            CallKind::MaybeRoot => Op::MaybeRootCall,
        };
        self.emit(op, &[argument_count(arguments)?])?;
        Ok(())
    }

    /// Push order: name, arguments, piped value, then key/value pairs of
    /// the environment.
    fn compile_program_call(
        &mut self,
        target: &ProgramTarget,
        arguments: &[Expr],
        kind: CallKind,
    ) -> Result<(), CompileError> {
        self.compile_value(&target.name)?;
        self.compile_values(arguments)?;

        let mut flags = CallFlags::empty()
            .with(CallFlags::REDIRECT_STDOUT, target.redirect_stdout)
            .with(CallFlags::REDIRECT_STDERR, target.redirect_stderr)
            .with(CallFlags::DISABLE_BUFFERING, target.disable_buffering)
            .with(CallFlags::AUTO_START, target.auto_start)
            .with(CallFlags::BACKGROUND, target.background);
        if let Some(piped) = &target.piped {
            self.compile_value(piped)?;
            flags.insert(CallFlags::HAS_PIPED_VALUE);
        }

        for (key, value) in &target.environment {
            self.emit_constant(Constant::String(key.clone()))?;
            self.compile_value(value)?;
        }
        let envc = u8::try_from(target.environment.len()).map_err(|_| {
            CompileError::too_many_operands(
                "environment variables",
                target.environment.len(),
                usize::from(u8::MAX),
            )
        })?;

        let op = match kind {
            CallKind::Plain => Op::CallProgram,
            CallKind::Root => Op::RootCallProgram,
            CallKind::MaybeRoot => Op::MaybeRootCallProgram,
        };
        let [hi, lo] = flags.bits().to_be_bytes();
        self.emit(op, &[argument_count(arguments)?, hi, lo, envc])?;
        Ok(())
    }
}

/// Names that closures created directly in this page capture. Bodies of
/// nested functions and closures are separate pages and are skipped.
fn collect_captured(expr: &Expr, captured: &mut HashSet<String>) {
    if let ExprKind::Closure { captures, .. } = &expr.kind {
        captured.extend(captures.iter().cloned());
    }
    for child in expr.children() {
        collect_captured(child, captured);
    }
}

fn argument_count(arguments: &[Expr]) -> Result<u8, CompileError> {
    u8::try_from(arguments.len()).map_err(|_| {
        CompileError::too_many_operands("arguments", arguments.len(), usize::from(u8::MAX))
    })
}

fn literal_constant(literal: &Literal) -> Constant {
    match literal {
        Literal::Nil => Constant::Nil,
        Literal::Boolean(b) => Constant::Boolean(*b),
        Literal::Integer(n) => Constant::Integer(*n),
        Literal::Float(n) => Constant::Float(*n),
        Literal::String(s) => Constant::String(s.clone()),
    }
}

fn binary_opcode(op: BinaryOperation) -> Op {
    match op {
        BinaryOperation::Add => Op::Add,
        BinaryOperation::Subtract => Op::Sub,
        BinaryOperation::Multiply => Op::Mul,
        BinaryOperation::Divide => Op::Div,
        BinaryOperation::Modulo => Op::Mod,
        BinaryOperation::Power => Op::Pow,
        BinaryOperation::Equal => Op::Equal,
        BinaryOperation::NotEqual => Op::NotEqual,
        BinaryOperation::Less => Op::Less,
        BinaryOperation::LessEqual => Op::LessEqual,
        BinaryOperation::Greater => Op::Greater,
        BinaryOperation::GreaterEqual => Op::GreaterEqual,
        BinaryOperation::And => Op::And,
        BinaryOperation::Or => Op::Or,
        BinaryOperation::In => Op::Contains,
    }
}
