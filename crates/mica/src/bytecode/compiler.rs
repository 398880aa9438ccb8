//! AST to bytecode compiler.
//!
//! Each nested function gets its own state: a locals table whose indices
//! are register slots, a scope depth, a stack-style scratch allocator
//! above the locals, a loop-context stack for `break` patching, and a
//! memoized upvalue descriptor list. Locals occupy the low registers
//! contiguously; scratch registers come and go above them, so after any
//! statement the allocator is back at the number of live locals.
//!
//! Name resolution order is local → upvalue (recursively through enclosing
//! functions) → global. Resolving through an enclosing local marks it
//! captured, which makes scope exit emit `CloseUpval` for its slot.

use crate::{
    ast::{AssignTarget, BinaryOp, ClosureBody, Expr, ExprKind, Stmt, StmtKind, UnaryOp},
    bytecode::{
        builder::{CodeBuilder, JumpLabel},
        code::{Proto, ProtoId, UpvalDesc},
        op::Opcode,
    },
    error::CompileError,
    heap::Heap,
    intern::Interner,
    value::Value,
};

/// A function may declare at most this many locals; one more is a
/// reported error and the declaration is dropped.
pub(crate) const LOCALS_MAX: usize = 256;
/// Upvalue descriptors per function; indices must fit in a byte.
pub(crate) const UPVALUES_MAX: usize = 256;
/// Parameters must fit the u8 arity operand.
pub(crate) const PARAMS_MAX: usize = 255;
/// Registers addressable by u8 operands.
const REGS_MAX: usize = 256;

/// Compiles a parsed program into a root prototype.
///
/// Nested prototypes are appended to `protos`; on failure everything this
/// call added is rolled back and its constant pools released.
pub(crate) fn compile(
    stmts: &[Stmt],
    heap: &mut Heap,
    interner: &mut Interner,
    protos: &mut Vec<Proto>,
) -> Result<ProtoId, Vec<CompileError>> {
    let start = protos.len();
    let mut compiler = Compiler {
        heap,
        interner,
        protos,
        funcs: vec![FuncState::new(None, &[])],
        errors: Vec::new(),
    };
    for stmt in stmts {
        compiler.statement(stmt);
    }
    compiler.emit_simple(Opcode::Ret, &[0]);

    let root = compiler.funcs.pop().expect("script function state missing");
    let max_regs = root.max_reg_u16();
    let (code, consts) = root.builder.into_parts();
    if compiler.errors.is_empty() {
        compiler.protos.push(Proto {
            code,
            consts,
            arity: 0,
            max_regs,
            upvals: root.upvals,
            name: None,
        });
        Ok(ProtoId::new(compiler.protos.len() - 1))
    } else {
        for value in consts {
            value.drop_with_heap(compiler.heap);
        }
        for proto in compiler.protos.drain(start..) {
            for value in proto.consts {
                value.drop_with_heap(compiler.heap);
            }
        }
        Err(compiler.errors)
    }
}

#[derive(Debug)]
struct Local {
    name: String,
    depth: u16,
    captured: bool,
    mutable: bool,
}

#[derive(Debug)]
struct LoopCtx {
    /// Bytecode offset of the loop head (target of the backward jump).
    start: usize,
    /// Scope depth at loop entry; `break` closes captured locals deeper
    /// than this before jumping out.
    scope_depth: u16,
    breaks: Vec<JumpLabel>,
}

#[derive(Debug)]
struct FuncState {
    builder: CodeBuilder,
    locals: Vec<Local>,
    scope_depth: u16,
    /// Next free register; locals live below, scratch above.
    free_reg: usize,
    /// High-water mark, i.e. the prototype's register window size.
    max_reg: usize,
    upvals: Vec<UpvalDesc>,
    loops: Vec<LoopCtx>,
    arity: u8,
    name: Option<Box<str>>,
}

impl FuncState {
    fn new(name: Option<&str>, params: &[String]) -> Self {
        let locals: Vec<Local> = params
            .iter()
            .map(|p| Local {
                name: p.clone(),
                depth: 0,
                captured: false,
                mutable: true,
            })
            .collect();
        let count = locals.len();
        Self {
            builder: CodeBuilder::new(),
            locals,
            scope_depth: 0,
            free_reg: count,
            max_reg: count,
            upvals: Vec::new(),
            loops: Vec::new(),
            arity: u8::try_from(count.min(PARAMS_MAX)).expect("parameter count exceeds u8"),
            name: name.map(Into::into),
        }
    }

    fn max_reg_u16(&self) -> u16 {
        u16::try_from(self.max_reg.max(1).min(REGS_MAX)).expect("register window exceeds u16")
    }
}

enum FnBody<'a> {
    Block(&'a [Stmt]),
    Expr(&'a Expr),
}

struct Compiler<'a> {
    heap: &'a mut Heap,
    interner: &'a mut Interner,
    protos: &'a mut Vec<Proto>,
    funcs: Vec<FuncState>,
    errors: Vec<CompileError>,
}

impl Compiler<'_> {
    fn func(&self) -> &FuncState {
        self.funcs.last().expect("function state stack empty")
    }

    fn func_mut(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("function state stack empty")
    }

    fn error(&mut self, line: u32, message: impl Into<String>) {
        self.errors.push(CompileError::new(line, message));
    }

    /// Top-level code outside any block compiles bindings to globals.
    fn at_global_scope(&self) -> bool {
        self.funcs.len() == 1 && self.func().scope_depth == 0
    }

    // === register allocation ===

    fn alloc_reg(&mut self, line: u32) -> u8 {
        let f = self.func_mut();
        if f.free_reg >= REGS_MAX {
            self.error(line, "function uses too many registers");
            return (REGS_MAX - 1) as u8;
        }
        let reg = f.free_reg;
        f.free_reg += 1;
        f.max_reg = f.max_reg.max(f.free_reg);
        reg as u8
    }

    /// Frees a scratch register. Locals are never freed here; they die
    /// with their scope.
    fn free_reg(&mut self, reg: u8) {
        let f = self.func_mut();
        let reg = usize::from(reg);
        if reg >= f.locals.len() && reg + 1 == f.free_reg {
            f.free_reg = reg;
        }
    }

    // === emission helpers ===

    fn emit_simple(&mut self, op: Opcode, operands: &[u8]) {
        let builder = &mut self.func_mut().builder;
        match operands {
            [] => builder.emit(op),
            [a] => builder.emit_u8(op, *a),
            [a, b] => builder.emit_u8_u8(op, *a, *b),
            [a, b, c] => builder.emit_u8_u8_u8(op, *a, *b, *c),
            _ => unreachable!("at most three register operands"),
        }
    }

    fn patch(&mut self, label: JumpLabel, line: u32) {
        if !self.func_mut().builder.patch_jump(label) {
            self.error(line, "too much code to jump over");
        }
    }

    fn emit_jump_back(&mut self, target: usize, line: u32) {
        if !self.func_mut().builder.emit_jump_back(target) {
            self.error(line, "loop body too large");
        }
    }

    /// Interns `name` and stores it in the constant pool; the pool owns
    /// the retained handle.
    fn name_const(&mut self, name: &str) -> u16 {
        let id = self.interner.intern(self.heap, name);
        self.func_mut().builder.add_const(Value::Ref(id))
    }

    // === scopes and locals ===

    fn begin_scope(&mut self) {
        self.func_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let f = self.func_mut();
        f.scope_depth -= 1;
        let depth = f.scope_depth;
        let mut closes = Vec::new();
        while let Some(local) = f.locals.last() {
            if local.depth <= depth {
                break;
            }
            if local.captured {
                closes.push((f.locals.len() - 1) as u8);
            }
            f.locals.pop();
        }
        f.free_reg = f.locals.len();
        for slot in closes {
            self.emit_simple(Opcode::CloseUpval, &[slot]);
        }
    }

    /// Reserves the next register and records the binding. Returns `None`
    /// when the locals table is full (declaration dropped, error
    /// recorded).
    fn declare_local(&mut self, name: &str, mutable: bool, line: u32) -> Option<u8> {
        if self.func().locals.len() >= LOCALS_MAX {
            self.error(line, format!("too many local variables in function (limit {LOCALS_MAX})"));
            return None;
        }
        let slot = self.alloc_reg(line);
        let f = self.func_mut();
        debug_assert_eq!(usize::from(slot), f.locals.len(), "locals must stay contiguous");
        f.locals.push(Local {
            name: name.to_owned(),
            depth: f.scope_depth,
            captured: false,
            mutable,
        });
        Some(slot)
    }

    fn resolve_local_in(&self, func: usize, name: &str) -> Option<usize> {
        self.funcs[func].locals.iter().rposition(|l| l.name == name)
    }

    fn resolve_upvalue_in(&mut self, func: usize, name: &str, line: u32) -> Option<u8> {
        if func == 0 {
            return None;
        }
        let parent = func - 1;
        if let Some(slot) = self.resolve_local_in(parent, name) {
            self.funcs[parent].locals[slot].captured = true;
            let desc = UpvalDesc {
                is_local: true,
                index: slot as u8,
            };
            return Some(self.add_upvalue(func, desc, line));
        }
        if let Some(index) = self.resolve_upvalue_in(parent, name, line) {
            let desc = UpvalDesc { is_local: false, index };
            return Some(self.add_upvalue(func, desc, line));
        }
        None
    }

    fn add_upvalue(&mut self, func: usize, desc: UpvalDesc, line: u32) -> u8 {
        let upvals = &mut self.funcs[func].upvals;
        if let Some(existing) = upvals.iter().position(|u| *u == desc) {
            return existing as u8;
        }
        if upvals.len() >= UPVALUES_MAX {
            self.error(line, format!("too many upvalues in function (limit {UPVALUES_MAX})"));
            return 0;
        }
        upvals.push(desc);
        (upvals.len() - 1) as u8
    }

    // === statements ===

    fn statement(&mut self, stmt: &Stmt) {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Let { name, mutable, init } => self.let_statement(name, *mutable, init, line),
            StmtKind::Fn { name, params, body } => self.fn_statement(name, params, body, line),
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => self.if_statement(cond, then_block, else_block.as_deref(), line),
            StmtKind::While { cond, body } => self.while_statement(cond, body, line),
            StmtKind::ForIn { var, iterable, body } => self.for_statement(var, iterable, body, line),
            StmtKind::Loop { body } => self.loop_statement(body, line),
            StmtKind::Break => self.break_statement(line),
            StmtKind::Return(value) => self.return_statement(value.as_ref(), line),
            StmtKind::Block(stmts) => {
                self.begin_scope();
                for stmt in stmts {
                    self.statement(stmt);
                }
                self.end_scope();
            }
            StmtKind::Assign { target, value } => self.assign_statement(target, value, line),
            StmtKind::Expr(expr) => {
                let reg = self.expression(expr);
                self.free_reg(reg);
            }
        }
        // Scratch registers drain back to the live locals after every
        // statement; anything else is a compiler bug.
        debug_assert_eq!(
            self.func().free_reg,
            self.func().locals.len(),
            "scratch registers leaked past a statement"
        );
    }

    fn let_statement(&mut self, name: &str, mutable: bool, init: &Expr, line: u32) {
        if self.at_global_scope() {
            let reg = self.expression(init);
            let k = self.name_const(name);
            self.func_mut().builder.emit_u16_u8(Opcode::StoreGlobal, k, reg);
            self.free_reg(reg);
            return;
        }
        if self.func().locals.len() >= LOCALS_MAX {
            self.error(line, format!("too many local variables in function (limit {LOCALS_MAX})"));
            let reg = self.expression(init);
            self.free_reg(reg);
            return;
        }
        // Reserve the slot first so the initializer lands directly in it,
        // but record the binding only afterwards: `let x = x` refers to
        // the enclosing x.
        let slot = self.alloc_reg(line);
        self.expression_into(init, slot);
        let f = self.func_mut();
        f.locals.push(Local {
            name: name.to_owned(),
            depth: f.scope_depth,
            captured: false,
            mutable,
        });
    }

    fn fn_statement(&mut self, name: &str, params: &[String], body: &[Stmt], line: u32) {
        if self.at_global_scope() {
            let (proto, upvals) = self.function(Some(name), params, FnBody::Block(body), line);
            let dest = self.alloc_reg(line);
            self.emit_closure(proto, dest, &upvals);
            let k = self.name_const(name);
            self.func_mut().builder.emit_u16_u8(Opcode::StoreGlobal, k, dest);
            self.free_reg(dest);
            return;
        }
        // Declare before compiling the body so the function can recurse
        // through an upvalue on its own slot.
        let Some(slot) = self.declare_local(name, false, line) else {
            let (_, _) = self.function(Some(name), params, FnBody::Block(body), line);
            return;
        };
        let (proto, upvals) = self.function(Some(name), params, FnBody::Block(body), line);
        self.emit_closure(proto, slot, &upvals);
    }

    fn if_statement(&mut self, cond: &Expr, then_block: &[Stmt], else_block: Option<&[Stmt]>, line: u32) {
        let rc = self.expression(cond);
        let else_jump = self.func_mut().builder.emit_jump(Opcode::JumpIfNot, Some(rc));
        self.free_reg(rc);
        self.begin_scope();
        for stmt in then_block {
            self.statement(stmt);
        }
        self.end_scope();
        if let Some(else_block) = else_block {
            let end_jump = self.func_mut().builder.emit_jump(Opcode::Jump, None);
            self.patch(else_jump, line);
            self.begin_scope();
            for stmt in else_block {
                self.statement(stmt);
            }
            self.end_scope();
            self.patch(end_jump, line);
        } else {
            self.patch(else_jump, line);
        }
    }

    fn while_statement(&mut self, cond: &Expr, body: &[Stmt], line: u32) {
        let start = self.func().builder.current_offset();
        let rc = self.expression(cond);
        let exit = self.func_mut().builder.emit_jump(Opcode::JumpIfNot, Some(rc));
        self.free_reg(rc);
        self.loop_body(start, body, line);
        self.patch(exit, line);
        self.patch_breaks(line);
    }

    fn loop_statement(&mut self, body: &[Stmt], line: u32) {
        let start = self.func().builder.current_offset();
        self.loop_body(start, body, line);
        self.patch_breaks(line);
    }

    /// `for x in e` lowers to an iterator pump over two hidden locals:
    ///
    /// ```text
    /// iter := ITER_NEW(e)
    /// head: t := ITER_HAS_NEXT(iter); JMP_IF_NOT t, exit
    ///       x := ITER_NEXT(iter)
    ///       body
    ///       JMP head
    /// ```
    fn for_statement(&mut self, var: &str, iterable: &Expr, body: &[Stmt], line: u32) {
        self.begin_scope();
        let Some(iter_slot) = self.declare_local("(for-iter)", false, line) else {
            self.end_scope();
            return;
        };
        let source = self.expression(iterable);
        self.emit_simple(Opcode::IterNew, &[source, iter_slot]);
        self.free_reg(source);
        let Some(var_slot) = self.declare_local(var, false, line) else {
            self.end_scope();
            return;
        };

        let start = self.func().builder.current_offset();
        let probe = self.alloc_reg(line);
        self.emit_simple(Opcode::IterHasNext, &[iter_slot, probe]);
        let exit = self.func_mut().builder.emit_jump(Opcode::JumpIfNot, Some(probe));
        self.free_reg(probe);
        self.emit_simple(Opcode::IterNext, &[iter_slot, var_slot]);

        self.loop_body(start, body, line);
        self.patch(exit, line);
        self.patch_breaks(line);
        self.end_scope();
    }

    /// Shared trailer of every loop form: push the loop context, compile
    /// the body in its own scope, jump back to the head.
    fn loop_body(&mut self, start: usize, body: &[Stmt], line: u32) {
        let scope_depth = self.func().scope_depth;
        self.func_mut().loops.push(LoopCtx {
            start,
            scope_depth,
            breaks: Vec::new(),
        });
        self.begin_scope();
        for stmt in body {
            self.statement(stmt);
        }
        self.end_scope();
        let target = self.func().loops.last().expect("loop context missing").start;
        self.emit_jump_back(target, line);
    }

    fn patch_breaks(&mut self, line: u32) {
        let ctx = self.func_mut().loops.pop().expect("loop context missing");
        for label in ctx.breaks {
            self.patch(label, line);
        }
    }

    fn break_statement(&mut self, line: u32) {
        if self.func().loops.is_empty() {
            self.error(line, "break outside of a loop");
            return;
        }
        // Locals belonging to the loop body die at the jump; close any
        // the body's closures captured.
        let loop_depth = self.func().loops.last().expect("loop context missing").scope_depth;
        let closes: Vec<u8> = self
            .func()
            .locals
            .iter()
            .enumerate()
            .filter(|(_, l)| l.depth > loop_depth && l.captured)
            .map(|(slot, _)| slot as u8)
            .collect();
        for slot in closes {
            self.emit_simple(Opcode::CloseUpval, &[slot]);
        }
        let label = self.func_mut().builder.emit_jump(Opcode::Jump, None);
        self.func_mut()
            .loops
            .last_mut()
            .expect("loop context missing")
            .breaks
            .push(label);
    }

    fn return_statement(&mut self, value: Option<&Expr>, _line: u32) {
        match value {
            Some(expr) => {
                let reg = self.expression(expr);
                self.emit_simple(Opcode::Ret, &[1, reg]);
                self.free_reg(reg);
            }
            None => self.emit_simple(Opcode::Ret, &[0]),
        }
    }

    fn assign_statement(&mut self, target: &AssignTarget, value: &Expr, line: u32) {
        match target {
            AssignTarget::Name(name) => {
                let current = self.funcs.len() - 1;
                if let Some(slot) = self.resolve_local_in(current, name) {
                    if !self.funcs[current].locals[slot].mutable {
                        self.error(line, format!("cannot assign to immutable binding '{name}'"));
                    }
                    let reg = self.expression(value);
                    self.emit_simple(Opcode::StoreLocal, &[slot as u8, reg]);
                    self.free_reg(reg);
                } else if let Some(upval) = self.resolve_upvalue_in(current, name, line) {
                    let reg = self.expression(value);
                    self.emit_simple(Opcode::StoreUpval, &[upval, reg]);
                    self.free_reg(reg);
                } else {
                    let reg = self.expression(value);
                    let k = self.name_const(name);
                    self.func_mut().builder.emit_u16_u8(Opcode::StoreGlobal, k, reg);
                    self.free_reg(reg);
                }
            }
            AssignTarget::Index { target, index } => {
                let ra = self.expression(target);
                let ri = self.expression(index);
                let rv = self.expression(value);
                self.emit_simple(Opcode::ArraySet, &[ra, ri, rv]);
                self.free_reg(rv);
                self.free_reg(ri);
                self.free_reg(ra);
            }
        }
    }

    // === expressions ===

    /// Compiles an expression, returning the register holding the result.
    /// Reading a plain local returns its slot directly; everything else
    /// lands in a fresh scratch register.
    fn expression(&mut self, expr: &Expr) -> u8 {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Bool(_) | ExprKind::None | ExprKind::Str(_) => {
                let dest = self.alloc_reg(line);
                self.load_literal(expr, dest);
                dest
            }
            ExprKind::Name(name) => {
                let current = self.funcs.len() - 1;
                if let Some(slot) = self.resolve_local_in(current, name) {
                    return slot as u8;
                }
                let dest = self.alloc_reg(line);
                if let Some(upval) = self.resolve_upvalue_in(current, name, line) {
                    self.emit_simple(Opcode::LoadUpval, &[upval, dest]);
                } else {
                    let k = self.name_const(name);
                    self.func_mut().builder.emit_u16_u8(Opcode::LoadGlobal, k, dest);
                }
                dest
            }
            ExprKind::Array(elems) => {
                let dest = self.alloc_reg(line);
                let cap = elems.len().min(255) as u8;
                self.emit_simple(Opcode::ArrayNew, &[cap, dest]);
                for elem in elems {
                    let reg = self.expression(elem);
                    self.emit_simple(Opcode::ArrayPush, &[dest, reg]);
                    self.free_reg(reg);
                }
                dest
            }
            ExprKind::Unary { op: UnaryOp::Neg, operand } => {
                let reg = self.expression(operand);
                self.free_reg(reg);
                let dest = self.alloc_reg(line);
                self.emit_simple(Opcode::Neg, &[reg, dest]);
                dest
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let ra = self.expression(lhs);
                let rb = self.expression(rhs);
                self.free_reg(rb);
                self.free_reg(ra);
                let dest = self.alloc_reg(line);
                self.emit_simple(binary_opcode(*op), &[ra, rb, dest]);
                dest
            }
            ExprKind::Logical { and, lhs, rhs } => {
                // Short-circuit: the result register holds the deciding
                // operand.
                let dest = self.alloc_reg(line);
                self.expression_into(lhs, dest);
                let op = if *and { Opcode::JumpIfNot } else { Opcode::JumpIf };
                let end = self.func_mut().builder.emit_jump(op, Some(dest));
                self.expression_into(rhs, dest);
                self.patch(end, line);
                dest
            }
            ExprKind::Call { callee, args } => self.call(callee, args, line),
            ExprKind::Index { target, index } => {
                let ra = self.expression(target);
                let ri = self.expression(index);
                self.free_reg(ri);
                self.free_reg(ra);
                let dest = self.alloc_reg(line);
                self.emit_simple(Opcode::ArrayGet, &[ra, ri, dest]);
                dest
            }
            ExprKind::Closure { params, body } => {
                let fn_body = match body {
                    ClosureBody::Expr(expr) => FnBody::Expr(expr),
                    ClosureBody::Block(stmts) => FnBody::Block(stmts),
                };
                let (proto, upvals) = self.function(None, params, fn_body, line);
                let dest = self.alloc_reg(line);
                self.emit_closure(proto, dest, &upvals);
                dest
            }
            ExprKind::IterChain { source, methods } => {
                if let Some(method) = methods.first() {
                    self.error(
                        method.line,
                        format!("iterator method chains are not implemented (found '.{}')", method.name),
                    );
                }
                self.expression(source)
            }
        }
    }

    /// Compiles an expression directly into `dest`, avoiding a scratch
    /// register for literals and locals. The general case compiles
    /// normally and moves the result.
    fn expression_into(&mut self, expr: &Expr, dest: u8) {
        match &expr.kind {
            ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Bool(_) | ExprKind::None | ExprKind::Str(_) => {
                self.load_literal(expr, dest);
            }
            ExprKind::Name(name) => {
                let current = self.funcs.len() - 1;
                if let Some(slot) = self.resolve_local_in(current, name) {
                    self.emit_simple(Opcode::LoadLocal, &[slot as u8, dest]);
                } else if let Some(upval) = self.resolve_upvalue_in(current, name, expr.line) {
                    self.emit_simple(Opcode::LoadUpval, &[upval, dest]);
                } else {
                    let k = self.name_const(name);
                    self.func_mut().builder.emit_u16_u8(Opcode::LoadGlobal, k, dest);
                }
            }
            _ => {
                let reg = self.expression(expr);
                if reg != dest {
                    self.emit_simple(Opcode::Move, &[reg, dest]);
                }
                self.free_reg(reg);
            }
        }
    }

    fn load_literal(&mut self, expr: &Expr, dest: u8) {
        let value = match &expr.kind {
            ExprKind::Int(v) => Value::Int(*v),
            ExprKind::Float(v) => Value::Float(*v),
            ExprKind::Bool(v) => Value::Bool(*v),
            ExprKind::None => Value::None,
            ExprKind::Str(text) => Value::Ref(self.interner.intern(self.heap, text)),
            _ => unreachable!("load_literal called on a non-literal"),
        };
        let k = self.func_mut().builder.add_const(value);
        self.func_mut().builder.emit_u16_u8(Opcode::LoadConst, k, dest);
    }

    /// Calls stage the callee in a fresh register R and force each
    /// argument into R+1, R+2, … so the VM can make R+1 the callee's
    /// frame base.
    fn call(&mut self, callee: &Expr, args: &[Expr], line: u32) -> u8 {
        if args.len() > PARAMS_MAX {
            self.error(line, format!("too many arguments (limit {PARAMS_MAX})"));
        }
        let base = self.alloc_reg(line);
        self.expression_into(callee, base);
        for arg in args {
            let slot = self.alloc_reg(line);
            self.expression_into(arg, slot);
        }
        // The call frame consumes the staged registers; the result reuses
        // the callee slot.
        self.func_mut().free_reg = usize::from(base);
        let dest = self.alloc_reg(line);
        let nargs = args.len().min(PARAMS_MAX) as u8;
        self.emit_simple(Opcode::Call, &[base, nargs, dest]);
        dest
    }

    fn emit_closure(&mut self, proto: ProtoId, dest: u8, upvals: &[UpvalDesc]) {
        let count = upvals.len() as u16;
        self.func_mut().builder.emit_closure(proto.raw(), dest, count);
        for desc in upvals {
            self.func_mut().builder.emit_upvalue(desc.is_local, desc.index);
        }
    }

    /// Compiles a nested function body with a fresh state whose enclosing
    /// link is the current one, appends its prototype, and hands back the
    /// upvalue descriptors for the `Closure` instruction.
    fn function(&mut self, name: Option<&str>, params: &[String], body: FnBody<'_>, line: u32) -> (ProtoId, Vec<UpvalDesc>) {
        if params.len() > PARAMS_MAX {
            self.error(line, format!("too many parameters (limit {PARAMS_MAX})"));
        }
        self.funcs.push(FuncState::new(name, params));
        match body {
            FnBody::Block(stmts) => {
                for stmt in stmts {
                    self.statement(stmt);
                }
            }
            FnBody::Expr(expr) => {
                // Expression bodies implicitly return their value.
                let reg = self.expression(expr);
                self.emit_simple(Opcode::Ret, &[1, reg]);
                self.free_reg(reg);
            }
        }
        // An explicit `return` earlier wins; this backstop covers falling
        // off the end.
        self.emit_simple(Opcode::Ret, &[0]);

        let fs = self.funcs.pop().expect("function state stack empty");
        let max_regs = fs.max_reg_u16();
        let (code, consts) = fs.builder.into_parts();
        self.protos.push(Proto {
            code,
            consts,
            arity: fs.arity,
            max_regs,
            upvals: fs.upvals.clone(),
            name: fs.name,
        });
        (ProtoId::new(self.protos.len() - 1), fs.upvals)
    }
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Mod => Opcode::Mod,
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Ne => Opcode::Ne,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Ge => Opcode::Ge,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;

    struct Compiled {
        protos: Vec<Proto>,
        root: ProtoId,
    }

    fn compile_ok(source: &str) -> Compiled {
        let stmts = parse(source).expect("parse failed");
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let mut protos = Vec::new();
        let root = compile(&stmts, &mut heap, &mut interner, &mut protos).expect("compile failed");
        Compiled { protos, root }
    }

    fn compile_errors(source: &str) -> Vec<CompileError> {
        let stmts = parse(source).expect("parse failed");
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let mut protos = Vec::new();
        compile(&stmts, &mut heap, &mut interner, &mut protos).expect_err("expected compile failure")
    }

    #[test]
    fn global_let_bytecode() {
        let compiled = compile_ok("let x = 1");
        let root = &compiled.protos[compiled.root.index()];
        assert_eq!(
            root.code,
            vec![
                Opcode::LoadConst as u8,
                0,
                0,
                0,
                Opcode::StoreGlobal as u8,
                0,
                1,
                0,
                Opcode::Ret as u8,
                0,
            ]
        );
        assert!(matches!(root.consts[0], Value::Int(1)));
        assert!(matches!(root.consts[1], Value::Ref(_)));
    }

    #[test]
    fn locals_stay_contiguous_and_window_is_tracked() {
        let compiled = compile_ok("fn f() { let a = 1 let b = 2 return a + b }");
        // Root plus the function.
        assert_eq!(compiled.protos.len(), 2);
        let f = &compiled.protos[0];
        assert_eq!(f.arity, 0);
        // Two locals plus one scratch for the addition result.
        assert_eq!(f.max_regs, 3);
    }

    #[test]
    fn closure_captures_enclosing_local() {
        let compiled = compile_ok("fn make() { let mut c = 0 return || { c = c + 1 return c } }");
        // protos: inner closure, make, root.
        assert_eq!(compiled.protos.len(), 3);
        let inner = &compiled.protos[0];
        assert_eq!(inner.upvals, vec![UpvalDesc { is_local: true, index: 0 }]);
        let make = &compiled.protos[1];
        assert_eq!(make.upvals, vec![]);
        // make's scope end runs through Ret, which closes captured slots.
        assert_eq!(make.name.as_deref(), Some("make"));
    }

    #[test]
    fn sibling_closures_share_one_descriptor_each() {
        let compiled = compile_ok(
            "fn pair() { let mut c = 0
               let inc = || { c = c + 1 }
               let get = || { return c }
               return [inc, get] }",
        );
        let inc = &compiled.protos[0];
        let get = &compiled.protos[1];
        assert_eq!(inc.upvals, vec![UpvalDesc { is_local: true, index: 0 }]);
        assert_eq!(get.upvals, vec![UpvalDesc { is_local: true, index: 0 }]);
    }

    #[test]
    fn nested_capture_forwards_through_middle_function() {
        let compiled = compile_ok("fn outer() { let x = 1 return || { return || { return x } } }");
        // protos order: innermost, middle, outer, root.
        let innermost = &compiled.protos[0];
        let middle = &compiled.protos[1];
        assert_eq!(innermost.upvals, vec![UpvalDesc { is_local: false, index: 0 }]);
        assert_eq!(middle.upvals, vec![UpvalDesc { is_local: true, index: 0 }]);
    }

    #[test]
    fn upvalue_descriptors_are_memoized() {
        let compiled = compile_ok("fn f() { let mut c = 0 return || { c = c + 1 return c + c } }");
        let inner = &compiled.protos[0];
        assert_eq!(inner.upvals.len(), 1);
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let errors = compile_errors("break");
        assert!(errors[0].message.contains("break outside of a loop"));
    }

    #[test]
    fn assignment_to_immutable_local_is_reported() {
        let errors = compile_errors("fn f() { let x = 1 x = 2 }");
        assert!(errors[0].message.contains("cannot assign to immutable binding 'x'"));
    }

    #[test]
    fn immutable_assignment_does_not_stop_error_collection() {
        let errors = compile_errors("fn f() { let x = 1 x = 2 break }");
        assert_eq!(errors.len(), 2);
        assert!(errors[1].message.contains("break outside of a loop"));
    }

    #[test]
    fn locals_limit_is_enforced() {
        let mut source = String::from("fn f() {\n");
        for i in 0..256 {
            source.push_str(&format!("let v{i} = {i}\n"));
        }
        source.push('}');
        let compiled = compile_ok(&source);
        assert_eq!(compiled.protos[0].max_regs, 256);

        let mut source = String::from("fn f() {\n");
        for i in 0..257 {
            source.push_str(&format!("let v{i} = {i}\n"));
        }
        source.push('}');
        let errors = compile_errors(&source);
        assert!(errors[0].message.contains("too many local variables"));
    }

    #[test]
    fn iterator_chain_methods_are_rejected() {
        let errors = compile_errors("let a = [1] let s = a.iter().map(|x| x)");
        assert!(errors[0].message.contains("iterator method chains are not implemented"));
    }

    #[test]
    fn bare_iter_chain_lowers_to_its_source() {
        // No methods attached: compiles to the source expression alone.
        let compiled = compile_ok("let a = [1] let b = a.iter()");
        assert_eq!(compiled.protos.len(), 1);
    }

    #[test]
    fn failed_compile_releases_interned_constants() {
        let stmts = parse("let s = \"text\" break").expect("parse failed");
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let mut protos = Vec::new();
        let result = compile(&stmts, &mut heap, &mut interner, &mut protos);
        assert!(result.is_err());
        assert!(protos.is_empty());
        // Only the interner's own references remain.
        assert_eq!(heap.live_objects(), interner.len());
    }

    #[test]
    fn call_stages_arguments_contiguously() {
        let compiled = compile_ok("fn add(a, b) { return a + b } let r = add(1, 2)");
        let root = &compiled.protos[compiled.root.index()];
        // Find the Call instruction: callee register, two args, dest.
        let code = &root.code;
        let pos = code
            .iter()
            .position(|&b| b == Opcode::Call as u8)
            .expect("no call emitted");
        assert_eq!(&code[pos + 1..pos + 4], &[0, 2, 0]);
    }

    #[test]
    fn for_in_uses_hidden_iterator_local() {
        let compiled = compile_ok("let a = [1, 2] for x in a { print(x) }");
        let root = &compiled.protos[compiled.root.index()];
        let code = &root.code;
        assert!(code.contains(&(Opcode::IterNew as u8)));
        assert!(code.contains(&(Opcode::IterHasNext as u8)));
        assert!(code.contains(&(Opcode::IterNext as u8)));
    }
}
