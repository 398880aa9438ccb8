//! The register virtual machine.
//!
//! Each call frame sees a window of the shared register file starting at
//! its base; register operands in bytecode are window-relative. The
//! dispatch loop caches the current frame's code, ip, and base locally
//! and reloads the cache whenever the frame stack changes (call, return).
//!
//! Upvalues follow the open-list protocol: while a captured slot is
//! alive, its cell points into the register file and sits on a list
//! sorted by descending slot, so closing everything at or above a slot is
//! a prefix drain. `Ret` and `CloseUpval` migrate cells to their own
//! storage before the slots die.

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::{
    bytecode::{
        code::{Proto, ProtoId},
        op::Opcode,
    },
    error::{RunError, RunErrorKind},
    heap::{Closure, Heap, HeapData, HeapId, Iter, Upvalue},
    intern::Interner,
    io::PrintWriter,
    object::{NativeCtx, NativeEntry, Object},
    value::{NativeId, Value},
};

/// Fatal depth for the call-frame stack.
pub(crate) const FRAMES_MAX: usize = 64;
/// Hard cap on the register file; deep recursion with wide windows hits
/// the frame cap first in practice.
pub(crate) const REGISTER_LIMIT: usize = 16 * 1024;

/// Runtime activation record.
#[derive(Debug)]
pub(crate) struct Frame {
    pub closure: HeapId,
    pub ip: usize,
    /// Absolute register-file index of window slot 0.
    pub base: usize,
    /// Caller register for the return value; `None` for top-level frames,
    /// whose result is discarded.
    pub ret_reg: Option<usize>,
}

/// One entry of the open-upvalue list. The list owns a retained reference
/// to the cell; it is released when the cell closes.
#[derive(Debug)]
pub(crate) struct OpenUpval {
    pub slot: usize,
    pub id: HeapId,
}

/// Frame state cached outside `self` so operand fetches don't re-borrow
/// the frame stack. The code and constant slices borrow from the
/// prototype table, whose lifetime is independent of `&mut Machine`.
struct CachedFrame<'p> {
    code: &'p [u8],
    consts: &'p [Value],
    ip: usize,
    base: usize,
    closure: HeapId,
    max_regs: usize,
}

macro_rules! fetch_u8 {
    ($frame:expr) => {{
        let byte = $frame.code[$frame.ip];
        $frame.ip += 1;
        byte
    }};
}

macro_rules! fetch_u16 {
    ($frame:expr) => {{
        let hi = $frame.code[$frame.ip];
        let lo = $frame.code[$frame.ip + 1];
        $frame.ip += 2;
        u16::from_be_bytes([hi, lo])
    }};
}

macro_rules! fetch_i16 {
    ($frame:expr) => {{
        let hi = $frame.code[$frame.ip];
        let lo = $frame.code[$frame.ip + 1];
        $frame.ip += 2;
        i16::from_be_bytes([hi, lo])
    }};
}

/// Applies a relative jump to the cached ip. The offset is relative to
/// the byte after the two offset bytes, which is exactly where the ip
/// points after fetching.
macro_rules! jump_relative {
    ($frame:expr, $offset:expr) => {{
        let target = $frame.ip as i64 + i64::from($offset);
        $frame.ip = usize::try_from(target).expect("jump landed before the code start");
    }};
}

/// Either side of a numeric binary operation after promotion.
enum NumPair {
    Ints(i32, i32),
    Floats(f32, f32),
}

/// The VM proper: borrows all interpreter state for the duration of one
/// `run` call.
pub(crate) struct Machine<'a> {
    pub registers: &'a mut Vec<Value>,
    pub frames: &'a mut Vec<Frame>,
    pub open_upvals: &'a mut Vec<OpenUpval>,
    pub heap: &'a mut Heap,
    pub interner: &'a mut Interner,
    pub globals: &'a mut IndexMap<HeapId, Value>,
    pub natives: &'a [NativeEntry],
    pub protos: &'a [Proto],
    pub print: &'a mut dyn PrintWriter,
}

impl<'a> Machine<'a> {
    /// Drives the dispatch loop until the frame that is topmost on entry
    /// returns (together with every frame it pushes transitively) or a
    /// fatal error occurs. On error the frame stack is left as-is;
    /// teardown happens when the interpreter is dropped.
    pub fn run(&mut self) -> Result<(), RunError> {
        if self.frames.is_empty() {
            return Ok(());
        }
        let stop_depth = self.frames.len() - 1;
        let mut frame = self.cached_frame();

        loop {
            let byte = fetch_u8!(frame);
            let Some(op) = Opcode::from_repr(byte) else {
                return Err(RunError::new(RunErrorKind::BadOpcode, format!("byte {byte:#04x}")));
            };

            match op {
                Opcode::Nop => {}
                Opcode::LoadConst => {
                    let k = usize::from(fetch_u16!(frame));
                    let d = usize::from(fetch_u8!(frame));
                    let value = frame.consts[k].clone_with_heap(self.heap);
                    self.set_reg(frame.base + d, value);
                }
                Opcode::LoadLocal => {
                    let i = usize::from(fetch_u8!(frame));
                    let d = usize::from(fetch_u8!(frame));
                    let value = self.registers[frame.base + i].clone_with_heap(self.heap);
                    self.set_reg(frame.base + d, value);
                }
                Opcode::StoreLocal => {
                    let i = usize::from(fetch_u8!(frame));
                    let s = usize::from(fetch_u8!(frame));
                    let value = self.registers[frame.base + s].clone_with_heap(self.heap);
                    self.set_reg(frame.base + i, value);
                }
                Opcode::Move => {
                    let s = usize::from(fetch_u8!(frame));
                    let d = usize::from(fetch_u8!(frame));
                    let value = self.registers[frame.base + s].clone_with_heap(self.heap);
                    self.set_reg(frame.base + d, value);
                }
                Opcode::LoadUpval => {
                    let u = fetch_u8!(frame);
                    let d = usize::from(fetch_u8!(frame));
                    let cell = self.upvalue_cell(frame.closure, u);
                    let value = match self.heap.get(cell) {
                        HeapData::Upvalue(Upvalue::Open(slot)) => self.registers[*slot].clone_with_heap(self.heap),
                        HeapData::Upvalue(Upvalue::Closed(value)) => value.clone_with_heap(self.heap),
                        other => panic!("upvalue cell holds {other:?}"),
                    };
                    self.set_reg(frame.base + d, value);
                }
                Opcode::StoreUpval => {
                    let u = fetch_u8!(frame);
                    let s = usize::from(fetch_u8!(frame));
                    let cell = self.upvalue_cell(frame.closure, u);
                    let value = self.registers[frame.base + s].clone_with_heap(self.heap);
                    let open_slot = match self.heap.get(cell) {
                        HeapData::Upvalue(Upvalue::Open(slot)) => Some(*slot),
                        HeapData::Upvalue(Upvalue::Closed(_)) => None,
                        other => panic!("upvalue cell holds {other:?}"),
                    };
                    match open_slot {
                        Some(slot) => self.set_reg(slot, value),
                        None => {
                            let old = self.heap.upvalue_replace(cell, value);
                            old.drop_with_heap(self.heap);
                        }
                    }
                }
                Opcode::LoadGlobal => {
                    let k = usize::from(fetch_u16!(frame));
                    let d = usize::from(fetch_u8!(frame));
                    let name = Self::name_constant(frame.consts, k);
                    if let Some(value) = self.globals.get(&name) {
                        let value = value.clone_with_heap(self.heap);
                        self.set_reg(frame.base + d, value);
                    } else if let Some(index) = self.natives.iter().position(|n| n.name == name) {
                        self.set_reg(frame.base + d, Value::Native(NativeId::new(index)));
                    } else {
                        return Err(RunError::new(
                            RunErrorKind::UndefinedVariable,
                            format!("'{}'", self.heap.str_text(name)),
                        ));
                    }
                }
                Opcode::StoreGlobal => {
                    let k = usize::from(fetch_u16!(frame));
                    let s = usize::from(fetch_u8!(frame));
                    let name = Self::name_constant(frame.consts, k);
                    let value = self.registers[frame.base + s].clone_with_heap(self.heap);
                    match self.globals.insert(name, value) {
                        Some(old) => old.drop_with_heap(self.heap),
                        // First insert: the table retains the name too.
                        None => self.heap.inc_ref(name),
                    }
                }
                Opcode::Add => self.binary_arith(&mut frame, "+", |x, y| x.wrapping_add(y), |x, y| x + y)?,
                Opcode::Sub => self.binary_arith(&mut frame, "-", |x, y| x.wrapping_sub(y), |x, y| x - y)?,
                Opcode::Mul => self.binary_arith(&mut frame, "*", |x, y| x.wrapping_mul(y), |x, y| x * y)?,
                Opcode::Div => {
                    let (a, b, d) = fetch_abc(&mut frame);
                    let result = match self.numeric_pair(frame.base, a, b, "/")? {
                        NumPair::Ints(_, 0) => {
                            return Err(RunError::new(RunErrorKind::DivisionByZero, "integer division by zero"));
                        }
                        NumPair::Ints(x, y) => Value::Int(x.wrapping_div(y)),
                        NumPair::Floats(x, y) => Value::Float(x / y),
                    };
                    self.set_reg(frame.base + d, result);
                }
                Opcode::Mod => {
                    let (a, b, d) = fetch_abc(&mut frame);
                    let result = match self.numeric_pair(frame.base, a, b, "%")? {
                        NumPair::Ints(_, 0) => {
                            return Err(RunError::new(RunErrorKind::DivisionByZero, "integer modulo by zero"));
                        }
                        NumPair::Ints(x, y) => Value::Int(x.wrapping_rem(y)),
                        NumPair::Floats(x, y) => Value::Float(x % y),
                    };
                    self.set_reg(frame.base + d, result);
                }
                Opcode::Neg => {
                    let s = usize::from(fetch_u8!(frame));
                    let d = usize::from(fetch_u8!(frame));
                    let result = match &self.registers[frame.base + s] {
                        Value::Int(v) => Value::Int(v.wrapping_neg()),
                        Value::Float(v) => Value::Float(-v),
                        other => {
                            return Err(self.type_error(format!("cannot negate {}", self.type_name_of(other))));
                        }
                    };
                    self.set_reg(frame.base + d, result);
                }
                Opcode::Eq | Opcode::Ne => {
                    let (a, b, d) = fetch_abc(&mut frame);
                    let equal = self.registers[frame.base + a].equals(&self.registers[frame.base + b]);
                    let result = if op == Opcode::Eq { equal } else { !equal };
                    self.set_reg(frame.base + d, Value::Bool(result));
                }
                Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                    let (a, b, d) = fetch_abc(&mut frame);
                    let ordered = match self.ordering_pair(frame.base, a, b)? {
                        NumPair::Ints(x, y) => match op {
                            Opcode::Lt => x < y,
                            Opcode::Le => x <= y,
                            Opcode::Gt => x > y,
                            _ => x >= y,
                        },
                        NumPair::Floats(x, y) => match op {
                            Opcode::Lt => x < y,
                            Opcode::Le => x <= y,
                            Opcode::Gt => x > y,
                            _ => x >= y,
                        },
                    };
                    self.set_reg(frame.base + d, Value::Bool(ordered));
                }
                Opcode::Jump => {
                    let offset = fetch_i16!(frame);
                    jump_relative!(frame, offset);
                }
                Opcode::JumpIf => {
                    let r = usize::from(fetch_u8!(frame));
                    let offset = fetch_i16!(frame);
                    if self.registers[frame.base + r].truthy() {
                        jump_relative!(frame, offset);
                    }
                }
                Opcode::JumpIfNot => {
                    let r = usize::from(fetch_u8!(frame));
                    let offset = fetch_i16!(frame);
                    if !self.registers[frame.base + r].truthy() {
                        jump_relative!(frame, offset);
                    }
                }
                Opcode::Call => {
                    let f = usize::from(fetch_u8!(frame));
                    let n = usize::from(fetch_u8!(frame));
                    let d = usize::from(fetch_u8!(frame));
                    self.call(&mut frame, f, n, d)?;
                }
                Opcode::Ret => {
                    let n = fetch_u8!(frame);
                    // The result is a retained copy, not a take: the slot
                    // may also be a captured local that still has to close
                    // over its value below.
                    let result = if n == 1 {
                        let r = usize::from(fetch_u8!(frame));
                        self.registers[frame.base + r].clone_with_heap(self.heap)
                    } else {
                        Value::None
                    };
                    // Slots at and above the frame base die with it; any
                    // open upvalue still pointing there moves to the heap.
                    self.close_upvalues(frame.base);
                    let top = frame.base + frame.max_regs;
                    for slot in frame.base..top {
                        let old = self.take_reg(slot);
                        old.drop_with_heap(self.heap);
                    }
                    let popped = self.frames.pop().expect("frame stack empty on Ret");
                    match popped.ret_reg {
                        Some(dest) => self.set_reg(dest, result),
                        None => {
                            // Top-level frame: discard the result and the
                            // staged closure below the window.
                            result.drop_with_heap(self.heap);
                            let closure_slot = popped.base - 1;
                            let closure = self.take_reg(closure_slot);
                            closure.drop_with_heap(self.heap);
                            self.registers.truncate(closure_slot);
                        }
                    }
                    if self.frames.len() == stop_depth {
                        return Ok(());
                    }
                    frame = self.cached_frame();
                }
                Opcode::Closure => {
                    let p = usize::from(fetch_u16!(frame));
                    let d = usize::from(fetch_u8!(frame));
                    let count = usize::from(fetch_u16!(frame));
                    let mut upvalues: SmallVec<[HeapId; 4]> = SmallVec::with_capacity(count);
                    for _ in 0..count {
                        let is_local = fetch_u8!(frame) != 0;
                        let index = usize::from(fetch_u8!(frame));
                        let cell = if is_local {
                            self.capture_upvalue(frame.base + index)
                        } else {
                            let shared = self.upvalue_cell(frame.closure, index as u8);
                            self.heap.inc_ref(shared);
                            shared
                        };
                        upvalues.push(cell);
                    }
                    let closure = self.heap.allocate(HeapData::Closure(Closure {
                        proto: ProtoId::new(p),
                        upvalues,
                    }));
                    self.set_reg(frame.base + d, Value::Ref(closure));
                }
                Opcode::CloseUpval => {
                    let i = usize::from(fetch_u8!(frame));
                    self.close_upvalues(frame.base + i);
                }
                Opcode::ArrayNew => {
                    let cap = usize::from(fetch_u8!(frame));
                    let d = usize::from(fetch_u8!(frame));
                    let array = self.heap.allocate(HeapData::Array(Vec::with_capacity(cap)));
                    self.set_reg(frame.base + d, Value::Ref(array));
                }
                Opcode::ArrayGet => {
                    let (a, i, d) = fetch_abc(&mut frame);
                    let array = self.array_operand(frame.base + a)?;
                    let index = self.index_operand(frame.base + i)?;
                    let value = match self.heap.get(array) {
                        HeapData::Array(elems) => {
                            let idx = checked_index(index, elems.len())?;
                            elems[idx].clone_with_heap(self.heap)
                        }
                        _ => unreachable!("array_operand checked the kind"),
                    };
                    self.set_reg(frame.base + d, value);
                }
                Opcode::ArraySet => {
                    let (a, i, s) = fetch_abc(&mut frame);
                    let array = self.array_operand(frame.base + a)?;
                    let index = self.index_operand(frame.base + i)?;
                    let len = match self.heap.get(array) {
                        HeapData::Array(elems) => elems.len(),
                        _ => unreachable!("array_operand checked the kind"),
                    };
                    let idx = checked_index(index, len)?;
                    let value = self.registers[frame.base + s].clone_with_heap(self.heap);
                    let old = self.heap.array_replace(array, idx, value);
                    old.drop_with_heap(self.heap);
                }
                Opcode::ArrayLen => {
                    let a = usize::from(fetch_u8!(frame));
                    let d = usize::from(fetch_u8!(frame));
                    let array = self.array_operand(frame.base + a)?;
                    let len = match self.heap.get(array) {
                        HeapData::Array(elems) => elems.len(),
                        _ => unreachable!("array_operand checked the kind"),
                    };
                    self.set_reg(frame.base + d, Value::Int(i32::try_from(len).unwrap_or(i32::MAX)));
                }
                Opcode::ArrayPush => {
                    let a = usize::from(fetch_u8!(frame));
                    let v = usize::from(fetch_u8!(frame));
                    let array = self.array_operand(frame.base + a)?;
                    let value = self.registers[frame.base + v].clone_with_heap(self.heap);
                    match self.heap.get_mut(array) {
                        HeapData::Array(elems) => elems.push(value),
                        _ => unreachable!("array_operand checked the kind"),
                    }
                }
                Opcode::IterNew => {
                    let s = usize::from(fetch_u8!(frame));
                    let d = usize::from(fetch_u8!(frame));
                    let source = self.registers[frame.base + s].clone_with_heap(self.heap);
                    let iter = self.heap.allocate(HeapData::Iter(Iter { source, cursor: 0 }));
                    self.set_reg(frame.base + d, Value::Ref(iter));
                }
                Opcode::IterHasNext => {
                    let it = usize::from(fetch_u8!(frame));
                    let d = usize::from(fetch_u8!(frame));
                    let iter = self.iter_operand(frame.base + it)?;
                    let has = self.iter_has_next(iter);
                    self.set_reg(frame.base + d, Value::Bool(has));
                }
                Opcode::IterNext => {
                    let it = usize::from(fetch_u8!(frame));
                    let d = usize::from(fetch_u8!(frame));
                    let iter = self.iter_operand(frame.base + it)?;
                    let element = match self.heap.get(iter) {
                        HeapData::Iter(state) => match &state.source {
                            Value::Ref(source) => match self.heap.get(*source) {
                                HeapData::Array(elems) if state.cursor < elems.len() => {
                                    Some(elems[state.cursor].clone_with_heap(self.heap))
                                }
                                _ => None,
                            },
                            _ => None,
                        },
                        _ => unreachable!("iter_operand checked the kind"),
                    };
                    let value = match element {
                        Some(value) => {
                            match self.heap.get_mut(iter) {
                                HeapData::Iter(state) => state.cursor += 1,
                                _ => unreachable!("iter_operand checked the kind"),
                            }
                            value
                        }
                        None => Value::None,
                    };
                    self.set_reg(frame.base + d, value);
                }
            }
        }
    }

    // === frame plumbing ===

    fn cached_frame(&self) -> CachedFrame<'a> {
        let frame = self.frames.last().expect("frame stack empty");
        let proto_id = match self.heap.get(frame.closure) {
            HeapData::Closure(closure) => closure.proto,
            other => panic!("frame closure slot holds {other:?}"),
        };
        let protos: &'a [Proto] = self.protos;
        let proto = &protos[proto_id.index()];
        CachedFrame {
            code: &proto.code,
            consts: &proto.consts,
            ip: frame.ip,
            base: frame.base,
            closure: frame.closure,
            max_regs: usize::from(proto.max_regs),
        }
    }

    /// `CALL f, n, d`: natives run synchronously on the spot; closures
    /// push a frame whose base is the first argument register, so
    /// arguments become the callee's first locals.
    fn call(&mut self, frame: &mut CachedFrame<'a>, f: usize, n: usize, d: usize) -> Result<(), RunError> {
        let callee_slot = frame.base + f;
        match self.registers[callee_slot].shallow_copy() {
            Value::Native(id) => {
                let mut args: SmallVec<[Object; 8]> = SmallVec::with_capacity(n);
                for i in 0..n {
                    args.push(Object::from_value(&self.registers[callee_slot + 1 + i], self.heap));
                }
                let natives: &'a [NativeEntry] = self.natives;
                let entry = &natives[id.index()];
                let result = {
                    let mut ctx = NativeCtx { print: &mut *self.print };
                    (entry.func)(&mut ctx, &args)
                };
                match result {
                    Ok(object) => {
                        let value = object.into_value(self.heap, self.interner);
                        self.set_reg(frame.base + d, value);
                    }
                    Err(message) => {
                        return Err(RunError::new(
                            RunErrorKind::Native,
                            format!("{}: {message}", self.heap.str_text(entry.name)),
                        ));
                    }
                }
                Ok(())
            }
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Closure(_)) => {
                if self.frames.len() >= FRAMES_MAX {
                    return Err(RunError::new(
                        RunErrorKind::StackOverflow,
                        format!("call depth exceeds {FRAMES_MAX} frames"),
                    ));
                }
                let proto_id = match self.heap.get(id) {
                    HeapData::Closure(closure) => closure.proto,
                    _ => unreachable!("kind checked above"),
                };
                let max_regs = usize::from(self.protos[proto_id.index()].max_regs);
                let new_base = callee_slot + 1;
                let top = new_base + max_regs;
                if top > REGISTER_LIMIT {
                    return Err(RunError::new(RunErrorKind::StackOverflow, "register file exhausted"));
                }
                if self.registers.len() < top {
                    self.registers.resize_with(top, || Value::None);
                }
                // Anything at or above the argument count starts as none.
                for slot in (new_base + n).min(top)..top {
                    let old = self.take_reg(slot);
                    old.drop_with_heap(self.heap);
                }
                // The callee closure stays referenced from the caller's
                // register at `callee_slot` for the whole call, so the
                // frame holds it borrowed.
                self.frames.last_mut().expect("frame stack empty").ip = frame.ip;
                self.frames.push(Frame {
                    closure: id,
                    ip: 0,
                    base: new_base,
                    ret_reg: Some(frame.base + d),
                });
                *frame = self.cached_frame();
                Ok(())
            }
            other => Err(self.type_error(format!("value of type {} is not a function", self.type_name_of(&other)))),
        }
    }

    // === registers ===

    fn set_reg(&mut self, slot: usize, value: Value) {
        let old = std::mem::replace(&mut self.registers[slot], value);
        old.drop_with_heap(self.heap);
    }

    fn take_reg(&mut self, slot: usize) -> Value {
        std::mem::replace(&mut self.registers[slot], Value::None)
    }

    // === upvalues ===

    fn upvalue_cell(&self, closure: HeapId, index: u8) -> HeapId {
        match self.heap.get(closure) {
            HeapData::Closure(c) => c.upvalues[usize::from(index)],
            other => panic!("expected closure, found {other:?}"),
        }
    }

    /// Returns the open upvalue for `slot`, creating and splicing in a new
    /// cell at its slot-descending position if none exists. The returned
    /// handle is retained for the capturing closure.
    fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        let mut insert_at = self.open_upvals.len();
        for (i, open) in self.open_upvals.iter().enumerate() {
            if open.slot == slot {
                self.heap.inc_ref(open.id);
                return open.id;
            }
            if open.slot < slot {
                insert_at = i;
                break;
            }
        }
        let id = self.heap.allocate(HeapData::Upvalue(Upvalue::Open(slot)));
        // One reference for the closure, one for the open list.
        self.heap.inc_ref(id);
        self.open_upvals.insert(insert_at, OpenUpval { slot, id });
        id
    }

    /// Closes every open upvalue whose slot is at or above `from`: the
    /// slot's current value moves into the cell and the list's reference
    /// is released. The list is sorted descending, so this is a prefix
    /// drain.
    fn close_upvalues(&mut self, from: usize) {
        let split = self
            .open_upvals
            .iter()
            .position(|open| open.slot < from)
            .unwrap_or(self.open_upvals.len());
        let closing: Vec<OpenUpval> = self.open_upvals.drain(..split).collect();
        for open in closing {
            let value = self.registers[open.slot].clone_with_heap(self.heap);
            self.heap.upvalue_close(open.id, value);
            self.heap.dec_ref(open.id);
        }
    }

    // === operand helpers ===

    fn name_constant(consts: &[Value], index: usize) -> HeapId {
        match consts[index] {
            Value::Ref(id) => id,
            ref other => panic!("global-name constant holds {other:?}"),
        }
    }

    fn numeric_pair(&self, base: usize, a: usize, b: usize, op_name: &str) -> Result<NumPair, RunError> {
        match (&self.registers[base + a], &self.registers[base + b]) {
            (Value::Int(x), Value::Int(y)) => Ok(NumPair::Ints(*x, *y)),
            (Value::Int(x), Value::Float(y)) => Ok(NumPair::Floats(*x as f32, *y)),
            (Value::Float(x), Value::Int(y)) => Ok(NumPair::Floats(*x, *y as f32)),
            (Value::Float(x), Value::Float(y)) => Ok(NumPair::Floats(*x, *y)),
            (x, y) => Err(self.type_error(format!(
                "unsupported operands for '{op_name}': {} and {}",
                self.type_name_of(x),
                self.type_name_of(y)
            ))),
        }
    }

    /// Ordering comparisons are defined for numbers only; anything else is
    /// a type error rather than a quiet false.
    fn ordering_pair(&self, base: usize, a: usize, b: usize) -> Result<NumPair, RunError> {
        match (&self.registers[base + a], &self.registers[base + b]) {
            (Value::Int(x), Value::Int(y)) => Ok(NumPair::Ints(*x, *y)),
            (Value::Int(x), Value::Float(y)) => Ok(NumPair::Floats(*x as f32, *y)),
            (Value::Float(x), Value::Int(y)) => Ok(NumPair::Floats(*x, *y as f32)),
            (Value::Float(x), Value::Float(y)) => Ok(NumPair::Floats(*x, *y)),
            (x, y) => Err(self.type_error(format!(
                "cannot order {} and {}",
                self.type_name_of(x),
                self.type_name_of(y)
            ))),
        }
    }

    fn binary_arith(
        &mut self,
        frame: &mut CachedFrame<'a>,
        op_name: &str,
        int_op: fn(i32, i32) -> i32,
        float_op: fn(f32, f32) -> f32,
    ) -> Result<(), RunError> {
        let (a, b, d) = fetch_abc(frame);
        let result = match self.numeric_pair(frame.base, a, b, op_name)? {
            NumPair::Ints(x, y) => Value::Int(int_op(x, y)),
            NumPair::Floats(x, y) => Value::Float(float_op(x, y)),
        };
        self.set_reg(frame.base + d, result);
        Ok(())
    }

    fn array_operand(&self, slot: usize) -> Result<HeapId, RunError> {
        match &self.registers[slot] {
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Array(_)) => Ok(*id),
            other => Err(self.type_error(format!("can only index arrays (got {})", self.type_name_of(other)))),
        }
    }

    fn index_operand(&self, slot: usize) -> Result<i32, RunError> {
        match &self.registers[slot] {
            Value::Int(index) => Ok(*index),
            other => Err(self.type_error(format!(
                "array index must be an integer (got {})",
                self.type_name_of(other)
            ))),
        }
    }

    fn iter_operand(&self, slot: usize) -> Result<HeapId, RunError> {
        match &self.registers[slot] {
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Iter(_)) => Ok(*id),
            other => Err(self.type_error(format!("expected an iterator (got {})", self.type_name_of(other)))),
        }
    }

    fn iter_has_next(&self, iter: HeapId) -> bool {
        match self.heap.get(iter) {
            HeapData::Iter(state) => match &state.source {
                Value::Ref(source) => match self.heap.get(*source) {
                    HeapData::Array(elems) => state.cursor < elems.len(),
                    // Non-array sources are immediately exhausted.
                    _ => false,
                },
                _ => false,
            },
            other => panic!("expected iterator, found {other:?}"),
        }
    }

    fn type_error(&self, message: String) -> RunError {
        RunError::new(RunErrorKind::Type, message)
    }

    fn type_name_of(&self, value: &Value) -> &'static str {
        match value {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Native(_) => "native",
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Array(_) => "array",
                HeapData::Str(_) => "string",
                HeapData::Closure(_) => "fn",
                HeapData::Upvalue(_) => "upvalue",
                HeapData::Iter(_) => "iterator",
            },
        }
    }
}

fn fetch_abc(frame: &mut CachedFrame<'_>) -> (usize, usize, usize) {
    let a = usize::from(fetch_u8!(frame));
    let b = usize::from(fetch_u8!(frame));
    let c = usize::from(fetch_u8!(frame));
    (a, b, c)
}

/// Validates an index against an array length: total within
/// `[0, length)`, a runtime error outside.
fn checked_index(index: i32, len: usize) -> Result<usize, RunError> {
    usize::try_from(index).ok().filter(|&i| i < len).ok_or_else(|| {
        RunError::new(
            RunErrorKind::Index,
            format!("array index {index} out of bounds (length {len})"),
        )
    })
}
