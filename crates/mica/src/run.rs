//! The embedding surface: create an interpreter, register natives, seed
//! globals, compile source, run it.
//!
//! `Interp` owns all interpreter state: heap, interner, globals, native
//! registry, prototype table, register file, frame stack, open-upvalue
//! list. `compile` pushes a ready top-level frame per call (so repeated
//! compiles stack), and each `run` drives the dispatch loop until the
//! frame that was topmost returns. Globals and prototypes persist across
//! compiles, which is what makes the line-at-a-time REPL work.

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::{
    bytecode::{
        code::{Proto, ProtoId},
        compiler,
        vm::{Frame, Machine, OpenUpval},
    },
    error::{CompileError, RunError, RunErrorKind},
    heap::{Closure, Heap, HeapData, HeapId, HeapStats},
    intern::Interner,
    io::{PrintWriter, StdPrint},
    object::{NativeEntry, NativeFn, Object},
    parse::parse,
    value::Value,
};

/// Bounded native registry; registrations past this are reported on
/// stderr and ignored.
pub(crate) const NATIVES_MAX: usize = 64;

/// An interpreter instance. Not thread-safe; hosts wanting parallelism
/// create independent instances. Dropping it tears down the globals, the
/// registry, and the heap.
#[derive(Default)]
pub struct Interp {
    heap: Heap,
    interner: Interner,
    globals: IndexMap<HeapId, Value>,
    natives: Vec<NativeEntry>,
    protos: Vec<Proto>,
    registers: Vec<Value>,
    frames: Vec<Frame>,
    open_upvals: Vec<OpenUpval>,
    poisoned: bool,
}

impl Interp {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named native function. The registry is bounded;
    /// overflow is reported on the diagnostic stream and the registration
    /// is dropped.
    pub fn register_native(&mut self, name: &str, func: NativeFn) {
        if self.natives.len() >= NATIVES_MAX {
            eprintln!("mica: native registry is full ({NATIVES_MAX} entries); ignoring '{name}'");
            return;
        }
        let id = self.interner.intern(&mut self.heap, name);
        self.natives.push(NativeEntry { name: id, func });
    }

    /// Lexes, parses, and compiles `source`. On success a top-level frame
    /// is pushed, ready to run; on failure nothing is pushed and every
    /// diagnostic from the pass is returned.
    pub fn compile(&mut self, source: &str) -> Result<(), Vec<CompileError>> {
        if self.poisoned {
            return Err(vec![CompileError::new(0, "interpreter is unusable after a runtime error")]);
        }
        let stmts = parse(source)?;
        let root = compiler::compile(&stmts, &mut self.heap, &mut self.interner, &mut self.protos)?;
        self.push_root_frame(root);
        Ok(())
    }

    /// Runs the most recently compiled pending frame to completion,
    /// printing to stdout.
    pub fn run(&mut self) -> Result<(), RunError> {
        let mut print = StdPrint;
        self.run_with(&mut print)
    }

    /// Runs with a caller-supplied output writer.
    ///
    /// A runtime error leaves the frame stack as-is and poisons the
    /// interpreter: further `compile`/`run` calls fail, and the heap is
    /// torn down when the interpreter drops.
    pub fn run_with(&mut self, print: &mut dyn PrintWriter) -> Result<(), RunError> {
        if self.poisoned {
            return Err(RunError::new(RunErrorKind::Poisoned, ""));
        }
        let mut machine = Machine {
            registers: &mut self.registers,
            frames: &mut self.frames,
            open_upvals: &mut self.open_upvals,
            heap: &mut self.heap,
            interner: &mut self.interner,
            globals: &mut self.globals,
            natives: &self.natives,
            protos: &self.protos,
            print,
        };
        let result = machine.run();
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    /// Sets a global by interned name, retaining the new value and
    /// releasing any previous one.
    pub fn set_global(&mut self, name: &str, value: Object) {
        let id = self.interner.intern(&mut self.heap, name);
        let value = value.into_value(&mut self.heap, &mut self.interner);
        if let Some(old) = self.globals.insert(id, value) {
            old.drop_with_heap(&mut self.heap);
            // The map kept its original key; drop the handle we interned.
            self.heap.dec_ref(id);
        }
    }

    /// Reads a global by interned name; a missing name is `none`.
    pub fn get_global(&mut self, name: &str) -> Object {
        let id = self.interner.intern(&mut self.heap, name);
        let result = self
            .globals
            .get(&id)
            .map_or(Object::None, |value| Object::from_value(value, &self.heap));
        self.heap.dec_ref(id);
        result
    }

    /// Arena occupancy snapshot; lets hosts and tests verify that
    /// reference counts return to their baseline.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        HeapStats {
            live_objects: self.heap.live_objects(),
            free_slots: self.heap.free_slots(),
            total_slots: self.heap.total_slots(),
            interned_strings: self.interner.len(),
        }
    }

    /// Wraps a compiled root prototype in a zero-upvalue closure and
    /// pushes its frame. The closure value is staged in the register just
    /// below the frame base, mirroring the call convention.
    fn push_root_frame(&mut self, root: ProtoId) {
        let max_regs = usize::from(self.protos[root.index()].max_regs);
        let closure = self.heap.allocate(HeapData::Closure(Closure {
            proto: root,
            upvalues: SmallVec::new(),
        }));
        let slot = self.registers.len();
        self.registers.push(Value::Ref(closure));
        let base = slot + 1;
        self.registers.resize_with(base + max_regs, || Value::None);
        self.frames.push(Frame {
            closure,
            ip: 0,
            base,
            ret_reg: None,
        });
    }
}
