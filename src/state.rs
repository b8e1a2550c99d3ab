//! Global interpreter state and per-thread execution state.
//!
//! [`Global`] owns the heap, the well-known environments, the worker
//! registry, and the done counter that coordinates shutdown. [`State`] is one
//! thread's half: its register file, frame stack, gc-protect stack, scratch
//! match arrays, and task deque handle. Every live `State` is registered with
//! the global so the mark phase can walk its frames and registers.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::code::{Prototype, NUM_OPCODES};
use crate::dict::Environment;
use crate::heap::{self, Heap};
use crate::intern::{intern, strings, Strings, Symbol};
use crate::task::{self, WorkerShared};
use crate::value::{Type, Value};

pub const NUM_REGISTERS: usize = 10_000;
pub const MAX_ARGUMENTS: usize = 256;

/// Sentinel return address marking an interpreter entry frame.
pub const RETURN_TOP: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
pub struct StackFrame {
    pub environment: *mut Environment,
    pub prototype: *const Prototype,
    pub return_pc: usize,
    pub base: usize,
    pub is_promise: bool,
    pub dest: i64,
}

impl StackFrame {
    pub fn empty() -> StackFrame {
        StackFrame {
            environment: std::ptr::null_mut(),
            prototype: std::ptr::null(),
            return_pc: RETURN_TOP,
            base: 0,
            is_promise: false,
            dest: 0,
        }
    }
}

struct StateHandle(NonNull<State>);

// SAFETY: handles are only dereferenced during collection, when the owning
// threads are quiescent.
unsafe impl Send for StateHandle {}

/// Process-shared interpreter state.
pub struct Global {
    pub strings: &'static Strings,
    pub heap: Heap,
    pub empty: *mut Environment,
    pub global_env: *mut Environment,
    pub dot_force: *const Prototype,
    /// Program-visible argv as a character vector.
    pub arguments: Value,
    /// Deduplicated quote wrappers for symbol expressions, keyed by symbol.
    quote_cache: Mutex<HashMap<Symbol, Value, ahash::RandomState>>,
    /// Values installed by a foreign embedder; treated as roots.
    foreign: Mutex<Vec<Value>>,
    pub workers: Vec<Arc<WorkerShared>>,
    pub done: AtomicI64,
    pub n_threads: usize,
    states: Mutex<Vec<StateHandle>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

// SAFETY: the raw environment/prototype pointers are immutable after
// bootstrap; mutation of reachable heap data follows the quiescence contract
// documented on the heap.
unsafe impl Send for Global {}
// SAFETY: see above.
unsafe impl Sync for Global {}

impl Global {
    /// Build the shared state and spawn `threads - 1` workers.
    pub fn new(threads: usize, args: &[String]) -> Arc<Global> {
        let threads = threads.max(1);
        let heap = Heap::new();
        let strings = strings();

        let empty = Environment::alloc(&heap, std::ptr::null_mut(), 16);
        let global_env = Environment::alloc(&heap, empty, 64);
        let dot_force = crate::code::dot_force_prototype(&heap);

        let mut arguments = Value::alloc_vector(&heap, Type::Character, args.len());
        for (i, a) in args.iter().enumerate() {
            arguments.character_slice_mut()[i] = intern(a);
        }

        let workers = (0..threads).map(|_| Arc::new(WorkerShared::new())).collect();

        let global = Arc::new(Global {
            strings,
            heap,
            empty,
            global_env,
            dot_force,
            arguments,
            quote_cache: Mutex::new(HashMap::default()),
            foreign: Mutex::new(Vec::new()),
            workers,
            done: AtomicI64::new(0),
            n_threads: threads,
            states: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        for index in 1..threads {
            handles.push(task::spawn_worker(global.clone(), index));
        }
        *global.handles.lock() = handles;
        log::info!("riposte: {} thread(s)", threads);
        global
    }

    /// Signal the done counter and wait for every worker to observe it.
    pub fn shutdown(&self) {
        self.done.fetch_add(1, Ordering::AcqRel);
        while self.done.load(Ordering::Acquire) != self.n_threads as i64 {
            std::thread::yield_now();
        }
        for h in self.handles.lock().drain(..) {
            let _ = h.join();
        }
    }

    pub fn collect(&self) {
        self.heap.collect(self);
    }

    /// The cached `quote(sym)` call form for a symbol expression.
    pub fn quoted_symbol(&self, sym: Symbol) -> Value {
        let mut cache = self.quote_cache.lock();
        if let Some(&v) = cache.get(&sym) {
            return v;
        }
        let tail = Value::pairlist(&self.heap, Value::symbol(sym), Value::null(), Value::nil());
        let call = Value::pairlist(
            &self.heap,
            Value::symbol(self.strings.quote),
            tail,
            Value::nil(),
        );
        cache.insert(sym, call);
        call
    }

    /// Register a foreign-held value as a collector root. Returns a handle
    /// for [`Global::remove_foreign`].
    pub fn install_foreign(&self, v: Value) -> usize {
        let mut foreign = self.foreign.lock();
        foreign.push(v);
        foreign.len() - 1
    }

    pub fn remove_foreign(&self, handle: usize) {
        let mut foreign = self.foreign.lock();
        if handle < foreign.len() {
            foreign[handle] = Value::nil();
        }
    }

    fn register_state(&self, state: &State) {
        self.states
            .lock()
            .push(StateHandle(NonNull::from(state)));
    }

    fn deregister_state(&self, state: *const State) {
        self.states
            .lock()
            .retain(|h| h.0.as_ptr() as *const State != state);
    }

    /// Walk every root: global state, each registered thread's frames,
    /// registers, and protect stack, and the installed foreign handles.
    ///
    /// # Safety
    ///
    /// Callable only from the mark phase, with mutators quiescent.
    pub(crate) unsafe fn visit_roots(&self) {
        heap::visit_environment(self.empty);
        heap::visit_environment(self.global_env);
        heap::visit_prototype(self.dot_force);
        heap::traverse(self.arguments);
        for v in self.quote_cache.lock().values() {
            heap::traverse(*v);
        }
        for v in self.foreign.lock().iter() {
            heap::traverse(*v);
        }
        for handle in self.states.lock().iter() {
            handle.0.as_ref().visit_roots_local();
        }
    }
}

impl Drop for Global {
    fn drop(&mut self) {
        // Every State clones the global, so the registry must have drained
        // before the last reference goes away.
        debug_assert!(self.states.get_mut().is_empty());
    }
}

/// One thread's execution state.
pub struct State {
    pub global: Arc<Global>,
    pub index: usize,
    pub shared: Arc<WorkerShared>,
    pub registers: Box<[Value]>,
    pub stack: Vec<StackFrame>,
    pub frame: StackFrame,
    pub pc: usize,
    pub gc_stack: Vec<Value>,
    /// Scratch maps for argument matching; fixed size caps a call at
    /// [`MAX_ARGUMENTS`] effective arguments.
    pub assignment: [i64; MAX_ARGUMENTS],
    pub set: [i64; MAX_ARGUMENTS],
    pub visible: bool,
    pub profile: Option<Box<[u64; NUM_OPCODES]>>,
    pub warnings: Vec<String>,
}

impl State {
    pub fn new(global: Arc<Global>, index: usize) -> Box<State> {
        let shared = global.workers[index].clone();
        let state = Box::new(State {
            global,
            index,
            shared,
            registers: vec![Value::nil(); NUM_REGISTERS].into_boxed_slice(),
            stack: Vec::new(),
            frame: StackFrame::empty(),
            pc: 0,
            gc_stack: Vec::new(),
            assignment: [0; MAX_ARGUMENTS],
            set: [0; MAX_ARGUMENTS],
            visible: true,
            profile: None,
            warnings: Vec::new(),
        });
        state.global.register_state(&state);
        state
    }

    pub fn new_main(global: Arc<Global>) -> Box<State> {
        State::new(global, 0)
    }

    pub fn heap(&self) -> &Heap {
        &self.global.heap
    }

    #[inline(always)]
    pub fn reg(&self, i: i64) -> Value {
        self.registers[self.frame.base + i as usize]
    }

    #[inline(always)]
    pub fn set_reg(&mut self, i: i64, v: Value) {
        self.registers[self.frame.base + i as usize] = v;
    }

    /// Install a frame for `prototype`, zeroing its registers so the
    /// collector never sees stale bits.
    pub fn push_frame(
        &mut self,
        prototype: *const Prototype,
        environment: *mut Environment,
        dest: i64,
        return_pc: usize,
        is_promise: bool,
    ) {
        // SAFETY: prototypes handed to the interpreter are live.
        let registers = unsafe { (*prototype).registers } as usize;
        let base = if self.frame.prototype.is_null() {
            0
        } else {
            // SAFETY: the current frame's prototype is live.
            self.frame.base + unsafe { (*self.frame.prototype).registers } as usize
        };
        if base + registers > NUM_REGISTERS {
            self.internal_error("register overflow");
        }
        self.stack.push(self.frame);
        self.frame = StackFrame {
            environment,
            prototype,
            return_pc,
            base,
            is_promise,
            dest,
        };
        for r in &mut self.registers[base..base + registers] {
            *r = Value::nil();
        }
        self.pc = 0;
    }

    /// Restore the caller's frame; the finished frame's return address
    /// becomes the program counter.
    pub fn pop_frame(&mut self) {
        self.pc = self.frame.return_pc;
        self.frame = self.stack.pop().expect("frame underflow");
    }

    pub fn protect(&mut self, v: Value) {
        self.gc_stack.push(v);
    }

    pub fn unprotect(&mut self, n: usize) {
        let len = self.gc_stack.len();
        self.gc_stack.truncate(len - n);
    }

    pub fn maybe_collect(&self) {
        if self.global.heap.should_collect() {
            self.global.collect();
        }
    }

    pub(crate) unsafe fn visit_roots_local(&self) {
        for f in &self.stack {
            heap::visit_environment(f.environment);
            heap::visit_prototype(f.prototype);
        }
        heap::visit_environment(self.frame.environment);
        heap::visit_prototype(self.frame.prototype);
        let high_water = if self.frame.prototype.is_null() {
            0
        } else {
            self.frame.base + (*self.frame.prototype).registers as usize
        };
        for r in &self.registers[..high_water] {
            heap::traverse(*r);
        }
        for v in &self.gc_stack {
            heap::traverse(*v);
        }
    }

    /// Fatal invariant violation: dump the frame stack and abort.
    pub fn internal_error(&self, msg: &str) -> ! {
        self.dump_stack();
        eprintln!("Internal error: {}", msg);
        std::process::abort();
    }

    pub fn dump_stack(&self) {
        let frames: Vec<&StackFrame> =
            self.stack.iter().chain(std::iter::once(&self.frame)).collect();
        for (i, f) in frames.iter().enumerate().rev() {
            if f.prototype.is_null() {
                continue;
            }
            if f.is_promise {
                let target = self.registers[f.base + 1];
                eprintln!("{}: forcing {}", i, crate::output::deparse(target));
            } else {
                // SAFETY: frame environments are live.
                let call = unsafe { (*f.environment).get(self.global.strings.call) };
                eprintln!("{}: {}", i, crate::output::deparse(call));
            }
        }
    }
}

impl Drop for State {
    fn drop(&mut self) {
        self.global.deregister_state(self as *const State);
    }
}
