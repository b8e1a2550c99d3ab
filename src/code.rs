//! Compiled code objects: instructions, prototypes, and call sites.
//!
//! The compiler collaborator lowers expressions into [`Prototype`]s; the core
//! only consumes them. Prototypes own Rust-side vectors, so they are
//! allocated on the finalized heap path and dropped in place when collected.

use crate::heap::Heap;
use crate::intern::{strings, Symbol};
use crate::value::Value;

/// Three-operand bytecode. Operand meaning is per-opcode; `c` is the
/// destination register unless noted.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Copy register `a` to `c`.
    Mov = 0,
    /// Load constant `a` into `c`.
    Kget,
    /// Look up the symbol in constant `a` along the scope chain, forcing a
    /// bound promise, into `c`.
    Ld,
    /// Load element `a` of the `...` list (`a < 0`: index is read from
    /// register 2, the dot-force seeding convention), forcing, into `c`.
    Ldd,
    /// Bind the symbol in constant `a` to register `c` in the current
    /// environment.
    St,
    /// Recursive (`<<-`-style) bind of the symbol in constant `a` to
    /// register `c`.
    Sts,
    /// Close over constant `a` (a closure template) in the current
    /// environment, into `c`.
    Fun,
    /// Invoke the closure in register `b` with compiled call `a`, result to
    /// `c`.
    Call,
    /// Return register `a` from the current frame.
    Ret,
    /// Jump by `a` instructions (relative).
    Jmp,
    /// Branch on the logical scalar in register `c`: by `a` when true, by
    /// `b` when false.
    Jc,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    /// Negate register `a` into `c`.
    Neg,
    /// Logical-not register `a` into `c`.
    Not,
    /// Scalar subscript: register `a` indexed by register `b`, into `c`.
    Get,
    /// Element select: condition in `a`, yes in `b`, no in `b+1`, into `c`.
    Ifelse,
    /// Integer sequence from register `a` through register `b`, into `c`.
    Seq,
}

pub const NUM_OPCODES: usize = Opcode::Seq as usize + 1;

impl Opcode {
    pub fn from_u8(v: u8) -> Opcode {
        debug_assert!((v as usize) < NUM_OPCODES);
        // SAFETY: Opcode is repr(u8) and v is in range.
        unsafe { std::mem::transmute::<u8, Opcode>(v) }
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Mov => "mov",
            Opcode::Kget => "kget",
            Opcode::Ld => "ld",
            Opcode::Ldd => "ldd",
            Opcode::St => "st",
            Opcode::Sts => "sts",
            Opcode::Fun => "fun",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::Jmp => "jmp",
            Opcode::Jc => "jc",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Mod => "mod",
            Opcode::Pow => "pow",
            Opcode::Eq => "eq",
            Opcode::Neq => "neq",
            Opcode::Lt => "lt",
            Opcode::Le => "le",
            Opcode::Gt => "gt",
            Opcode::Ge => "ge",
            Opcode::Neg => "neg",
            Opcode::Not => "not",
            Opcode::Get => "get",
            Opcode::Ifelse => "ifelse",
            Opcode::Seq => "seq",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    pub op: Opcode,
    pub a: i64,
    pub b: i64,
    pub c: i64,
}

impl Instruction {
    pub fn abc(op: Opcode, a: i64, b: i64, c: i64) -> Instruction {
        Instruction { op, a, b, c }
    }

    pub fn ac(op: Opcode, a: i64, c: i64) -> Instruction {
        Instruction { op, a, b: 0, c }
    }

    pub fn a(op: Opcode, a: i64) -> Instruction {
        Instruction { op, a, b: 0, c: 0 }
    }
}

/// One call site, compiled: the original call form, the ordered argument
/// templates (with a placeholder at the call's `...` position), the parallel
/// names, and any pre-bound extras used by method dispatch.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CompiledCall {
    pub call: Value,
    pub arguments: Value,
    pub names: Value,
    pub dot_index: i64,
    pub extra_args: Value,
    pub extra_names: Value,
}

impl CompiledCall {
    pub fn new(call: Value, arguments: Value, names: Value, dot_index: i64) -> CompiledCall {
        CompiledCall {
            call,
            arguments,
            names,
            dot_index,
            extra_args: Value::null(),
            extra_names: Value::null(),
        }
    }

    pub fn num_arguments_listed(&self) -> i64 {
        self.arguments.length()
    }

    pub fn has_dots(&self) -> bool {
        self.dot_index < self.arguments.length()
    }

    pub fn has_names(&self) -> bool {
        !self.names.is_null() && self.names.length() > 0
    }

    /// Call sites with names or a `...` expansion take the generic matcher.
    pub fn requires_generic(&self) -> bool {
        self.has_dots() || self.has_names()
    }
}

/// The immutable compiled form of a function.
#[repr(C)]
pub struct Prototype {
    pub expression: Value,
    pub name: Symbol,
    /// Character vector of formal parameter names.
    pub parameters: Value,
    /// List of default expressions, parallel to `parameters`.
    pub defaults: Value,
    /// Index of `...` in `parameters`, or the parameter count.
    pub dot_index: i64,
    pub registers: i64,
    /// Whether a top-level result should echo at the REPL.
    pub visible: bool,
    pub constants: Vec<Value>,
    pub calls: Vec<CompiledCall>,
    pub bc: Vec<Instruction>,
}

impl Prototype {
    pub fn alloc(heap: &Heap, proto: Prototype) -> *const Prototype {
        let p = heap.alloc_with_finalizer(std::mem::size_of::<Prototype>(), Prototype::finalize)
            as *mut Prototype;
        // SAFETY: just allocated, correctly sized.
        unsafe { p.write(proto) };
        p
    }

    /// Finalizer: drop the owned vectors in place. Runs without allocating.
    unsafe fn finalize(obj: *mut u8) {
        std::ptr::drop_in_place(obj as *mut Prototype);
    }

    pub fn num_parameters(&self) -> i64 {
        self.parameters.length()
    }

    pub fn parameter(&self, i: usize) -> Symbol {
        self.parameters.character_slice()[i]
    }

    pub fn default(&self, i: usize) -> Value {
        self.defaults.list_slice()[i]
    }

    pub fn has_dots(&self) -> bool {
        self.dot_index < self.num_parameters()
    }
}

/// The prototype run to force a dotdot promise: registers 0..3 are seeded
/// with the target environment, the target index, and the dot number; the
/// body loads that element of the promise environment's `...` list and
/// returns it.
pub fn dot_force_prototype(heap: &Heap) -> *const Prototype {
    Prototype::alloc(
        heap,
        Prototype {
            expression: Value::symbol(strings().dots),
            name: strings().dots,
            parameters: Value::null(),
            defaults: Value::null(),
            dot_index: 0,
            registers: 4,
            visible: true,
            constants: Vec::new(),
            calls: Vec::new(),
            bc: vec![
                Instruction::ac(Opcode::Ldd, -1, 3),
                Instruction::a(Opcode::Ret, 3),
            ],
        },
    )
}
