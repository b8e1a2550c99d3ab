//! Riposte: a virtual machine for a vectorized, lazily-evaluated array
//! language.
//!
//! The execution core: a 16-byte tagged value model over a region-based
//! mark-sweep heap, open-addressing lexical environments, three-phase
//! argument matching with `...` forwarding, promise forcing, operator
//! dispatch with user-visible generics, and a work-stealing task pool for
//! data-parallel vector operations. The parser/compiler is a collaborator;
//! a small built-in frontend drives the REPL.

mod call;
mod code;
mod dict;
mod dispatch;
mod error;
mod heap;
mod intern;
mod interpreter;
mod output;
mod state;
mod task;
mod value;

pub mod frontend;

pub use call::{argument, force, name, num_arguments};
pub use code::{dot_force_prototype, CompiledCall, Instruction, Opcode, Prototype, NUM_OPCODES};
pub use dict::{DictSlot, Dictionary, Environment};
pub use dispatch::{binary, condition_bool, generic_dispatch, ifelse, unary, BinOp, UnOp};
pub use error::{Error, Result};
pub use heap::{Finalizer, Heap, REGION_SIZE};
pub use intern::{intern, strings, Strings, Symbol};
pub use output::{deparse, stringify, Format};
pub use state::{Global, StackFrame, State, MAX_ARGUMENTS, NUM_REGISTERS, RETURN_TOP};
pub use task::{spawn_worker, Task, TaskBodyFn, TaskHeaderFn, WorkerShared};
pub use value::{
    double_is_na, double_na, element_size, Packing, PromiseFlags, Type, Value, INTEGER_NA,
    LOGICAL_FALSE, LOGICAL_NA, LOGICAL_TRUE,
};

/// A fresh environment under `parent`.
pub fn new_environment(global: &Global, parent: *mut Environment) -> *mut Environment {
    Environment::alloc(&global.heap, parent, 8)
}
