//! Promise forcing and the argument-matching protocol.
//!
//! A call site binds its expressions to the callee's formals through a fresh
//! child environment. Call sites without names or a `...` expansion take the
//! fast positional path; everything else goes through three-phase matching
//! (exact name, typed prefix before the formal dots, positional fill), with
//! leftovers collected into the callee's `...` list.

use crate::code::CompiledCall;
use crate::dict::Environment;
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::intern::{strings, Symbol};
use crate::state::{State, MAX_ARGUMENTS};
use crate::value::{Type, Value};

/// Suspend the current instruction and force `promise`.
///
/// The promise's frame is flagged so its return writes the result both into
/// the binding slot (`target_env`/`target_index`) and into `out_register` of
/// the forcing frame. `target_index` is a symbol for an environment binding
/// or an integer for a `...` element. Registers 0..2 of the new frame carry
/// the seed; code compiled for promise bodies leaves them untouched.
pub fn force(
    state: &mut State,
    promise: Value,
    target_env: *mut Environment,
    target_index: Value,
    out_register: i64,
    return_pc: usize,
) {
    let inner = promise.promise_inner();
    debug_assert!(!inner.environment.is_null());
    let dotdot = inner.code.is_null();
    let code = if dotdot {
        state.global.dot_force
    } else {
        inner.code
    };
    let environment = inner.environment;
    let dot_index = inner.dot_index;
    state.push_frame(code, environment, out_register, return_pc, true);
    state.set_reg(0, Value::environment(target_env));
    state.set_reg(1, target_index);
    if dotdot {
        state.set_reg(2, Value::integer(dot_index));
    }
}

fn dots_length(dots: Value) -> i64 {
    if dots.tag() == Type::List {
        dots.length()
    } else {
        0
    }
}

/// Count of the effective argument list: positional arguments, the expanded
/// `...`, then the tail.
pub fn num_arguments(dots: Value, call: &CompiledCall) -> i64 {
    if call.has_dots() {
        // The placeholder at the dot position is not an argument.
        call.arguments.length() - 1 + dots_length(dots)
    } else {
        call.arguments.length()
    }
}

/// The i-th effective argument. Promises forwarded out of the caller's
/// `...` are re-wrapped as fresh dotdot promises; a promise binding must
/// stay unique to its site.
pub fn argument(heap: &Heap, index: i64, dots: Value, call: &CompiledCall, env: *mut Environment) -> Value {
    if index < call.dot_index {
        call.arguments.list_slice()[index as usize]
    } else {
        let index = index - call.dot_index;
        let ndots = dots_length(dots);
        if index < ndots {
            let v = dots.list_slice()[index as usize];
            if v.is_promise() {
                Value::promise_dotdot(heap, env, index)
            } else {
                v
            }
        } else {
            let index = index - ndots;
            call.arguments.list_slice()[(call.dot_index + index + 1) as usize]
        }
    }
}

/// The i-th effective argument's name (the empty handle when unnamed).
pub fn name(index: i64, dots: Value, dotnames: Value, call: &CompiledCall) -> Symbol {
    let empty = strings().empty;
    if index < call.dot_index {
        if call.has_names() && index < call.names.length() {
            call.names.character_slice()[index as usize]
        } else {
            empty
        }
    } else {
        let index = index - call.dot_index;
        let ndots = dots_length(dots);
        if index < ndots {
            if dotnames.tag() == Type::Character && index < dotnames.length() {
                dotnames.character_slice()[index as usize]
            } else {
                empty
            }
        } else {
            let j = call.dot_index + (index - ndots) + 1;
            if call.has_names() && j < call.names.length() {
                call.names.character_slice()[j as usize]
            } else {
                empty
            }
        }
    }
}

fn named_arguments(dotnames: Value, call: &CompiledCall) -> bool {
    if call.has_dots() {
        call.has_names() || (dotnames.tag() == Type::Character && dotnames.length() > 0)
    } else {
        call.has_names()
    }
}

/// Bind `v` under `n`, pointing any promise at its evaluation environment.
fn assign_argument(
    heap: &Heap,
    eval_env: *mut Environment,
    assign_env: *mut Environment,
    n: Symbol,
    v: Value,
) {
    let bound = if v.is_promise() {
        v.promise_with_environment(heap, eval_env)
    } else {
        v
    };
    // SAFETY: matching only runs over live environments.
    unsafe {
        *(*assign_env).insert(heap, n) = bound;
    }
}

fn assign_dot(heap: &Heap, v: Value, eval_env: *mut Environment, out: &mut Value) {
    *out = if v.is_promise() {
        v.promise_with_environment(heap, eval_env)
    } else {
        v
    };
}

fn unused_arguments(call: &CompiledCall) -> Error {
    Error::user_class(
        format!(
            "unused arguments in call: {}",
            crate::output::deparse(call.call)
        ),
        "unused-arguments",
    )
}

impl State {
    /// Match `call` against `func`'s formals and push the callee frame.
    pub fn enter_closure(
        &mut self,
        env: *mut Environment,
        func: Value,
        call: &CompiledCall,
        dest: i64,
        return_pc: usize,
    ) -> Result<()> {
        let fenv = if call.requires_generic() {
            self.match_args(env, func, call)?
        } else {
            self.fast_match_args(env, func, call)?
        };
        let prototype = func.closure_inner().prototype;
        self.push_frame(prototype, fenv, dest, return_pc, false);
        Ok(())
    }

    /// The fast path: no names and no `...` at the call site.
    pub fn fast_match_args(
        &mut self,
        env: *mut Environment,
        func: Value,
        call: &CompiledCall,
    ) -> Result<*mut Environment> {
        let global = self.global.clone();
        let heap = &global.heap;
        let s = global.strings;
        let clos = func.closure_inner();
        // SAFETY: closure prototypes are live.
        let proto = unsafe { &*clos.prototype };
        let n_params = proto.num_parameters();
        let p_dot = proto.dot_index;
        let arguments = call.arguments;
        let argc = arguments.length();
        let end = argc.min(p_dot);

        let fenv = Environment::alloc(heap, clos.environment, argc as usize + 5);

        bind_extras(heap, env, fenv, call);

        for i in 0..n_params as usize {
            if (i as i64) < end && !arguments.list_slice()[i].is_nil() {
                assign_argument(heap, env, fenv, proto.parameter(i), arguments.list_slice()[i]);
            } else {
                assign_argument(heap, fenv, fenv, proto.parameter(i), proto.default(i));
            }
        }

        if argc > end {
            if p_dot < n_params {
                let mut newdots = Value::alloc_vector(heap, Type::List, (argc - end) as usize);
                for i in end..argc {
                    let arg = arguments.list_slice()[i as usize];
                    assign_dot(heap, arg, env, &mut newdots.list_slice_mut()[(i - end) as usize]);
                }
                // SAFETY: fenv is live.
                unsafe {
                    *(*fenv).insert(heap, s.dots) = newdots;
                }
            } else {
                return Err(unused_arguments(call));
            }
        }

        bind_context(heap, env, fenv, func, call, argc);
        Ok(fenv)
    }

    /// The generic path: three-phase matching over the effective argument
    /// list, leftovers into `...`.
    pub fn match_args(
        &mut self,
        env: *mut Environment,
        func: Value,
        call: &CompiledCall,
    ) -> Result<*mut Environment> {
        let global = self.global.clone();
        let heap = &global.heap;
        let s = global.strings;
        let clos = func.closure_inner();
        // SAFETY: closure prototypes are live.
        let proto = unsafe { &*clos.prototype };
        let n_params = proto.num_parameters();
        let p_dot = proto.dot_index;

        // SAFETY: the caller environment is live.
        let (dots, dotnames) = unsafe { ((*env).get(s.dots), (*env).get(s.names)) };
        let num_args = num_arguments(dots, call);
        let named = named_arguments(dotnames, call);

        let fenv = Environment::alloc(
            heap,
            clos.environment,
            num_args.min(n_params) as usize + 5,
        );

        bind_extras(heap, env, fenv, call);

        for i in 0..n_params as usize {
            assign_argument(heap, fenv, fenv, proto.parameter(i), proto.default(i));
        }

        if !named {
            // Positional matching up to the formal dots.
            let end = num_args.min(p_dot);
            for i in 0..end {
                let arg = argument(heap, i, dots, call, env);
                if !arg.is_nil() {
                    assign_argument(heap, env, fenv, proto.parameter(i as usize), arg);
                }
            }
            if num_args > end {
                if p_dot < n_params {
                    let mut newdots =
                        Value::alloc_vector(heap, Type::List, (num_args - end) as usize);
                    for i in end..num_args {
                        let arg = argument(heap, i, dots, call, env);
                        assign_dot(heap, arg, env, &mut newdots.list_slice_mut()[(i - end) as usize]);
                    }
                    // SAFETY: fenv is live.
                    unsafe {
                        *(*fenv).insert(heap, s.dots) = newdots;
                    }
                } else {
                    return Err(unused_arguments(call));
                }
            }
        } else if n_params == 1 && p_dot == 0 {
            // The callee only has dots; everything lands there.
            if num_args > 0 {
                let mut any_named = false;
                let mut newdots = Value::alloc_vector(heap, Type::List, num_args as usize);
                let mut names = Value::alloc_vector(heap, Type::Character, num_args as usize);
                for i in 0..num_args {
                    let arg = argument(heap, i, dots, call, env);
                    let n = name(i, dots, dotnames, call);
                    if n != s.empty {
                        any_named = true;
                    }
                    assign_dot(heap, arg, env, &mut newdots.list_slice_mut()[i as usize]);
                    names.character_slice_mut()[i as usize] = n;
                }
                // SAFETY: fenv is live.
                unsafe {
                    *(*fenv).insert(heap, s.dots) = newdots;
                    if any_named {
                        *(*fenv).insert(heap, s.names) = names;
                    }
                }
            }
        } else {
            if num_args > MAX_ARGUMENTS as i64 || n_params > MAX_ARGUMENTS as i64 {
                return Err(Error::user_class(
                    "too many arguments for fixed size assignment arrays",
                    "too-many-arguments",
                ));
            }

            for i in 0..num_args as usize {
                self.assignment[i] = -1;
            }
            for j in 0..n_params as usize {
                self.set[j] = -(j as i64 + 1);
            }

            // Phase A: exact names, skipping the formal dots slot.
            for i in 0..num_args {
                let n = name(i, dots, dotnames, call);
                if n != s.empty {
                    for j in 0..n_params {
                        if j != p_dot && n == proto.parameter(j as usize) {
                            self.assignment[i as usize] = j;
                            self.set[j as usize] = i;
                            break;
                        }
                    }
                }
            }
            // Phase B: byte-prefix matches against unbound formals before the
            // dots; the first (lowest-index) candidate wins.
            for i in 0..num_args {
                let n = name(i, dots, dotnames, call);
                if n != s.empty && self.assignment[i as usize] < 0 {
                    for j in 0..p_dot {
                        if self.set[j as usize] < 0
                            && proto
                                .parameter(j as usize)
                                .as_str()
                                .as_bytes()
                                .starts_with(n.as_str().as_bytes())
                        {
                            self.assignment[i as usize] = j;
                            self.set[j as usize] = i;
                            break;
                        }
                    }
                }
            }
            // Phase C: unnamed arguments fill the remaining slots in order.
            let mut first_empty = 0;
            for i in 0..num_args {
                let n = name(i, dots, dotnames, call);
                if n == s.empty {
                    while first_empty < p_dot {
                        if self.set[first_empty as usize] < 0 {
                            self.assignment[i as usize] = first_empty;
                            self.set[first_empty as usize] = i;
                            break;
                        }
                        first_empty += 1;
                    }
                }
            }

            let mut num_dots = num_args;
            for j in 0..n_params {
                if j != p_dot && self.set[j as usize] >= 0 {
                    let arg = argument(heap, self.set[j as usize], dots, call, env);
                    if !arg.is_nil() {
                        assign_argument(heap, env, fenv, proto.parameter(j as usize), arg);
                    }
                    num_dots -= 1;
                }
            }

            if num_dots > 0 {
                if p_dot < n_params {
                    let mut any_named = false;
                    let mut newdots = Value::alloc_vector(heap, Type::List, num_dots as usize);
                    let mut names = Value::alloc_vector(heap, Type::Character, num_dots as usize);
                    let mut j = 0usize;
                    for i in 0..num_args {
                        if self.assignment[i as usize] < 0 {
                            let arg = argument(heap, i, dots, call, env);
                            let n = name(i, dots, dotnames, call);
                            if n != s.empty {
                                any_named = true;
                            }
                            assign_dot(heap, arg, env, &mut newdots.list_slice_mut()[j]);
                            names.character_slice_mut()[j] = n;
                            j += 1;
                        }
                    }
                    // SAFETY: fenv is live.
                    unsafe {
                        *(*fenv).insert(heap, s.dots) = newdots;
                        if any_named {
                            *(*fenv).insert(heap, s.names) = names;
                        }
                    }
                } else {
                    return Err(unused_arguments(call));
                }
            }
        }

        bind_context(heap, env, fenv, func, call, num_args);
        Ok(fenv)
    }
}

/// Pre-bound extras (method dispatch) are written first, under their names.
fn bind_extras(heap: &Heap, env: *mut Environment, fenv: *mut Environment, call: &CompiledCall) {
    if call.extra_args.tag() == Type::List && call.extra_names.tag() == Type::Character {
        let args = call.extra_args.list_slice();
        let names = call.extra_names.character_slice();
        for i in 0..args.len().min(names.len()) {
            assign_argument(heap, env, fenv, names[i], args[i]);
        }
    }
}

/// The call bookkeeping every matched environment receives.
fn bind_context(
    heap: &Heap,
    env: *mut Environment,
    fenv: *mut Environment,
    func: Value,
    call: &CompiledCall,
    num_args: i64,
) {
    let s = strings();
    // SAFETY: fenv was just built by the matcher.
    unsafe {
        *(*fenv).insert(heap, s.parent) = Value::environment(env);
        *(*fenv).insert(heap, s.call) = call.call;
        *(*fenv).insert(heap, s.function) = func;
        *(*fenv).insert(heap, s.nargs) = Value::integer(num_args);
    }
}
