//! The bytecode interpreter loop.
//!
//! A frame executes until its `Ret`; calls and promise forces push frames and
//! resume the loop from the callee's first instruction. Safe points for the
//! collector sit at call and return sites, where every live value is in a
//! register, a frame, or an environment.

use crate::code::{Opcode, Prototype};
use crate::dict::Environment;
use crate::dispatch::{self, BinOp, UnOp};
use crate::error::{Error, Result};
use crate::state::{State, RETURN_TOP};
use crate::value::{Type, Value};

impl State {
    /// Execute `prototype` in `environment` to completion.
    pub fn interpret(
        &mut self,
        prototype: *const Prototype,
        environment: *mut Environment,
    ) -> Result<Value> {
        let entry = self.stack.len();
        self.push_frame(prototype, environment, 0, RETURN_TOP, false);
        match self.run(entry) {
            Ok(v) => Ok(v),
            Err(e) => {
                // Unwind to the entry depth; promise binding slots are left
                // untouched on error.
                while self.stack.len() > entry {
                    self.pop_frame();
                }
                Err(e)
            }
        }
    }

    /// Top-level evaluation: user errors are offered to a bound `__stop__`
    /// closure; a handled error yields `Nil`.
    pub fn eval_top_level(
        &mut self,
        prototype: *const Prototype,
        environment: *mut Environment,
    ) -> Result<Value> {
        match self.interpret(prototype, environment) {
            Ok(v) => Ok(v),
            Err(Error::User { message, class }) => {
                if self.run_stop_handler(&message) {
                    Ok(Value::nil())
                } else {
                    Err(Error::User { message, class })
                }
            }
            Err(e) => Err(e),
        }
    }

    fn run_stop_handler(&mut self, message: &str) -> bool {
        let entry = self.stack.len();
        if !dispatch::stop_dispatch(self, message, 0, RETURN_TOP) {
            return false;
        }
        match self.run(entry) {
            Ok(_) => true,
            Err(_) => {
                while self.stack.len() > entry {
                    self.pop_frame();
                }
                false
            }
        }
    }

    /// The embedder-facing forcing entry point. Expression promises run
    /// their code; dotdot promises resolve (and overwrite) the referenced
    /// `...` element.
    pub fn force_promise(&mut self, v: Value) -> Result<Value> {
        if !v.is_promise() {
            return Ok(v);
        }
        let inner = v.promise_inner();
        if inner.code.is_null() {
            let env = inner.environment;
            let idx = inner.dot_index;
            // SAFETY: promise environments are live.
            let mut dots = unsafe { (*env).get(self.global.strings.dots) };
            if dots.tag() != Type::List || idx >= dots.length() {
                return Err(Error::user("incorrect number of elements in ..."));
            }
            let element = dots.list_slice()[idx as usize];
            let forced = self.force_promise(element)?;
            dots.list_slice_mut()[idx as usize] = forced;
            Ok(forced)
        } else {
            let entry = self.stack.len();
            self.push_frame(inner.code, inner.environment, 0, RETURN_TOP, false);
            match self.run(entry) {
                Ok(r) => Ok(r),
                Err(e) => {
                    while self.stack.len() > entry {
                        self.pop_frame();
                    }
                    Err(e)
                }
            }
        }
    }

    pub fn enable_profile(&mut self) {
        self.profile = Some(Box::new([0; crate::code::NUM_OPCODES]));
    }

    pub fn profile_report(&self) -> String {
        let mut out = String::new();
        if let Some(counts) = &self.profile {
            let mut rows: Vec<(usize, u64)> = counts
                .iter()
                .copied()
                .enumerate()
                .filter(|&(_, n)| n > 0)
                .collect();
            rows.sort_by_key(|&(_, n)| std::cmp::Reverse(n));
            for (op, n) in rows {
                out.push_str(&format!("{:<8} {}\n", Opcode::from_u8(op as u8).name(), n));
            }
        }
        out
    }

    fn run(&mut self, entry: usize) -> Result<Value> {
        loop {
            // SAFETY: the current frame's prototype is live for the whole
            // frame.
            let proto = unsafe { &*self.frame.prototype };
            let inst = proto.bc[self.pc];
            if let Some(counts) = &mut self.profile {
                counts[inst.op as usize] += 1;
            }
            match inst.op {
                Opcode::Mov => {
                    let v = self.reg(inst.a);
                    self.set_reg(inst.c, v);
                    self.pc += 1;
                }
                Opcode::Kget => {
                    self.set_reg(inst.c, proto.constants[inst.a as usize]);
                    self.pc += 1;
                }
                Opcode::Ld => {
                    let sym = proto.constants[inst.a as usize].scalar_symbol();
                    let env = self.frame.environment;
                    // SAFETY: frame environments are live.
                    let found = unsafe { (*env).get_recursive(sym) };
                    match found {
                        Some((v, defining)) if v.is_promise() => {
                            crate::call::force(
                                self,
                                v,
                                defining,
                                Value::character(sym),
                                inst.c,
                                self.pc + 1,
                            );
                        }
                        Some((v, _)) if !v.is_nil() => {
                            self.set_reg(inst.c, v);
                            self.pc += 1;
                        }
                        _ => {
                            return Err(Error::user_class(
                                format!("object '{}' not found", sym.as_str()),
                                "not-found",
                            ))
                        }
                    }
                }
                Opcode::Ldd => {
                    let idx = if inst.a < 0 {
                        self.reg(2).scalar_integer()
                    } else {
                        inst.a
                    };
                    let env = self.frame.environment;
                    // SAFETY: frame environments are live.
                    let dots = unsafe { (*env).get(self.global.strings.dots) };
                    if dots.tag() != Type::List || idx >= dots.length() || idx < 0 {
                        return Err(Error::user(format!(
                            "the ... list does not contain {} elements",
                            idx + 1
                        )));
                    }
                    let v = dots.list_slice()[idx as usize];
                    if v.is_promise() {
                        crate::call::force(self, v, env, Value::integer(idx), inst.c, self.pc + 1);
                    } else {
                        self.set_reg(inst.c, v);
                        self.pc += 1;
                    }
                }
                Opcode::St => {
                    let sym = proto.constants[inst.a as usize].scalar_symbol();
                    let v = self.reg(inst.c);
                    let env = self.frame.environment;
                    let global = self.global.clone();
                    // SAFETY: frame environments are live.
                    unsafe {
                        *(*env).insert(&global.heap, sym) = v;
                    }
                    self.pc += 1;
                }
                Opcode::Sts => {
                    let sym = proto.constants[inst.a as usize].scalar_symbol();
                    let v = self.reg(inst.c);
                    let env = self.frame.environment;
                    let global = self.global.clone();
                    // SAFETY: frame environments are live.
                    unsafe {
                        *(*env).insert_recursive(&global.heap, sym) = v;
                    }
                    self.pc += 1;
                }
                Opcode::Fun => {
                    let template = proto.constants[inst.a as usize];
                    let inner = template.closure_inner();
                    let global = self.global.clone();
                    let v = Value::closure(&global.heap, inner.prototype, self.frame.environment);
                    self.set_reg(inst.c, v);
                    self.pc += 1;
                }
                Opcode::Call => {
                    let f = self.reg(inst.b);
                    if !f.is_closure() {
                        return Err(Error::user(format!(
                            "attempt to apply non-function ({})",
                            f.tag().name()
                        )));
                    }
                    let cc = proto.calls[inst.a as usize];
                    self.maybe_collect();
                    let env = self.frame.environment;
                    self.enter_closure(env, f, &cc, inst.c, self.pc + 1)?;
                }
                Opcode::Ret => {
                    let v = self.reg(inst.a);
                    self.maybe_collect();
                    if self.frame.is_promise {
                        self.write_promise_result(v);
                    }
                    let finished = self.stack.len() == entry + 1;
                    let dest = self.frame.dest;
                    self.pop_frame();
                    if finished {
                        return Ok(v);
                    }
                    self.set_reg(dest, v);
                }
                Opcode::Jmp => {
                    self.pc = (self.pc as i64 + inst.a) as usize;
                }
                Opcode::Jc => {
                    let cond = dispatch::condition_bool(self.reg(inst.c))?;
                    let offset = if cond { inst.a } else { inst.b };
                    self.pc = (self.pc as i64 + offset) as usize;
                }
                Opcode::Add => self.binary_op(&inst, BinOp::Add)?,
                Opcode::Sub => self.binary_op(&inst, BinOp::Sub)?,
                Opcode::Mul => self.binary_op(&inst, BinOp::Mul)?,
                Opcode::Div => self.binary_op(&inst, BinOp::Div)?,
                Opcode::Mod => self.binary_op(&inst, BinOp::Mod)?,
                Opcode::Pow => self.binary_op(&inst, BinOp::Pow)?,
                Opcode::Eq => self.binary_op(&inst, BinOp::Eq)?,
                Opcode::Neq => self.binary_op(&inst, BinOp::Neq)?,
                Opcode::Lt => self.binary_op(&inst, BinOp::Lt)?,
                Opcode::Le => self.binary_op(&inst, BinOp::Le)?,
                Opcode::Gt => self.binary_op(&inst, BinOp::Gt)?,
                Opcode::Ge => self.binary_op(&inst, BinOp::Ge)?,
                Opcode::Neg => self.unary_op(&inst, UnOp::Neg)?,
                Opcode::Not => self.unary_op(&inst, UnOp::Not)?,
                Opcode::Get => self.get_op(&inst)?,
                Opcode::Ifelse => {
                    let cond = self.reg(inst.a);
                    let yes = self.reg(inst.b);
                    let no = self.reg(inst.b + 1);
                    let v = dispatch::ifelse(self, cond, yes, no)?;
                    self.set_reg(inst.c, v);
                    self.pc += 1;
                }
                Opcode::Seq => {
                    let from = self.reg(inst.a);
                    let to = self.reg(inst.b);
                    let v = dispatch::sequence(self, from, to)?;
                    self.set_reg(inst.c, v);
                    self.pc += 1;
                }
            }
        }
    }

    /// A promise frame's result overwrites the binding slot it was forced
    /// for: an environment binding for a symbol target, a `...` element for
    /// an integer target.
    fn write_promise_result(&mut self, v: Value) {
        let target_env = self.reg(0).environment_ptr();
        let target = self.reg(1);
        let global = self.global.clone();
        match target.tag() {
            Type::Character | Type::ScalarString => {
                let sym = if target.tag() == Type::Character {
                    target.character_slice()[0]
                } else {
                    target.scalar_symbol()
                };
                // SAFETY: the seeded target environment is live.
                unsafe {
                    *(*target_env).insert(&global.heap, sym) = v;
                }
            }
            Type::Integer => {
                // SAFETY: the seeded target environment is live.
                let mut dots = unsafe { (*target_env).get(global.strings.dots) };
                let idx = target.scalar_integer() as usize;
                if dots.tag() == Type::List && idx < dots.length() as usize {
                    dots.list_slice_mut()[idx] = v;
                }
            }
            _ => {}
        }
    }

    fn binary_op(&mut self, inst: &crate::code::Instruction, op: BinOp) -> Result<()> {
        let a = self.reg(inst.a);
        let b = self.reg(inst.b);
        match dispatch::binary(self, op, a, b)? {
            Some(v) => {
                self.set_reg(inst.c, v);
                self.pc += 1;
            }
            None => {
                let sym = op.symbol(&self.global);
                dispatch::generic_dispatch(self, sym, &[a, b], inst.c, self.pc + 1)?;
            }
        }
        Ok(())
    }

    fn unary_op(&mut self, inst: &crate::code::Instruction, op: UnOp) -> Result<()> {
        let a = self.reg(inst.a);
        match dispatch::unary(self, op, a)? {
            Some(v) => {
                self.set_reg(inst.c, v);
                self.pc += 1;
            }
            None => {
                let sym = op.symbol(&self.global);
                dispatch::generic_dispatch(self, sym, &[a], inst.c, self.pc + 1)?;
            }
        }
        Ok(())
    }

    /// Scalar subscript. Environments force a bound promise; out-of-range
    /// and multi-element subscripts are user errors.
    fn get_op(&mut self, inst: &crate::code::Instruction) -> Result<()> {
        let a = self.reg(inst.a);
        let b = self.reg(inst.b);

        if a.is_null() {
            self.set_reg(inst.c, Value::null());
            self.pc += 1;
            return Ok(());
        }

        if !a.has_attributes() {
            if a.is_vector() && b.is_numericish() {
                if b.length() != 1 {
                    return Err(Error::user_class(
                        "attempt to select more or less than one element",
                        "select-one",
                    ));
                }
                let idx = match b.tag() {
                    Type::Double => b.double_slice()[0] as i64,
                    Type::Integer => b.integer_slice()[0],
                    Type::Logical => b.logical_slice()[0] as i64,
                    Type::Integer32 | Type::Logical32 => b.int32_slice()[0] as i64,
                    _ => 0,
                };
                if idx - 1 < 0 {
                    return Err(Error::user_class(
                        "attempt to select more or less than one element",
                        "select-one",
                    ));
                }
                if idx - 1 >= a.length() {
                    return Err(Error::user_class(
                        "subscript out of bounds",
                        "subscript-oob",
                    ));
                }
                self.set_reg(inst.c, a.element((idx - 1) as usize));
                self.pc += 1;
                return Ok(());
            }
            if a.is_environment() && b.tag() == Type::Character && b.length() == 1 {
                let env = a.environment_ptr();
                let sym = b.character_slice()[0];
                // SAFETY: environment values point at live environments.
                let v = unsafe { (*env).get(sym) };
                if v.is_promise() {
                    crate::call::force(self, v, env, b, inst.c, self.pc + 1);
                } else if v.is_nil() {
                    self.set_reg(inst.c, Value::null());
                    self.pc += 1;
                } else {
                    self.set_reg(inst.c, v);
                    self.pc += 1;
                }
                return Ok(());
            }
        }

        let bb = self.global.strings.bb;
        dispatch::generic_dispatch(self, bb, &[a, b], inst.c, self.pc + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CompiledCall, Instruction, Opcode};
    use crate::intern::intern;
    use crate::state::Global;
    use std::sync::Arc;

    fn proto(
        global: &Arc<Global>,
        registers: i64,
        constants: Vec<Value>,
        calls: Vec<CompiledCall>,
        bc: Vec<Instruction>,
    ) -> *const Prototype {
        Prototype::alloc(
            &global.heap,
            Prototype {
                expression: Value::null(),
                name: intern("test"),
                parameters: Value::null(),
                defaults: Value::null(),
                dot_index: 0,
                registers,
                visible: true,
                constants,
                calls,
                bc,
            },
        )
    }

    fn function_proto(
        global: &Arc<Global>,
        params: &[&str],
        defaults: &[Value],
        dot_index: i64,
        registers: i64,
        constants: Vec<Value>,
        bc: Vec<Instruction>,
    ) -> *const Prototype {
        let heap = &global.heap;
        let mut parameters = Value::alloc_vector(heap, Type::Character, params.len());
        for (i, p) in params.iter().enumerate() {
            parameters.character_slice_mut()[i] = intern(p);
        }
        let mut defs = Value::alloc_vector(heap, Type::List, defaults.len());
        defs.list_slice_mut().copy_from_slice(defaults);
        Prototype::alloc(
            heap,
            Prototype {
                expression: Value::null(),
                name: intern("f"),
                parameters,
                defaults: defs,
                dot_index,
                registers,
                visible: true,
                constants,
                calls: Vec::new(),
                bc,
            },
        )
    }

    fn list_of(global: &Arc<Global>, vs: &[Value]) -> Value {
        let mut l = Value::alloc_vector(&global.heap, Type::List, vs.len());
        l.list_slice_mut().copy_from_slice(vs);
        l
    }

    #[test]
    fn straight_line_arithmetic() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());
        let p = proto(
            &global,
            3,
            vec![Value::integer(1), Value::integer(2)],
            vec![],
            vec![
                Instruction::ac(Opcode::Kget, 0, 0),
                Instruction::ac(Opcode::Kget, 1, 1),
                Instruction::abc(Opcode::Add, 0, 1, 2),
                Instruction::a(Opcode::Ret, 2),
            ],
        );
        let r = state.interpret(p, global.global_env).unwrap();
        assert_eq!(r.scalar_integer(), 3);
        drop(state);
        global.shutdown();
    }

    #[test]
    fn closure_calls_bind_and_return() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());

        // f <- function(a, b) a + b
        let body = function_proto(
            &global,
            &["a", "b"],
            &[Value::nil(), Value::nil()],
            2,
            3,
            vec![Value::symbol(intern("a")), Value::symbol(intern("b"))],
            vec![
                Instruction::ac(Opcode::Ld, 0, 0),
                Instruction::ac(Opcode::Ld, 1, 1),
                Instruction::abc(Opcode::Add, 0, 1, 2),
                Instruction::a(Opcode::Ret, 2),
            ],
        );
        let template = Value::closure(&global.heap, body, std::ptr::null_mut());

        let cc = CompiledCall::new(
            Value::null(),
            list_of(&global, &[Value::integer(1), Value::integer(2)]),
            Value::null(),
            2,
        );
        let main = proto(
            &global,
            2,
            vec![template],
            vec![cc],
            vec![
                Instruction::ac(Opcode::Fun, 0, 0),
                Instruction::abc(Opcode::Call, 0, 0, 1),
                Instruction::a(Opcode::Ret, 1),
            ],
        );
        let r = state.interpret(main, global.global_env).unwrap();
        assert_eq!(r.scalar_integer(), 3);
        drop(state);
        global.shutdown();
    }

    #[test]
    fn promises_force_once_and_update_their_slot() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());
        let s = global.strings;

        // Thunk: n <<- n + 1; 1 + 2. Promise bodies keep clear of registers
        // 0..2, which carry the forcing seed.
        unsafe {
            *(*global.global_env).insert(&global.heap, intern("n")) = Value::integer(0);
        }
        let thunk = proto(
            &global,
            7,
            vec![
                Value::symbol(intern("n")),
                Value::integer(1),
                Value::integer(2),
            ],
            vec![],
            vec![
                Instruction::ac(Opcode::Ld, 0, 3),
                Instruction::ac(Opcode::Kget, 1, 4),
                Instruction::abc(Opcode::Add, 3, 4, 5),
                Instruction::ac(Opcode::Sts, 0, 5),
                Instruction::ac(Opcode::Kget, 1, 4),
                Instruction::ac(Opcode::Kget, 2, 5),
                Instruction::abc(Opcode::Add, 4, 5, 6),
                Instruction::a(Opcode::Ret, 6),
            ],
        );

        let env = crate::dict::Environment::alloc(&global.heap, global.global_env, 8);
        let promise = Value::promise_expression(&global.heap, thunk, env);
        unsafe {
            *(*env).insert(&global.heap, intern("p")) = promise;
        }

        let read_p = proto(
            &global,
            1,
            vec![Value::symbol(intern("p"))],
            vec![],
            vec![
                Instruction::ac(Opcode::Ld, 0, 0),
                Instruction::a(Opcode::Ret, 0),
            ],
        );

        let r = state.interpret(read_p, env).unwrap();
        assert_eq!(r.scalar_integer(), 3);
        // The binding slot was overwritten with the result.
        let slot = unsafe { (*env).get(intern("p")) };
        assert!(!slot.is_promise());
        assert_eq!(slot.scalar_integer(), 3);

        // A second read does not re-run the thunk.
        let r = state.interpret(read_p, env).unwrap();
        assert_eq!(r.scalar_integer(), 3);
        let n = unsafe { (*global.global_env).get(intern("n")) };
        assert_eq!(n.scalar_integer(), 1);
        let _ = s;
        drop(state);
        global.shutdown();
    }

    #[test]
    fn recursive_store_writes_the_binding_ancestor() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());
        let e2 = crate::dict::Environment::alloc(&global.heap, global.global_env, 8);
        let e1 = crate::dict::Environment::alloc(&global.heap, e2, 8);
        unsafe {
            *(*e2).insert(&global.heap, intern("x")) = Value::integer(5);
        }

        let p = proto(
            &global,
            1,
            vec![Value::symbol(intern("x")), Value::integer(9)],
            vec![],
            vec![
                Instruction::ac(Opcode::Kget, 1, 0),
                Instruction::ac(Opcode::Sts, 0, 0),
                Instruction::a(Opcode::Ret, 0),
            ],
        );
        state.interpret(p, e1).unwrap();
        unsafe {
            assert!(!(*e1).has(intern("x")));
            assert_eq!((*e2).get(intern("x")).scalar_integer(), 9);
        }
        drop(state);
        global.shutdown();
    }

    #[test]
    fn pure_prototypes_are_deterministic_across_clones() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());
        let env = crate::dict::Environment::alloc(&global.heap, global.global_env, 8);
        unsafe {
            *(*env).insert(&global.heap, intern("x")) = Value::integer(41);
        }
        let p = proto(
            &global,
            2,
            vec![Value::symbol(intern("x")), Value::integer(1)],
            vec![],
            vec![
                Instruction::ac(Opcode::Ld, 0, 0),
                Instruction::ac(Opcode::Kget, 1, 1),
                Instruction::abc(Opcode::Add, 0, 1, 0),
                Instruction::a(Opcode::Ret, 0),
            ],
        );
        let a = state.interpret(p, env).unwrap();
        let clone = unsafe { (*env).clone_env(&global.heap) };
        let b = state.interpret(p, clone).unwrap();
        assert_eq!(a.scalar_integer(), 42);
        assert_eq!(b.scalar_integer(), 42);
        drop(state);
        global.shutdown();
    }

    #[test]
    fn lazy_arguments_evaluate_once_in_the_caller() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());
        unsafe {
            *(*global.global_env).insert(&global.heap, intern("n")) = Value::integer(0);
        }

        // The argument thunk: n <<- n + 1; 7. Registers 0..2 are reserved
        // for the forcing seed.
        let thunk = proto(
            &global,
            6,
            vec![Value::symbol(intern("n")), Value::integer(1), Value::integer(7)],
            vec![],
            vec![
                Instruction::ac(Opcode::Ld, 0, 3),
                Instruction::ac(Opcode::Kget, 1, 4),
                Instruction::abc(Opcode::Add, 3, 4, 4),
                Instruction::ac(Opcode::Sts, 0, 4),
                Instruction::ac(Opcode::Kget, 2, 5),
                Instruction::a(Opcode::Ret, 5),
            ],
        );

        // f <- function(x) x + x
        let body = function_proto(
            &global,
            &["x"],
            &[Value::nil()],
            1,
            3,
            vec![Value::symbol(intern("x"))],
            vec![
                Instruction::ac(Opcode::Ld, 0, 0),
                Instruction::ac(Opcode::Ld, 0, 1),
                Instruction::abc(Opcode::Add, 0, 1, 2),
                Instruction::a(Opcode::Ret, 2),
            ],
        );
        let template = Value::closure(&global.heap, body, std::ptr::null_mut());
        let arg = Value::promise_expression(&global.heap, thunk, std::ptr::null_mut());
        let cc = CompiledCall::new(Value::null(), list_of(&global, &[arg]), Value::null(), 1);
        let main = proto(
            &global,
            2,
            vec![template],
            vec![cc],
            vec![
                Instruction::ac(Opcode::Fun, 0, 0),
                Instruction::abc(Opcode::Call, 0, 0, 1),
                Instruction::a(Opcode::Ret, 1),
            ],
        );

        let r = state.interpret(main, global.global_env).unwrap();
        assert_eq!(r.scalar_integer(), 14);
        let n = unsafe { (*global.global_env).get(intern("n")) };
        assert_eq!(n.scalar_integer(), 1);
        drop(state);
        global.shutdown();
    }

    #[test]
    fn dots_loads_force_their_elements() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());

        // f <- function(...) ..1
        let body = function_proto(
            &global,
            &["..."],
            &[Value::nil()],
            0,
            1,
            vec![],
            vec![
                Instruction::ac(Opcode::Ldd, 0, 0),
                Instruction::a(Opcode::Ret, 0),
            ],
        );
        let template = Value::closure(&global.heap, body, std::ptr::null_mut());
        let cc = CompiledCall::new(
            Value::null(),
            list_of(&global, &[Value::integer(7), Value::integer(8)]),
            Value::null(),
            2,
        );
        let main = proto(
            &global,
            2,
            vec![template],
            vec![cc],
            vec![
                Instruction::ac(Opcode::Fun, 0, 0),
                Instruction::abc(Opcode::Call, 0, 0, 1),
                Instruction::a(Opcode::Ret, 1),
            ],
        );
        let r = state.interpret(main, global.global_env).unwrap();
        assert_eq!(r.scalar_integer(), 7);
        drop(state);
        global.shutdown();
    }

    #[test]
    fn failed_forcing_leaves_the_slot_bound() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());

        // A thunk that reads a missing variable; register 3 keeps clear of
        // the forcing seed.
        let thunk = proto(
            &global,
            4,
            vec![Value::symbol(intern("no_such_thing"))],
            vec![],
            vec![
                Instruction::ac(Opcode::Ld, 0, 3),
                Instruction::a(Opcode::Ret, 3),
            ],
        );
        let env = crate::dict::Environment::alloc(&global.heap, global.global_env, 8);
        let promise = Value::promise_expression(&global.heap, thunk, env);
        unsafe {
            *(*env).insert(&global.heap, intern("p")) = promise;
        }

        let read_p = proto(
            &global,
            1,
            vec![Value::symbol(intern("p"))],
            vec![],
            vec![
                Instruction::ac(Opcode::Ld, 0, 0),
                Instruction::a(Opcode::Ret, 0),
            ],
        );
        let err = state.interpret(read_p, env).unwrap_err();
        assert!(matches!(err, Error::User { class: "not-found", .. }));
        // The binding slot still holds the promise.
        let slot = unsafe { (*env).get(intern("p")) };
        assert!(slot.is_promise());
        assert_eq!(state.stack.len(), 0);
        drop(state);
        global.shutdown();
    }

    #[test]
    fn user_generics_catch_fast_path_misses() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());

        // "+" <- function(e1, e2) 42
        let body = function_proto(
            &global,
            &["e1", "e2"],
            &[Value::nil(), Value::nil()],
            2,
            1,
            vec![Value::integer(42)],
            vec![
                Instruction::ac(Opcode::Kget, 0, 0),
                Instruction::a(Opcode::Ret, 0),
            ],
        );
        let plus = Value::closure(&global.heap, body, global.global_env);
        unsafe {
            *(*global.global_env).insert(&global.heap, intern("+")) = plus;
        }

        let list = Value::alloc_vector(&global.heap, Type::List, 1);
        let p = proto(
            &global,
            3,
            vec![list, Value::integer(1)],
            vec![],
            vec![
                Instruction::ac(Opcode::Kget, 0, 0),
                Instruction::ac(Opcode::Kget, 1, 1),
                Instruction::abc(Opcode::Add, 0, 1, 2),
                Instruction::a(Opcode::Ret, 2),
            ],
        );
        let r = state.interpret(p, global.global_env).unwrap();
        assert_eq!(r.scalar_integer(), 42);
        drop(state);
        global.shutdown();
    }

    #[test]
    fn missing_generic_is_an_error() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());
        let list = Value::alloc_vector(&global.heap, Type::List, 1);
        let p = proto(
            &global,
            3,
            vec![list, Value::integer(1)],
            vec![],
            vec![
                Instruction::ac(Opcode::Kget, 0, 0),
                Instruction::ac(Opcode::Kget, 1, 1),
                Instruction::abc(Opcode::Mul, 0, 1, 2),
                Instruction::a(Opcode::Ret, 2),
            ],
        );
        let err = state.interpret(p, global.global_env).unwrap_err();
        assert!(matches!(err, Error::User { class: "no-generic", .. }));
        drop(state);
        global.shutdown();
    }

    #[test]
    fn subscript_errors_are_user_errors() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());
        let mut v = Value::alloc_vector(&global.heap, Type::Integer, 3);
        v.integer_slice_mut().copy_from_slice(&[10, 20, 30]);

        let p = |idx: Value| {
            proto(
                &global,
                3,
                vec![v, idx],
                vec![],
                vec![
                    Instruction::ac(Opcode::Kget, 0, 0),
                    Instruction::ac(Opcode::Kget, 1, 1),
                    Instruction::abc(Opcode::Get, 0, 1, 2),
                    Instruction::a(Opcode::Ret, 2),
                ],
            )
        };
        let r = state.interpret(p(Value::integer(2)), global.global_env).unwrap();
        assert_eq!(r.scalar_integer(), 20);

        let err = state
            .interpret(p(Value::integer(7)), global.global_env)
            .unwrap_err();
        assert!(matches!(err, Error::User { class: "subscript-oob", .. }));

        let err = state
            .interpret(p(Value::integer(0)), global.global_env)
            .unwrap_err();
        assert!(matches!(err, Error::User { class: "select-one", .. }));
        drop(state);
        global.shutdown();
    }

    #[test]
    fn stop_hook_intercepts_user_errors() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());

        // __stop__ <- function(m) handled <<- m
        let handler = function_proto(
            &global,
            &["m"],
            &[Value::nil()],
            1,
            1,
            vec![Value::symbol(intern("m")), Value::symbol(intern("handled"))],
            vec![
                Instruction::ac(Opcode::Ld, 0, 0),
                Instruction::ac(Opcode::Sts, 1, 0),
                Instruction::a(Opcode::Ret, 0),
            ],
        );
        let hook = Value::closure(&global.heap, handler, global.global_env);
        unsafe {
            *(*global.global_env).insert(&global.heap, intern("__stop__")) = hook;
            *(*global.global_env).insert(&global.heap, intern("handled")) = Value::null();
        }

        let mut v = Value::alloc_vector(&global.heap, Type::Integer, 1);
        v.integer_slice_mut()[0] = 1;
        let failing = proto(
            &global,
            3,
            vec![v, Value::integer(5)],
            vec![],
            vec![
                Instruction::ac(Opcode::Kget, 0, 0),
                Instruction::ac(Opcode::Kget, 1, 1),
                Instruction::abc(Opcode::Get, 0, 1, 2),
                Instruction::a(Opcode::Ret, 2),
            ],
        );

        let r = state.eval_top_level(failing, global.global_env).unwrap();
        assert!(r.is_nil());
        let handled = unsafe { (*global.global_env).get(intern("handled")) };
        assert_eq!(handled.tag(), Type::Character);
        assert_eq!(handled.scalar_symbol().as_str(), "subscript out of bounds");
        drop(state);
        global.shutdown();
    }

    #[test]
    fn branches_and_sequences() {
        let global = Global::new(1, &[]);
        let mut state = State::new_main(global.clone());
        // if (TRUE) 1:3 else 0
        let p = proto(
            &global,
            3,
            vec![Value::logical_from(true), Value::integer(1), Value::integer(3)],
            vec![],
            vec![
                Instruction::ac(Opcode::Kget, 0, 0),
                Instruction::abc(Opcode::Jc, 1, 3, 0),
                Instruction::ac(Opcode::Kget, 1, 1),
                Instruction::ac(Opcode::Kget, 2, 2),
                Instruction::abc(Opcode::Seq, 1, 2, 0),
                Instruction::a(Opcode::Ret, 0),
            ],
        );
        let r = state.interpret(p, global.global_env).unwrap();
        assert_eq!(r.integer_slice(), &[1, 2, 3]);
        drop(state);
        global.shutdown();
    }
}
