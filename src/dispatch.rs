//! Operator dispatch.
//!
//! Built-in operators first try a typed fast path over attribute-free
//! operands. When the operands don't fit (attributes, unsupported types),
//! the operator's name is looked up along the scope chain; a bound closure
//! gets a synthesized call and a new frame, anything else is a user error.

use crate::code::CompiledCall;
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::intern::Symbol;
use crate::state::{Global, State};
use crate::value::{
    double_is_na, double_na, Type, Value, INTEGER_NA, INTEGER32_NA, LOGICAL_FALSE, LOGICAL_NA,
    LOGICAL_TRUE,
};

/// Element count past which double arithmetic fans out over the task pool.
const PARALLEL_THRESHOLD: i64 = 1 << 14;
const PARALLEL_PPT: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
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
}

impl BinOp {
    pub fn symbol(self, global: &Global) -> Symbol {
        let s = global.strings;
        match self {
            BinOp::Add => s.add,
            BinOp::Sub => s.sub,
            BinOp::Mul => s.mul,
            BinOp::Div => s.div,
            BinOp::Mod => s.modulo,
            BinOp::Pow => s.pow,
            BinOp::Eq => s.eq,
            BinOp::Neq => s.neq,
            BinOp::Lt => s.lt,
            BinOp::Le => s.le,
            BinOp::Gt => s.gt,
            BinOp::Ge => s.ge,
        }
    }

    fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Neq | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    /// Whether the arithmetic result is double regardless of operand types.
    fn forces_double(self) -> bool {
        matches!(self, BinOp::Div | BinOp::Pow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

impl UnOp {
    pub fn symbol(self, global: &Global) -> Symbol {
        match self {
            UnOp::Neg => global.strings.neg,
            UnOp::Not => global.strings.not,
        }
    }
}

// ── Element coercion ──────────────────────────────────────────────────

fn is_fast_numeric(v: &Value) -> bool {
    v.is_numericish() && !v.has_attributes()
}

/// Element `i mod len` widened to double; NA-preserving.
fn at_double(v: &Value, i: usize) -> f64 {
    let i = i % v.length() as usize;
    match v.tag() {
        Type::Double => v.double_slice()[i],
        Type::Integer => {
            let x = v.integer_slice()[i];
            if x == INTEGER_NA {
                double_na()
            } else {
                x as f64
            }
        }
        Type::Logical => {
            let x = v.logical_slice()[i];
            if x == LOGICAL_NA {
                double_na()
            } else {
                x as f64
            }
        }
        Type::Integer32 | Type::Logical32 => {
            let x = v.int32_slice()[i];
            if x == INTEGER32_NA {
                double_na()
            } else {
                x as f64
            }
        }
        _ => double_na(),
    }
}

/// Element `i mod len` widened to integer; NA-preserving.
fn at_integer(v: &Value, i: usize) -> i64 {
    let i = i % v.length() as usize;
    match v.tag() {
        Type::Integer => v.integer_slice()[i],
        Type::Logical => {
            let x = v.logical_slice()[i];
            if x == LOGICAL_NA {
                INTEGER_NA
            } else {
                x as i64
            }
        }
        Type::Integer32 | Type::Logical32 => {
            let x = v.int32_slice()[i];
            if x == INTEGER32_NA {
                INTEGER_NA
            } else {
                x as i64
            }
        }
        _ => INTEGER_NA,
    }
}

fn as_double_vector(heap: &Heap, v: Value) -> Value {
    if v.tag() == Type::Double {
        return v;
    }
    let n = v.length() as usize;
    let mut out = Value::alloc_vector(heap, Type::Double, n);
    for i in 0..n {
        out.double_slice_mut()[i] = at_double(&v, i);
    }
    out
}

// ── Binary fast paths ─────────────────────────────────────────────────

fn arith_double(op: BinOp, x: f64, y: f64) -> f64 {
    if double_is_na(x) || double_is_na(y) {
        return double_na();
    }
    match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => x / y,
        BinOp::Mod => x - (x / y).floor() * y,
        BinOp::Pow => x.powf(y),
        _ => double_na(),
    }
}

fn arith_integer(op: BinOp, x: i64, y: i64) -> i64 {
    if x == INTEGER_NA || y == INTEGER_NA {
        return INTEGER_NA;
    }
    match op {
        BinOp::Add => x.wrapping_add(y),
        BinOp::Sub => x.wrapping_sub(y),
        BinOp::Mul => x.wrapping_mul(y),
        BinOp::Mod => {
            // Result takes the divisor's sign.
            if y == 0 {
                INTEGER_NA
            } else {
                let r = x % y;
                if r != 0 && (r < 0) != (y < 0) {
                    r + y
                } else {
                    r
                }
            }
        }
        _ => INTEGER_NA,
    }
}

fn compare_double(op: BinOp, x: f64, y: f64) -> u8 {
    if double_is_na(x) || double_is_na(y) {
        return LOGICAL_NA;
    }
    let r = match op {
        BinOp::Eq => x == y,
        BinOp::Neq => x != y,
        BinOp::Lt => x < y,
        BinOp::Le => x <= y,
        BinOp::Gt => x > y,
        BinOp::Ge => x >= y,
        _ => false,
    };
    if r {
        LOGICAL_TRUE
    } else {
        LOGICAL_FALSE
    }
}

fn compare_str(op: BinOp, x: &str, y: &str) -> u8 {
    let r = match op {
        BinOp::Eq => x == y,
        BinOp::Neq => x != y,
        BinOp::Lt => x < y,
        BinOp::Le => x <= y,
        BinOp::Gt => x > y,
        BinOp::Ge => x >= y,
        _ => false,
    };
    if r {
        LOGICAL_TRUE
    } else {
        LOGICAL_FALSE
    }
}

struct ZipDoubleArgs {
    op: BinOp,
    a: *const f64,
    la: usize,
    b: *const f64,
    lb: usize,
    out: *mut f64,
}

unsafe fn zip_double_body(args: *mut u8, _header: *mut u8, lo: u64, hi: u64, _state: &mut State) {
    let z = &*(args as *const ZipDoubleArgs);
    for i in lo as usize..hi as usize {
        *z.out.add(i) = arith_double(z.op, *z.a.add(i % z.la), *z.b.add(i % z.lb));
    }
}

/// Try the in-interpreter path for `a op b`. `Ok(None)` means the operands
/// need generic dispatch.
pub fn binary(state: &mut State, op: BinOp, a: Value, b: Value) -> Result<Option<Value>> {
    // Identity semantics for environments and closures.
    if matches!(op, BinOp::Eq | BinOp::Neq) {
        if a.is_environment() && b.is_environment() {
            let same = a.environment_ptr() == b.environment_ptr();
            return Ok(Some(Value::logical_from(same == (op == BinOp::Eq))));
        }
        if a.is_closure() && b.is_closure() {
            let (x, y) = (a.closure_inner(), b.closure_inner());
            let same = x.prototype == y.prototype && x.environment == y.environment;
            return Ok(Some(Value::logical_from(same == (op == BinOp::Eq))));
        }
    }

    // Character comparison: pointer-equal handles, byte order for ranking.
    if op.is_comparison() && a.tag() == Type::Character && b.tag() == Type::Character {
        if a.has_attributes() || b.has_attributes() {
            return Ok(None);
        }
        let (la, lb) = (a.length(), b.length());
        if la == 0 || lb == 0 {
            return Ok(Some(Value::alloc_vector(&state.global.heap, Type::Logical, 0)));
        }
        let n = la.max(lb) as usize;
        let global = state.global.clone();
        let mut out = Value::alloc_vector(&global.heap, Type::Logical, n);
        for i in 0..n {
            let x = a.character_slice()[i % la as usize];
            let y = b.character_slice()[i % lb as usize];
            out.logical_slice_mut()[i] = compare_str(op, x.as_str(), y.as_str());
        }
        return Ok(Some(out));
    }

    if !is_fast_numeric(&a) || !is_fast_numeric(&b) {
        return Ok(None);
    }

    let (la, lb) = (a.length(), b.length());
    if la == 0 || lb == 0 {
        let ty = if op.is_comparison() {
            Type::Logical
        } else if op.forces_double() || a.tag() == Type::Double || b.tag() == Type::Double {
            Type::Double
        } else {
            Type::Integer
        };
        return Ok(Some(Value::alloc_vector(&state.global.heap, ty, 0)));
    }
    let n = la.max(lb);

    if op.is_comparison() {
        let global = state.global.clone();
        if n == 1 {
            return Ok(Some(Value::logical(compare_double(
                op,
                at_double(&a, 0),
                at_double(&b, 0),
            ))));
        }
        let mut out = Value::alloc_vector(&global.heap, Type::Logical, n as usize);
        for i in 0..n as usize {
            out.logical_slice_mut()[i] = compare_double(op, at_double(&a, i), at_double(&b, i));
        }
        return Ok(Some(out));
    }

    let double_result =
        op.forces_double() || a.tag() == Type::Double || b.tag() == Type::Double;

    if double_result {
        if n == 1 {
            return Ok(Some(Value::double(arith_double(
                op,
                at_double(&a, 0),
                at_double(&b, 0),
            ))));
        }
        let global = state.global.clone();
        let mut out = Value::alloc_vector(&global.heap, Type::Double, n as usize);
        if n >= PARALLEL_THRESHOLD && state.global.n_threads > 1 {
            let ac = as_double_vector(&global.heap, a);
            let bc = as_double_vector(&global.heap, b);
            let mut args = ZipDoubleArgs {
                op,
                a: ac.double_slice().as_ptr(),
                la: la as usize,
                b: bc.double_slice().as_ptr(),
                lb: lb as usize,
                out: out.double_slice_mut().as_mut_ptr(),
            };
            state.doall(
                None,
                zip_double_body,
                &mut args as *mut ZipDoubleArgs as *mut u8,
                0,
                n as u64,
                1,
                PARALLEL_PPT,
            );
        } else {
            for i in 0..n as usize {
                out.double_slice_mut()[i] = arith_double(op, at_double(&a, i), at_double(&b, i));
            }
        }
        return Ok(Some(out));
    }

    if n == 1 {
        return Ok(Some(Value::integer(arith_integer(
            op,
            at_integer(&a, 0),
            at_integer(&b, 0),
        ))));
    }
    let global = state.global.clone();
    let mut out = Value::alloc_vector(&global.heap, Type::Integer, n as usize);
    for i in 0..n as usize {
        out.integer_slice_mut()[i] = arith_integer(op, at_integer(&a, i), at_integer(&b, i));
    }
    Ok(Some(out))
}

/// Try the in-interpreter path for a unary op.
pub fn unary(state: &mut State, op: UnOp, a: Value) -> Result<Option<Value>> {
    if !is_fast_numeric(&a) {
        return Ok(None);
    }
    let n = a.length();
    let global = state.global.clone();
    match op {
        UnOp::Neg => {
            if a.tag() == Type::Double {
                if n == 1 {
                    let x = a.scalar_double();
                    return Ok(Some(Value::double(if double_is_na(x) { x } else { -x })));
                }
                let mut out = Value::alloc_vector(&global.heap, Type::Double, n as usize);
                for i in 0..n as usize {
                    let x = a.double_slice()[i];
                    out.double_slice_mut()[i] = if double_is_na(x) { x } else { -x };
                }
                Ok(Some(out))
            } else {
                if n == 1 {
                    let x = at_integer(&a, 0);
                    return Ok(Some(Value::integer(if x == INTEGER_NA { x } else { -x })));
                }
                let mut out = Value::alloc_vector(&global.heap, Type::Integer, n as usize);
                for i in 0..n as usize {
                    let x = at_integer(&a, i);
                    out.integer_slice_mut()[i] = if x == INTEGER_NA { x } else { -x };
                }
                Ok(Some(out))
            }
        }
        UnOp::Not => {
            let mut out = Value::alloc_vector(&global.heap, Type::Logical, n as usize);
            for i in 0..n as usize {
                let x = at_double(&a, i);
                out.logical_slice_mut()[i] = if double_is_na(x) {
                    LOGICAL_NA
                } else if x == 0.0 {
                    LOGICAL_TRUE
                } else {
                    LOGICAL_FALSE
                };
            }
            Ok(Some(if n == 1 {
                Value::logical(out.logical_slice()[0])
            } else {
                out
            }))
        }
    }
}

// ── Generic dispatch ──────────────────────────────────────────────────

/// Quote an operand for a synthesized call: symbols and call forms wrap in
/// `quote(...)`, everything else is self-evaluating.
fn quote(global: &Global, v: Value) -> Value {
    match v.tag() {
        Type::ScalarString => global.quoted_symbol(v.scalar_symbol()),
        Type::Pairlist => {
            let heap = &global.heap;
            let tail = Value::pairlist(heap, v, Value::null(), Value::nil());
            Value::pairlist(heap, Value::symbol(global.strings.quote), tail, Value::nil())
        }
        _ => v,
    }
}

fn no_generic(op: Symbol, a: &Value, b: Option<&Value>) -> Error {
    let types = match b {
        Some(b) => format!(" type: {} {}", a.tag().name(), b.tag().name()),
        None => format!(" type: {}", a.tag().name()),
    };
    Error::user_class(
        format!("failed to find generic for builtin op: {}{}", op.as_str(), types),
        "no-generic",
    )
}

/// Look up a user generic for `op` and enter it over the given operands.
pub fn generic_dispatch(
    state: &mut State,
    op: Symbol,
    operands: &[Value],
    dest: i64,
    return_pc: usize,
) -> Result<()> {
    let global = state.global.clone();
    let env = state.frame.environment;
    // SAFETY: the current frame's environment is live.
    let found = unsafe { (*env).get_recursive(op) };
    if let Some((f, _)) = found {
        if f.is_closure() {
            let heap = &global.heap;
            // Call form, innermost cell first.
            let mut form = Value::null();
            for v in operands.iter().rev() {
                form = Value::pairlist(heap, quote(&global, *v), form, Value::nil());
            }
            let call_expr = Value::pairlist(heap, Value::symbol(op), form, Value::nil());

            let mut arguments = Value::alloc_vector(heap, Type::List, operands.len());
            arguments.list_slice_mut().copy_from_slice(operands);
            let cc = CompiledCall::new(call_expr, arguments, Value::null(), operands.len() as i64);
            return state.enter_closure(env, f, &cc, dest, return_pc);
        }
    }
    Err(no_generic(op, &operands[0], operands.get(1)))
}

/// Route a user error through a bound `__stop__` closure, if any. Returns
/// true when a handler frame was entered.
pub fn stop_dispatch(state: &mut State, message: &str, dest: i64, return_pc: usize) -> bool {
    let global = state.global.clone();
    let env = if state.frame.environment.is_null() {
        global.global_env
    } else {
        state.frame.environment
    };
    // SAFETY: env is live.
    let found = unsafe { (*env).get_recursive(global.strings.stop) };
    if let Some((f, _)) = found {
        if f.is_closure() {
            let heap = &global.heap;
            let msg = Value::character(crate::intern::intern(message));
            let mut arguments = Value::alloc_vector(heap, Type::List, 1);
            arguments.list_slice_mut()[0] = msg;
            let call_expr = Value::pairlist(
                heap,
                Value::symbol(global.strings.stop),
                Value::pairlist(heap, msg, Value::null(), Value::nil()),
                Value::nil(),
            );
            let cc = CompiledCall::new(call_expr, arguments, Value::null(), 1);
            if state.enter_closure(env, f, &cc, dest, return_pc).is_ok() {
                return true;
            }
        }
    }
    false
}

// ── Ternary and structural ops ────────────────────────────────────────

/// Element select over three vectors: `cond` picks per element from `yes`
/// and `no`, recycled.
pub fn ifelse(state: &mut State, cond: Value, yes: Value, no: Value) -> Result<Value> {
    if !cond.is_vector() || !yes.is_vector() || !no.is_vector() {
        return Err(Error::user_class(
            "non-zippable argument to ifelse operator",
            "non-zippable",
        ));
    }
    let n = cond.length();
    let (ly, ln) = (yes.length(), no.length());
    if n == 0 || ly == 0 || ln == 0 {
        return Ok(Value::alloc_vector(&state.global.heap, Type::Logical, 0));
    }

    let global = state.global.clone();
    let heap = &global.heap;
    let character = yes.tag() == Type::Character && no.tag() == Type::Character;
    let double = !character
        && (yes.tag() == Type::Double || no.tag() == Type::Double);

    if character {
        let mut out = Value::alloc_vector(heap, Type::Character, n as usize);
        for i in 0..n as usize {
            let c = at_double(&cond, i);
            if double_is_na(c) {
                out.character_slice_mut()[i] = global.strings.na;
            } else if c != 0.0 {
                out.character_slice_mut()[i] = yes.character_slice()[i % ly as usize];
            } else {
                out.character_slice_mut()[i] = no.character_slice()[i % ln as usize];
            }
        }
        return Ok(out);
    }
    if !yes.is_numericish() || !no.is_numericish() {
        return Err(Error::user_class(
            "non-zippable argument to ifelse operator",
            "non-zippable",
        ));
    }
    if double {
        let mut out = Value::alloc_vector(heap, Type::Double, n as usize);
        for i in 0..n as usize {
            let c = at_double(&cond, i);
            out.double_slice_mut()[i] = if double_is_na(c) {
                double_na()
            } else if c != 0.0 {
                at_double(&yes, i)
            } else {
                at_double(&no, i)
            };
        }
        Ok(out)
    } else {
        let mut out = Value::alloc_vector(heap, Type::Integer, n as usize);
        for i in 0..n as usize {
            let c = at_double(&cond, i);
            out.integer_slice_mut()[i] = if double_is_na(c) {
                INTEGER_NA
            } else if c != 0.0 {
                at_integer(&yes, i)
            } else {
                at_integer(&no, i)
            };
        }
        Ok(out)
    }
}

/// `from:to`, inclusive, ascending or descending.
pub fn sequence(state: &mut State, from: Value, to: Value) -> Result<Value> {
    let from = scalar_integer_of(&from)?;
    let to = scalar_integer_of(&to)?;
    let n = (to - from).unsigned_abs() as usize + 1;
    let global = state.global.clone();
    let mut out = Value::alloc_vector(&global.heap, Type::Integer, n);
    let step = if to >= from { 1 } else { -1 };
    let mut x = from;
    for slot in out.integer_slice_mut() {
        *slot = x;
        x += step;
    }
    Ok(out)
}

fn scalar_integer_of(v: &Value) -> Result<i64> {
    if v.length() != 1 || !v.is_numericish() {
        return Err(Error::user("invalid sequence endpoint"));
    }
    let x = at_integer(v, 0);
    if x == INTEGER_NA {
        return Err(Error::user("NA sequence endpoint"));
    }
    Ok(x)
}

/// The branch predicate: a length-one logical-coercible value.
pub fn condition_bool(v: Value) -> Result<bool> {
    if !v.is_numericish() || v.length() < 1 {
        return Err(Error::user_class(
            "argument is not interpretable as logical",
            "invalid-condition",
        ));
    }
    if v.length() > 1 {
        return Err(Error::user_class(
            "the condition has length > 1",
            "invalid-condition",
        ));
    }
    let x = at_double(&v, 0);
    if double_is_na(x) {
        return Err(Error::user_class(
            "missing value where TRUE/FALSE needed",
            "invalid-condition",
        ));
    }
    Ok(x != 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Global;
    use crate::value::LOGICAL_NA;

    #[test]
    fn scalar_arithmetic_promotes() {
        let global = Global::new(1, &[]);
        let mut state = crate::state::State::new_main(global.clone());
        let r = binary(&mut state, BinOp::Add, Value::integer(1), Value::integer(2))
            .unwrap()
            .unwrap();
        assert_eq!(r.scalar_integer(), 3);

        let r = binary(&mut state, BinOp::Add, Value::integer(1), Value::double(0.5))
            .unwrap()
            .unwrap();
        assert_eq!(r.scalar_double(), 1.5);

        // Division always yields double.
        let r = binary(&mut state, BinOp::Div, Value::integer(1), Value::integer(2))
            .unwrap()
            .unwrap();
        assert_eq!(r.scalar_double(), 0.5);
        drop(state);
        global.shutdown();
    }

    #[test]
    fn recycling_wraps_the_shorter_operand() {
        let global = Global::new(1, &[]);
        let mut state = crate::state::State::new_main(global.clone());
        let mut a = Value::alloc_vector(&global.heap, Type::Integer, 4);
        a.integer_slice_mut().copy_from_slice(&[1, 2, 3, 4]);
        let mut b = Value::alloc_vector(&global.heap, Type::Integer, 2);
        b.integer_slice_mut().copy_from_slice(&[10, 20]);
        let r = binary(&mut state, BinOp::Add, a, b).unwrap().unwrap();
        assert_eq!(r.integer_slice(), &[11, 22, 13, 24]);
        drop(state);
        global.shutdown();
    }

    #[test]
    fn na_propagates() {
        let global = Global::new(1, &[]);
        let mut state = crate::state::State::new_main(global.clone());
        let r = binary(
            &mut state,
            BinOp::Add,
            Value::integer(INTEGER_NA),
            Value::integer(1),
        )
        .unwrap()
        .unwrap();
        assert_eq!(r.scalar_integer(), INTEGER_NA);

        let r = binary(
            &mut state,
            BinOp::Lt,
            Value::double(double_na()),
            Value::double(1.0),
        )
        .unwrap()
        .unwrap();
        assert_eq!(r.scalar_logical(), LOGICAL_NA);
        drop(state);
        global.shutdown();
    }

    #[test]
    fn long_double_arithmetic_runs_through_the_pool() {
        let global = Global::new(4, &[]);
        let mut state = crate::state::State::new_main(global.clone());
        let n = 100_000;
        let mut a = Value::alloc_vector(&global.heap, Type::Double, n);
        let mut b = Value::alloc_vector(&global.heap, Type::Double, n);
        for i in 0..n {
            a.double_slice_mut()[i] = i as f64;
            b.double_slice_mut()[i] = 2.0;
        }
        let r = binary(&mut state, BinOp::Mul, a, b).unwrap().unwrap();
        assert_eq!(r.length(), n as i64);
        for i in (0..n).step_by(7919) {
            assert_eq!(r.double_slice()[i], (i as f64) * 2.0);
        }
        drop(state);
        global.shutdown();
    }

    #[test]
    fn identity_laws_for_closures_and_environments() {
        let global = Global::new(1, &[]);
        let mut state = crate::state::State::new_main(global.clone());
        let e = Value::environment(global.global_env);
        let eq = binary(&mut state, BinOp::Eq, e, e).unwrap().unwrap();
        assert_eq!(eq.scalar_logical(), LOGICAL_TRUE);
        let ne = binary(&mut state, BinOp::Neq, e, e).unwrap().unwrap();
        assert_eq!(ne.scalar_logical(), LOGICAL_FALSE);

        let other = Value::environment(global.empty);
        let eq2 = binary(&mut state, BinOp::Eq, e, other).unwrap().unwrap();
        assert_eq!(eq2.scalar_logical(), LOGICAL_FALSE);
        drop(state);
        global.shutdown();
    }

    #[test]
    fn character_comparison_uses_handles() {
        let global = Global::new(1, &[]);
        let mut state = crate::state::State::new_main(global.clone());
        let a = Value::character(crate::intern::intern("abc"));
        let b = Value::character(crate::intern::intern("abc"));
        let c = Value::character(crate::intern::intern("abd"));
        assert_eq!(
            binary(&mut state, BinOp::Eq, a, b).unwrap().unwrap().scalar_logical(),
            LOGICAL_TRUE
        );
        assert_eq!(
            binary(&mut state, BinOp::Lt, a, c).unwrap().unwrap().scalar_logical(),
            LOGICAL_TRUE
        );
        drop(state);
        global.shutdown();
    }

    #[test]
    fn unsupported_operands_defer_to_generics() {
        let global = Global::new(1, &[]);
        let mut state = crate::state::State::new_main(global.clone());
        let l = Value::alloc_vector(&global.heap, Type::List, 1);
        assert!(binary(&mut state, BinOp::Add, l, Value::integer(1))
            .unwrap()
            .is_none());
        drop(state);
        global.shutdown();
    }

    #[test]
    fn ifelse_zips_and_rejects_nonvectors() {
        let global = Global::new(1, &[]);
        let mut state = crate::state::State::new_main(global.clone());
        let mut cond = Value::alloc_vector(&global.heap, Type::Logical, 3);
        cond.logical_slice_mut().copy_from_slice(&[1, 0, 1]);
        let yes = Value::integer(10);
        let no = Value::integer(20);
        let r = ifelse(&mut state, cond, yes, no).unwrap();
        assert_eq!(r.integer_slice(), &[10, 20, 10]);

        let err = ifelse(&mut state, Value::environment(global.global_env), yes, no).unwrap_err();
        assert!(matches!(err, Error::User { class: "non-zippable", .. }));
        drop(state);
        global.shutdown();
    }

    #[test]
    fn sequences_run_both_directions() {
        let global = Global::new(1, &[]);
        let mut state = crate::state::State::new_main(global.clone());
        let up = sequence(&mut state, Value::integer(1), Value::integer(4)).unwrap();
        assert_eq!(up.integer_slice(), &[1, 2, 3, 4]);
        let down = sequence(&mut state, Value::integer(3), Value::integer(1)).unwrap();
        assert_eq!(down.integer_slice(), &[3, 2, 1]);
        drop(state);
        global.shutdown();
    }

    #[test]
    fn condition_requires_a_definite_scalar() {
        assert!(condition_bool(Value::logical_from(true)).unwrap());
        assert!(!condition_bool(Value::integer(0)).unwrap());
        assert!(condition_bool(Value::logical(LOGICAL_NA)).is_err());
        assert!(condition_bool(Value::null()).is_err());
    }
}
