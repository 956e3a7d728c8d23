//! The bytecode interpreter: a fetch-decode-execute loop over 32-bit
//! words.
//!
//! One call to [`run`] executes one interpreted frame. The frame is
//! *reused* — no new operand stack, no Rust recursion — for `RECUR`,
//! `LOOP_RECUR`, and self-targeted `TAIL_CALL`, which is what makes
//! tail recursion of unbounded depth run in constant stack space.
//! Non-tail `INVOKE` recurses through [`Runtime::invoke`] and costs one
//! Rust frame per interpreted frame.
//!
//! When anything raises mid-frame, the in-flight error picks up a trace
//! entry naming this code object and the source point bracketing the
//! faulting instruction, then continues unwinding.

use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::{Code, Op};
use crate::callable::{Closure, MultiArityFn, VariadicCode};
use crate::error::{ErrorKind, Result};
use crate::runtime::Runtime;
use crate::value::Value;

/// How a frame stopped executing.
enum Exit {
    /// `RETURN`: unwind with this value.
    Return(Value),
    /// `RECUR` / self `TAIL_CALL`: restart the frame with new arguments.
    Recur(Vec<Value>),
    /// Non-self `TAIL_CALL`: invoke the target, then return its result.
    TailInvoke(Value, Vec<Value>),
}

/// Mutable state of one executing frame.
struct FrameState {
    args: Vec<Value>,
    stack: Vec<Value>,
    /// Preallocated operand-stack bound, from `Code::stack_size`.
    cap: usize,
    ip: usize,
}

/// Execute a code or closure value with an argument vector.
pub(crate) fn run(rt: &mut Runtime, callee: Value, mut args: Vec<Value>) -> Result<Value> {
    let (code, closure): (Rc<Code>, Option<Rc<Closure>>) = match &callee {
        Value::Code(c) => (c.clone(), None),
        Value::Closure(c) => (c.code().clone(), Some(c.clone())),
        other => {
            return Err(ErrorKind::Invariant(format!(
                "interpreter entered with a non-code callable: {}",
                other.type_name()
            ))
            .into());
        }
    };
    let name = code.name().to_string();

    loop {
        let mut fr = FrameState {
            args: std::mem::take(&mut args),
            stack: Vec::with_capacity(code.stack_size()),
            cap: code.stack_size(),
            ip: 0,
        };

        let (exit, exit_ip) = loop {
            let op_ip = fr.ip;
            match exec_op(rt, &mut fr, &code, closure.as_deref(), &callee) {
                Ok(None) => {}
                Ok(Some(exit)) => break (exit, op_ip),
                Err(e) => return Err(e.in_code(&name, code.debug_point(op_ip))),
            }
        };

        match exit {
            Exit::Return(v) => return Ok(v),
            Exit::Recur(new_args) => {
                args = new_args;
            }
            Exit::TailInvoke(f, new_args) => {
                return rt
                    .invoke(&f, &new_args)
                    .map_err(|e| e.in_code(&name, code.debug_point(exit_ip)));
            }
        }
    }
}

/// Decode and execute a single instruction.
fn exec_op(
    rt: &mut Runtime,
    fr: &mut FrameState,
    code: &Code,
    closure: Option<&Closure>,
    self_val: &Value,
) -> Result<Option<Exit>> {
    rt.tick()?;
    let word = fetch(code, &mut fr.ip)?;
    let op = Op::from_word(word)
        .ok_or_else(|| ErrorKind::Invariant(format!("bad opcode word {:#010x}", word)))?;

    match op {
        Op::LoadConst => {
            let k = fetch(code, &mut fr.ip)?;
            let v = code.const_at(k)?.clone();
            push(fr, v);
        }
        Op::Add => {
            let b = pop(fr)?;
            let a = pop(fr)?;
            let add = rt.add_fn();
            let v = rt.invoke(&add, &[a, b])?;
            push(fr, v);
        }
        Op::Eq => {
            let b = pop(fr)?;
            let a = pop(fr)?;
            let eq = rt.eq_fn();
            let v = rt.invoke(&eq, &[a, b])?;
            push(fr, v);
        }
        Op::Invoke => {
            let n = fetch(code, &mut fr.ip)? as usize;
            let call_args = pop_n(fr, n)?;
            let f = pop(fr)?;
            let v = rt.invoke(&f, &call_args)?;
            push(fr, v);
        }
        Op::TailCall => {
            let n = fetch(code, &mut fr.ip)? as usize;
            let call_args = pop_n(fr, n)?;
            let f = pop(fr)?;
            // A tail call through a var still reuses the frame when the
            // root is the executing callable.
            let target = if let Value::Var(var) = &f {
                rt.deref(var)?
            } else {
                f
            };
            if same_callable(&target, self_val) {
                return Ok(Some(Exit::Recur(call_args)));
            }
            return Ok(Some(Exit::TailInvoke(target, call_args)));
        }
        Op::DupNth => {
            let k = fetch(code, &mut fr.ip)? as usize;
            let idx = fr
                .stack
                .len()
                .checked_sub(k + 1)
                .ok_or_else(|| underflow(code))?;
            let v = fr.stack[idx].clone();
            push(fr, v);
        }
        Op::Return => {
            let v = pop(fr)?;
            return Ok(Some(Exit::Return(v)));
        }
        Op::CondBr => {
            let off = fetch(code, &mut fr.ip)?;
            let v = pop(fr)?;
            if !v.is_truthy() {
                fr.ip = jump(fr.ip, off, code)?;
            }
        }
        Op::Jmp => {
            let off = fetch(code, &mut fr.ip)?;
            fr.ip = jump(fr.ip, off, code)?;
        }
        Op::ClosedOver => {
            let k = fetch(code, &mut fr.ip)?;
            let cl = closure.ok_or_else(|| {
                ErrorKind::Invariant(format!("CLOSED_OVER outside a closure in {}", code.name()))
            })?;
            let v = cl.closed_over(k)?.clone();
            push(fr, v);
        }
        Op::MakeClosure => {
            let k = fetch(code, &mut fr.ip)?;
            let n = fetch(code, &mut fr.ip)? as usize;
            let inner = match code.const_at(k)? {
                Value::Code(c) => c.clone(),
                other => {
                    return Err(ErrorKind::TypeAssertion {
                        expected: "a code object".to_string(),
                        got: other.type_name().to_string(),
                    }
                    .into());
                }
            };
            let captures = pop_n(fr, n)?;
            push(fr, Value::Closure(Rc::new(Closure::new(inner, captures))));
        }
        Op::SetVar => {
            let k = fetch(code, &mut fr.ip)?;
            let var = const_var(code, k)?;
            let v = pop(fr)?;
            var.set_root(v);
            push(fr, Value::Var(var));
        }
        Op::Pop => {
            pop(fr)?;
        }
        Op::DerefVar => {
            let k = fetch(code, &mut fr.ip)?;
            let var = const_var(code, k)?;
            let v = rt.deref(&var)?;
            push(fr, v);
        }
        Op::Install => {
            let method = pop(fr)?;
            let tp = match pop(fr)? {
                Value::Type(tp) => tp,
                other => {
                    return Err(ErrorKind::TypeAssertion {
                        expected: "a type".to_string(),
                        got: other.type_name().to_string(),
                    }
                    .into());
                }
            };
            match pop(fr)? {
                Value::Polymorphic(pf) => pf.extend(tp, method),
                other => {
                    return Err(ErrorKind::TypeAssertion {
                        expected: "a polymorphic fn".to_string(),
                        got: other.type_name().to_string(),
                    }
                    .into());
                }
            }
        }
        Op::Recur => {
            let n = fetch(code, &mut fr.ip)? as usize;
            let new_args = pop_n(fr, n)?;
            return Ok(Some(Exit::Recur(new_args)));
        }
        Op::LoopRecur => {
            let n = fetch(code, &mut fr.ip)? as usize;
            let base = fetch(code, &mut fr.ip)? as usize;
            let entry = fetch(code, &mut fr.ip)? as usize;
            let vals = pop_n(fr, n)?;
            if base > fr.stack.len() {
                return Err(underflow(code));
            }
            if entry >= code.bytecode().len() {
                return Err(ErrorKind::Invariant(format!(
                    "loop entry {} out of range in {}",
                    entry,
                    code.name()
                ))
                .into());
            }
            fr.stack.truncate(base);
            fr.stack.extend(vals);
            fr.ip = entry;
        }
        Op::Arg => {
            let k = fetch(code, &mut fr.ip)? as usize;
            let v = fr
                .args
                .get(k)
                .ok_or_else(|| {
                    ErrorKind::Invariant(format!(
                        "argument index {} out of range in {} ({} args)",
                        k,
                        code.name(),
                        fr.args.len()
                    ))
                })?
                .clone();
            push(fr, v);
        }
        Op::PushSelf => {
            push(fr, self_val.clone());
        }
        Op::PopUpN => {
            let n = fetch(code, &mut fr.ip)? as usize;
            let top = pop(fr)?;
            let keep = fr
                .stack
                .len()
                .checked_sub(n)
                .ok_or_else(|| underflow(code))?;
            fr.stack.truncate(keep);
            push(fr, top);
        }
        Op::MakeMultiArity => {
            let required_arity = fetch(code, &mut fr.ip)? as usize;
            let count = match pop(fr)? {
                Value::Int(i) if i >= 0 => i as usize,
                other => {
                    return Err(ErrorKind::TypeAssertion {
                        expected: "a non-negative pair count".to_string(),
                        got: other.type_name().to_string(),
                    }
                    .into());
                }
            };
            let rest_fn = match pop(fr)? {
                Value::Nil => None,
                f if f.is_callable() => Some(f),
                other => {
                    return Err(ErrorKind::TypeAssertion {
                        expected: "a callable or nil".to_string(),
                        got: other.type_name().to_string(),
                    }
                    .into());
                }
            };
            let mut arities = HashMap::new();
            for _ in 0..count {
                let f = pop(fr)?;
                let arity = match pop(fr)? {
                    Value::Int(i) if i >= 0 => i as usize,
                    other => {
                        return Err(ErrorKind::TypeAssertion {
                            expected: "a non-negative arity".to_string(),
                            got: other.type_name().to_string(),
                        }
                        .into());
                    }
                };
                arities.insert(arity, f);
            }
            push(
                fr,
                Value::MultiArity(Rc::new(MultiArityFn::new(arities, rest_fn, required_arity))),
            );
        }
        Op::MakeVariadic => {
            let n = fetch(code, &mut fr.ip)? as usize;
            let f = pop(fr)?;
            push(fr, Value::Variadic(Rc::new(VariadicCode::new(f, n))));
        }
    }
    Ok(None)
}

/// Read the next word, advancing the instruction pointer.
fn fetch(code: &Code, ip: &mut usize) -> Result<u32> {
    let word = code
        .bytecode()
        .get(*ip)
        .copied()
        .ok_or_else(|| ErrorKind::Invariant(format!("ran off the bytecode in {}", code.name())))?;
    *ip += 1;
    Ok(word)
}

fn push(fr: &mut FrameState, v: Value) {
    fr.stack.push(v);
    debug_assert!(
        fr.stack.len() <= fr.cap,
        "operand stack grew past the declared stack_size ({})",
        fr.cap
    );
}

fn pop(fr: &mut FrameState) -> Result<Value> {
    fr.stack
        .pop()
        .ok_or_else(|| ErrorKind::Invariant("operand stack underflow".to_string()).into())
}

/// Pop `n` values, preserving push order.
fn pop_n(fr: &mut FrameState, n: usize) -> Result<Vec<Value>> {
    let split = fr
        .stack
        .len()
        .checked_sub(n)
        .ok_or_else(|| ErrorKind::Invariant("operand stack underflow".to_string()))?;
    Ok(fr.stack.split_off(split))
}

fn underflow(code: &Code) -> crate::error::Error {
    ErrorKind::Invariant(format!("operand stack underflow in {}", code.name())).into()
}

/// Resolve a relative branch. `off` is a signed word offset from the
/// position after the operand.
fn jump(ip: usize, off: u32, code: &Code) -> Result<usize> {
    let target = ip as i64 + (off as i32) as i64;
    if target < 0 || target >= code.bytecode().len() as i64 {
        return Err(ErrorKind::Invariant(format!(
            "branch target {} out of range in {}",
            target,
            code.name()
        ))
        .into());
    }
    Ok(target as usize)
}

fn const_var(code: &Code, k: u32) -> Result<Rc<crate::namespace::Var>> {
    match code.const_at(k)? {
        Value::Var(var) => Ok(var.clone()),
        other => Err(ErrorKind::TypeAssertion {
            expected: "a var".to_string(),
            got: other.type_name().to_string(),
        }
        .into()),
    }
}

/// Frame-reuse check for `TAIL_CALL`: the same code object or the same
/// closure instance. A different closure over the same code does not
/// qualify — its captures differ.
fn same_callable(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Code(x), Value::Code(y)) => Rc::ptr_eq(x, y),
        (Value::Closure(x), Value::Closure(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}
