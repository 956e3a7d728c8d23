//! End-to-end scenarios against the public runtime API: hand-assembled
//! bytecode, callable adapters, vars and dynamic bindings, protocol
//! dispatch.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use pretty_assertions::assert_eq;
use selkie::{
    Code, ErrorKind, Limits, MultiArityFn, NativeFn, Op, Result, Runtime, SourcePos, Symbol,
    TraceEntry, Value, VariadicCode,
};

fn code_value(b: &mut selkie::CodeBuilder, stack: usize) -> Value {
    Value::Code(Rc::new(b.stack_size(stack).build()))
}

fn native(name: &str, f: impl Fn(&mut Runtime, &[Value]) -> Result<Value> + 'static) -> Value {
    Value::Native(NativeFn::from_raw(name, f))
}

// ---------------------------------------------------------------------------
// Literal scenarios
// ---------------------------------------------------------------------------

#[test]
fn constant_return() {
    // consts [42], bytecode LOAD_CONST 0; RETURN, stack 1.
    let code = Code::new(
        Symbol::simple("const-return"),
        vec![Value::Int(42)],
        vec![0, 0, 6],
        1,
        BTreeMap::new(),
    );
    let mut rt = Runtime::new();
    let result = rt.invoke(&Value::Code(Rc::new(code)), &[]).unwrap();
    assert_eq!(result, Value::Int(42));
}

#[test]
fn addition_via_add() {
    // consts [2, 3], bytecode LOAD_CONST 0; LOAD_CONST 1; ADD; RETURN.
    let code = Code::new(
        Symbol::simple("two-plus-three"),
        vec![Value::Int(2), Value::Int(3)],
        vec![0, 0, 0, 1, 1, 6],
        2,
        BTreeMap::new(),
    );
    let mut rt = Runtime::new();
    let result = rt.invoke(&Value::Code(Rc::new(code)), &[]).unwrap();
    assert_eq!(result, Value::Int(5));
}

#[test]
fn closure_over_captured_value() {
    let mut rt = Runtime::new();

    // Inner body: CLOSED_OVER 0; RETURN.
    let inner = Rc::new(Code::new(
        Symbol::simple("inner"),
        vec![],
        vec![9, 0, 6],
        1,
        BTreeMap::new(),
    ));

    // Outer: push 7, close over inner with one capture, return the closure.
    let mut b = Code::builder("outer");
    let k7 = b.constant(Value::Int(7));
    let kinner = b.constant(Value::Code(inner));
    b.emit(Op::LoadConst, &[k7]);
    b.emit(Op::MakeClosure, &[kinner, 1]);
    b.emit(Op::Return, &[]);
    let outer = code_value(&mut b, 1);

    let closure = rt.invoke(&outer, &[]).unwrap();
    assert!(matches!(closure, Value::Closure(_)));
    assert_eq!(rt.invoke(&closure, &[]).unwrap(), Value::Int(7));
}

#[test]
fn variadic_packing() {
    let mut rt = Runtime::new();

    // Inner returns its second argument (the rest array).
    let mut b = Code::builder("take-rest");
    b.emit(Op::Arg, &[1]);
    b.emit(Op::Return, &[]);
    let inner = code_value(&mut b, 1);

    let w = Value::Variadic(Rc::new(VariadicCode::new(inner, 1)));

    let packed = rt
        .invoke(&w, &[Value::Int(10), Value::Int(20), Value::Int(30)])
        .unwrap();
    assert_eq!(packed, Value::array(vec![Value::Int(20), Value::Int(30)]));

    let empty = rt.invoke(&w, &[Value::Int(10)]).unwrap();
    assert_eq!(empty, Value::array(vec![]));
}

#[test]
fn variadic_underflow_is_an_arity_error() {
    let mut rt = Runtime::new();
    let inner = native("inner", |_, _| Ok(Value::Nil));
    let w = Value::Variadic(Rc::new(VariadicCode::new(inner, 2)));
    let err = rt.invoke(&w, &[Value::Int(1)]).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ArityMismatch { got: 1, .. }));
}

#[test]
fn multi_arity_dispatch() {
    let mut rt = Runtime::new();
    let f0 = native("f0", |_, _| Ok(Value::str("zero")));
    let f2 = native("f2", |_, _| Ok(Value::str("two")));
    let mut arities = HashMap::new();
    arities.insert(0, f0);
    arities.insert(2, f2);
    let m = Value::MultiArity(Rc::new(MultiArityFn::new(arities, None, 0)));

    assert_eq!(rt.invoke(&m, &[]).unwrap(), Value::str("zero"));
    assert_eq!(
        rt.invoke(&m, &[Value::Nil, Value::Nil]).unwrap(),
        Value::str("two")
    );

    let err = rt.invoke(&m, &[Value::Nil]).unwrap_err();
    match err.kind() {
        ErrorKind::ArityMismatch { got, expected, .. } => {
            assert_eq!(*got, 1);
            assert_eq!(expected, "0, 2");
        }
        other => panic!("expected arity mismatch, got {:?}", other),
    }
}

#[test]
fn dynamic_var_shadowing() {
    let mut rt = Runtime::new();
    let x = rt.intern_var("user", "*x*");
    x.set_dynamic();
    x.set_root(Value::Int(1));

    let inside = rt
        .with_bindings(&[(x.clone(), Value::Int(2))], |rt| rt.deref(&x))
        .unwrap();
    assert_eq!(inside, Value::Int(2));
    assert_eq!(rt.deref(&x).unwrap(), Value::Int(1));
}

#[test]
fn dynamic_var_shadowing_survives_errors() {
    let mut rt = Runtime::new();
    let x = rt.intern_var("user", "*x*");
    x.set_dynamic();
    x.set_root(Value::Int(1));

    let depth = rt.binding_depth();
    let result: Result<()> = rt.with_bindings(&[(x.clone(), Value::Int(2))], |_| {
        Err(ErrorKind::Host("deliberate".to_string()).into())
    });
    assert!(result.is_err());
    assert_eq!(rt.binding_depth(), depth);
    assert_eq!(rt.deref(&x).unwrap(), Value::Int(1));
}

#[test]
fn nested_bindings_compose_as_a_stack() {
    let mut rt = Runtime::new();
    let x = rt.intern_var("user", "*x*");
    x.set_dynamic();
    x.set_root(Value::Int(0));

    let x2 = x.clone();
    rt.with_bindings(&[(x.clone(), Value::Int(1))], |rt| {
        assert_eq!(rt.deref(&x2).unwrap(), Value::Int(1));
        let x3 = x2.clone();
        rt.with_bindings(&[(x2.clone(), Value::Int(2))], |rt| {
            assert_eq!(rt.deref(&x3).unwrap(), Value::Int(2));
            Ok(())
        })?;
        assert_eq!(rt.deref(&x2).unwrap(), Value::Int(1));
        Ok(())
    })
    .unwrap();
    assert_eq!(rt.deref(&x).unwrap(), Value::Int(0));
}

#[test]
fn protocol_no_override_error() {
    let mut rt = Runtime::new();
    let (_proto, methods) = rt.defprotocol("user", "P", &["m"]);
    let m = methods.get("m").unwrap().clone();

    let a = rt.register_type("user.A");
    let b = rt.register_type("user.B");
    m.extend(a.clone(), native("m-for-a", |_, _| Ok(Value::str("from a"))));

    let on_a = Value::opaque(a, ());
    let on_b = Value::opaque(b, ());
    let m_val = Value::Polymorphic(m);

    assert_eq!(rt.invoke(&m_val, &[on_a]).unwrap(), Value::str("from a"));

    let err = rt.invoke(&m_val, &[on_b]).unwrap_err();
    match err.kind() {
        ErrorKind::NoOverride {
            method,
            protocol,
            type_name,
        } => {
            assert_eq!(method, "m");
            assert_eq!(protocol, "P");
            assert_eq!(type_name, "user.B");
        }
        other => panic!("expected no-override, got {:?}", other),
    }
    // The failed dispatch is also on the trace.
    assert!(err.trace().iter().any(|e| matches!(
        e,
        TraceEntry::Polymorphic { method, type_name } if method == "m" && type_name == "user.B"
    )));
}

// ---------------------------------------------------------------------------
// Universal properties
// ---------------------------------------------------------------------------

#[test]
fn intern_is_idempotent_across_calls() {
    let rt = Runtime::new();
    let a = rt.intern_var("some.ns", "x");
    let b = rt.intern_var("some.ns", "x");
    assert!(Rc::ptr_eq(&a, &b));
}

#[test]
fn set_root_then_deref() {
    let rt = Runtime::new();
    let v = rt.intern_var("user", "y");
    v.set_root(Value::Int(99));
    assert_eq!(rt.deref(&v).unwrap(), Value::Int(99));
}

#[test]
fn variadic_inner_always_sees_required_plus_one() {
    let mut rt = Runtime::new();
    // Echo the whole argument vector back as an array.
    let inner = native("echo", |_, args| Ok(Value::array(args.to_vec())));
    let w = Value::Variadic(Rc::new(VariadicCode::new(inner, 2)));

    let got = rt
        .invoke(
            &w,
            &[Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)],
        )
        .unwrap();
    assert_eq!(
        got,
        Value::array(vec![
            Value::Int(1),
            Value::Int(2),
            Value::array(vec![Value::Int(3), Value::Int(4)]),
        ])
    );

    // Exactly the required arity: rest array present and empty.
    let got = rt.invoke(&w, &[Value::Int(1), Value::Int(2)]).unwrap();
    assert_eq!(
        got,
        Value::array(vec![Value::Int(1), Value::Int(2), Value::array(vec![])])
    );
}

#[test]
fn variadic_required_zero_packs_everything() {
    let mut rt = Runtime::new();
    let inner = native("echo", |_, args| Ok(Value::array(args.to_vec())));
    let w = Value::Variadic(Rc::new(VariadicCode::new(inner, 0)));
    let got = rt.invoke(&w, &[Value::Int(1), Value::Int(2)]).unwrap();
    assert_eq!(
        got,
        Value::array(vec![Value::array(vec![Value::Int(1), Value::Int(2)])])
    );
}

/// Build `(fn countdown [n] (if (= n 0) "done" (recur (+ n -1))))` with
/// the recursive call compiled as a tail call through PUSH_SELF.
fn countdown_tail() -> Value {
    let mut b = Code::builder("countdown");
    let k0 = b.constant(Value::Int(0));
    let km1 = b.constant(Value::Int(-1));
    let kdone = b.constant(Value::str("done"));
    b.emit(Op::Arg, &[0]); // 0
    b.emit(Op::LoadConst, &[k0]); // 2
    b.emit(Op::Eq, &[]); // 4
    b.emit(Op::CondBr, &[3]); // 5: not zero -> 10
    b.emit(Op::LoadConst, &[kdone]); // 7
    b.emit(Op::Return, &[]); // 9
    b.emit(Op::PushSelf, &[]); // 10
    b.emit(Op::Arg, &[0]); // 11
    b.emit(Op::LoadConst, &[km1]); // 13
    b.emit(Op::Add, &[]); // 15
    b.emit(Op::TailCall, &[1]); // 16
    Value::Code(Rc::new(b.stack_size(3).build()))
}

#[test]
fn tail_call_runs_deep_recursion_in_bounded_stack() {
    let mut rt = Runtime::new();
    let f = countdown_tail();
    let result = rt.invoke(&f, &[Value::Int(1_000_000)]).unwrap();
    assert_eq!(result, Value::str("done"));
}

#[test]
fn tail_call_through_a_var_still_reuses_the_frame() {
    let mut rt = Runtime::new();

    let var = rt.intern_var("user", "loop-fn");
    let mut b = Code::builder("loop-fn");
    let k0 = b.constant(Value::Int(0));
    let km1 = b.constant(Value::Int(-1));
    let kdone = b.constant(Value::str("done"));
    let kvar = b.constant(Value::Var(var.clone()));
    b.emit(Op::Arg, &[0]); // 0
    b.emit(Op::LoadConst, &[k0]); // 2
    b.emit(Op::Eq, &[]); // 4
    b.emit(Op::CondBr, &[3]); // 5: not zero -> 10
    b.emit(Op::LoadConst, &[kdone]); // 7
    b.emit(Op::Return, &[]); // 9
    b.emit(Op::DerefVar, &[kvar]); // 10
    b.emit(Op::Arg, &[0]); // 12
    b.emit(Op::LoadConst, &[km1]); // 14
    b.emit(Op::Add, &[]); // 16
    b.emit(Op::TailCall, &[1]); // 17
    let f = code_value(&mut b, 3);
    var.set_root(f.clone());

    let result = rt.invoke(&f, &[Value::Int(500_000)]).unwrap();
    assert_eq!(result, Value::str("done"));
}

#[test]
fn recur_restarts_the_frame() {
    let mut rt = Runtime::new();
    let mut b = Code::builder("count-down");
    let k0 = b.constant(Value::Int(0));
    let km1 = b.constant(Value::Int(-1));
    let kdone = b.constant(Value::str("done"));
    b.emit(Op::Arg, &[0]); // 0
    b.emit(Op::LoadConst, &[k0]); // 2
    b.emit(Op::Eq, &[]); // 4
    b.emit(Op::CondBr, &[3]); // 5: not zero -> 10
    b.emit(Op::LoadConst, &[kdone]); // 7
    b.emit(Op::Return, &[]); // 9
    b.emit(Op::Arg, &[0]); // 10
    b.emit(Op::LoadConst, &[km1]); // 12
    b.emit(Op::Add, &[]); // 14
    b.emit(Op::Recur, &[1]); // 15
    let f = code_value(&mut b, 2);
    // Counting down from one million to zero reuses a single frame.
    let result = rt.invoke(&f, &[Value::Int(1_000_000)]).unwrap();
    assert_eq!(result, Value::str("done"));
}

#[test]
fn loop_recur_jumps_to_the_recorded_entry() {
    let mut rt = Runtime::new();
    let mut b = Code::builder("count-to-ten");
    let k0 = b.constant(Value::Int(0));
    let k10 = b.constant(Value::Int(10));
    let k1 = b.constant(Value::Int(1));
    b.emit(Op::LoadConst, &[k0]); // 0: loop local i = 0
    let entry = b.here(); // 2
    b.emit(Op::DupNth, &[0]); // 2: [i i]
    b.emit(Op::LoadConst, &[k10]); // 4: [i i 10]
    b.emit(Op::Eq, &[]); // 6: [i (= i 10)]
    b.emit(Op::CondBr, &[1]); // 7: not yet -> 10
    b.emit(Op::Return, &[]); // 9: return i
    b.emit(Op::DupNth, &[0]); // 10: [i i]
    b.emit(Op::LoadConst, &[k1]); // 12: [i i 1]
    b.emit(Op::Add, &[]); // 14: [i (+ i 1)]
    b.emit(Op::LoopRecur, &[1, 0, entry as u32]); // 15
    let f = code_value(&mut b, 3);
    assert_eq!(rt.invoke(&f, &[]).unwrap(), Value::Int(10));
}

#[test]
fn polymorphic_extension_is_per_type() {
    let mut rt = Runtime::new();
    let (_proto, methods) = rt.defprotocol("user", "IShow", &["show"]);
    let show = methods.get("show").unwrap().clone();

    let t = rt.register_type("user.T");
    let u = rt.register_type("user.U");
    show.extend(t.clone(), native("show-t", |_, _| Ok(Value::str("t"))));

    let show_val = Value::Polymorphic(show.clone());
    let on_t = Value::opaque(t.clone(), ());
    assert_eq!(rt.invoke(&show_val, &[on_t.clone()]).unwrap(), Value::str("t"));

    // Extending another type leaves T's binding alone.
    show.extend(u, native("show-u", |_, _| Ok(Value::str("u"))));
    assert_eq!(rt.invoke(&show_val, &[on_t]).unwrap(), Value::str("t"));
}

// ---------------------------------------------------------------------------
// Opcode-level assembly of the callable adapters
// ---------------------------------------------------------------------------

#[test]
fn make_multi_arity_opcode_assembles_the_table() {
    let mut rt = Runtime::new();
    let f0 = native("f0", |_, _| Ok(Value::str("zero")));
    let f2 = native("f2", |_, _| Ok(Value::str("two")));

    let mut b = Code::builder("make-multi");
    let ka0 = b.constant(Value::Int(0));
    let kf0 = b.constant(f0);
    let ka2 = b.constant(Value::Int(2));
    let kf2 = b.constant(f2);
    let knil = b.constant(Value::Nil);
    let kcount = b.constant(Value::Int(2));
    b.emit(Op::LoadConst, &[ka0]);
    b.emit(Op::LoadConst, &[kf0]);
    b.emit(Op::LoadConst, &[ka2]);
    b.emit(Op::LoadConst, &[kf2]);
    b.emit(Op::LoadConst, &[knil]);
    b.emit(Op::LoadConst, &[kcount]);
    b.emit(Op::MakeMultiArity, &[0]);
    b.emit(Op::Return, &[]);
    let maker = code_value(&mut b, 6);

    let m = rt.invoke(&maker, &[]).unwrap();
    assert!(matches!(m, Value::MultiArity(_)));
    assert_eq!(rt.invoke(&m, &[]).unwrap(), Value::str("zero"));
    assert_eq!(
        rt.invoke(&m, &[Value::Nil, Value::Nil]).unwrap(),
        Value::str("two")
    );
    assert!(rt.invoke(&m, &[Value::Nil]).is_err());
}

#[test]
fn make_multi_arity_opcode_with_rest() {
    let mut rt = Runtime::new();
    let rest = native("rest", |_, args| Ok(Value::Int(args.len() as i64)));

    let mut b = Code::builder("make-multi-rest");
    let krest = b.constant(rest);
    let kcount = b.constant(Value::Int(0));
    b.emit(Op::LoadConst, &[krest]);
    b.emit(Op::LoadConst, &[kcount]);
    b.emit(Op::MakeMultiArity, &[2]);
    b.emit(Op::Return, &[]);
    let maker = code_value(&mut b, 2);

    let m = rt.invoke(&maker, &[]).unwrap();
    // Below the required arity of the rest fn: rejected.
    assert!(rt.invoke(&m, &[Value::Nil]).is_err());
    // At or above: routed to the rest fn.
    assert_eq!(
        rt.invoke(&m, &[Value::Nil, Value::Nil, Value::Nil]).unwrap(),
        Value::Int(3)
    );
}

#[test]
fn make_variadic_opcode_wraps_the_top_callable() {
    let mut rt = Runtime::new();
    let inner = native("echo", |_, args| Ok(Value::array(args.to_vec())));

    let mut b = Code::builder("make-variadic");
    let kinner = b.constant(inner);
    b.emit(Op::LoadConst, &[kinner]);
    b.emit(Op::MakeVariadic, &[1]);
    b.emit(Op::Return, &[]);
    let maker = code_value(&mut b, 1);

    let w = rt.invoke(&maker, &[]).unwrap();
    let got = rt
        .invoke(&w, &[Value::Int(10), Value::Int(20), Value::Int(30)])
        .unwrap();
    assert_eq!(
        got,
        Value::array(vec![
            Value::Int(10),
            Value::array(vec![Value::Int(20), Value::Int(30)]),
        ])
    );
}

#[test]
fn install_opcode_extends_a_polymorphic_fn() {
    let mut rt = Runtime::new();
    let (_proto, methods) = rt.defprotocol("user", "IArea", &["area"]);
    let area = methods.get("area").unwrap().clone();
    let circle = rt.register_type("user.Circle");

    let mut b = Code::builder("install-area");
    let kpfn = b.constant(Value::Polymorphic(area));
    let ktp = b.constant(Value::Type(circle.clone()));
    let kimpl = b.constant(native("circle-area", |_, _| Ok(Value::Int(314))));
    let knil = b.constant(Value::Nil);
    b.emit(Op::LoadConst, &[kpfn]);
    b.emit(Op::LoadConst, &[ktp]);
    b.emit(Op::LoadConst, &[kimpl]);
    b.emit(Op::Install, &[]);
    b.emit(Op::LoadConst, &[knil]);
    b.emit(Op::Return, &[]);
    let installer = code_value(&mut b, 3);
    rt.invoke(&installer, &[]).unwrap();

    let area_var = rt.get_var_if_defined("user", "area").unwrap();
    let result = rt
        .invoke(&Value::Var(area_var), &[Value::opaque(circle, ())])
        .unwrap();
    assert_eq!(result, Value::Int(314));
}

#[test]
fn set_var_and_deref_var_opcodes() {
    let mut rt = Runtime::new();
    let var = rt.intern_var("user", "cell");

    let mut b = Code::builder("set-then-deref");
    let kvar = b.constant(Value::Var(var.clone()));
    let k5 = b.constant(Value::Int(5));
    b.emit(Op::LoadConst, &[k5]);
    b.emit(Op::SetVar, &[kvar]);
    b.emit(Op::Pop, &[]);
    b.emit(Op::DerefVar, &[kvar]);
    b.emit(Op::Return, &[]);
    let f = code_value(&mut b, 1);

    assert_eq!(rt.invoke(&f, &[]).unwrap(), Value::Int(5));
    assert_eq!(var.root(), Value::Int(5));
}

#[test]
fn invoke_opcode_calls_through_the_stack() {
    let mut rt = Runtime::new();
    let double = native("double", |_, args| match &args[0] {
        Value::Int(i) => Ok(Value::Int(i * 2)),
        _ => Ok(Value::Nil),
    });

    let mut b = Code::builder("call-double");
    let kf = b.constant(double);
    let k21 = b.constant(Value::Int(21));
    b.emit(Op::LoadConst, &[kf]);
    b.emit(Op::LoadConst, &[k21]);
    b.emit(Op::Invoke, &[1]);
    b.emit(Op::Return, &[]);
    let f = code_value(&mut b, 2);
    assert_eq!(rt.invoke(&f, &[]).unwrap(), Value::Int(42));
}

// ---------------------------------------------------------------------------
// Arithmetic and equality dispatch
// ---------------------------------------------------------------------------

#[test]
fn add_promotes_int_float_combinations() {
    let mut rt = Runtime::new();
    let mut b = Code::builder("mixed-add");
    let ki = b.constant(Value::Int(2));
    let kf = b.constant(Value::Float(0.5));
    b.emit(Op::LoadConst, &[ki]);
    b.emit(Op::LoadConst, &[kf]);
    b.emit(Op::Add, &[]);
    b.emit(Op::Return, &[]);
    let f = code_value(&mut b, 2);
    assert_eq!(rt.invoke(&f, &[]).unwrap(), Value::Float(2.5));
}

#[test]
fn add_rejects_non_numbers() {
    let mut rt = Runtime::new();
    let mut b = Code::builder("bad-add");
    let ks = b.constant(Value::str("not a number"));
    let ki = b.constant(Value::Int(1));
    b.emit(Op::LoadConst, &[ks]);
    b.emit(Op::LoadConst, &[ki]);
    b.emit(Op::Add, &[]);
    b.emit(Op::Return, &[]);
    let f = code_value(&mut b, 2);
    let err = rt.invoke(&f, &[]).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::NoOverride { .. }));
}

#[test]
fn eq_opcode_is_structural() {
    let mut rt = Runtime::new();
    let cases = [
        (Value::Int(3), Value::Int(3), true),
        (Value::Int(3), Value::Int(4), false),
        (Value::str("a"), Value::str("a"), true),
        (Value::Nil, Value::Nil, true),
        (Value::Nil, Value::Bool(false), false),
        (
            Value::array(vec![Value::Int(1)]),
            Value::array(vec![Value::Int(1)]),
            true,
        ),
    ];
    for (a, b_val, want) in cases {
        let mut b = Code::builder("eq-case");
        let ka = b.constant(a);
        let kb = b.constant(b_val);
        b.emit(Op::LoadConst, &[ka]);
        b.emit(Op::LoadConst, &[kb]);
        b.emit(Op::Eq, &[]);
        b.emit(Op::Return, &[]);
        let f = code_value(&mut b, 2);
        assert_eq!(rt.invoke(&f, &[]).unwrap(), Value::Bool(want));
    }
}

// ---------------------------------------------------------------------------
// Error traces
// ---------------------------------------------------------------------------

#[test]
fn trace_accumulates_innermost_first() {
    let mut rt = Runtime::new();
    let broken = rt.intern_var("user", "broken"); // never defined

    let mut b = Code::builder("inner");
    let kvar = b.constant(Value::Var(broken));
    b.debug_point(SourcePos::new(3, 4));
    b.emit(Op::DerefVar, &[kvar]);
    b.emit(Op::Return, &[]);
    let inner = code_value(&mut b, 1);

    let mut b = Code::builder("outer");
    let kinner = b.constant(inner);
    b.emit(Op::LoadConst, &[kinner]);
    b.emit(Op::Invoke, &[0]);
    b.emit(Op::Return, &[]);
    let outer = code_value(&mut b, 1);

    let err = rt.invoke(&outer, &[]).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::UndefinedVar { name, .. } if name == "broken"));
    assert_eq!(
        err.trace()[0],
        TraceEntry::Code {
            name: "inner".to_string(),
            pos: Some(SourcePos::new(3, 4)),
        }
    );
    assert_eq!(
        err.trace()[1],
        TraceEntry::Code {
            name: "outer".to_string(),
            pos: None,
        }
    );
}

#[test]
fn native_failures_name_the_native_fn() {
    let mut rt = Runtime::new();
    let blow_up = native("blow-up", |_, _| {
        Err(ErrorKind::Host("kaboom".to_string()).into())
    });
    let err = rt.invoke(&blow_up, &[]).unwrap_err();
    assert_eq!(
        err.trace()[0],
        TraceEntry::Native {
            name: "blow-up".to_string(),
        }
    );
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[test]
fn instruction_limit_stops_runaway_loops() {
    let mut rt = Runtime::new();
    rt.limit(Limits {
        max_instructions: Some(10_000),
        max_call_depth: None,
    });

    let mut b = Code::builder("spin");
    b.emit(Op::Jmp, &[(-2i32) as u32]); // jump back to itself
    let f = code_value(&mut b, 0);
    let err = rt.invoke(&f, &[]).unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::InstructionLimitExceeded(10_000)
    ));
}

#[test]
fn depth_limit_stops_non_tail_recursion() {
    let mut rt = Runtime::new();
    rt.limit(Limits {
        max_instructions: None,
        max_call_depth: Some(64),
    });

    // A function that calls itself in non-tail position.
    let mut b = Code::builder("diver");
    b.emit(Op::PushSelf, &[]);
    b.emit(Op::Invoke, &[0]);
    b.emit(Op::Return, &[]);
    let f = code_value(&mut b, 1);
    let err = rt.invoke(&f, &[]).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::DepthLimitExceeded(64)));
}
