//! The callable hierarchy around interpreted code: native functions,
//! closures, and the two arity adapters.
//!
//! Everything here is a value (see [`crate::value::Value`]); the actual
//! call dispatch lives on [`Runtime::invoke`](crate::Runtime::invoke).
//! All callables carry a macro flag set at definition time — the flag is
//! compiler metadata and never consulted at execution time.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::Code;
use crate::error::{ErrorKind, Result};
use crate::runtime::Runtime;
use crate::value::Value;

/// The host-function calling convention: an argument vector in, a value
/// (or an error) out. Host functions get the runtime so they can invoke
/// other callables or touch vars.
pub type NativeHandler = Box<dyn Fn(&mut Runtime, &[Value]) -> Result<Value>>;

/// A callable implemented by a host function.
pub struct NativeFn {
    name: String,
    handler: NativeHandler,
    macro_flag: Cell<bool>,
}

impl NativeFn {
    /// Wrap a host function that takes the raw argument vector with no
    /// arity check.
    pub fn from_raw(
        name: &str,
        f: impl Fn(&mut Runtime, &[Value]) -> Result<Value> + 'static,
    ) -> Rc<NativeFn> {
        Rc::new(NativeFn {
            name: name.to_string(),
            handler: Box::new(f),
            macro_flag: Cell::new(false),
        })
    }

    /// Wrap a host function behind an exact argument-count assertion.
    pub fn with_arity(
        name: &str,
        argc: usize,
        f: impl Fn(&mut Runtime, &[Value]) -> Result<Value> + 'static,
    ) -> Rc<NativeFn> {
        let fn_name = name.to_string();
        Rc::new(NativeFn {
            name: name.to_string(),
            handler: Box::new(move |rt, args| {
                if args.len() != argc {
                    return Err(ErrorKind::ArityMismatch {
                        callable: fn_name.clone(),
                        got: args.len(),
                        expected: argc.to_string(),
                    }
                    .into());
                }
                f(rt, args)
            }),
            macro_flag: Cell::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the host function. Failures pick up a native trace entry.
    pub(crate) fn invoke(&self, rt: &mut Runtime, args: &[Value]) -> Result<Value> {
        (self.handler)(rt, args).map_err(|e| e.in_native(&self.name))
    }

    pub fn is_macro(&self) -> bool {
        self.macro_flag.get()
    }

    pub fn set_macro(&self) {
        self.macro_flag.set(true);
    }
}

impl std::fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFn").field("name", &self.name).finish()
    }
}

/// A code object plus the values it closed over, in capture order.
#[derive(Debug)]
pub struct Closure {
    code: Rc<Code>,
    closed_overs: Vec<Value>,
    macro_flag: Cell<bool>,
}

impl Closure {
    pub fn new(code: Rc<Code>, closed_overs: Vec<Value>) -> Closure {
        Closure {
            code,
            closed_overs,
            macro_flag: Cell::new(false),
        }
    }

    pub fn code(&self) -> &Rc<Code> {
        &self.code
    }

    pub fn closed_overs(&self) -> &[Value] {
        &self.closed_overs
    }

    /// Checked capture access; `CLOSED_OVER` indices past the capture
    /// vector are compiler bugs.
    pub(crate) fn closed_over(&self, k: u32) -> Result<&Value> {
        self.closed_overs.get(k as usize).ok_or_else(|| {
            ErrorKind::Invariant(format!(
                "closed-over index {} out of range in {} ({} captures)",
                k,
                self.code.name(),
                self.closed_overs.len()
            ))
            .into()
        })
    }

    pub fn is_macro(&self) -> bool {
        self.macro_flag.get()
    }

    pub fn set_macro(&self) {
        self.macro_flag.set(true);
    }
}

/// Rest-argument adapter: delegates to the wrapped callable after
/// packing surplus arguments into a fresh array at position
/// `required_arity`.
///
/// The inner callable always receives exactly `required_arity + 1`
/// arguments, the last being the rest array (possibly empty).
#[derive(Debug)]
pub struct VariadicCode {
    inner: Value,
    required_arity: usize,
    macro_flag: Cell<bool>,
}

impl VariadicCode {
    pub fn new(inner: Value, required_arity: usize) -> VariadicCode {
        VariadicCode {
            inner,
            required_arity,
            macro_flag: Cell::new(false),
        }
    }

    pub fn inner(&self) -> &Value {
        &self.inner
    }

    pub fn required_arity(&self) -> usize {
        self.required_arity
    }

    pub(crate) fn invoke(&self, rt: &mut Runtime, args: &[Value]) -> Result<Value> {
        let r = self.required_arity;
        if r == 0 {
            return rt.invoke(&self.inner, &[Value::array(args.to_vec())]);
        }
        if args.len() < r {
            return Err(ErrorKind::ArityMismatch {
                callable: "variadic fn".to_string(),
                got: args.len(),
                expected: format!("at least {}", r),
            }
            .into());
        }
        let mut packed = args[..r].to_vec();
        packed.push(Value::array(args[r..].to_vec()));
        rt.invoke(&self.inner, &packed)
    }

    pub fn is_macro(&self) -> bool {
        self.macro_flag.get()
    }

    pub fn set_macro(&self) {
        self.macro_flag.set(true);
    }
}

/// Exact-arity dispatch table with an optional rest fallback.
///
/// Invocation picks the callable registered for the exact argument
/// count; failing that, the rest callable when the count is at least
/// `required_arity`; failing that, an arity-mismatch error naming every
/// accepted count.
#[derive(Debug)]
pub struct MultiArityFn {
    arities: HashMap<usize, Value>,
    rest_fn: Option<Value>,
    required_arity: usize,
    macro_flag: Cell<bool>,
}

impl MultiArityFn {
    pub fn new(
        arities: HashMap<usize, Value>,
        rest_fn: Option<Value>,
        required_arity: usize,
    ) -> MultiArityFn {
        MultiArityFn {
            arities,
            rest_fn,
            required_arity,
            macro_flag: Cell::new(false),
        }
    }

    pub fn required_arity(&self) -> usize {
        self.required_arity
    }

    /// Select the callable for an argument count.
    pub(crate) fn select(&self, argc: usize) -> Result<&Value> {
        if let Some(f) = self.arities.get(&argc) {
            return Ok(f);
        }
        if let Some(rest) = &self.rest_fn
            && argc >= self.required_arity
        {
            return Ok(rest);
        }

        let mut accepted: Vec<usize> = self.arities.keys().copied().collect();
        accepted.sort_unstable();
        let mut expected: Vec<String> = accepted.iter().map(|a| a.to_string()).collect();
        if self.rest_fn.is_some() {
            expected.push(format!("{}+", self.required_arity));
        }
        Err(ErrorKind::ArityMismatch {
            callable: "fn".to_string(),
            got: argc,
            expected: expected.join(", "),
        }
        .into())
    }

    pub fn is_macro(&self) -> bool {
        self.macro_flag.get()
    }

    pub fn set_macro(&self) {
        self.macro_flag.set(true);
    }
}
