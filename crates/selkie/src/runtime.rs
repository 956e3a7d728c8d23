//! The runtime context: type registry, namespaces, dynamic bindings,
//! callable dispatch, and the host registration glue.
//!
//! Everything the original design kept in process-wide globals lives on
//! a [`Runtime`] value instead, so embedders can hold several isolated
//! runtimes side by side. A `Runtime` is single-threaded: one evaluation
//! at a time, re-entrant through native callables.

use std::collections::HashMap;
use std::rc::Rc;

use crate::callable::NativeFn;
use crate::error::{ErrorKind, Result};
use crate::namespace::{DynamicVars, Namespace, NamespaceRegistry, Var};
use crate::protocol::{DoublePolymorphicFn, PolymorphicFn, Protocol};
use crate::value::{Symbol, Type, TypeRegistry, Value};
use crate::vm;

/// The namespace the standard library lives in; registration helpers
/// default to it.
pub const STDLIB_NS: &str = "selkie.stdlib";

/// Resource limits for an embedding host.
///
/// Both limits are optional — `None` means unlimited. The instruction
/// budget resets at each top-level invocation; the depth limit bounds
/// nested interpreted frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    /// Maximum decoded instructions per top-level `invoke`.
    pub max_instructions: Option<u64>,
    /// Maximum interpreted call depth.
    pub max_call_depth: Option<usize>,
}

/// Interned handles for the built-in types, created once per runtime.
pub struct CoreTypes {
    pub nil: Type,
    pub undefined: Type,
    pub bool_: Type,
    pub int: Type,
    pub float: Type,
    pub string: Type,
    pub symbol: Type,
    pub array: Type,
    pub type_: Type,
    pub code: Type,
    pub closure: Type,
    pub native_fn: Type,
    pub variadic_code: Type,
    pub multi_arity_fn: Type,
    pub polymorphic_fn: Type,
    pub double_polymorphic_fn: Type,
    pub var: Type,
    pub protocol: Type,
}

impl CoreTypes {
    fn new(types: &mut TypeRegistry) -> CoreTypes {
        CoreTypes {
            nil: types.intern("selkie.stdlib.Nil"),
            undefined: types.intern("Undefined"),
            bool_: types.intern("selkie.stdlib.Bool"),
            int: types.intern("selkie.stdlib.Int"),
            float: types.intern("selkie.stdlib.Float"),
            string: types.intern("selkie.stdlib.String"),
            symbol: types.intern("selkie.stdlib.Symbol"),
            array: types.intern("selkie.stdlib.Array"),
            type_: types.intern("selkie.stdlib.Type"),
            code: types.intern("Code"),
            closure: types.intern("Closure"),
            native_fn: types.intern("NativeFn"),
            variadic_code: types.intern("selkie.stdlib.VariadicCode"),
            multi_arity_fn: types.intern("selkie.stdlib.MultiArityFn"),
            polymorphic_fn: types.intern("PolymorphicFn"),
            double_polymorphic_fn: types.intern("DoublePolymorphicFn"),
            var: types.intern("Var"),
            protocol: types.intern("Protocol"),
        }
    }
}

/// The execution context.
///
/// Owns the namespace registry, the dynamic-binding stack, the interned
/// types, and the bootstrap arithmetic/equality dispatch functions the
/// `ADD`/`EQ` opcodes route through.
///
/// # Example
///
/// ```
/// use selkie::{Code, Op, Runtime, Value};
///
/// let mut rt = Runtime::new();
/// let mut b = Code::builder("the-answer");
/// let k = b.constant(Value::Int(42));
/// b.emit(Op::LoadConst, &[k]);
/// b.emit(Op::Return, &[]);
/// let code = Value::Code(b.stack_size(1).build().into());
///
/// assert_eq!(rt.invoke(&code, &[]).unwrap(), Value::Int(42));
/// ```
pub struct Runtime {
    types: TypeRegistry,
    core: CoreTypes,
    namespaces: NamespaceRegistry,
    dynamics: DynamicVars,
    add_fn: Value,
    eq_fn: Value,
    limits: Limits,
    instruction_count: u64,
    depth: usize,
}

impl Runtime {
    /// Create a runtime with the standard-library namespace bootstrapped:
    /// the `INum`/`IEq` protocols and their `-add`/`-eq` dispatch
    /// functions, with integer/float addition installed and structural
    /// equality as the `-eq` default.
    pub fn new() -> Runtime {
        let mut types = TypeRegistry::new();
        let core = CoreTypes::new(&mut types);
        let namespaces = NamespaceRegistry::new();
        let stdlib = namespaces.find_or_make(STDLIB_NS);

        let num_proto = Protocol::new("INum");
        let add = DoublePolymorphicFn::new("-add", &num_proto);
        install_add_overrides(&add, &core);
        stdlib
            .intern_or_make("INum")
            .set_root(Value::Protocol(num_proto));
        let add_fn = Value::DoublePolymorphic(add);
        stdlib.intern_or_make("-add").set_root(add_fn.clone());

        let eq_proto = Protocol::new("IEq");
        let eq = DoublePolymorphicFn::new("-eq", &eq_proto);
        eq.set_default_fn(Value::Native(NativeFn::with_arity("-eq", 2, |_, args| {
            Ok(Value::Bool(args[0] == args[1]))
        })));
        stdlib
            .intern_or_make("IEq")
            .set_root(Value::Protocol(eq_proto));
        let eq_fn = Value::DoublePolymorphic(eq);
        stdlib.intern_or_make("-eq").set_root(eq_fn.clone());

        Runtime {
            types,
            core,
            namespaces,
            dynamics: DynamicVars::new(),
            add_fn,
            eq_fn,
            limits: Limits::default(),
            instruction_count: 0,
            depth: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Types
    // -----------------------------------------------------------------------

    pub fn core_types(&self) -> &CoreTypes {
        &self.core
    }

    /// Intern a type for host-defined values. Idempotent by name.
    pub fn register_type(&mut self, name: &str) -> Type {
        self.types.intern(name)
    }

    pub fn get_type(&self, name: &str) -> Option<Type> {
        self.types.get(name)
    }

    /// The type handle a dispatch on `v` uses.
    pub fn type_of(&self, v: &Value) -> Type {
        match v {
            Value::Nil => self.core.nil.clone(),
            Value::Undefined => self.core.undefined.clone(),
            Value::Bool(_) => self.core.bool_.clone(),
            Value::Int(_) => self.core.int.clone(),
            Value::Float(_) => self.core.float.clone(),
            Value::Str(_) => self.core.string.clone(),
            Value::Symbol(_) => self.core.symbol.clone(),
            Value::Array(_) => self.core.array.clone(),
            Value::Type(_) => self.core.type_.clone(),
            Value::Code(_) => self.core.code.clone(),
            Value::Closure(_) => self.core.closure.clone(),
            Value::Native(_) => self.core.native_fn.clone(),
            Value::Variadic(_) => self.core.variadic_code.clone(),
            Value::MultiArity(_) => self.core.multi_arity_fn.clone(),
            Value::Polymorphic(_) => self.core.polymorphic_fn.clone(),
            Value::DoublePolymorphic(_) => self.core.double_polymorphic_fn.clone(),
            Value::Var(_) => self.core.var.clone(),
            Value::Protocol(_) => self.core.protocol.clone(),
            Value::Opaque(o) => o.type_handle().clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Namespaces and vars
    // -----------------------------------------------------------------------

    pub fn registry(&self) -> &NamespaceRegistry {
        &self.namespaces
    }

    /// The namespace named `name`, created on first use.
    pub fn namespace(&self, name: &str) -> Rc<Namespace> {
        self.namespaces.find_or_make(name)
    }

    /// Intern (or find) the var `ns/name`.
    pub fn intern_var(&self, ns: &str, name: &str) -> Rc<Var> {
        self.namespaces.find_or_make(ns).intern_or_make(name)
    }

    /// Intern a var from a symbol; a bare symbol lands in the root
    /// (empty-named) namespace.
    pub fn intern(&self, sym: &Symbol) -> Rc<Var> {
        self.intern_var(sym.ns.as_deref().unwrap_or(""), &sym.name)
    }

    /// Non-interning lookup: the var only if both the namespace and the
    /// var already exist.
    pub fn get_var_if_defined(&self, ns: &str, name: &str) -> Option<Rc<Var>> {
        self.namespaces.get(ns).and_then(|ns| ns.get(name))
    }

    /// Refer-all the standard library into `ns`.
    pub fn include_stdlib(&self, ns: &Namespace) {
        let stdlib = self.namespaces.find_or_make(STDLIB_NS);
        ns.add_refer(&stdlib, None, &[], true);
    }

    /// Dereference a var.
    ///
    /// Dynamic vars read the top binding frame and fall back to the
    /// root. Non-dynamic vars read the root, and an undefined root is
    /// an error.
    pub fn deref(&self, var: &Rc<Var>) -> Result<Value> {
        if var.is_dynamic() {
            return Ok(self.dynamics.get(var).unwrap_or_else(|| var.root()));
        }
        let root = var.root();
        if matches!(root, Value::Undefined) {
            return Err(ErrorKind::UndefinedVar {
                ns: var.ns_name().to_string(),
                name: var.name().to_string(),
            }
            .into());
        }
        Ok(root)
    }

    /// Write a dynamic var's binding in the top frame. Fails on
    /// non-dynamic vars.
    pub fn set_value(&mut self, var: &Rc<Var>, v: Value) -> Result<()> {
        if !var.is_dynamic() {
            return Err(ErrorKind::TypeAssertion {
                expected: "a dynamic var".to_string(),
                got: format!("#'{}/{}", var.ns_name(), var.name()),
            }
            .into());
        }
        self.dynamics.set(var, v);
        Ok(())
    }

    /// Run `body` under a scoped set of dynamic bindings.
    ///
    /// A fresh frame (duplicating the current top) is pushed, each pair
    /// is written into it, and the frame is popped on every exit path —
    /// including when the setup or the body fails.
    ///
    /// # Example
    ///
    /// ```
    /// use selkie::{Runtime, Value};
    ///
    /// let mut rt = Runtime::new();
    /// let v = rt.intern_var("user", "*depth*");
    /// v.set_dynamic();
    /// v.set_root(Value::Int(0));
    ///
    /// let seen = rt
    ///     .with_bindings(&[(v.clone(), Value::Int(1))], |rt| rt.deref(&v))
    ///     .unwrap();
    /// assert_eq!(seen, Value::Int(1));
    /// assert_eq!(rt.deref(&v).unwrap(), Value::Int(0));
    /// ```
    pub fn with_bindings<T>(
        &mut self,
        pairs: &[(Rc<Var>, Value)],
        body: impl FnOnce(&mut Runtime) -> Result<T>,
    ) -> Result<T> {
        self.dynamics.push_frame();
        let mut setup = Ok(());
        for (var, v) in pairs {
            setup = self.set_value(var, v.clone());
            if setup.is_err() {
                break;
            }
        }
        let result = match setup {
            Ok(()) => body(self),
            Err(e) => Err(e),
        };
        self.dynamics.pop_frame();
        result
    }

    /// Current dynamic-binding stack depth. Scoped bindings leave this
    /// unchanged across their extent; useful for embedders asserting
    /// balance.
    pub fn binding_depth(&self) -> usize {
        self.dynamics.depth()
    }

    // -----------------------------------------------------------------------
    // Callable dispatch
    // -----------------------------------------------------------------------

    /// Invoke a callable value with an argument vector.
    pub fn invoke(&mut self, f: &Value, args: &[Value]) -> Result<Value> {
        match f {
            Value::Code(_) | Value::Closure(_) => {
                self.enter_frame()?;
                let result = vm::run(self, f.clone(), args.to_vec());
                self.exit_frame();
                result
            }
            Value::Native(nf) => {
                let nf = nf.clone();
                nf.invoke(self, args)
            }
            Value::Variadic(vc) => {
                let vc = vc.clone();
                vc.invoke(self, args)
            }
            Value::MultiArity(m) => {
                let chosen = m.select(args.len())?.clone();
                self.invoke(&chosen, args)
            }
            Value::Var(var) => {
                let target = self.deref(var)?;
                self.invoke(&target, args)
            }
            Value::Polymorphic(pf) => {
                let pf = pf.clone();
                self.invoke_polymorphic(&pf, args)
            }
            Value::DoublePolymorphic(pf) => {
                let pf = pf.clone();
                self.invoke_double_polymorphic(&pf, args)
            }
            other => Err(ErrorKind::TypeAssertion {
                expected: "a callable".to_string(),
                got: other.type_name().to_string(),
            }
            .into()),
        }
    }

    fn invoke_polymorphic(&mut self, pf: &PolymorphicFn, args: &[Value]) -> Result<Value> {
        let first = args.first().ok_or_else(|| ErrorKind::ArityMismatch {
            callable: pf.name().to_string(),
            got: 0,
            expected: "at least 1".to_string(),
        })?;
        let tp = self.type_of(first);
        let result = match pf.lookup(&tp) {
            Some(f) => self.invoke(&f, args),
            None => Err(ErrorKind::NoOverride {
                method: pf.name().to_string(),
                protocol: pf.protocol().name().to_string(),
                type_name: tp.name().to_string(),
            }
            .into()),
        };
        result.map_err(|e| e.in_method(pf.name(), tp.name()))
    }

    fn invoke_double_polymorphic(
        &mut self,
        pf: &DoublePolymorphicFn,
        args: &[Value],
    ) -> Result<Value> {
        if args.len() < 2 {
            return Err(ErrorKind::ArityMismatch {
                callable: pf.name().to_string(),
                got: args.len(),
                expected: "at least 2".to_string(),
            }
            .into());
        }
        let tp1 = self.type_of(&args[0]);
        let tp2 = self.type_of(&args[1]);
        let result = match pf.lookup(&tp1, &tp2) {
            Some(f) => self.invoke(&f, args),
            None => Err(ErrorKind::NoOverride {
                method: pf.name().to_string(),
                protocol: pf.protocol().name().to_string(),
                type_name: tp1.name().to_string(),
            }
            .into()),
        };
        result.map_err(|e| e.in_method(pf.name(), tp1.name()))
    }

    /// The `-add` dispatch fn the `ADD` opcode routes through.
    pub(crate) fn add_fn(&self) -> Value {
        self.add_fn.clone()
    }

    /// The `-eq` dispatch fn the `EQ` opcode routes through.
    pub(crate) fn eq_fn(&self) -> Value {
        self.eq_fn.clone()
    }

    // -----------------------------------------------------------------------
    // Registration glue
    // -----------------------------------------------------------------------

    /// Install `v` as the root of the var `name` in the standard-library
    /// namespace.
    pub fn def(&self, name: &str, v: Value) -> Rc<Var> {
        self.def_in(STDLIB_NS, name, v)
    }

    /// Install `v` as the root of the var `ns/name`.
    pub fn def_in(&self, ns: &str, name: &str, v: Value) -> Rc<Var> {
        let var = self.intern_var(ns, name);
        var.set_root(v);
        var
    }

    /// Register a host function under `ns/name` with an exact
    /// argument-count assertion.
    pub fn defn(
        &self,
        ns: &str,
        name: &str,
        argc: usize,
        f: impl Fn(&mut Runtime, &[Value]) -> Result<Value> + 'static,
    ) -> Rc<Var> {
        self.def_in(ns, name, Value::Native(NativeFn::with_arity(name, argc, f)))
    }

    /// Register a host function under `ns/name` that takes the raw
    /// argument vector.
    pub fn defn_raw(
        &self,
        ns: &str,
        name: &str,
        f: impl Fn(&mut Runtime, &[Value]) -> Result<Value> + 'static,
    ) -> Rc<Var> {
        self.def_in(ns, name, Value::Native(NativeFn::from_raw(name, f)))
    }

    /// Declare a protocol and one polymorphic fn per method, interning
    /// vars for all of them under `ns`.
    ///
    /// The returned map is keyed by *munged* method names (see
    /// [`munge`]) for host-side identifier lookup; the runtime registry
    /// keeps the original names.
    pub fn defprotocol(
        &self,
        ns: &str,
        name: &str,
        methods: &[&str],
    ) -> (Rc<Protocol>, HashMap<String, Rc<PolymorphicFn>>) {
        let proto = Protocol::new(name);
        self.def_in(ns, name, Value::Protocol(proto.clone()));
        let mut handles = HashMap::new();
        for method in methods {
            let pfn = PolymorphicFn::new(method, &proto);
            self.def_in(ns, method, Value::Polymorphic(pfn.clone()));
            handles.insert(munge(method), pfn);
        }
        (proto, handles)
    }

    // -----------------------------------------------------------------------
    // Limits
    // -----------------------------------------------------------------------

    /// Apply resource limits to subsequent invocations.
    pub fn limit(&mut self, limits: Limits) {
        self.limits = limits;
    }

    /// Count one decoded instruction against the budget.
    pub(crate) fn tick(&mut self) -> Result<()> {
        self.instruction_count += 1;
        if let Some(limit) = self.limits.max_instructions
            && self.instruction_count > limit
        {
            return Err(ErrorKind::InstructionLimitExceeded(limit).into());
        }
        Ok(())
    }

    pub(crate) fn enter_frame(&mut self) -> Result<()> {
        if let Some(limit) = self.limits.max_call_depth
            && self.depth >= limit
        {
            return Err(ErrorKind::DepthLimitExceeded(limit).into());
        }
        if self.depth == 0 {
            self.instruction_count = 0;
        }
        self.depth += 1;
        Ok(())
    }

    pub(crate) fn exit_frame(&mut self) {
        self.depth -= 1;
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the built-in `-add` overrides for the numeric types.
fn install_add_overrides(add: &Rc<DoublePolymorphicFn>, core: &CoreTypes) {
    let int_add = Value::Native(NativeFn::with_arity("-add", 2, |_, args| {
        match (&args[0], &args[1]) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_add(*b)
                .map(Value::Int)
                .ok_or_else(|| ErrorKind::Host("integer overflow in -add".to_string()).into()),
            _ => Err(ErrorKind::TypeAssertion {
                expected: "two ints".to_string(),
                got: format!("{}, {}", args[0].type_name(), args[1].type_name()),
            }
            .into()),
        }
    }));
    let float_add = Value::Native(NativeFn::with_arity("-add", 2, |_, args| {
        let a = num_as_f64(&args[0])?;
        let b = num_as_f64(&args[1])?;
        Ok(Value::Float(a + b))
    }));

    add.extend2(core.int.clone(), core.int.clone(), int_add);
    add.extend2(core.int.clone(), core.float.clone(), float_add.clone());
    add.extend2(core.float.clone(), core.int.clone(), float_add.clone());
    add.extend2(core.float.clone(), core.float.clone(), float_add);
}

fn num_as_f64(v: &Value) -> Result<f64> {
    match v {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(x) => Ok(*x),
        other => Err(ErrorKind::TypeAssertion {
            expected: "a number".to_string(),
            got: other.type_name().to_string(),
        }
        .into()),
    }
}

/// Munge a method name into a host-side identifier: `-` → `_`,
/// `?` → `_QMARK_`, `!` → `_BANG_`.
///
/// Only host-side lookup sees munged names; the runtime registry stores
/// originals.
pub fn munge(name: &str) -> String {
    name.replace('-', "_")
        .replace('?', "_QMARK_")
        .replace('!', "_BANG_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn munge_rewrites_host_hostile_chars() {
        assert_eq!(munge("-add"), "_add");
        assert_eq!(munge("empty?"), "empty_QMARK_");
        assert_eq!(munge("reset!"), "reset_BANG_");
        assert_eq!(munge("plain"), "plain");
    }

    #[test]
    fn def_defaults_to_stdlib() {
        let rt = Runtime::new();
        let var = rt.def("answer", Value::Int(42));
        assert_eq!(var.ns_name(), STDLIB_NS);
        assert!(rt.get_var_if_defined(STDLIB_NS, "answer").is_some());
    }

    #[test]
    fn defn_asserts_arity() {
        let mut rt = Runtime::new();
        let var = rt.defn("user", "inc", 1, |_, args| match &args[0] {
            Value::Int(i) => Ok(Value::Int(i + 1)),
            other => Err(ErrorKind::TypeAssertion {
                expected: "an int".to_string(),
                got: other.type_name().to_string(),
            }
            .into()),
        });
        let f = Value::Var(var);
        assert_eq!(rt.invoke(&f, &[Value::Int(41)]).unwrap(), Value::Int(42));

        let err = rt.invoke(&f, &[]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ArityMismatch { got: 0, .. }));
    }

    #[test]
    fn defprotocol_interns_originals_and_munges_handles() {
        let rt = Runtime::new();
        let (proto, handles) = rt.defprotocol("user", "ICounted", &["count-of", "empty?"]);
        assert_eq!(proto.name(), "ICounted");

        // Registry keeps original names.
        assert!(rt.get_var_if_defined("user", "count-of").is_some());
        assert!(rt.get_var_if_defined("user", "empty?").is_some());
        assert!(rt.get_var_if_defined("user", "count_of").is_none());

        // Host handles are munged.
        assert!(handles.contains_key("count_of"));
        assert!(handles.contains_key("empty_QMARK_"));
    }

    #[test]
    fn deref_of_undefined_root_fails() {
        let rt = Runtime::new();
        let var = rt.intern_var("user", "nothing");
        let err = rt.deref(&var).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UndefinedVar { name, .. } if name == "nothing"));
    }

    #[test]
    fn dynamic_deref_falls_back_to_root_without_error() {
        let rt = Runtime::new();
        let var = rt.intern_var("user", "*mode*");
        var.set_dynamic();
        // No binding, undefined root: the sentinel comes back as-is.
        assert_eq!(rt.deref(&var).unwrap(), Value::Undefined);
    }

    #[test]
    fn set_value_requires_dynamic() {
        let mut rt = Runtime::new();
        let var = rt.intern_var("user", "x");
        var.set_root(Value::Int(1));
        assert!(rt.set_value(&var, Value::Int(2)).is_err());
    }

    #[test]
    fn bindings_pop_on_error_paths() {
        let mut rt = Runtime::new();
        let var = rt.intern_var("user", "*x*");
        var.set_dynamic();
        var.set_root(Value::Int(1));

        let before = rt.binding_depth();
        let result: Result<()> = rt.with_bindings(&[(var.clone(), Value::Int(2))], |rt| {
            assert_eq!(rt.deref(&var).unwrap(), Value::Int(2));
            Err(ErrorKind::Host("boom".to_string()).into())
        });
        assert!(result.is_err());
        assert_eq!(rt.binding_depth(), before);
        assert_eq!(rt.deref(&var).unwrap(), Value::Int(1));
    }

    #[test]
    fn invoking_a_non_callable_fails() {
        let mut rt = Runtime::new();
        let err = rt.invoke(&Value::Int(3), &[]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::TypeAssertion { .. }));
    }
}
