//! Selkie — execution core for a small Lisp dialect
//!
//! Selkie is the runtime half of a Lisp: a stack-based bytecode
//! interpreter, a callable hierarchy (interpreted code, closures, native
//! functions, variadic and multi-arity adapters), namespaces with
//! mutable vars and thread-local-style dynamic bindings, and protocol
//! dispatch on one or two argument types. The reader and compiler are
//! external collaborators: they hand the runtime [`Code`] objects and
//! install them in vars.
//!
//! # Quick Start
//!
//! ```
//! use selkie::{Code, Op, Runtime, Value};
//!
//! let mut rt = Runtime::new();
//!
//! // What a compiler would emit for `(+ 2 3)`.
//! let mut b = Code::builder("two-plus-three");
//! let k2 = b.constant(Value::Int(2));
//! let k3 = b.constant(Value::Int(3));
//! b.emit(Op::LoadConst, &[k2]);
//! b.emit(Op::LoadConst, &[k3]);
//! b.emit(Op::Add, &[]);
//! b.emit(Op::Return, &[]);
//! let code = Value::Code(b.stack_size(2).build().into());
//!
//! assert_eq!(rt.invoke(&code, &[]).unwrap(), Value::Int(5));
//! ```
//!
//! # Architecture
//!
//! - **Values** ([`Value`], [`Type`]): tagged, `Rc`-shared runtime data.
//!   Every value answers to a first-class type handle; type equality is
//!   identity, which makes types usable as dispatch keys.
//! - **Bytecode** ([`Code`], [`Op`]): 32-bit words, one opcode word plus
//!   immediate operand words. Opcode ids are load-bearing — the external
//!   compiler emits by index.
//! - **Interpreter**: one operand stack per frame, preallocated to the
//!   code object's declared `stack_size`. `TAIL_CALL`, `RECUR`, and
//!   `LOOP_RECUR` reuse the live frame, so compiled tail recursion runs
//!   in constant stack space.
//! - **Namespaces** ([`Namespace`], [`Var`]): named registries of
//!   mutable vars plus refer links between namespaces. Dynamic vars
//!   resolve against a scoped binding stack
//!   ([`Runtime::with_bindings`]).
//! - **Protocols** ([`Protocol`], [`PolymorphicFn`],
//!   [`DoublePolymorphicFn`]): extensible dispatch tables keyed by
//!   argument types, with revision counters for downstream dispatch
//!   caches.
//! - **Runtime** ([`Runtime`]): the context object owning all of the
//!   above. No process-wide globals; embedders can hold several
//!   isolated runtimes.
//!
//! # Registering host functions
//!
//! ```
//! use selkie::{Runtime, Value};
//!
//! let mut rt = Runtime::new();
//! rt.defn("my.app", "greet", 1, |_rt, args| {
//!     Ok(Value::str(format!("hello, {}", args[0])))
//! });
//!
//! let var = rt.get_var_if_defined("my.app", "greet").unwrap();
//! let result = rt.invoke(&Value::Var(var), &[Value::str("world")]).unwrap();
//! assert_eq!(result, Value::str("hello, \"world\""));
//! ```
//!
//! # Errors
//!
//! Every failure carries an [`ErrorKind`] plus an ordered symbolic
//! trace ([`Error::trace`]) collected as the error unwinds: interpreted
//! code names with source positions, polymorphic methods with their
//! dispatched types, native-function names.
//!
//! # Coordinated operand layouts
//!
//! Two instructions carry layout agreed with the compiler rather than
//! fixed by the opcode table alone: `MAKE_MULTI_ARITY` reads its arity
//! table from the stack (pairs, rest callable or nil, pair count), and
//! `LOOP_RECUR` carries the loop-entry offset and entry stack depth as
//! extra operand words. See [`Op`] for the details.
//!
//! # Feature flags
//!
//! - `serde`: wire-form serialization of [`Code`] objects
//!   (`WireCode`), with var constants re-interned by name on load.

mod bytecode;
mod callable;
mod error;
mod namespace;
mod protocol;
mod runtime;
mod value;
mod vm;

#[cfg(feature = "serde")]
mod wire;

pub use bytecode::{Code, CodeBuilder, Op};
pub use callable::{Closure, MultiArityFn, NativeFn, NativeHandler, VariadicCode};
pub use error::{Error, ErrorKind, Result, SourcePos, TraceEntry};
pub use namespace::{Namespace, NamespaceRegistry, Refer, Var};
pub use protocol::{DoublePolymorphicFn, PolymorphicFn, Protocol};
pub use runtime::{munge, CoreTypes, Limits, Runtime, STDLIB_NS};
pub use value::{Opaque, Symbol, Type, TypeRegistry, Value};

#[cfg(feature = "serde")]
pub use wire::{WireCode, WireConst};
