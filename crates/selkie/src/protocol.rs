//! Protocols and polymorphic dispatch tables.
//!
//! A [`Protocol`] names a capability: a set of method slots plus the set
//! of types known to implement at least one of them. The callables are
//! the [`PolymorphicFn`] (dispatch on the first argument's type) and
//! [`DoublePolymorphicFn`] (dispatch on the first two). Neither default
//! nor override tables are ever copied: extension mutates in place and
//! bumps the revision counters that dispatch caches guard on.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::value::{Type, Value};

/// A named capability: method slots plus the types satisfying them.
pub struct Protocol {
    name: String,
    methods: RefCell<Vec<String>>,
    satisfies: RefCell<HashSet<Type>>,
    rev: Cell<u64>,
}

impl Protocol {
    pub fn new(name: &str) -> Rc<Protocol> {
        Rc::new(Protocol {
            name: name.to_string(),
            methods: RefCell::new(Vec::new()),
            satisfies: RefCell::new(HashSet::new()),
            rev: Cell::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The method names declared against this protocol, in declaration
    /// order.
    pub fn methods(&self) -> Vec<String> {
        self.methods.borrow().clone()
    }

    fn add_method(&self, name: &str) {
        self.methods.borrow_mut().push(name.to_string());
    }

    /// Record that `tp` satisfies this protocol. Bumps the revision.
    pub fn add_satisfies(&self, tp: Type) {
        self.satisfies.borrow_mut().insert(tp);
        self.rev.set(self.rev.get() + 1);
    }

    /// Whether any method of this protocol has been extended to `tp`.
    pub fn satisfies(&self, tp: &Type) -> bool {
        self.satisfies.borrow().contains(tp)
    }

    pub fn rev(&self) -> u64 {
        self.rev.get()
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol").field("name", &self.name).finish()
    }
}

/// A callable dispatching on the type of its first argument.
///
/// Without an override for the dispatched type the default callable
/// runs; without a default the call fails with a no-override error
/// naming the method, protocol, and type.
pub struct PolymorphicFn {
    name: String,
    protocol: Rc<Protocol>,
    overrides: RefCell<HashMap<Type, Value>>,
    default_fn: RefCell<Option<Value>>,
    rev: Cell<u64>,
    macro_flag: Cell<bool>,
}

impl PolymorphicFn {
    /// Create a method slot against `protocol`, registering its name
    /// with the protocol.
    pub fn new(name: &str, protocol: &Rc<Protocol>) -> Rc<PolymorphicFn> {
        protocol.add_method(name);
        Rc::new(PolymorphicFn {
            name: name.to_string(),
            protocol: protocol.clone(),
            overrides: RefCell::new(HashMap::new()),
            default_fn: RefCell::new(None),
            rev: Cell::new(0),
            macro_flag: Cell::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> &Rc<Protocol> {
        &self.protocol
    }

    /// Install `f` as the implementation for `tp`. Bumps this fn's and
    /// the protocol's revisions and records the type as satisfying the
    /// protocol.
    pub fn extend(&self, tp: Type, f: Value) {
        self.overrides.borrow_mut().insert(tp.clone(), f);
        self.rev.set(self.rev.get() + 1);
        self.protocol.add_satisfies(tp);
    }

    /// Replace the failing default with a host-supplied callable.
    pub fn set_default_fn(&self, f: Value) {
        *self.default_fn.borrow_mut() = Some(f);
        self.rev.set(self.rev.get() + 1);
    }

    /// The callable that would run for `tp`: the override if present,
    /// else the default if set.
    pub(crate) fn lookup(&self, tp: &Type) -> Option<Value> {
        if let Some(f) = self.overrides.borrow().get(tp) {
            return Some(f.clone());
        }
        self.default_fn.borrow().clone()
    }

    pub fn rev(&self) -> u64 {
        self.rev.get()
    }

    pub fn is_macro(&self) -> bool {
        self.macro_flag.get()
    }

    pub fn set_macro(&self) {
        self.macro_flag.set(true);
    }
}

impl std::fmt::Debug for PolymorphicFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolymorphicFn")
            .field("name", &self.name)
            .field("protocol", &self.protocol.name())
            .finish()
    }
}

/// A callable dispatching on the types of its first two arguments
/// through a two-level table.
pub struct DoublePolymorphicFn {
    name: String,
    protocol: Rc<Protocol>,
    overrides: RefCell<HashMap<Type, HashMap<Type, Value>>>,
    default_fn: RefCell<Option<Value>>,
    rev: Cell<u64>,
    macro_flag: Cell<bool>,
}

impl DoublePolymorphicFn {
    pub fn new(name: &str, protocol: &Rc<Protocol>) -> Rc<DoublePolymorphicFn> {
        protocol.add_method(name);
        Rc::new(DoublePolymorphicFn {
            name: name.to_string(),
            protocol: protocol.clone(),
            overrides: RefCell::new(HashMap::new()),
            default_fn: RefCell::new(None),
            rev: Cell::new(0),
            macro_flag: Cell::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> &Rc<Protocol> {
        &self.protocol
    }

    /// Install `f` for the ordered pair `(tp1, tp2)`.
    pub fn extend2(&self, tp1: Type, tp2: Type, f: Value) {
        self.overrides
            .borrow_mut()
            .entry(tp1.clone())
            .or_default()
            .insert(tp2, f);
        self.rev.set(self.rev.get() + 1);
        self.protocol.add_satisfies(tp1);
    }

    pub fn set_default_fn(&self, f: Value) {
        *self.default_fn.borrow_mut() = Some(f);
        self.rev.set(self.rev.get() + 1);
    }

    /// The callable for `(tp1, tp2)`: the pair override if both tiers
    /// match, else the default if set.
    pub(crate) fn lookup(&self, tp1: &Type, tp2: &Type) -> Option<Value> {
        if let Some(inner) = self.overrides.borrow().get(tp1)
            && let Some(f) = inner.get(tp2)
        {
            return Some(f.clone());
        }
        self.default_fn.borrow().clone()
    }

    pub fn rev(&self) -> u64 {
        self.rev.get()
    }

    pub fn is_macro(&self) -> bool {
        self.macro_flag.get()
    }

    pub fn set_macro(&self) {
        self.macro_flag.set(true);
    }
}

impl std::fmt::Debug for DoublePolymorphicFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoublePolymorphicFn")
            .field("name", &self.name)
            .field("protocol", &self.protocol.name())
            .finish()
    }
}
