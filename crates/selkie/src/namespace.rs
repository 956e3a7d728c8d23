//! Namespaces, vars, referrals, and the dynamic-binding stack.
//!
//! A [`Namespace`] owns a registry of named [`Var`]s plus a refer table
//! linking aliases to other namespaces. The process-wide picture — every
//! namespace by name — lives in a [`NamespaceRegistry`] owned by the
//! runtime context, never in a global.
//!
//! Vars are mutable cells with interior mutability: a var's root may be
//! a closure that dereferences the same var, so the cell must be
//! shareable while written. The revision counter exists for dispatch
//! caches (see the crate docs); the baseline interpreter only maintains
//! it.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::error::{ErrorKind, Result};
use crate::value::{Symbol, Value};

/// A named, mutable cell living in a namespace.
///
/// Freshly interned vars hold the *undefined* sentinel until something
/// installs a root. The dynamic flag is one-way: once dynamic, always
/// dynamic.
pub struct Var {
    ns: String,
    name: String,
    root: RefCell<Value>,
    dynamic: Cell<bool>,
    rev: Cell<u64>,
    macro_flag: Cell<bool>,
}

impl Var {
    pub(crate) fn new(ns: &str, name: &str) -> Rc<Var> {
        Rc::new(Var {
            ns: ns.to_string(),
            name: name.to_string(),
            root: RefCell::new(Value::Undefined),
            dynamic: Cell::new(false),
            rev: Cell::new(0),
            macro_flag: Cell::new(false),
        })
    }

    /// The name of the owning namespace.
    pub fn ns_name(&self) -> &str {
        &self.ns
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the root value. Always allowed, bumps the revision.
    pub fn set_root(&self, v: Value) {
        self.rev.set(self.rev.get() + 1);
        *self.root.borrow_mut() = v;
    }

    /// The current root, which may be the undefined sentinel.
    pub fn root(&self) -> Value {
        self.root.borrow().clone()
    }

    /// Mark the var dynamic. One-way; bumps the revision.
    pub fn set_dynamic(&self) {
        self.dynamic.set(true);
        self.rev.set(self.rev.get() + 1);
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic.get()
    }

    /// True once a root has been installed.
    pub fn is_defined(&self) -> bool {
        !matches!(&*self.root.borrow(), Value::Undefined)
    }

    /// Monotonic revision counter, bumped on root changes and the
    /// dynamic flip.
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

impl std::fmt::Debug for Var {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#'{}/{}", self.ns, self.name)
    }
}

/// Identity key for vars in dynamic-binding frames.
#[derive(Clone)]
pub(crate) struct VarKey(pub(crate) Rc<Var>);

impl PartialEq for VarKey {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for VarKey {}

impl Hash for VarKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

/// A directional link from an alias in one namespace to another
/// namespace, optionally restricting the imported names.
pub struct Refer {
    target: Rc<Namespace>,
    syms: HashSet<String>,
    all: bool,
}

impl Refer {
    pub fn target(&self) -> &Rc<Namespace> {
        &self.target
    }

    pub fn refer_all(&self) -> bool {
        self.all
    }

    fn covers(&self, name: &str) -> bool {
        self.all || self.syms.contains(name)
    }
}

/// A named scope owning vars and refer entries.
pub struct Namespace {
    name: String,
    registry: RefCell<HashMap<String, Rc<Var>>>,
    // Insertion-ordered: unqualified refer lookups scan this list front
    // to back and the first match wins.
    refers: RefCell<Vec<(String, Refer)>>,
}

impl Namespace {
    fn new(name: &str) -> Rc<Namespace> {
        Rc::new(Namespace {
            name: name.to_string(),
            registry: RefCell::new(HashMap::new()),
            refers: RefCell::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the var named `name`, creating an undefined one on first
    /// use. Idempotent: the same var comes back on every call.
    pub fn intern_or_make(&self, name: &str) -> Rc<Var> {
        if let Some(v) = self.registry.borrow().get(name) {
            return v.clone();
        }
        let v = Var::new(&self.name, name);
        self.registry.borrow_mut().insert(name.to_string(), v.clone());
        v
    }

    /// Look up a var without interning.
    pub fn get(&self, name: &str) -> Option<Rc<Var>> {
        self.registry.borrow().get(name).cloned()
    }

    /// Add (or replace) a refer entry under `alias`, defaulting to the
    /// target's own name. Replacement keeps the original insertion
    /// position, so lookup order stays stable.
    pub fn add_refer(
        &self,
        target: &Rc<Namespace>,
        alias: Option<&str>,
        syms: &[&str],
        refer_all: bool,
    ) {
        let alias = alias.unwrap_or(target.name()).to_string();
        let refer = Refer {
            target: target.clone(),
            syms: syms.iter().map(|s| s.to_string()).collect(),
            all: refer_all,
        };
        let mut refers = self.refers.borrow_mut();
        if let Some(slot) = refers.iter_mut().find(|(a, _)| *a == alias) {
            slot.1 = refer;
        } else {
            refers.push((alias, refer));
        }
    }

    /// Resolve a symbol against this namespace.
    ///
    /// Qualified symbols resolve the namespace part through the refer
    /// table first, then the global registry. Unqualified symbols check
    /// this namespace's own registry, then (when `use_refers` is set)
    /// scan refer entries in insertion order; the first entry covering
    /// the name wins.
    pub fn resolve(
        &self,
        registry: &NamespaceRegistry,
        sym: &Symbol,
        use_refers: bool,
    ) -> Result<Option<Rc<Var>>> {
        if let Some(ns_part) = &sym.ns {
            let resolved = self
                .refers
                .borrow()
                .iter()
                .find(|(alias, _)| alias == ns_part)
                .map(|(_, refer)| refer.target.clone())
                .or_else(|| registry.get(ns_part));
            let resolved = resolved.ok_or_else(|| ErrorKind::UnresolvedNamespace {
                ns: ns_part.clone(),
                in_ns: self.name.clone(),
            })?;
            return Ok(resolved.get(&sym.name));
        }

        if let Some(v) = self.get(&sym.name) {
            return Ok(Some(v));
        }
        if use_refers {
            for (_, refer) in self.refers.borrow().iter() {
                if refer.covers(&sym.name)
                    && let Some(v) = refer.target.get(&sym.name)
                {
                    return Ok(Some(v));
                }
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace").field("name", &self.name).finish()
    }
}

/// Every namespace in the runtime, by name. Namespaces are created on
/// demand and never destroyed during a run.
pub struct NamespaceRegistry {
    namespaces: RefCell<HashMap<String, Rc<Namespace>>>,
}

impl NamespaceRegistry {
    pub(crate) fn new() -> Self {
        Self {
            namespaces: RefCell::new(HashMap::new()),
        }
    }

    pub fn find_or_make(&self, name: &str) -> Rc<Namespace> {
        if let Some(ns) = self.namespaces.borrow().get(name) {
            return ns.clone();
        }
        let ns = Namespace::new(name);
        self.namespaces
            .borrow_mut()
            .insert(name.to_string(), ns.clone());
        ns
    }

    pub fn get(&self, name: &str) -> Option<Rc<Namespace>> {
        self.namespaces.borrow().get(name).cloned()
    }
}

/// The dynamic-binding stack: a non-empty stack of frames, each mapping
/// vars (by identity) to their bound values.
///
/// `push` duplicates the top frame so inner scopes see outer bindings;
/// lookup and mutation touch only the top.
pub(crate) struct DynamicVars {
    frames: Vec<HashMap<VarKey, Value>>,
}

impl DynamicVars {
    pub(crate) fn new() -> Self {
        Self {
            frames: vec![HashMap::new()],
        }
    }

    pub(crate) fn push_frame(&mut self) {
        let top = self.frames.last().cloned().unwrap_or_default();
        self.frames.push(top);
    }

    pub(crate) fn pop_frame(&mut self) {
        self.frames.pop();
        debug_assert!(!self.frames.is_empty(), "dynamic-var stack underflow");
    }

    pub(crate) fn get(&self, var: &Rc<Var>) -> Option<Value> {
        self.frames
            .last()
            .and_then(|top| top.get(&VarKey(var.clone())).cloned())
    }

    pub(crate) fn set(&mut self, var: &Rc<Var>, v: Value) {
        if let Some(top) = self.frames.last_mut() {
            top.insert(VarKey(var.clone()), v);
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }
}
