//! Serializable wire form of code objects, for persistence and
//! cross-module loading.
//!
//! Only the five wire-contract fields travel: name, const pool,
//! bytecode, stack size, debug points. Constants referencing live
//! runtime objects serialize symbolically — a var constant becomes its
//! qualified name and is re-interned into the loading runtime — and
//! nested code objects serialize structurally. Any other callable in a
//! const pool is not portable and fails at serialization time.

use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::bytecode::Code;
use crate::error::{ErrorKind, Result, SourcePos};
use crate::runtime::Runtime;
use crate::value::{Symbol, Value};

/// A portable constant-pool entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireConst {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Printed symbol form (`name` or `ns/name`), reparsed on load.
    Symbol(String),
    Array(Vec<WireConst>),
    /// Re-interned by qualified name into the loading runtime.
    Var { ns: String, name: String },
    Code(WireCode),
}

/// The wire form of a [`Code`] object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireCode {
    pub name: String,
    pub consts: Vec<WireConst>,
    pub bytecode: Vec<u32>,
    pub stack_size: usize,
    pub debug_points: Vec<(usize, SourcePos)>,
}

impl Code {
    /// Convert to the wire form. Fails if the const pool holds a value
    /// with no portable representation (closures, native fns, dispatch
    /// tables).
    pub fn to_wire(&self) -> Result<WireCode> {
        let consts = self
            .consts()
            .iter()
            .map(const_to_wire)
            .collect::<Result<Vec<_>>>()?;
        Ok(WireCode {
            name: self.name().to_string(),
            consts,
            bytecode: self.bytecode().to_vec(),
            stack_size: self.stack_size(),
            debug_points: self
                .debug_points()
                .iter()
                .map(|(ip, pos)| (*ip, *pos))
                .collect(),
        })
    }
}

fn const_to_wire(v: &Value) -> Result<WireConst> {
    Ok(match v {
        Value::Nil => WireConst::Nil,
        Value::Bool(b) => WireConst::Bool(*b),
        Value::Int(i) => WireConst::Int(*i),
        Value::Float(x) => WireConst::Float(*x),
        Value::Str(s) => WireConst::Str(s.to_string()),
        Value::Symbol(s) => WireConst::Symbol(s.to_string()),
        Value::Array(items) => WireConst::Array(
            items
                .borrow()
                .iter()
                .map(const_to_wire)
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Var(var) => WireConst::Var {
            ns: var.ns_name().to_string(),
            name: var.name().to_string(),
        },
        Value::Code(code) => WireConst::Code(code.to_wire()?),
        other => {
            return Err(ErrorKind::TypeAssertion {
                expected: "a serializable constant".to_string(),
                got: other.type_name().to_string(),
            }
            .into());
        }
    })
}

impl Runtime {
    /// Rehydrate a wire-form code object. Var constants re-intern into
    /// this runtime's namespaces, so cross-runtime loads share vars by
    /// name, not by identity.
    pub fn load_code(&self, wire: &WireCode) -> Rc<Code> {
        let consts = wire.consts.iter().map(|c| self.load_const(c)).collect();
        let debug_points: BTreeMap<usize, SourcePos> =
            wire.debug_points.iter().copied().collect();
        Rc::new(Code::new(
            Symbol::parse(&wire.name),
            consts,
            wire.bytecode.clone(),
            wire.stack_size,
            debug_points,
        ))
    }

    fn load_const(&self, c: &WireConst) -> Value {
        match c {
            WireConst::Nil => Value::Nil,
            WireConst::Bool(b) => Value::Bool(*b),
            WireConst::Int(i) => Value::Int(*i),
            WireConst::Float(x) => Value::Float(*x),
            WireConst::Str(s) => Value::str(s),
            WireConst::Symbol(s) => Value::symbol(s),
            WireConst::Array(items) => {
                Value::array(items.iter().map(|c| self.load_const(c)).collect())
            }
            WireConst::Var { ns, name } => Value::Var(self.intern_var(ns, name)),
            WireConst::Code(wire) => Value::Code(self.load_code(wire)),
        }
    }
}
