//! Bytecode instruction set and compiled code objects.
//!
//! Bytecode is a flat sequence of 32-bit words. Each instruction starts
//! with an opcode word — low byte is the opcode id, high 24 bits are
//! reserved as zero — and its operands occupy the following words. The
//! numeric opcode ids are load-bearing: the compiler emits by index, so
//! the order of [`Op`] must never change.
//!
//! A [`Code`] object is immutable after construction: name, constant
//! pool, bytecode, precomputed operand-stack bound, and an optional
//! debug-point table mapping word offsets to source positions.

use std::cell::Cell;
use std::collections::BTreeMap;

use crate::error::{ErrorKind, Result, SourcePos};
use crate::value::{Symbol, Value};

/// A bytecode operation.
///
/// Stack effects are written `[before] -> [after]` with the top on the
/// right. `k`, `n`, `off` are operand words following the opcode word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Op {
    /// `LOAD_CONST k`: `[] -> [consts[k]]`.
    LoadConst = 0,
    /// `ADD`: `[a b] -> [a+b]`, dispatched through the `-add` builtin.
    Add,
    /// `EQ`: `[a b] -> [bool]`, dispatched through the `-eq` builtin.
    Eq,
    /// `INVOKE n`: `[f a1..an] -> [result]`.
    Invoke,
    /// `TAIL_CALL n`: `[f a1..an] -> returns`. Reuses the current frame
    /// when `f` is the executing code/closure; otherwise invokes `f`
    /// and returns its result.
    TailCall,
    /// `DUP_NTH k`: push a copy of the value `k` below the top.
    DupNth,
    /// `RETURN`: pop the top and unwind the frame with it.
    Return,
    /// `COND_BR off`: pop; if nil or false, jump by `off` (signed,
    /// relative to the word after the operand).
    CondBr,
    /// `JMP off`: unconditional relative jump, same base as `COND_BR`.
    Jmp,
    /// `CLOSED_OVER k`: push capture `k` of the executing closure.
    ClosedOver,
    /// `MAKE_CLOSURE k n`: pop `n` captures (first pushed becomes
    /// capture 0), close over `consts[k]` (a code object), push the
    /// closure.
    MakeClosure,
    /// `SET_VAR k`: pop a value, set it as the root of `consts[k]`
    /// (a var), push the var.
    SetVar,
    /// `POP`: discard the top.
    Pop,
    /// `DEREF_VAR k`: push the dereferenced value of `consts[k]` (a var).
    DerefVar,
    /// `INSTALL`: pop method, type, polyfn; extend the polyfn for the
    /// type. Pushes nothing.
    Install,
    /// `RECUR n`: pop `n` values, restart the current frame with them
    /// as the new argument vector.
    Recur,
    /// `LOOP_RECUR n base entry`: pop `n` values, truncate the operand
    /// stack to depth `base`, push them back, jump to word offset
    /// `entry`. The compiler records the loop-entry label in the
    /// operands; see the crate docs on coordinated operand layouts.
    LoopRecur,
    /// `ARG k`: push argument `k`.
    Arg,
    /// `PUSH_SELF`: push the currently executing callable.
    PushSelf,
    /// `POP_UP_N n`: remove the `n` values immediately below the top,
    /// keeping the top.
    PopUpN,
    /// `MAKE_MULTI_ARITY r`: assemble a multi-arity fn. Stack layout
    /// (bottom to top): `(arity, callable)` pairs, rest callable or
    /// nil, pair count. The immediate `r` is the rest callable's
    /// required arity (ignored when rest is nil).
    MakeMultiArity,
    /// `MAKE_VARIADIC n`: wrap the top callable in a variadic adapter
    /// with required arity `n`.
    MakeVariadic,
}

impl Op {
    /// Decode an opcode word. The high 24 bits must be zero.
    pub fn from_word(word: u32) -> Option<Op> {
        if word >> 8 != 0 {
            return None;
        }
        Some(match word {
            0 => Op::LoadConst,
            1 => Op::Add,
            2 => Op::Eq,
            3 => Op::Invoke,
            4 => Op::TailCall,
            5 => Op::DupNth,
            6 => Op::Return,
            7 => Op::CondBr,
            8 => Op::Jmp,
            9 => Op::ClosedOver,
            10 => Op::MakeClosure,
            11 => Op::SetVar,
            12 => Op::Pop,
            13 => Op::DerefVar,
            14 => Op::Install,
            15 => Op::Recur,
            16 => Op::LoopRecur,
            17 => Op::Arg,
            18 => Op::PushSelf,
            19 => Op::PopUpN,
            20 => Op::MakeMultiArity,
            21 => Op::MakeVariadic,
            _ => return None,
        })
    }

    /// Encode this opcode as an instruction word.
    pub fn word(self) -> u32 {
        self as u32
    }

    /// How many operand words follow the opcode word.
    pub fn operand_count(self) -> usize {
        match self {
            Op::Add
            | Op::Eq
            | Op::Return
            | Op::Pop
            | Op::Install
            | Op::PushSelf => 0,
            Op::LoadConst
            | Op::Invoke
            | Op::TailCall
            | Op::DupNth
            | Op::CondBr
            | Op::Jmp
            | Op::ClosedOver
            | Op::SetVar
            | Op::DerefVar
            | Op::Recur
            | Op::Arg
            | Op::PopUpN
            | Op::MakeMultiArity
            | Op::MakeVariadic => 1,
            Op::MakeClosure => 2,
            Op::LoopRecur => 3,
        }
    }
}

/// An immutable compiled code unit.
///
/// Produced by the external compiler (or [`CodeBuilder`] in tests),
/// installed as the root of a var, and executed by the interpreter.
pub struct Code {
    name: Symbol,
    consts: Vec<Value>,
    bytecode: Vec<u32>,
    stack_size: usize,
    debug_points: BTreeMap<usize, SourcePos>,
    macro_flag: Cell<bool>,
}

impl Code {
    /// Construct a code object from the five wire-contract fields.
    pub fn new(
        name: Symbol,
        consts: Vec<Value>,
        bytecode: Vec<u32>,
        stack_size: usize,
        debug_points: BTreeMap<usize, SourcePos>,
    ) -> Code {
        Code {
            name,
            consts,
            bytecode,
            stack_size,
            debug_points,
            macro_flag: Cell::new(false),
        }
    }

    pub fn builder(name: &str) -> CodeBuilder {
        CodeBuilder::new(name)
    }

    pub fn name(&self) -> &Symbol {
        &self.name
    }

    pub fn consts(&self) -> &[Value] {
        &self.consts
    }

    pub fn bytecode(&self) -> &[u32] {
        &self.bytecode
    }

    /// Upper bound on the operand-stack depth of any execution of this
    /// code. The interpreter preallocates to this depth.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn debug_points(&self) -> &BTreeMap<usize, SourcePos> {
        &self.debug_points
    }

    /// The source position bracketing the given word offset: the entry
    /// at the greatest offset not past `ip`, if any.
    pub fn debug_point(&self, ip: usize) -> Option<SourcePos> {
        self.debug_points
            .range(..=ip)
            .next_back()
            .map(|(_, pos)| *pos)
    }

    pub fn is_macro(&self) -> bool {
        self.macro_flag.get()
    }

    pub fn set_macro(&self) {
        self.macro_flag.set(true);
    }

    /// Checked constant-pool access; out-of-range indices are compiler
    /// bugs and surface as invariant violations.
    pub(crate) fn const_at(&self, k: u32) -> Result<&Value> {
        self.consts.get(k as usize).ok_or_else(|| {
            ErrorKind::Invariant(format!(
                "const index {} out of range in {} (pool size {})",
                k,
                self.name,
                self.consts.len()
            ))
            .into()
        })
    }
}

impl std::fmt::Debug for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Code")
            .field("name", &self.name)
            .field("consts", &self.consts.len())
            .field("words", &self.bytecode.len())
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

/// Incremental assembler for [`Code`] objects.
///
/// This is the factory half of the compiler interface: a compiler (or a
/// test) appends constants and instructions, then `build()`s the
/// immutable code object.
///
/// # Example
///
/// ```
/// use selkie::{Code, Op, Value};
///
/// let mut b = Code::builder("the-answer");
/// let k = b.constant(Value::Int(42));
/// b.emit(Op::LoadConst, &[k]);
/// b.emit(Op::Return, &[]);
/// let code = b.stack_size(1).build();
/// assert_eq!(code.bytecode(), &[0, 0, 6]);
/// ```
pub struct CodeBuilder {
    name: Symbol,
    consts: Vec<Value>,
    words: Vec<u32>,
    stack_size: usize,
    debug_points: BTreeMap<usize, SourcePos>,
}

impl CodeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: Symbol::parse(name),
            consts: Vec::new(),
            words: Vec::new(),
            stack_size: 0,
            debug_points: BTreeMap::new(),
        }
    }

    /// Append a constant and return its pool index.
    pub fn constant(&mut self, v: Value) -> u32 {
        self.consts.push(v);
        (self.consts.len() - 1) as u32
    }

    /// Append an instruction with its operand words.
    pub fn emit(&mut self, op: Op, operands: &[u32]) -> &mut Self {
        debug_assert_eq!(operands.len(), op.operand_count());
        self.words.push(op.word());
        self.words.extend_from_slice(operands);
        self
    }

    /// The offset the next emitted instruction will land on. Used for
    /// computing branch targets.
    pub fn here(&self) -> usize {
        self.words.len()
    }

    /// Record a source position for the next emitted instruction.
    pub fn debug_point(&mut self, pos: SourcePos) -> &mut Self {
        self.debug_points.insert(self.words.len(), pos);
        self
    }

    pub fn stack_size(&mut self, n: usize) -> &mut Self {
        self.stack_size = n;
        self
    }

    pub fn build(&mut self) -> Code {
        Code::new(
            std::mem::replace(&mut self.name, Symbol::simple("")),
            std::mem::take(&mut self.consts),
            std::mem::take(&mut self.words),
            self.stack_size,
            std::mem::take(&mut self.debug_points),
        )
    }
}
