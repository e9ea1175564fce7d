//! Heap-allocated objects addressable through a pointer-tagged `Value`.
//!
//! The VM owns every `Function` and `Var` it creates and is responsible for
//! freeing them when torn down (see `glint-runtime`'s `objects` arena). This
//! mirrors the original's `vm_add_object`, replacing manual `malloc`/`free`
//! with `Box::into_raw`/`Box::from_raw` pairs the VM arena manages.

use crate::chunk::Chunk;
use crate::value::Value;

/// A foreign (Rust-implemented) function callable from Glint.
pub type ForeignFn = fn(args: &[Value]) -> Value;

pub enum FunctionKind {
    Script,
    Foreign,
}

/// A callable: either compiled bytecode or a foreign entry point.
pub struct Function {
    pub kind: FunctionKind,
    pub name: Value,
    pub arity: u8,
    pub chunk: Option<Chunk>,
    pub foreign: Option<ForeignFn>,
}

impl Function {
    pub fn script(name: Value, arity: u8, chunk: Chunk) -> Self {
        Function {
            kind: FunctionKind::Script,
            name,
            arity,
            chunk: Some(chunk),
            foreign: None,
        }
    }

    pub fn foreign(name: Value, arity: u8, f: ForeignFn) -> Self {
        Function {
            kind: FunctionKind::Foreign,
            name,
            arity,
            chunk: None,
            foreign: Some(f),
        }
    }

    pub fn is_foreign(&self) -> bool {
        matches!(self.kind, FunctionKind::Foreign)
    }
}

/// Describes a declared variable: its slot index (into the VM's global-value
/// table for globals, into a frame's operand-stack window for locals),
/// whether it has been assigned yet, whether reassignment is permitted
/// (`var` vs `let`), and whether that slot is global or local.
pub struct Var {
    pub index: u32,
    pub initialized: bool,
    pub mutable: bool,
    pub global: bool,
}

impl Var {
    pub fn new(index: u32, mutable: bool, global: bool) -> Self {
        Var {
            index,
            initialized: false,
            mutable,
            global,
        }
    }
}
