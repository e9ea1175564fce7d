//! Glint Core: value representation, string interning storage, bytecode
//! chunks, and the persistent trie backing both.
//!
//! # Modules
//!
//! - `value`: the NaN-boxed `Value` word and its tag layout
//! - `string`: heap-allocated strings addressed by `Value`'s string tag
//! - `hamt`: persistent Hash Array Mapped Trie used for interning and scopes
//! - `chunk`: compiled bytecode, its constant pool, and line tracking
//! - `function`: heap objects reachable through `Value`'s pointer tag

pub mod chunk;
pub mod function;
pub mod hamt;
pub mod string;
pub mod value;

pub use chunk::{Chunk, Opcode};
pub use function::{ForeignFn, Function, FunctionKind, Var};
pub use hamt::Hamt;
pub use string::GlintString;
pub use value::Value;
