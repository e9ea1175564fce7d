//! Glint Runtime: stack-based bytecode virtual machine and CLI.
//!
//! # Modules
//!
//! - `vm`: call-frame stack machine that compiles and executes a Glint
//!   program, and the heap object arenas (functions, strings, vars) it owns

pub mod vm;

pub use glint_compiler::{Globals, Host, Interner};
pub use vm::{GlintError, RuntimeError, Vm};
