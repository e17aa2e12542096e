//! Kyanite - middle-end of a compiler for an ML-family language
//!
//! Takes a type-checked, fully resolved AST and lowers it to C-form, a
//! statement-oriented IR ready for textual emission to C:
//! K-normalization (with pattern-matching and comprehension lowering),
//! simple lambda-lifting, name mangling with structural-type
//! materialization, and C struct/destructor/constructor generation.

pub mod ast;
pub mod codegen;
pub mod errors;
pub mod loc;
pub mod module;
pub mod symtab;
pub mod test_support;

pub use codegen::{compile_graph, CModule, Pragmas};
pub use errors::{CompileError, CResult};
pub use loc::{FileId, Loc};
pub use module::{Module, ModuleGraph, ModuleId};
pub use symtab::{Compilation, Id};
