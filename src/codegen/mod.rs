//! Kyanite middle-end: AST → K-form → C-form
//!
//! The pipeline, module by module in import order:
//! 1. K-normalize the type-checked AST (atomic operands, lowered
//!    patterns, lowered comprehensions)
//! 2. Simple lambda-lift (hoist capture-free nested definitions)
//! 3. (external K-form optimization passes plug in here)
//! 4. Name mangling and structural-type materialization
//! 5. C type/destructor/copy/constructor generation
//! 6. C-module assembly with dead-type elimination
//!
//! Each pass accumulates user diagnostics in the `Compilation`; the
//! driver stops between passes as soon as the list is non-empty.

pub mod cform;
pub mod cgen;
pub mod ctypes;
pub mod kform;
pub mod knorm;
pub mod lift;
pub mod mangle;
pub mod patmatch;

use crate::errors::CompileError;
use crate::module::ModuleGraph;
use crate::symtab::{Compilation, InfoTab};

pub use cgen::{CModule, Pragmas};

/// Run the whole middle-end over a module graph. On failure returns the
/// accumulated diagnostics (fatal internal errors appear as the last
/// entry).
pub fn compile_graph(
    comp: &mut Compilation,
    graph: &ModuleGraph,
) -> Result<Vec<CModule>, Vec<CompileError>> {
    match compile_graph_inner(comp, graph) {
        Ok(mods) => Ok(mods),
        Err(Some(fatal)) => {
            comp.push_err(fatal);
            Err(comp.take_errors())
        }
        Err(None) => Err(comp.take_errors()),
    }
}

fn compile_graph_inner(
    comp: &mut Compilation,
    graph: &ModuleGraph,
) -> Result<Vec<CModule>, Option<CompileError>> {
    let order = graph.topological_sort().map_err(Some)?;

    // K-normalization
    let mut kmods = Vec::with_capacity(order.len());
    for &mid in &order {
        let module = graph.get(mid);
        let kmod = knorm::normalize_module(comp, module).map_err(Some)?;
        kmods.push((mid, kmod));
    }
    if comp.has_errors() {
        return Err(None);
    }
    comp.freeze(InfoTab::Ast, true);

    // hoisting
    for (mid, kmod) in kmods.iter_mut() {
        let stmts = std::mem::take(&mut kmod.stmts);
        kmod.stmts = lift::lift_module(comp, graph.get(*mid).sym, stmts).map_err(Some)?;
    }
    if comp.has_errors() {
        return Err(None);
    }

    // mangling
    for (mid, kmod) in kmods.iter_mut() {
        let stmts = std::mem::take(&mut kmod.stmts);
        kmod.stmts = mangle::mangle_module(comp, graph.get(*mid).sym, stmts).map_err(Some)?;
    }
    if comp.has_errors() {
        return Err(None);
    }

    // C types and module assembly
    let mut cmods = Vec::with_capacity(kmods.len());
    for (mid, kmod) in kmods {
        let module = graph.get(mid);
        let knorm::KModule { stmts, pragmas } = kmod;
        let types = ctypes::gen_ctypes_module(comp, &stmts).map_err(Some)?;
        let cmod =
            cgen::assemble_module(comp, module, types, stmts, &pragmas).map_err(Some)?;
        cmods.push(cmod);
    }
    if comp.has_errors() {
        return Err(None);
    }
    comp.freeze(InfoTab::K, true);

    Ok(cmods)
}
