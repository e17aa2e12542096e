//! C-module assembly and the code-generator contract
//!
//! Gathers one module's output: forward declarations first, then type
//! declarations, then type utility functions; the typed K-form rides along
//! for the (downstream) statement generator. Before assembly the type
//! sections go through dead-type elimination: only declarations reachable
//! from the module's code survive.
//!
//! ## Contract for the statement generator
//!
//! The consumer of a `CModule` must produce, for every function, a C body
//! in which:
//!
//! - every fallible call is wrapped in `FX_CALL(err, label)` and jumps to
//!   a cleanup label on failure;
//! - every complex local has a matching destructor call on every exit
//!   path;
//! - reference-counted arguments are borrowed (never freed by the
//!   callee); results are produced through output pointers, the return
//!   value being the status code.

use std::collections::HashSet;

use crate::errors::{internal_err, CResult};
use crate::loc::Loc;
use crate::module::Module;
use crate::symtab::{Compilation, Id};

use super::cform::*;
use super::ctypes::CTypeOutput;
use super::kform::{used_ids, KExp, KFold, KTyp};

/// Compilation pragmas surfaced to the driver
#[derive(Debug, Clone, Default)]
pub struct Pragmas {
    /// Force C++ compilation of the generated sources
    pub cpp: bool,
    /// Libraries to pass as `-l` flags
    pub clibs: Vec<String>,
}

impl Pragmas {
    pub fn parse(raw: &[String]) -> Pragmas {
        let mut p = Pragmas::default();
        for s in raw {
            if s == "c++" || s == "cpp" {
                p.cpp = true;
            } else if let Some(lib) = s.strip_prefix("clib:") {
                p.clibs.push(lib.trim().to_string());
            }
        }
        p
    }
}

/// One module's middle-end output
#[derive(Debug)]
pub struct CModule {
    pub name: String,
    pub cname: String,
    /// Type sections in emission order: forward declarations, type
    /// declarations, type utility functions
    pub stmts: Vec<CStmt>,
    /// Typed K-form for the statement generator
    pub kstmts: Vec<KExp>,
    pub pragmas: Pragmas,
    pub is_main: bool,
}

/// Assemble a module's C output from the generated type sections
pub fn assemble_module(
    comp: &mut Compilation,
    module: &Module,
    types: CTypeOutput,
    kstmts: Vec<KExp>,
    raw_pragmas: &[String],
) -> CResult<CModule> {
    let mut stmts =
        Vec::with_capacity(types.fwd_decls.len() + types.type_decls.len() + types.utility_fns.len());
    stmts.extend(types.fwd_decls);
    stmts.extend(types.type_decls);
    stmts.extend(types.utility_fns);

    let roots = collect_roots(comp, &kstmts);
    let stmts = eliminate_dead_types(comp, &roots, stmts)?;

    Ok(CModule {
        name: module.name.clone(),
        cname: format!("fx_{}", module.name.replace('.', "__")),
        stmts,
        kstmts,
        pragmas: Pragmas::parse(raw_pragmas),
        is_main: module.is_main,
    })
}

/// Ids the module's code actually mentions: every type in any expression
/// context or definition, plus every value-position id (so exception tags
/// and constructors stay alive)
fn collect_roots(comp: &Compilation, kstmts: &[KExp]) -> HashSet<Id> {
    struct TypeIds<'v> {
        out: &'v mut HashSet<Id>,
    }
    impl KFold for TypeIds<'_> {
        fn fold_ktyp(&mut self, t: &KTyp, comp: &Compilation) {
            if let KTyp::Record(id) | KTyp::Name(id) = t {
                self.out.insert(*id);
            }
            super::kform::walk_fold_ktyp(self, t, comp)
        }

        fn fold_kexp(&mut self, e: &KExp, comp: &Compilation) {
            match e {
                KExp::DefFun(id, loc) => {
                    if let Ok(df) = super::kform::get_kfun(comp, *id, *loc) {
                        for (_, t) in &df.params {
                            self.fold_ktyp(t, comp);
                        }
                        self.fold_ktyp(&df.rt, comp);
                        self.fold_kexp(&df.body, comp);
                    }
                }
                // exceptions keep their tag registration even when no
                // expression mentions them; plain type definitions are
                // roots only if some value or signature uses them
                KExp::DefExn(id, _) => {
                    self.out.insert(*id);
                }
                _ => {}
            }
            super::kform::walk_fold_kexp(self, e, comp)
        }
    }

    let mut roots = HashSet::new();
    for s in kstmts {
        let mut t = TypeIds { out: &mut roots };
        t.fold_kexp(s, comp);
        roots.extend(used_ids(s, comp));
    }
    roots
}

/// Drop type declarations, forwards, destructors, copies and constructors
/// that the module's code cannot reach. The closure is iterated to a
/// fixpoint, bounded at 100 rounds; running off the bound is a compiler
/// bug. Dropped types are un-registered from the declared sets so a later
/// module that does use them declares them in its own output.
pub fn eliminate_dead_types(
    comp: &mut Compilation,
    roots: &HashSet<Id>,
    stmts: Vec<CStmt>,
) -> CResult<Vec<CStmt>> {
    let mut alive: HashSet<Id> = roots.clone();

    for round in 0..=100 {
        if round == 100 {
            return Err(internal_err(
                Loc::NONE,
                "dead-type elimination did not converge in 100 iterations",
            ));
        }
        let before = alive.len();
        for s in &stmts {
            let id = match stmt_target(s) {
                Some(id) => id,
                None => continue,
            };
            if !alive.contains(&id) {
                continue;
            }
            expand_refs(comp, id, &mut alive);
        }
        if alive.len() == before {
            break;
        }
    }

    let mut kept = Vec::with_capacity(stmts.len());
    for s in stmts {
        match stmt_target(&s) {
            Some(id) if !alive.contains(&id) => {
                if matches!(s, CStmt::DefTyp(_) | CStmt::ForwardTyp(_)) {
                    if let Some(k) = id.idx() {
                        comp.declared_ctypes.remove(&k);
                        comp.fwd_declared.remove(&k);
                    }
                }
            }
            _ => kept.push(s),
        }
    }
    Ok(kept)
}

fn stmt_target(s: &CStmt) -> Option<Id> {
    match s {
        CStmt::DefTyp(id)
        | CStmt::DefEnum(id)
        | CStmt::DefFun(id)
        | CStmt::ForwardTyp(id)
        | CStmt::ForwardFun(id)
        | CStmt::Macro { name: id, .. } => Some(*id),
        _ => None,
    }
}

/// Everything an alive definition pulls in with it
fn expand_refs(comp: &Compilation, id: Id, alive: &mut HashSet<Id>) {
    match comp.c_info_opt(id) {
        Some(CInfo::Typ(dt)) => {
            collect_ctyp_ids(&dt.typ, alive);
            let (fm, ff) = dt.props.free;
            let (cm, cf) = dt.props.copy;
            for f in [fm, ff, cm, cf] {
                if !f.is_none() {
                    alive.insert(f);
                }
            }
            for c in &dt.ctors {
                alive.insert(*c);
            }
            // a tagged variant keeps its companion enum
            if let Some(k) = id.idx() {
                if let Some(eid) = comp.enum_cache.get(&k) {
                    alive.insert(*eid);
                }
            }
        }
        Some(CInfo::Fun(df)) => {
            for (_, t) in &df.args {
                collect_ctyp_ids(t, alive);
            }
            collect_ctyp_ids(&df.rt, alive);
            let mut refs = HashSet::new();
            for s in &df.body {
                collect_cstmt_ids(s, &mut refs);
            }
            alive.extend(refs);
        }
        _ => {}
    }
}
