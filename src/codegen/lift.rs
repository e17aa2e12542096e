//! Simple lambda-lift
//!
//! Hoists to module scope the nested definitions that need no closure:
//!
//! - a nested function is hoistable iff every free variable of its body is
//!   already a global, a type/variant/exception symbol, a constructor, or
//!   a C-code function;
//! - type, variant and exception definitions are hoisted unconditionally;
//! - value definitions that are constructor tags are hoisted as well.
//!
//! Hoisted definitions are appended to the module's top-level statement
//! list and replaced in place by a no-op. The pass runs twice so a
//! function whose only obstacle was a sibling hoisted in the first round
//! gets its chance in the second; sets that truly capture local state are
//! left for the full closure-conversion pass downstream.

use crate::errors::CResult;
use crate::symtab::{Compilation, Id, Scope};

use super::kform::*;

struct Lifter {
    module: Id,
    hoisted: Vec<KExp>,
}

impl KMap for Lifter {
    fn map_kexp(&mut self, e: KExp, comp: &mut Compilation) -> CResult<KExp> {
        match e {
            // every definition reaching this hook is nested: top-level
            // statements are dispatched directly by `lift_module`
            KExp::DefFun(id, loc) => {
                let mut df = get_kfun(comp, id, loc)?;
                df.body = self.map_kexp(df.body, comp)?;
                let hoist =
                    fun_free_vars(&df, comp).iter().all(|v| is_hoistable_ref(comp, *v));
                if hoist {
                    df.scope = vec![Scope::Module(self.module)];
                    comp.set_k_info(id, KInfo::Fun(df))?;
                    self.hoisted.push(KExp::DefFun(id, loc));
                    Ok(KExp::Nop(loc))
                } else {
                    comp.set_k_info(id, KInfo::Fun(df))?;
                    Ok(KExp::DefFun(id, loc))
                }
            }
            KExp::DefVariant(id, loc) => {
                let mut dv = get_kvariant(comp, id, loc)?;
                dv.scope = vec![Scope::Module(self.module)];
                comp.set_k_info(id, KInfo::Variant(dv))?;
                self.hoisted.push(KExp::DefVariant(id, loc));
                Ok(KExp::Nop(loc))
            }
            KExp::DefTyp(id, loc) => {
                self.retag_typ_scope(id, comp)?;
                self.hoisted.push(KExp::DefTyp(id, loc));
                Ok(KExp::Nop(loc))
            }
            KExp::DefExn(id, loc) => {
                let mut de = get_kexn(comp, id, loc)?;
                de.scope = vec![Scope::Module(self.module)];
                comp.set_k_info(id, KInfo::Exn(de))?;
                self.hoisted.push(KExp::DefExn(id, loc));
                Ok(KExp::Nop(loc))
            }
            KExp::DefVal(id, rhs, loc) => {
                let rhs = self.map_kexp(*rhs, comp)?;
                let dv = get_kval(comp, id, loc)?;
                if dv.flags.ctor {
                    let mut dv = dv;
                    dv.scope = vec![Scope::Module(self.module)];
                    comp.set_k_info(id, KInfo::Val(dv))?;
                    self.hoisted.push(KExp::DefVal(id, Box::new(rhs), loc));
                    Ok(KExp::Nop(loc))
                } else {
                    Ok(KExp::DefVal(id, Box::new(rhs), loc))
                }
            }
            other => walk_map_kexp(self, other, comp),
        }
    }
}

impl Lifter {
    fn retag_typ_scope(&self, id: Id, comp: &mut Compilation) -> CResult<()> {
        match comp.k_info(id, crate::loc::Loc::NONE)?.clone() {
            KInfo::Typ(mut dt) => {
                dt.scope = vec![Scope::Module(self.module)];
                comp.set_k_info(id, KInfo::Typ(dt))
            }
            KInfo::Record(mut dr) => {
                dr.scope = vec![Scope::Module(self.module)];
                comp.set_k_info(id, KInfo::Record(dr))
            }
            _ => Ok(()),
        }
    }
}

/// Run the hoisting pass over a module's top-level statements
pub fn lift_module(comp: &mut Compilation, module: Id, stmts: Vec<KExp>) -> CResult<Vec<KExp>> {
    let mut stmts = stmts;
    for _ in 0..2 {
        let mut lifter = Lifter { module, hoisted: Vec::new() };
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            match stmt {
                // definitions already at module scope stay put; only their
                // bodies are scanned for hoistable children
                KExp::DefFun(id, loc) => {
                    let mut df = get_kfun(comp, id, loc)?;
                    df.body = lifter.map_kexp(df.body, comp)?;
                    comp.set_k_info(id, KInfo::Fun(df))?;
                    out.push(KExp::DefFun(id, loc));
                }
                KExp::DefVariant(..) | KExp::DefTyp(..) | KExp::DefExn(..) => out.push(stmt),
                KExp::DefVal(id, rhs, loc) => {
                    let rhs = lifter.map_kexp(*rhs, comp)?;
                    out.push(KExp::DefVal(id, Box::new(rhs), loc));
                }
                other => out.push(lifter.map_kexp(other, comp)?),
            }
        }
        out.extend(lifter.hoisted);
        stmts = out;
    }
    // drop the no-ops left behind by hoisting
    stmts.retain(|s| !s.is_nop());
    Ok(stmts)
}
