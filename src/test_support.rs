//! Test support infrastructure for the middle-end pipeline.
//!
//! The middle-end has no parser of its own: its input contract is a
//! type-checked AST with resolved ids. Tests therefore build their input
//! programmatically. This module provides:
//! - a `TestCtx` owning a `Compilation` and a `ModuleGraph`, with helpers
//!   that register definitions the way the type checker would;
//! - expression/pattern constructors that keep the `(type, loc)` plumbing
//!   out of the tests;
//! - lookups for inspecting the K-form and C-form results by name.

use crate::ast::*;
use crate::codegen::cform::{CDefEnum, CDefFun, CDefTyp, CInfo};
use crate::codegen::kform::{KDefFun, KDefVariant, KInfo};
use crate::codegen::{compile_graph, CModule};
use crate::errors::CompileError;
use crate::loc::{FileId, Loc};
use crate::module::{ModuleGraph, ModuleId, BUILTINS_MODULE};
use crate::symtab::{Compilation, Id, Scope};

// ============================================================================
// Expression and pattern constructors
// ============================================================================

pub fn e(kind: ExpKind, typ: Type) -> Exp {
    Exp::new(kind, typ, Loc::NONE)
}

pub fn int(v: i64) -> Exp {
    e(ExpKind::Lit(Lit::Int(v)), Type::Int)
}

pub fn dbl(v: f64) -> Exp {
    e(ExpKind::Lit(Lit::Float(64, v)), Type::Float(64))
}

pub fn boolean(v: bool) -> Exp {
    e(ExpKind::Lit(Lit::Bool(v)), Type::Bool)
}

pub fn string(v: &str) -> Exp {
    e(ExpKind::Lit(Lit::Str(v.to_string())), Type::Str)
}

pub fn ident(id: Id, typ: Type) -> Exp {
    e(ExpKind::Ident(id), typ)
}

pub fn binary(op: BinOp, a: Exp, b: Exp, typ: Type) -> Exp {
    e(ExpKind::Binary(op, Box::new(a), Box::new(b)), typ)
}

pub fn add(a: Exp, b: Exp) -> Exp {
    let typ = a.typ.clone();
    binary(BinOp::Add, a, b, typ)
}

pub fn seq(elems: Vec<Exp>) -> Exp {
    let typ = elems.last().map(|x| x.typ.clone()).unwrap_or(Type::Void);
    e(ExpKind::Seq(elems), typ)
}

pub fn tuple(elems: Vec<Exp>) -> Exp {
    let typ = Type::Tuple(elems.iter().map(|x| x.typ.clone()).collect());
    e(ExpKind::MkTuple(elems), typ)
}

pub fn call(f: Exp, args: Vec<Exp>, rt: Type) -> Exp {
    e(ExpKind::Call(Box::new(f), args), rt)
}

pub fn defval(pat: Pat, rhs: Exp) -> Exp {
    e(ExpKind::DefVal(pat, Box::new(rhs), ValFlags::default()), Type::Void)
}

pub fn matches(scrut: Exp, cases: Vec<MatchCase>, typ: Type) -> Exp {
    e(ExpKind::Match(Box::new(scrut), cases), typ)
}

pub fn case(pats: Vec<Pat>, body: Exp) -> MatchCase {
    MatchCase { pats, body }
}

pub fn p(kind: PatKind) -> Pat {
    Pat::new(kind, Loc::NONE)
}

pub fn pany() -> Pat {
    p(PatKind::Any)
}

pub fn pid(id: Id) -> Pat {
    p(PatKind::Ident(id))
}

pub fn plit(l: Lit) -> Pat {
    p(PatKind::Lit(l))
}

pub fn pvariant(case_id: Id, args: Vec<Pat>) -> Pat {
    p(PatKind::Variant(case_id, args))
}

// ============================================================================
// Test context
// ============================================================================

pub struct TestCtx {
    pub comp: Compilation,
    pub graph: ModuleGraph,
}

impl TestCtx {
    /// A context with an empty `Builtins` module carrying the standard
    /// exceptions, the way the driver seeds a real compilation
    pub fn new() -> Self {
        let mut ctx = TestCtx { comp: Compilation::new(), graph: ModuleGraph::new() };
        let builtins = ctx.add_module(BUILTINS_MODULE, false);
        ctx.defexn(builtins, "NoMatchError", Type::Void);
        ctx.defexn(builtins, "OutOfRangeError", Type::Void);
        ctx
    }

    /// A context without any seeded module
    pub fn bare() -> Self {
        TestCtx { comp: Compilation::new(), graph: ModuleGraph::new() }
    }

    pub fn add_module(&mut self, name: &str, is_main: bool) -> ModuleId {
        let sym = self.comp.new_val(name);
        self.comp.set_ast_info(sym, AstInfo::Module).unwrap();
        let file = self.comp.register_file(&format!("{}.ky", name.to_lowercase()));
        self.graph.add_module(sym, name, file, Vec::new(), is_main)
    }

    pub fn import(&mut self, from: ModuleId, to: ModuleId) {
        self.graph.add_dependency(from, to);
    }

    fn module_scope(&self, m: ModuleId) -> Vec<Scope> {
        vec![Scope::Module(self.graph.get(m).sym)]
    }

    pub fn push_stmt(&mut self, m: ModuleId, stmt: Exp) {
        self.graph.get_mut(m).ast.push(stmt);
    }

    /// Fresh resolved value id
    pub fn val_id(&mut self, name: &str) -> Id {
        self.comp.new_val(name)
    }

    /// Register a function definition and append its statement
    pub fn deffun(
        &mut self,
        m: ModuleId,
        name: &str,
        params: Vec<(Id, Type)>,
        rt: Type,
        body: Exp,
    ) -> Id {
        self.deffun_flags(m, name, params, rt, body, FunFlags::default())
    }

    pub fn deffun_flags(
        &mut self,
        m: ModuleId,
        name: &str,
        params: Vec<(Id, Type)>,
        rt: Type,
        body: Exp,
        flags: FunFlags,
    ) -> Id {
        let id = self.comp.new_val(name);
        let scope = self.module_scope(m);
        let (pats, typs): (Vec<Pat>, Vec<Type>) =
            params.into_iter().map(|(pid_, t)| (pid(pid_), t)).unzip();
        self.comp
            .set_ast_info(
                id,
                AstInfo::Fun(Box::new(AstDefFun {
                    name: id,
                    params: pats,
                    param_typs: typs,
                    rt,
                    body,
                    flags,
                    scope,
                    loc: Loc::NONE,
                })),
            )
            .unwrap();
        self.push_stmt(m, e(ExpKind::DefFun(id), Type::Void));
        id
    }

    /// Register a function definition without a top-level statement; the
    /// caller embeds `ExpKind::DefFun(id)` wherever the function nests
    pub fn deffun_nested(
        &mut self,
        m: ModuleId,
        name: &str,
        params: Vec<(Id, Type)>,
        rt: Type,
        body: Exp,
    ) -> Id {
        let id = self.comp.new_val(name);
        let scope = self.module_scope(m);
        let (pats, typs): (Vec<Pat>, Vec<Type>) =
            params.into_iter().map(|(pid_, t)| (pid(pid_), t)).unzip();
        self.comp
            .set_ast_info(
                id,
                AstInfo::Fun(Box::new(AstDefFun {
                    name: id,
                    params: pats,
                    param_typs: typs,
                    rt,
                    body,
                    flags: FunFlags::default(),
                    scope,
                    loc: Loc::NONE,
                })),
            )
            .unwrap();
        id
    }

    /// Register a variant; returns `(variant id, case ids)`
    pub fn defvariant(
        &mut self,
        m: ModuleId,
        name: &str,
        cases: Vec<(&str, Type)>,
        flags: VariantFlags,
    ) -> (Id, Vec<Id>) {
        let id = self.comp.new_val(name);
        let scope = self.module_scope(m);
        let case_ids: Vec<Id> = cases.iter().map(|(n, _)| self.comp.new_val(n)).collect();
        let kcases: Vec<(Id, Type)> = case_ids
            .iter()
            .zip(cases)
            .map(|(cid, (_, t))| (*cid, t))
            .collect();
        self.comp
            .set_ast_info(
                id,
                AstInfo::Variant(AstDefVariant {
                    name: id,
                    targs: Vec::new(),
                    cases: kcases,
                    ctors: Vec::new(),
                    flags,
                    scope,
                    loc: Loc::NONE,
                }),
            )
            .unwrap();
        self.push_stmt(m, e(ExpKind::DefVariant(id), Type::Void));
        (id, case_ids)
    }

    /// Register a named record type; returns `(record id, field ids)`
    pub fn defrecord(
        &mut self,
        m: ModuleId,
        name: &str,
        fields: Vec<(&str, Type, Option<Lit>)>,
    ) -> (Id, Vec<Id>) {
        let id = self.comp.new_val(name);
        let scope = self.module_scope(m);
        let fields: Vec<AstField> = fields
            .into_iter()
            .map(|(n, t, d)| AstField { name: self.comp.new_val(n), typ: t, default: d })
            .collect();
        let field_ids = fields.iter().map(|f| f.name).collect();
        self.comp
            .set_ast_info(
                id,
                AstInfo::Record(AstDefRecord {
                    name: id,
                    targs: Vec::new(),
                    fields,
                    scope,
                    loc: Loc::NONE,
                }),
            )
            .unwrap();
        self.push_stmt(m, e(ExpKind::DefTyp(id), Type::Void));
        (id, field_ids)
    }

    /// Replace one case's payload type (used to tie recursive knots the
    /// builder cannot express in one call)
    pub fn set_variant_case_typ(&mut self, vid: Id, case_idx: usize, typ: Type) {
        let mut info = match self.comp.ast_info(vid, Loc::NONE).unwrap() {
            AstInfo::Variant(dv) => dv.clone(),
            other => panic!("expected a variant, got {:?}", other),
        };
        info.cases[case_idx].1 = typ;
        self.comp.set_ast_info(vid, AstInfo::Variant(info)).unwrap();
    }

    pub fn defexn(&mut self, m: ModuleId, name: &str, typ: Type) -> Id {
        let id = self.comp.new_val(name);
        let scope = self.module_scope(m);
        self.comp
            .set_ast_info(
                id,
                AstInfo::Exn(AstDefExn { name: id, typ, scope, loc: Loc::NONE }),
            )
            .unwrap();
        self.push_stmt(m, e(ExpKind::DefExn(id), Type::Void));
        id
    }

    /// Run the whole middle-end
    pub fn compile(&mut self) -> Result<Vec<CModule>, Vec<CompileError>> {
        compile_graph(&mut self.comp, &self.graph)
    }

    // ------------------------------------------------------------------
    // Result inspection
    // ------------------------------------------------------------------

    pub fn kfun(&self, id: Id) -> KDefFun {
        match self.comp.k_info(id, Loc::NONE).unwrap() {
            KInfo::Fun(df) => (**df).clone(),
            other => panic!("expected a K-form function, got {:?}", other),
        }
    }

    pub fn kvariant(&self, id: Id) -> KDefVariant {
        match self.comp.k_info(id, Loc::NONE).unwrap() {
            KInfo::Variant(dv) => dv.clone(),
            other => panic!("expected a K-form variant, got {:?}", other),
        }
    }

    /// Find a generated C type definition by its C name
    pub fn find_ctype(&self, cname: &str) -> Option<CDefTyp> {
        self.find_cinfo(|ci| match ci {
            CInfo::Typ(dt) if dt.cname == cname => Some(dt.clone()),
            _ => None,
        })
    }

    /// Find a generated C function (destructor, copy, constructor) by name
    pub fn find_cfun(&self, cname: &str) -> Option<CDefFun> {
        self.find_cinfo(|ci| match ci {
            CInfo::Fun(df) if df.cname == cname => Some((**df).clone()),
            _ => None,
        })
    }

    pub fn find_cenum(&self, cname: &str) -> Option<CDefEnum> {
        self.find_cinfo(|ci| match ci {
            CInfo::Enum(de) if de.cname == cname => Some(de.clone()),
            _ => None,
        })
    }

    fn find_cinfo<T>(&self, f: impl Fn(&CInfo) -> Option<T>) -> Option<T> {
        // ids are dense, so a linear scan over the table is fine in tests
        (0..self.comp.len()).find_map(|k| {
            let id = Id::Val(crate::symtab::StrId(0), k);
            self.comp.c_info_opt(id).and_then(&f)
        })
    }

    fn each_id(&self) -> impl Iterator<Item = Id> + '_ {
        (0..self.comp.len()).map(|k| Id::Val(crate::symtab::StrId(0), k))
    }

    /// C names of every generated C type definition
    pub fn all_ctype_names(&self) -> Vec<String> {
        self.each_id()
            .filter_map(|id| match self.comp.c_info_opt(id) {
                Some(CInfo::Typ(dt)) => Some(dt.cname.clone()),
                _ => None,
            })
            .collect()
    }

    /// Ids of every K-form function definition
    pub fn all_kfun_ids(&self) -> Vec<Id> {
        self.each_id()
            .filter(|id| matches!(self.comp.k_info_opt(*id), Some(KInfo::Fun(_))))
            .collect()
    }

    /// Every assigned C name, one per entity: the K-side name when the
    /// entity has one, else the generated C-side name
    pub fn all_cnames(&self) -> Vec<String> {
        let mut out = Vec::new();
        for id in self.each_id() {
            let kc = match self.comp.k_info_opt(id) {
                Some(KInfo::Val(d)) => Some(d.cname.clone()),
                Some(KInfo::Fun(d)) => Some(d.cname.clone()),
                Some(KInfo::Variant(d)) => Some(d.cname.clone()),
                Some(KInfo::Record(d)) => Some(d.cname.clone()),
                Some(KInfo::Typ(d)) => Some(d.cname.clone()),
                Some(KInfo::Exn(d)) => Some(d.cname.clone()),
                None => None,
            };
            match kc {
                Some(c) if !c.is_empty() => out.push(c),
                Some(_) => {}
                None => match self.comp.c_info_opt(id) {
                    Some(CInfo::Fun(df)) => out.push(df.cname.clone()),
                    Some(CInfo::Enum(de)) => out.push(de.cname.clone()),
                    _ => {}
                },
            }
        }
        out
    }
}

impl Default for TestCtx {
    fn default() -> Self {
        Self::new()
    }
}

/// The initializer of a top-level value definition, searched across every
/// module's K statements
pub fn kval_rhs(mods: &[CModule], id: Id) -> Option<crate::codegen::kform::KExp> {
    use crate::codegen::kform::KExp;
    fn search(stmts: &[KExp], id: Id) -> Option<KExp> {
        for s in stmts {
            match s {
                KExp::DefVal(n, rhs, _) if *n == id => return Some((**rhs).clone()),
                KExp::Seq(elems, _) => {
                    if let Some(found) = search(elems, id) {
                        return Some(found);
                    }
                }
                _ => {}
            }
        }
        None
    }
    mods.iter().find_map(|m| search(&m.kstmts, id))
}
