//! K-form: the let-normalized intermediate representation
//!
//! Every operand of a primitive operation (binary, unary, intrinsic, call,
//! constructor) is an atom: an id or a literal. Each expression carries a
//! `(KTyp, Loc)` context; statements are expressions of type `Void`.
//!
//! Definitions (`KDefFun`, `KDefVariant`, ...) live in the K-form info
//! table; the expression stream references them by id, so passes can
//! update a definition without rebuilding the IR around it.
//!
//! Traversal is offered in two flavors, mirroring the callback-record
//! style of the rest of the pipeline:
//!
//! - [`KFold`]: read-only structural fold with per-node override points;
//! - [`KMap`]: rebuilding transform used by the mangler and the hoisting
//!   pass.
//!
//! Default recursion is explicit (`walk_*` functions); a hook that does
//! not call its `walk_*` counterpart prunes the subtree.

use std::collections::HashSet;

use crate::ast::{BinOp, Ctor, FunFlags, Lit, Type, UnOp, ValFlags};
use crate::errors::{internal_err, CResult};
use crate::loc::Loc;
use crate::symtab::{Compilation, Id, ScopeChain};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum KTyp {
    Int,
    SInt(u8),
    UInt(u8),
    Float(u8),
    Void,
    Bool,
    Char,
    Str,
    Exn,
    CPtr,
    Fun(Vec<KTyp>, Box<KTyp>),
    Tuple(Vec<KTyp>),
    Array(usize, Box<KTyp>),
    List(Box<KTyp>),
    Ref(Box<KTyp>),
    /// Named record; kept nominal through the whole pipeline
    Record(Id),
    /// Nominal type produced by the mangler (or a source type alias)
    Name(Id),
    /// Error placeholder; must never survive into the mangler
    Err,
    Module,
}

impl KTyp {
    pub fn is_void(&self) -> bool {
        matches!(self, KTyp::Void)
    }

    /// True for types whose values fit in a C scalar
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            KTyp::Int
                | KTyp::SInt(_)
                | KTyp::UInt(_)
                | KTyp::Float(_)
                | KTyp::Bool
                | KTyp::Char
        )
    }
}

/// Convert a (checked) AST type into a K-form type
pub fn typ2ktyp(t: &Type) -> KTyp {
    match t {
        Type::Int => KTyp::Int,
        Type::SInt(b) => KTyp::SInt(*b),
        Type::UInt(b) => KTyp::UInt(*b),
        Type::Float(b) => KTyp::Float(*b),
        Type::Void => KTyp::Void,
        Type::Bool => KTyp::Bool,
        Type::Char => KTyp::Char,
        Type::Str => KTyp::Str,
        Type::Exn => KTyp::Exn,
        Type::CPtr => KTyp::CPtr,
        Type::Fun(args, rt) => {
            KTyp::Fun(args.iter().map(typ2ktyp).collect(), Box::new(typ2ktyp(rt)))
        }
        Type::Tuple(elems) => KTyp::Tuple(elems.iter().map(typ2ktyp).collect()),
        Type::Array(dims, elt) => KTyp::Array(*dims, Box::new(typ2ktyp(elt))),
        Type::List(elt) => KTyp::List(Box::new(typ2ktyp(elt))),
        Type::Ref(elt) => KTyp::Ref(Box::new(typ2ktyp(elt))),
        Type::Record(id) => KTyp::Record(*id),
        Type::App(_, id) => KTyp::Name(*id),
    }
}

// ============================================================================
// Atoms and iteration domains
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    Id(Id),
    Lit(Lit),
}

impl Atom {
    pub fn id(&self) -> Option<Id> {
        match self {
            Atom::Id(id) => Some(*id),
            Atom::Lit(_) => None,
        }
    }
}

/// Iteration domain of one `for`/comprehension binding
#[derive(Debug, Clone, PartialEq)]
pub enum Dom {
    /// Iterate over the elements of an array, list or string
    Elem(Atom),
    /// Iterate over `start:end:step`
    Range(Atom, Atom, Atom),
}

/// K-form intrinsics: primitives not expressible as user functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KIntrin {
    VariantTag,
    VariantCase,
    ListHead,
    ListTail,
    StrConcat,
    GetSize,
    CheckIdx,
    PopExn,
}

// ============================================================================
// Expressions
// ============================================================================

/// The `(type, location)` context of an expression
#[derive(Debug, Clone, PartialEq)]
pub struct KCtx {
    pub typ: KTyp,
    pub loc: Loc,
}

impl KCtx {
    pub fn new(typ: KTyp, loc: Loc) -> Self {
        KCtx { typ, loc }
    }
}

/// One case of a lowered match: a list of boolean checks plus the body
#[derive(Debug, Clone)]
pub struct KCase {
    pub checks: Vec<KExp>,
    pub body: KExp,
}

/// One stage of a comprehension: statements to evaluate before entering
/// the stage, the parallel iteration bindings, and the `@` index ids
#[derive(Debug, Clone)]
pub struct KMapClause {
    pub pre: Vec<KExp>,
    pub iters: Vec<(Id, Dom)>,
    pub at_ids: Vec<Id>,
}

#[derive(Debug, Clone)]
pub enum KExp {
    Nop(Loc),
    Break(Loc),
    Continue(Loc),
    Atom(Atom, KCtx),
    Binary(BinOp, Atom, Atom, KCtx),
    Unary(UnOp, Atom, KCtx),
    Intrin(KIntrin, Vec<Atom>, KCtx),
    Seq(Vec<KExp>, KCtx),
    If(Box<KExp>, Box<KExp>, Box<KExp>, KCtx),
    Call(Id, Vec<Atom>, KCtx),
    MkTuple(Vec<Atom>, KCtx),
    MkRecord(Vec<Atom>, KCtx),
    MkArray(Vec<Vec<Atom>>, KCtx),
    /// Tuple/record member access by position
    Mem(Atom, usize, KCtx),
    /// Array element access
    At(Atom, Vec<Dom>, KCtx),
    Assign(Id, Atom, Loc),
    Match(Vec<KCase>, KCtx),
    TryCatch(Box<KExp>, Box<KExp>, KCtx),
    /// Throw (or rethrow, in catch handlers) the exception named by the id
    Throw(Id, bool, Loc),
    Cast(Atom, KCtx),
    Map(Vec<KMapClause>, Box<KExp>, KCtx),
    For(Vec<(Id, Dom)>, Vec<Id>, Box<KExp>, Loc),
    While(Box<KExp>, Box<KExp>, Loc),
    DoWhile(Box<KExp>, Box<KExp>, Loc),
    CCode(String, KCtx),
    DefVal(Id, Box<KExp>, Loc),
    DefFun(Id, Loc),
    DefVariant(Id, Loc),
    DefTyp(Id, Loc),
    DefExn(Id, Loc),
}

impl KExp {
    pub fn ctx(&self) -> (KTyp, Loc) {
        match self {
            KExp::Nop(l)
            | KExp::Break(l)
            | KExp::Continue(l)
            | KExp::Assign(_, _, l)
            | KExp::Throw(_, _, l)
            | KExp::For(_, _, _, l)
            | KExp::While(_, _, l)
            | KExp::DoWhile(_, _, l)
            | KExp::DefVal(_, _, l)
            | KExp::DefFun(_, l)
            | KExp::DefVariant(_, l)
            | KExp::DefTyp(_, l)
            | KExp::DefExn(_, l) => (KTyp::Void, *l),
            KExp::Atom(_, c)
            | KExp::Binary(_, _, _, c)
            | KExp::Unary(_, _, c)
            | KExp::Intrin(_, _, c)
            | KExp::Seq(_, c)
            | KExp::If(_, _, _, c)
            | KExp::Call(_, _, c)
            | KExp::MkTuple(_, c)
            | KExp::MkRecord(_, c)
            | KExp::MkArray(_, c)
            | KExp::Mem(_, _, c)
            | KExp::At(_, _, c)
            | KExp::Match(_, c)
            | KExp::TryCatch(_, _, c)
            | KExp::Cast(_, c)
            | KExp::Map(_, _, c)
            | KExp::CCode(_, c) => (c.typ.clone(), c.loc),
        }
    }

    pub fn typ(&self) -> KTyp {
        self.ctx().0
    }

    pub fn loc(&self) -> Loc {
        self.ctx().1
    }

    /// The atom of a trivial expression, if it is one
    pub fn as_atom(&self) -> Option<&Atom> {
        match self {
            KExp::Atom(a, _) => Some(a),
            _ => None,
        }
    }

    pub fn is_nop(&self) -> bool {
        matches!(self, KExp::Nop(_))
    }
}

/// Wrap an accumulated code prefix plus a result expression into a single
/// expression. `code` is in evaluation order, the way the normalizer
/// accumulates it.
pub fn code2kexp(mut code: Vec<KExp>, result: KExp) -> KExp {
    if code.is_empty() {
        return result;
    }
    let (typ, loc) = result.ctx();
    code.push(result);
    KExp::Seq(code, KCtx::new(typ, loc))
}

// ============================================================================
// Definitions (K-form info table entries)
// ============================================================================

#[derive(Debug, Clone)]
pub struct KDefVal {
    pub name: Id,
    pub typ: KTyp,
    pub cname: String,
    pub flags: ValFlags,
    pub scope: ScopeChain,
    pub loc: Loc,
}

/// Closure bookkeeping filled by the (external) full lambda-lift pass.
/// The simple hoisting pass in this crate leaves every field `NONE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KClosure {
    pub fv_struct: Id,
    pub fp_typ: Id,
    pub make_fp: Id,
    pub wrap: Id,
}

impl Default for KClosure {
    fn default() -> Self {
        KClosure {
            fv_struct: Id::NONE,
            fp_typ: Id::NONE,
            make_fp: Id::NONE,
            wrap: Id::NONE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KDefFun {
    pub name: Id,
    pub cname: String,
    pub params: Vec<(Id, KTyp)>,
    pub rt: KTyp,
    pub body: KExp,
    pub flags: FunFlags,
    pub closure: KClosure,
    pub scope: ScopeChain,
    pub loc: Loc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KVariantFlags {
    pub recursive: bool,
    pub record: bool,
    /// Declared with option syntax; its tag enum starts at 0
    pub opt: bool,
    /// Two-case recursive variant with a payload-free case, represented
    /// as a null pointer; the index is the payload-free case
    pub nil_case: Option<usize>,
    pub have_tag: bool,
}

#[derive(Debug, Clone)]
pub struct KDefVariant {
    pub name: Id,
    pub cname: String,
    pub targs: Vec<KTyp>,
    pub cases: Vec<(Id, KTyp)>,
    pub ctors: Vec<Id>,
    pub flags: KVariantFlags,
    pub scope: ScopeChain,
    pub loc: Loc,
}

#[derive(Debug, Clone)]
pub struct KField {
    pub name: Id,
    pub typ: KTyp,
    pub default: Option<Lit>,
}

#[derive(Debug, Clone)]
pub struct KDefRecord {
    pub name: Id,
    pub cname: String,
    pub targs: Vec<KTyp>,
    pub fields: Vec<KField>,
    pub scope: ScopeChain,
    pub loc: Loc,
}

#[derive(Debug, Clone)]
pub struct KDefTyp {
    pub name: Id,
    pub cname: String,
    pub targs: Vec<KTyp>,
    pub typ: KTyp,
    pub scope: ScopeChain,
    pub loc: Loc,
}

#[derive(Debug, Clone)]
pub struct KDefExn {
    pub name: Id,
    pub cname: String,
    pub typ: KTyp,
    /// Runtime tag; standard exceptions get negative tags from the C type
    /// generator
    pub tag: i32,
    pub scope: ScopeChain,
    pub loc: Loc,
}

#[derive(Debug, Clone)]
pub enum KInfo {
    Val(KDefVal),
    Fun(Box<KDefFun>),
    Variant(KDefVariant),
    Record(KDefRecord),
    Typ(KDefTyp),
    Exn(KDefExn),
}

// ============================================================================
// Typed lookups
// ============================================================================

pub fn get_kval(comp: &Compilation, id: Id, loc: Loc) -> CResult<KDefVal> {
    match comp.k_info(id, loc)? {
        KInfo::Val(dv) => Ok(dv.clone()),
        other => Err(internal_err(
            loc,
            format!("expected a value definition, found {:?}", std::mem::discriminant(other)),
        )),
    }
}

pub fn get_kfun(comp: &Compilation, id: Id, loc: Loc) -> CResult<Box<KDefFun>> {
    match comp.k_info(id, loc)? {
        KInfo::Fun(df) => Ok(df.clone()),
        _ => Err(internal_err(loc, "expected a function definition")),
    }
}

pub fn get_kvariant(comp: &Compilation, id: Id, loc: Loc) -> CResult<KDefVariant> {
    match comp.k_info(id, loc)? {
        KInfo::Variant(dv) => Ok(dv.clone()),
        _ => Err(internal_err(loc, "expected a variant definition")),
    }
}

pub fn get_krecord(comp: &Compilation, id: Id, loc: Loc) -> CResult<KDefRecord> {
    match comp.k_info(id, loc)? {
        KInfo::Record(dr) => Ok(dr.clone()),
        _ => Err(internal_err(loc, "expected a record definition")),
    }
}

pub fn get_kexn(comp: &Compilation, id: Id, loc: Loc) -> CResult<KDefExn> {
    match comp.k_info(id, loc)? {
        KInfo::Exn(de) => Ok(de.clone()),
        _ => Err(internal_err(loc, "expected an exception definition")),
    }
}

/// Type of a literal
pub fn lit_ktyp(l: &Lit) -> KTyp {
    match l {
        Lit::Int(_) => KTyp::Int,
        Lit::SInt(b, _) => KTyp::SInt(*b),
        Lit::UInt(b, _) => KTyp::UInt(*b),
        Lit::Float(b, _) => KTyp::Float(*b),
        Lit::Bool(_) => KTyp::Bool,
        Lit::Char(_) => KTyp::Char,
        Lit::Str(_) => KTyp::Str,
        // nil's element type is only known from context
        Lit::Nil => KTyp::List(Box::new(KTyp::Void)),
        Lit::Unit => KTyp::Void,
    }
}

/// Type of an id as recorded in the K-form table
pub fn get_id_ktyp(comp: &Compilation, id: Id, loc: Loc) -> CResult<KTyp> {
    match comp.k_info(id, loc)? {
        KInfo::Val(dv) => Ok(dv.typ.clone()),
        KInfo::Fun(df) => Ok(KTyp::Fun(
            df.params.iter().map(|(_, t)| t.clone()).collect(),
            Box::new(df.rt.clone()),
        )),
        KInfo::Variant(dv) => Ok(KTyp::Name(dv.name)),
        KInfo::Record(dr) => Ok(KTyp::Record(dr.name)),
        KInfo::Typ(dt) => Ok(dt.typ.clone()),
        KInfo::Exn(_) => Ok(KTyp::Exn),
    }
}

pub fn get_atom_ktyp(comp: &Compilation, a: &Atom, loc: Loc) -> CResult<KTyp> {
    match a {
        Atom::Id(id) => get_id_ktyp(comp, *id, loc),
        Atom::Lit(l) => Ok(lit_ktyp(l)),
    }
}

// ============================================================================
// Read-only fold
// ============================================================================

/// Structural fold over K-form with per-node override points. The default
/// for every hook is full recursion; override and skip the `walk_*` call
/// to prune.
pub trait KFold {
    fn fold_id(&mut self, _id: Id, _comp: &Compilation) {}

    fn fold_atom(&mut self, a: &Atom, comp: &Compilation) {
        walk_fold_atom(self, a, comp)
    }

    fn fold_ktyp(&mut self, t: &KTyp, comp: &Compilation) {
        walk_fold_ktyp(self, t, comp)
    }

    fn fold_kexp(&mut self, e: &KExp, comp: &Compilation) {
        walk_fold_kexp(self, e, comp)
    }
}

pub fn walk_fold_atom<F: KFold + ?Sized>(f: &mut F, a: &Atom, comp: &Compilation) {
    if let Atom::Id(id) = a {
        f.fold_id(*id, comp);
    }
}

pub fn walk_fold_ktyp<F: KFold + ?Sized>(f: &mut F, t: &KTyp, comp: &Compilation) {
    match t {
        KTyp::Fun(args, rt) => {
            for a in args {
                f.fold_ktyp(a, comp);
            }
            f.fold_ktyp(rt, comp);
        }
        KTyp::Tuple(elems) => {
            for e in elems {
                f.fold_ktyp(e, comp);
            }
        }
        KTyp::Array(_, elt) | KTyp::List(elt) | KTyp::Ref(elt) => f.fold_ktyp(elt, comp),
        KTyp::Record(id) | KTyp::Name(id) => f.fold_id(*id, comp),
        _ => {}
    }
}

fn fold_dom<F: KFold + ?Sized>(f: &mut F, d: &Dom, comp: &Compilation) {
    match d {
        Dom::Elem(a) => f.fold_atom(a, comp),
        Dom::Range(a, b, c) => {
            f.fold_atom(a, comp);
            f.fold_atom(b, comp);
            f.fold_atom(c, comp);
        }
    }
}

pub fn walk_fold_kexp<F: KFold + ?Sized>(f: &mut F, e: &KExp, comp: &Compilation) {
    let (typ, _) = e.ctx();
    f.fold_ktyp(&typ, comp);
    match e {
        KExp::Nop(_) | KExp::Break(_) | KExp::Continue(_) | KExp::CCode(..) => {}
        KExp::Atom(a, _) | KExp::Cast(a, _) => f.fold_atom(a, comp),
        KExp::Binary(_, a, b, _) => {
            f.fold_atom(a, comp);
            f.fold_atom(b, comp);
        }
        KExp::Unary(_, a, _) => f.fold_atom(a, comp),
        KExp::Intrin(_, args, _) | KExp::MkTuple(args, _) | KExp::MkRecord(args, _) => {
            for a in args {
                f.fold_atom(a, comp);
            }
        }
        KExp::MkArray(rows, _) => {
            for row in rows {
                for a in row {
                    f.fold_atom(a, comp);
                }
            }
        }
        KExp::Seq(elems, _) => {
            for e in elems {
                f.fold_kexp(e, comp);
            }
        }
        KExp::If(c, t, e2, _) => {
            f.fold_kexp(c, comp);
            f.fold_kexp(t, comp);
            f.fold_kexp(e2, comp);
        }
        KExp::Call(fid, args, _) => {
            f.fold_id(*fid, comp);
            for a in args {
                f.fold_atom(a, comp);
            }
        }
        KExp::Mem(a, _, _) => f.fold_atom(a, comp),
        KExp::At(a, doms, _) => {
            f.fold_atom(a, comp);
            for d in doms {
                fold_dom(f, d, comp);
            }
        }
        KExp::Assign(id, a, _) => {
            f.fold_id(*id, comp);
            f.fold_atom(a, comp);
        }
        KExp::Match(cases, _) => {
            for case in cases {
                for chk in &case.checks {
                    f.fold_kexp(chk, comp);
                }
                f.fold_kexp(&case.body, comp);
            }
        }
        KExp::TryCatch(body, handler, _) => {
            f.fold_kexp(body, comp);
            f.fold_kexp(handler, comp);
        }
        KExp::Throw(id, _, _) => f.fold_id(*id, comp),
        KExp::Map(clauses, body, _) => {
            for cl in clauses {
                for p in &cl.pre {
                    f.fold_kexp(p, comp);
                }
                for (_, d) in &cl.iters {
                    fold_dom(f, d, comp);
                }
            }
            f.fold_kexp(body, comp);
        }
        KExp::For(iters, _, body, _) => {
            for (_, d) in iters {
                fold_dom(f, d, comp);
            }
            f.fold_kexp(body, comp);
        }
        KExp::While(c, body, _) => {
            f.fold_kexp(c, comp);
            f.fold_kexp(body, comp);
        }
        KExp::DoWhile(body, c, _) => {
            f.fold_kexp(body, comp);
            f.fold_kexp(c, comp);
        }
        KExp::DefVal(_, rhs, _) => f.fold_kexp(rhs, comp),
        KExp::DefFun(..) | KExp::DefVariant(..) | KExp::DefTyp(..) | KExp::DefExn(..) => {}
    }
}

// ============================================================================
// Rebuilding transform
// ============================================================================

/// Rebuilding traversal: every hook consumes a node and returns the
/// transformed node, defaulting to structural recursion.
pub trait KMap {
    fn map_id(&mut self, id: Id, _comp: &mut Compilation) -> CResult<Id> {
        Ok(id)
    }

    fn map_atom(&mut self, a: Atom, comp: &mut Compilation) -> CResult<Atom> {
        walk_map_atom(self, a, comp)
    }

    fn map_ktyp(&mut self, t: KTyp, loc: Loc, comp: &mut Compilation) -> CResult<KTyp> {
        walk_map_ktyp(self, t, loc, comp)
    }

    fn map_kexp(&mut self, e: KExp, comp: &mut Compilation) -> CResult<KExp> {
        walk_map_kexp(self, e, comp)
    }
}

pub fn walk_map_atom<M: KMap + ?Sized>(m: &mut M, a: Atom, comp: &mut Compilation) -> CResult<Atom> {
    match a {
        Atom::Id(id) => Ok(Atom::Id(m.map_id(id, comp)?)),
        lit => Ok(lit),
    }
}

pub fn walk_map_ktyp<M: KMap + ?Sized>(
    m: &mut M,
    t: KTyp,
    loc: Loc,
    comp: &mut Compilation,
) -> CResult<KTyp> {
    Ok(match t {
        KTyp::Fun(args, rt) => {
            let args = args
                .into_iter()
                .map(|a| m.map_ktyp(a, loc, comp))
                .collect::<CResult<Vec<_>>>()?;
            KTyp::Fun(args, Box::new(m.map_ktyp(*rt, loc, comp)?))
        }
        KTyp::Tuple(elems) => KTyp::Tuple(
            elems
                .into_iter()
                .map(|e| m.map_ktyp(e, loc, comp))
                .collect::<CResult<Vec<_>>>()?,
        ),
        KTyp::Array(d, elt) => KTyp::Array(d, Box::new(m.map_ktyp(*elt, loc, comp)?)),
        KTyp::List(elt) => KTyp::List(Box::new(m.map_ktyp(*elt, loc, comp)?)),
        KTyp::Ref(elt) => KTyp::Ref(Box::new(m.map_ktyp(*elt, loc, comp)?)),
        KTyp::Record(id) => KTyp::Record(m.map_id(id, comp)?),
        KTyp::Name(id) => KTyp::Name(m.map_id(id, comp)?),
        other => other,
    })
}

fn map_dom<M: KMap + ?Sized>(m: &mut M, d: Dom, comp: &mut Compilation) -> CResult<Dom> {
    Ok(match d {
        Dom::Elem(a) => Dom::Elem(m.map_atom(a, comp)?),
        Dom::Range(a, b, c) => {
            Dom::Range(m.map_atom(a, comp)?, m.map_atom(b, comp)?, m.map_atom(c, comp)?)
        }
    })
}

fn map_ctx<M: KMap + ?Sized>(m: &mut M, c: KCtx, comp: &mut Compilation) -> CResult<KCtx> {
    let loc = c.loc;
    Ok(KCtx::new(m.map_ktyp(c.typ, loc, comp)?, loc))
}

pub fn walk_map_kexp<M: KMap + ?Sized>(m: &mut M, e: KExp, comp: &mut Compilation) -> CResult<KExp> {
    Ok(match e {
        KExp::Nop(_) | KExp::Break(_) | KExp::Continue(_) => e,
        KExp::Atom(a, c) => KExp::Atom(m.map_atom(a, comp)?, map_ctx(m, c, comp)?),
        KExp::Binary(op, a, b, c) => {
            KExp::Binary(op, m.map_atom(a, comp)?, m.map_atom(b, comp)?, map_ctx(m, c, comp)?)
        }
        KExp::Unary(op, a, c) => KExp::Unary(op, m.map_atom(a, comp)?, map_ctx(m, c, comp)?),
        KExp::Intrin(op, args, c) => {
            let args = args
                .into_iter()
                .map(|a| m.map_atom(a, comp))
                .collect::<CResult<Vec<_>>>()?;
            KExp::Intrin(op, args, map_ctx(m, c, comp)?)
        }
        KExp::Seq(elems, c) => {
            let elems = elems
                .into_iter()
                .map(|e| m.map_kexp(e, comp))
                .collect::<CResult<Vec<_>>>()?;
            KExp::Seq(elems, map_ctx(m, c, comp)?)
        }
        KExp::If(cnd, th, el, c) => KExp::If(
            Box::new(m.map_kexp(*cnd, comp)?),
            Box::new(m.map_kexp(*th, comp)?),
            Box::new(m.map_kexp(*el, comp)?),
            map_ctx(m, c, comp)?,
        ),
        KExp::Call(f, args, c) => {
            let f = m.map_id(f, comp)?;
            let args = args
                .into_iter()
                .map(|a| m.map_atom(a, comp))
                .collect::<CResult<Vec<_>>>()?;
            KExp::Call(f, args, map_ctx(m, c, comp)?)
        }
        KExp::MkTuple(args, c) => {
            let args = args
                .into_iter()
                .map(|a| m.map_atom(a, comp))
                .collect::<CResult<Vec<_>>>()?;
            KExp::MkTuple(args, map_ctx(m, c, comp)?)
        }
        KExp::MkRecord(args, c) => {
            let args = args
                .into_iter()
                .map(|a| m.map_atom(a, comp))
                .collect::<CResult<Vec<_>>>()?;
            KExp::MkRecord(args, map_ctx(m, c, comp)?)
        }
        KExp::MkArray(rows, c) => {
            let rows = rows
                .into_iter()
                .map(|row| row.into_iter().map(|a| m.map_atom(a, comp)).collect())
                .collect::<CResult<Vec<Vec<_>>>>()?;
            KExp::MkArray(rows, map_ctx(m, c, comp)?)
        }
        KExp::Mem(a, i, c) => KExp::Mem(m.map_atom(a, comp)?, i, map_ctx(m, c, comp)?),
        KExp::At(a, doms, c) => {
            let a = m.map_atom(a, comp)?;
            let doms = doms
                .into_iter()
                .map(|d| map_dom(m, d, comp))
                .collect::<CResult<Vec<_>>>()?;
            KExp::At(a, doms, map_ctx(m, c, comp)?)
        }
        KExp::Assign(id, a, loc) => KExp::Assign(m.map_id(id, comp)?, m.map_atom(a, comp)?, loc),
        KExp::Match(cases, c) => {
            let cases = cases
                .into_iter()
                .map(|case| {
                    let checks = case
                        .checks
                        .into_iter()
                        .map(|chk| m.map_kexp(chk, comp))
                        .collect::<CResult<Vec<_>>>()?;
                    Ok(KCase { checks, body: m.map_kexp(case.body, comp)? })
                })
                .collect::<CResult<Vec<_>>>()?;
            KExp::Match(cases, map_ctx(m, c, comp)?)
        }
        KExp::TryCatch(body, handler, c) => KExp::TryCatch(
            Box::new(m.map_kexp(*body, comp)?),
            Box::new(m.map_kexp(*handler, comp)?),
            map_ctx(m, c, comp)?,
        ),
        KExp::Throw(id, rethrow, loc) => KExp::Throw(m.map_id(id, comp)?, rethrow, loc),
        KExp::Cast(a, c) => KExp::Cast(m.map_atom(a, comp)?, map_ctx(m, c, comp)?),
        KExp::Map(clauses, body, c) => {
            let clauses = clauses
                .into_iter()
                .map(|cl| {
                    let pre = cl
                        .pre
                        .into_iter()
                        .map(|p| m.map_kexp(p, comp))
                        .collect::<CResult<Vec<_>>>()?;
                    let iters = cl
                        .iters
                        .into_iter()
                        .map(|(i, d)| Ok((m.map_id(i, comp)?, map_dom(m, d, comp)?)))
                        .collect::<CResult<Vec<_>>>()?;
                    let at_ids = cl
                        .at_ids
                        .into_iter()
                        .map(|i| m.map_id(i, comp))
                        .collect::<CResult<Vec<_>>>()?;
                    Ok(KMapClause { pre, iters, at_ids })
                })
                .collect::<CResult<Vec<_>>>()?;
            KExp::Map(clauses, Box::new(m.map_kexp(*body, comp)?), map_ctx(m, c, comp)?)
        }
        KExp::For(iters, at_ids, body, loc) => {
            let iters = iters
                .into_iter()
                .map(|(i, d)| Ok((m.map_id(i, comp)?, map_dom(m, d, comp)?)))
                .collect::<CResult<Vec<_>>>()?;
            let at_ids = at_ids
                .into_iter()
                .map(|i| m.map_id(i, comp))
                .collect::<CResult<Vec<_>>>()?;
            KExp::For(iters, at_ids, Box::new(m.map_kexp(*body, comp)?), loc)
        }
        KExp::While(cnd, body, loc) => KExp::While(
            Box::new(m.map_kexp(*cnd, comp)?),
            Box::new(m.map_kexp(*body, comp)?),
            loc,
        ),
        KExp::DoWhile(body, cnd, loc) => KExp::DoWhile(
            Box::new(m.map_kexp(*body, comp)?),
            Box::new(m.map_kexp(*cnd, comp)?),
            loc,
        ),
        KExp::CCode(s, c) => KExp::CCode(s, map_ctx(m, c, comp)?),
        KExp::DefVal(id, rhs, loc) => {
            KExp::DefVal(m.map_id(id, comp)?, Box::new(m.map_kexp(*rhs, comp)?), loc)
        }
        KExp::DefFun(id, loc) => KExp::DefFun(m.map_id(id, comp)?, loc),
        KExp::DefVariant(id, loc) => KExp::DefVariant(m.map_id(id, comp)?, loc),
        KExp::DefTyp(id, loc) => KExp::DefTyp(m.map_id(id, comp)?, loc),
        KExp::DefExn(id, loc) => KExp::DefExn(m.map_id(id, comp)?, loc),
    })
}

// ============================================================================
// Used / declared / free variables
// ============================================================================

struct UsedIds {
    used: HashSet<Id>,
}

impl KFold for UsedIds {
    fn fold_id(&mut self, id: Id, _comp: &Compilation) {
        if !id.is_none() {
            self.used.insert(id);
        }
    }

    fn fold_ktyp(&mut self, _t: &KTyp, _comp: &Compilation) {
        // ids inside types are not value uses
    }

    fn fold_kexp(&mut self, e: &KExp, comp: &Compilation) {
        // nested functions use whatever their bodies use
        if let KExp::DefFun(id, loc) = e {
            if let Ok(df) = get_kfun(comp, *id, *loc) {
                self.fold_kexp(&df.body, comp);
            }
        }
        walk_fold_kexp(self, e, comp)
    }
}

/// All ids referenced in value position within `e`
pub fn used_ids(e: &KExp, comp: &Compilation) -> HashSet<Id> {
    let mut f = UsedIds { used: HashSet::new() };
    f.fold_kexp(e, comp);
    f.used
}

struct DeclaredIds {
    declared: HashSet<Id>,
}

impl KFold for DeclaredIds {
    fn fold_kexp(&mut self, e: &KExp, comp: &Compilation) {
        match e {
            KExp::DefVal(id, _, _) => {
                self.declared.insert(*id);
            }
            KExp::DefFun(id, loc) => {
                self.declared.insert(*id);
                if let Ok(df) = get_kfun(comp, *id, *loc) {
                    for (p, _) in &df.params {
                        self.declared.insert(*p);
                    }
                    self.fold_kexp(&df.body, comp);
                }
            }
            KExp::For(iters, at_ids, _, _) => {
                for (i, _) in iters {
                    self.declared.insert(*i);
                }
                self.declared.extend(at_ids.iter().copied());
            }
            KExp::Map(clauses, _, _) => {
                for cl in clauses {
                    for (i, _) in &cl.iters {
                        self.declared.insert(*i);
                    }
                    self.declared.extend(cl.at_ids.iter().copied());
                }
            }
            _ => {}
        }
        walk_fold_kexp(self, e, comp)
    }
}

/// All ids bound by declarations within `e`
pub fn declared_ids(e: &KExp, comp: &Compilation) -> HashSet<Id> {
    let mut f = DeclaredIds { declared: HashSet::new() };
    f.fold_kexp(e, comp);
    f.declared
}

/// `used(e) \ declared(e)`: identifiers the expression takes from its
/// environment
pub fn free_vars(e: &KExp, comp: &Compilation) -> HashSet<Id> {
    let used = used_ids(e, comp);
    let declared = declared_ids(e, comp);
    used.difference(&declared).copied().collect()
}

/// Free variables of a function body, with the function's own parameters
/// (and the function itself, for recursion) also treated as declared
pub fn fun_free_vars(df: &KDefFun, comp: &Compilation) -> HashSet<Id> {
    let mut fv = free_vars(&df.body, comp);
    for (p, _) in &df.params {
        fv.remove(p);
    }
    fv.remove(&df.name);
    fv
}

// ============================================================================
// Flag helpers shared by the hoisting pass and the mangler
// ============================================================================

/// True if the id names a type, variant, record or exception
pub fn is_ktype_id(comp: &Compilation, id: Id) -> bool {
    matches!(
        comp.k_info_opt(id),
        Some(KInfo::Variant(_) | KInfo::Record(_) | KInfo::Typ(_) | KInfo::Exn(_))
    )
}

/// True if the id is a global (module-scope) value or function, a
/// constructor, or a C-code function
pub fn is_hoistable_ref(comp: &Compilation, id: Id) -> bool {
    match comp.k_info_opt(id) {
        Some(KInfo::Val(dv)) => {
            crate::symtab::is_global_scope(&dv.scope) || dv.flags.ctor
        }
        Some(KInfo::Fun(df)) => {
            crate::symtab::is_global_scope(&df.scope)
                || df.flags.ccode
                || df.flags.ctor != Ctor::None
        }
        Some(KInfo::Variant(_) | KInfo::Record(_) | KInfo::Typ(_) | KInfo::Exn(_)) => true,
        _ => false,
    }
}
