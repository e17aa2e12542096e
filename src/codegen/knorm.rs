//! AST to K-form normalization
//!
//! Converts each type-checked expression into a K-form expression plus a
//! prefix of statements accumulated in evaluation order, substituting
//! generated temporaries for every non-atomic operand.
//!
//! Key lowerings:
//! - `&&`/`||` become `if`-expressions (short-circuit preserved)
//! - string/char `+` becomes the string-concat intrinsic
//! - comprehensions become `KExp::Map` with one clause stage per source
//!   nesting level; `when` guards become `continue` tests in the body
//! - `try/catch` pops the exception into a fresh value and pattern-matches
//!   it in catch mode
//! - variant and exception definitions are registered in a batch before
//!   the module body is lowered, so constructors are available everywhere

use crate::ast::{
    AstDefFun, AstDefRecord, AstDefVariant, AstField, BinOp, Ctor, Exp, ExpKind, ForClause,
    FunFlags, Lit, Member, Pat, PatKind, Type, UnOp, ValFlags,
};
use crate::errors::{internal_err, name_err, pattern_err, type_err, CResult};
use crate::loc::Loc;
use crate::module::Module;
use crate::symtab::{Compilation, Id, Scope, ScopeChain};

use super::kform::*;

/// Per-module normalizer state
pub struct KNormalizer<'a> {
    pub comp: &'a mut Compilation,
    /// `(array, axis)` pairs for the innermost index expressions being
    /// lowered; consumed by the reverse-index operator `.-`
    idx_stack: Vec<(Atom, usize)>,
    in_builtins: bool,
}

/// Result of normalizing one module
pub struct KModule {
    pub stmts: Vec<KExp>,
    pub pragmas: Vec<String>,
}

/// Normalize one module's top-level statements into K-form
pub fn normalize_module(comp: &mut Compilation, module: &Module) -> CResult<KModule> {
    let mut norm =
        KNormalizer { comp, idx_stack: Vec::new(), in_builtins: module.is_builtins() };
    let sc: ScopeChain = vec![Scope::Module(module.sym)];
    let mut pragmas = Vec::new();

    // Type, variant and exception definitions are registered first so
    // constructors and field layouts are visible to every expression in
    // the module regardless of textual order.
    for e in &module.ast {
        match &e.kind {
            ExpKind::DefVariant(id) => norm.register_variant(*id, &sc)?,
            ExpKind::DefExn(id) => norm.register_exn(*id, &sc)?,
            ExpKind::DefTyp(id) => norm.register_typ(*id, &sc)?,
            _ => {}
        }
    }

    let mut code: Vec<KExp> = Vec::new();
    for e in &module.ast {
        if let ExpKind::DirPragma(p) = &e.kind {
            pragmas.push(p.clone());
            continue;
        }
        let ke = norm.exp2kexp(e, &mut code, false, &sc)?;
        if !ke.is_nop() {
            code.push(ke);
        }
    }
    Ok(KModule { stmts: code, pragmas })
}

impl<'a> KNormalizer<'a> {
    // ------------------------------------------------------------------
    // Atomization helpers
    // ------------------------------------------------------------------

    /// Bind a K-expression to a fresh temporary unless it is already an
    /// atom; returns the atom to use in operand position.
    pub(crate) fn kexp2atom(
        &mut self,
        prefix: &str,
        e: KExp,
        tref: bool,
        code: &mut Vec<KExp>,
        sc: &ScopeChain,
    ) -> CResult<Atom> {
        if let Some(a) = e.as_atom() {
            return Ok(a.clone());
        }
        let (typ, loc) = e.ctx();
        if typ.is_void() {
            return Err(type_err(loc, "a void expression cannot be used as a value"));
        }
        let t = self.comp.new_temp(prefix);
        let tref = tref && matches!(e, KExp::Mem(..) | KExp::At(..));
        let flags = ValFlags { tempref: tref, ..ValFlags::default() };
        self.create_defval(t, typ, flags, Some(e), code, sc, loc)?;
        Ok(Atom::Id(t))
    }

    pub(crate) fn exp2atom(
        &mut self,
        e: &Exp,
        code: &mut Vec<KExp>,
        tref: bool,
        sc: &ScopeChain,
    ) -> CResult<(Atom, KTyp)> {
        let ke = self.exp2kexp(e, code, tref, sc)?;
        let typ = ke.typ();
        let a = self.kexp2atom("t", ke, tref, code, sc)?;
        Ok((a, typ))
    }

    /// Lower an expression that must denote an identifier
    pub(crate) fn exp2id(
        &mut self,
        e: &Exp,
        code: &mut Vec<KExp>,
        tref: bool,
        sc: &ScopeChain,
        msg: &str,
    ) -> CResult<Id> {
        let (a, _) = self.exp2atom(e, code, tref, sc)?;
        match a {
            Atom::Id(id) => Ok(id),
            Atom::Lit(_) => Err(type_err(e.loc, msg)),
        }
    }

    /// Register a value definition in the K-form table and, when an
    /// initializer is given, append the `DefVal` statement to `code`.
    pub(crate) fn create_defval(
        &mut self,
        id: Id,
        typ: KTyp,
        flags: ValFlags,
        rhs: Option<KExp>,
        code: &mut Vec<KExp>,
        sc: &ScopeChain,
        loc: Loc,
    ) -> CResult<()> {
        if let KTyp::Err = typ {
            return Err(internal_err(loc, "the type of a value definition is an error type"));
        }
        self.comp.set_k_info(
            id,
            KInfo::Val(KDefVal {
                name: id,
                typ,
                cname: String::new(),
                flags,
                scope: sc.clone(),
                loc,
            }),
        )?;
        if let Some(rhs) = rhs {
            code.push(KExp::DefVal(id, Box::new(rhs), loc));
        }
        Ok(())
    }

    fn set_val_flag(&mut self, id: Id, loc: Loc, f: impl FnOnce(&mut ValFlags)) -> CResult<()> {
        let mut dv = get_kval(self.comp, id, loc)?;
        f(&mut dv.flags);
        self.comp.set_k_info(id, KInfo::Val(dv))
    }

    // ------------------------------------------------------------------
    // Expression lowering
    // ------------------------------------------------------------------

    pub fn exp2kexp(
        &mut self,
        e: &Exp,
        code: &mut Vec<KExp>,
        tref: bool,
        sc: &ScopeChain,
    ) -> CResult<KExp> {
        let loc = e.loc;
        let etyp = typ2ktyp(&e.typ);
        let kctx = KCtx::new(etyp.clone(), loc);
        match &e.kind {
            ExpKind::Lit(l) => Ok(KExp::Atom(Atom::Lit(l.clone()), kctx)),
            ExpKind::Ident(id) => Ok(KExp::Atom(Atom::Id(*id), kctx)),

            ExpKind::Binary(BinOp::LogAnd, e1, e2) => {
                // `a && b` => `if a then b else false`
                let c = self.exp2kexp(e1, code, false, sc)?;
                let mut bcode = Vec::new();
                let b = self.exp2kexp(e2, &mut bcode, false, sc)?;
                Ok(KExp::If(
                    Box::new(c),
                    Box::new(code2kexp(bcode, b)),
                    Box::new(KExp::Atom(Atom::Lit(Lit::Bool(false)), kctx.clone())),
                    kctx,
                ))
            }
            ExpKind::Binary(BinOp::LogOr, e1, e2) => {
                // `a || b` => `if a then true else b`
                let c = self.exp2kexp(e1, code, false, sc)?;
                let mut bcode = Vec::new();
                let b = self.exp2kexp(e2, &mut bcode, false, sc)?;
                Ok(KExp::If(
                    Box::new(c),
                    Box::new(KExp::Atom(Atom::Lit(Lit::Bool(true)), kctx.clone())),
                    Box::new(code2kexp(bcode, b)),
                    kctx,
                ))
            }
            ExpKind::Binary(op, e1, e2) => {
                let (a, at) = self.exp2atom(e1, code, false, sc)?;
                let (b, bt) = self.exp2atom(e2, code, false, sc)?;
                let is_str = |t: &KTyp| matches!(t, KTyp::Str | KTyp::Char);
                if *op == BinOp::Add && is_str(&at) && is_str(&bt) && matches!(etyp, KTyp::Str) {
                    Ok(KExp::Intrin(KIntrin::StrConcat, vec![a, b], kctx))
                } else {
                    Ok(KExp::Binary(*op, a, b, kctx))
                }
            }

            ExpKind::Unary(UnOp::DotMinus, inner) => {
                // `.- i` inside an index: size(arr, axis) - i
                let (arr, axis) = match self.idx_stack.last() {
                    Some(pair) => pair.clone(),
                    None => return Err(reverse_index_err(loc)),
                };
                let (iv, _) = self.exp2atom(inner, code, false, sc)?;
                let sz = KExp::Intrin(
                    KIntrin::GetSize,
                    vec![arr, Atom::Lit(Lit::Int(axis as i64))],
                    KCtx::new(KTyp::Int, loc),
                );
                let sz_a = self.kexp2atom("sz", sz, false, code, sc)?;
                Ok(KExp::Binary(BinOp::Sub, sz_a, iv, kctx))
            }
            ExpKind::Unary(op, e1) => {
                let (a, _) = self.exp2atom(e1, code, false, sc)?;
                Ok(KExp::Unary(*op, a, kctx))
            }

            ExpKind::Seq(elems) => {
                let sc = self.push_block_scope(sc);
                let mut result = KExp::Nop(loc);
                for (i, el) in elems.iter().enumerate() {
                    let ke = self.exp2kexp(el, code, tref && i + 1 == elems.len(), &sc)?;
                    if i + 1 == elems.len() {
                        result = ke;
                    } else if !ke.is_nop() {
                        code.push(ke);
                    }
                }
                Ok(result)
            }

            ExpKind::If(c, t, f) => {
                let ck = self.exp2kexp(c, code, false, sc)?;
                let mut tcode = Vec::new();
                let tk = self.exp2kexp(t, &mut tcode, false, sc)?;
                let mut fcode = Vec::new();
                let fk = self.exp2kexp(f, &mut fcode, false, sc)?;
                Ok(KExp::If(
                    Box::new(ck),
                    Box::new(code2kexp(tcode, tk)),
                    Box::new(code2kexp(fcode, fk)),
                    kctx,
                ))
            }

            ExpKind::Call(f, args) => self.lower_call(f, args, kctx, code, sc),

            ExpKind::MkTuple(elems) => {
                let mut atoms = Vec::with_capacity(elems.len());
                for el in elems {
                    atoms.push(self.exp2atom(el, code, false, sc)?.0);
                }
                Ok(KExp::MkTuple(atoms, kctx))
            }

            ExpKind::MkRecord(ctor, fields) => {
                self.lower_mkrecord(*ctor, fields, &e.typ, kctx, code, sc)
            }

            ExpKind::UpdateRecord(base, updates) => {
                let (ba, bt) = self.exp2atom(base, code, true, sc)?;
                let rid = match &bt {
                    KTyp::Record(rid) => *rid,
                    _ => return Err(type_err(loc, "record update applied to a non-record value")),
                };
                let rec = get_krecord(self.comp, rid, loc)?;
                let mut atoms = Vec::with_capacity(rec.fields.len());
                for (i, fld) in rec.fields.iter().enumerate() {
                    match updates.iter().find(|(n, _)| *n == fld.name) {
                        Some((_, fe)) => atoms.push(self.exp2atom(fe, code, false, sc)?.0),
                        None => {
                            let m = KExp::Mem(
                                ba.clone(),
                                i,
                                KCtx::new(fld.typ.clone(), loc),
                            );
                            atoms.push(self.kexp2atom("f", m, true, code, sc)?);
                        }
                    }
                }
                for (n, _) in updates {
                    if !rec.fields.iter().any(|f| f.name == *n) {
                        let fname = self.comp.id2str(*n);
                        self.comp.push_err(name_err(
                            loc,
                            format!("the record has no field '{}'", fname),
                        ));
                    }
                }
                Ok(KExp::MkRecord(atoms, kctx))
            }

            ExpKind::MkArray(rows) => {
                let mut krows = Vec::with_capacity(rows.len());
                for row in rows {
                    let mut krow = Vec::with_capacity(row.len());
                    for el in row {
                        krow.push(self.exp2atom(el, code, false, sc)?.0);
                    }
                    krows.push(krow);
                }
                Ok(KExp::MkArray(krows, kctx))
            }

            ExpKind::MkList(elems) => {
                // [a, b, c] => a :: b :: c :: []
                let mut acc = Atom::Lit(Lit::Nil);
                for el in elems.iter().rev() {
                    let (ea, _) = self.exp2atom(el, code, false, sc)?;
                    let cons = KExp::Binary(BinOp::Cons, ea, acc, kctx.clone());
                    acc = self.kexp2atom("l", cons, false, code, sc)?;
                }
                Ok(KExp::Atom(acc, kctx))
            }

            ExpKind::Range(a, b, c) => {
                let (ra, rb, rc) = self.lower_range_parts(a, b, c, code, sc)?;
                Ok(KExp::MkTuple(
                    vec![ra, rb, rc],
                    KCtx::new(KTyp::Tuple(vec![KTyp::Int, KTyp::Int, KTyp::Int]), loc),
                ))
            }

            ExpKind::For(clause, body) => {
                let loop_scope = self.comp.new_loop_scope();
                let sc = self.push_scope(loop_scope, sc);
                let mut body_code = Vec::new();
                let (iters, at_ids) =
                    self.lower_for_clause(clause, code, &mut body_code, &sc)?;
                let bk = self.exp2kexp(body, &mut body_code, false, &sc)?;
                let body = code2kexp(body_code, bk);
                Ok(KExp::For(iters, at_ids, Box::new(body), loc))
            }

            ExpKind::While(c, body) => {
                let mut ccode = Vec::new();
                let ck = self.exp2kexp(c, &mut ccode, false, sc)?;
                let cond = code2kexp(ccode, ck);
                let loop_scope = self.comp.new_loop_scope();
                let sc = self.push_scope(loop_scope, sc);
                let mut bcode = Vec::new();
                let bk = self.exp2kexp(body, &mut bcode, false, &sc)?;
                if !bk.is_nop() {
                    bcode.push(bk);
                }
                Ok(KExp::While(Box::new(cond), Box::new(code2kexp(bcode, KExp::Nop(loc))), loc))
            }

            ExpKind::DoWhile(body, c) => {
                // keeps its post-test shape
                let loop_scope = self.comp.new_loop_scope();
                let sc2 = self.push_scope(loop_scope, sc);
                let mut bcode = Vec::new();
                let bk = self.exp2kexp(body, &mut bcode, false, &sc2)?;
                if !bk.is_nop() {
                    bcode.push(bk);
                }
                let mut ccode = Vec::new();
                let ck = self.exp2kexp(c, &mut ccode, false, sc)?;
                Ok(KExp::DoWhile(
                    Box::new(code2kexp(bcode, KExp::Nop(loc))),
                    Box::new(code2kexp(ccode, ck)),
                    loc,
                ))
            }

            ExpKind::Map(clauses, body) => {
                let map_scope = self.comp.new_map_scope();
                let sc = self.push_scope(map_scope, sc);
                let mut stages = Vec::with_capacity(clauses.len());
                // a stage's pattern unpacking runs inside its loop, before
                // the next stage's domains are evaluated
                let mut pending: Vec<KExp> = Vec::new();
                for cl in clauses {
                    let mut pre = std::mem::take(&mut pending);
                    let (iters, at_ids) =
                        self.lower_for_clause(cl, &mut pre, &mut pending, &sc)?;
                    stages.push(KMapClause { pre, iters, at_ids });
                }
                let mut body_code = pending;
                let bk = self.exp2kexp(body, &mut body_code, false, &sc)?;
                let body = code2kexp(body_code, bk);
                Ok(KExp::Map(stages, Box::new(body), kctx))
            }

            ExpKind::Try(body, handlers) => {
                let try_scope = self.comp.new_try_scope();
                let try_sc = self.push_scope(try_scope, sc);
                let mut bcode = Vec::new();
                let bk = self.exp2kexp(body, &mut bcode, false, &try_sc)?;
                let body_k = code2kexp(bcode, bk);

                // the handler pops the current exception into a fresh
                // value and pattern-matches it in catch mode
                let mut hcode = Vec::new();
                let exn_t = self.comp.new_temp("exn");
                let pop = KExp::Intrin(KIntrin::PopExn, Vec::new(), KCtx::new(KTyp::Exn, loc));
                self.create_defval(
                    exn_t,
                    KTyp::Exn,
                    ValFlags::default(),
                    Some(pop),
                    &mut hcode,
                    sc,
                    loc,
                )?;
                let matched = self.transform_pat_matching(
                    Atom::Id(exn_t),
                    KTyp::Exn,
                    handlers,
                    sc,
                    kctx.clone(),
                    true,
                )?;
                let handler_k = code2kexp(hcode, matched);
                Ok(KExp::TryCatch(Box::new(body_k), Box::new(handler_k), kctx))
            }

            ExpKind::Match(scrut, cases) => {
                let (sa, styp) = self.exp2atom(scrut, code, false, sc)?;
                // a mutable scrutinee is copied into an immutable
                // temporary so the tests see a stable value
                let sa = match sa {
                    Atom::Id(id) => {
                        let mutable = matches!(
                            self.comp.k_info_opt(id),
                            Some(KInfo::Val(dv)) if dv.flags.mutable
                        );
                        if mutable {
                            let copy = KExp::Atom(Atom::Id(id), KCtx::new(styp.clone(), loc));
                            self.kexp2atom_forced("m", copy, code, sc)?
                        } else {
                            Atom::Id(id)
                        }
                    }
                    lit => lit,
                };
                self.transform_pat_matching(sa, styp, cases, sc, kctx, false)
            }

            ExpKind::Throw(e1) => {
                let id = self.exp2id(e1, code, false, sc, "a thrown value must be an exception")?;
                Ok(KExp::Throw(id, false, loc))
            }

            ExpKind::Mem(e1, member) => {
                let (a, at) = self.exp2atom(e1, code, true, sc)?;
                let idx = self.member_index(&at, *member, loc)?;
                Ok(KExp::Mem(a, idx, kctx))
            }

            ExpKind::At(arr, idxs) => {
                let (aa, _) = self.exp2atom(arr, code, true, sc)?;
                let mut doms = Vec::with_capacity(idxs.len());
                for (axis, ie) in idxs.iter().enumerate() {
                    self.idx_stack.push((aa.clone(), axis));
                    let dom = self.lower_domain(ie, code, sc);
                    self.idx_stack.pop();
                    doms.push(dom?);
                }
                Ok(KExp::At(aa, doms, kctx))
            }

            ExpKind::Assign(lhs, rhs) => {
                let (ra, _) = self.exp2atom(rhs, code, false, sc)?;
                let is_at = matches!(lhs.kind, ExpKind::At(..));
                let lk = self.exp2kexp(lhs, code, true, sc)?;
                let target = match self.kexp2atom("lv", lk, true, code, sc)? {
                    Atom::Id(id) => id,
                    Atom::Lit(_) => {
                        return Err(type_err(loc, "the left side of '=' must be an identifier"))
                    }
                };
                self.set_val_flag(target, loc, |f| {
                    f.mutable = true;
                    if is_at {
                        f.subarray = true;
                    }
                })?;
                Ok(KExp::Assign(target, ra, loc))
            }

            ExpKind::Cast(e1) => {
                let (a, _) = self.exp2atom(e1, code, false, sc)?;
                Ok(KExp::Cast(a, kctx))
            }

            ExpKind::Typed(e1) => self.exp2kexp(e1, code, tref, sc),

            ExpKind::CCode(s) => Ok(KExp::CCode(s.clone(), kctx)),

            ExpKind::Break => Ok(KExp::Break(loc)),
            ExpKind::Continue => Ok(KExp::Continue(loc)),

            ExpKind::DefVal(pat, rhs, flags) => {
                let rk = self.exp2kexp(rhs, code, false, sc)?;
                self.pat_simple_unpack(pat, rk, *flags, code, sc)?;
                Ok(KExp::Nop(loc))
            }

            ExpKind::DefFun(id) => {
                self.lower_fun(*id, sc)?;
                Ok(KExp::DefFun(*id, loc))
            }

            ExpKind::DefVariant(id) => {
                // module-level definitions were registered by the
                // pre-pass; block-local ones register on first sight.
                // A single-case record variant has been rewritten into a
                // type definition.
                if self.comp.k_info_opt(*id).is_none() {
                    self.register_variant(*id, sc)?;
                }
                match self.comp.k_info(*id, loc)? {
                    KInfo::Typ(_) | KInfo::Record(_) => Ok(KExp::DefTyp(*id, loc)),
                    _ => Ok(KExp::DefVariant(*id, loc)),
                }
            }
            ExpKind::DefTyp(id) => {
                if self.comp.k_info_opt(*id).is_none() {
                    self.register_typ(*id, sc)?;
                }
                Ok(KExp::DefTyp(*id, loc))
            }
            ExpKind::DefExn(id) => {
                if self.comp.k_info_opt(*id).is_none() {
                    self.register_exn(*id, sc)?;
                }
                Ok(KExp::DefExn(*id, loc))
            }

            ExpKind::DirImport(_) | ExpKind::DirPragma(_) => Ok(KExp::Nop(loc)),
        }
    }

    /// Like `kexp2atom` but always introduces a fresh (immutable) value
    fn kexp2atom_forced(
        &mut self,
        prefix: &str,
        e: KExp,
        code: &mut Vec<KExp>,
        sc: &ScopeChain,
    ) -> CResult<Atom> {
        let (typ, loc) = e.ctx();
        let t = self.comp.new_temp(prefix);
        self.create_defval(t, typ, ValFlags::default(), Some(e), code, sc, loc)?;
        Ok(Atom::Id(t))
    }

    fn push_scope(&mut self, s: Scope, sc: &ScopeChain) -> ScopeChain {
        let mut sc2 = Vec::with_capacity(sc.len() + 1);
        sc2.push(s);
        sc2.extend_from_slice(sc);
        sc2
    }

    fn push_block_scope(&mut self, sc: &ScopeChain) -> ScopeChain {
        let s = self.comp.new_block_scope();
        self.push_scope(s, sc)
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn lower_call(
        &mut self,
        f: &Exp,
        args: &[Exp],
        kctx: KCtx,
        code: &mut Vec<KExp>,
        sc: &ScopeChain,
    ) -> CResult<KExp> {
        let loc = kctx.loc;
        // a trailing record literal passed to a function with keyword
        // parameters supplies the trailing arguments in declaration order
        let mut arg_exps: Vec<&Exp> = args.iter().collect();
        let mut kwarg_fields: Vec<Exp> = Vec::new();
        if let ExpKind::Ident(fid) = &f.kind {
            if let Some(crate::ast::AstInfo::Fun(df)) = self.comp.ast_info_opt(*fid) {
                if df.flags.has_keywords {
                    if let Some(Exp { kind: ExpKind::MkRecord(None, fields), .. }) =
                        args.last()
                    {
                        kwarg_fields = fields.iter().map(|(_, fe)| fe.clone()).collect();
                        arg_exps.pop();
                    }
                }
            }
        }

        let mut atoms = Vec::with_capacity(arg_exps.len() + kwarg_fields.len());
        for a in arg_exps {
            atoms.push(self.exp2atom(a, code, false, sc)?.0);
        }
        for a in &kwarg_fields {
            atoms.push(self.exp2atom(a, code, false, sc)?.0);
        }

        let fid = self.exp2id(f, code, false, sc, "the called value must be a function")?;
        Ok(KExp::Call(fid, atoms, kctx))
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    fn lower_mkrecord(
        &mut self,
        ctor: Option<Id>,
        fields: &[(Id, Exp)],
        etyp: &Type,
        kctx: KCtx,
        code: &mut Vec<KExp>,
        sc: &ScopeChain,
    ) -> CResult<KExp> {
        let loc = kctx.loc;
        // a record literal of a variant-case type must go through the
        // case's constructor function; a single-case record variant has
        // already been rewritten into a plain record alias
        if let Type::App(_, vid) = etyp {
            let alias_rid = match self.comp.k_info_opt(*vid) {
                Some(KInfo::Typ(dt)) => match &dt.typ {
                    KTyp::Record(rid) => Some(*rid),
                    _ => None,
                },
                _ => None,
            };
            if let Some(rid) = alias_rid {
                let atoms = self.record_field_atoms(rid, fields, code, sc, loc)?;
                return Ok(KExp::MkRecord(atoms, KCtx::new(KTyp::Record(rid), loc)));
            }
            let ctor = match ctor {
                Some(c) => c,
                None => {
                    return Err(type_err(
                        loc,
                        "a variant-case record literal requires a constructor",
                    ))
                }
            };
            let dvar = get_kvariant(self.comp, *vid, loc)?;
            let case_idx = dvar
                .cases
                .iter()
                .position(|(cid, _)| *cid == ctor)
                .ok_or_else(|| name_err(loc, "unknown variant case"))?;
            let rid = match &dvar.cases[case_idx].1 {
                KTyp::Record(rid) => *rid,
                _ => return Err(type_err(loc, "the variant case does not carry a record")),
            };
            let atoms = self.record_field_atoms(rid, fields, code, sc, loc)?;
            return Ok(KExp::Call(dvar.ctors[case_idx], atoms, kctx));
        }

        let rid = match kctx.typ {
            KTyp::Record(rid) => rid,
            _ => return Err(type_err(loc, "record literal of a non-record type")),
        };
        let atoms = self.record_field_atoms(rid, fields, code, sc, loc)?;
        Ok(KExp::MkRecord(atoms, kctx))
    }

    /// One atom per declared field, taken from the literal or from the
    /// field's declared default
    fn record_field_atoms(
        &mut self,
        rid: Id,
        fields: &[(Id, Exp)],
        code: &mut Vec<KExp>,
        sc: &ScopeChain,
        loc: Loc,
    ) -> CResult<Vec<Atom>> {
        let rec = get_krecord(self.comp, rid, loc)?;
        let mut atoms = Vec::with_capacity(rec.fields.len());
        for fld in &rec.fields {
            match fields.iter().find(|(n, _)| *n == fld.name) {
                Some((_, fe)) => atoms.push(self.exp2atom(fe, code, false, sc)?.0),
                None => match &fld.default {
                    Some(d) => atoms.push(Atom::Lit(d.clone())),
                    None => {
                        let fname = self.comp.id2str(fld.name);
                        self.comp.push_err(name_err(
                            loc,
                            format!("field '{}' is not initialized and has no default", fname),
                        ));
                        atoms.push(Atom::Lit(Lit::Nil));
                    }
                },
            }
        }
        for (n, _) in fields {
            if !rec.fields.iter().any(|f| f.name == *n) {
                let fname = self.comp.id2str(*n);
                self.comp
                    .push_err(name_err(loc, format!("the record has no field '{}'", fname)));
            }
        }
        Ok(atoms)
    }

    fn member_index(&mut self, at: &KTyp, member: Member, loc: Loc) -> CResult<usize> {
        match (at, member) {
            (_, Member::Tup(i)) => Ok(i),
            (KTyp::Record(rid), Member::Field(fid)) => {
                let rec = get_krecord(self.comp, *rid, loc)?;
                rec.fields.iter().position(|f| f.name == fid).ok_or_else(|| {
                    name_err(loc, format!("the record has no field '{}'", self.comp.id2str(fid)))
                })
            }
            _ => Err(type_err(loc, "field access on a non-record value")),
        }
    }

    // ------------------------------------------------------------------
    // Loops and comprehensions
    // ------------------------------------------------------------------

    fn lower_range_parts(
        &mut self,
        a: &Option<Box<Exp>>,
        b: &Option<Box<Exp>>,
        c: &Option<Box<Exp>>,
        code: &mut Vec<KExp>,
        sc: &ScopeChain,
    ) -> CResult<(Atom, Atom, Atom)> {
        let ra = match a {
            Some(e) => self.exp2atom(e, code, false, sc)?.0,
            None => Atom::Lit(Lit::Int(0)),
        };
        let rb = match b {
            Some(e) => self.exp2atom(e, code, false, sc)?.0,
            None => Atom::Lit(Lit::Nil),
        };
        let rc = match c {
            Some(e) => self.exp2atom(e, code, false, sc)?.0,
            None => Atom::Lit(Lit::Int(1)),
        };
        Ok((ra, rb, rc))
    }

    fn lower_domain(
        &mut self,
        e: &Exp,
        code: &mut Vec<KExp>,
        sc: &ScopeChain,
    ) -> CResult<Dom> {
        if let ExpKind::Range(a, b, c) = &e.kind {
            let (ra, rb, rc) = self.lower_range_parts(a, b, c, code, sc)?;
            return Ok(Dom::Range(ra, rb, rc));
        }
        let (a, _) = self.exp2atom(e, code, false, sc)?;
        Ok(Dom::Elem(a))
    }

    /// Element type produced by iterating a domain
    fn domain_elem_typ(&self, dom: &Dom, loc: Loc) -> CResult<KTyp> {
        match dom {
            Dom::Range(..) => Ok(KTyp::Int),
            Dom::Elem(a) => match get_atom_ktyp(self.comp, a, loc)? {
                KTyp::Array(_, elt) => Ok(*elt),
                KTyp::List(elt) => Ok(*elt),
                KTyp::Str => Ok(KTyp::Char),
                KTyp::Tuple(_) => Err(type_err(loc, "cannot iterate over a tuple")),
                other => Err(type_err(loc, format!("cannot iterate a value of type {:?}", other))),
            },
        }
    }

    /// Lower one loop/comprehension clause: the iteration bindings go to
    /// `pre_code`, the pattern unpacking (`val pat = i`) and the guard
    /// test go to `body_code`.
    fn lower_for_clause(
        &mut self,
        cl: &ForClause,
        pre_code: &mut Vec<KExp>,
        body_code: &mut Vec<KExp>,
        sc: &ScopeChain,
    ) -> CResult<(Vec<(Id, Dom)>, Vec<Id>)> {
        let mut iters = Vec::with_capacity(cl.iters.len());
        for (pat, iter) in &cl.iters {
            let loc = pat.loc;
            let dom = self.lower_domain(iter, pre_code, sc)?;
            let elem_typ = self.domain_elem_typ(&dom, loc)?;
            // each binding iterates through a proxy; the pattern is
            // unpacked inside the loop body
            let proxy = match &pat.kind {
                PatKind::Ident(id) => {
                    self.create_defval(
                        *id,
                        elem_typ,
                        ValFlags::default(),
                        None,
                        body_code,
                        sc,
                        loc,
                    )?;
                    *id
                }
                PatKind::Any => {
                    let i = self.comp.new_temp("i");
                    self.create_defval(i, elem_typ, ValFlags::default(), None, body_code, sc, loc)?;
                    i
                }
                _ => {
                    let i = self.comp.new_temp("i");
                    self.create_defval(
                        i,
                        elem_typ.clone(),
                        ValFlags::default(),
                        None,
                        body_code,
                        sc,
                        loc,
                    )?;
                    let rhs = KExp::Atom(Atom::Id(i), KCtx::new(elem_typ, loc));
                    self.pat_simple_unpack(pat, rhs, ValFlags::default(), body_code, sc)?;
                    i
                }
            };
            iters.push((proxy, dom));
        }

        let at_ids = self.lower_at_indices(&cl.at_idx, body_code, sc)?;

        if let Some(g) = &cl.guard {
            // `when g` => `if !g { continue }` at the head of the body
            let loc = g.loc;
            let mut gcode = Vec::new();
            let gk = self.exp2kexp(g, &mut gcode, false, sc)?;
            let cond = code2kexp(gcode, gk);
            body_code.push(KExp::If(
                Box::new(cond),
                Box::new(KExp::Nop(loc)),
                Box::new(KExp::Continue(loc)),
                KCtx::new(KTyp::Void, loc),
            ));
        }

        Ok((iters, at_ids))
    }

    /// `@`-indices of a loop clause: nothing for `_`, one id for a typed
    /// int ident, one fresh id per axis for a tuple (bundled back into
    /// the named tuple inside the body)
    fn lower_at_indices(
        &mut self,
        at_idx: &Pat,
        body_code: &mut Vec<KExp>,
        sc: &ScopeChain,
    ) -> CResult<Vec<Id>> {
        let loc = at_idx.loc;
        let pat = match &at_idx.kind {
            PatKind::Typed(p, _) => p.as_ref(),
            _ => at_idx,
        };
        match &pat.kind {
            PatKind::Any => Ok(Vec::new()),
            PatKind::Ident(id) => {
                self.create_defval(*id, KTyp::Int, ValFlags::default(), None, body_code, sc, loc)?;
                Ok(vec![*id])
            }
            PatKind::Tuple(elems) => {
                let mut ids = Vec::with_capacity(elems.len());
                let mut atoms = Vec::with_capacity(elems.len());
                for _ in elems {
                    let i = self.comp.new_temp("idx");
                    self.create_defval(i, KTyp::Int, ValFlags::default(), None, body_code, sc, loc)?;
                    ids.push(i);
                    atoms.push(Atom::Id(i));
                }
                let tup_t = KTyp::Tuple(vec![KTyp::Int; elems.len()]);
                let tup = KExp::MkTuple(atoms, KCtx::new(tup_t.clone(), loc));
                let tup_pat = Pat::new(PatKind::Tuple(elems.clone()), loc);
                self.pat_simple_unpack(&tup_pat, tup, ValFlags::default(), body_code, sc)?;
                Ok(ids)
            }
            _ => Err(pattern_err(loc, "an @-index must be '_', an int name or a tuple of names")),
        }
    }

    // ------------------------------------------------------------------
    // Irrefutable unpacking (val definitions, loop patterns, parameters)
    // ------------------------------------------------------------------

    /// Unpack `val pat = rhs` into per-binder value definitions. Only
    /// irrefutable patterns are accepted here; anything that can fail at
    /// runtime must go through `match`. A pattern binding nothing keeps
    /// `rhs` for its side effects but emits no binding.
    pub(crate) fn pat_simple_unpack(
        &mut self,
        pat: &Pat,
        rhs: KExp,
        flags: ValFlags,
        code: &mut Vec<KExp>,
        sc: &ScopeChain,
    ) -> CResult<()> {
        let loc = pat.loc;
        match &pat.kind {
            PatKind::Any => {
                let (typ, _) = rhs.ctx();
                if !typ.is_void() || !rhs.is_nop() {
                    if !matches!(rhs, KExp::Atom(..)) {
                        code.push(rhs);
                    }
                }
                Ok(())
            }
            PatKind::Ident(id) => {
                let (typ, _) = rhs.ctx();
                self.create_defval(*id, typ, flags, Some(rhs), code, sc, loc)
            }
            PatKind::Typed(p, _) => self.pat_simple_unpack(p, rhs, flags, code, sc),
            PatKind::As(p, id) => {
                let (typ, rloc) = rhs.ctx();
                self.create_defval(*id, typ.clone(), flags, Some(rhs), code, sc, loc)?;
                let alias = KExp::Atom(Atom::Id(*id), KCtx::new(typ, rloc));
                self.pat_simple_unpack(p, alias, flags, code, sc)
            }
            PatKind::Tuple(elems) => {
                let (typ, rloc) = rhs.ctx();
                let elem_typs = match &typ {
                    KTyp::Tuple(ts) => ts.clone(),
                    _ => return Err(type_err(loc, "tuple pattern against a non-tuple value")),
                };
                if elem_typs.len() != elems.len() {
                    return Err(type_err(loc, "tuple pattern arity mismatch"));
                }
                let a = self.kexp2atom("tup", rhs, true, code, sc)?;
                for (i, (p, t)) in elems.iter().zip(elem_typs).enumerate() {
                    let m = KExp::Mem(a.clone(), i, KCtx::new(t, rloc));
                    self.pat_simple_unpack(p, m, ValFlags::default(), code, sc)?;
                }
                Ok(())
            }
            PatKind::Record(_, fields) => {
                let (typ, rloc) = rhs.ctx();
                let rid = match &typ {
                    KTyp::Record(rid) => *rid,
                    _ => {
                        return Err(pattern_err(
                            loc,
                            "a record pattern is only irrefutable against a plain record",
                        ))
                    }
                };
                let rec = get_krecord(self.comp, rid, loc)?;
                let a = self.kexp2atom("rec", rhs, true, code, sc)?;
                for (fname, p) in fields {
                    let idx = rec
                        .fields
                        .iter()
                        .position(|f| f.name == *fname)
                        .ok_or_else(|| {
                            name_err(
                                loc,
                                format!("the record has no field '{}'", self.comp.id2str(*fname)),
                            )
                        })?;
                    let ftyp = rec.fields[idx].typ.clone();
                    let m = KExp::Mem(a.clone(), idx, KCtx::new(ftyp, rloc));
                    self.pat_simple_unpack(p, m, ValFlags::default(), code, sc)?;
                }
                Ok(())
            }
            PatKind::Ref(p) => {
                let (typ, rloc) = rhs.ctx();
                let elt = match &typ {
                    KTyp::Ref(elt) => (**elt).clone(),
                    _ => return Err(type_err(loc, "ref pattern against a non-ref value")),
                };
                let a = self.kexp2atom("r", rhs, true, code, sc)?;
                let deref = KExp::Unary(UnOp::Deref, a, KCtx::new(elt, rloc));
                self.pat_simple_unpack(p, deref, ValFlags::default(), code, sc)
            }
            PatKind::Variant(_, _) | PatKind::Cons(..) | PatKind::Lit(_) | PatKind::When(..) => {
                Err(pattern_err(
                    loc,
                    "this pattern can fail at runtime; use 'match' to destructure it",
                ))
            }
        }
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    fn lower_fun(&mut self, id: Id, sc: &ScopeChain) -> CResult<()> {
        let df = match self.comp.ast_info(id, Loc::NONE)? {
            crate::ast::AstInfo::Fun(df) => df.clone(),
            _ => return Err(internal_err(Loc::NONE, "DefFun id does not name a function")),
        };
        let AstDefFun { name, params, param_typs, rt, body, flags, loc, .. } = *df;
        let fun_sc = self.push_scope(Scope::Fun(name), sc);

        let mut body_code = Vec::new();
        let mut kparams = Vec::with_capacity(params.len());
        for (i, p) in params.iter().enumerate() {
            let ptyp = typ2ktyp(&param_typs[i]);
            let pid = match &p.kind {
                PatKind::Ident(pid) => {
                    self.create_defval(
                        *pid,
                        ptyp.clone(),
                        ValFlags { arg: true, ..ValFlags::default() },
                        None,
                        &mut body_code,
                        &fun_sc,
                        p.loc,
                    )?;
                    *pid
                }
                _ => {
                    // complex parameter patterns unpack at function entry
                    let t = self.comp.new_temp("arg");
                    self.create_defval(
                        t,
                        ptyp.clone(),
                        ValFlags { arg: true, ..ValFlags::default() },
                        None,
                        &mut body_code,
                        &fun_sc,
                        p.loc,
                    )?;
                    let rhs = KExp::Atom(Atom::Id(t), KCtx::new(ptyp.clone(), p.loc));
                    self.pat_simple_unpack(p, rhs, ValFlags::default(), &mut body_code, &fun_sc)?;
                    t
                }
            };
            kparams.push((pid, ptyp));
        }

        let bk = self.exp2kexp(&body, &mut body_code, false, &fun_sc)?;
        let kbody = code2kexp(body_code, bk);

        self.comp.set_k_info(
            id,
            KInfo::Fun(Box::new(KDefFun {
                name,
                cname: String::new(),
                params: kparams,
                rt: typ2ktyp(&rt),
                body: kbody,
                flags,
                closure: KClosure::default(),
                scope: sc.clone(),
                loc,
            })),
        )
    }

    fn register_record(&mut self, rec: &AstDefRecord) -> CResult<()> {
        let fields = rec
            .fields
            .iter()
            .map(|AstField { name, typ, default }| KField {
                name: *name,
                typ: typ2ktyp(typ),
                default: default.clone(),
            })
            .collect();
        self.comp.set_k_info(
            rec.name,
            KInfo::Record(KDefRecord {
                name: rec.name,
                cname: String::new(),
                targs: rec.targs.iter().map(typ2ktyp).collect(),
                fields,
                scope: rec.scope.clone(),
                loc: rec.loc,
            }),
        )
    }

    /// Register a variant definition, its constructors and (for record
    /// cases) the lifted named records
    fn register_variant(&mut self, id: Id, sc: &ScopeChain) -> CResult<()> {
        let dvar = match self.comp.ast_info(id, Loc::NONE)? {
            crate::ast::AstInfo::Variant(dv) => dv.clone(),
            _ => return Err(internal_err(Loc::NONE, "DefVariant id does not name a variant")),
        };
        let AstDefVariant { name, targs, cases, flags, loc, .. } = dvar;

        // record types embedded in the cases are lifted to named records
        for (_, ptyp) in &cases {
            if let Type::Record(rid) = ptyp {
                if self.comp.k_info_opt(*rid).is_none() {
                    let rec = match self.comp.ast_info(*rid, loc)? {
                        crate::ast::AstInfo::Record(r) => r.clone(),
                        _ => return Err(internal_err(loc, "variant case names a non-record")),
                    };
                    self.register_record(&rec)?;
                }
            }
        }

        // a single-case record variant becomes a plain type definition
        if cases.len() == 1 && flags.record {
            let (_, ptyp) = &cases[0];
            return self.comp.set_k_info(
                id,
                KInfo::Typ(KDefTyp {
                    name,
                    cname: String::new(),
                    targs: targs.iter().map(typ2ktyp).collect(),
                    typ: typ2ktyp(ptyp),
                    scope: sc.clone(),
                    loc,
                }),
            );
        }

        let kcases: Vec<(Id, KTyp)> =
            cases.iter().map(|(cid, t)| (*cid, typ2ktyp(t))).collect();

        // constructors: payload-free cases become tag values, cases with
        // payload get a constructor function registered under the case id
        let mut ctors = Vec::with_capacity(kcases.len());
        for (cid, ptyp) in &kcases {
            if ptyp.is_void() {
                self.comp.set_k_info(
                    *cid,
                    KInfo::Val(KDefVal {
                        name: *cid,
                        typ: KTyp::Name(name),
                        cname: String::new(),
                        flags: ValFlags { ctor: true, ..ValFlags::default() },
                        scope: sc.clone(),
                        loc,
                    }),
                )?;
            } else {
                let params = match ptyp {
                    KTyp::Tuple(elts) => elts.clone(),
                    t => vec![t.clone()],
                };
                let kparams = params
                    .into_iter()
                    .map(|t| (self.comp.new_temp("a"), t))
                    .collect::<Vec<_>>();
                for (pid, pt) in &kparams {
                    self.create_defval(
                        *pid,
                        pt.clone(),
                        ValFlags { arg: true, ..ValFlags::default() },
                        None,
                        &mut Vec::new(),
                        sc,
                        loc,
                    )?;
                }
                self.comp.set_k_info(
                    *cid,
                    KInfo::Fun(Box::new(KDefFun {
                        name: *cid,
                        cname: String::new(),
                        params: kparams,
                        rt: KTyp::Name(name),
                        body: KExp::Nop(loc),
                        flags: FunFlags {
                            nothrow: true,
                            ctor: Ctor::Variant(name),
                            ..FunFlags::default()
                        },
                        closure: KClosure::default(),
                        scope: sc.clone(),
                        loc,
                    })),
                )?;
            }
            ctors.push(*cid);
        }

        self.comp.set_k_info(
            id,
            KInfo::Variant(KDefVariant {
                name,
                cname: String::new(),
                targs: targs.iter().map(typ2ktyp).collect(),
                cases: kcases,
                ctors,
                flags: KVariantFlags {
                    recursive: flags.recursive,
                    record: flags.record,
                    opt: flags.opt,
                    nil_case: None,
                    have_tag: true,
                },
                scope: sc.clone(),
                loc,
            }),
        )
    }

    fn register_exn(&mut self, id: Id, sc: &ScopeChain) -> CResult<()> {
        let de = match self.comp.ast_info(id, Loc::NONE)? {
            crate::ast::AstInfo::Exn(de) => de.clone(),
            _ => return Err(internal_err(Loc::NONE, "DefExn id does not name an exception")),
        };
        let typ = typ2ktyp(&de.typ);
        self.comp.set_k_info(
            id,
            KInfo::Exn(KDefExn {
                name: de.name,
                cname: String::new(),
                typ,
                tag: 0,
                scope: sc.clone(),
                loc: de.loc,
            }),
        )?;
        if self.in_builtins {
            let nm = self.comp.id2str(de.name);
            match nm.as_str() {
                "NoMatchError" => self.comp.no_match_error = id,
                "OutOfRangeError" => self.comp.out_of_range_error = id,
                _ => {}
            }
        }
        Ok(())
    }

    fn register_typ(&mut self, id: Id, sc: &ScopeChain) -> CResult<()> {
        match self.comp.ast_info(id, Loc::NONE)? {
            crate::ast::AstInfo::Typ(dt) => {
                let dt = dt.clone();
                self.comp.set_k_info(
                    id,
                    KInfo::Typ(KDefTyp {
                        name: dt.name,
                        cname: String::new(),
                        targs: dt.targs.iter().map(typ2ktyp).collect(),
                        typ: typ2ktyp(&dt.typ),
                        scope: sc.clone(),
                        loc: dt.loc,
                    }),
                )
            }
            crate::ast::AstInfo::Record(rec) => {
                let rec = rec.clone();
                self.register_record(&rec)
            }
            _ => Err(internal_err(Loc::NONE, "DefTyp id does not name a type")),
        }
    }
}

fn reverse_index_err(loc: Loc) -> crate::errors::CompileError {
    type_err(loc, "the reverse index '.-' is only valid inside an index expression")
}
