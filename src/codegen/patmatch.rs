//! Pattern-matching compilation
//!
//! Lowers a `match` (or a `catch` handler) over an atomic scrutinee into a
//! `KExp::Match`: one `(checks, body)` entry per case, where each check is
//! a boolean K-expression possibly carrying its own extraction code.
//!
//! Sub-patterns of a case are processed through three worklists:
//!
//! 1. checks that bind nothing (literals jump the queue: they are the
//!    cheapest tests, so they run first);
//! 2. checks that also bind variables;
//! 3. pure captures.
//!
//! Variant tags are extracted once per scrutinee and memoized. `when`
//! guards are appended as the final check of their case after every
//! sub-pattern has been handled. In catch mode the fallthrough case
//! rethrows the scrutinee; otherwise it throws `NoMatchError`.

use std::collections::{HashMap, VecDeque};

use crate::ast::{BinOp, Exp, Lit, MatchCase, Pat, PatKind, UnOp, ValFlags};
use crate::errors::{name_err, pattern_err, type_err, CResult};
use crate::loc::Loc;
use crate::symtab::{Id, ScopeChain};

use super::kform::*;
use super::knorm::KNormalizer;

/// One sub-pattern waiting to be processed: the pattern, the type of the
/// value it matches, and the K-expression that produces that value
struct PatInfo {
    pat: Pat,
    typ: KTyp,
    exp: KExp,
}

/// Per-case compilation state
struct CaseCtx {
    /// Completed checks, in test order
    checks: Vec<KExp>,
    /// Extraction/binding code accumulated since the last check
    code: Vec<KExp>,
    /// `when` guards, lowered after the worklists drain
    guards: Vec<Exp>,
    /// scrutinee id -> memoized tag temporary
    tags: HashMap<Id, Id>,
    need_check_no_vars: VecDeque<PatInfo>,
    need_check_with_vars: VecDeque<PatInfo>,
    no_check_with_vars: Vec<PatInfo>,
}

impl CaseCtx {
    fn new() -> Self {
        CaseCtx {
            checks: Vec::new(),
            code: Vec::new(),
            guards: Vec::new(),
            tags: HashMap::new(),
            need_check_no_vars: VecDeque::new(),
            need_check_with_vars: VecDeque::new(),
            no_check_with_vars: Vec::new(),
        }
    }

    fn next(&mut self) -> Option<PatInfo> {
        self.need_check_no_vars
            .pop_front()
            .or_else(|| self.need_check_with_vars.pop_front())
            .or_else(|| self.no_check_with_vars.pop())
    }

    /// Flush the pending code into a check expression
    fn push_check(&mut self, cmp: KExp) {
        let code = std::mem::take(&mut self.code);
        self.checks.push(code2kexp(code, cmp));
    }
}

/// Does matching this pattern require a runtime test?
fn pat_needs_checks(comp: &crate::symtab::Compilation, p: &Pat, typ: &KTyp) -> bool {
    match &p.kind {
        PatKind::Any | PatKind::Ident(_) => false,
        PatKind::Lit(_) | PatKind::Cons(..) | PatKind::When(..) => true,
        PatKind::As(p, _) | PatKind::Typed(p, _) | PatKind::Ref(p) => {
            pat_needs_checks(comp, p, typ)
        }
        PatKind::Tuple(elems) => match typ {
            KTyp::Tuple(ts) => elems
                .iter()
                .zip(ts)
                .any(|(p, t)| pat_needs_checks(comp, p, t)),
            _ => false,
        },
        PatKind::Variant(..) => match typ {
            KTyp::Exn => true,
            KTyp::Name(vid) => match comp.k_info_opt(*vid) {
                Some(KInfo::Variant(dv)) => dv.cases.len() > 1,
                _ => false,
            },
            _ => false,
        },
        PatKind::Record(rn, fields) => {
            // resolve the record the fields belong to, so nested compound
            // sub-patterns classify against their declared field types
            let mut rec_id = match typ {
                KTyp::Record(rid) => Some(*rid),
                _ => None,
            };
            if let (Some(case_id), KTyp::Name(vid)) = (rn, typ) {
                if let Some(KInfo::Variant(dv)) = comp.k_info_opt(*vid) {
                    rec_id = dv
                        .cases
                        .iter()
                        .find(|(cid, _)| cid == case_id)
                        .and_then(|(_, pt)| match pt {
                            KTyp::Record(rid) => Some(*rid),
                            _ => None,
                        });
                    if dv.cases.len() > 1 {
                        return true;
                    }
                }
            }
            match rec_id {
                Some(rid) => fields.iter().any(|(fname, p)| {
                    match record_field_typ(comp, rid, *fname) {
                        Some(ftyp) => pat_needs_checks(comp, p, &ftyp),
                        // unknown field: keep the pattern queued so
                        // processing reports it
                        None => true,
                    }
                }),
                None => !fields.is_empty(),
            }
        }
    }
}

/// Declared type of a record field, if both resolve
fn record_field_typ(comp: &crate::symtab::Compilation, rid: Id, fname: Id) -> Option<KTyp> {
    match comp.k_info_opt(rid) {
        Some(KInfo::Record(dr)) => {
            dr.fields.iter().find(|f| f.name == fname).map(|f| f.typ.clone())
        }
        _ => None,
    }
}

fn pat_has_vars(p: &Pat) -> bool {
    match &p.kind {
        PatKind::Any | PatKind::Lit(_) => false,
        PatKind::Ident(_) | PatKind::As(..) => true,
        PatKind::Typed(p, _) | PatKind::Ref(p) | PatKind::When(p, _) => pat_has_vars(p),
        PatKind::Tuple(elems) => elems.iter().any(pat_has_vars),
        PatKind::Record(_, fields) => fields.iter().any(|(_, p)| pat_has_vars(p)),
        PatKind::Variant(_, args) => args.iter().any(pat_has_vars),
        PatKind::Cons(h, t) => pat_has_vars(h) || pat_has_vars(t),
    }
}

impl<'a> KNormalizer<'a> {
    /// Lower `match`/`catch` cases over the scrutinee atom `a` into a
    /// `KExp::Match`. `kctx` is the type/location of the whole match.
    pub(crate) fn transform_pat_matching(
        &mut self,
        a: Atom,
        atyp: KTyp,
        cases: &[MatchCase],
        sc: &ScopeChain,
        kctx: KCtx,
        catch_mode: bool,
    ) -> CResult<KExp> {
        let loc = kctx.loc;
        let mut kcases: Vec<KCase> = Vec::new();
        let mut have_irrefutable = false;
        let mut reported_unreachable = false;

        for case in cases {
            for pat in &case.pats {
                if have_irrefutable {
                    if !reported_unreachable {
                        self.comp.push_err(pattern_err(
                            pat.loc,
                            "unreachable match case: a preceding case matches everything",
                        ));
                        reported_unreachable = true;
                    }
                    continue;
                }

                let mut cctx = CaseCtx::new();
                self.dispatch_pat(
                    &mut cctx,
                    PatInfo {
                        pat: pat.clone(),
                        typ: atyp.clone(),
                        exp: KExp::Atom(a.clone(), KCtx::new(atyp.clone(), pat.loc)),
                    },
                );
                while let Some(pi) = cctx.next() {
                    self.process_pat(&mut cctx, pi, sc)?;
                }

                // guards are the final checks of the case
                let guards = std::mem::take(&mut cctx.guards);
                for g in &guards {
                    let gk = self.exp2kexp(g, &mut cctx.code, false, sc)?;
                    cctx.push_check(gk);
                }

                let mut body_code = std::mem::take(&mut cctx.code);
                let bk = self.exp2kexp(&case.body, &mut body_code, false, sc)?;
                let body = code2kexp(body_code, bk);

                if cctx.checks.is_empty() {
                    have_irrefutable = true;
                }
                kcases.push(KCase { checks: cctx.checks, body });
            }
        }

        // fallthrough: rethrow in catch mode, otherwise NoMatchError
        if !have_irrefutable {
            let fall = if catch_mode {
                match &a {
                    Atom::Id(id) => KExp::Throw(*id, true, loc),
                    Atom::Lit(_) => {
                        return Err(type_err(loc, "the caught exception must be a value"))
                    }
                }
            } else {
                KExp::Throw(self.comp.no_match_error, false, loc)
            };
            kcases.push(KCase { checks: Vec::new(), body: fall });
        }

        Ok(KExp::Match(kcases, kctx))
    }

    /// Classify a sub-pattern onto the appropriate worklist
    fn dispatch_pat(&mut self, cctx: &mut CaseCtx, pi: PatInfo) {
        let needs = pat_needs_checks(self.comp, &pi.pat, &pi.typ);
        let vars = pat_has_vars(&pi.pat);
        match (needs, vars) {
            (true, false) => {
                if matches!(pi.pat.kind, PatKind::Lit(_)) {
                    cctx.need_check_no_vars.push_front(pi);
                } else {
                    cctx.need_check_no_vars.push_back(pi);
                }
            }
            (true, true) => cctx.need_check_with_vars.push_back(pi),
            (false, true) => cctx.no_check_with_vars.push(pi),
            (false, false) => {
                // nothing to test, nothing to bind
            }
        }
    }

    fn pat_scrut_atom(&mut self, cctx: &mut CaseCtx, exp: KExp, sc: &ScopeChain) -> CResult<Atom> {
        self.kexp2atom("p", exp, true, &mut cctx.code, sc)
    }

    /// Tag of a variant/exception scrutinee, extracted once per scrutinee
    fn pat_tag_atom(
        &mut self,
        cctx: &mut CaseCtx,
        scrut: &Atom,
        sc: &ScopeChain,
        loc: Loc,
    ) -> CResult<Atom> {
        if let Atom::Id(sid) = scrut {
            if let Some(t) = cctx.tags.get(sid) {
                return Ok(Atom::Id(*t));
            }
        }
        let tag_e = KExp::Intrin(
            KIntrin::VariantTag,
            vec![scrut.clone()],
            KCtx::new(KTyp::Int, loc),
        );
        let t = self.kexp2atom("tag", tag_e, false, &mut cctx.code, sc)?;
        if let (Atom::Id(sid), Atom::Id(tid)) = (scrut, &t) {
            cctx.tags.insert(*sid, *tid);
        }
        Ok(t)
    }

    fn process_pat(&mut self, cctx: &mut CaseCtx, pi: PatInfo, sc: &ScopeChain) -> CResult<()> {
        let loc = pi.pat.loc;
        match pi.pat.kind.clone() {
            PatKind::Any => Ok(()),

            PatKind::Ident(id) => self.create_defval(
                id,
                pi.typ,
                ValFlags::default(),
                Some(pi.exp),
                &mut cctx.code,
                sc,
                loc,
            ),

            PatKind::Typed(p, _) => {
                self.dispatch_pat(cctx, PatInfo { pat: (*p).clone(), typ: pi.typ, exp: pi.exp });
                Ok(())
            }

            PatKind::As(p, id) => {
                // bind the name to the whole value (copy semantics), then
                // match the inner pattern against it
                self.create_defval(
                    id,
                    pi.typ.clone(),
                    ValFlags::default(),
                    Some(pi.exp),
                    &mut cctx.code,
                    sc,
                    loc,
                )?;
                let alias = KExp::Atom(Atom::Id(id), KCtx::new(pi.typ.clone(), loc));
                self.dispatch_pat(cctx, PatInfo { pat: (*p).clone(), typ: pi.typ, exp: alias });
                Ok(())
            }

            PatKind::Lit(l) => {
                let a = self.pat_scrut_atom(cctx, pi.exp, sc)?;
                let cmp = KExp::Binary(
                    BinOp::Eq,
                    a,
                    Atom::Lit(l),
                    KCtx::new(KTyp::Bool, loc),
                );
                cctx.push_check(cmp);
                Ok(())
            }

            PatKind::Cons(hd, tl) => {
                let elt = match &pi.typ {
                    KTyp::List(elt) => (**elt).clone(),
                    _ => return Err(type_err(loc, "cons pattern against a non-list value")),
                };
                let a = self.pat_scrut_atom(cctx, pi.exp, sc)?;
                let cmp = KExp::Binary(
                    BinOp::Ne,
                    a.clone(),
                    Atom::Lit(Lit::Nil),
                    KCtx::new(KTyp::Bool, loc),
                );
                cctx.push_check(cmp);
                let head = KExp::Intrin(
                    KIntrin::ListHead,
                    vec![a.clone()],
                    KCtx::new(elt.clone(), loc),
                );
                self.dispatch_pat(cctx, PatInfo { pat: (*hd).clone(), typ: elt, exp: head });
                let tail = KExp::Intrin(
                    KIntrin::ListTail,
                    vec![a],
                    KCtx::new(pi.typ.clone(), loc),
                );
                self.dispatch_pat(cctx, PatInfo { pat: (*tl).clone(), typ: pi.typ, exp: tail });
                Ok(())
            }

            PatKind::Tuple(elems) => {
                let ts = match &pi.typ {
                    KTyp::Tuple(ts) => ts.clone(),
                    _ => return Err(type_err(loc, "tuple pattern against a non-tuple value")),
                };
                if ts.len() != elems.len() {
                    return Err(type_err(loc, "tuple pattern arity mismatch"));
                }
                let a = self.pat_scrut_atom(cctx, pi.exp, sc)?;
                for (i, (p, t)) in elems.into_iter().zip(ts).enumerate() {
                    let m = KExp::Mem(a.clone(), i, KCtx::new(t.clone(), loc));
                    self.dispatch_pat(cctx, PatInfo { pat: p, typ: t, exp: m });
                }
                Ok(())
            }

            PatKind::Ref(p) => {
                let elt = match &pi.typ {
                    KTyp::Ref(elt) => (**elt).clone(),
                    _ => return Err(type_err(loc, "ref pattern against a non-ref value")),
                };
                let a = self.pat_scrut_atom(cctx, pi.exp, sc)?;
                let deref = KExp::Unary(UnOp::Deref, a, KCtx::new(elt.clone(), loc));
                self.dispatch_pat(cctx, PatInfo { pat: (*p).clone(), typ: elt, exp: deref });
                Ok(())
            }

            PatKind::When(p, guard) => {
                cctx.guards.push((*guard).clone());
                self.dispatch_pat(cctx, PatInfo { pat: (*p).clone(), typ: pi.typ, exp: pi.exp });
                Ok(())
            }

            PatKind::Variant(vn, args) => {
                self.process_variant_pat(cctx, vn, &args, None, pi.typ, pi.exp, sc, loc)
            }

            PatKind::Record(rn, fields) => match (&pi.typ, rn) {
                // a record pattern naming a case of a multi-case variant
                // behaves exactly like the corresponding variant pattern
                (KTyp::Name(_), Some(case_id)) => self.process_variant_pat(
                    cctx,
                    case_id,
                    &[],
                    Some(&fields[..]),
                    pi.typ.clone(),
                    pi.exp,
                    sc,
                    loc,
                ),
                (KTyp::Record(rid), _) => {
                    let rec = get_krecord(self.comp, *rid, loc)?;
                    let a = self.pat_scrut_atom(cctx, pi.exp, sc)?;
                    self.push_record_fields(cctx, &rec, &fields, a, loc)
                }
                _ => Err(pattern_err(loc, "record pattern against a non-record value")),
            },
        }
    }

    fn push_record_fields(
        &mut self,
        cctx: &mut CaseCtx,
        rec: &KDefRecord,
        fields: &[(Id, Pat)],
        a: Atom,
        loc: Loc,
    ) -> CResult<()> {
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
            let m = KExp::Mem(a.clone(), idx, KCtx::new(ftyp.clone(), loc));
            self.dispatch_pat(cctx, PatInfo { pat: p.clone(), typ: ftyp, exp: m });
        }
        Ok(())
    }

    /// Common path of `PatVariant` and case-naming `PatRecord`: tag test
    /// plus payload extraction. `rec_fields` is set for the record form.
    #[allow(clippy::too_many_arguments)]
    fn process_variant_pat(
        &mut self,
        cctx: &mut CaseCtx,
        vn: Id,
        args: &[Pat],
        rec_fields: Option<&[(Id, Pat)]>,
        typ: KTyp,
        exp: KExp,
        sc: &ScopeChain,
        loc: Loc,
    ) -> CResult<()> {
        match typ {
            // exception patterns: tag extracted with VARIANT_TAG, payload
            // with VARIANT_CASE keyed by the exception id
            KTyp::Exn => {
                let de = get_kexn(self.comp, vn, loc)?;
                let a = self.pat_scrut_atom(cctx, exp, sc)?;
                let tag = self.pat_tag_atom(cctx, &a, sc, loc)?;
                let cmp = KExp::Binary(
                    BinOp::Eq,
                    tag,
                    Atom::Id(vn),
                    KCtx::new(KTyp::Bool, loc),
                );
                cctx.push_check(cmp);
                if !de.typ.is_void() && !args.is_empty() {
                    let ext = KExp::Intrin(
                        KIntrin::VariantCase,
                        vec![a, Atom::Id(vn)],
                        KCtx::new(de.typ.clone(), loc),
                    );
                    self.push_payload_pats(cctx, args, de.typ, ext, sc, loc)?;
                }
                Ok(())
            }

            KTyp::Name(vid) => {
                let dvar = get_kvariant(self.comp, vid, loc)?;
                let ci = dvar
                    .cases
                    .iter()
                    .position(|(cid, _)| *cid == vn)
                    .ok_or_else(|| {
                        name_err(
                            loc,
                            format!("'{}' is not a case of the variant", self.comp.id2str(vn)),
                        )
                    })?;
                let ptyp = dvar.cases[ci].1.clone();
                let a = self.pat_scrut_atom(cctx, exp, sc)?;

                // single-case variants carry the constant-0 tag; only a
                // multi-case variant needs the test
                if dvar.cases.len() > 1 {
                    let tag = self.pat_tag_atom(cctx, &a, sc, loc)?;
                    let cmp = KExp::Binary(
                        BinOp::Eq,
                        tag,
                        Atom::Id(vn),
                        KCtx::new(KTyp::Bool, loc),
                    );
                    cctx.push_check(cmp);
                }

                if ptyp.is_void() {
                    return Ok(());
                }
                let ext = KExp::Intrin(
                    KIntrin::VariantCase,
                    vec![a, Atom::Lit(Lit::Int(ci as i64))],
                    KCtx::new(ptyp.clone(), loc),
                );
                match rec_fields {
                    Some(fields) => {
                        let rid = match &ptyp {
                            KTyp::Record(rid) => *rid,
                            _ => {
                                return Err(pattern_err(
                                    loc,
                                    "the variant case does not carry a record",
                                ))
                            }
                        };
                        let rec = get_krecord(self.comp, rid, loc)?;
                        let ra = self.kexp2atom("r", ext, true, &mut cctx.code, sc)?;
                        self.push_record_fields(cctx, &rec, fields, ra, loc)
                    }
                    None => self.push_payload_pats(cctx, args, ptyp, ext, sc, loc),
                }
            }

            _ => Err(pattern_err(loc, "variant pattern against a non-variant value")),
        }
    }

    /// Distribute a case payload (a single value or a tuple) over the
    /// argument sub-patterns
    fn push_payload_pats(
        &mut self,
        cctx: &mut CaseCtx,
        args: &[Pat],
        ptyp: KTyp,
        ext: KExp,
        sc: &ScopeChain,
        loc: Loc,
    ) -> CResult<()> {
        if args.len() > 1 {
            let ts = match &ptyp {
                KTyp::Tuple(ts) if ts.len() == args.len() => ts.clone(),
                _ => return Err(type_err(loc, "variant payload arity mismatch")),
            };
            let a = self.kexp2atom("c", ext, true, &mut cctx.code, sc)?;
            for (i, (p, t)) in args.iter().zip(ts).enumerate() {
                let m = KExp::Mem(a.clone(), i, KCtx::new(t.clone(), loc));
                self.dispatch_pat(cctx, PatInfo { pat: p.clone(), typ: t, exp: m });
            }
            Ok(())
        } else if let Some(p) = args.first() {
            self.dispatch_pat(cctx, PatInfo { pat: p.clone(), typ: ptyp, exp: ext });
            Ok(())
        } else {
            Ok(())
        }
    }
}
