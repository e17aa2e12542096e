//! Name mangling and type materialization
//!
//! Assigns every global value, function, type, variant case and exception
//! a unique C-compatible name, and collapses the structural types that
//! remain in K-form (tuples, lists, refs, function types) into fresh
//! nominal `KDefTyp` entries. After this pass the only structural types
//! left in the IR are arrays (handled by the generic runtime array header)
//! and nominal references.
//!
//! The signature encoding is a pure function of type structure, so the
//! mangle map doubles as the memo that guarantees one materialized type
//! per distinct signature:
//!
//! ```text
//! int i   int8..64 c s n l   uint8..64 b w u q   float16/32/64 h f d
//! void v  bool B  char C  string S  cptr p  exn E
//! FP<ret><argc><args...>   T<n><elts...> / Ta<n><elt>   A<dims><elt>
//! L<elt>  r<elt>  V<len><name>[t<n><args>]  R<len><name>[t<n><args>]
//! ```

use crate::errors::{internal_err, CResult};
use crate::loc::Loc;
use crate::module::BUILTINS_MODULE;
use crate::symtab::{is_global_scope, Compilation, Id, Scope, ScopeChain};

use super::kform::*;

/// The C name prefix for every user entity
const C_PREFIX: &str = "_fx_";

pub struct Mangler {
    module: Id,
    module_prefix: String,
    in_builtins: bool,
}

/// Signature encoding of a type, outside any module context. This is the
/// same pure structural encoding the pass uses, so it is handy for
/// callers that only need the memo key of a type.
pub fn type_signature(comp: &mut Compilation, t: &KTyp) -> CResult<String> {
    let mut m = Mangler { module: Id::NONE, module_prefix: String::new(), in_builtins: false };
    m.ktyp2str(t, Loc::NONE, comp)
}

/// Mangle one module's statements; returns the rewritten statement list
pub fn mangle_module(comp: &mut Compilation, module: Id, stmts: Vec<KExp>) -> CResult<Vec<KExp>> {
    let name = comp.id2str(module);
    let in_builtins = name == BUILTINS_MODULE;
    let mut mangler = Mangler {
        module,
        module_prefix: if in_builtins { String::new() } else { format!("{}__", name) },
        in_builtins,
    };
    stmts.into_iter().map(|s| mangler.map_kexp(s, comp)).collect()
}

impl KMap for Mangler {
    fn map_ktyp(&mut self, t: KTyp, loc: Loc, comp: &mut Compilation) -> CResult<KTyp> {
        // children first, so materialized entries carry nominal elements
        let t = walk_map_ktyp(self, t, loc, comp)?;
        match t {
            KTyp::Err => Err(internal_err(loc, "error type reached the mangler")),
            KTyp::Tuple(_) | KTyp::List(_) | KTyp::Ref(_) | KTyp::Fun(..) => {
                let tid = self.materialize(t, loc, comp)?;
                Ok(KTyp::Name(tid))
            }
            other => Ok(other),
        }
    }

    fn map_kexp(&mut self, e: KExp, comp: &mut Compilation) -> CResult<KExp> {
        match &e {
            KExp::DefVal(id, _, loc) => self.mangle_val(*id, *loc, comp)?,
            KExp::DefFun(id, loc) => self.mangle_fun(*id, *loc, comp)?,
            KExp::DefVariant(id, loc) => self.mangle_variant(*id, *loc, comp)?,
            KExp::DefTyp(id, loc) => self.mangle_typdef(*id, *loc, comp)?,
            KExp::DefExn(id, loc) => self.mangle_exn(*id, *loc, comp)?,
            // iteration binders have no DefVal statement of their own,
            // but their table types must still become nominal
            KExp::For(iters, at_ids, _, loc) => {
                for (i, _) in iters {
                    self.mangle_val(*i, *loc, comp)?;
                }
                for i in at_ids {
                    self.mangle_val(*i, *loc, comp)?;
                }
            }
            KExp::Map(clauses, _, c) => {
                for cl in clauses {
                    for (i, _) in &cl.iters {
                        self.mangle_val(*i, c.loc, comp)?;
                    }
                    for i in &cl.at_ids {
                        self.mangle_val(*i, c.loc, comp)?;
                    }
                }
            }
            _ => {}
        }
        walk_map_kexp(self, e, comp)
    }
}

impl Mangler {
    // ------------------------------------------------------------------
    // Signature encoding
    // ------------------------------------------------------------------

    /// Structural-to-string encoding of a K-form type
    fn ktyp2str(&mut self, t: &KTyp, loc: Loc, comp: &mut Compilation) -> CResult<String> {
        Ok(match t {
            KTyp::Int => "i".to_string(),
            KTyp::SInt(8) => "c".to_string(),
            KTyp::SInt(16) => "s".to_string(),
            KTyp::SInt(32) => "n".to_string(),
            KTyp::SInt(64) => "l".to_string(),
            KTyp::UInt(8) => "b".to_string(),
            KTyp::UInt(16) => "w".to_string(),
            KTyp::UInt(32) => "u".to_string(),
            KTyp::UInt(64) => "q".to_string(),
            KTyp::Float(16) => "h".to_string(),
            KTyp::Float(32) => "f".to_string(),
            KTyp::Float(64) => "d".to_string(),
            KTyp::SInt(b) | KTyp::UInt(b) | KTyp::Float(b) => {
                return Err(internal_err(loc, format!("unsupported scalar width {}", b)))
            }
            KTyp::Void => "v".to_string(),
            KTyp::Bool => "B".to_string(),
            KTyp::Char => "C".to_string(),
            KTyp::Str => "S".to_string(),
            KTyp::CPtr => "p".to_string(),
            KTyp::Exn => "E".to_string(),
            KTyp::Module => {
                return Err(internal_err(loc, "a module type cannot be encoded"))
            }
            KTyp::Err => return Err(internal_err(loc, "error type reached the mangler")),
            KTyp::Fun(args, rt) => {
                let mut s = format!("FP{}{}", self.ktyp2str(rt, loc, comp)?, args.len());
                for a in args {
                    s.push_str(&self.ktyp2str(a, loc, comp)?);
                }
                s
            }
            KTyp::Tuple(elems) => {
                if elems.is_empty() {
                    return Err(internal_err(loc, "a tuple must have at least one element"));
                }
                let encoded = elems
                    .iter()
                    .map(|e| self.ktyp2str(e, loc, comp))
                    .collect::<CResult<Vec<_>>>()?;
                if encoded.len() > 1 && encoded.iter().all(|e| *e == encoded[0]) {
                    format!("Ta{}{}", encoded.len(), encoded[0])
                } else {
                    format!("T{}{}", encoded.len(), encoded.concat())
                }
            }
            KTyp::Array(dims, elt) => {
                format!("A{}{}", dims, self.ktyp2str(elt, loc, comp)?)
            }
            KTyp::List(elt) => format!("L{}", self.ktyp2str(elt, loc, comp)?),
            KTyp::Ref(elt) => format!("r{}", self.ktyp2str(elt, loc, comp)?),
            KTyp::Record(id) => {
                let base = self.nominal_base_name(*id, loc, comp)?;
                let targs = get_krecord(comp, *id, loc)?.targs;
                format!("R{}{}{}", base.len(), base, self.targs_suffix(&targs, loc, comp)?)
            }
            KTyp::Name(id) => match comp.k_info(*id, loc)?.clone() {
                // aliases (including materialized types) encode as their
                // right-hand side, so the encoding stays structural
                KInfo::Typ(dt) => self.ktyp2str(&dt.typ, loc, comp)?,
                KInfo::Variant(dv) => {
                    let base = self.nominal_base_name(*id, loc, comp)?;
                    format!("V{}{}{}", base.len(), base, self.targs_suffix(&dv.targs, loc, comp)?)
                }
                KInfo::Record(dr) => {
                    let base = self.nominal_base_name(*id, loc, comp)?;
                    format!("R{}{}{}", base.len(), base, self.targs_suffix(&dr.targs, loc, comp)?)
                }
                _ => {
                    return Err(internal_err(
                        loc,
                        "a named type does not refer to a type definition",
                    ))
                }
            },
        })
    }

    fn targs_suffix(&mut self, targs: &[KTyp], loc: Loc, comp: &mut Compilation) -> CResult<String> {
        if targs.is_empty() {
            return Ok(String::new());
        }
        let mut s = format!("t{}", targs.len());
        for a in targs {
            s.push_str(&self.ktyp2str(a, loc, comp)?);
        }
        Ok(s)
    }

    // ------------------------------------------------------------------
    // Name composition and uniqueness
    // ------------------------------------------------------------------

    /// Prefix of the enclosing module scopes joined with `__`, skipping
    /// the distinguished `Builtins` module
    fn scope_prefix(&self, sc: &ScopeChain, comp: &Compilation) -> String {
        let mut names: Vec<String> = Vec::new();
        for s in sc.iter().rev() {
            if let Scope::Module(m) = s {
                let n = comp.id2str(*m);
                if n != BUILTINS_MODULE {
                    names.push(n);
                }
            }
        }
        if names.is_empty() {
            String::new()
        } else {
            format!("{}__", names.join("__"))
        }
    }

    /// Repeated occurrences of the enclosing module prefix inside a
    /// signature suffix collapse into the `M<len>` length marker, so the
    /// compressed form stays unambiguous: a user name that happens to
    /// spell `M6...` still differs in its own length prefix
    fn compress(&self, suffix: &str) -> String {
        if self.module_prefix.is_empty() || !suffix.contains(&self.module_prefix) {
            return suffix.to_string();
        }
        let marker = format!("M{}", self.module_prefix.len());
        suffix.replace(&self.module_prefix, &marker)
    }

    /// Build `<prefix><nameLen><name><suffix>`, bumping the name with
    /// `1_`, `2_`, ... until the result is globally unique
    fn unique_name(
        &self,
        prefix: &str,
        bare: &str,
        suffix: &str,
        id: Id,
        loc: Loc,
        comp: &mut Compilation,
    ) -> CResult<String> {
        for attempt in 0u32.. {
            let name = if attempt == 0 {
                bare.to_string()
            } else {
                format!("{}{}_", bare, attempt)
            };
            let candidate = format!("{}{}{}{}", prefix, name.len(), name, suffix);
            match comp.mangle_map.get(&candidate) {
                None => {
                    comp.mangle_map.insert(candidate.clone(), id);
                    return Ok(candidate);
                }
                Some(owner) if *owner == id => return Ok(candidate),
                Some(_) => continue,
            }
        }
        Err(internal_err(loc, "could not generate a unique mangled name"))
    }

    /// The mangled base name of a nominal type (variant or record),
    /// assigning it on first use
    fn nominal_base_name(&mut self, id: Id, loc: Loc, comp: &mut Compilation) -> CResult<String> {
        let (cname, bare, scope) = match comp.k_info(id, loc)? {
            KInfo::Variant(dv) => (dv.cname.clone(), comp.id2str(dv.name), dv.scope.clone()),
            KInfo::Record(dr) => (dr.cname.clone(), comp.id2str(dr.name), dr.scope.clone()),
            _ => return Err(internal_err(loc, "expected a nominal type definition")),
        };
        if let Some(base) = cname.strip_prefix(C_PREFIX) {
            return Ok(base.to_string());
        }
        let prefix = self.scope_prefix(&scope, comp);
        let base = self.unique_name(&prefix, &bare, "", id, loc, comp)?;
        let full = format!("{}{}", C_PREFIX, base);
        match comp.k_info(id, loc)?.clone() {
            KInfo::Variant(mut dv) => {
                dv.cname = full;
                comp.set_k_info(id, KInfo::Variant(dv))?;
            }
            KInfo::Record(mut dr) => {
                dr.cname = full;
                comp.set_k_info(id, KInfo::Record(dr))?;
            }
            _ => {}
        }
        Ok(base)
    }

    // ------------------------------------------------------------------
    // Materialized structural types
    // ------------------------------------------------------------------

    /// Turn an anonymous structural type into (or look up) its nominal
    /// `KDefTyp`; one entry exists per distinct signature
    fn materialize(&mut self, t: KTyp, loc: Loc, comp: &mut Compilation) -> CResult<Id> {
        let sig = self.ktyp2str(&t, loc, comp)?;
        if let Some(id) = comp.mangle_map.get(&sig) {
            return Ok(*id);
        }
        let id = comp.new_val(&sig);
        comp.mangle_map.insert(sig.clone(), id);
        comp.set_k_info(
            id,
            KInfo::Typ(KDefTyp {
                name: id,
                cname: format!("{}{}", C_PREFIX, sig),
                targs: Vec::new(),
                typ: t,
                scope: vec![Scope::Module(self.module)],
                loc,
            }),
        )?;
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Per-definition mangling
    // ------------------------------------------------------------------

    fn mangle_val(&mut self, id: Id, loc: Loc, comp: &mut Compilation) -> CResult<()> {
        let mut dv = get_kval(comp, id, loc)?;
        dv.typ = self.map_ktyp(dv.typ, loc, comp)?;
        if is_global_scope(&dv.scope) && dv.cname.is_empty() {
            let prefix = self.scope_prefix(&dv.scope, comp);
            let bare = comp.id2str(dv.name);
            let base = self.unique_name(&prefix, &bare, "", id, loc, comp)?;
            dv.cname = format!("{}{}", C_PREFIX, base);
        }
        comp.set_k_info(id, KInfo::Val(dv))
    }

    fn mangle_fun(&mut self, id: Id, loc: Loc, comp: &mut Compilation) -> CResult<()> {
        let mut df = get_kfun(comp, id, loc)?;
        for (p, t) in df.params.iter_mut() {
            *t = self.map_ktyp(t.clone(), loc, comp)?;
            if comp.k_info_opt(*p).is_some() {
                let mut dv = get_kval(comp, *p, loc)?;
                dv.typ = t.clone();
                comp.set_k_info(*p, KInfo::Val(dv))?;
            }
        }
        df.rt = self.map_ktyp(df.rt.clone(), loc, comp)?;
        df.body = self.map_kexp(df.body, comp)?;
        if df.cname.is_empty() {
            // the signature suffix keeps overloads and instances apart
            let ftyp = KTyp::Fun(
                df.params.iter().map(|(_, t)| t.clone()).collect(),
                Box::new(df.rt.clone()),
            );
            let sig = self.ktyp2str(&ftyp, loc, comp)?;
            let suffix = self.compress(&sig);
            let prefix = self.scope_prefix(&df.scope, comp);
            let bare = comp.id2str(df.name);
            let base = self.unique_name(&prefix, &bare, &suffix, id, loc, comp)?;
            df.cname = format!("{}{}", C_PREFIX, base);
        }
        comp.set_k_info(id, KInfo::Fun(df))
    }

    fn mangle_variant(&mut self, id: Id, loc: Loc, comp: &mut Compilation) -> CResult<()> {
        self.nominal_base_name(id, loc, comp)?;
        let mut dv = get_kvariant(comp, id, loc)?;
        for (_, t) in dv.cases.iter_mut() {
            *t = self.map_ktyp(t.clone(), loc, comp)?;
        }
        let ctors = dv.ctors.clone();
        comp.set_k_info(id, KInfo::Variant(dv))?;
        // constructors have no statements of their own; mangle them here
        for ctor in ctors {
            match comp.k_info(ctor, loc)?.clone() {
                KInfo::Fun(_) => self.mangle_fun(ctor, loc, comp)?,
                KInfo::Val(_) => self.mangle_val(ctor, loc, comp)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn mangle_typdef(&mut self, id: Id, loc: Loc, comp: &mut Compilation) -> CResult<()> {
        match comp.k_info(id, loc)?.clone() {
            KInfo::Typ(mut dt) => {
                dt.typ = self.map_ktyp(dt.typ, loc, comp)?;
                if dt.cname.is_empty() {
                    let prefix = self.scope_prefix(&dt.scope, comp);
                    let bare = comp.id2str(dt.name);
                    let base = self.unique_name(&prefix, &bare, "", id, loc, comp)?;
                    dt.cname = format!("{}{}", C_PREFIX, base);
                }
                comp.set_k_info(id, KInfo::Typ(dt))
            }
            KInfo::Record(mut dr) => {
                for f in dr.fields.iter_mut() {
                    f.typ = self.map_ktyp(f.typ.clone(), loc, comp)?;
                }
                comp.set_k_info(id, KInfo::Record(dr))?;
                self.nominal_base_name(id, loc, comp)?;
                Ok(())
            }
            _ => Err(internal_err(loc, "DefTyp id does not name a type")),
        }
    }

    fn mangle_exn(&mut self, id: Id, loc: Loc, comp: &mut Compilation) -> CResult<()> {
        let mut de = get_kexn(comp, id, loc)?;
        de.typ = self.map_ktyp(de.typ.clone(), loc, comp)?;
        if de.cname.is_empty() {
            let bare = comp.id2str(de.name);
            if self.in_builtins {
                // standard exceptions keep their runtime spelling
                de.cname = format!("FX_EXN_{}", bare);
                comp.mangle_map.insert(de.cname.clone(), id);
            } else {
                let prefix = self.scope_prefix(&de.scope, comp);
                let base = self.unique_name(&prefix, &bare, "", id, loc, comp)?;
                de.cname = format!("{}{}", C_PREFIX, base);
            }
        }
        comp.set_k_info(id, KInfo::Exn(de))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symtab::Compilation;

    fn mk_mangler(comp: &mut Compilation) -> Mangler {
        let m = comp.new_val("M");
        Mangler { module: m, module_prefix: "M__".to_string(), in_builtins: false }
    }

    #[test]
    fn scalar_codes_match_the_table() {
        let mut comp = Compilation::new();
        let mut m = mk_mangler(&mut comp);
        let pairs = [
            (KTyp::Int, "i"),
            (KTyp::SInt(8), "c"),
            (KTyp::SInt(16), "s"),
            (KTyp::SInt(32), "n"),
            (KTyp::SInt(64), "l"),
            (KTyp::UInt(8), "b"),
            (KTyp::UInt(16), "w"),
            (KTyp::UInt(32), "u"),
            (KTyp::UInt(64), "q"),
            (KTyp::Float(16), "h"),
            (KTyp::Float(32), "f"),
            (KTyp::Float(64), "d"),
            (KTyp::Void, "v"),
            (KTyp::Bool, "B"),
            (KTyp::Char, "C"),
            (KTyp::Str, "S"),
            (KTyp::CPtr, "p"),
            (KTyp::Exn, "E"),
        ];
        for (t, expect) in pairs {
            assert_eq!(m.ktyp2str(&t, Loc::NONE, &mut comp).unwrap(), expect);
        }
    }

    #[test]
    fn tuple_encoding_counts_elements() {
        let mut comp = Compilation::new();
        let mut m = mk_mangler(&mut comp);
        let t = KTyp::Tuple(vec![KTyp::Int, KTyp::Float(64), KTyp::Str]);
        assert_eq!(m.ktyp2str(&t, Loc::NONE, &mut comp).unwrap(), "T3idS");
        // all-equal tuples use the compact form
        let ta = KTyp::Tuple(vec![KTyp::Int, KTyp::Int, KTyp::Int, KTyp::Int]);
        assert_eq!(m.ktyp2str(&ta, Loc::NONE, &mut comp).unwrap(), "Ta4i");
    }

    #[test]
    fn fun_list_ref_array_encodings() {
        let mut comp = Compilation::new();
        let mut m = mk_mangler(&mut comp);
        let f = KTyp::Fun(vec![KTyp::Int, KTyp::Bool], Box::new(KTyp::Str));
        assert_eq!(m.ktyp2str(&f, Loc::NONE, &mut comp).unwrap(), "FPS2iB");
        let l = KTyp::List(Box::new(KTyp::Char));
        assert_eq!(m.ktyp2str(&l, Loc::NONE, &mut comp).unwrap(), "LC");
        let r = KTyp::Ref(Box::new(KTyp::Int));
        assert_eq!(m.ktyp2str(&r, Loc::NONE, &mut comp).unwrap(), "ri");
        let a = KTyp::Array(2, Box::new(KTyp::Float(32)));
        assert_eq!(m.ktyp2str(&a, Loc::NONE, &mut comp).unwrap(), "A2f");
    }

    #[test]
    fn zero_element_tuple_is_an_internal_error() {
        let mut comp = Compilation::new();
        let mut m = mk_mangler(&mut comp);
        let err = m.ktyp2str(&KTyp::Tuple(Vec::new()), Loc::NONE, &mut comp).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn err_type_is_an_internal_error() {
        let mut comp = Compilation::new();
        let mut m = mk_mangler(&mut comp);
        assert!(m.ktyp2str(&KTyp::Err, Loc::NONE, &mut comp).unwrap_err().is_fatal());
        assert!(m.map_ktyp(KTyp::Err, Loc::NONE, &mut comp).is_err());
    }

    #[test]
    fn encoding_is_pure() {
        let mut comp = Compilation::new();
        let mut m = mk_mangler(&mut comp);
        let t = KTyp::Tuple(vec![KTyp::Int, KTyp::List(Box::new(KTyp::Str))]);
        let a = m.ktyp2str(&t, Loc::NONE, &mut comp).unwrap();
        let b = m.ktyp2str(&t, Loc::NONE, &mut comp).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn materialize_memoizes_per_signature() {
        let mut comp = Compilation::new();
        let mut m = mk_mangler(&mut comp);
        let t = KTyp::Tuple(vec![KTyp::Int, KTyp::Float(64), KTyp::Str]);
        let id1 = m.materialize(t.clone(), Loc::NONE, &mut comp).unwrap();
        let id2 = m.materialize(t, Loc::NONE, &mut comp).unwrap();
        assert_eq!(id1, id2);
        match comp.k_info(id1, Loc::NONE).unwrap() {
            KInfo::Typ(dt) => assert_eq!(dt.cname, "_fx_T3idS"),
            other => panic!("expected a type definition, got {:?}", other),
        }
    }

    #[test]
    fn unique_name_bumps_on_collision() {
        let mut comp = Compilation::new();
        let m = mk_mangler(&mut comp);
        let a = comp.new_val("foo");
        let b = comp.new_val("foo");
        let n1 = m.unique_name("M__", "foo", "", a, Loc::NONE, &mut comp).unwrap();
        let n2 = m.unique_name("M__", "foo", "", b, Loc::NONE, &mut comp).unwrap();
        assert_eq!(n1, "M__3foo");
        assert_eq!(n2, "M__5foo1_");
        // asking again returns the memoized names
        assert_eq!(m.unique_name("M__", "foo", "", a, Loc::NONE, &mut comp).unwrap(), n1);
    }
}
