//! C type generation
//!
//! For every nominal K-form type reachable from a module, produce:
//!
//! - the `CDefTyp` with its struct/union layout and type properties;
//! - a destructor `_fx_free_<name>` for every complex type;
//! - a copy function `_fx_copy_<name>` where a plain struct assignment is
//!   not enough;
//! - a constructor `_fx_make_<name>` for tuples, records, lists, refs and
//!   recursive variants, plus one constructor per variant case;
//! - the companion `<name>_tag_t` enum of every tagged variant.
//!
//! Cycles in the type graph occur only through recursive variants; they
//! are broken by forward-declaring the struct tag and the destructor
//! before the variant's cases are visited, keyed on the nominal id.
//!
//! Exception tags are allocated from -1024 downward.

use std::collections::HashSet;

use crate::errors::{internal_err, CResult};
use crate::loc::Loc;
use crate::symtab::{Compilation, Id};

use super::cform::*;
use super::kform::*;

/// The three statement groups a module's type section consists of
#[derive(Debug, Default)]
pub struct CTypeOutput {
    pub fwd_decls: Vec<CStmt>,
    pub type_decls: Vec<CStmt>,
    pub utility_fns: Vec<CStmt>,
}

pub struct CTypeGen<'a> {
    comp: &'a mut Compilation,
    out: CTypeOutput,
}

/// Generate C type declarations and utility functions for every nominal
/// type referenced from the module's statements
pub fn gen_ctypes_module(comp: &mut Compilation, stmts: &[KExp]) -> CResult<CTypeOutput> {
    let mut ids = Vec::new();
    let mut seen = HashSet::new();
    for s in stmts {
        collect_type_ids(comp, s, &mut ids, &mut seen)?;
    }
    let mut gen = CTypeGen { comp, out: CTypeOutput::default() };
    for (id, loc) in ids {
        gen.declare_type(id, loc)?;
    }
    Ok(gen.out)
}

/// Nominal type ids referenced by a statement, in first-use order; the
/// bodies of functions are scanned through the info table
fn collect_type_ids(
    comp: &Compilation,
    e: &KExp,
    ids: &mut Vec<(Id, Loc)>,
    seen: &mut HashSet<Id>,
) -> CResult<()> {
    struct Collect<'v> {
        ids: &'v mut Vec<(Id, Loc)>,
        seen: &'v mut HashSet<Id>,
        loc: Loc,
    }
    impl KFold for Collect<'_> {
        fn fold_ktyp(&mut self, t: &KTyp, comp: &Compilation) {
            if let KTyp::Record(id) | KTyp::Name(id) = t {
                if self.seen.insert(*id) {
                    self.ids.push((*id, self.loc));
                }
            }
            walk_fold_ktyp(self, t, comp)
        }

        fn fold_kexp(&mut self, e: &KExp, comp: &Compilation) {
            match e {
                KExp::DefFun(id, loc) => {
                    if let Ok(df) = get_kfun(comp, *id, *loc) {
                        for (_, t) in &df.params {
                            self.fold_ktyp(t, comp);
                        }
                        self.fold_ktyp(&df.rt, comp);
                        self.fold_kexp(&df.body, comp);
                    }
                }
                KExp::DefVariant(id, loc) | KExp::DefTyp(id, loc) | KExp::DefExn(id, loc) => {
                    if self.seen.insert(*id) {
                        self.ids.push((*id, *loc));
                    }
                }
                _ => {}
            }
            walk_fold_kexp(self, e, comp)
        }
    }
    let mut c = Collect { ids, seen, loc: e.loc() };
    c.fold_kexp(e, comp);
    Ok(())
}

impl<'a> CTypeGen<'a> {
    fn name_id(&mut self, s: &str) -> Id {
        Id::Name(self.comp.intern(s))
    }

    // ------------------------------------------------------------------
    // Type mapping and properties
    // ------------------------------------------------------------------

    /// Map a (nominalized) K-form type to its C representation in field
    /// or argument position
    fn ktyp2ctyp(&mut self, t: &KTyp, loc: Loc) -> CResult<CTyp> {
        Ok(match t {
            KTyp::Int => CTyp::Int,
            KTyp::SInt(b) => CTyp::SInt(*b),
            KTyp::UInt(b) => CTyp::UInt(*b),
            KTyp::Float(b) => CTyp::Float(*b),
            KTyp::Void => CTyp::Void,
            KTyp::Bool => CTyp::Bool,
            KTyp::Char => CTyp::Char,
            KTyp::Str => CTyp::Str,
            KTyp::Exn => CTyp::Exn,
            KTyp::CPtr => CTyp::CPtr,
            KTyp::Array(_, _) => CTyp::Arr,
            KTyp::Record(id) | KTyp::Name(id) => {
                self.declare_type(*id, loc)?;
                CTyp::Name(*id)
            }
            KTyp::Tuple(_) | KTyp::List(_) | KTyp::Ref(_) | KTyp::Fun(..) => {
                return Err(internal_err(
                    loc,
                    "a structural type survived mangling and reached the C type generator",
                ))
            }
            KTyp::Err | KTyp::Module => {
                return Err(internal_err(loc, "unsupported K-form type in the C type generator"))
            }
        })
    }

    /// Properties of a (nominalized) K-form type; named types must have
    /// been declared first
    fn ktyp_props(&mut self, t: &KTyp, loc: Loc) -> CResult<CTypProps> {
        Ok(match t {
            KTyp::Int
            | KTyp::SInt(_)
            | KTyp::UInt(_)
            | KTyp::Float(_)
            | KTyp::Bool
            | KTyp::Char
            | KTyp::Void => CTypProps::scalar(),
            KTyp::Str => self.runtime_props("FX_FREE_STR", "fx_free_str", "FX_COPY_STR", "fx_copy_str"),
            KTyp::Exn => self.runtime_props("FX_FREE_EXN", "fx_free_exn", "FX_COPY_EXN", "fx_copy_exn"),
            KTyp::Array(_, _) => {
                self.runtime_props("FX_FREE_ARR", "fx_free_arr", "FX_COPY_ARR", "fx_copy_arr")
            }
            KTyp::CPtr => {
                self.runtime_props("FX_FREE_CPTR", "fx_free_cptr", "FX_COPY_CPTR", "fx_copy_cptr")
            }
            KTyp::Record(id) | KTyp::Name(id) => {
                self.declare_type(*id, loc)?;
                match self.comp.c_info(*id, loc)? {
                    CInfo::Typ(dt) => dt.props.clone(),
                    _ => {
                        return Err(internal_err(loc, "a named type has no C type definition"))
                    }
                }
            }
            _ => return Err(internal_err(loc, "unsupported K-form type in the C type generator")),
        })
    }

    fn runtime_props(&mut self, free_m: &str, free_f: &str, copy_m: &str, copy_f: &str) -> CTypProps {
        CTypProps {
            scalar: false,
            complex: true,
            ptr: false,
            pass_by_ref: true,
            custom_copy: true,
            free: (self.name_id(free_m), self.name_id(free_f)),
            copy: (self.name_id(copy_m), self.name_id(copy_f)),
        }
    }

    // ------------------------------------------------------------------
    // Declaration driver
    // ------------------------------------------------------------------

    fn declare_type(&mut self, id: Id, loc: Loc) -> CResult<()> {
        let k = match id.idx() {
            Some(k) => k,
            None => return Ok(()), // runtime names need no declaration
        };
        if self.comp.declared_ctypes.contains(&k) {
            return Ok(());
        }
        self.comp.declared_ctypes.insert(k);

        match self.comp.k_info(id, loc)?.clone() {
            KInfo::Typ(dt) => match dt.typ.clone() {
                KTyp::Tuple(elems) => {
                    let fields: Vec<(Id, KTyp)> = elems
                        .into_iter()
                        .enumerate()
                        .map(|(i, t)| (Id::Name(self.comp.intern(&format!("t{}", i))), t))
                        .collect();
                    self.gen_struct_type(id, &dt.cname, &fields, dt.loc)
                }
                KTyp::List(elt) => self.gen_list_type(id, &dt.cname, &elt, dt.loc),
                KTyp::Ref(elt) => self.gen_ref_type(id, &dt.cname, &elt, dt.loc),
                KTyp::Fun(args, rt) => self.gen_closure_type(id, &dt.cname, &args, &rt, dt.loc),
                other => {
                    // plain alias: a typedef with the target's properties
                    let ctyp = self.ktyp2ctyp(&other, dt.loc)?;
                    let props = self.ktyp_props(&other, dt.loc)?;
                    self.comp.set_c_info(
                        id,
                        CInfo::Typ(CDefTyp {
                            name: id,
                            cname: dt.cname.clone(),
                            typ: ctyp,
                            props,
                            ctors: Vec::new(),
                            loc: dt.loc,
                        }),
                    )?;
                    self.out.type_decls.push(CStmt::DefTyp(id));
                    Ok(())
                }
            },
            KInfo::Record(dr) => {
                let fields: Vec<(Id, KTyp)> =
                    dr.fields.iter().map(|f| (f.name, f.typ.clone())).collect();
                self.gen_struct_type(id, &dr.cname, &fields, dr.loc)
            }
            KInfo::Variant(dv) => self.gen_variant_type(id, dv),
            KInfo::Exn(de) => self.gen_exn(id, de),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Structs (tuples and records)
    // ------------------------------------------------------------------

    fn gen_struct_type(
        &mut self,
        id: Id,
        cname: &str,
        fields: &[(Id, KTyp)],
        loc: Loc,
    ) -> CResult<()> {
        let mut cfields = Vec::with_capacity(fields.len());
        let mut fprops = Vec::with_capacity(fields.len());
        for (fname, ftyp) in fields {
            let ct = self.ktyp2ctyp(ftyp, loc)?;
            let p = self.ktyp_props(ftyp, loc)?;
            cfields.push((*fname, ct));
            fprops.push(p);
        }
        let complex = fprops.iter().any(|p| p.complex);

        let free_fn = if complex { self.comp.new_val(&format!("_fx_free_{}", base(cname))) } else { Id::NONE };
        let copy_fn = if complex { self.comp.new_val(&format!("_fx_copy_{}", base(cname))) } else { Id::NONE };
        let make_fn = self.comp.new_val(&format!("_fx_make_{}", base(cname)));

        let props = CTypProps {
            scalar: false,
            complex,
            ptr: false,
            pass_by_ref: true,
            custom_copy: complex,
            free: (Id::NONE, free_fn),
            copy: (Id::NONE, copy_fn),
        };
        self.comp.set_c_info(
            id,
            CInfo::Typ(CDefTyp {
                name: id,
                cname: cname.to_string(),
                typ: CTyp::Struct(None, cfields.clone()),
                props,
                ctors: vec![make_fn],
                loc,
            }),
        )?;
        self.out.type_decls.push(CStmt::DefTyp(id));

        let dst = self.name_id("dst");
        let src = self.name_id("src");
        let result = self.name_id("result");
        let self_ptr = CTyp::RawPtr(Box::new(CTyp::Name(id)));

        if complex {
            // destructor: free the complex fields only
            let mut body = Vec::new();
            for ((fname, _), p) in cfields.iter().zip(&fprops) {
                if p.complex {
                    body.push(free_elem_stmt(p, CExp::arrow(CExp::ident(dst), *fname)));
                }
            }
            self.push_fun(free_fn, &format!("_fx_free_{}", base(cname)),
                vec![(dst, self_ptr.clone())], CTyp::Void, body, loc)?;

            // copy: memberwise, with the elements' own copy handles
            let mut body = Vec::new();
            for ((fname, _), p) in cfields.iter().zip(&fprops) {
                let s = CExp::arrow(CExp::ident(src), *fname);
                let d = CExp::arrow(CExp::ident(dst), *fname);
                body.push(copy_elem_stmt(p, s, d));
            }
            self.push_fun(copy_fn, &format!("_fx_copy_{}", base(cname)),
                vec![(src, self_ptr.clone()), (dst, self_ptr.clone())], CTyp::Void, body, loc)?;
        }

        // constructor: copy every field into the output record
        let mut args = Vec::with_capacity(cfields.len() + 1);
        let mut body = Vec::new();
        for ((fname, ct), p) in cfields.iter().zip(&fprops) {
            let arg_t = if p.pass_by_ref {
                CTyp::RawPtr(Box::new(ct.clone()))
            } else {
                ct.clone()
            };
            args.push((*fname, arg_t));
            let s = if p.pass_by_ref {
                CExp::deref(CExp::ident(*fname))
            } else {
                CExp::ident(*fname)
            };
            let d = CExp::arrow(CExp::ident(result), *fname);
            body.push(copy_elem_stmt(p, s, d));
        }
        args.push((result, self_ptr));
        body.push(CStmt::Return(Some(CExp::ident(self.name_id("FX_OK")))));
        self.push_fun(make_fn, &format!("_fx_make_{}", base(cname)), args, CTyp::CInt, body, loc)
    }

    // ------------------------------------------------------------------
    // Lists and refs
    // ------------------------------------------------------------------

    fn gen_list_type(&mut self, id: Id, cname: &str, elt: &KTyp, loc: Loc) -> CResult<()> {
        let elt_c = self.ktyp2ctyp(elt, loc)?;
        let elt_p = self.ktyp_props(elt, loc)?;

        let free_fn = self.comp.new_val(&format!("_fx_free_{}", base(cname)));
        let make_fn = self.comp.new_val(&format!("_fx_make_{}", base(cname)));
        let data_tag = self.name_id(&format!("{}_data_t", cname));
        let (rc, hd, tl) = (self.name_id("rc"), self.name_id("hd"), self.name_id("tl"));

        let cell = CTyp::Struct(
            Some(data_tag),
            vec![(rc, CTyp::Int), (tl, CTyp::Name(id)), (hd, elt_c.clone())],
        );
        let props = CTypProps {
            scalar: false,
            complex: true,
            ptr: true,
            pass_by_ref: false,
            custom_copy: false,
            free: (Id::NONE, free_fn),
            copy: (self.name_id("FX_COPY_PTR"), Id::NONE),
        };
        self.comp.set_c_info(
            id,
            CInfo::Typ(CDefTyp {
                name: id,
                cname: cname.to_string(),
                typ: CTyp::RawPtr(Box::new(cell)),
                props,
                ctors: vec![make_fn],
                loc,
            }),
        )?;
        self.out.type_decls.push(CStmt::DefTyp(id));

        // destructor: the runtime list-release loop, parameterized by the
        // head destructor
        let dst = self.name_id("dst");
        let body = if elt_p.complex {
            let impl_m = self.name_id("FX_FREE_LIST_IMPL");
            vec![CStmt::Exp(CExp::call(
                impl_m,
                vec![CExp::ident(id), CExp::ident(elt_p.free_handle())],
            ))]
        } else {
            let impl_m = self.name_id("FX_FREE_LIST_SIMPLE_IMPL");
            vec![CStmt::Exp(CExp::call(impl_m, vec![CExp::ident(id)]))]
        };
        self.push_fun(
            free_fn,
            &format!("_fx_free_{}", base(cname)),
            vec![(dst, CTyp::RawPtr(Box::new(CTyp::Name(id))))],
            CTyp::Void,
            body,
            loc,
        )?;

        // cons cell constructor
        let (hd_arg, tl_arg, result) = (hd, tl, self.name_id("result"));
        let hd_t = if elt_p.pass_by_ref {
            CTyp::RawPtr(Box::new(elt_c))
        } else {
            elt_c
        };
        let impl_m = self.name_id("FX_MAKE_LIST_IMPL");
        let copy_hd = elt_p.copy_handle();
        let body = vec![CStmt::Exp(CExp::call(
            impl_m,
            vec![CExp::ident(id), CExp::ident(copy_hd)],
        ))];
        self.push_fun(
            make_fn,
            &format!("_fx_make_{}", base(cname)),
            vec![
                (hd_arg, hd_t),
                (tl_arg, CTyp::Name(id)),
                (result, CTyp::RawPtr(Box::new(CTyp::Name(id)))),
            ],
            CTyp::CInt,
            body,
            loc,
        )
    }

    fn gen_ref_type(&mut self, id: Id, cname: &str, elt: &KTyp, loc: Loc) -> CResult<()> {
        let elt_c = self.ktyp2ctyp(elt, loc)?;
        let elt_p = self.ktyp_props(elt, loc)?;

        let free_fn = self.comp.new_val(&format!("_fx_free_{}", base(cname)));
        let make_fn = self.comp.new_val(&format!("_fx_make_{}", base(cname)));
        let data_tag = self.name_id(&format!("{}_data_t", cname));
        let (rc, data) = (self.name_id("rc"), self.name_id("data"));

        let cell = CTyp::Struct(Some(data_tag), vec![(rc, CTyp::Int), (data, elt_c.clone())]);
        let props = CTypProps {
            scalar: false,
            complex: true,
            ptr: true,
            pass_by_ref: false,
            custom_copy: false,
            free: (Id::NONE, free_fn),
            copy: (self.name_id("FX_COPY_PTR"), Id::NONE),
        };
        self.comp.set_c_info(
            id,
            CInfo::Typ(CDefTyp {
                name: id,
                cname: cname.to_string(),
                typ: CTyp::RawPtr(Box::new(cell)),
                props,
                ctors: vec![make_fn],
                loc,
            }),
        )?;
        self.out.type_decls.push(CStmt::DefTyp(id));

        let dst = self.name_id("dst");
        let body = if elt_p.complex {
            let impl_m = self.name_id("FX_FREE_REF_IMPL");
            vec![CStmt::Exp(CExp::call(
                impl_m,
                vec![CExp::ident(id), CExp::ident(elt_p.free_handle())],
            ))]
        } else {
            let impl_m = self.name_id("FX_FREE_REF_SIMPLE_IMPL");
            vec![CStmt::Exp(CExp::call(impl_m, vec![CExp::ident(id)]))]
        };
        self.push_fun(
            free_fn,
            &format!("_fx_free_{}", base(cname)),
            vec![(dst, CTyp::RawPtr(Box::new(CTyp::Name(id))))],
            CTyp::Void,
            body,
            loc,
        )?;

        let result = self.name_id("result");
        let data_t = if elt_p.pass_by_ref {
            CTyp::RawPtr(Box::new(elt_c))
        } else {
            elt_c
        };
        let impl_m = self.name_id("FX_MAKE_REF_IMPL");
        let body = vec![CStmt::Exp(CExp::call(
            impl_m,
            vec![CExp::ident(id), CExp::ident(elt_p.copy_handle())],
        ))];
        self.push_fun(
            make_fn,
            &format!("_fx_make_{}", base(cname)),
            vec![(data, data_t), (result, CTyp::RawPtr(Box::new(CTyp::Name(id))))],
            CTyp::CInt,
            body,
            loc,
        )
    }

    // ------------------------------------------------------------------
    // Closures
    // ------------------------------------------------------------------

    fn gen_closure_type(
        &mut self,
        id: Id,
        cname: &str,
        args: &[KTyp],
        rt: &KTyp,
        loc: Loc,
    ) -> CResult<()> {
        // `{ fp, fcv }`: the function pointer takes the arguments plus an
        // output pointer and returns a status code
        let mut fp_args = Vec::with_capacity(args.len() + 1);
        for a in args {
            let ct = self.ktyp2ctyp(a, loc)?;
            let p = self.ktyp_props(a, loc)?;
            fp_args.push(if p.pass_by_ref { CTyp::RawPtr(Box::new(ct)) } else { ct });
        }
        if !rt.is_void() {
            let rt_c = self.ktyp2ctyp(rt, loc)?;
            fp_args.push(CTyp::RawPtr(Box::new(rt_c)));
        }
        let fcv_t = CTyp::RawPtr(Box::new(CTyp::Name(self.name_id("fx_fcv_t"))));
        fp_args.push(fcv_t.clone());

        let (fp, fcv) = (self.name_id("fp"), self.name_id("fcv"));
        let typ = CTyp::Struct(
            None,
            vec![
                (fp, CTyp::FunRawPtr(fp_args, Box::new(CTyp::CInt))),
                (fcv, fcv_t),
            ],
        );
        let props = CTypProps {
            scalar: false,
            complex: true,
            ptr: false,
            pass_by_ref: false,
            custom_copy: true,
            free: (self.name_id("FX_FREE_FP"), Id::NONE),
            copy: (self.name_id("FX_COPY_FP"), Id::NONE),
        };
        self.comp.set_c_info(
            id,
            CInfo::Typ(CDefTyp {
                name: id,
                cname: cname.to_string(),
                typ,
                props,
                ctors: Vec::new(),
                loc,
            }),
        )?;
        self.out.type_decls.push(CStmt::DefTyp(id));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Variants
    // ------------------------------------------------------------------

    fn gen_variant_type(&mut self, id: Id, mut dv: KDefVariant) -> CResult<()> {
        let loc = dv.loc;
        let cname = dv.cname.clone();

        // nullable-case analysis: a two-case recursive variant with one
        // payload-free case is represented by a null pointer
        let void_cases: Vec<usize> = dv
            .cases
            .iter()
            .enumerate()
            .filter(|(_, (_, t))| t.is_void())
            .map(|(i, _)| i)
            .collect();
        dv.flags.nil_case = if dv.flags.recursive && dv.cases.len() == 2 && void_cases.len() == 1 {
            Some(void_cases[0])
        } else {
            None
        };
        dv.flags.have_tag = dv.cases.len() > 1 && dv.flags.nil_case.is_none();
        self.comp.set_k_info(id, KInfo::Variant(dv.clone()))?;

        // companion tag enum, one member per case; option-flagged variants
        // start at 0 to reserve it for the nil case
        let enum_id = if dv.cases.len() > 1 {
            let eid = self.comp.new_val(&format!("{}_tag_t", cname));
            let start = if dv.flags.opt { 0 } else { 1 };
            let members = dv
                .cases
                .iter()
                .enumerate()
                .map(|(i, (cid, _))| (*cid, Some(start + i as i64)))
                .collect();
            self.comp.set_c_info(
                eid,
                CInfo::Enum(CDefEnum {
                    name: eid,
                    cname: format!("{}_tag_t", cname),
                    members,
                    loc,
                }),
            )?;
            if let Some(k) = id.idx() {
                self.comp.enum_cache.insert(k, eid);
            }
            self.out.type_decls.push(CStmt::DefEnum(eid));
            Some(eid)
        } else {
            None
        };

        let free_fn = self.comp.new_val(&format!("_fx_free_{}", base(&cname)));
        let make_fn = if dv.flags.recursive {
            self.comp.new_val(&format!("_fx_make_{}", base(&cname)))
        } else {
            Id::NONE
        };

        // break cycles: forward-declare the struct tag and destructor
        // before visiting the cases
        if dv.flags.recursive {
            if let Some(k) = id.idx() {
                if self.comp.fwd_declared.insert(k) {
                    self.out.fwd_decls.push(CStmt::ForwardTyp(id));
                    self.out.fwd_decls.push(CStmt::ForwardFun(free_fn));
                }
            }
            // provisional entry so the cases can query this type
            let copy_ptr_id = self.name_id("FX_COPY_PTR");
            self.comp.set_c_info(
                id,
                CInfo::Typ(CDefTyp {
                    name: id,
                    cname: cname.clone(),
                    typ: CTyp::RawPtr(Box::new(CTyp::Void)),
                    props: CTypProps {
                        scalar: false,
                        complex: true,
                        ptr: true,
                        pass_by_ref: false,
                        custom_copy: false,
                        free: (Id::NONE, free_fn),
                        copy: (copy_ptr_id, Id::NONE),
                    },
                    ctors: Vec::new(),
                    loc,
                }),
            )?;
        }

        // case payloads
        let mut case_ctyps = Vec::with_capacity(dv.cases.len());
        let mut case_props = Vec::with_capacity(dv.cases.len());
        for (_, ptyp) in &dv.cases {
            if ptyp.is_void() {
                case_ctyps.push(None);
                case_props.push(CTypProps::scalar());
            } else {
                case_ctyps.push(Some(self.ktyp2ctyp(ptyp, loc)?));
                case_props.push(self.ktyp_props(ptyp, loc)?);
            }
        }

        let tag_field = self.name_id("tag");
        let u_field = self.name_id("u");
        let rc_field = self.name_id("rc");

        let union_fields: Vec<(Id, CTyp)> = dv
            .cases
            .iter()
            .zip(&case_ctyps)
            .filter_map(|((cid, _), ct)| ct.clone().map(|ct| (*cid, ct)))
            .collect();
        let union_t = CTyp::Union(None, union_fields.clone());

        let single_void = dv.cases.len() == 1 && union_fields.is_empty();
        let complex = dv.flags.recursive || case_props.iter().any(|p| p.complex);

        let typ = if dv.flags.recursive {
            let data_tag = self.name_id(&format!("{}_data_t", cname));
            let mut fields = vec![(rc_field, CTyp::Int)];
            if dv.flags.have_tag {
                fields.push((tag_field, CTyp::CInt));
            }
            if !union_fields.is_empty() {
                fields.push((u_field, union_t));
            }
            CTyp::RawPtr(Box::new(CTyp::Struct(Some(data_tag), fields)))
        } else {
            // inline struct: {tag?, union?}; a single void case needs
            // neither
            let mut fields = Vec::new();
            if dv.flags.have_tag {
                let tag_t = enum_id.map(CTyp::Name).unwrap_or(CTyp::CInt);
                fields.push((tag_field, tag_t));
            }
            if !union_fields.is_empty() {
                fields.push((u_field, union_t));
            }
            CTyp::Struct(None, fields)
        };

        let copy_fn = if !dv.flags.recursive && complex {
            self.comp.new_val(&format!("_fx_copy_{}", base(&cname)))
        } else {
            Id::NONE
        };
        let props = if dv.flags.recursive {
            CTypProps {
                scalar: false,
                complex: true,
                ptr: true,
                pass_by_ref: false,
                custom_copy: false,
                free: (Id::NONE, free_fn),
                copy: (self.name_id("FX_COPY_PTR"), Id::NONE),
            }
        } else {
            CTypProps {
                scalar: single_void,
                complex,
                ptr: false,
                pass_by_ref: !single_void,
                custom_copy: complex,
                free: (Id::NONE, if complex { free_fn } else { Id::NONE }),
                copy: (Id::NONE, copy_fn),
            }
        };

        // constructors: the allocator of a recursive variant plus one
        // function per case with payload
        let mut ctors = Vec::new();
        if !make_fn.is_none() {
            let tag_arg = self.name_id("tag");
            let result = self.name_id("result");
            let impl_m = self.name_id("FX_MAKE_RECURSIVE_VARIANT_IMPL");
            let body = vec![CStmt::Exp(CExp::call(impl_m, vec![CExp::ident(id)]))];
            self.push_fun(
                make_fn,
                &format!("_fx_make_{}", base(&cname)),
                vec![
                    (tag_arg, CTyp::CInt),
                    (result, CTyp::RawPtr(Box::new(CTyp::Name(id)))),
                ],
                CTyp::CInt,
                body,
                loc,
            )?;
            ctors.push(make_fn);
        }
        for (i, ((cid, ptyp), ct)) in dv.cases.iter().zip(&case_ctyps).enumerate() {
            if let Some(ct) = ct {
                self.gen_case_ctor(id, &dv, i, *cid, ptyp, ct.clone(), loc)?;
                ctors.push(*cid);
            }
        }

        self.comp.set_c_info(
            id,
            CInfo::Typ(CDefTyp { name: id, cname: cname.clone(), typ, props, ctors, loc }),
        )?;
        self.out.type_decls.push(CStmt::DefTyp(id));

        // destructor and copy
        if dv.flags.recursive {
            self.gen_recursive_dtor(id, &dv, free_fn, &case_props, loc)?;
        } else if complex {
            self.gen_inline_dtor(id, &dv, free_fn, &case_props, enum_id, loc)?;
            self.gen_inline_copy(id, &dv, copy_fn, &case_props, loc)?;
        }
        Ok(())
    }

    /// Copy of an inline variant: transfer the tag, then copy the active
    /// payload with its own copy handle
    fn gen_inline_copy(
        &mut self,
        id: Id,
        dv: &KDefVariant,
        copy_fn: Id,
        case_props: &[CTypProps],
        loc: Loc,
    ) -> CResult<()> {
        let src = self.name_id("src");
        let dst = self.name_id("dst");
        let tag = self.name_id("tag");
        let u = self.name_id("u");
        let srcp = CExp::ident(src);
        let dstp = CExp::ident(dst);

        let mut body = Vec::new();
        if dv.flags.have_tag {
            body.push(CStmt::Exp(CExp::assign(
                CExp::arrow(dstp.clone(), tag),
                CExp::arrow(srcp.clone(), tag),
            )));
        }
        let mut cases = Vec::new();
        for ((cid, ptyp), p) in dv.cases.iter().zip(case_props) {
            if ptyp.is_void() {
                continue;
            }
            let s = CExp::mem(CExp::arrow(srcp.clone(), u), *cid);
            let d = CExp::mem(CExp::arrow(dstp.clone(), u), *cid);
            cases.push((CExp::ident(*cid), copy_elem_stmt(p, s, d)));
        }
        if dv.flags.have_tag && cases.len() > 1 {
            let arms = cases
                .into_iter()
                .map(|(val, stmt)| (vec![val], vec![stmt, CStmt::Break]))
                .collect();
            body.push(CStmt::Switch(CExp::arrow(srcp, tag), arms));
        } else {
            body.extend(cases.into_iter().map(|(_, stmt)| stmt));
        }
        let self_ptr = CTyp::RawPtr(Box::new(CTyp::Name(id)));
        self.push_fun(
            copy_fn,
            &format!("_fx_copy_{}", base(&cname_of(self.comp, id, loc)?)),
            vec![(src, self_ptr.clone()), (dst, self_ptr)],
            CTyp::Void,
            body,
            loc,
        )
    }

    /// Destructor of a recursive variant: decrement the reference count;
    /// at 1 the caller held the last reference, so free the payload
    /// (switch by tag) and release the block; in every path the local
    /// pointer is nulled.
    fn gen_recursive_dtor(
        &mut self,
        id: Id,
        dv: &KDefVariant,
        free_fn: Id,
        case_props: &[CTypProps],
        loc: Loc,
    ) -> CResult<()> {
        let dst = self.name_id("dst");
        let rc = self.name_id("rc");
        let tag = self.name_id("tag");
        let u = self.name_id("u");
        let decref = self.name_id("FX_DECREF");
        let fx_free = self.name_id("fx_free");

        let dstv = CExp::deref(CExp::ident(dst));

        // free the payloads of the complex cases
        let mut cases = Vec::new();
        for ((cid, _), p) in dv.cases.iter().zip(case_props) {
            if !p.complex {
                continue;
            }
            let payload = CExp::mem(CExp::arrow(dstv.clone(), u), *cid);
            cases.push((CExp::ident(*cid), free_elem_stmt(p, payload)));
        }
        let free_payload: Vec<CStmt> = if cases.is_empty() {
            Vec::new()
        } else if dv.flags.have_tag {
            let arms = cases
                .into_iter()
                .map(|(val, stmt)| (vec![val], vec![stmt, CStmt::Break]))
                .collect();
            vec![CStmt::Switch(CExp::arrow(dstv.clone(), tag), arms)]
        } else {
            // nullable-case variants have a single payload case
            cases.into_iter().map(|(_, stmt)| stmt).collect()
        };

        let mut last_ref = free_payload;
        last_ref.push(CStmt::Exp(CExp::call(fx_free, vec![dstv.clone()])));

        let body = vec![
            CStmt::If(
                dstv.clone(),
                Box::new(CStmt::Block(vec![
                    CStmt::If(
                        CExp::eq(
                            CExp::call(decref, vec![CExp::arrow(dstv.clone(), rc)]),
                            CExp::int(1),
                        ),
                        Box::new(CStmt::Block(last_ref)),
                        Box::new(CStmt::Nop(loc)),
                    ),
                    CStmt::Exp(CExp::assign(dstv, CExp::int(0))),
                ])),
                Box::new(CStmt::Nop(loc)),
            ),
        ];
        self.push_fun(
            free_fn,
            &format!("_fx_free_{}", base(&cname_of(self.comp, id, loc)?)),
            vec![(dst, CTyp::RawPtr(Box::new(CTyp::Name(id))))],
            CTyp::Void,
            body,
            loc,
        )
    }

    /// Destructor of an inline (non-recursive) variant: switch on the tag
    /// and free the active payload
    fn gen_inline_dtor(
        &mut self,
        id: Id,
        dv: &KDefVariant,
        free_fn: Id,
        case_props: &[CTypProps],
        enum_id: Option<Id>,
        loc: Loc,
    ) -> CResult<()> {
        let dst = self.name_id("dst");
        let tag = self.name_id("tag");
        let u = self.name_id("u");
        let dstp = CExp::ident(dst);

        let mut cases = Vec::new();
        for ((cid, _), p) in dv.cases.iter().zip(case_props) {
            if !p.complex {
                continue;
            }
            let payload = CExp::mem(CExp::arrow(dstp.clone(), u), *cid);
            cases.push((CExp::ident(*cid), free_elem_stmt(p, payload)));
        }

        let body = if dv.flags.have_tag && enum_id.is_some() {
            let arms = cases
                .into_iter()
                .map(|(val, stmt)| (vec![val], vec![stmt, CStmt::Break]))
                .collect();
            vec![CStmt::Switch(CExp::arrow(dstp, tag), arms)]
        } else {
            cases.into_iter().map(|(_, stmt)| stmt).collect()
        };
        self.push_fun(
            free_fn,
            &format!("_fx_free_{}", base(&cname_of(self.comp, id, loc)?)),
            vec![(dst, CTyp::RawPtr(Box::new(CTyp::Name(id))))],
            CTyp::Void,
            body,
            loc,
        )
    }

    /// One constructor per variant case with payload; recursive variants
    /// allocate, inline variants fill the struct in place
    fn gen_case_ctor(
        &mut self,
        vid: Id,
        dv: &KDefVariant,
        case_idx: usize,
        cid: Id,
        ptyp: &KTyp,
        _ct: CTyp,
        loc: Loc,
    ) -> CResult<()> {
        // the mangler already assigned the constructor its C name
        let cname = match get_kfun(self.comp, cid, loc) {
            Ok(df) if !df.cname.is_empty() => df.cname.clone(),
            _ => format!("{}_{}", dv.cname, self.comp.id2str(cid)),
        };
        let result = self.name_id("result");

        // flatten tuple payloads into one argument per element
        let arg_typs: Vec<KTyp> = match ptyp {
            KTyp::Tuple(elems) => elems.clone(),
            t => vec![t.clone()],
        };
        let mut args = Vec::with_capacity(arg_typs.len() + 1);
        for (i, at) in arg_typs.iter().enumerate() {
            let ct = self.ktyp2ctyp(at, loc)?;
            let p = self.ktyp_props(at, loc)?;
            let aname = self.name_id(&format!("arg{}", i));
            args.push((aname, if p.pass_by_ref { CTyp::RawPtr(Box::new(ct)) } else { ct }));
        }
        args.push((result, CTyp::RawPtr(Box::new(CTyp::Name(vid)))));

        let impl_m = if dv.flags.recursive {
            self.name_id("FX_MAKE_RECURSIVE_VARIANT_IMPL")
        } else {
            self.name_id("FX_MAKE_VARIANT_IMPL")
        };
        let body = vec![CStmt::Exp(CExp::call(
            impl_m,
            vec![CExp::ident(vid), CExp::ident(cid), CExp::int(case_idx as i64)],
        ))];
        self.push_fun(cid, &cname, args, CTyp::CInt, body, loc)
    }

    // ------------------------------------------------------------------
    // Exceptions
    // ------------------------------------------------------------------

    fn gen_exn(&mut self, id: Id, mut de: KDefExn) -> CResult<()> {
        let loc = de.loc;
        let tag = self.comp.exn_tag_next;
        self.comp.exn_tag_next -= 1;
        de.tag = tag;
        self.comp.set_k_info(id, KInfo::Exn(de.clone()))?;
        self.comp.set_c_info(
            id,
            CInfo::Exn(CDefExn { name: de.name, cname: de.cname.clone(), tag, loc }),
        )?;
        self.out.type_decls.push(CStmt::Macro { name: id, def: tag.to_string() });
        Ok(())
    }

    // ------------------------------------------------------------------

    fn push_fun(
        &mut self,
        id: Id,
        cname: &str,
        args: Vec<(Id, CTyp)>,
        rt: CTyp,
        body: Vec<CStmt>,
        loc: Loc,
    ) -> CResult<()> {
        self.comp.set_c_info(
            id,
            CInfo::Fun(Box::new(CDefFun {
                name: id,
                cname: cname.to_string(),
                args,
                rt,
                body,
                is_static: true,
                loc,
            })),
        )?;
        self.out.utility_fns.push(CStmt::DefFun(id));
        Ok(())
    }
}

/// Free one element: the macro form takes the value, the function form
/// takes its address
fn free_elem_stmt(p: &CTypProps, place: CExp) -> CStmt {
    let handle = p.free_handle();
    let use_macro = handle == p.free.0 && !p.free.0.is_none();
    if use_macro {
        CStmt::Exp(CExp::call(handle, vec![place]))
    } else {
        CStmt::Exp(CExp::call(handle, vec![CExp::addr(place)]))
    }
}

/// Copy one element: plain assignment for simple values, the copy
/// macro/function for complex ones
fn copy_elem_stmt(p: &CTypProps, src: CExp, dst: CExp) -> CStmt {
    if !p.complex {
        return CStmt::Exp(CExp::assign(dst, src));
    }
    let handle = p.copy_handle();
    let use_macro = handle == p.copy.0 && !p.copy.0.is_none();
    if use_macro {
        CStmt::Exp(CExp::call(handle, vec![src, dst]))
    } else {
        CStmt::Exp(CExp::call(handle, vec![CExp::addr(src), CExp::addr(dst)]))
    }
}

fn base(cname: &str) -> &str {
    cname.strip_prefix("_fx_").unwrap_or(cname)
}

fn cname_of(comp: &Compilation, id: Id, loc: Loc) -> CResult<String> {
    match comp.c_info(id, loc)? {
        CInfo::Typ(dt) => Ok(dt.cname.clone()),
        _ => Err(internal_err(loc, "expected a C type definition")),
    }
}
