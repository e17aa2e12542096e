//! Name mangling tests: signature encoding, materialized types,
//! uniqueness and determinism.

use std::collections::HashSet;

use kyanite::ast::*;
use kyanite::codegen::kform::*;
use kyanite::codegen::mangle::type_signature;
use kyanite::test_support::*;

// ============================================================================
// Materialization
// ============================================================================

#[test]
fn tuple_value_materializes_a_named_type() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let x = t.comp.new_val("x");
    // val x = (1, 2.0, "hi")
    t.push_stmt(m, defval(pid(x), tuple(vec![int(1), dbl(2.0), string("hi")])));
    t.compile().unwrap();

    // one KDefTyp named _fx_T3idS
    let dt = t.find_ctype("_fx_T3idS").expect("the tuple type must be materialized");
    match &dt.typ {
        kyanite::codegen::cform::CTyp::Struct(_, fields) => {
            assert_eq!(fields.len(), 3);
            assert!(matches!(fields[0].1, kyanite::codegen::cform::CTyp::Int));
            assert!(matches!(fields[1].1, kyanite::codegen::cform::CTyp::Float(64)));
            assert!(matches!(fields[2].1, kyanite::codegen::cform::CTyp::Str));
        }
        other => panic!("expected a struct layout, got {:?}", other),
    }

    // its destructor frees the string field only
    let free = t.find_cfun("_fx_free_T3idS").expect("complex tuple needs a destructor");
    assert_eq!(free.body.len(), 1);
}

#[test]
fn distinct_signatures_share_one_entry() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let x = t.comp.new_val("x");
    let y = t.comp.new_val("y");
    t.push_stmt(m, defval(pid(x), tuple(vec![int(1), dbl(2.0), string("a")])));
    t.push_stmt(m, defval(pid(y), tuple(vec![int(2), dbl(3.0), string("b")])));
    t.compile().unwrap();

    let names = t.all_ctype_names();
    let count = names.iter().filter(|n| *n == "_fx_T3idS").count();
    assert_eq!(count, 1, "one materialized entry per distinct signature");
}

#[test]
fn same_name_in_two_modules_stays_unique() {
    let mut t = TestCtx::new();
    let ma = t.add_module("Alpha", false);
    let mb = t.add_module("Beta", true);
    t.import(mb, ma);
    let fa = t.deffun(ma, "norm", vec![], Type::Int, int(1));
    let fb = t.deffun(mb, "norm", vec![], Type::Int, int(2));
    t.compile().unwrap();

    let ca = t.kfun(fa).cname;
    let cb = t.kfun(fb).cname;
    assert_ne!(ca, cb);
    assert!(ca.starts_with("_fx_Alpha__"));
    assert!(cb.starts_with("_fx_Beta__"));
}

#[test]
fn colliding_names_get_a_bump_suffix() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    // two values with the same bare name and type in one module scope
    // (as template instances would produce)
    let x1 = t.comp.new_val("w");
    let x2 = t.comp.new_val("w");
    t.push_stmt(m, defval(pid(x1), int(1)));
    t.push_stmt(m, defval(pid(x2), int(2)));
    t.compile().unwrap();

    let n1 = match t.comp.k_info(x1, kyanite::Loc::NONE).unwrap() {
        KInfo::Val(dv) => dv.cname.clone(),
        _ => unreachable!(),
    };
    let n2 = match t.comp.k_info(x2, kyanite::Loc::NONE).unwrap() {
        KInfo::Val(dv) => dv.cname.clone(),
        _ => unreachable!(),
    };
    assert_ne!(n1, n2);
    assert!(n2.contains("1_") || n1.contains("1_"));
}

// ============================================================================
// Determinism and uniqueness over a whole compilation
// ============================================================================

fn build_sample(t: &mut TestCtx) -> Vec<kyanite::Id> {
    let m = t.add_module("Main", true);
    let x = t.comp.new_val("x");
    let f = t.deffun(
        m,
        "f",
        vec![(x, Type::Int)],
        Type::Tuple(vec![Type::Int, Type::Str]),
        tuple(vec![ident(x, Type::Int), string("s")]),
    );
    let g = t.deffun(m, "g", vec![], Type::List(Box::new(Type::Int)), {
        e(ExpKind::MkList(vec![int(1), int(2)]), Type::List(Box::new(Type::Int)))
    });
    vec![f, g]
}

#[test]
fn mangling_is_deterministic() {
    let mut t1 = TestCtx::new();
    let ids1 = build_sample(&mut t1);
    t1.compile().unwrap();
    let mut t2 = TestCtx::new();
    let ids2 = build_sample(&mut t2);
    t2.compile().unwrap();

    for (a, b) in ids1.iter().zip(&ids2) {
        assert_eq!(t1.kfun(*a).cname, t2.kfun(*b).cname);
    }
}

#[test]
fn mangled_names_are_globally_unique() {
    let mut t = TestCtx::new();
    build_sample(&mut t);
    t.compile().unwrap();

    let mut seen = HashSet::new();
    for name in t.all_cnames() {
        assert!(seen.insert(name.clone()), "duplicate mangled name: {}", name);
    }
}

// ============================================================================
// Signature encoding details
// ============================================================================

#[test]
fn signature_of_function_type() {
    let mut t = TestCtx::bare();
    let ft = KTyp::Fun(vec![KTyp::Int, KTyp::Bool], Box::new(KTyp::Str));
    assert_eq!(type_signature(&mut t.comp, &ft).unwrap(), "FPS2iB");
}

#[test]
fn signature_is_stable_across_calls() {
    let mut t = TestCtx::bare();
    let typ = KTyp::Ref(Box::new(KTyp::List(Box::new(KTyp::Char))));
    let a = type_signature(&mut t.comp, &typ).unwrap();
    let b = type_signature(&mut t.comp, &typ).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, "rLC");
}

#[test]
fn module_prefix_in_signature_collapses_to_a_length_marker() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    // a same-module nominal parameter type bakes "Main__" into the
    // function's signature suffix
    let (rec, _) = t.defrecord(m, "pt", vec![("px", Type::Int, None)]);
    let r = t.comp.new_val("r");
    let f = t.deffun(m, "area", vec![(r, Type::Record(rec))], Type::Int, int(0));
    t.compile().unwrap();

    let cname = t.kfun(f).cname;
    // the record's base name "Main__2pt" appears as "M6" + "2pt": the
    // repeated module prefix is replaced by its length marker
    assert!(cname.starts_with("_fx_Main__4area"), "unexpected name: {}", cname);
    assert!(cname.contains("M62pt"), "signature must carry the length marker: {}", cname);
    assert_eq!(cname.matches("Main__").count(), 1);
}

#[test]
fn std_exception_names_use_the_runtime_prefix() {
    let mut t = TestCtx::new();
    t.add_module("Main", true);
    t.compile().unwrap();
    let nm = t.comp.no_match_error;
    let de = get_kexn(&t.comp, nm, kyanite::Loc::NONE).unwrap();
    assert_eq!(de.cname, "FX_EXN_NoMatchError");
}

#[test]
fn user_exception_names_use_the_user_prefix() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let fail = t.defexn(m, "Fail", Type::Void);
    t.compile().unwrap();
    let de = get_kexn(&t.comp, fail, kyanite::Loc::NONE).unwrap();
    assert!(de.cname.starts_with("_fx_Main__"));
}

// ============================================================================
// Post-mangling structural invariant
// ============================================================================

#[test]
fn no_structural_types_survive_in_signatures() {
    let mut t = TestCtx::new();
    build_sample(&mut t);
    t.compile().unwrap();

    // every function's parameter and return type is nominal or scalar
    for id in t.all_kfun_ids() {
        let df = t.kfun(id);
        for (_, pt) in &df.params {
            assert_nominal(pt);
        }
        assert_nominal(&df.rt);
    }
}

fn assert_nominal(t: &KTyp) {
    match t {
        KTyp::Tuple(_) | KTyp::List(_) | KTyp::Ref(_) | KTyp::Fun(..) => {
            panic!("structural type survived mangling: {:?}", t)
        }
        KTyp::Array(_, elt) => assert_nominal(elt),
        _ => {}
    }
}
