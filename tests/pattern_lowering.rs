//! Pattern-matching compiler tests: worklist ordering, variant tag
//! handling, catch-mode rethrow and the diagnostics.

use kyanite::ast::*;
use kyanite::codegen::kform::*;
use kyanite::test_support::*;
use kyanite::CompileError;

fn stmts_of(e: &KExp) -> Vec<&KExp> {
    match e {
        KExp::Seq(elems, _) => elems.iter().collect(),
        other => vec![other],
    }
}

fn find_match(e: &KExp) -> &KExp {
    stmts_of(e)
        .into_iter()
        .find(|s| matches!(s, KExp::Match(..)))
        .expect("expected a lowered match")
}

fn match_cases(e: &KExp) -> &Vec<KCase> {
    match find_match(e) {
        KExp::Match(cases, _) => cases,
        _ => unreachable!(),
    }
}

/// A two-case int option used by several tests
fn int_option(t: &mut TestCtx, m: kyanite::ModuleId) -> (kyanite::Id, Vec<kyanite::Id>, Type) {
    let (vid, cases) = t.defvariant(
        m,
        "intopt",
        vec![("SomeI", Type::Int), ("NoneI", Type::Void)],
        VariantFlags { recursive: true, opt: true, ..VariantFlags::default() },
    );
    let typ = Type::App(vec![], vid);
    (vid, cases, typ)
}

// ============================================================================
// Variant matching
// ============================================================================

#[test]
fn two_case_variant_match_tests_the_tag() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let (_, cases, opt_t) = int_option(&mut t, m);
    let x = t.comp.new_val("x");
    let o = t.comp.new_val("o");

    // match o { SomeI(x) => x, NoneI => 0 }
    let body = matches(
        ident(o, opt_t.clone()),
        vec![
            case(vec![pvariant(cases[0], vec![pid(x)])], ident(x, Type::Int)),
            case(vec![pvariant(cases[1], vec![])], int(0)),
        ],
        Type::Int,
    );
    let f = t.deffun(m, "get", vec![(o, opt_t)], Type::Int, body);
    t.compile().unwrap();

    let df = t.kfun(f);
    let kcases = match_cases(&df.body);
    // two source cases plus the NoMatchError fallthrough
    assert_eq!(kcases.len(), 3);
    // the first case's check extracts the tag and compares it
    assert_eq!(kcases[0].checks.len(), 1);
    let chk = &kcases[0].checks[0];
    let has_tag_intrin = stmts_of(chk).iter().any(|s| {
        matches!(s, KExp::DefVal(_, rhs, _)
            if matches!(**rhs, KExp::Intrin(KIntrin::VariantTag, _, _)))
    });
    assert!(has_tag_intrin, "the tag must be extracted with VARIANT_TAG");
    // the payload binding uses VARIANT_CASE and lands in the body
    let body_has_case = stmts_of(&kcases[0].body).iter().any(|s| {
        matches!(s, KExp::DefVal(_, rhs, _)
            if matches!(**rhs, KExp::Intrin(KIntrin::VariantCase, _, _)))
    });
    assert!(body_has_case, "the payload must be extracted with VARIANT_CASE");
    // fallthrough throws NoMatchError
    match &kcases[2].body {
        KExp::Throw(id, false, _) => assert_eq!(*id, t.comp.no_match_error),
        other => panic!("expected a NoMatchError throw, got {:?}", other),
    }
    assert!(kcases[2].checks.is_empty());
}

#[test]
fn tag_is_extracted_once_per_case() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let (_, cases, opt_t) = int_option(&mut t, m);
    let o = t.comp.new_val("o");
    let x = t.comp.new_val("x");

    // a guard plus a payload check reuse the same extracted tag
    let pat = p(PatKind::When(
        Box::new(pvariant(cases[0], vec![pid(x)])),
        Box::new(binary(BinOp::Gt, ident(x, Type::Int), int(0), Type::Bool)),
    ));
    let body = matches(
        ident(o, opt_t.clone()),
        vec![case(vec![pat], ident(x, Type::Int)), case(vec![pany()], int(0))],
        Type::Int,
    );
    let f = t.deffun(m, "pos", vec![(o, opt_t)], Type::Int, body);
    t.compile().unwrap();

    let df = t.kfun(f);
    let kcases = match_cases(&df.body);
    let mut tag_extractions = 0;
    for chk in &kcases[0].checks {
        for s in stmts_of(chk) {
            if matches!(s, KExp::DefVal(_, rhs, _)
                if matches!(**rhs, KExp::Intrin(KIntrin::VariantTag, _, _)))
            {
                tag_extractions += 1;
            }
        }
    }
    assert_eq!(tag_extractions, 1);
    // the guard is the last check of the case
    assert_eq!(kcases[0].checks.len(), 2);
}

#[test]
fn wildcard_case_suppresses_the_fallthrough() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let x = t.comp.new_val("x");
    let body = matches(
        ident(x, Type::Int),
        vec![case(vec![plit(Lit::Int(1))], int(10)), case(vec![pany()], int(0))],
        Type::Int,
    );
    let f = t.deffun(m, "f", vec![(x, Type::Int)], Type::Int, body);
    t.compile().unwrap();

    let f_fn = t.kfun(f);
    let kcases = match_cases(&f_fn.body);
    assert_eq!(kcases.len(), 2);
    assert!(kcases[1].checks.is_empty());
    assert!(!matches!(kcases[1].body, KExp::Throw(..)));
}

#[test]
fn unreachable_case_is_reported() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let x = t.comp.new_val("x");
    let body = matches(
        ident(x, Type::Int),
        vec![
            case(vec![pany()], int(0)),
            case(vec![plit(Lit::Int(1))], int(1)),
        ],
        Type::Int,
    );
    t.deffun(m, "f", vec![(x, Type::Int)], Type::Int, body);
    let errs = t.compile().unwrap_err();
    assert!(errs
        .iter()
        .any(|err| matches!(err, CompileError::PatternMatch { .. })));
}

// ============================================================================
// Worklist ordering: literals first
// ============================================================================

#[test]
fn literal_checks_run_before_captures() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let x = t.comp.new_val("x");
    let pr = t.comp.new_val("pr");
    let tup_t = Type::Tuple(vec![Type::Int, Type::Int]);

    // match pr { (1, x) => x, _ => 0 }
    let body = matches(
        ident(pr, tup_t.clone()),
        vec![
            case(
                vec![p(PatKind::Tuple(vec![plit(Lit::Int(1)), pid(x)]))],
                ident(x, Type::Int),
            ),
            case(vec![pany()], int(0)),
        ],
        Type::Int,
    );
    let f = t.deffun(m, "f", vec![(pr, tup_t)], Type::Int, body);
    t.compile().unwrap();

    let f_fn = t.kfun(f);
    let kcases = match_cases(&f_fn.body);
    // exactly one check (the literal); the capture is body-only code
    assert_eq!(kcases[0].checks.len(), 1);
    let binds_in_body = stmts_of(&kcases[0].body)
        .iter()
        .filter(|s| matches!(s, KExp::DefVal(..)))
        .count();
    assert!(binds_in_body >= 1, "the capture must be bound in the case body");
}

// ============================================================================
// Cons patterns
// ============================================================================

#[test]
fn cons_pattern_tests_nil_and_splits() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let h = t.comp.new_val("h");
    let tl = t.comp.new_val("tl");
    let xs = t.comp.new_val("xs");
    let list_t = Type::List(Box::new(Type::Int));

    // match xs { h :: tl => h, [] => 0 }
    let body = matches(
        ident(xs, list_t.clone()),
        vec![
            case(
                vec![p(PatKind::Cons(Box::new(pid(h)), Box::new(pid(tl))))],
                ident(h, Type::Int),
            ),
            case(vec![plit(Lit::Nil)], int(0)),
        ],
        Type::Int,
    );
    let f = t.deffun(m, "head_or_zero", vec![(xs, list_t)], Type::Int, body);
    t.compile().unwrap();

    let f_fn = t.kfun(f);
    let kcases = match_cases(&f_fn.body);
    // first case: one != nil check
    assert_eq!(kcases[0].checks.len(), 1);
    let is_nil_check = |chk: &KExp| {
        stmts_of(chk).iter().any(|s| {
            matches!(s, KExp::Binary(BinOp::Ne, _, Atom::Lit(Lit::Nil), _))
        })
    };
    assert!(is_nil_check(&kcases[0].checks[0]));
    // head and tail extraction in the body
    let body_stmts = stmts_of(&kcases[0].body);
    let heads = body_stmts.iter().filter(|s| {
        matches!(s, KExp::DefVal(_, rhs, _)
            if matches!(**rhs, KExp::Intrin(KIntrin::ListHead, _, _)))
    });
    let tails = body_stmts.iter().filter(|s| {
        matches!(s, KExp::DefVal(_, rhs, _)
            if matches!(**rhs, KExp::Intrin(KIntrin::ListTail, _, _)))
    });
    assert_eq!(heads.count(), 1);
    assert_eq!(tails.count(), 1);
}

// ============================================================================
// Record patterns against variant cases
// ============================================================================

#[test]
fn record_pattern_matches_like_variant_pattern() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let (rec, fields) = t.defrecord(m, "point", vec![("px", Type::Int, None), ("py", Type::Int, None)]);
    let (vid, cases) = t.defvariant(
        m,
        "shape",
        vec![("Dot", Type::Record(rec)), ("Nothing", Type::Void)],
        VariantFlags::default(),
    );
    let shape_t = Type::App(vec![], vid);
    let px = fields[0];

    let s1 = t.comp.new_val("s1");
    let a = t.comp.new_val("a");
    let body1 = matches(
        ident(s1, shape_t.clone()),
        vec![
            case(
                vec![p(PatKind::Record(Some(cases[0]), vec![(px, pid(a))]))],
                ident(a, Type::Int),
            ),
            case(vec![pany()], int(0)),
        ],
        Type::Int,
    );
    let f1 = t.deffun(m, "f1", vec![(s1, shape_t.clone())], Type::Int, body1);

    let s2 = t.comp.new_val("s2");
    let b = t.comp.new_val("b");
    let body2 = matches(
        ident(s2, shape_t.clone()),
        vec![
            case(
                vec![pvariant(
                    cases[0],
                    vec![p(PatKind::Record(None, vec![(px, pid(b))]))],
                )],
                ident(b, Type::Int),
            ),
            case(vec![pany()], int(0)),
        ],
        Type::Int,
    );
    let f2 = t.deffun(m, "f2", vec![(s2, shape_t)], Type::Int, body2);
    t.compile().unwrap();

    // both lowerings produce one tag check and extract the same field
    let f1_fn = t.kfun(f1);
    let c1 = match_cases(&f1_fn.body);
    let f2_fn = t.kfun(f2);
    let c2 = match_cases(&f2_fn.body);
    assert_eq!(c1[0].checks.len(), c2[0].checks.len());
    let case_extracts = |body: &KExp| {
        stmts_of(body)
            .iter()
            .filter(|s| {
                matches!(s, KExp::DefVal(_, rhs, _)
                    if matches!(**rhs, KExp::Intrin(KIntrin::VariantCase, _, _) | KExp::Mem(..)))
            })
            .count()
    };
    assert_eq!(case_extracts(&c1[0].body), case_extracts(&c2[0].body));
}

#[test]
fn no_capture_variant_field_still_generates_checks() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    // type status = Ready | Busy; type task = { st: status }
    let (svid, scases) = t.defvariant(
        m,
        "status",
        vec![("Ready", Type::Void), ("Busy", Type::Void)],
        VariantFlags::default(),
    );
    let (rec, fields) =
        t.defrecord(m, "task", vec![("st", Type::App(vec![], svid), None)]);
    let r = t.comp.new_val("r");
    // match r { { st: Ready } => 1, _ => 0 }: the field binds nothing,
    // but the case test on its tag must still be emitted
    let body = matches(
        ident(r, Type::Record(rec)),
        vec![
            case(
                vec![p(PatKind::Record(None, vec![(fields[0], pvariant(scases[0], vec![]))]))],
                int(1),
            ),
            case(vec![pany()], int(0)),
        ],
        Type::Int,
    );
    let f = t.deffun(m, "f", vec![(r, Type::Record(rec))], Type::Int, body);
    t.compile().unwrap();

    let f_fn = t.kfun(f);
    let kcases = match_cases(&f_fn.body);
    // the wildcard closes the match: no fallthrough throw
    assert_eq!(kcases.len(), 2);
    // and the first case tests the field's variant tag
    assert_eq!(kcases[0].checks.len(), 1);
    let has_tag = stmts_of(&kcases[0].checks[0]).iter().any(|s| {
        matches!(s, KExp::DefVal(_, rhs, _)
            if matches!(**rhs, KExp::Intrin(KIntrin::VariantTag, _, _)))
    });
    assert!(has_tag, "the no-capture field must still be tag-tested");
}

#[test]
fn literal_only_tuple_field_still_generates_checks() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let (rec, fields) = t.defrecord(
        m,
        "cell",
        vec![("point", Type::Tuple(vec![Type::Int, Type::Int]), None)],
    );
    let r = t.comp.new_val("r");
    // match r { { point: (0, 1) } => 1, _ => 0 }
    let body = matches(
        ident(r, Type::Record(rec)),
        vec![
            case(
                vec![p(PatKind::Record(
                    None,
                    vec![(
                        fields[0],
                        p(PatKind::Tuple(vec![plit(Lit::Int(0)), plit(Lit::Int(1))])),
                    )],
                ))],
                int(1),
            ),
            case(vec![pany()], int(0)),
        ],
        Type::Int,
    );
    let f = t.deffun(m, "f", vec![(r, Type::Record(rec))], Type::Int, body);
    t.compile().unwrap();

    let f_fn = t.kfun(f);
    let kcases = match_cases(&f_fn.body);
    assert_eq!(kcases.len(), 2);
    // one equality test per literal element
    assert_eq!(kcases[0].checks.len(), 2);
    for chk in &kcases[0].checks {
        let is_eq = stmts_of(chk)
            .iter()
            .any(|s| matches!(s, KExp::Binary(BinOp::Eq, _, Atom::Lit(Lit::Int(_)), _)));
        assert!(is_eq, "expected a literal equality test, got {:?}", chk);
    }
}

// ============================================================================
// Catch mode
// ============================================================================

#[test]
fn catch_mode_rethrows_on_no_match() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let fail = t.defexn(m, "Fail", Type::Str);
    let msg = t.comp.new_val("msg");
    let g = t.deffun(m, "g", vec![], Type::Int, int(1));
    let gi = ident(g, Type::Fun(vec![], Box::new(Type::Int)));
    let body = e(
        ExpKind::Try(
            Box::new(call(gi, vec![], Type::Int)),
            vec![case(vec![pvariant(fail, vec![pid(msg)])], int(0))],
        ),
        Type::Int,
    );
    let f = t.deffun(m, "f", vec![], Type::Int, body);
    t.compile().unwrap();

    let df = t.kfun(f);
    let handler = match &df.body {
        KExp::TryCatch(_, handler, _) => handler,
        other => panic!("expected try/catch, got {:?}", other),
    };
    let kcases = match_cases(handler);
    let last = kcases.last().unwrap();
    assert!(last.checks.is_empty());
    match &last.body {
        KExp::Throw(_, rethrow, _) => assert!(rethrow, "catch fallthrough must rethrow"),
        other => panic!("expected a rethrow, got {:?}", other),
    }
}
