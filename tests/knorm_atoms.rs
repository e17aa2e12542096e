//! K-normalization tests: atomic operands and the core lowerings
//!
//! These tests drive the whole middle-end through `TestCtx` and inspect
//! the K-form stored in the info tables.

use kyanite::ast::*;
use kyanite::codegen::kform::*;
use kyanite::test_support::*;

// ============================================================================
// Shape helpers
// ============================================================================

/// Flatten a body into its statement list
fn stmts_of(e: &KExp) -> Vec<&KExp> {
    match e {
        KExp::Seq(elems, _) => elems.iter().collect(),
        other => vec![other],
    }
}

fn count_defvals(e: &KExp) -> usize {
    stmts_of(e)
        .iter()
        .filter(|s| matches!(s, KExp::DefVal(..)))
        .count()
}

// ============================================================================
// Operand atomization
// ============================================================================

#[test]
fn nested_arithmetic_introduces_temporaries() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let x = t.comp.new_val("x");
    // fun f(x: int) = (x + 1) * (x + 2)
    let body = binary(
        BinOp::Mul,
        add(ident(x, Type::Int), int(1)),
        add(ident(x, Type::Int), int(2)),
        Type::Int,
    );
    let f = t.deffun(m, "f", vec![(x, Type::Int)], Type::Int, body);
    t.compile().unwrap();

    let df = t.kfun(f);
    // both operands of the final multiply must be identifier atoms bound
    // by earlier value definitions
    match stmts_of(&df.body).last().unwrap() {
        KExp::Binary(BinOp::Mul, Atom::Id(_), Atom::Id(_), _) => {}
        other => panic!("expected a multiply of two atoms, got {:?}", other),
    }
    assert_eq!(count_defvals(&df.body), 2);
}

#[test]
fn short_circuit_and_becomes_if() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let a = t.comp.new_val("a");
    let b = t.comp.new_val("b");
    let body = binary(
        BinOp::LogAnd,
        ident(a, Type::Bool),
        ident(b, Type::Bool),
        Type::Bool,
    );
    let f = t.deffun(m, "f", vec![(a, Type::Bool), (b, Type::Bool)], Type::Bool, body);
    t.compile().unwrap();

    let df = t.kfun(f);
    match &df.body {
        KExp::If(_, then_b, else_b, _) => {
            // `a && b` => `if a then b else false`
            assert!(matches!(**then_b, KExp::Atom(Atom::Id(_), _)));
            assert!(matches!(**else_b, KExp::Atom(Atom::Lit(Lit::Bool(false)), _)));
        }
        other => panic!("expected an if-expression, got {:?}", other),
    }
}

#[test]
fn short_circuit_or_becomes_if() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let a = t.comp.new_val("a");
    let b = t.comp.new_val("b");
    let body = binary(
        BinOp::LogOr,
        ident(a, Type::Bool),
        ident(b, Type::Bool),
        Type::Bool,
    );
    let f = t.deffun(m, "f", vec![(a, Type::Bool), (b, Type::Bool)], Type::Bool, body);
    t.compile().unwrap();

    let df = t.kfun(f);
    match &df.body {
        KExp::If(_, then_b, _, _) => {
            assert!(matches!(**then_b, KExp::Atom(Atom::Lit(Lit::Bool(true)), _)));
        }
        other => panic!("expected an if-expression, got {:?}", other),
    }
}

#[test]
fn string_concatenation_is_an_intrinsic() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let s = t.comp.new_val("s");
    let body = binary(BinOp::Add, ident(s, Type::Str), string("!"), Type::Str);
    let f = t.deffun(m, "f", vec![(s, Type::Str)], Type::Str, body);
    t.compile().unwrap();

    let df = t.kfun(f);
    assert!(
        matches!(df.body, KExp::Intrin(KIntrin::StrConcat, _, _)),
        "string + string must lower to the concat intrinsic"
    );
}

#[test]
fn integer_add_stays_binary() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let x = t.comp.new_val("x");
    let f = t.deffun(m, "f", vec![(x, Type::Int)], Type::Int, add(ident(x, Type::Int), int(1)));
    t.compile().unwrap();
    assert!(matches!(t.kfun(f).body, KExp::Binary(BinOp::Add, _, _, _)));
}

// ============================================================================
// Value definitions
// ============================================================================

#[test]
fn wildcard_binding_keeps_side_effects() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let g = t.deffun(m, "g", vec![], Type::Int, int(7));
    // fun f() { val _ = g(); 0 }
    let gi = ident(g, Type::Fun(vec![], Box::new(Type::Int)));
    let body = seq(vec![defval(pany(), call(gi, vec![], Type::Int)), int(0)]);
    let f = t.deffun(m, "f", vec![], Type::Int, body);
    t.compile().unwrap();

    let df = t.kfun(f);
    let has_call = stmts_of(&df.body)
        .iter()
        .any(|s| matches!(s, KExp::Call(..) | KExp::DefVal(..)));
    assert!(has_call, "the discarded call must be retained for its effect");
    // but no binding is introduced for the wildcard itself
    assert_eq!(count_defvals(&df.body), 0);
}

#[test]
fn tuple_binding_unpacks_fields() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let a = t.comp.new_val("a");
    let b = t.comp.new_val("b");
    // fun f() { val (a, b) = (1, 2); a + b }
    let body = seq(vec![
        defval(
            p(PatKind::Tuple(vec![pid(a), pid(b)])),
            tuple(vec![int(1), int(2)]),
        ),
        add(ident(a, Type::Int), ident(b, Type::Int)),
    ]);
    let f = t.deffun(m, "f", vec![], Type::Int, body);
    t.compile().unwrap();

    let df = t.kfun(f);
    // tuple temp + one binding per element
    assert!(count_defvals(&df.body) >= 3);
    let mem_bindings = stmts_of(&df.body)
        .iter()
        .filter(|s| matches!(s, KExp::DefVal(_, rhs, _) if matches!(**rhs, KExp::Mem(..))))
        .count();
    assert_eq!(mem_bindings, 2);
}

#[test]
fn binding_then_reading_preserves_the_value() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let x = t.comp.new_val("x");
    let a = t.comp.new_val("a");
    // fun f(a: int) { val x = a + 1; x }
    let body = seq(vec![
        defval(pid(x), add(ident(a, Type::Int), int(1))),
        ident(x, Type::Int),
    ]);
    let f = t.deffun(m, "f", vec![(a, Type::Int)], Type::Int, body);
    t.compile().unwrap();

    // one binding for x holding the lowered initializer, then x itself
    let df = t.kfun(f);
    let stmts = stmts_of(&df.body);
    assert!(matches!(
        stmts[0],
        KExp::DefVal(id, _, _) if *id == x
    ));
    match stmts.last().unwrap() {
        KExp::Atom(Atom::Id(id), _) => assert_eq!(*id, x),
        other => panic!("expected the bound value, got {:?}", other),
    }
}

#[test]
fn refutable_pattern_in_val_is_rejected() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let (vid, cases) = t.defvariant(
        m,
        "opt",
        vec![("SomeV", Type::Int), ("NoneV", Type::Void)],
        VariantFlags::default(),
    );
    let x = t.comp.new_val("x");
    let opt_t = Type::App(vec![], vid);
    let body = seq(vec![
        defval(pvariant(cases[0], vec![pid(x)]), ident(cases[1], opt_t)),
        int(0),
    ]);
    t.deffun(m, "f", vec![], Type::Int, body);
    let errs = t.compile().unwrap_err();
    assert!(errs
        .iter()
        .any(|err| matches!(err, kyanite::CompileError::PatternMatch { .. })));
}

// ============================================================================
// Free variables
// ============================================================================

#[test]
fn function_bodies_are_closed_after_normalization() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let g = t.deffun(m, "g", vec![], Type::Int, int(1));
    let x = t.comp.new_val("x");
    let gi = ident(g, Type::Fun(vec![], Box::new(Type::Int)));
    let body = add(ident(x, Type::Int), call(gi, vec![], Type::Int));
    let f = t.deffun(m, "f", vec![(x, Type::Int)], Type::Int, body);
    t.compile().unwrap();

    let df = t.kfun(f);
    let fv = fun_free_vars(&df, &t.comp);
    // everything free in the body is a global (or a constructor)
    for id in fv {
        assert!(
            is_hoistable_ref(&t.comp, id),
            "free variable {:?} is not a global entity",
            id
        );
    }
}

// ============================================================================
// Match scrutinee stability
// ============================================================================

#[test]
fn match_on_mutable_value_copies_the_scrutinee() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let x = t.comp.new_val("x");
    // fun f(x: int) { x = 5; match x { 0 => 1, _ => 2 } }
    let body = seq(vec![
        e(
            ExpKind::Assign(
                Box::new(ident(x, Type::Int)),
                Box::new(int(5)),
            ),
            Type::Void,
        ),
        matches(
            ident(x, Type::Int),
            vec![
                case(vec![plit(Lit::Int(0))], int(1)),
                case(vec![pany()], int(2)),
            ],
            Type::Int,
        ),
    ]);
    let f = t.deffun(m, "f", vec![(x, Type::Int)], Type::Int, body);
    t.compile().unwrap();

    let df = t.kfun(f);
    // an immutable copy is bound right before the match
    let copies = stmts_of(&df.body)
        .iter()
        .filter(|s| match s {
            KExp::DefVal(id, rhs, _) => {
                !matches!(
                    t.comp.k_info_opt(*id),
                    Some(KInfo::Val(dv)) if dv.flags.mutable
                ) && matches!(&**rhs, KExp::Atom(Atom::Id(src), _) if *src == x)
            }
            _ => false,
        })
        .count();
    assert_eq!(copies, 1, "the mutable scrutinee must be copied into a fresh value");
}

// ============================================================================
// Comprehensions
// ============================================================================

#[test]
fn nested_comprehension_keeps_clause_stages() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let i = t.comp.new_val("i");
    let j = t.comp.new_val("j");
    // [for i <- 0:10 for j <- i:10 when i != j {(i, j)}]
    let range = |lo: Exp, hi: Exp| {
        e(
            ExpKind::Range(Some(Box::new(lo)), Some(Box::new(hi)), None),
            Type::Tuple(vec![Type::Int, Type::Int, Type::Int]),
        )
    };
    let stage1 = ForClause { iters: vec![(pid(i), range(int(0), int(10)))], at_idx: pany(), guard: None };
    let stage2 = ForClause {
        iters: vec![(pid(j), range(ident(i, Type::Int), int(10)))],
        at_idx: pany(),
        guard: Some(Box::new(binary(
            BinOp::Ne,
            ident(i, Type::Int),
            ident(j, Type::Int),
            Type::Bool,
        ))),
    };
    let elem = tuple(vec![ident(i, Type::Int), ident(j, Type::Int)]);
    let elem_t = elem.typ.clone();
    let body = e(
        ExpKind::Map(vec![stage1, stage2], Box::new(elem)),
        Type::List(Box::new(elem_t)),
    );
    let f = t.deffun(
        m,
        "pairs",
        vec![],
        Type::List(Box::new(Type::Tuple(vec![Type::Int, Type::Int]))),
        body,
    );
    t.compile().unwrap();

    let df = t.kfun(f);
    let map = stmts_of(&df.body)
        .into_iter()
        .find(|s| matches!(s, KExp::Map(..)))
        .expect("the comprehension must lower to KExp::Map");
    match map {
        KExp::Map(stages, body, _) => {
            assert_eq!(stages.len(), 2, "one clause stage per source nesting level");
            assert!(matches!(stages[0].iters[0].1, Dom::Range(..)));
            assert!(matches!(stages[1].iters[0].1, Dom::Range(..)));
            // the guard compiles to a continue-test at the head of the body
            let has_continue_test = stmts_of(body).iter().any(|s| {
                matches!(s, KExp::If(_, _, els, _) if matches!(**els, KExp::Continue(_)))
            });
            assert!(has_continue_test, "the when-guard must become a continue test");
        }
        _ => unreachable!(),
    }

    // the materialized list type exists after mangling
    let tid = {
        let list_t = KTyp::List(Box::new(KTyp::Tuple(vec![KTyp::Int, KTyp::Int])));
        kyanite::codegen::mangle::type_signature(&mut t.comp, &list_t).unwrap()
    };
    assert_eq!(tid, "LTa2i");
    assert!(t.find_ctype("_fx_LTa2i").is_some());
}

// ============================================================================
// Loops
// ============================================================================

#[test]
fn while_loop_keeps_condition_inside_the_loop() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let x = t.comp.new_val("x");
    // fun f(x: int) { while x + 0 > 0 { x = x - 1 }; x }
    let cond = binary(
        BinOp::Gt,
        add(ident(x, Type::Int), int(0)),
        int(0),
        Type::Bool,
    );
    let upd = e(
        ExpKind::Assign(
            Box::new(ident(x, Type::Int)),
            Box::new(binary(BinOp::Sub, ident(x, Type::Int), int(1), Type::Int)),
        ),
        Type::Void,
    );
    let body = seq(vec![
        e(ExpKind::While(Box::new(cond), Box::new(upd)), Type::Void),
        ident(x, Type::Int),
    ]);
    let f = t.deffun(m, "f", vec![(x, Type::Int)], Type::Int, body);
    t.compile().unwrap();

    let df = t.kfun(f);
    let wl = stmts_of(&df.body)
        .into_iter()
        .find(|s| matches!(s, KExp::While(..)))
        .expect("while survives lowering");
    match wl {
        KExp::While(cond, _, _) => {
            // the condition's helper code re-evaluates on every round
            assert!(matches!(**cond, KExp::Seq(..)));
        }
        _ => unreachable!(),
    }
}

#[test]
fn do_while_keeps_post_test_shape() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let x = t.comp.new_val("x");
    let body_stmt = e(
        ExpKind::Assign(
            Box::new(ident(x, Type::Int)),
            Box::new(binary(BinOp::Sub, ident(x, Type::Int), int(1), Type::Int)),
        ),
        Type::Void,
    );
    let cond = binary(BinOp::Gt, ident(x, Type::Int), int(0), Type::Bool);
    let body = seq(vec![
        e(ExpKind::DoWhile(Box::new(body_stmt), Box::new(cond)), Type::Void),
        ident(x, Type::Int),
    ]);
    let f = t.deffun(m, "f", vec![(x, Type::Int)], Type::Int, body);
    t.compile().unwrap();
    let df = t.kfun(f);
    assert!(stmts_of(&df.body).iter().any(|s| matches!(s, KExp::DoWhile(..))));
}

// ============================================================================
// Exceptions
// ============================================================================

#[test]
fn try_catch_pops_the_exception() {
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
    match &df.body {
        KExp::TryCatch(_, handler, _) => {
            let stmts = stmts_of(handler);
            // the handler starts by popping the exception into a value
            let has_pop = stmts.iter().any(|s| {
                matches!(s, KExp::DefVal(_, rhs, _)
                    if matches!(**rhs, KExp::Intrin(KIntrin::PopExn, _, _)))
            });
            assert!(has_pop, "the handler must pop the current exception first");
            // and ends with a catch-mode match
            assert!(stmts.iter().any(|s| matches!(s, KExp::Match(..))));
        }
        other => panic!("expected try/catch, got {:?}", other),
    }
}

#[test]
fn id_atoms_everywhere_in_call_arguments() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let x = t.comp.new_val("x");
    let g2 = t.deffun(m, "g2", vec![], Type::Int, int(2));
    let gi = ident(g2, Type::Fun(vec![], Box::new(Type::Int)));
    // f(x) = g2() + x: call result must be atomized before the add
    let body = add(call(gi, vec![], Type::Int), ident(x, Type::Int));
    let f = t.deffun(m, "f", vec![(x, Type::Int)], Type::Int, body);
    t.compile().unwrap();

    let df = t.kfun(f);
    match stmts_of(&df.body).last().unwrap() {
        KExp::Binary(BinOp::Add, Atom::Id(_), Atom::Id(id2), _) => {
            assert_eq!(*id2, x);
        }
        other => panic!("expected add of two atoms, got {:?}", other),
    }
}
