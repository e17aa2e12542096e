//! Hoisting tests: which nested definitions reach module scope

use kyanite::ast::*;
use kyanite::codegen::kform::*;
use kyanite::test_support::*;

fn stmts_of(e: &KExp) -> Vec<&KExp> {
    match e {
        KExp::Seq(elems, _) => elems.iter().collect(),
        other => vec![other],
    }
}

fn body_mentions_deffun(body: &KExp, id: kyanite::Id) -> bool {
    struct Find {
        id: kyanite::Id,
        found: bool,
    }
    impl KFold for Find {
        fn fold_kexp(&mut self, e: &KExp, comp: &kyanite::Compilation) {
            if let KExp::DefFun(fid, _) = e {
                if *fid == self.id {
                    self.found = true;
                }
            }
            walk_fold_kexp(self, e, comp)
        }
    }
    let mut f = Find { id, found: false };
    // the comp is only needed for table-stored bodies, which we do not
    // traverse here
    f.fold_kexp(body, &kyanite::Compilation::new());
    f.found
}

#[test]
fn capture_free_nested_function_is_hoisted() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    // fun outer() { fun helper() = 1; helper() }
    let helper = t.deffun_nested(m, "helper", vec![], Type::Int, int(1));
    let hi = ident(helper, Type::Fun(vec![], Box::new(Type::Int)));
    let body = seq(vec![
        e(ExpKind::DefFun(helper), Type::Void),
        call(hi, vec![], Type::Int),
    ]);
    let outer = t.deffun(m, "outer", vec![], Type::Int, body);
    let mods = t.compile().unwrap();

    // the helper is now a top-level statement of the module
    let main = mods.iter().find(|cm| cm.name == "Main").unwrap();
    let at_top = main
        .kstmts
        .iter()
        .any(|s| matches!(s, KExp::DefFun(id, _) if *id == helper));
    assert!(at_top, "the capture-free helper must be hoisted");

    // and its original site no longer defines it
    let df = t.kfun(outer);
    assert!(!body_mentions_deffun(&df.body, helper));
}

#[test]
fn capturing_nested_function_stays_in_place() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let x = t.comp.new_val("x");
    // fun foo(x: int) { fun helper() = x + 1; helper() }
    let helper = t.deffun_nested(
        m,
        "helper",
        vec![],
        Type::Int,
        add(ident(x, Type::Int), int(1)),
    );
    let hi = ident(helper, Type::Fun(vec![], Box::new(Type::Int)));
    let body = seq(vec![
        e(ExpKind::DefFun(helper), Type::Void),
        call(hi, vec![], Type::Int),
    ]);
    let foo = t.deffun(m, "foo", vec![(x, Type::Int)], Type::Int, body);
    let mods = t.compile().unwrap();

    // foo is at the top; the helper, which captures x, is not
    let main = mods.iter().find(|cm| cm.name == "Main").unwrap();
    assert!(main
        .kstmts
        .iter()
        .any(|s| matches!(s, KExp::DefFun(id, _) if *id == foo)));
    assert!(!main
        .kstmts
        .iter()
        .any(|s| matches!(s, KExp::DefFun(id, _) if *id == helper)));
    // it still sits inside foo's body, waiting for closure conversion
    let df = t.kfun(foo);
    assert!(body_mentions_deffun(&df.body, helper));
}

#[test]
fn helper_chain_is_hoisted_by_the_second_pass() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    // h1 calls nothing; h2 calls h1; both are capture-free and nest in f
    let h1 = t.deffun_nested(m, "h1", vec![], Type::Int, int(1));
    let h1i = ident(h1, Type::Fun(vec![], Box::new(Type::Int)));
    let h2 = t.deffun_nested(m, "h2", vec![], Type::Int, call(h1i, vec![], Type::Int));
    let h2i = ident(h2, Type::Fun(vec![], Box::new(Type::Int)));
    let body = seq(vec![
        e(ExpKind::DefFun(h1), Type::Void),
        e(ExpKind::DefFun(h2), Type::Void),
        call(h2i, vec![], Type::Int),
    ]);
    t.deffun(m, "f", vec![], Type::Int, body);
    let mods = t.compile().unwrap();

    let main = mods.iter().find(|cm| cm.name == "Main").unwrap();
    for id in [h1, h2] {
        assert!(
            main.kstmts
                .iter()
                .any(|s| matches!(s, KExp::DefFun(fid, _) if *fid == id)),
            "both helpers must end up at module scope"
        );
    }
}

#[test]
fn nested_variant_definition_is_always_hoisted() {
    let mut t = TestCtx::new();
    let m = t.add_module("Main", true);
    let (vid, cases) = t.defvariant(
        m,
        "local",
        vec![("A", Type::Void), ("B", Type::Void)],
        VariantFlags::default(),
    );
    // move the definition statement inside a function body
    let stmt = t.graph.get_mut(m).ast.pop().unwrap();
    let vt = Type::App(vec![], vid);
    let body = seq(vec![
        stmt,
        matches(
            ident(cases[0], vt.clone()),
            vec![
                case(vec![pvariant(cases[0], vec![])], int(0)),
                case(vec![pany()], int(1)),
            ],
            Type::Int,
        ),
    ]);
    t.deffun(m, "f", vec![], Type::Int, body);
    let mods = t.compile().unwrap();

    let main = mods.iter().find(|cm| cm.name == "Main").unwrap();
    assert!(main
        .kstmts
        .iter()
        .any(|s| matches!(s, KExp::DefVariant(id, _) if *id == vid)));
}
