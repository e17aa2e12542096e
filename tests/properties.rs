//! Property-based tests for the mangler and the symbol table
//!
//! These verify the foundations the rest of the pipeline leans on:
//! - the type-signature encoding is a pure function of type structure
//! - distinct structures receive distinct signatures
//! - identifier equality and hashing use only the numeric id

use proptest::prelude::*;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use kyanite::codegen::kform::KTyp;
use kyanite::codegen::mangle::type_signature;
use kyanite::symtab::{Compilation, Id};

// ============================================================================
// Type generators
// ============================================================================

fn arb_scalar() -> BoxedStrategy<KTyp> {
    prop_oneof![
        Just(KTyp::Int),
        Just(KTyp::Bool),
        Just(KTyp::Char),
        Just(KTyp::Str),
        Just(KTyp::CPtr),
        Just(KTyp::Exn),
        prop_oneof![Just(8u8), Just(16), Just(32), Just(64)].prop_map(KTyp::SInt),
        prop_oneof![Just(8u8), Just(16), Just(32), Just(64)].prop_map(KTyp::UInt),
        prop_oneof![Just(16u8), Just(32), Just(64)].prop_map(KTyp::Float),
    ]
    .boxed()
}

/// Structural types without nominal references (those need info-table
/// entries, which the pipeline tests cover)
fn arb_ktyp(depth: usize) -> BoxedStrategy<KTyp> {
    if depth == 0 {
        arb_scalar()
    } else {
        prop_oneof![
            3 => arb_scalar(),
            1 => prop::collection::vec(arb_ktyp(depth - 1), 1..=4)
                .prop_map(KTyp::Tuple),
            1 => arb_ktyp(depth - 1).prop_map(|t| KTyp::List(Box::new(t))),
            1 => arb_ktyp(depth - 1).prop_map(|t| KTyp::Ref(Box::new(t))),
            1 => (1usize..=3, arb_ktyp(depth - 1))
                .prop_map(|(d, t)| KTyp::Array(d, Box::new(t))),
            1 => (
                prop::collection::vec(arb_ktyp(depth - 1), 0..=3),
                arb_ktyp(depth - 1)
            )
                .prop_map(|(args, rt)| KTyp::Fun(args, Box::new(rt))),
        ]
        .boxed()
    }
}

// ============================================================================
// Signature encoding properties
// ============================================================================

proptest! {
    #[test]
    fn signature_encoding_is_pure(t in arb_ktyp(3)) {
        let mut comp = Compilation::new();
        let a = type_signature(&mut comp, &t).unwrap();
        let b = type_signature(&mut comp, &t).unwrap();
        prop_assert_eq!(&a, &b);
        // and stable across compilations
        let mut comp2 = Compilation::new();
        let c = type_signature(&mut comp2, &t).unwrap();
        prop_assert_eq!(a, c);
    }

    #[test]
    fn distinct_structures_get_distinct_signatures(
        ts in prop::collection::vec(arb_ktyp(2), 2..8)
    ) {
        let mut comp = Compilation::new();
        let mut seen: HashMap<String, KTyp> = HashMap::new();
        for t in ts {
            let sig = type_signature(&mut comp, &t).unwrap();
            if let Some(prev) = seen.get(&sig) {
                prop_assert_eq!(prev, &t, "two types share the signature {}", sig);
            } else {
                seen.insert(sig, t);
            }
        }
    }

    #[test]
    fn signatures_never_contain_separators(t in arb_ktyp(3)) {
        let mut comp = Compilation::new();
        let sig = type_signature(&mut comp, &t).unwrap();
        // the encoding must stay a single C-identifier fragment
        prop_assert!(sig.chars().all(|c| c.is_ascii_alphanumeric()));
        prop_assert!(!sig.is_empty());
    }
}

// ============================================================================
// Identifier properties
// ============================================================================

fn hash_of<T: Hash>(v: &T) -> u64 {
    let mut h = DefaultHasher::new();
    v.hash(&mut h);
    h.finish()
}

proptest! {
    #[test]
    fn id_identity_is_the_numeric_suffix(
        p1 in "[a-z]{1,8}",
        p2 in "[a-z]{1,8}",
        k in 0usize..10_000,
        k2 in 0usize..10_000,
    ) {
        let mut comp = Compilation::new();
        let s1 = comp.intern(&p1);
        let s2 = comp.intern(&p2);

        // same k: equal and hash-equal regardless of prefix or temp-ness
        prop_assert_eq!(Id::Val(s1, k), Id::Val(s2, k));
        prop_assert_eq!(Id::Val(s1, k), Id::Temp(s2, k));
        prop_assert_eq!(hash_of(&Id::Val(s1, k)), hash_of(&Id::Temp(s2, k)));

        // different k: never equal
        if k != k2 {
            prop_assert_ne!(Id::Val(s1, k), Id::Val(s1, k2));
        }
    }

    #[test]
    fn interning_is_idempotent(s in "[A-Za-z_][A-Za-z0-9_]{0,12}") {
        let mut comp = Compilation::new();
        let a = comp.intern(&s);
        let b = comp.intern(&s);
        prop_assert_eq!(a, b);
        prop_assert_eq!(comp.str(a), s.as_str());
    }
}
