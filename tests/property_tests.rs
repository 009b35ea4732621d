//! Property-based tests for the tag algebra and trace strategies.

use lineal::{
    trace_backward, trace_forward, tag::encode_id, Engine, Tag, Value,
};
use lineal::Strategy as ReplayStrategy;
use proptest::prelude::*;

/// Generate a small set of tag ids.
fn arb_ids() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..64, 0..12)
}

fn arb_tag() -> impl Strategy<Value = Tag> {
    arb_ids().prop_map(Tag::from_ids)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: union is commutative and associative with identity empty.
    #[test]
    fn prop_union_laws(a in arb_tag(), b in arb_tag(), c in arb_tag()) {
        prop_assert_eq!(Tag::union(&a, &b), Tag::union(&b, &a));
        prop_assert_eq!(
            Tag::union(&Tag::union(&a, &b), &c),
            Tag::union(&a, &Tag::union(&b, &c))
        );
        prop_assert_eq!(Tag::union(&a, &Tag::empty()), a.clone());
        prop_assert_eq!(Tag::union(&a, &a), a);
    }

    /// Property: intersection distributes over union.
    #[test]
    fn prop_intersect_distributes(a in arb_tag(), b in arb_tag(), c in arb_tag()) {
        let lhs = Tag::intersect(&a, &Tag::union(&b, &c));
        let rhs = Tag::union(&Tag::intersect(&a, &b), &Tag::intersect(&a, &c));
        prop_assert_eq!(lhs, rhs);
    }

    /// Property: is_non_empty iff the tag holds at least one id.
    #[test]
    fn prop_non_empty_matches_contents(ids in arb_ids()) {
        let tag = Tag::from_ids(ids.clone());
        prop_assert_eq!(tag.is_non_empty(), !ids.is_empty());
        for id in ids {
            prop_assert!(tag.contains(id));
        }
    }

    /// Property: the id encoding is injective over its domain.
    #[test]
    fn prop_encode_is_injective(
        p1 in 0usize..512, i1 in 0usize..512,
        p2 in 0usize..512, i2 in 0usize..512
    ) {
        let a = encode_id(p1, i1).unwrap();
        let b = encode_id(p2, i2).unwrap();
        prop_assert_eq!(a == b, (p1, i1) == (p2, i2));
    }
}

/// Builds a pipeline of narrow and shuffle steps over distinct source ints
/// and returns (engine, source, sink).
fn build_pipeline(n: usize, partitions: usize, stages: u8) -> (Engine, u64, u64) {
    let mut engine = Engine::new();
    let source = engine
        .parallelize((0..n as i64).map(Value::Int).collect(), partitions)
        .unwrap();
    let mut current = engine
        .map(source, |v| match v {
            Value::Int(x) => Value::Int(x * 3 + 1),
            other => other.clone(),
        })
        .unwrap();
    for s in 0..stages {
        let modulus = 3 + s as i64;
        let keyed = engine
            .map(current, move |v| match v {
                Value::Int(x) => Value::pair(Value::Int(x % modulus), Value::Int(*x)),
                other => other.clone(),
            })
            .unwrap();
        let reduced = engine
            .reduce_by_key(keyed, 2, |a, b| match (a, b) {
                (Value::Int(x), Value::Int(y)) => Value::Int(x + y),
                _ => a.clone(),
            })
            .unwrap();
        current = engine
            .map(reduced, |v| match v {
                Value::Pair(_, val) => (**val).clone(),
                other => other.clone(),
            })
            .unwrap();
    }
    (engine, source, current)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: identity trace equals filter.
    #[test]
    fn prop_identity_trace_is_filter(n in 1usize..30, partitions in 1usize..4, modulus in 1i64..7) {
        let mut engine = Engine::new();
        let d = engine
            .parallelize((0..n as i64).map(Value::Int).collect(), partitions)
            .unwrap();
        let pred = move |v: &Value| matches!(v, Value::Int(x) if x % modulus == 0);
        let traced = trace_forward(&engine, d, pred, d).unwrap();
        let expected: Vec<Value> = engine
            .collect(d)
            .unwrap()
            .into_iter()
            .filter(|v| pred(v))
            .collect();
        prop_assert_eq!(traced, expected);
    }

    /// Property: the three backward strategies return the same set.
    #[test]
    fn prop_backward_strategies_agree(
        n in 1usize..24,
        partitions in 1usize..4,
        stages in 0u8..3,
        threshold in 0i64..40
    ) {
        let (engine, source, sink) = build_pipeline(n, partitions, stages);
        let pred = move |v: &Value| matches!(v, Value::Int(x) if x >= &threshold);
        let mut results: Vec<Vec<Value>> = [
            ReplayStrategy::SingleStep,
            ReplayStrategy::MaintainingSet,
            ReplayStrategy::UsingMappings,
        ]
        .iter()
        .map(|s| {
            let mut r = trace_backward(&engine, source, pred, sink, *s).unwrap();
            r.sort();
            r
        })
        .collect();
        let expected = results.pop().unwrap();
        for r in results {
            prop_assert_eq!(&r, &expected);
        }
    }

    /// Property: running the same forward trace twice yields equal results.
    #[test]
    fn prop_forward_trace_is_idempotent(n in 1usize..24, stages in 0u8..3) {
        let (engine, source, sink) = build_pipeline(n, 2, stages);
        let pred = |v: &Value| matches!(v, Value::Int(x) if x % 2 == 0);
        let once = trace_forward(&engine, source, pred, sink).unwrap();
        let again = trace_forward(&engine, source, pred, sink).unwrap();
        prop_assert_eq!(once, again);
    }

    /// Property: with an always-true sink predicate, the backward trace is
    /// the subset of the source that contributes to any sink element.
    #[test]
    fn prop_backward_true_predicate_is_contributors(n in 1usize..24, stages in 0u8..3) {
        let (engine, source, sink) = build_pipeline(n, 2, stages);
        let everything = trace_backward(
            &engine,
            source,
            |_| true,
            sink,
            ReplayStrategy::default(),
        )
        .unwrap();
        // The pipelines never drop elements, so every source element
        // contributes.
        prop_assert_eq!(everything.len(), n);
    }
}
