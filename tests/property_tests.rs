//! Property-based tests for meridian
//!
//! These tests verify invariants that must hold for all inputs:
//! - Validation and parsing never panic
//! - Path-like ids never validate
//! - Bounded operations stay bounded
//! - Snippet arithmetic follows Python's identities
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

// ============================================================================
// CHUNK ID VALIDATION
// ============================================================================

mod chunk_id_tests {
    use super::*;
    use meridian::types::{validate_chunk_id, ChunkIdError, MAX_CHUNK_ID_LENGTH};

    proptest! {
        /// Invariant: validate_chunk_id never panics on any string input
        #[test]
        fn never_panics(s in ".*") {
            let _ = validate_chunk_id(&s);
        }

        /// Invariant: anything containing a path separator or `..` is path-like
        #[test]
        fn separators_are_path_like(
            prefix in "[a-z0-9-]{0,10}",
            sep in prop::sample::select(vec!["/", "\\", ".."]),
            suffix in "[a-z0-9-]{0,10}",
        ) {
            let id = format!("chunk-{}{}{}", prefix, sep, suffix);
            prop_assert_eq!(validate_chunk_id(&id), Err(ChunkIdError::PathTraversal));
        }

        /// Invariant: a valid id is returned unchanged and respects the length cap
        #[test]
        fn valid_ids_roundtrip(body in "[A-Za-z0-9_-]{1,80}") {
            let id = format!("chunk-{}", body);
            if let Ok(valid) = validate_chunk_id(&id) {
                prop_assert_eq!(valid, id.as_str());
                prop_assert!(valid.len() <= MAX_CHUNK_ID_LENGTH);
            }
        }
    }
}

// ============================================================================
// TAG NORMALIZATION
// ============================================================================

mod tag_tests {
    use super::*;
    use meridian::types::normalize_tags;

    proptest! {
        /// Invariant: normalizing twice changes nothing
        #[test]
        fn idempotent(tags in prop::collection::vec("\\PC{0,12}", 0..8)) {
            let once = normalize_tags(&tags);
            let twice = normalize_tags(&once);
            prop_assert_eq!(once, twice);
        }

        /// Invariant: output is sorted, unique, lowercase and non-empty
        #[test]
        fn canonical_form(tags in prop::collection::vec("[A-Za-z ]{0,8}", 0..8)) {
            let normalized = normalize_tags(&tags);
            prop_assert!(normalized.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(normalized.iter().all(|t| !t.is_empty() && *t == t.to_lowercase()));
        }
    }
}

// ============================================================================
// SNIPPET FRONT END
// ============================================================================

mod front_end_tests {
    use super::*;
    use meridian::sandbox::{parse, tokenize, Rejection, SecurityPolicy, ViolationRule};

    proptest! {
        /// Invariant: the lexer and parser never panic
        #[test]
        fn parser_never_panics(src in "\\PC{0,200}") {
            let _ = tokenize(&src);
            let _ = parse(&src, 48);
        }

        /// Invariant: the parser never panics on code-shaped input either
        #[test]
        fn parser_never_panics_on_code(src in "[a-z_()\\[\\]{}:.,'=+*/ \\n]{0,120}") {
            let _ = parse(&src, 48);
        }

        /// Invariant: deep nesting is refused instead of overflowing the stack
        #[test]
        fn nesting_is_bounded(depth in 49usize..2000) {
            let src = format!("x = {}1{}", "(".repeat(depth), ")".repeat(depth));
            let result = SecurityPolicy::default().prepare(&src);
            prop_assert!(matches!(
                result,
                Err(Rejection::Violation(ref v)) if v.rule == ViolationRule::NestingTooDeep
            ));
        }

        /// Invariant: any dunder attribute is refused statically
        #[test]
        fn dunder_attributes_refused(name in "[a-z]{1,10}") {
            let src = format!("x = 'a'.__{}__", name);
            let result = SecurityPolicy::default().prepare(&src);
            prop_assert!(matches!(
                result,
                Err(Rejection::Violation(ref v)) if v.rule == ViolationRule::PrivateAccess
            ));
        }
    }
}

// ============================================================================
// GRAPH TRAVERSAL
// ============================================================================

mod traversal_tests {
    use super::*;
    use chrono::Utc;
    use meridian::graph::LinkGraph;
    use meridian::types::{Link, LinkOrigin, LinkType, TraversalOrder};
    use std::collections::HashSet;

    fn graph_from(edges: &[(u8, u8)]) -> LinkGraph {
        LinkGraph::from_links(edges.iter().filter(|(a, b)| a != b).map(|(a, b)| Link {
            from_id: format!("chunk-{}", a),
            to_id: format!("chunk-{}", b),
            link_type: LinkType::RelatedTo,
            strength: 1.0,
            origin: LinkOrigin::Auto,
            reason: None,
            created_at: Utc::now(),
        }))
    }

    proptest! {
        /// Invariant: traversal returns at most max_nodes ids, each once
        #[test]
        fn bounded_and_unique(
            edges in prop::collection::vec((0u8..20, 0u8..20), 0..60),
            max_nodes in 0usize..30,
            depth_first in any::<bool>(),
        ) {
            let graph = graph_from(&edges);
            let order = if depth_first { TraversalOrder::DepthFirst } else { TraversalOrder::BreadthFirst };
            let visited = graph.traverse(&["chunk-0".to_string()], max_nodes, order, None);

            prop_assert!(visited.len() <= max_nodes);
            let unique: HashSet<_> = visited.iter().collect();
            prop_assert_eq!(unique.len(), visited.len());
            if max_nodes > 0 {
                prop_assert_eq!(visited.first().map(String::as_str), Some("chunk-0"));
            }
        }

        /// Invariant: every outgoing link has a matching incoming entry
        #[test]
        fn links_are_symmetric(edges in prop::collection::vec((0u8..15, 0u8..15), 0..50)) {
            let graph = graph_from(&edges);
            for (a, b) in edges.iter().filter(|(a, b)| a != b) {
                let from = format!("chunk-{}", a);
                let to = format!("chunk-{}", b);
                prop_assert!(graph.contains(&from, &to, LinkType::RelatedTo));
                prop_assert!(graph.get_outgoing(&from, None).contains(&to));
                prop_assert!(graph.get_incoming(&to, None).contains(&from));
            }
        }

        /// Invariant: the same graph and start give the same order every time
        #[test]
        fn traversal_is_deterministic(edges in prop::collection::vec((0u8..15, 0u8..15), 0..50)) {
            let first = graph_from(&edges);
            let second = graph_from(&edges);
            let starts = ["chunk-0".to_string()];
            for order in [TraversalOrder::BreadthFirst, TraversalOrder::DepthFirst] {
                prop_assert_eq!(
                    first.traverse(&starts, 20, order, None),
                    second.traverse(&starts, 20, order, None)
                );
            }
        }
    }
}

// ============================================================================
// SNIPPET ARITHMETIC
// ============================================================================

mod arithmetic_tests {
    use super::*;
    use meridian::sandbox::{ExecutionSession, ScriptedBackend, StepOutcome};
    use meridian::{ChunkStore, SessionConfig};
    use std::sync::Arc;

    fn eval(src: &str) -> Option<String> {
        let store = ChunkStore::open_in_memory().unwrap();
        let mut session = ExecutionSession::new(
            store,
            Arc::new(ScriptedBackend::default()),
            SessionConfig::default(),
        );
        let report = session.execute(src).unwrap();
        assert_eq!(report.outcome, StepOutcome::AwaitingNextStep, "{}", src);
        report.value
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        /// Invariant: (a // b) * b + a % b == a, with the remainder taking b's sign
        #[test]
        fn floor_division_identity(a in -10_000i64..10_000, b in (-500i64..500).prop_filter("non-zero", |b| *b != 0)) {
            let src = format!("a = {a}\nb = {b}\n[(a // b) * b + a % b == a, a % b == 0 or (a % b < 0) == (b < 0)]");
            prop_assert_eq!(eval(&src), Some("[True, True]".to_string()));
        }

        /// Invariant: sorted() agrees with Rust's ordering for integers
        #[test]
        fn sorted_matches(xs in prop::collection::vec(-1000i64..1000, 0..20)) {
            let literal = format!("[{}]", xs.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(", "));
            let mut expected = xs.clone();
            expected.sort();
            let expected = format!("[{}]", expected.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(", "));
            prop_assert_eq!(eval(&format!("sorted({})", literal)), Some(expected));
        }
    }
}
