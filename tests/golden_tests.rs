//! Golden tests - fixture-based tests that lock expected behavior
//!
//! These tests use JSON fixtures to verify that critical functions produce
//! expected outputs. Any change in behavior will cause these tests to fail,
//! signaling a potential breaking change.
//!
//! Run with: cargo test --test golden_tests

use serde::Deserialize;
use std::fs;

// ============================================================================
// CHUNK ID VALIDATION GOLDEN TESTS
// ============================================================================

mod chunk_id_golden {
    use super::*;
    use meridian::types::{validate_chunk_id, ChunkIdError};

    #[derive(Debug, Deserialize)]
    struct TestCase {
        name: String,
        input: String,
        expected: Expected,
    }

    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    enum Expected {
        Ok { ok: String },
        Err { err: String },
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        test_cases: Vec<TestCase>,
    }

    fn error_name(e: ChunkIdError) -> &'static str {
        match e {
            ChunkIdError::Empty => "Empty",
            ChunkIdError::TooLong => "TooLong",
            ChunkIdError::PathTraversal => "PathTraversal",
            ChunkIdError::MissingPrefix => "MissingPrefix",
            ChunkIdError::InvalidChars => "InvalidChars",
        }
    }

    #[test]
    fn test_chunk_id_validation_golden() {
        let fixture_path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/chunk_ids.json");
        let content =
            fs::read_to_string(fixture_path).expect("Failed to read chunk_ids.json fixture");
        let fixture: Fixture =
            serde_json::from_str(&content).expect("Failed to parse fixture JSON");

        for case in fixture.test_cases {
            let result = validate_chunk_id(&case.input);

            match case.expected {
                Expected::Ok { ok } => {
                    assert_eq!(
                        result,
                        Ok(ok.as_str()),
                        "Case '{}': expected Ok({:?})",
                        case.name,
                        ok
                    );
                }
                Expected::Err { err } => {
                    let actual = result.map_err(error_name);
                    assert_eq!(
                        actual,
                        Err(err.as_str()),
                        "Case '{}': expected Err({})",
                        case.name,
                        err
                    );
                }
            }
        }
    }

    #[test]
    fn test_only_traversal_is_path_like() {
        let fixture_path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/chunk_ids.json");
        let content = fs::read_to_string(fixture_path).unwrap();
        let fixture: Fixture = serde_json::from_str(&content).unwrap();

        for case in fixture.test_cases {
            if let Err(e) = validate_chunk_id(&case.input) {
                assert_eq!(
                    e.is_path_like(),
                    e == ChunkIdError::PathTraversal,
                    "Case '{}'",
                    case.name
                );
            }
        }
    }
}

// ============================================================================
// SANDBOX ESCAPE CORPUS GOLDEN TESTS
// ============================================================================

mod escape_corpus_golden {
    use super::*;
    use meridian::sandbox::{ExecutionSession, ScriptedBackend, SessionState, StepOutcome};
    use meridian::{ChunkStore, SessionConfig};
    use std::sync::Arc;

    #[derive(Debug, Deserialize)]
    struct TestCase {
        name: String,
        source: String,
        expected: String,
    }

    #[derive(Debug, Deserialize)]
    struct Fixture {
        test_cases: Vec<TestCase>,
    }

    fn load() -> Fixture {
        let fixture_path = concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/escape_corpus.json"
        );
        let content =
            fs::read_to_string(fixture_path).expect("Failed to read escape_corpus.json fixture");
        serde_json::from_str(&content).expect("Failed to parse fixture JSON")
    }

    fn label(outcome: &StepOutcome) -> String {
        match outcome {
            StepOutcome::Violation(v) => format!("violation:{}", v.rule),
            StepOutcome::Fault(f) => format!("fault:{}", f.kind),
            StepOutcome::AwaitingNextStep => "ok".to_string(),
            other => format!("{:?}", other),
        }
    }

    fn fresh_session() -> ExecutionSession {
        ExecutionSession::new(
            ChunkStore::open_in_memory().unwrap(),
            Arc::new(ScriptedBackend::default()),
            SessionConfig::default(),
        )
    }

    #[test]
    fn test_escape_corpus_golden() {
        let fixture = load();
        assert!(fixture.test_cases.len() >= 40, "corpus shrank");

        for case in fixture.test_cases {
            let mut session = fresh_session();
            let report = session
                .execute(&case.source)
                .unwrap_or_else(|e| panic!("Case '{}': step errored: {}", case.name, e));

            assert_eq!(
                label(&report.outcome),
                case.expected,
                "Case '{}': source {:?}",
                case.name,
                case.source
            );

            let expected_state = if case.expected.starts_with("violation:") {
                SessionState::Failed
            } else {
                SessionState::Running
            };
            assert_eq!(session.state(), expected_state, "Case '{}'", case.name);
        }
    }

    #[test]
    fn test_violations_leave_scratch_untouched() {
        // A violating assignment never binds its target
        for case in load().test_cases {
            if !case.expected.starts_with("violation:") || !case.source.starts_with("x = ") {
                continue;
            }
            let mut session = fresh_session();
            session.execute(&case.source).unwrap();
            assert!(
                session.scratch().get("x").is_none(),
                "Case '{}' bound x",
                case.name
            );
        }
    }
}
