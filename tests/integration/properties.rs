//! Property-based coverage for the serialization and matching laws.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use claudecontrol::{
    Chunk, CompositeMatcher, Exchange, ExchangePre, ExitInfo, IOInput, IOOutput, InputKind,
    MatchContext, Normalizer, Tape, TapeMeta, TapeSession, TapeStore,
};
use proptest::prelude::*;
use tempfile::tempdir;

fn arb_chunk() -> impl Strategy<Value = Chunk> {
    (0u64..5_000, proptest::collection::vec(any::<u8>(), 0..64))
        .prop_map(|(delay_ms, data)| Chunk::new(delay_ms, data))
}

fn arb_input() -> impl Strategy<Value = IOInput> {
    prop_oneof![
        ("[ -~]{0,32}\n?").prop_map(|text| IOInput::from_bytes(InputKind::Line, text.as_bytes())),
        proptest::collection::vec(any::<u8>(), 0..32)
            .prop_map(|bytes| IOInput::from_bytes(InputKind::Raw, &bytes)),
    ]
}

fn arb_exchange() -> impl Strategy<Value = Exchange> {
    (
        "[ -~]{0,24}",
        arb_input(),
        proptest::collection::vec(arb_chunk(), 0..6),
        proptest::option::of((0i32..=255, proptest::option::of(1i32..=31))),
    )
        .prop_map(|(prompt, input, chunks, exit)| {
            let output = IOOutput { chunks };
            let dur_ms = output.total_delay_ms() + 1;
            Exchange {
                pre: ExchangePre {
                    prompt,
                    ..ExchangePre::default()
                },
                input,
                output,
                exit: exit.map(|(code, signal)| ExitInfo { code, signal }),
                dur_ms,
                ..Exchange::default()
            }
        })
}

fn arb_tape() -> impl Strategy<Value = Tape> {
    (
        "[a-z][a-z0-9_-]{0,11}",
        proptest::collection::vec("[!-~]{0,12}", 0..4),
        proptest::collection::btree_map("[A-Z][A-Z0-9_]{0,7}", "[ -~]{0,12}", 0..4),
        proptest::collection::vec(arb_exchange(), 0..4),
        0i64..2_000_000_000,
    )
        .prop_map(|(program, args, env, mut exchanges, created_secs)| {
            // `exit` implies terminal position.
            let last = exchanges.len().saturating_sub(1);
            for (i, exchange) in exchanges.iter_mut().enumerate() {
                if i != last {
                    exchange.exit = None;
                }
            }
            Tape {
                meta: TapeMeta {
                    created_at: Utc.timestamp_opt(created_secs, 0).unwrap(),
                    program,
                    args,
                    env: env.into_iter().collect::<BTreeMap<_, _>>(),
                    cwd: "/work".to_string(),
                    ..TapeMeta::default()
                },
                session: TapeSession::default(),
                exchanges,
                ..Tape::default()
            }
        })
}

proptest! {
    /// `parse(serialize(t)) == t` for any valid tape.
    #[test]
    fn tape_roundtrips(tape in arb_tape()) {
        let text = tape.to_json5().unwrap();
        let parsed = Tape::from_json5(&text).unwrap();
        prop_assert_eq!(parsed, tape);
    }

    /// `normalize(normalize(x)) == normalize(x)`.
    #[test]
    fn normalize_is_idempotent(text in "[ -~\\t\\r\\n]{0,200}") {
        let normalizer = Normalizer::new();
        let once = normalizer.normalize(&text);
        prop_assert_eq!(normalizer.normalize(&once), once);
    }

    /// Chunk concatenation is invariant under segmentation.
    #[test]
    fn output_concat_matches_chunks(chunks in proptest::collection::vec(arb_chunk(), 0..8)) {
        let output = IOOutput { chunks: chunks.clone() };
        let expected: Vec<u8> = chunks.iter().flat_map(|c| c.data.clone()).collect();
        prop_assert_eq!(output.concat(), expected);
    }
}

/// The O(1) index probe and the linear matcher scan select the same
/// exchange for contexts derived from recorded data.
#[test]
fn index_and_scan_agree() {
    let dir = tempdir().unwrap();
    let store = TapeStore::new(dir.path());

    let specs: &[(&str, &str, &str, &[u8])] = &[
        ("alpha", "$ ", "first\n", b"one\n"),
        ("alpha", "$ ", "second\n", b"two\n"),
        ("beta", "> ", "query\n", b"answer\n"),
    ];
    for (i, (program, prompt, input, output)) in specs.iter().enumerate() {
        let tape = Tape {
            meta: TapeMeta {
                program: program.to_string(),
                ..TapeMeta::default()
            },
            exchanges: vec![Exchange {
                pre: ExchangePre {
                    prompt: prompt.to_string(),
                    ..ExchangePre::default()
                },
                input: IOInput::from_bytes(InputKind::Line, input.as_bytes()),
                output: IOOutput {
                    chunks: vec![Chunk::new(0, output.to_vec())],
                },
                ..Exchange::default()
            }],
            ..Tape::default()
        };
        store
            .save_tape(&tape, &dir.path().join(format!("{program}/{i}.tape")), None)
            .unwrap();
    }
    store.load_all();

    let matcher = CompositeMatcher::default();
    for (program, prompt, input, _) in specs {
        let (indexed, indexed_path) = store
            .find_exchange(program, &[], prompt, input)
            .expect("index hit");

        let mut scanned = None;
        let ctx = MatchContext {
            program: program.to_string(),
            prompt: prompt.to_string(),
            ..MatchContext::default()
        };
        'outer: for loaded in store.tapes().iter() {
            for exchange in &loaded.tape.exchanges {
                if matcher.matches_exchange(&loaded.tape.meta, exchange, &ctx, input.as_bytes()) {
                    scanned = Some((exchange.clone(), loaded.path.clone()));
                    break 'outer;
                }
            }
        }
        let (scanned, scanned_path) = scanned.expect("scan hit");
        assert_eq!(indexed, scanned);
        assert_eq!(indexed_path, scanned_path);
    }
}

/// The recorded environment survives matching: a captured env drift on a
/// non-ignored key makes both index-adjacent scan and composite verdicts
/// reject.
#[test]
fn env_drift_rejects_scan_match() {
    let matcher = CompositeMatcher::default();
    let meta = TapeMeta {
        program: "tool".to_string(),
        env: BTreeMap::from([("MODE".to_string(), "fast".to_string())]),
        ..TapeMeta::default()
    };
    let exchange = Exchange {
        input: IOInput::from_bytes(InputKind::Line, b"go\n"),
        ..Exchange::default()
    };

    let matching = MatchContext {
        program: "tool".to_string(),
        env: BTreeMap::from([("MODE".to_string(), "fast".to_string())]),
        ..MatchContext::default()
    };
    assert!(matcher.matches_exchange(&meta, &exchange, &matching, b"go\n"));

    let drifted = MatchContext {
        program: "tool".to_string(),
        env: BTreeMap::from([("MODE".to_string(), "slow".to_string())]),
        ..MatchContext::default()
    };
    assert!(!matcher.matches_exchange(&meta, &exchange, &drifted, b"go\n"));
}
