//! End-to-end record → persist → replay flows over the public API.

use std::time::{Duration, Instant};

use claudecontrol::{
    ErrorInjectionPolicy, ExitInfo, FallbackMode, InputKind, LatencyPolicy, OutputSink,
    RecordMode, ReplayError, ReplayTransport, SessionInfo, SessionOptions, TapeStore, Transport,
};
use tempfile::tempdir;

use crate::common::scripted_tape;

fn replay_options(root: &std::path::Path) -> SessionOptions {
    SessionOptions::new(root)
        .with_record(RecordMode::Disabled)
        .with_fallback(FallbackMode::NotFound)
        .with_redact(false)
}

/// Record an echo-style session through the recorder, then replay it from
/// disk with recording disabled.
#[tokio::test]
async fn record_then_replay_echo() {
    let dir = tempdir().unwrap();

    // Record: the harness submits one line and the child answers.
    {
        let info = SessionInfo::new("echo").with_args(["Hello"]);
        let store = std::sync::Arc::new(TapeStore::new(dir.path()));
        store.load_all();
        let recorder = claudecontrol::Recorder::new(info, RecordMode::New, store);
        recorder.start();
        recorder.on_send(b"run\n", InputKind::Line, "");
        recorder.sink().write(b"Hello\r\n");
        recorder.on_expect_complete(Some(ExitInfo {
            code: 0,
            signal: None,
        }));
        let path = recorder.stop().unwrap().expect("tape persisted");
        assert!(path.starts_with(dir.path().join("echo")));
    }

    // The tape on disk describes the echo invocation.
    let store = TapeStore::new(dir.path());
    store.load_all();
    assert_eq!(store.tape_count(), 1);
    let tapes = store.tapes();
    assert_eq!(tapes[0].tape.meta.program, "echo");
    assert_eq!(tapes[0].tape.meta.args, vec!["Hello"]);
    assert_eq!(tapes[0].tape.exchanges[0].output.concat(), b"Hello\r\n");

    // Replay without a child process.
    let info = SessionInfo::new("echo").with_args(["Hello"]);
    let mut transport = ReplayTransport::new(info, replay_options(dir.path()));
    transport.sendline("run").await.unwrap();
    let index = transport.expect(&["Hello"], None).await.unwrap();
    assert_eq!(index, 0);
    assert_eq!(transport.after().unwrap(), b"Hello");
    transport.close(false).await.unwrap();
}

/// An empty store with NOT_FOUND fallback surfaces a tape miss whose
/// context names the program and the input.
#[tokio::test]
async fn tape_miss_under_not_found() {
    let dir = tempdir().unwrap();
    let info = SessionInfo::new("nonexistent_command");
    let mut transport = ReplayTransport::new(info, replay_options(dir.path()));

    let err = transport.send(b"x").await.expect_err("must miss");
    let ReplayError::TapeMiss { context, .. } = &err else {
        panic!("expected TapeMiss, got {err:?}");
    };
    assert_eq!(context["program"], "nonexistent_command");
    assert_eq!(context["input"], "x");
    transport.close(false).await.unwrap();
}

/// A hand-written JSON5 tape (comments and trailing commas included) is
/// served like any recorded one.
#[tokio::test]
async fn replays_hand_edited_tape() {
    let dir = tempdir().unwrap();
    let tape_dir = dir.path().join("repl");
    std::fs::create_dir_all(&tape_dir).unwrap();
    std::fs::write(
        tape_dir.join("greeting.tape"),
        r#"{
            // edited by hand
            meta: { program: "repl", args: [], env: {}, cwd: "/tmp", },
            session: { platform: "claudecontrol", version: "0.1.0", record_mode: "new" },
            exchanges: [
                {
                    pre: { prompt: "" },
                    input: { type: "line", dataText: "greet\n" },
                    output: { chunks: [ { delay_ms: 0, dataB64: "aGkgdGhlcmUK", isUtf8: true }, ] },
                },
            ],
        }"#,
    )
    .unwrap();

    let info = SessionInfo::new("repl");
    let mut transport = ReplayTransport::new(info, replay_options(dir.path()));
    transport.sendline("greet").await.unwrap();
    transport.expect(&["hi there"], None).await.unwrap();
    transport.close(false).await.unwrap();
}

/// Two recordings with the same identity under OVERWRITE leave exactly one
/// tape holding the second run's output.
#[tokio::test]
async fn overwrite_leaves_single_tape() {
    let dir = tempdir().unwrap();

    for (mode, line) in [(RecordMode::New, "a"), (RecordMode::Overwrite, "b")] {
        let info = SessionInfo::new("echo");
        let store = std::sync::Arc::new(TapeStore::new(dir.path()));
        store.load_all();
        let recorder = claudecontrol::Recorder::new(info, mode, store);
        recorder.start();
        recorder.on_send(format!("{line}\n").as_bytes(), InputKind::Line, "");
        recorder.sink().write(format!("{line}\n").as_bytes());
        recorder.on_expect_complete(None);
        recorder.stop().unwrap().expect("tape written");
    }

    let store = TapeStore::new(dir.path());
    store.load_all();
    assert_eq!(store.tape_count(), 1);
    let tapes = store.tapes();
    assert_eq!(
        tapes[0].tape.exchanges.last().unwrap().output.concat(),
        b"b\n"
    );
}

/// Scenario: latency of 50ms over 5 chunks keeps total replay time at or
/// above 250ms.
#[tokio::test]
async fn fixed_latency_bounds_replay_time() {
    let dir = tempdir().unwrap();
    let tape = scripted_tape(
        "slowly",
        &[],
        "",
        "go\n",
        &[b"1", b"2", b"3", b"4", b"5"],
        None,
    );
    let store = TapeStore::new(dir.path());
    store
        .save_tape(&tape, &dir.path().join("slowly/t.tape"), None)
        .unwrap();

    let info = SessionInfo::new("slowly");
    let options = replay_options(dir.path()).with_latency(LatencyPolicy::default().with_global(50u64));
    let mut transport = ReplayTransport::new(info, options);

    let started = Instant::now();
    transport.sendline("go").await.unwrap();
    transport.expect(&["12345"], None).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(250));
    transport.close(false).await.unwrap();
}

/// Scenario: rate 100, truncate 0.5, exit code 7 on a 10-chunk exchange
/// yields exactly 5 chunks, the message, and exitstatus 7.
#[tokio::test]
async fn halfway_error_injection() {
    let dir = tempdir().unwrap();
    let chunk_data: Vec<Vec<u8>> = (0..10).map(|i| format!("[{i}]").into_bytes()).collect();
    let chunk_refs: Vec<&[u8]> = chunk_data.iter().map(|c| c.as_slice()).collect();
    let tape = scripted_tape("flaky", &[], "", "go\n", &chunk_refs, None);
    let store = TapeStore::new(dir.path());
    store
        .save_tape(&tape, &dir.path().join("flaky/t.tape"), None)
        .unwrap();

    let info = SessionInfo::new("flaky");
    let mut transport = ReplayTransport::new(info, replay_options(dir.path())).with_error_policy(
        ErrorInjectionPolicy::new(100.0)
            .with_truncate_at(0.5)
            .with_exit_code(7)
            .with_error_message("boom"),
    );

    transport.sendline("go").await.unwrap();
    let err = transport
        .expect(&["\\[9\\]"], Some(Duration::from_secs(5)))
        .await
        .expect_err("stream is cut at the fifth chunk");
    assert!(matches!(err, ReplayError::Playback(_)));

    let text = String::from_utf8_lossy(&transport.before()).into_owned();
    assert_eq!(text, "[0][1][2][3][4]\nboom\n");
    assert_eq!(transport.exit_status(), Some(7));
    assert!(!transport.isalive());
    transport.close(false).await.unwrap();
}

/// A scripted multi-exchange session replays in order, with each leftover
/// tail feeding the next prompt.
#[tokio::test]
async fn multi_exchange_script_replays_in_order() {
    let dir = tempdir().unwrap();
    let mut tape = scripted_tape("repl", &[], "", "one\n", &[b"first\n> "], None);
    // After the first expect consumes through "> ", the buffer is empty
    // again, so the recorded prompt for the follow-up is empty too.
    tape.exchanges.push(claudecontrol::Exchange {
        pre: claudecontrol::ExchangePre::default(),
        input: claudecontrol::IOInput::from_bytes(InputKind::Line, b"two\n"),
        output: claudecontrol::IOOutput {
            chunks: vec![claudecontrol::Chunk::new(0, b"second\n".to_vec())],
        },
        exit: Some(ExitInfo {
            code: 0,
            signal: None,
        }),
        ..claudecontrol::Exchange::default()
    });
    let store = TapeStore::new(dir.path());
    store
        .save_tape(&tape, &dir.path().join("repl/session.tape"), None)
        .unwrap();

    let info = SessionInfo::new("repl");
    let mut transport = ReplayTransport::new(info, replay_options(dir.path()));

    transport.sendline("one").await.unwrap();
    transport.expect(&["> "], None).await.unwrap();
    // `before` holds everything up to the match; prompt residue was consumed.
    assert_eq!(transport.before(), b"first\n");

    transport.sendline("two").await.unwrap();
    transport.expect(&["second"], None).await.unwrap();
    // The producer records the exit right after the final chunk.
    for _ in 0..200 {
        if transport.has_ended() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(transport.exit_status(), Some(0));
    transport.close(false).await.unwrap();
}
