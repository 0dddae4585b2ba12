//! PROXY fallback: a tape miss spawns the real program once, streams its
//! output through the shared buffer, and records a new tape.

#![cfg(unix)]

use std::time::Duration;

use claudecontrol::{
    FallbackMode, RecordMode, ReplayTransport, SessionInfo, SessionOptions, TapeStore, Transport,
};
use tempfile::tempdir;

#[tokio::test]
async fn proxy_runs_real_program_and_records() {
    let dir = tempdir().unwrap();
    let info = SessionInfo::new("cat").with_cwd(dir.path());
    let options = SessionOptions::new(dir.path())
        .with_record(RecordMode::New)
        .with_fallback(FallbackMode::Proxy)
        .with_redact(false);
    let mut transport = ReplayTransport::new(info, options);

    transport.sendline("hello proxy").await.unwrap();
    transport
        .expect(&["hello proxy"], Some(Duration::from_secs(10)))
        .await
        .unwrap();

    transport.sendline("second line").await.unwrap();
    transport
        .expect(&["second line"], Some(Duration::from_secs(10)))
        .await
        .unwrap();

    transport.close(false).await.unwrap();

    // A tape landed under {root}/cat/ with both exchanges.
    let store = TapeStore::new(dir.path());
    store.load_all();
    assert_eq!(store.tape_count(), 1);
    let tapes = store.tapes();
    assert!(tapes[0].path.starts_with(dir.path().join("cat")));
    assert_eq!(tapes[0].tape.meta.program, "cat");
    assert_eq!(tapes[0].tape.exchanges.len(), 2);
    assert_eq!(
        tapes[0].tape.exchanges[0].input.data_text.as_deref(),
        Some("hello proxy\n")
    );
    let output = String::from_utf8(tapes[0].tape.exchanges[0].output.concat()).unwrap();
    assert!(output.contains("hello proxy"));
}

#[tokio::test]
async fn proxy_reports_child_exit() {
    let dir = tempdir().unwrap();
    let info = SessionInfo::new("cat").with_cwd(dir.path());
    let options = SessionOptions::new(dir.path())
        .with_record(RecordMode::Disabled)
        .with_fallback(FallbackMode::Proxy)
        .with_redact(false);
    let mut transport = ReplayTransport::new(info, options);

    transport.sendline("ping").await.unwrap();
    transport
        .expect(&["ping"], Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert!(transport.isalive());

    // Closing drops stdin; cat exits on EOF with status 0.
    transport.close(false).await.unwrap();
    assert_eq!(transport.exit_status(), Some(0));
    assert!(!transport.isalive());

    // DISABLED never writes a tape.
    let store = TapeStore::new(dir.path());
    store.load_all();
    assert_eq!(store.tape_count(), 0);
}

#[tokio::test]
async fn proxy_replay_then_replayed_session_matches() {
    let dir = tempdir().unwrap();

    // First run records through the proxy.
    {
        let info = SessionInfo::new("cat").with_cwd(dir.path());
        let options = SessionOptions::new(dir.path())
            .with_record(RecordMode::New)
            .with_fallback(FallbackMode::Proxy)
            .with_redact(false);
        let mut transport = ReplayTransport::new(info, options);
        transport.sendline("roundtrip").await.unwrap();
        transport
            .expect(&["roundtrip"], Some(Duration::from_secs(10)))
            .await
            .unwrap();
        transport.close(false).await.unwrap();
    }

    // Second run replays hermetically: no fallback allowed.
    let info = SessionInfo::new("cat").with_cwd(dir.path());
    let options = SessionOptions::new(dir.path())
        .with_record(RecordMode::Disabled)
        .with_fallback(FallbackMode::NotFound)
        .with_redact(false);
    let mut transport = ReplayTransport::new(info, options);
    transport.sendline("roundtrip").await.unwrap();
    transport
        .expect(&["roundtrip"], Some(Duration::from_secs(10)))
        .await
        .unwrap();
    transport.close(false).await.unwrap();
}
