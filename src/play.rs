//! The replay transport: an expect-compatible spawn served from tapes.
//!
//! A single driver (the harness) calls `send`/`expect` sequentially; each
//! matched exchange gets one producer task that streams its chunks into the
//! shared buffer under the latency policy. On a miss the transport either
//! raises a tape miss or, in PROXY mode, spawns the real program once and
//! routes all subsequent I/O through it, feeding the recorder along the
//! way. Output already buffered from replay is retained across the switch.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::bytes::Regex as BytesRegex;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use crate::error::ReplayError;
use crate::inject::ErrorInjectionPolicy;
use crate::latency::LatencyPolicy;
use crate::matchers::{CompositeMatcher, MatchContext};
use crate::model::{Exchange, ExitInfo, InputKind};
use crate::modes::{FallbackMode, FallbackPolicy};
use crate::namegen::{DefaultTapeNameGenerator, TaggedTapeNameGenerator, TapeNameGenerator};
use crate::options::{SessionInfo, SessionOptions};
use crate::record::{ChunkSink, OutputSink, Recorder};
use crate::redact::SecretRedactor;
use crate::store::TapeStore;
use crate::summary;

const DEFAULT_EXPECT_TIMEOUT: Duration = Duration::from_secs(30);
const EXPECT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The matched region of a successful `expect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectMatch {
    /// Index of the pattern that matched.
    pub pattern_index: usize,
    /// Match offsets into the buffer as it was when the match landed.
    pub start: usize,
    pub end: usize,
    /// The matched bytes.
    pub data: Vec<u8>,
}

/// The spawn contract the harness drives. `ReplayTransport` serves it from
/// tapes; a live child serves it under PROXY fallback.
#[async_trait]
pub trait Transport: Send {
    /// Submit bytes to the (virtual) process.
    async fn send(&mut self, data: &[u8]) -> Result<usize, ReplayError>;

    /// Submit a line; equivalent to `send` of the line plus `\n`.
    async fn sendline(&mut self, line: &str) -> Result<usize, ReplayError>;

    /// Wait until one of `patterns` (regexes) matches the buffered output.
    /// Returns the index of the matching pattern.
    async fn expect(
        &mut self,
        patterns: &[&str],
        timeout: Option<Duration>,
    ) -> Result<usize, ReplayError>;

    /// Like `expect`, but patterns are literal strings.
    async fn expect_exact(
        &mut self,
        patterns: &[&str],
        timeout: Option<Duration>,
    ) -> Result<usize, ReplayError>;

    /// Whether the (virtual) process is still running.
    fn isalive(&mut self) -> bool;

    /// Tear down; idempotent. `force` kills a live child instead of
    /// waiting for it.
    async fn close(&mut self, force: bool) -> Result<(), ReplayError>;

    /// Bytes before the last match (or the whole buffer after a timeout).
    fn before(&self) -> Vec<u8>;

    /// Bytes of the last match.
    fn after(&self) -> Option<Vec<u8>>;

    /// Details of the last match.
    fn matched(&self) -> Option<ExpectMatch>;

    fn exit_status(&self) -> Option<i32>;

    fn signal_status(&self) -> Option<i32>;
}

struct PlayState {
    buffer: Vec<u8>,
    ended: bool,
    exitstatus: Option<i32>,
    signalstatus: Option<i32>,
}

/// Shared between the driver and the producer task. Buffer and exit fields
/// live under one mutex so exit writes happen-before reads.
struct Playback {
    state: Mutex<PlayState>,
    closed: AtomicBool,
}

impl Playback {
    fn new() -> Self {
        Self {
            state: Mutex::new(PlayState {
                buffer: Vec::new(),
                ended: false,
                exitstatus: None,
                signalstatus: None,
            }),
            closed: AtomicBool::new(false),
        }
    }
}

/// Transport that replays recorded tapes instead of running processes.
pub struct ReplayTransport {
    store: Arc<TapeStore>,
    matcher: CompositeMatcher,
    fallback: FallbackPolicy,
    latency: LatencyPolicy,
    errors: ErrorInjectionPolicy,
    info: SessionInfo,
    summary: bool,
    recorder: Arc<Recorder>,
    playback: Arc<Playback>,
    producer: Option<JoinHandle<()>>,
    live: Option<LiveFallback>,
    exchange_index: usize,
    before: Vec<u8>,
    after: Option<Vec<u8>>,
    matched: Option<ExpectMatch>,
    closed: bool,
}

impl ReplayTransport {
    /// Build a transport for `info` under the session options: load the
    /// store, assemble the matcher set, and wire the recorder.
    pub fn new(info: SessionInfo, options: SessionOptions) -> Self {
        let store = Arc::new(TapeStore::new(&options.tapes_path));
        store.load_all();

        let matcher = CompositeMatcher::configured(
            options.allow_env.clone(),
            options.ignore_env.clone(),
            options.ignore_args.clone(),
            options.ignore_stdin,
        );

        let mut errors = ErrorInjectionPolicy::new(options.error_rate.clone());
        if let Some(seed) = options.seed {
            errors = errors.with_seed(seed);
        }

        let redactor = SecretRedactor::new().with_enabled(options.redact);
        let namegen: Arc<dyn TapeNameGenerator> = match &options.tag {
            Some(tag) => Arc::new(TaggedTapeNameGenerator::new(
                &options.tapes_path,
                Some(tag.clone()),
            )),
            None => Arc::new(DefaultTapeNameGenerator::new(&options.tapes_path)),
        };
        let recorder = Arc::new(
            Recorder::new(info.clone(), options.record.clone(), store.clone())
                .with_namegen(namegen)
                .with_redactor(redactor),
        );

        Self {
            store,
            matcher,
            fallback: options.fallback.clone(),
            latency: options.latency.clone(),
            errors,
            info,
            summary: options.summary,
            recorder,
            playback: Arc::new(Playback::new()),
            producer: None,
            live: None,
            exchange_index: 0,
            before: Vec::new(),
            after: None,
            matched: None,
            closed: false,
        }
    }

    pub fn with_matcher(mut self, matcher: CompositeMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_latency_policy(mut self, latency: LatencyPolicy) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_error_policy(mut self, errors: ErrorInjectionPolicy) -> Self {
        self.errors = errors;
        self
    }

    pub fn store(&self) -> &Arc<TapeStore> {
        &self.store
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    /// Current contents of the output buffer.
    pub fn buffer_snapshot(&self) -> Vec<u8> {
        self.playback.state.lock().buffer.clone()
    }

    /// Whether the producer (or live child) has recorded an end state.
    pub fn has_ended(&self) -> bool {
        self.playback.state.lock().ended
    }

    async fn send_inner(&mut self, data: &[u8], kind: InputKind) -> Result<usize, ReplayError> {
        if self.closed {
            return Err(ReplayError::Playback("transport is closed".to_string()));
        }

        // Publish the buffer as `before` and clear the last match.
        self.before = self.playback.state.lock().buffer.clone();
        self.after = None;
        self.matched = None;
        let prompt = String::from_utf8_lossy(&self.before).into_owned();

        if let Some(live) = self.live.as_mut() {
            self.recorder.on_send(data, kind, &prompt);
            live.send(data).await?;
            self.exchange_index += 1;
            return Ok(data.len());
        }

        let ctx = self.info.match_context(prompt, self.exchange_index);
        match self.find_exchange(data, &ctx) {
            Some(exchange) => {
                self.stream_exchange(exchange, ctx);
                self.exchange_index += 1;
                Ok(data.len())
            }
            None => match self.fallback.resolve(&ctx) {
                FallbackMode::NotFound => Err(self.tape_miss(data, &ctx)),
                FallbackMode::Proxy => {
                    self.switch_to_live().await?;
                    self.recorder.on_send(data, kind, &ctx.prompt);
                    if let Some(live) = self.live.as_mut() {
                        live.send(data).await?;
                    }
                    self.exchange_index += 1;
                    Ok(data.len())
                }
            },
        }
    }

    /// Index probe first; on miss, scan tapes in load order and exchanges
    /// in recorded order, returning the first eligible one.
    fn find_exchange(&self, input: &[u8], ctx: &MatchContext) -> Option<Exchange> {
        let input_text = String::from_utf8_lossy(input).into_owned();
        if let Some((exchange, _path)) =
            self.store
                .find_exchange(&ctx.program, &ctx.args, &ctx.prompt, &input_text)
        {
            return Some(exchange);
        }

        let tapes = self.store.tapes();
        for loaded in tapes.iter() {
            for exchange in &loaded.tape.exchanges {
                if self
                    .matcher
                    .matches_exchange(&loaded.tape.meta, exchange, ctx, input)
                {
                    self.store.mark_used(&loaded.path);
                    return Some(exchange.clone());
                }
            }
        }
        None
    }

    fn tape_miss(&self, input: &[u8], ctx: &MatchContext) -> ReplayError {
        let input_text = String::from_utf8_lossy(input).into_owned();
        let mut context = ctx.diagnostic();
        if let Some(obj) = context.as_object_mut() {
            obj.insert("input".to_string(), json!(input_text));
            obj.insert(
                "key".to_string(),
                json!(self
                    .store
                    .exchange_key(&ctx.program, &ctx.args, &ctx.prompt, &input_text)),
            );
        }
        ReplayError::TapeMiss {
            message: format!(
                "no recorded exchange for {:?} input {:?}",
                ctx.program,
                preview(&input_text)
            ),
            context,
        }
    }

    /// Spawn the producer that streams the matched exchange's chunks into
    /// the buffer, honoring the latency policy and error injection.
    fn stream_exchange(&mut self, exchange: Exchange, ctx: MatchContext) {
        let playback = self.playback.clone();
        let latency = self.latency.clone();

        // Decide injection once, up front: the truncation point and the
        // failure itself must agree.
        let fail = self.errors.should_fail(&ctx);
        let total = exchange.output.chunks.len();
        let cut = if fail {
            self.errors.truncation_point(total)
        } else {
            total
        };
        let error_message = self.errors.error_message.clone();
        let error_exit_code = self.errors.exit_code;

        let chunks = exchange.output.chunks;
        let exit = exchange.exit;

        let handle = tokio::spawn(async move {
            for chunk in chunks.into_iter().take(cut) {
                if playback.closed.load(Ordering::Acquire) {
                    return;
                }
                let delay = latency.chunk_delay(chunk.delay_ms, &ctx);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                playback.state.lock().buffer.extend_from_slice(&chunk.data);
            }

            let mut state = playback.state.lock();
            if fail {
                state
                    .buffer
                    .extend_from_slice(format!("\n{error_message}\n").as_bytes());
                state.exitstatus = Some(error_exit_code);
                state.ended = true;
            } else if let Some(exit) = exit {
                state.exitstatus = Some(exit.code);
                state.signalstatus = exit.signal;
                state.ended = true;
            }
        });
        // A previous producer, if any, has drained or runs out on its own.
        self.producer = Some(handle);
    }

    async fn switch_to_live(&mut self) -> Result<(), ReplayError> {
        if self.live.is_some() {
            return Ok(());
        }
        tracing::info!(program = %self.info.program, "tape miss; falling back to live process");
        self.recorder.start();
        let live =
            LiveFallback::spawn(&self.info, self.playback.clone(), Some(self.recorder.sink()))
                .await?;
        self.live = Some(live);
        Ok(())
    }

    async fn expect_inner(
        &mut self,
        patterns: &[&str],
        timeout: Option<Duration>,
        exact: bool,
    ) -> Result<usize, ReplayError> {
        if self.closed {
            return Err(ReplayError::Playback("transport is closed".to_string()));
        }
        let compiled = compile_patterns(patterns, exact)?;
        let deadline = Instant::now() + timeout.unwrap_or(DEFAULT_EXPECT_TIMEOUT);

        loop {
            if let Some(live) = self.live.as_mut() {
                live.poll_exit(&self.playback);
            }

            {
                let mut state = self.playback.state.lock();
                let mut hit = None;
                for (i, re) in compiled.iter().enumerate() {
                    if let Some(m) = re.find(&state.buffer) {
                        hit = Some((i, m.start(), m.end()));
                        break;
                    }
                }
                if let Some((index, start, end)) = hit {
                    self.before = state.buffer[..start].to_vec();
                    let data = state.buffer[start..end].to_vec();
                    state.buffer.drain(..end);
                    drop(state);

                    self.after = Some(data.clone());
                    self.matched = Some(ExpectMatch {
                        pattern_index: index,
                        start,
                        end,
                        data,
                    });
                    if self.live.is_some() {
                        self.recorder.on_expect_complete(self.current_exit_info());
                    }
                    return Ok(index);
                }
                if state.ended {
                    self.before = state.buffer.clone();
                    return Err(ReplayError::Playback(
                        "process ended before match".to_string(),
                    ));
                }
            }

            if Instant::now() >= deadline {
                self.before = self.playback.state.lock().buffer.clone();
                return Err(ReplayError::Timeout {
                    patterns: patterns.join(", "),
                });
            }
            tokio::time::sleep(EXPECT_POLL_INTERVAL).await;
        }
    }

    fn current_exit_info(&self) -> Option<ExitInfo> {
        let state = self.playback.state.lock();
        if state.ended {
            Some(ExitInfo {
                code: state.exitstatus.unwrap_or(0),
                signal: state.signalstatus,
            })
        } else {
            None
        }
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn send(&mut self, data: &[u8]) -> Result<usize, ReplayError> {
        self.send_inner(data, InputKind::Raw).await
    }

    async fn sendline(&mut self, line: &str) -> Result<usize, ReplayError> {
        let data = format!("{line}\n");
        self.send_inner(data.as_bytes(), InputKind::Line).await
    }

    async fn expect(
        &mut self,
        patterns: &[&str],
        timeout: Option<Duration>,
    ) -> Result<usize, ReplayError> {
        self.expect_inner(patterns, timeout, false).await
    }

    async fn expect_exact(
        &mut self,
        patterns: &[&str],
        timeout: Option<Duration>,
    ) -> Result<usize, ReplayError> {
        self.expect_inner(patterns, timeout, true).await
    }

    fn isalive(&mut self) -> bool {
        if self.closed {
            return false;
        }
        if let Some(live) = self.live.as_mut() {
            live.poll_exit(&self.playback);
        }
        !self.playback.state.lock().ended
    }

    async fn close(&mut self, force: bool) -> Result<(), ReplayError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.playback.closed.store(true, Ordering::Release);

        if let Some(handle) = self.producer.take() {
            if force {
                handle.abort();
            } else {
                let _ = handle.await;
            }
        }
        if let Some(mut live) = self.live.take() {
            live.close(force, &self.playback).await;
        }
        if self.recorder.is_started() {
            self.recorder.on_expect_complete(self.current_exit_info());
            self.recorder.stop()?;
        }
        if self.summary {
            summary::print_summary(&self.store);
        }
        Ok(())
    }

    fn before(&self) -> Vec<u8> {
        self.before.clone()
    }

    fn after(&self) -> Option<Vec<u8>> {
        self.after.clone()
    }

    fn matched(&self) -> Option<ExpectMatch> {
        self.matched.clone()
    }

    fn exit_status(&self) -> Option<i32> {
        self.playback.state.lock().exitstatus
    }

    fn signal_status(&self) -> Option<i32> {
        self.playback.state.lock().signalstatus
    }
}

fn compile_patterns(patterns: &[&str], exact: bool) -> Result<Vec<BytesRegex>, ReplayError> {
    patterns
        .iter()
        .map(|p| {
            let pattern = if exact {
                regex::escape(p)
            } else {
                (*p).to_string()
            };
            BytesRegex::new(&pattern)
                .map_err(|e| ReplayError::Playback(format!("invalid expect pattern {p:?}: {e}")))
        })
        .collect()
}

fn preview(text: &str) -> String {
    text.chars().take(80).collect()
}

/// The real program, spawned once on a PROXY-mode miss. Its stdout and
/// stderr feed the same shared buffer the replay producer uses, so the
/// expect loop is oblivious to the switch.
struct LiveFallback {
    child: Child,
    stdin: Option<ChildStdin>,
    readers: Vec<JoinHandle<()>>,
}

impl LiveFallback {
    async fn spawn(
        info: &SessionInfo,
        playback: Arc<Playback>,
        sink: Option<Arc<ChunkSink>>,
    ) -> Result<Self, ReplayError> {
        let program =
            which::which(&info.program).unwrap_or_else(|_| PathBuf::from(&info.program));
        let mut command = Command::new(program);
        command
            .args(&info.args)
            .current_dir(&info.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !info.env.is_empty() {
            command.env_clear();
            command.envs(&info.env);
        }

        let mut child = command.spawn().map_err(|e| {
            ReplayError::Playback(format!(
                "failed to spawn live process {:?} for fallback: {e}",
                info.program
            ))
        })?;

        let stdin = child.stdin.take();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, playback.clone(), sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, playback.clone(), sink.clone()));
        }

        Ok(Self {
            child,
            stdin,
            readers,
        })
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ReplayError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ReplayError::Playback(
                "live process stdin is closed".to_string(),
            ));
        };
        stdin
            .write_all(data)
            .await
            .map_err(|e| ReplayError::Playback(format!("live stdin write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| ReplayError::Playback(format!("live stdin flush failed: {e}")))?;
        Ok(())
    }

    /// Record the child's exit once its output is fully drained.
    fn poll_exit(&mut self, playback: &Playback) {
        if !self.readers.iter().all(|reader| reader.is_finished()) {
            return;
        }
        if let Ok(Some(status)) = self.child.try_wait() {
            record_exit(playback, &status);
        }
    }

    async fn close(&mut self, force: bool, playback: &Playback) {
        // Dropping stdin sends EOF; most CLIs exit on it.
        self.stdin.take();
        if force {
            let _ = self.child.start_kill();
        }
        let status = match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                let _ = self.child.start_kill();
                self.child.wait().await
            }
        };
        match status {
            Ok(status) => record_exit(playback, &status),
            Err(err) => tracing::warn!(error = %err, "failed to reap live process"),
        }
        for reader in self.readers.drain(..) {
            let _ = reader.await;
        }
    }
}

fn record_exit(playback: &Playback, status: &std::process::ExitStatus) {
    let mut state = playback.state.lock();
    if state.ended {
        return;
    }
    state.exitstatus = status.code();
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        state.signalstatus = status.signal();
    }
    state.ended = true;
}

fn spawn_reader<R>(
    mut reader: R,
    playback: Arc<Playback>,
    sink: Option<Arc<ChunkSink>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Some(sink) = &sink {
                        sink.write(&buf[..n]);
                    }
                    playback.state.lock().buffer.extend_from_slice(&buf[..n]);
                }
            }
        }
    })
}
