//! Recording: tap the live output stream, assemble exchanges, persist
//! tapes.
//!
//! The harness drives the state machine: `on_send` opens an exchange with
//! the current prompt, output arrives through the sink hook, and
//! `on_expect_complete` (or the next `on_send`) finalizes it. `stop`
//! applies the tape decorator, redacts, and persists through the store
//! under the configured record mode.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::decorators::DecoratorSet;
use crate::error::ReplayError;
use crate::model::{
    Chunk, Exchange, ExchangePre, ExitInfo, IOInput, IOOutput, InputKind, Tape, TapeMeta,
    TapeSession,
};
use crate::modes::{RecordMode, RecordPolicy};
use crate::namegen::{DefaultTapeNameGenerator, NameContext, TapeNameGenerator};
use crate::options::SessionInfo;
use crate::redact::SecretRedactor;
use crate::store::TapeStore;

/// Write-log hook the harness installs on its spawn: every slice of
/// process output is pushed through `write`.
pub trait OutputSink: Send + Sync {
    fn write(&self, data: &[u8]);

    fn flush(&self) {}
}

struct SinkState {
    last: Instant,
    chunks: Vec<Chunk>,
    total_bytes: usize,
}

/// Captures output chunks with monotonic timing for the open exchange.
pub struct ChunkSink {
    state: Mutex<SinkState>,
}

impl ChunkSink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SinkState {
                last: Instant::now(),
                chunks: Vec::new(),
                total_bytes: 0,
            }),
        }
    }

    /// Drain the captured chunks into an exchange output.
    pub fn take_output(&self) -> IOOutput {
        let mut state = self.state.lock();
        IOOutput {
            chunks: std::mem::take(&mut state.chunks),
        }
    }

    /// Discard captured chunks and restart the delay clock. Called when a
    /// new exchange opens: the first chunk's delay is measured from the
    /// moment the input was submitted.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.chunks.clear();
        state.total_bytes = 0;
        state.last = Instant::now();
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }
}

impl Default for ChunkSink {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSink for ChunkSink {
    fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let now = Instant::now();
        let delay_ms = now.duration_since(state.last).as_millis() as u64;
        state.last = now;
        state.total_bytes += data.len();
        state.chunks.push(Chunk::new(delay_ms, data.to_vec()));
    }
}

/// Fan-out sink for harnesses that already multiplex their read log.
#[derive(Default)]
pub struct CompositeSink {
    handlers: Mutex<Vec<Arc<dyn OutputSink>>>,
}

impl CompositeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn OutputSink>) {
        self.handlers.lock().push(handler);
    }
}

impl OutputSink for CompositeSink {
    fn write(&self, data: &[u8]) {
        for handler in self.handlers.lock().iter() {
            handler.write(data);
        }
    }

    fn flush(&self) {
        for handler in self.handlers.lock().iter() {
            handler.flush();
        }
    }
}

struct OpenExchange {
    pre: ExchangePre,
    input: IOInput,
    exit: Option<ExitInfo>,
    started_at: Instant,
}

struct RecState {
    started: bool,
    tape: Option<Tape>,
    open: Option<OpenExchange>,
}

/// Assembles a tape from a live session's I/O.
pub struct Recorder {
    info: SessionInfo,
    mode: RecordPolicy,
    store: Arc<TapeStore>,
    namegen: Arc<dyn TapeNameGenerator>,
    redactor: SecretRedactor,
    decorators: DecoratorSet,
    sink: Arc<ChunkSink>,
    state: Mutex<RecState>,
}

impl Recorder {
    pub fn new(info: SessionInfo, mode: impl Into<RecordPolicy>, store: Arc<TapeStore>) -> Self {
        let namegen = Arc::new(DefaultTapeNameGenerator::new(store.root()));
        Self {
            info,
            mode: mode.into(),
            store,
            namegen,
            redactor: SecretRedactor::new(),
            decorators: DecoratorSet::default(),
            sink: Arc::new(ChunkSink::new()),
            state: Mutex::new(RecState {
                started: false,
                tape: None,
                open: None,
            }),
        }
    }

    pub fn with_namegen(mut self, namegen: Arc<dyn TapeNameGenerator>) -> Self {
        self.namegen = namegen;
        self
    }

    pub fn with_redactor(mut self, redactor: SecretRedactor) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn with_decorators(mut self, decorators: DecoratorSet) -> Self {
        self.decorators = decorators;
        self
    }

    /// The sink to install as the spawn's read-log hook.
    pub fn sink(&self) -> Arc<ChunkSink> {
        self.sink.clone()
    }

    /// Register with a composite multiplexer the harness already installs.
    pub fn attach_to(&self, composite: &CompositeSink) {
        composite.add_handler(self.sink.clone());
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Open the tape. Idempotent; exchanges are only captured after this.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.started {
            return;
        }
        let ctx = self.info.match_context("", 0);
        let mode = self.mode.resolve(&ctx);
        state.tape = Some(Tape {
            meta: TapeMeta {
                program: self.info.program.clone(),
                args: self.info.args.clone(),
                env: self.info.env.clone(),
                cwd: self.info.cwd.display().to_string(),
                pty: self.info.pty,
                ..TapeMeta::default()
            },
            session: TapeSession::current(mode),
            exchanges: Vec::new(),
            ..Tape::default()
        });
        state.open = None;
        state.started = true;
        self.sink.reset();
    }

    /// Input was submitted: finalize any open exchange and open a new one
    /// against the prompt the harness observed (`before`).
    pub fn on_send(&self, data: &[u8], kind: InputKind, prompt: &str) {
        let mut state = self.state.lock();
        if !state.started {
            return;
        }
        Self::finalize_open(&mut state, &self.sink);

        let exchange_index = state
            .tape
            .as_ref()
            .map(|t| t.exchanges.len())
            .unwrap_or_default();
        let ctx = self.info.match_context(prompt, exchange_index);
        let data = self.decorators.decorate_input(&ctx, data.to_vec());

        self.sink.reset();
        state.open = Some(OpenExchange {
            pre: ExchangePre {
                prompt: prompt.to_string(),
                ..ExchangePre::default()
            },
            input: IOInput::from_bytes(kind, &data),
            exit: None,
            started_at: Instant::now(),
        });
    }

    /// The harness's expect finished; the exchange is complete. Exit info
    /// is attached when the child ended during this exchange.
    pub fn on_expect_complete(&self, exit: Option<ExitInfo>) {
        let mut state = self.state.lock();
        if !state.started {
            return;
        }
        if let Some(open) = state.open.as_mut() {
            open.exit = exit;
        }
        Self::finalize_open(&mut state, &self.sink);
    }

    /// Snapshot of the in-memory tape for this run.
    pub fn tape(&self) -> Option<Tape> {
        let mut state = self.state.lock();
        Self::finalize_open(&mut state, &self.sink);
        state.tape.clone()
    }

    /// Finalize, decorate, redact, and persist under the record-mode
    /// policy. Returns the written path, or `None` when nothing was
    /// written (empty tape, `DISABLED`, or `NEW` with an existing match).
    /// The in-memory tape stays readable via [`Recorder::tape`].
    pub fn stop(&self) -> Result<Option<PathBuf>, ReplayError> {
        let tape = {
            let mut state = self.state.lock();
            if !state.started {
                return Ok(None);
            }
            Self::finalize_open(&mut state, &self.sink);
            state.started = false;
            state.tape.clone()
        };
        let Some(tape) = tape else {
            return Ok(None);
        };
        if tape.exchanges.is_empty() {
            return Ok(None);
        }

        let ctx = self.info.match_context("", tape.exchanges.len());
        let mode = self.mode.resolve(&ctx);
        let path = match mode {
            RecordMode::Disabled => return Ok(None),
            RecordMode::New => {
                if self.store.has_tape_matching(&tape.meta) {
                    tracing::debug!(
                        program = %tape.meta.program,
                        "matching tape already on disk; keeping this run in memory"
                    );
                    return Ok(None);
                }
                self.namegen.generate(&self.name_context(&tape))
            }
            RecordMode::Overwrite => self
                .store
                .overwrite_target(&tape.meta)
                .unwrap_or_else(|| self.namegen.generate(&self.name_context(&tape))),
        };

        let tape = self.decorators.decorate_tape(&ctx, tape);
        let written = self.store.save_tape(&tape, &path, Some(&self.redactor))?;
        tracing::info!(path = %written.display(), "tape recorded");
        Ok(Some(written))
    }

    fn name_context(&self, tape: &Tape) -> NameContext {
        NameContext {
            program: self.info.program.clone(),
            args: self.info.args.clone(),
            cwd: self.info.cwd.display().to_string(),
            current_input: tape
                .exchanges
                .first()
                .and_then(|e| e.input.data_text.clone())
                .unwrap_or_default(),
            tag: None,
            epoch_ms: epoch_ms(),
        }
    }

    fn finalize_open(state: &mut RecState, sink: &ChunkSink) {
        let Some(open) = state.open.take() else {
            return;
        };
        let output = sink.take_output();
        let total_delay = output.total_delay_ms();
        let elapsed = open.started_at.elapsed().as_millis() as u64;
        let exchange = Exchange {
            pre: open.pre,
            input: open.input,
            output,
            exit: open.exit,
            dur_ms: elapsed.max(total_delay),
            annotations: Default::default(),
            extra: Default::default(),
        };
        if let Some(tape) = state.tape.as_mut() {
            tape.exchanges.push(exchange);
        }
    }
}

fn epoch_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
