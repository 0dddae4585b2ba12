//! Record-and-replay transport for interactive command-line sessions.
//!
//! An expect-style harness drives a child process; this crate taps its
//! I/O stream, persists each stimulus/response exchange to human-editable
//! tape files, and on later runs serves the same observable behavior from
//! those tapes without launching the real program. Tests that drive
//! external CLIs become deterministic, hermetic, and fast.

pub mod decorators;
pub mod error;
pub mod inject;
pub mod latency;
pub mod matchers;
pub mod model;
pub mod modes;
pub mod namegen;
pub mod normalize;
pub mod options;
pub mod play;
pub mod record;
pub mod redact;
pub mod store;
pub mod summary;

pub use decorators::{DecoratorSet, InputDecorator, OutputDecorator, TapeDecorator};
pub use error::ReplayError;
pub use inject::{ErrorInjectionPolicy, ErrorRate};
pub use latency::{Latency, LatencyPolicy};
pub use matchers::{
    ArgFilter, CommandMatcher, CompositeMatcher, DefaultCommandMatcher, DefaultEnvMatcher,
    DefaultPromptMatcher, DefaultStateMatcher, DefaultStdinMatcher, EnvMatcher,
    IgnoreStdinMatcher, MatchContext, PromptMatcher, StateMatcher, StdinMatcher,
};
pub use model::{
    Chunk, Exchange, ExchangePre, ExitInfo, IOInput, IOOutput, InputKind, PtySize, Tape, TapeMeta,
    TapeSession,
};
pub use modes::{FallbackMode, FallbackPolicy, RecordMode, RecordPolicy};
pub use namegen::{
    DefaultTapeNameGenerator, NameContext, SemanticTapeNameGenerator, TaggedTapeNameGenerator,
    TapeNameGenerator,
};
pub use normalize::Normalizer;
pub use options::{SessionInfo, SessionOptions};
pub use play::{ExpectMatch, ReplayTransport, Transport};
pub use record::{ChunkSink, CompositeSink, OutputSink, Recorder};
pub use redact::SecretRedactor;
pub use store::{LoadedTape, TapeStore};
pub use summary::{print_summary, write_summary};
