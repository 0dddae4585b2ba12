//! Per-session configuration surface.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::inject::ErrorRate;
use crate::latency::LatencyPolicy;
use crate::matchers::{ArgFilter, MatchContext};
use crate::model::PtySize;
use crate::modes::{FallbackPolicy, RecordPolicy};

/// Identity of the session being recorded or replayed: the program the
/// harness would spawn and the environment it would spawn it in.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub pty: Option<PtySize>,
}

impl SessionInfo {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            pty: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_pty(mut self, rows: u16, cols: u16) -> Self {
        self.pty = Some(PtySize { rows, cols });
        self
    }

    /// Match context for this session at a given prompt and position.
    pub fn match_context(&self, prompt: impl Into<String>, exchange_index: usize) -> MatchContext {
        MatchContext {
            program: self.program.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.display().to_string(),
            prompt: prompt.into(),
            exchange_index,
            tape_path: None,
            state_hash: None,
        }
    }
}

/// The recognized per-session options; everything else is library-level
/// customization on the individual components.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Root directory for tape discovery and new recordings.
    pub tapes_path: PathBuf,
    /// Tape write policy, fixed or a function of context.
    pub record: RecordPolicy,
    /// Miss behavior, fixed or a function of context.
    pub fallback: FallbackPolicy,
    /// Delay policy for chunk streaming.
    pub latency: LatencyPolicy,
    /// Error-injection probability (0-100) or a function of context.
    pub error_rate: ErrorRate,
    /// Seed for deterministic error injection.
    pub seed: Option<u64>,
    /// Human label for recorded tapes; also selects the tagged name shape.
    pub tag: Option<String>,
    /// Restrict environment matching to these keys.
    pub allow_env: Option<Vec<String>>,
    /// Replace the default environment ignore set.
    pub ignore_env: Option<Vec<String>>,
    /// Arguments excluded from command matching.
    pub ignore_args: Vec<ArgFilter>,
    /// Accept any stdin when selecting exchanges.
    pub ignore_stdin: bool,
    /// Print the tape usage summary at close.
    pub summary: bool,
    /// Run the secret redactor before tapes are persisted.
    pub redact: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            tapes_path: PathBuf::from("tapes"),
            record: RecordPolicy::default(),
            fallback: FallbackPolicy::default(),
            latency: LatencyPolicy::realistic(),
            error_rate: ErrorRate::default(),
            seed: None,
            tag: None,
            allow_env: None,
            ignore_env: None,
            ignore_args: Vec::new(),
            ignore_stdin: false,
            summary: false,
            redact: true,
        }
    }
}

impl SessionOptions {
    pub fn new(tapes_path: impl Into<PathBuf>) -> Self {
        Self {
            tapes_path: tapes_path.into(),
            ..Self::default()
        }
    }

    pub fn with_record(mut self, record: impl Into<RecordPolicy>) -> Self {
        self.record = record.into();
        self
    }

    pub fn with_fallback(mut self, fallback: impl Into<FallbackPolicy>) -> Self {
        self.fallback = fallback.into();
        self
    }

    pub fn with_latency(mut self, latency: LatencyPolicy) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_error_rate(mut self, rate: impl Into<ErrorRate>) -> Self {
        self.error_rate = rate.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_allow_env<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_env = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_ignore_env<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_env = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_ignore_args(mut self, filters: Vec<ArgFilter>) -> Self {
        self.ignore_args = filters;
        self
    }

    pub fn with_ignore_stdin(mut self, on: bool) -> Self {
        self.ignore_stdin = on;
        self
    }

    pub fn with_summary(mut self, on: bool) -> Self {
        self.summary = on;
        self
    }

    pub fn with_redact(mut self, on: bool) -> Self {
        self.redact = on;
        self
    }
}
