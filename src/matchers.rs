//! The matching engine: decides whether a recorded exchange answers the
//! current stimulus.
//!
//! Five capability seams (command, environment, prompt, stdin, state), each
//! with a default implementation, composed in fixed order with first-false
//! wins. Custom matchers plug in as trait objects.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde_json::json;

use crate::model::{Exchange, TapeMeta};
use crate::normalize::{strip_ansi, Normalizer};

/// Environment keys ignored by default: shell bookkeeping and terminal
/// identity that vary between otherwise identical runs.
pub const DEFAULT_IGNORE_ENV: &[&str] = &[
    "PWD",
    "OLDPWD",
    "SHLVL",
    "RANDOM",
    "_",
    "COLUMNS",
    "LINES",
    "PS1",
    "PS2",
    "PS3",
    "PS4",
    "HISTSIZE",
    "HISTFILESIZE",
    "HISTFILE",
    "SSH_CLIENT",
    "SSH_CONNECTION",
    "SSH_TTY",
    "DISPLAY",
    "WINDOWID",
    "TERM_SESSION_ID",
    "TERM_PROGRAM",
];

/// Placeholder substituted for arguments excluded from comparison.
const IGNORED_ARG: &str = "<IGNORED>";

/// Context for one match attempt: the session identity plus the state
/// observed at `send` time.
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: String,
    pub prompt: String,
    pub exchange_index: usize,
    pub tape_path: Option<PathBuf>,
    pub state_hash: Option<String>,
}

impl MatchContext {
    /// Diagnostic snapshot carried by tape-miss errors.
    pub fn diagnostic(&self) -> serde_json::Value {
        let prompt_excerpt: String = self.prompt.chars().rev().take(120).collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        json!({
            "program": self.program,
            "args": self.args,
            "cwd": self.cwd,
            "prompt": prompt_excerpt,
            "exchangeIndex": self.exchange_index,
            "tapePath": self.tape_path.as_ref().map(|p| p.display().to_string()),
            "stateHash": self.state_hash,
        })
    }
}

/// Argument filter: exclude by positional index or by prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgFilter {
    Index(usize),
    Prefix(String),
}

pub trait CommandMatcher: Send + Sync {
    fn matches(&self, recorded: &[String], current: &[String], ctx: &MatchContext) -> bool;
}

pub trait EnvMatcher: Send + Sync {
    fn matches(
        &self,
        recorded: &BTreeMap<String, String>,
        current: &BTreeMap<String, String>,
        ctx: &MatchContext,
    ) -> bool;
}

pub trait PromptMatcher: Send + Sync {
    fn matches(&self, recorded: &str, current: &str, ctx: &MatchContext) -> bool;
}

pub trait StdinMatcher: Send + Sync {
    fn matches(&self, recorded: &[u8], current: &[u8], ctx: &MatchContext) -> bool;
}

pub trait StateMatcher: Send + Sync {
    fn matches(&self, recorded: Option<&str>, current: Option<&str>) -> bool;
}

/// Compares program basenames and the argument lists after filtering and
/// optional path normalization.
pub struct DefaultCommandMatcher {
    pub normalize_paths: bool,
    pub ignore_args: Vec<ArgFilter>,
}

impl Default for DefaultCommandMatcher {
    fn default() -> Self {
        Self {
            normalize_paths: true,
            ignore_args: Vec::new(),
        }
    }
}

impl DefaultCommandMatcher {
    pub fn with_ignore_args(mut self, filters: Vec<ArgFilter>) -> Self {
        self.ignore_args = filters;
        self
    }

    fn filtered_args(&self, cmd: &[String]) -> Vec<String> {
        let mut args: Vec<String> = cmd.iter().skip(1).cloned().collect();
        for filter in &self.ignore_args {
            match filter {
                ArgFilter::Index(i) => {
                    if let Some(slot) = args.get_mut(*i) {
                        *slot = IGNORED_ARG.to_string();
                    }
                }
                ArgFilter::Prefix(prefix) => {
                    for slot in args.iter_mut() {
                        if slot.starts_with(prefix.as_str()) {
                            *slot = IGNORED_ARG.to_string();
                        }
                    }
                }
            }
        }
        if self.normalize_paths {
            args = args.iter().map(|a| normalize_path_arg(a)).collect();
        }
        args
    }
}

impl CommandMatcher for DefaultCommandMatcher {
    fn matches(&self, recorded: &[String], current: &[String], _ctx: &MatchContext) -> bool {
        if basename(recorded.first()) != basename(current.first()) {
            return false;
        }
        self.filtered_args(recorded) == self.filtered_args(current)
    }
}

/// Compares environments over an allow-list, or over all keys minus an
/// ignore set.
pub struct DefaultEnvMatcher {
    pub allow_env: Option<Vec<String>>,
    pub ignore_env: Vec<String>,
}

impl Default for DefaultEnvMatcher {
    fn default() -> Self {
        Self {
            allow_env: None,
            ignore_env: DEFAULT_IGNORE_ENV.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EnvMatcher for DefaultEnvMatcher {
    fn matches(
        &self,
        recorded: &BTreeMap<String, String>,
        current: &BTreeMap<String, String>,
        _ctx: &MatchContext,
    ) -> bool {
        let keys: BTreeSet<&str> = match &self.allow_env {
            Some(allowed) => allowed.iter().map(String::as_str).collect(),
            None => {
                let mut keys: BTreeSet<&str> = recorded
                    .keys()
                    .chain(current.keys())
                    .map(String::as_str)
                    .collect();
                for ignored in &self.ignore_env {
                    keys.remove(ignored.as_str());
                }
                keys
            }
        };
        keys.iter()
            .all(|key| recorded.get(*key) == current.get(*key))
    }
}

/// Compares prompts after ANSI strip and normalization; optionally treats
/// the recorded prompt as a regex.
pub struct DefaultPromptMatcher {
    pub strip_ansi: bool,
    pub use_regex: bool,
    pub normalize: bool,
    normalizer: Normalizer,
}

impl Default for DefaultPromptMatcher {
    fn default() -> Self {
        Self {
            strip_ansi: true,
            use_regex: false,
            normalize: true,
            normalizer: Normalizer::new(),
        }
    }
}

impl DefaultPromptMatcher {
    pub fn with_regex(mut self, on: bool) -> Self {
        self.use_regex = on;
        self
    }
}

impl PromptMatcher for DefaultPromptMatcher {
    fn matches(&self, recorded: &str, current: &str, _ctx: &MatchContext) -> bool {
        let mut recorded = recorded.to_string();
        let mut current = current.to_string();
        if self.strip_ansi {
            recorded = strip_ansi(&recorded);
            current = strip_ansi(&current);
        }
        if self.normalize {
            recorded = self.normalizer.normalize(&recorded);
            current = self.normalizer.normalize(&current);
        }
        if self.use_regex {
            // Compile failure falls back to equality.
            if let Ok(re) = Regex::new(&recorded) {
                return re.is_match(&current);
            }
        }
        recorded == current
    }
}

/// Compares stdin after stripping an optional trailing CR/LF and
/// normalizing; non-UTF-8 input falls back to raw byte equality.
pub struct DefaultStdinMatcher {
    pub normalize: bool,
    pub ignore_trailing_newline: bool,
    normalizer: Normalizer,
}

impl Default for DefaultStdinMatcher {
    fn default() -> Self {
        Self {
            normalize: true,
            ignore_trailing_newline: true,
            normalizer: Normalizer::new(),
        }
    }
}

impl StdinMatcher for DefaultStdinMatcher {
    fn matches(&self, recorded: &[u8], current: &[u8], _ctx: &MatchContext) -> bool {
        let (recorded, current) = if self.ignore_trailing_newline {
            (strip_trailing_newline(recorded), strip_trailing_newline(current))
        } else {
            (recorded, current)
        };

        if self.normalize {
            if let (Ok(rec), Ok(cur)) = (std::str::from_utf8(recorded), std::str::from_utf8(current))
            {
                return self.normalizer.normalize(rec) == self.normalizer.normalize(cur);
            }
        }
        recorded == current
    }
}

/// Accepts any stdin; for scripted sessions where only the prompt drives
/// selection.
pub struct IgnoreStdinMatcher;

impl StdinMatcher for IgnoreStdinMatcher {
    fn matches(&self, _recorded: &[u8], _current: &[u8], _ctx: &MatchContext) -> bool {
        true
    }
}

/// Compares opaque state hashes; defers when either side is absent.
#[derive(Default)]
pub struct DefaultStateMatcher;

impl StateMatcher for DefaultStateMatcher {
    fn matches(&self, recorded: Option<&str>, current: Option<&str>) -> bool {
        match (recorded, current) {
            (Some(rec), Some(cur)) => rec == cur,
            _ => true,
        }
    }
}

/// The composite: command, environment, prompt, stdin, state, evaluated in
/// that order. An exchange is eligible only if all five pass.
pub struct CompositeMatcher {
    pub command: Box<dyn CommandMatcher>,
    pub env: Box<dyn EnvMatcher>,
    pub prompt: Box<dyn PromptMatcher>,
    pub stdin: Box<dyn StdinMatcher>,
    pub state: Box<dyn StateMatcher>,
}

impl Default for CompositeMatcher {
    fn default() -> Self {
        Self {
            command: Box::new(DefaultCommandMatcher::default()),
            env: Box::new(DefaultEnvMatcher::default()),
            prompt: Box::new(DefaultPromptMatcher::default()),
            stdin: Box::new(DefaultStdinMatcher::default()),
            state: Box::new(DefaultStateMatcher),
        }
    }
}

impl CompositeMatcher {
    /// Assemble a matcher set from the per-session knobs.
    pub fn configured(
        allow_env: Option<Vec<String>>,
        ignore_env: Option<Vec<String>>,
        ignore_args: Vec<ArgFilter>,
        ignore_stdin: bool,
    ) -> Self {
        let env = DefaultEnvMatcher {
            allow_env,
            ignore_env: ignore_env.unwrap_or_else(|| {
                DEFAULT_IGNORE_ENV.iter().map(|s| s.to_string()).collect()
            }),
        };
        let stdin: Box<dyn StdinMatcher> = if ignore_stdin {
            Box::new(IgnoreStdinMatcher)
        } else {
            Box::new(DefaultStdinMatcher::default())
        };
        Self {
            command: Box::new(DefaultCommandMatcher::default().with_ignore_args(ignore_args)),
            env: Box::new(env),
            prompt: Box::new(DefaultPromptMatcher::default()),
            stdin,
            state: Box::new(DefaultStateMatcher),
        }
    }

    pub fn with_command(mut self, matcher: Box<dyn CommandMatcher>) -> Self {
        self.command = matcher;
        self
    }

    pub fn with_prompt(mut self, matcher: Box<dyn PromptMatcher>) -> Self {
        self.prompt = matcher;
        self
    }

    pub fn with_stdin(mut self, matcher: Box<dyn StdinMatcher>) -> Self {
        self.stdin = matcher;
        self
    }

    /// Whether `exchange` from a tape described by `meta` answers the
    /// current stimulus.
    pub fn matches_exchange(
        &self,
        meta: &TapeMeta,
        exchange: &Exchange,
        ctx: &MatchContext,
        current_input: &[u8],
    ) -> bool {
        let mut recorded_cmd = Vec::with_capacity(meta.args.len() + 1);
        recorded_cmd.push(meta.program.clone());
        recorded_cmd.extend(meta.args.iter().cloned());

        let mut current_cmd = Vec::with_capacity(ctx.args.len() + 1);
        current_cmd.push(ctx.program.clone());
        current_cmd.extend(ctx.args.iter().cloned());

        if !self.command.matches(&recorded_cmd, &current_cmd, ctx) {
            return false;
        }
        if !self.env.matches(&meta.env, &ctx.env, ctx) {
            return false;
        }
        if !self.prompt.matches(&exchange.pre.prompt, &ctx.prompt, ctx) {
            return false;
        }
        if !self
            .stdin
            .matches(&exchange.input.bytes(), current_input, ctx)
        {
            return false;
        }
        self.state.matches(
            exchange.pre.state_hash.as_deref(),
            ctx.state_hash.as_deref(),
        )
    }
}

fn basename(arg: Option<&String>) -> String {
    arg.map(|s| {
        Path::new(s)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| s.clone())
    })
    .unwrap_or_default()
}

/// Expand a leading `~` and resolve absolute paths; non-path arguments are
/// returned untouched, as are paths that fail to resolve.
fn normalize_path_arg(arg: &str) -> String {
    if !arg.starts_with('/') && !arg.starts_with('~') {
        return arg.to_string();
    }
    let expanded = if let Some(rest) = arg.strip_prefix("~") {
        match dirs::home_dir() {
            Some(home) => {
                let rest = rest.strip_prefix('/').unwrap_or(rest);
                home.join(rest)
            }
            None => PathBuf::from(arg),
        }
    } else {
        PathBuf::from(arg)
    };
    match expanded.canonicalize() {
        Ok(resolved) => resolved.display().to_string(),
        Err(_) => expanded.display().to_string(),
    }
}

fn strip_trailing_newline(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0 && (data[end - 1] == b'\n' || data[end - 1] == b'\r') {
        end -= 1;
    }
    &data[..end]
}
