//! Tape file naming strategies.
//!
//! Generators are pure: the timestamp is part of the context, so a given
//! context always maps to the same path.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

/// Context a generator maps to an output path.
#[derive(Debug, Clone, Default)]
pub struct NameContext {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub current_input: String,
    pub tag: Option<String>,
    pub epoch_ms: u64,
}

/// Strategy mapping a session context to a tape file path under a root.
pub trait TapeNameGenerator: Send + Sync {
    fn generate(&self, ctx: &NameContext) -> PathBuf;
}

/// `{root}/{program}/unnamed-{epoch_ms}-{hash}.tape`, where the hash is
/// SHA-1 over program, args, cwd, and the current input, truncated to
/// 8 hex chars.
#[derive(Debug, Clone)]
pub struct DefaultTapeNameGenerator {
    root: PathBuf,
}

impl DefaultTapeNameGenerator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TapeNameGenerator for DefaultTapeNameGenerator {
    fn generate(&self, ctx: &NameContext) -> PathBuf {
        let program = sanitize(&program_basename(&ctx.program));
        let hash = content_hash(ctx);
        self.root
            .join(&program)
            .join(format!("unnamed-{}-{hash}.tape", ctx.epoch_ms))
    }
}

/// Inserts a verb directory when the first argument looks like a
/// subcommand (`git commit`, `npm install`, ...).
#[derive(Debug, Clone)]
pub struct SemanticTapeNameGenerator {
    root: PathBuf,
}

impl SemanticTapeNameGenerator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TapeNameGenerator for SemanticTapeNameGenerator {
    fn generate(&self, ctx: &NameContext) -> PathBuf {
        let program = sanitize(&program_basename(&ctx.program));
        let hash = content_hash(ctx);
        let verb = ctx
            .args
            .first()
            .filter(|arg| !arg.is_empty() && arg.chars().all(|c| c.is_ascii_lowercase()))
            .cloned();

        match verb {
            Some(verb) => self
                .root
                .join(&program)
                .join(&verb)
                .join(format!("{verb}-{}-{hash}.tape", ctx.epoch_ms)),
            None => self
                .root
                .join(&program)
                .join(format!("session-{}-{hash}.tape", ctx.epoch_ms)),
        }
    }
}

/// Substitutes a user-provided tag for the content hash.
#[derive(Debug, Clone)]
pub struct TaggedTapeNameGenerator {
    root: PathBuf,
    tag: Option<String>,
}

impl TaggedTapeNameGenerator {
    pub fn new(root: impl Into<PathBuf>, tag: Option<String>) -> Self {
        Self {
            root: root.into(),
            tag,
        }
    }
}

impl TapeNameGenerator for TaggedTapeNameGenerator {
    fn generate(&self, ctx: &NameContext) -> PathBuf {
        let program = sanitize(&program_basename(&ctx.program));
        let tag = ctx.tag.as_ref().or(self.tag.as_ref());
        match tag {
            Some(tag) => self
                .root
                .join(&program)
                .join(format!("{}-{}.tape", sanitize(tag), ctx.epoch_ms)),
            None => {
                let hash = content_hash(ctx);
                self.root
                    .join(&program)
                    .join(format!("unnamed-{}-{hash}.tape", ctx.epoch_ms))
            }
        }
    }
}

fn program_basename(program: &str) -> String {
    std::path::Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

fn sanitize(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "unknown".to_string()
    } else {
        sanitized
    }
}

fn content_hash(ctx: &NameContext) -> String {
    let mut parts = vec![ctx.program.clone()];
    parts.extend(ctx.args.iter().cloned());
    parts.push(ctx.cwd.clone());
    if !ctx.current_input.is_empty() {
        parts.push(ctx.current_input.clone());
    }
    let key = parts.join(" ");

    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}
