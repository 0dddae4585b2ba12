//! Record and fallback modes, static or resolved per exchange.

use std::fmt;
use std::sync::Arc;

use crate::matchers::MatchContext;

/// Policy governing tape writes at session end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordMode {
    /// Create a tape only when no matching one exists; otherwise the run's
    /// exchanges stay on the in-memory tape.
    #[default]
    New,
    /// Replace an on-disk tape whose key matches.
    Overwrite,
    /// Never write; misses fall through to the fallback mode.
    Disabled,
}

impl RecordMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordMode::New => "new",
            RecordMode::Overwrite => "overwrite",
            RecordMode::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "overwrite" => RecordMode::Overwrite,
            "disabled" => RecordMode::Disabled,
            _ => RecordMode::New,
        }
    }
}

impl fmt::Display for RecordMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Behavior when no recorded exchange matches the current stimulus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackMode {
    /// Raise a tape-miss error carrying a diagnostic context snapshot.
    #[default]
    NotFound,
    /// Spawn the real program once and route subsequent I/O through it.
    Proxy,
}

impl FallbackMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackMode::NotFound => "not_found",
            FallbackMode::Proxy => "proxy",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "proxy" => FallbackMode::Proxy,
            _ => FallbackMode::NotFound,
        }
    }
}

impl fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A record mode, fixed or computed from the match context.
#[derive(Clone)]
pub enum RecordPolicy {
    Mode(RecordMode),
    Fn(Arc<dyn Fn(&MatchContext) -> RecordMode + Send + Sync>),
}

impl RecordPolicy {
    pub fn resolve(&self, ctx: &MatchContext) -> RecordMode {
        match self {
            RecordPolicy::Mode(mode) => *mode,
            RecordPolicy::Fn(f) => f(ctx),
        }
    }
}

impl Default for RecordPolicy {
    fn default() -> Self {
        RecordPolicy::Mode(RecordMode::New)
    }
}

impl From<RecordMode> for RecordPolicy {
    fn from(mode: RecordMode) -> Self {
        RecordPolicy::Mode(mode)
    }
}

impl fmt::Debug for RecordPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordPolicy::Mode(mode) => write!(f, "RecordPolicy::Mode({mode})"),
            RecordPolicy::Fn(_) => write!(f, "RecordPolicy::Fn(..)"),
        }
    }
}

/// A fallback mode, fixed or computed from the match context.
#[derive(Clone)]
pub enum FallbackPolicy {
    Mode(FallbackMode),
    Fn(Arc<dyn Fn(&MatchContext) -> FallbackMode + Send + Sync>),
}

impl FallbackPolicy {
    pub fn resolve(&self, ctx: &MatchContext) -> FallbackMode {
        match self {
            FallbackPolicy::Mode(mode) => *mode,
            FallbackPolicy::Fn(f) => f(ctx),
        }
    }
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        FallbackPolicy::Mode(FallbackMode::NotFound)
    }
}

impl From<FallbackMode> for FallbackPolicy {
    fn from(mode: FallbackMode) -> Self {
        FallbackPolicy::Mode(mode)
    }
}

impl fmt::Debug for FallbackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackPolicy::Mode(mode) => write!(f, "FallbackPolicy::Mode({mode})"),
            FallbackPolicy::Fn(_) => write!(f, "FallbackPolicy::Fn(..)"),
        }
    }
}
