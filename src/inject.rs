//! Synthetic failure injection during replay: truncated output, an error
//! message, and a forced exit code, gated by a probability.

use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::matchers::MatchContext;

/// An injection probability in percent, fixed or computed from context.
#[derive(Clone)]
pub enum ErrorRate {
    Fixed(f64),
    Fn(Arc<dyn Fn(&MatchContext) -> f64 + Send + Sync>),
}

impl ErrorRate {
    pub fn resolve(&self, ctx: &MatchContext) -> f64 {
        match self {
            ErrorRate::Fixed(rate) => *rate,
            ErrorRate::Fn(f) => f(ctx),
        }
    }
}

impl Default for ErrorRate {
    fn default() -> Self {
        ErrorRate::Fixed(0.0)
    }
}

impl From<f64> for ErrorRate {
    fn from(rate: f64) -> Self {
        ErrorRate::Fixed(rate)
    }
}

impl fmt::Debug for ErrorRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorRate::Fixed(rate) => write!(f, "ErrorRate::Fixed({rate})"),
            ErrorRate::Fn(_) => write!(f, "ErrorRate::Fn(..)"),
        }
    }
}

/// Configurable error injection for replayed exchanges.
///
/// When an exchange fires, the replay emits the first
/// `floor(total_chunks * truncate_at)` chunks, appends `error_message`, and
/// sets the exit status to `exit_code`. A seed makes firing deterministic.
#[derive(Debug, Clone)]
pub struct ErrorInjectionPolicy {
    pub rate: ErrorRate,
    pub exit_code: i32,
    pub error_message: String,
    pub truncate_at: f64,
    pub seed: Option<u64>,
}

impl Default for ErrorInjectionPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl ErrorInjectionPolicy {
    pub fn new(rate: impl Into<ErrorRate>) -> Self {
        Self {
            rate: rate.into(),
            exit_code: 1,
            error_message: "Simulated error".to_string(),
            truncate_at: 0.5,
            seed: None,
        }
    }

    /// Never fires.
    pub fn none() -> Self {
        Self::new(0.0)
    }

    /// Always fires, cutting output at the halfway chunk.
    pub fn halfway() -> Self {
        Self::new(100.0)
    }

    /// Always fires before any output is emitted.
    pub fn immediate() -> Self {
        Self::new(100.0).with_truncate_at(0.0)
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    /// Fraction of chunks to emit before the failure, clamped to `[0, 1]`.
    pub fn with_truncate_at(mut self, at: f64) -> Self {
        self.truncate_at = at.clamp(0.0, 1.0);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Decide whether this exchange fails. Seeded decisions are
    /// reproducible across runs.
    pub fn should_fail(&self, ctx: &MatchContext) -> bool {
        let rate = self.rate.resolve(ctx);
        if rate <= 0.0 {
            return false;
        }
        if rate >= 100.0 {
            return true;
        }
        let roll: f64 = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed).random(),
            None => rand::rng().random(),
        };
        roll * 100.0 < rate
    }

    /// Chunk index at which the failure cuts the output.
    pub fn truncation_point(&self, total_chunks: usize) -> usize {
        if total_chunks == 0 {
            return 0;
        }
        (total_chunks as f64 * self.truncate_at).floor() as usize
    }
}
