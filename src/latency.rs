//! Delay policies for chunk streaming during replay.

use std::fmt;
use std::sync::Arc;

use rand::Rng;

use crate::matchers::MatchContext;

/// A delay source: fixed milliseconds, a uniform-random range, or a
/// function of the match context.
#[derive(Clone)]
pub enum Latency {
    Fixed(u64),
    Range(u64, u64),
    Fn(Arc<dyn Fn(&MatchContext) -> u64 + Send + Sync>),
}

impl Latency {
    /// Resolve this source to a delay in milliseconds.
    pub fn resolve(&self, ctx: &MatchContext) -> u64 {
        match self {
            Latency::Fixed(ms) => *ms,
            Latency::Range(lo, hi) => {
                let (lo, hi) = if lo <= hi { (*lo, *hi) } else { (*hi, *lo) };
                rand::rng().random_range(lo..=hi)
            }
            Latency::Fn(f) => f(ctx),
        }
    }

    /// A fixed zero delay, the "no override" sentinel.
    pub fn is_zero(&self) -> bool {
        matches!(self, Latency::Fixed(0))
    }
}

impl Default for Latency {
    fn default() -> Self {
        Latency::Fixed(0)
    }
}

impl From<u64> for Latency {
    fn from(ms: u64) -> Self {
        Latency::Fixed(ms)
    }
}

impl From<(u64, u64)> for Latency {
    fn from((lo, hi): (u64, u64)) -> Self {
        Latency::Range(lo, hi)
    }
}

impl fmt::Debug for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Latency::Fixed(ms) => write!(f, "Latency::Fixed({ms})"),
            Latency::Range(lo, hi) => write!(f, "Latency::Range({lo}, {hi})"),
            Latency::Fn(_) => write!(f, "Latency::Fn(..)"),
        }
    }
}

/// Per-chunk and per-exchange delay selection.
///
/// The chunk delay is the chunk override when set, else the global source
/// when nonzero, else the chunk's recorded delay (the default "realistic"
/// policy).
#[derive(Debug, Clone, Default)]
pub struct LatencyPolicy {
    pub global: Latency,
    pub chunk: Option<Latency>,
    pub exchange: Option<Latency>,
}

impl LatencyPolicy {
    /// Replay with the delays that were recorded.
    pub fn realistic() -> Self {
        Self::default()
    }

    /// Minimal fixed delay between chunks.
    pub fn fast() -> Self {
        Self {
            global: Latency::Fixed(1),
            ..Self::default()
        }
    }

    /// Simulate a slow link.
    pub fn slow() -> Self {
        Self {
            global: Latency::Range(50, 200),
            ..Self::default()
        }
    }

    pub fn with_global(mut self, latency: impl Into<Latency>) -> Self {
        self.global = latency.into();
        self
    }

    pub fn with_chunk(mut self, latency: impl Into<Latency>) -> Self {
        self.chunk = Some(latency.into());
        self
    }

    pub fn with_exchange(mut self, latency: impl Into<Latency>) -> Self {
        self.exchange = Some(latency.into());
        self
    }

    /// Delay before streaming one chunk.
    pub fn chunk_delay(&self, recorded_ms: u64, ctx: &MatchContext) -> u64 {
        if let Some(chunk) = &self.chunk {
            chunk.resolve(ctx)
        } else if !self.global.is_zero() {
            self.global.resolve(ctx)
        } else {
            recorded_ms
        }
    }

    /// Delay before starting a new exchange.
    pub fn exchange_delay(&self, ctx: &MatchContext) -> u64 {
        match &self.exchange {
            Some(exchange) => exchange.resolve(ctx),
            None => self.global.resolve(ctx),
        }
    }
}
