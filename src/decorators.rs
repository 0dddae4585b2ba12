//! Free-form transforms applied while recording: inputs and outputs as
//! they are captured, and the whole tape just before it is persisted.

use std::fmt;
use std::sync::Arc;

use crate::matchers::MatchContext;
use crate::model::Tape;

pub type InputDecorator = Arc<dyn Fn(&MatchContext, Vec<u8>) -> Vec<u8> + Send + Sync>;
pub type OutputDecorator = Arc<dyn Fn(&MatchContext, Vec<u8>) -> Vec<u8> + Send + Sync>;
pub type TapeDecorator = Arc<dyn Fn(&MatchContext, Tape) -> Tape + Send + Sync>;

/// The decorators configured for one session. All are optional; absent
/// decorators are identity transforms.
#[derive(Clone, Default)]
pub struct DecoratorSet {
    input: Option<InputDecorator>,
    output: Option<OutputDecorator>,
    tape: Option<TapeDecorator>,
}

impl DecoratorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, decorator: InputDecorator) -> Self {
        self.input = Some(decorator);
        self
    }

    pub fn with_output(mut self, decorator: OutputDecorator) -> Self {
        self.output = Some(decorator);
        self
    }

    pub fn with_tape(mut self, decorator: TapeDecorator) -> Self {
        self.tape = Some(decorator);
        self
    }

    pub fn decorate_input(&self, ctx: &MatchContext, data: Vec<u8>) -> Vec<u8> {
        match &self.input {
            Some(f) => f(ctx, data),
            None => data,
        }
    }

    pub fn decorate_output(&self, ctx: &MatchContext, data: Vec<u8>) -> Vec<u8> {
        match &self.output {
            Some(f) => f(ctx, data),
            None => data,
        }
    }

    pub fn decorate_tape(&self, ctx: &MatchContext, tape: Tape) -> Tape {
        match &self.tape {
            Some(f) => f(ctx, tape),
            None => tape,
        }
    }
}

impl fmt::Debug for DecoratorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoratorSet")
            .field("input", &self.input.is_some())
            .field("output", &self.output.is_some())
            .field("tape", &self.tape.is_some())
            .finish()
    }
}

/// Tape decorator that stamps a tag into the metadata.
pub fn tag_decorator(tag: impl Into<String>) -> TapeDecorator {
    let tag = tag.into();
    Arc::new(move |_ctx, mut tape| {
        tape.meta.tag = Some(tag.clone());
        tape
    })
}

/// Tape decorator that drops every captured env var not in `allowed`.
pub fn env_filter_decorator(allowed: Vec<String>) -> TapeDecorator {
    Arc::new(move |_ctx, mut tape| {
        tape.meta.env.retain(|key, _| allowed.iter().any(|a| a == key));
        tape
    })
}
