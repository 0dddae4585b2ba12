//! Shared fixtures for the replay integration tests.

use claudecontrol::{
    Chunk, Exchange, ExchangePre, ExitInfo, IOInput, IOOutput, InputKind, Tape, TapeMeta,
};

/// A single-exchange tape for `program args...` answering `input` with one
/// chunk per element of `output`.
pub fn scripted_tape(
    program: &str,
    args: &[&str],
    prompt: &str,
    input: &str,
    output: &[&[u8]],
    exit: Option<ExitInfo>,
) -> Tape {
    Tape {
        meta: TapeMeta {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..TapeMeta::default()
        },
        exchanges: vec![Exchange {
            pre: ExchangePre {
                prompt: prompt.to_string(),
                ..ExchangePre::default()
            },
            input: IOInput::from_bytes(InputKind::Line, input.as_bytes()),
            output: IOOutput {
                chunks: output.iter().map(|data| Chunk::new(0, data.to_vec())).collect(),
            },
            exit,
            dur_ms: 0,
            ..Exchange::default()
        }],
        ..Tape::default()
    }
}
