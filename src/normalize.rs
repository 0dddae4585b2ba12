//! Canonicalization of volatile text for matching.
//!
//! Matching prompts, stdin, and index keys against recorded tapes has to
//! survive ANSI styling, timestamps, temp paths, and other run-to-run noise.
//! The passes run in a fixed order: ANSI strip, whitespace collapse,
//! volatile-token scrub, then line-ending normalization. `normalize` is pure
//! and idempotent.

use std::sync::OnceLock;

use regex::Regex;

const ANSI_PATTERN: &str = r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])";

/// Volatile token patterns and their placeholders, applied in order.
const VOLATILE_PATTERNS: &[(&str, &str)] = &[
    // ISO timestamps
    (
        r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})?\b",
        "<TIMESTAMP>",
    ),
    // Unix timestamps (10-13 digits)
    (r"\b1[0-9]{9,12}\b", "<UNIX_TIME>"),
    // Hex IDs (7-40 chars, like git commits)
    (r"\b[0-9a-f]{7,40}\b", "<HEX_ID>"),
    // UUIDs
    (
        r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
        "<UUID>",
    ),
    // Memory addresses
    (r"\b0x[0-9a-fA-F]+\b", "<ADDR>"),
    // PIDs
    (r"(?i)\bpid[:\s]*\d{3,7}\b", "pid:<PID>"),
    // Temporary file paths
    (r"/tmp/[^\s]+", "<TMPFILE>"),
    // Random temp names
    (r"(?i)\b(?:tmp|temp)[_-]?[a-zA-Z0-9]{6,}\b", "<TEMPNAME>"),
];

/// User-specific path prefixes, per platform.
const PATH_PATTERNS: &[(&str, &str)] = &[
    (r"/home/[^/\s]+", "/home/<USER>"),
    (r"/Users/[^/\s]+", "/Users/<USER>"),
    (r"C:\\Users\\[^\\\s]+", r"C:\Users\<USER>"),
];

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ANSI_PATTERN).expect("ANSI pattern compiles"))
}

/// Remove ANSI escape sequences (CSI and 2-byte forms).
pub fn strip_ansi(text: &str) -> String {
    ansi_re().replace_all(text, "").into_owned()
}

/// Tabs to spaces, space runs to a single space, trailing whitespace
/// trimmed from each line.
pub fn collapse_whitespace(text: &str) -> String {
    static RUNS: OnceLock<Regex> = OnceLock::new();
    let runs = RUNS.get_or_init(|| Regex::new(" +").expect("space-run pattern compiles"));

    let text = text.replace('\t', " ");
    let text = runs.replace_all(&text, " ");
    text.split('\n')
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Normalize line endings to `\n`.
pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Configurable normalizer; compiled once, applied as a pure function.
#[derive(Debug, Clone)]
pub struct Normalizer {
    strip_ansi: bool,
    collapse_ws: bool,
    scrub_volatile: bool,
    scrub_paths: bool,
    volatile: Vec<(Regex, String)>,
    paths: Vec<(Regex, String)>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self {
            strip_ansi: true,
            collapse_ws: true,
            scrub_volatile: true,
            scrub_paths: true,
            volatile: compile_pairs(VOLATILE_PATTERNS),
            paths: compile_pairs(PATH_PATTERNS),
        }
    }

    pub fn with_strip_ansi(mut self, on: bool) -> Self {
        self.strip_ansi = on;
        self
    }

    pub fn with_collapse_whitespace(mut self, on: bool) -> Self {
        self.collapse_ws = on;
        self
    }

    pub fn with_scrub_volatile(mut self, on: bool) -> Self {
        self.scrub_volatile = on;
        self
    }

    pub fn with_scrub_paths(mut self, on: bool) -> Self {
        self.scrub_paths = on;
        self
    }

    /// Append custom scrub patterns after the defaults. Patterns that fail
    /// to compile are dropped.
    pub fn with_custom_patterns(mut self, pairs: &[(&str, &str)]) -> Self {
        self.volatile.extend(compile_pairs(pairs));
        self
    }

    /// Apply the configured passes in fixed order.
    pub fn normalize(&self, text: &str) -> String {
        let mut text = if self.strip_ansi {
            strip_ansi(text)
        } else {
            text.to_string()
        };
        if self.collapse_ws {
            text = collapse_whitespace(&text);
        }
        if self.scrub_volatile {
            for (re, replacement) in &self.volatile {
                text = re.replace_all(&text, replacement.as_str()).into_owned();
            }
        }
        if self.scrub_paths {
            for (re, replacement) in &self.paths {
                text = re.replace_all(&text, replacement.as_str()).into_owned();
            }
        }
        normalize_line_endings(&text)
    }

    /// Join normalized non-empty parts with `|` into a deterministic key.
    pub fn build_key(&self, parts: &[&str]) -> String {
        parts
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| self.normalize(p))
            .collect::<Vec<_>>()
            .join("|")
    }
}

fn compile_pairs(pairs: &[(&str, &str)]) -> Vec<(Regex, String)> {
    pairs
        .iter()
        .filter_map(|(pattern, replacement)| {
            Regex::new(pattern)
                .ok()
                .map(|re| (re, replacement.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_and_two_byte_sequences() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(strip_ansi("\x1b(Bplain"), "plain");
        assert_eq!(strip_ansi("no escapes"), "no escapes");
    }

    #[test]
    fn collapses_whitespace() {
        assert_eq!(collapse_whitespace("a\tb   c  \nd "), "a b c\nd");
    }

    #[test]
    fn scrubs_volatile_tokens() {
        let n = Normalizer::new();
        assert_eq!(
            n.normalize("built at 2025-01-15T10:30:00Z ok"),
            "built at <TIMESTAMP> ok"
        );
        assert_eq!(n.normalize("commit deadbeef1234"), "commit <HEX_ID>");
        assert_eq!(n.normalize("ptr 0xDEADBEEF"), "ptr <ADDR>");
        assert_eq!(n.normalize("wrote /tmp/scratch.txt done"), "wrote <TMPFILE> done");
        assert_eq!(n.normalize("epoch 1700000000"), "epoch <UNIX_TIME>");
    }

    #[test]
    fn hex_pass_runs_before_uuid_pass() {
        let n = Normalizer::new();
        // Lowercase UUID segments of hex-ID width are consumed by the
        // earlier hex pass.
        assert_eq!(
            n.normalize("id 550e8400-e29b-41d4-a716-446655440000"),
            "id <HEX_ID>-e29b-41d4-a716-<HEX_ID>"
        );
        // Uppercase UUIDs are out of the hex pass's reach and scrub whole.
        assert_eq!(
            n.normalize("id 550E8400-E29B-41D4-A716-446655440000"),
            "id <UUID>"
        );
    }

    #[test]
    fn scrubs_user_home_prefixes() {
        let n = Normalizer::new();
        assert_eq!(n.normalize("/home/alice/project"), "/home/<USER>/project");
        assert_eq!(n.normalize("/Users/bob/src"), "/Users/<USER>/src");
    }

    #[test]
    fn normalizes_line_endings() {
        let n = Normalizer::new();
        assert_eq!(n.normalize("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn normalize_is_idempotent() {
        let n = Normalizer::new();
        let samples = [
            "\x1b[1m$ \x1b[0mgit log deadbeef12 at 2025-01-15 10:30:00",
            "pid: 12345 wrote /tmp/x.y\r\n/home/carol/repo\t\tdone",
            "eyJ 0x7fff5fbff8a0 1700000000123",
            "plain text without noise",
        ];
        for s in samples {
            let once = n.normalize(s);
            assert_eq!(n.normalize(&once), once, "not idempotent for {s:?}");
        }
    }

    #[test]
    fn build_key_joins_normalized_parts() {
        let n = Normalizer::new();
        let key = n.build_key(&["git", "log --oneline", "", "$ "]);
        assert_eq!(key, "git|log --oneline|$");
    }

    #[test]
    fn build_key_skips_empty_parts() {
        let n = Normalizer::new();
        assert_eq!(n.build_key(&["", "a", ""]), "a");
    }

    #[test]
    fn custom_patterns_run_after_defaults() {
        let n = Normalizer::new().with_custom_patterns(&[(r"build-\d+", "<BUILD>")]);
        assert_eq!(n.normalize("job build-42 ok"), "job <BUILD> ok");
    }
}
