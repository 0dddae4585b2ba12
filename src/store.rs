//! Tape discovery, loading, atomic persistence, and session bookkeeping.
//!
//! Tapes are loaded once at transport construction and are read-mostly
//! afterwards: the loaded set is handed out as a cheap snapshot, while the
//! used/new sets and the exchange index sit behind a single mutex whose
//! critical sections stay O(1).

use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::error::ReplayError;
use crate::model::{Exchange, Tape, TapeMeta};
use crate::normalize::Normalizer;
use crate::redact::SecretRedactor;

/// File extensions recognized as tapes during discovery.
const TAPE_EXTENSIONS: &[&str] = &["tape", "json5"];

/// A tape together with the file it was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedTape {
    pub tape: Tape,
    pub path: PathBuf,
}

struct StoreState {
    tapes: Arc<Vec<LoadedTape>>,
    /// Normalized exchange key -> (tape index, exchange index); last
    /// writer wins on collision.
    index: HashMap<String, (usize, usize)>,
    used: HashSet<PathBuf>,
    new: HashSet<PathBuf>,
}

/// Thread-safe tape storage rooted at one directory.
pub struct TapeStore {
    root: PathBuf,
    normalizer: Normalizer,
    state: Mutex<StoreState>,
}

impl TapeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            normalizer: Normalizer::new(),
            state: Mutex::new(StoreState {
                tapes: Arc::new(Vec::new()),
                index: HashMap::new(),
                used: HashSet::new(),
                new: HashSet::new(),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load every tape under the root, recursively. Files that fail to
    /// parse are skipped with a warning; a missing root is an empty store.
    pub fn load_all(&self) {
        let mut tapes = Vec::new();
        for path in self.discover() {
            match self.load_tape(&path) {
                Ok(tape) => tapes.push(LoadedTape { tape, path }),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable tape");
                }
            }
        }
        self.install(tapes);
    }

    /// Like [`TapeStore::load_all`], but the first unreadable tape aborts
    /// the load.
    pub fn load_all_strict(&self) -> Result<(), ReplayError> {
        let mut tapes = Vec::new();
        for path in self.discover() {
            let tape = self.load_tape(&path)?;
            tapes.push(LoadedTape { tape, path });
        }
        self.install(tapes);
        Ok(())
    }

    /// Parse a single tape file.
    pub fn load_tape(&self, path: &Path) -> Result<Tape, ReplayError> {
        let text = std::fs::read_to_string(path)?;
        json5::from_str(&text).map_err(|e| ReplayError::Schema {
            message: e.to_string(),
            path: path.to_path_buf(),
        })
    }

    /// Persist a tape atomically: redact, write a sibling temp file, then
    /// rename into place. Nothing is left behind on failure.
    pub fn save_tape(
        &self,
        tape: &Tape,
        path: &Path,
        redactor: Option<&SecretRedactor>,
    ) -> Result<PathBuf, ReplayError> {
        let mut tape = tape.clone();
        if let Some(redactor) = redactor {
            redactor.redact_tape(&mut tape);
        }
        let text = tape.to_json5()?;

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(text.as_bytes())?;
        tmp.write_all(b"\n")?;
        // On rename failure the temp file is cleaned up when `tmp` drops.
        tmp.persist(path).map_err(|e| ReplayError::Io(e.error))?;

        self.state.lock().new.insert(path.to_path_buf());
        Ok(path.to_path_buf())
    }

    /// Snapshot of the loaded tapes, in load order.
    pub fn tapes(&self) -> Arc<Vec<LoadedTape>> {
        self.state.lock().tapes.clone()
    }

    pub fn tape_count(&self) -> usize {
        self.state.lock().tapes.len()
    }

    /// O(1) index probe: normalized `program | args | prompt | input` key
    /// to the recorded exchange. A hit marks the tape used.
    pub fn find_exchange(
        &self,
        program: &str,
        args: &[String],
        prompt: &str,
        input: &str,
    ) -> Option<(Exchange, PathBuf)> {
        let key = self.exchange_key(program, args, prompt, input);
        let (tapes, hit) = {
            let state = self.state.lock();
            (state.tapes.clone(), state.index.get(&key).copied())
        };
        let (tape_ix, exch_ix) = hit?;
        let loaded = tapes.get(tape_ix)?;
        let exchange = loaded.tape.exchanges.get(exch_ix)?.clone();
        self.mark_used(&loaded.path);
        Some((exchange, loaded.path.clone()))
    }

    /// Path of a loaded tape whose identity key matches `meta`, for
    /// OVERWRITE record mode.
    pub fn overwrite_target(&self, meta: &TapeMeta) -> Option<PathBuf> {
        let key = self.tape_key(&meta.program, &meta.args);
        self.tapes()
            .iter()
            .find(|loaded| self.tape_key(&loaded.tape.meta.program, &loaded.tape.meta.args) == key)
            .map(|loaded| loaded.path.clone())
    }

    /// Whether a loaded tape already answers for this invocation.
    pub fn has_tape_matching(&self, meta: &TapeMeta) -> bool {
        self.overwrite_target(meta).is_some()
    }

    pub fn mark_used(&self, path: &Path) {
        self.state.lock().used.insert(path.to_path_buf());
    }

    /// Tapes loaded this session but never consulted.
    pub fn unused_tapes(&self) -> Vec<PathBuf> {
        let state = self.state.lock();
        let mut unused: Vec<PathBuf> = state
            .tapes
            .iter()
            .map(|loaded| loaded.path.clone())
            .filter(|path| !state.used.contains(path))
            .collect();
        unused.sort();
        unused
    }

    /// Tapes created during this session.
    pub fn new_tapes(&self) -> Vec<PathBuf> {
        let mut new: Vec<PathBuf> = self.state.lock().new.iter().cloned().collect();
        new.sort();
        new
    }

    /// The normalized key identifying one exchange.
    pub fn exchange_key(&self, program: &str, args: &[String], prompt: &str, input: &str) -> String {
        self.normalizer
            .build_key(&[program, &args.join(" "), prompt, input])
    }

    fn tape_key(&self, program: &str, args: &[String]) -> String {
        self.normalizer.build_key(&[program, &args.join(" ")])
    }

    fn discover(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if self.root.exists() {
            collect_tape_files(&self.root, &mut files);
        }
        files.sort();
        files
    }

    fn install(&self, tapes: Vec<LoadedTape>) {
        let mut index = HashMap::new();
        for (tape_ix, loaded) in tapes.iter().enumerate() {
            for (exch_ix, exchange) in loaded.tape.exchanges.iter().enumerate() {
                let input = exchange.input.data_text.clone().unwrap_or_default();
                let key = self.exchange_key(
                    &loaded.tape.meta.program,
                    &loaded.tape.meta.args,
                    &exchange.pre.prompt,
                    &input,
                );
                index.insert(key, (tape_ix, exch_ix));
            }
        }
        let mut state = self.state.lock();
        state.tapes = Arc::new(tapes);
        state.index = index;
    }
}

fn collect_tape_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(dir = %dir.display(), error = %err, "cannot read tape directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_tape_files(&path, out);
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| TAPE_EXTENSIONS.contains(&e))
            .unwrap_or(false)
        {
            out.push(path);
        }
    }
}
