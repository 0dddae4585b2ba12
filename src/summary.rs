//! Tape usage summary printed at session teardown.

use std::io;

use crate::store::TapeStore;

/// Write the summary block naming tapes created this run and tapes that
/// were loaded but never consulted.
pub fn write_summary<W: io::Write>(store: &TapeStore, out: &mut W) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "===== SUMMARY (claudecontrol) =====")?;

    let new = store.new_tapes();
    if !new.is_empty() {
        writeln!(out, "New tapes:")?;
        for path in &new {
            writeln!(out, "- {}", file_name(path))?;
        }
    }

    let unused = store.unused_tapes();
    if !unused.is_empty() {
        writeln!(out, "Unused tapes:")?;
        for path in &unused {
            writeln!(out, "- {}", file_name(path))?;
        }
    }

    if new.is_empty() && unused.is_empty() {
        writeln!(out, "No tape activity in this session")?;
    }

    writeln!(out, "{}", "=".repeat(35))?;
    Ok(())
}

/// Print the summary to stdout.
pub fn print_summary(store: &TapeStore) {
    let mut stdout = io::stdout();
    if let Err(err) = write_summary(store, &mut stdout) {
        tracing::warn!(error = %err, "failed to print tape summary");
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
