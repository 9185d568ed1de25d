//! OS-specific per-user application-state paths, grounded
//! on the `dirs` crate already present in the ambient dependency stack.

use std::io::Write;
use std::path::{Path, PathBuf};

/// Resolves the base directory status files and rotated logs live under,
/// honoring `global.default_data_dir` when the config supplies one.
#[must_use]
pub fn app_state_dir(override_dir: Option<&str>) -> PathBuf {
    if let Some(dir) = override_dir {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|d| d.join("labstation"))
        .unwrap_or_else(|| PathBuf::from(".labstation"))
}

#[must_use]
pub fn log_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("log")
}

/// Writes `contents` to `path` atomically: a sibling temp file is written
/// and fsynced, then renamed over the destination.
///
/// # Errors
/// Propagates any filesystem error from the temp-file write or rename.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Prunes rotated log files beyond the `keep` most recent sessions.
/// `tracing-appender`'s rolling appender does not cap file *count* on its
/// own, so the sweep runs once at startup.
///
/// # Errors
/// Propagates filesystem errors encountered while listing or removing
/// files; a missing `dir` is not an error (nothing to prune yet).
pub fn prune_rotated_logs(dir: &Path, prefix: &str, keep: usize) -> std::io::Result<()> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(());
    };
    let mut files: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        files.push((modified, path));
    }
    files.sort_by_key(|(t, _)| std::cmp::Reverse(*t));
    for (_, path) in files.into_iter().skip(keep) {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("x.status.yml");
        atomic_write(&path, b"count: 7\n").expect("write");
        let text = std::fs::read_to_string(&path).expect("read");
        assert_eq!(text, "count: 7\n");
    }

    #[test]
    fn prune_keeps_only_most_recent() {
        let dir = tempfile::tempdir().expect("tempdir");
        for i in 0..8 {
            let p = dir.path().join(format!("session.{i}.log"));
            std::fs::write(&p, b"x").expect("write");
        }
        prune_rotated_logs(dir.path(), "session.", 5).expect("prune");
        let remaining = std::fs::read_dir(dir.path()).expect("read_dir").count();
        assert_eq!(remaining, 5);
    }
}
