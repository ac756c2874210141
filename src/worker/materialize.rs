//! Makes resolved entries loadable from disk.
//!
//! The engine's module loader works on file locations, so inline sources
//! are written to a scratch file that lives as long as the worker does.

use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

use super::error::{WorkerError, WorkerResult};
use super::reference::{EntryDescriptor, EntrySource, ScriptKind};

/// A file-backed worker entry.
///
/// Scratch files created for inline sources are removed on drop.
#[derive(Debug)]
pub struct MaterializedEntry {
    path: PathBuf,
    kind: ScriptKind,
    ephemeral: bool,
}

impl MaterializedEntry {
    pub fn materialize(entry: EntryDescriptor) -> WorkerResult<Self> {
        match entry.source {
            EntrySource::File(path) => Ok(Self {
                path,
                kind: entry.kind,
                ephemeral: false,
            }),
            EntrySource::Inline(source) => {
                let dir = scratch_dir();
                fs::create_dir_all(&dir).map_err(WorkerError::Materialize)?;

                let path = dir.join(format!(
                    "data-{}.{}",
                    uuid::Uuid::new_v4(),
                    entry.kind.extension()
                ));
                fs::write(&path, source).map_err(WorkerError::Materialize)?;
                debug!("materialized inline worker entry at {}", path.display());

                Ok(Self {
                    path,
                    kind: entry.kind,
                    ephemeral: true,
                })
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }
}

impl Drop for MaterializedEntry {
    fn drop(&mut self) {
        if !self.ephemeral {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("removed worker entry {}", self.path.display()),
            Err(e) => warn!("could not remove worker entry {}: {}", self.path.display(), e),
        }
    }
}

/// Per-process directory for materialized entries
pub fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("webworker-{}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_entries_pass_through() {
        let entry = EntryDescriptor {
            source: EntrySource::File(PathBuf::from("/nonexistent/worker.js")),
            kind: ScriptKind::Classic,
        };
        let materialized = MaterializedEntry::materialize(entry).unwrap();
        assert_eq!(materialized.path(), Path::new("/nonexistent/worker.js"));
        assert!(!materialized.is_ephemeral());
    }

    #[test]
    fn test_inline_source_is_written_and_removed() {
        let entry = EntryDescriptor {
            source: EntrySource::Inline("postMessage(42);".to_string()),
            kind: ScriptKind::Module,
        };
        let materialized = MaterializedEntry::materialize(entry).unwrap();
        let path = materialized.path().to_path_buf();

        assert!(materialized.is_ephemeral());
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("mjs"));
        assert!(path.starts_with(scratch_dir()));
        assert_eq!(fs::read_to_string(&path).unwrap(), "postMessage(42);");

        drop(materialized);
        assert!(!path.exists());
    }

    #[test]
    fn test_names_are_unique() {
        let make = || {
            MaterializedEntry::materialize(EntryDescriptor {
                source: EntrySource::Inline(String::new()),
                kind: ScriptKind::Classic,
            })
            .unwrap()
        };
        let (a, b) = (make(), make());
        assert_ne!(a.path(), b.path());
        assert_eq!(a.path().extension().and_then(|e| e.to_str()), Some("cjs"));
    }
}
