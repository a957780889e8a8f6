//! JSONL audit log writer.

use std::{
    fs::{self, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::warn;

use super::{AuditEntry, AuditLogger};
use crate::Result;

/// An append-only JSONL audit log writer.
///
/// Appends one JSON object per line to `<state-dir>/audit.log`. All writers
/// serialise on a single file handle; the file is opened lazily on the
/// first write so constructing the logger never touches disk beyond
/// directory creation.
pub struct JsonlAuditWriter {
    path: PathBuf,
    state: Mutex<Option<BufWriter<fs::File>>>,
}

impl JsonlAuditWriter {
    /// Construct a writer that appends to `audit.log` inside `state_dir`.
    ///
    /// Creates `state_dir` and all parent directories if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Io`] if the directory cannot be created.
    pub fn new(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)?;
        Ok(Self {
            path: state_dir.join("audit.log"),
            state: Mutex::new(None),
        })
    }

    fn open(path: &Path) -> Result<BufWriter<fs::File>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(BufWriter::new(file))
    }
}

impl AuditLogger for JsonlAuditWriter {
    fn log_entry(&self, entry: AuditEntry) -> Result<()> {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if guard.is_none() {
            *guard = Some(Self::open(&self.path)?);
        }

        if let Some(writer) = guard.as_mut() {
            let line = serde_json::to_string(&entry)
                .map_err(|e| crate::AppError::Internal(format!("audit serialize: {e}")))?;
            if let Err(e) = writeln!(writer, "{line}") {
                warn!("failed to write audit log entry: {e}");
                return Err(crate::AppError::Io(format!("audit write failed: {e}")));
            }
            if let Err(e) = writer.flush() {
                warn!("failed to flush audit log: {e}");
                return Err(crate::AppError::Io(format!("audit flush failed: {e}")));
            }
        }

        Ok(())
    }
}
