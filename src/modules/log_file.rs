//! Append-only log files shared by the access and dump logs.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;

use crate::conf::Command;
use crate::error::{Error, Result};

/// A log file opened in append mode, created with its parent directories.
///
/// Uses `std::fs::File` behind a `std::sync::Mutex`: writes are small and
/// are flushed line by line.
pub struct LogFile {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl LogFile {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `line` plus a newline. Errors are logged but never propagated.
    pub fn write_line(&self, line: &str) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(writer, "{}", line) {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to write log line");
            return;
        }
        if let Err(e) = writer.flush() {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to flush log file");
        }
    }

    /// Append `entry` as one JSON line.
    pub fn write_json<T: Serialize>(&self, entry: &T) {
        match serde_json::to_string(entry) {
            Ok(json) => self.write_line(&json),
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to serialize log entry")
            }
        }
    }
}

impl std::fmt::Debug for LogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile").field("path", &self.path).finish()
    }
}

/// The `<file> | off` setting of a logging directive.
///
/// Copies made for conditional scopes keep writing to the same open file
/// until they are pointed elsewhere.
#[derive(Debug, Default)]
pub struct LogTarget {
    file: RwLock<Option<Arc<LogFile>>>,
}

impl LogTarget {
    pub fn current(&self) -> Option<Arc<LogFile>> {
        self.file.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn copy(&self) -> Self {
        Self {
            file: RwLock::new(self.current()),
        }
    }

    /// Apply `directive <file> | off;`. `kind` names the log in errors.
    pub fn configure(&self, command: &Command, kind: &str) -> Result<()> {
        let arg = command
            .single_arg()
            .ok_or_else(|| Error::args_number(command))?;
        let file = match arg {
            "off" => None,
            path => {
                let file = LogFile::open(path).map_err(|e| {
                    Error::directive(command, format!("can't open {} file: '{}': {}", kind, path, e))
                })?;
                Some(Arc::new(file))
            }
        };
        *self.file.write().unwrap_or_else(PoisonError::into_inner) = file;
        Ok(())
    }
}

/// Current time in RFC 3339, UTC.
pub fn now_rfc3339() -> String {
    let now = time::OffsetDateTime::now_utc();
    now.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use prifma_test_support::test_report;

    #[test]
    fn test_open_creates_parents_and_appends() {
        let t = test_report!("Log files are created with parents and appended to");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/access.log");

        LogFile::open(&path).unwrap().write_line("first");
        let log = LogFile::open(&path).unwrap();
        log.write_json(&serde_json::json!({"n": 2}));

        let content = std::fs::read_to_string(&path).unwrap();
        t.assert_eq("content", &content, &"first\n{\"n\":2}\n".to_string());
    }

    #[test]
    fn test_now_rfc3339() {
        let t = test_report!("Timestamps are RFC 3339 in UTC");
        let ts = now_rfc3339();
        t.assert_true("parses", time::OffsetDateTime::parse(&ts, &time::format_description::well_known::Rfc3339).is_ok());
    }
}
