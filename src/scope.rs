//! A LIFO stack of deferred cleanup actions scoped to one invocation.
//!
//! Temporary directories, temporary files, and arbitrary closers registered
//! here are released in reverse order when the stack is closed. A failing
//! closer never prevents the remaining ones from running; failures are
//! collected and reported together.

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::label::panic_message;

/// Conventional prefix for generated temporary names.
pub const DEFAULT_PREFIX: &str = "tmp";

type Closer = Box<dyn FnOnce() -> Result<()> + Send>;

/// Failures collected while draining the stack.
///
/// Individual closer errors are suppressed during the drain so every
/// registered action gets its chance to run; they surface here afterwards.
#[derive(Debug)]
pub struct CleanupError {
    pub failures: Vec<anyhow::Error>,
}

impl fmt::Display for CleanupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cleanup action(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {failure:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CleanupError {}

/// Contents for [`ScopedResourceStack::write_temp_file`]: either a byte
/// buffer or a callback that writes through the open file handle itself.
pub enum TempContents {
    Bytes(Vec<u8>),
    Writer(Box<dyn FnOnce(&mut File) -> Result<()> + Send>),
}

impl TempContents {
    pub fn writer(f: impl FnOnce(&mut File) -> Result<()> + Send + 'static) -> Self {
        TempContents::Writer(Box::new(f))
    }
}

impl From<Vec<u8>> for TempContents {
    fn from(bytes: Vec<u8>) -> Self {
        TempContents::Bytes(bytes)
    }
}

impl From<&[u8]> for TempContents {
    fn from(bytes: &[u8]) -> Self {
        TempContents::Bytes(bytes.to_vec())
    }
}

impl From<&str> for TempContents {
    fn from(s: &str) -> Self {
        TempContents::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for TempContents {
    fn from(s: String) -> Self {
        TempContents::Bytes(s.into_bytes())
    }
}

/// Single-use cleanup stack. `close` consumes the stack, so nothing can be
/// registered after the scope has exited.
#[derive(Default)]
pub struct ScopedResourceStack {
    closers: Vec<Closer>,
}

impl ScopedResourceStack {
    pub fn new() -> Self {
        ScopedResourceStack::default()
    }

    /// Register a closer to run on scope exit.
    pub fn push<F>(&mut self, closer: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.closers.push(Box::new(closer));
    }

    /// Create a fresh temporary directory and register its recursive removal.
    ///
    /// Returns the directory path; the caller owns the scope, the stack owns
    /// the teardown.
    pub fn enter_temp_dir(
        &mut self,
        loc: Option<&Path>,
        prefix: &str,
        suffix: &str,
    ) -> Result<PathBuf> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix).suffix(suffix);
        let dir = match loc {
            Some(loc) => builder.tempdir_in(loc),
            None => builder.tempdir(),
        }
        .context("create temporary directory")?;
        let path = dir.path().to_path_buf();
        debug!(path = %path.display(), "entered temporary directory");
        self.push(move || {
            let path = dir.path().to_path_buf();
            dir.close()
                .with_context(|| format!("remove temporary directory {}", path.display()))
        });
        Ok(path)
    }

    /// Create a named temporary file holding `contents` and register its
    /// unlink. The file persists past this call (a third party, e.g. the
    /// spawned command, is expected to open it by name).
    pub fn write_temp_file(
        &mut self,
        contents: impl Into<TempContents>,
        dir: Option<&Path>,
        prefix: &str,
        suffix: &str,
    ) -> Result<PathBuf> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix).suffix(suffix);
        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .context("create temporary file")?;

        match contents.into() {
            TempContents::Bytes(bytes) => file
                .as_file_mut()
                .write_all(&bytes)
                .context("write temporary file contents")?,
            TempContents::Writer(write_fn) => {
                write_fn(file.as_file_mut()).context("write temporary file contents")?
            }
        }
        file.as_file_mut()
            .flush()
            .context("flush temporary file")?;

        let (handle, path) = file
            .keep()
            .context("persist temporary file past its handle")?;
        drop(handle);
        self.register_for_removal(&path);
        Ok(path)
    }

    /// Register `path` for unlink on scope exit.
    pub fn register_for_removal(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.push(move || {
            std::fs::remove_file(&path)
                .with_context(|| format!("remove file {}", path.display()))
        });
    }

    /// Generate a file name not currently present in `dir` (current directory
    /// when `None`), probing random candidates until a free one is found.
    /// Returns a bare name for the current directory, a joined path otherwise.
    pub fn random_name(&self, dir: Option<&Path>, prefix: &str, suffix: &str) -> PathBuf {
        let dir = dir.unwrap_or_else(|| Path::new("."));
        loop {
            let candidate = format!("{prefix}{}{suffix}", random_tail());
            if !dir.join(&candidate).exists() {
                return if dir == Path::new(".") {
                    PathBuf::from(candidate)
                } else {
                    dir.join(candidate)
                };
            }
        }
    }

    /// Exit the scope: run every closer in reverse order of registration.
    pub fn close(mut self) -> Result<(), CleanupError> {
        let failures = self.drain();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError { failures })
        }
    }

    fn drain(&mut self) -> Vec<anyhow::Error> {
        let mut failures = Vec::new();
        while let Some(closer) = self.closers.pop() {
            match catch_unwind(AssertUnwindSafe(closer)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e),
                Err(payload) => failures.push(anyhow::anyhow!(
                    "cleanup action panicked: {}",
                    panic_message(payload.as_ref())
                )),
            }
        }
        failures
    }
}

impl Drop for ScopedResourceStack {
    fn drop(&mut self) {
        if self.closers.is_empty() {
            return;
        }
        for failure in self.drain() {
            warn!("cleanup failure during scope teardown: {failure:#}");
        }
    }
}

/// Short random tail for generated names; the trailing characters of a ULID
/// carry its randomness.
fn random_tail() -> String {
    let ulid = Ulid::new().to_string();
    ulid[ulid.len() - 8..].to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn temp_file_exists_inside_scope_and_not_after() {
        let mut stack = ScopedResourceStack::new();
        let path = stack
            .write_temp_file("expected contents", None, DEFAULT_PREFIX, ".txt")
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "expected contents"
        );
        stack.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn temp_file_accepts_writer_callback() {
        let mut stack = ScopedResourceStack::new();
        let path = stack
            .write_temp_file(
                TempContents::writer(|file| {
                    writeln!(file, "written by callback")?;
                    Ok(())
                }),
                None,
                DEFAULT_PREFIX,
                "",
            )
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "written by callback\n"
        );
        stack.close().unwrap();
    }

    #[test]
    fn closers_run_in_reverse_order_even_when_one_fails() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = ScopedResourceStack::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            stack.push(move || {
                order.lock().unwrap().push(i);
                if i == 1 {
                    anyhow::bail!("closer {i} failed");
                }
                Ok(())
            });
        }
        let err = stack.close().unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn panicking_closer_does_not_stop_the_drain() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = ScopedResourceStack::new();
        {
            let order = Arc::clone(&order);
            stack.push(move || {
                order.lock().unwrap().push("first");
                Ok(())
            });
        }
        stack.push(|| panic!("cleanup blew up"));
        let err = stack.close().unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert!(err.failures[0].to_string().contains("cleanup blew up"));
        assert_eq!(*order.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn temp_dir_removed_on_close() {
        let mut stack = ScopedResourceStack::new();
        let dir = stack.enter_temp_dir(None, DEFAULT_PREFIX, "").unwrap();
        assert!(dir.is_dir());
        std::fs::write(dir.join("scratch.txt"), b"scratch").unwrap();
        stack.close().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn registered_path_is_unlinked() {
        let holder = tempfile::tempdir().unwrap();
        let path = holder.path().join("leftover");
        std::fs::write(&path, b"leftover").unwrap();
        let mut stack = ScopedResourceStack::new();
        stack.register_for_removal(&path);
        stack.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn random_name_is_free_and_respects_fixes() {
        let holder = tempfile::tempdir().unwrap();
        let stack = ScopedResourceStack::new();
        let name = stack.random_name(Some(holder.path()), "pre_", ".post");
        assert!(!name.exists());
        let file_name = name.file_name().unwrap().to_str().unwrap();
        assert!(file_name.starts_with("pre_"));
        assert!(file_name.ends_with(".post"));
        assert!(name.starts_with(holder.path()));

        // Current directory yields a bare name.
        let bare = stack.random_name(None, DEFAULT_PREFIX, "");
        assert_eq!(bare.components().count(), 1);
    }
}
