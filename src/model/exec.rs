//! Exec session bookkeeping.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::container::generate_id;

/// A created (and possibly finished) exec invocation.
#[derive(Debug)]
pub struct ExecSession {
    /// Opaque 64-hex id.
    pub id: String,
    /// Container the command runs in.
    pub container_id: String,
    /// Command and arguments.
    pub cmd: Vec<String>,
    /// Whether the client asked for stdout.
    pub stdout: bool,
    /// Whether the client asked for stderr.
    pub stderr: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    exit_code: RwLock<Option<i32>>,
}

impl ExecSession {
    /// Creates a new session with a fresh id.
    #[must_use]
    pub fn new(container_id: impl Into<String>, cmd: Vec<String>, stdout: bool, stderr: bool) -> Self {
        Self {
            id: generate_id(),
            container_id: container_id.into(),
            cmd,
            stdout,
            stderr,
            created_at: Utc::now(),
            exit_code: RwLock::new(None),
        }
    }

    /// Records the exit code after the command finished.
    pub fn set_exit_code(&self, code: i32) {
        *self.exit_code.write() = Some(code);
    }

    /// Exit code, or `None` while the command has not run yet.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.read()
    }
}
