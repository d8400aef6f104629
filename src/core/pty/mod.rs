//! Native pseudo-terminal backends.
//!
//! Each backend exposes the same `NativePty` type:
//!
//! - **windows**: ConPTY (`CreatePseudoConsole`) with two anonymous pipe pairs,
//!   a process-thread attribute list and `CreateProcessW`
//! - **unix**: `openpty` master/slave pair, `fork` + `execve`, and a
//!   close-on-exec status pipe so exec failures surface synchronously
//!
//! `NativePty` owns every handle it creates. Dropping it (or calling
//! `release`) frees them in a fixed order:
//!
//! ```text
//! TerminateProcess -> CloseProcessHandles -> ReleaseAttributeList -> CloseConsole -> ClosePipes
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::NativePty;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use self::unix::NativePty;

/// Default terminal width in columns.
pub const DEFAULT_COLS: u16 = 120;

/// Default terminal height in rows.
pub const DEFAULT_ROWS: u16 = 30;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

impl PtySize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Zero-sized dimensions are rejected by both ConPTY and the tty layer.
    pub fn clamped(self) -> Self {
        Self {
            cols: self.cols.max(1),
            rows: self.rows.max(1),
        }
    }
}

impl Default for PtySize {
    fn default() -> Self {
        Self::new(DEFAULT_COLS, DEFAULT_ROWS)
    }
}

impl fmt::Display for PtySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Everything a backend needs to create the child process.
#[derive(Debug, Clone, Copy)]
pub struct SpawnSpec<'a> {
    pub program: &'a Path,
    pub args: &'a [String],
    pub working_directory: Option<&'a Path>,
    pub size: PtySize,
}

/// A native call failed while the terminal and child were being created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed (native code {native_code})")]
pub struct OsResourceError {
    /// Name of the native step, e.g. `CreatePseudoConsole` or `openpty`.
    pub operation: &'static str,
    /// `errno` on Unix, `HRESULT` on Windows.
    pub native_code: i32,
}

impl OsResourceError {
    pub fn new(operation: &'static str, native_code: i32) -> Self {
        Self {
            operation,
            native_code,
        }
    }

    /// Capture the calling thread's last OS error.
    pub fn last(operation: &'static str) -> Self {
        let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(-1);
        Self::new(operation, code)
    }
}

/// Result of one bounded read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were placed at the start of the buffer.
    Data(usize),
    /// Nothing arrived within the wait interval.
    Pending,
    /// The terminal hung up; no more output will arrive.
    Eof,
}

/// One step of the ordered release sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStep {
    TerminateProcess,
    CloseProcessHandles,
    ReleaseAttributeList,
    CloseConsole,
    ClosePipes,
}

impl ReleaseStep {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseStep::TerminateProcess => "terminate-process",
            ReleaseStep::CloseProcessHandles => "close-process-handles",
            ReleaseStep::ReleaseAttributeList => "release-attribute-list",
            ReleaseStep::CloseConsole => "close-console",
            ReleaseStep::ClosePipes => "close-pipes",
        }
    }
}

/// What the host can observe about the terminal handle it reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCapabilities {
    pub character_device: bool,
    /// Human readable description of the handle type.
    pub device_detail: String,
    /// Size reported by a terminal-mode query, or the failure text.
    pub mode_query: Result<PtySize, String>,
}
