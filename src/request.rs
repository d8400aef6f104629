//! Execution requests and command resolution
//!
//! A `CommandResolver` turns whatever the caller asked for into an
//! `ExecutionRequest` with an absolute executable path. Argument validation
//! belongs to the resolver; the session runs exactly what it is given.

use std::path::{Path, PathBuf};

use crate::core::pty::PtySize;
use crate::error::ExecutionError;

/// A fully resolved invocation ready to run under a pseudo console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Absolute path to the executable
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub size: PtySize,
}

impl ExecutionRequest {
    pub fn new<P: Into<PathBuf>>(executable: P, arguments: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            arguments,
            working_directory: None,
            size: PtySize::default(),
        }
    }

    pub fn with_working_directory<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_size(mut self, size: PtySize) -> Self {
        self.size = size;
        self
    }

    /// The literal invocation, for display in the `started` event.
    pub fn command_line(&self) -> String {
        command_line(&self.executable, &self.arguments)
    }
}

/// Join program and arguments with Windows command-line quoting.
///
/// ConPTY hands this exact string to `CreateProcessW`; on Unix it is only
/// shown to the user. Backslashes are doubled only when they precede a quote.
pub fn command_line(program: &Path, args: &[String]) -> String {
    let mut line = String::new();
    quote_into(&mut line, &program.to_string_lossy());
    for arg in args {
        line.push(' ');
        quote_into(&mut line, arg);
    }
    line
}

fn quote_into(out: &mut String, arg: &str) {
    let needs_quotes = arg.is_empty() || arg.contains([' ', '\t', '\n', '\u{b}', '"']);
    if !needs_quotes {
        out.push_str(arg);
        return;
    }

    out.push('"');
    let mut backslashes = 0;
    for ch in arg.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                out.push(ch);
                backslashes = 0;
            }
        }
    }
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out.push('"');
}

/// Produces the request for one execution, or the domain error that stops it.
pub trait CommandResolver {
    fn resolve(&self) -> Result<ExecutionRequest, ExecutionError>;
}

impl CommandResolver for ExecutionRequest {
    fn resolve(&self) -> Result<ExecutionRequest, ExecutionError> {
        Ok(self.clone())
    }
}

/// Resolves a program name against `PATH` and checks the working directory.
#[derive(Debug, Clone)]
pub struct PathResolver {
    pub program: String,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub size: PtySize,
}

impl PathResolver {
    pub fn new<S: Into<String>>(program: S, arguments: Vec<String>) -> Self {
        Self {
            program: program.into(),
            arguments,
            working_directory: None,
            size: PtySize::default(),
        }
    }
}

impl CommandResolver for PathResolver {
    fn resolve(&self) -> Result<ExecutionRequest, ExecutionError> {
        if self.program.trim().is_empty() {
            return Err(ExecutionError::validation("No program given"));
        }

        if let Some(dir) = &self.working_directory {
            if !dir.is_dir() {
                return Err(ExecutionError::DomainValidation {
                    message: format!("Working directory does not exist: {}", dir.display()),
                    hint: Some("Pass an existing directory with --cwd".to_string()),
                });
            }
        }

        let executable = which::which(&self.program).map_err(|_| {
            ExecutionError::dependency_missing(
                format!("Executable not found: {}", self.program),
                format!(
                    "Install `{}` or add its directory to PATH",
                    self.program
                ),
            )
        })?;
        let executable = if executable.is_absolute() {
            executable
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&executable))
                .unwrap_or(executable)
        };

        Ok(ExecutionRequest {
            executable,
            arguments: self.arguments.clone(),
            working_directory: self.working_directory.clone(),
            size: self.size,
        })
    }
}
