//! Pseudo console session
//!
//! Owns the native terminal, pipes and child process for one execution and
//! moves through `NotStarted -> Running -> Exited`, each transition once.
//! Output is exposed as a lazy byte-chunk stream whose blocking reads run on
//! the blocking pool and never wait longer than the configured read interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pty::{NativeCapabilities, NativePty, PtySize, ReadOutcome, ReleaseStep, SpawnSpec};
use crate::config::TimingConfig;
use crate::error::{Result, SessionError};
use crate::request::ExecutionRequest;

/// Size of the buffer handed to each native read.
const READ_CHUNK: usize = 8192;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Running { pid: u32 },
    Exited { exit_code: i32 },
}

/// Polling intervals used by the session.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    pub read_wait: Duration,
    pub exit_poll: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for SessionTiming {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            read_wait: timing.read_wait(),
            exit_poll: timing.exit_poll(),
        }
    }
}

/// Stream of raw output chunks from the child
pub type OutputStream = BoxStream<'static, Result<Bytes>>;

type SharedPty = Arc<RwLock<Option<NativePty>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A child process attached to a pseudo console
pub struct PseudoConsoleSession {
    timing: SessionTiming,
    /// Readers hold the lock only for one bounded read; teardown takes it
    /// exclusively so no handle is closed under an in-flight read.
    native: SharedPty,
    state: Mutex<SessionState>,
    output_taken: AtomicBool,
    torn_down: AtomicBool,
    released: Mutex<Vec<ReleaseStep>>,
}

impl Default for PseudoConsoleSession {
    fn default() -> Self {
        Self::new(SessionTiming::default())
    }
}

impl PseudoConsoleSession {
    pub fn new(timing: SessionTiming) -> Self {
        Self {
            timing,
            native: Arc::new(RwLock::new(None)),
            state: Mutex::new(SessionState::NotStarted),
            output_taken: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            released: Mutex::new(Vec::new()),
        }
    }

    /// Allocate the pseudo console and start the child attached to it.
    ///
    /// On failure every native resource acquired so far has already been
    /// released and the session stays `NotStarted`.
    pub fn start(&self, request: &ExecutionRequest) -> Result<()> {
        let mut state = lock(&self.state);
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(SessionError::TornDown);
        }
        if *state != SessionState::NotStarted {
            return Err(SessionError::AlreadyStarted);
        }

        let spec = SpawnSpec {
            program: &request.executable,
            args: &request.arguments,
            working_directory: request.working_directory.as_deref(),
            size: request.size,
        };
        let pty = NativePty::spawn(&spec).map_err(|e| {
            warn!("Failed to start {}: {}", request.executable.display(), e);
            e
        })?;

        let pid = pty.pid();
        *self.native.write().unwrap_or_else(PoisonError::into_inner) = Some(pty);
        *state = SessionState::Running { pid };
        info!(pid, size = %request.size, "Session started: {}", request.command_line());
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn pid(&self) -> Option<u32> {
        match self.state() {
            SessionState::Running { pid } => Some(pid),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.state() {
            SessionState::Exited { exit_code } => Some(exit_code),
            _ => None,
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Release steps performed by `teardown`, in order.
    pub fn released_steps(&self) -> Vec<ReleaseStep> {
        lock(&self.released).clone()
    }

    /// Take the output stream. Single pass; a second call fails.
    ///
    /// The stream ends at end-of-file, when `cancel` fires (checked between
    /// bounded reads), or after the first read error.
    pub fn read_output(&self, cancel: CancellationToken) -> Result<OutputStream> {
        if self.output_taken.swap(true, Ordering::SeqCst) {
            return Err(SessionError::OutputTaken);
        }
        let reader = OutputReader {
            native: self.native.clone(),
            cancel,
            wait: self.timing.read_wait,
            buffer: vec![0u8; READ_CHUNK],
            done: false,
        };
        Ok(stream::unfold(reader, |mut reader| async move {
            reader.next_chunk().await.map(|item| (item, reader))
        })
        .boxed())
    }

    /// Write bytes to the child's terminal input.
    pub fn write_input(&self, data: &[u8]) -> Result<usize> {
        let guard = self.native.read().unwrap_or_else(PoisonError::into_inner);
        let pty = guard.as_ref().ok_or(SessionError::NotStarted)?;
        pty.write(data).map_err(SessionError::Write)
    }

    /// Wait for the child to exit, polling every `exit_poll`.
    ///
    /// Returns `None` if `cancel` fires first.
    pub async fn wait_for_exit(&self, cancel: &CancellationToken) -> Result<Option<i32>> {
        let mut ticker = tokio::time::interval(self.timing.exit_poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = ticker.tick() => {}
            }
            if let Some(code) = self.poll_exit()? {
                return Ok(Some(code));
            }
        }
    }

    /// Non-blocking exit check.
    pub fn poll_exit(&self) -> Result<Option<i32>> {
        match self.state() {
            SessionState::NotStarted => return Err(SessionError::NotStarted),
            SessionState::Exited { exit_code } => return Ok(Some(exit_code)),
            SessionState::Running { .. } => {}
        }

        // Teardown holds the write lock only briefly; skip this tick rather
        // than block the async caller behind it.
        let code = match self.native.try_read() {
            Ok(guard) => match guard.as_ref() {
                Some(pty) => pty.try_wait().map_err(SessionError::Wait)?,
                None => None,
            },
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(guard)) => match guard.into_inner().as_ref() {
                Some(pty) => pty.try_wait().map_err(SessionError::Wait)?,
                None => None,
            },
        };
        Ok(code.map(|code| self.mark_exited(code)))
    }

    fn mark_exited(&self, code: i32) -> i32 {
        let mut state = lock(&self.state);
        match *state {
            SessionState::Exited { exit_code } => exit_code,
            SessionState::Running { pid } => {
                info!(pid, exit_code = code, "Session exited");
                *state = SessionState::Exited { exit_code: code };
                code
            }
            SessionState::NotStarted => code,
        }
    }

    /// Forcibly terminate the child. No-op unless the session is running.
    pub fn kill(&self) {
        let pid = match self.state() {
            SessionState::Running { pid } => pid,
            _ => return,
        };
        let guard = self.native.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(pty) = guard.as_ref() {
            match pty.terminate() {
                Ok(()) => info!(pid, "Session killed"),
                Err(e) => warn!(pid, "Failed to kill session: {}", e),
            }
        }
    }

    /// Resize the pseudo console. No-op when no console is allocated.
    pub fn resize(&self, size: PtySize) -> Result<()> {
        let guard = self.native.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(pty) = guard.as_ref() {
            pty.resize(size).map_err(SessionError::Resize)?;
            debug!(%size, "Session resized");
        }
        Ok(())
    }

    /// Native capability report for the TTY probe.
    pub fn capabilities(&self) -> Option<NativeCapabilities> {
        let guard = self.native.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(NativePty::capabilities)
    }

    /// Release every native resource in the fixed order. Idempotent.
    ///
    /// Blocks for at most one read interval while an in-flight read finishes.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.kill();

        let taken = self
            .native
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut pty) = taken else {
            debug!("Teardown: nothing to release");
            return;
        };

        let mut steps = Vec::new();
        pty.release(&mut |step| {
            debug!(step = step.as_str(), "Released");
            steps.push(step);
        });
        let final_code = pty.final_exit_code();
        drop(pty);

        if let Some(code) = final_code {
            self.mark_exited(code);
        } else if matches!(self.state(), SessionState::Running { .. }) {
            self.mark_exited(-1);
        }
        lock(&self.released).extend(steps);
        info!("Session torn down");
    }
}

impl Drop for PseudoConsoleSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

struct OutputReader {
    native: SharedPty,
    cancel: CancellationToken,
    wait: Duration,
    buffer: Vec<u8>,
    done: bool,
}

impl OutputReader {
    async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        while !self.done {
            if self.cancel.is_cancelled() {
                debug!("Output stream cancelled");
                self.done = true;
                break;
            }

            let native = self.native.clone();
            let wait = self.wait;
            let mut buffer = std::mem::take(&mut self.buffer);
            let joined = tokio::task::spawn_blocking(move || {
                let guard = native.read().unwrap_or_else(PoisonError::into_inner);
                let outcome = match guard.as_ref() {
                    None => Ok(ReadOutcome::Eof),
                    Some(pty) => match pty.read(&mut buffer, wait) {
                        // A read that fails after the child exited is just the end.
                        Err(e) if matches!(pty.try_wait(), Ok(Some(_))) => {
                            debug!("Read failed after exit, treating as EOF: {}", e);
                            Ok(ReadOutcome::Eof)
                        }
                        other => other,
                    },
                };
                (buffer, outcome)
            })
            .await;

            let (buffer, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    self.done = true;
                    return Some(Err(SessionError::Join(e)));
                }
            };
            self.buffer = buffer;

            match outcome {
                Ok(ReadOutcome::Data(n)) => {
                    return Some(Ok(Bytes::copy_from_slice(&self.buffer[..n])));
                }
                Ok(ReadOutcome::Pending) => continue,
                Ok(ReadOutcome::Eof) => {
                    debug!("Output reached end of file");
                    self.done = true;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(SessionError::Read(e)));
                }
            }
        }
        None
    }
}
