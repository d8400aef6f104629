//! ptyhost - run a process under a pseudo terminal and stream its I/O
//!
//! ptyhost allocates a native pseudo console (ConPTY on Windows, a pty pair
//! on Unix), attaches a child process to it, and relays the child's terminal
//! output to a remote caller as an ordered stream of events while listening
//! for a cancel request.
//!
//! # Event stream
//!
//! ```text
//! started  {operationId, commandLine}
//! output*  {data}
//! exited   {exitCode, duration}      or   error {code, message, remediationHint}
//! ```
//!
//! # Modules
//!
//! - **core**: native pseudo console backends and the session state machine
//! - **stream**: the execution controller, stream events and the TTY probe
//! - **transport**: NDJSON and channel adapters for events and control messages
//! - **request**: execution requests and command resolution
//! - **config**: `~/.ptyhost/config.toml`

pub mod config;
pub mod core;
pub mod error;
pub mod request;
pub mod stream;
pub mod transport;

pub use crate::config::Config;
pub use crate::core::pty::PtySize;
pub use crate::core::session::{PseudoConsoleSession, SessionState};
pub use crate::error::{ExecutionError, SessionError, TransportError};
pub use crate::request::{CommandResolver, ExecutionRequest, PathResolver};
pub use crate::stream::{ExecutionOutcome, ExecutionStreamController, StreamEvent};
