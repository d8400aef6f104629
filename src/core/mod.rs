//! Core pseudo console components.
//!
//! - **pty**: native pseudo terminal backends (ConPTY on Windows, openpty on Unix)
//! - **session**: one child process attached to a pseudo console, with its
//!   lifecycle, output stream and ordered teardown
//!
//! # Architecture
//!
//! ```text
//! PseudoConsoleSession
//! ├── NativePty (console + pipes + child process)
//! └── SessionState (NotStarted -> Running -> Exited)
//! ```

pub mod pty;
pub mod session;
