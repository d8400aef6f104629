//! Execution streaming.
//!
//! - **event**: stream events, control messages and their NDJSON shape
//! - **controller**: runs one execution and emits its ordered event stream
//! - **probe**: TTY probe command and host capability report

pub mod controller;
pub mod event;
pub mod probe;

pub use controller::{ControlSource, ControllerPhase, EventSink, ExecutionOutcome, ExecutionStreamController};
pub use event::{ControlMessage, StreamEvent, WireEvent};
