//! Execution stream controller
//!
//! Drives one `PseudoConsoleSession` from start to teardown and turns it into
//! an ordered event stream:
//!
//! ```text
//! Started, Output*, (Exited | Error)
//! ```
//!
//! The output pump, exit watcher and cancellation monitor run as branches of
//! a single `select!` loop, so every event is emitted from one place and the
//! ordering guarantees hold by construction.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::event::{ControlMessage, StreamEvent};
use super::probe;
use crate::config::TimingConfig;
use crate::core::pty::PtySize;
use crate::core::session::{PseudoConsoleSession, SessionTiming};
use crate::error::{ExecutionError, SessionError, TransportError};
use crate::request::{CommandResolver, ExecutionRequest};

/// Destination for stream events (e.g. one side of a WebSocket).
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, event: StreamEvent) -> Result<(), TransportError>;
}

/// Source of inbound control messages.
///
/// `next_message` is raced against other work and may be dropped before it
/// completes; implementations must not lose a message when that happens.
/// Malformed input should be skipped, not returned. An error means the
/// transport is gone and is treated as a cancel.
#[async_trait]
pub trait ControlSource: Send {
    async fn next_message(&mut self) -> Result<ControlMessage, TransportError>;
}

/// Controller lifecycle; `Exited` and `Error` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    Idle,
    Started,
    Streaming,
    Exited,
    Error,
}

impl ControllerPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, ControllerPhase::Exited | ControllerPhase::Error)
    }
}

/// How an execution ended, for the caller's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Exited { exit_code: i32, duration: Duration },
    Failed { code: &'static str, message: String },
    Cancelled,
}

impl ExecutionOutcome {
    fn failed(err: &ExecutionError) -> Self {
        ExecutionOutcome::Failed {
            code: err.code(),
            message: err.to_string(),
        }
    }

    /// Exit status a CLI wrapper should report.
    pub fn exit_status(&self) -> i32 {
        match self {
            ExecutionOutcome::Exited { exit_code, .. } => *exit_code,
            ExecutionOutcome::Failed { .. } => 1,
            ExecutionOutcome::Cancelled => 130,
        }
    }
}

/// Enforces the phase machine in front of the sink: nothing before
/// `Started` except an error, nothing after a terminal event.
struct EventGate<'a, S: ?Sized> {
    sink: &'a mut S,
    phase: ControllerPhase,
}

impl<'a, S: EventSink + ?Sized> EventGate<'a, S> {
    fn new(sink: &'a mut S) -> Self {
        Self {
            sink,
            phase: ControllerPhase::Idle,
        }
    }

    async fn started(&mut self, operation_id: String, command_line: String) -> Result<(), TransportError> {
        if self.phase != ControllerPhase::Idle {
            warn!(phase = ?self.phase, "Dropping duplicate started event");
            return Ok(());
        }
        self.phase = ControllerPhase::Started;
        self.sink
            .send(StreamEvent::Started {
                operation_id,
                command_line,
            })
            .await
    }

    async fn output(&mut self, bytes: Bytes) -> Result<(), TransportError> {
        match self.phase {
            ControllerPhase::Started | ControllerPhase::Streaming => {
                self.phase = ControllerPhase::Streaming;
                self.sink.send(StreamEvent::Output { bytes }).await
            }
            phase => {
                debug!(?phase, "Dropping output outside the streaming window");
                Ok(())
            }
        }
    }

    async fn exited(&mut self, exit_code: i32, duration: Duration) {
        if self.phase.is_terminal() || self.phase == ControllerPhase::Idle {
            warn!(phase = ?self.phase, "Dropping exited event");
            return;
        }
        self.phase = ControllerPhase::Exited;
        if let Err(e) = self
            .sink
            .send(StreamEvent::Exited {
                exit_code,
                duration,
            })
            .await
        {
            warn!("Failed to deliver exited event: {}", e);
        }
    }

    async fn error(&mut self, err: &ExecutionError) {
        if self.phase.is_terminal() {
            warn!(phase = ?self.phase, "Dropping error event: {}", err);
            return;
        }
        self.phase = ControllerPhase::Error;
        if let Err(e) = self.sink.send(StreamEvent::from_error(err)).await {
            warn!("Failed to deliver error event: {}", e);
        }
    }
}

/// Runs executions end to end. Holds no per-execution state, so one
/// controller can serve any number of concurrent executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStreamController {
    timing: TimingConfig,
}

impl ExecutionStreamController {
    pub fn new(timing: TimingConfig) -> Self {
        Self { timing }
    }

    /// Resolve the command, then execute it. Resolver errors produce a
    /// single `Error` event and no session is created.
    pub async fn run<R, S, C>(&self, resolver: &R, sink: &mut S, control: &mut C) -> ExecutionOutcome
    where
        R: CommandResolver + ?Sized,
        S: EventSink + ?Sized,
        C: ControlSource + ?Sized,
    {
        match resolver.resolve() {
            Ok(request) => self.execute(request, sink, control).await,
            Err(err) => {
                info!("Command rejected before start: {}", err);
                let mut gate = EventGate::new(sink);
                gate.error(&err).await;
                ExecutionOutcome::failed(&err)
            }
        }
    }

    /// Execute an already resolved request.
    pub async fn execute<S, C>(&self, request: ExecutionRequest, sink: &mut S, control: &mut C) -> ExecutionOutcome
    where
        S: EventSink + ?Sized,
        C: ControlSource + ?Sized,
    {
        self.execute_with(request, sink, control, false).await
    }

    /// TTY probe: run a fixed shell command and append a native capability
    /// report to the output before the terminal event.
    pub async fn probe<S, C>(&self, size: PtySize, sink: &mut S, control: &mut C) -> ExecutionOutcome
    where
        S: EventSink + ?Sized,
        C: ControlSource + ?Sized,
    {
        self.execute_with(probe::probe_request(size), sink, control, true)
            .await
    }

    async fn execute_with<S, C>(
        &self,
        request: ExecutionRequest,
        sink: &mut S,
        control: &mut C,
        with_probe_report: bool,
    ) -> ExecutionOutcome
    where
        S: EventSink + ?Sized,
        C: ControlSource + ?Sized,
    {
        let session = Arc::new(PseudoConsoleSession::new(SessionTiming::from(&self.timing)));
        let mut gate = EventGate::new(sink);

        let driven = AssertUnwindSafe(self.drive(
            &session,
            &request,
            &mut gate,
            control,
            with_probe_report,
        ))
        .catch_unwind()
        .await;

        let outcome = match driven {
            Ok(outcome) => outcome,
            Err(panic) => {
                let err = ExecutionError::Unexpected(panic_message(panic.as_ref()));
                error!("Execution panicked: {}", err);
                session.kill();
                gate.error(&err).await;
                ExecutionOutcome::failed(&err)
            }
        };

        teardown(session).await;
        outcome
    }

    async fn drive<S, C>(
        &self,
        session: &Arc<PseudoConsoleSession>,
        request: &ExecutionRequest,
        gate: &mut EventGate<'_, S>,
        control: &mut C,
        with_probe_report: bool,
    ) -> ExecutionOutcome
    where
        S: EventSink + ?Sized,
        C: ControlSource + ?Sized,
    {
        if let Err(e) = start(session, request).await {
            let err = ExecutionError::from(e);
            gate.error(&err).await;
            return ExecutionOutcome::failed(&err);
        }
        let started_at = Instant::now();
        let capabilities = if with_probe_report {
            session.capabilities()
        } else {
            None
        };

        let operation_id = Uuid::new_v4().to_string();
        info!(%operation_id, pid = ?session.pid(), "Execution started");
        if let Err(e) = gate.started(operation_id, request.command_line()).await {
            warn!("Transport lost before streaming, cancelling: {}", e);
            session.kill();
            gate.error(&ExecutionError::Cancelled).await;
            return ExecutionOutcome::Cancelled;
        }

        let cancel = CancellationToken::new();
        let mut output = match session.read_output(cancel.child_token()) {
            Ok(output) => output,
            Err(e) => {
                let err = ExecutionError::from(e);
                gate.error(&err).await;
                return ExecutionOutcome::failed(&err);
            }
        };
        let watcher_cancel = cancel.child_token();
        let exit_watch = session.wait_for_exit(&watcher_cancel);
        tokio::pin!(exit_watch);

        let grace = tokio::time::sleep(Duration::from_secs(3600));
        tokio::pin!(grace);
        let mut grace_armed = false;

        let mut pump_open = true;
        let mut watcher_done = false;
        let mut monitoring = true;
        let mut cancelled = false;
        let mut exit_code: Option<i32> = None;
        let mut failure: Option<ExecutionError> = None;

        while (pump_open || !watcher_done) && failure.is_none() {
            tokio::select! {
                biased;

                message = control.next_message(), if monitoring => {
                    match message {
                        Ok(ControlMessage::Cancel) => info!("Cancel requested"),
                        Err(e) => info!("Control channel lost, cancelling: {}", e),
                    }
                    monitoring = false;
                    if !cancelled {
                        cancelled = true;
                        session.kill();
                        grace.as_mut().reset(Instant::now() + self.timing.cancel_grace());
                        grace_armed = true;
                    }
                }

                chunk = output.next(), if pump_open => match chunk {
                    Some(Ok(_)) if cancelled => {}
                    Some(Ok(bytes)) => {
                        if let Err(e) = gate.output(bytes).await {
                            warn!("Transport lost, cancelling: {}", e);
                            monitoring = false;
                            cancelled = true;
                            session.kill();
                            grace.as_mut().reset(Instant::now() + self.timing.cancel_grace());
                            grace_armed = true;
                        }
                    }
                    Some(Err(e)) => failure = Some(ExecutionError::Stream(e)),
                    None => {
                        debug!("Output pump finished");
                        pump_open = false;
                    }
                },

                code = &mut exit_watch, if !watcher_done => {
                    watcher_done = true;
                    match code {
                        Ok(Some(code)) => {
                            exit_code = Some(code);
                            if pump_open && !grace_armed {
                                grace.as_mut().reset(Instant::now() + self.timing.drain_grace());
                                grace_armed = true;
                            }
                        }
                        Ok(None) => debug!("Exit watcher stopped"),
                        Err(e) => failure = Some(e.into()),
                    }
                }

                _ = &mut grace, if grace_armed => {
                    debug!(pump_open, watcher_done, "Grace period elapsed, stopping stream");
                    grace_armed = false;
                    cancel.cancel();
                }
            }
        }
        cancel.cancel();
        let duration = started_at.elapsed();

        if let Some(err) = failure {
            error!("Execution failed: {}", err);
            session.kill();
            gate.error(&err).await;
            return ExecutionOutcome::failed(&err);
        }

        if cancelled {
            info!(exit_code = ?exit_code, "Execution cancelled");
            gate.error(&ExecutionError::Cancelled).await;
            return ExecutionOutcome::Cancelled;
        }

        if let Some(capabilities) = capabilities {
            let report = probe::format_report(&capabilities);
            if let Err(e) = gate.output(Bytes::from(report)).await {
                warn!("Failed to deliver probe report: {}", e);
            }
        }

        let exit_code = match exit_code.or_else(|| session.exit_code()) {
            Some(code) => code,
            None => {
                let err = ExecutionError::Unexpected("process exit was never observed".to_string());
                gate.error(&err).await;
                return ExecutionOutcome::failed(&err);
            }
        };
        info!(exit_code, ?duration, "Execution finished");
        gate.exited(exit_code, duration).await;
        ExecutionOutcome::Exited {
            exit_code,
            duration,
        }
    }
}

/// Spawn the child on the blocking pool.
async fn start(
    session: &Arc<PseudoConsoleSession>,
    request: &ExecutionRequest,
) -> Result<(), SessionError> {
    let starting = session.clone();
    let request = request.clone();
    tokio::task::spawn_blocking(move || starting.start(&request)).await?
}

async fn teardown(session: Arc<PseudoConsoleSession>) {
    let blocking = session.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || blocking.teardown()).await {
        warn!("Teardown task failed, tearing down inline: {}", e);
        session.teardown();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::tests::{missing_request, shell_request, LONG_RUNNING};
    use crate::transport::{ChannelControl, DetachedControl};
    use tokio::sync::mpsc;

    /// Checks `Started, Output*, (Exited | Error)`.
    fn assert_well_formed(events: &[StreamEvent]) {
        assert!(!events.is_empty(), "no events");
        let terminal = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminal, 1, "expected one terminal event: {events:?}");
        assert!(events.last().unwrap().is_terminal());
        if events.len() > 1 {
            assert!(matches!(events[0], StreamEvent::Started { .. }));
            for event in &events[1..events.len() - 1] {
                assert!(matches!(event, StreamEvent::Output { .. }), "{events:?}");
            }
        } else {
            assert!(matches!(events[0], StreamEvent::Error { .. }));
        }
    }

    fn output_text(events: &[StreamEvent]) -> String {
        let mut bytes = Vec::new();
        for event in events {
            if let StreamEvent::Output { bytes: chunk } = event {
                bytes.extend_from_slice(chunk);
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Sends `Cancel` on the control channel when the first output arrives
    /// and records when the cancel went out and when the stream ended.
    struct CancelOnFirstOutput {
        events: Vec<StreamEvent>,
        cancel_tx: Option<mpsc::Sender<ControlMessage>>,
        cancel_sent_at: Option<std::time::Instant>,
        terminal_at: Option<std::time::Instant>,
    }

    impl CancelOnFirstOutput {
        fn new(cancel_tx: mpsc::Sender<ControlMessage>) -> Self {
            Self {
                events: Vec::new(),
                cancel_tx: Some(cancel_tx),
                cancel_sent_at: None,
                terminal_at: None,
            }
        }
    }

    #[async_trait]
    impl EventSink for CancelOnFirstOutput {
        async fn send(&mut self, event: StreamEvent) -> Result<(), TransportError> {
            let is_output = matches!(event, StreamEvent::Output { .. });
            if event.is_terminal() {
                self.terminal_at = Some(std::time::Instant::now());
            }
            self.events.push(event);
            if is_output {
                if let Some(tx) = self.cancel_tx.take() {
                    tx.send(ControlMessage::Cancel)
                        .await
                        .map_err(|_| TransportError::Closed)?;
                    self.cancel_sent_at = Some(std::time::Instant::now());
                }
            }
            Ok(())
        }
    }

    /// Fails every send after the first `n`.
    struct BrokenAfter {
        events: Vec<StreamEvent>,
        remaining: usize,
    }

    #[async_trait]
    impl EventSink for BrokenAfter {
        async fn send(&mut self, event: StreamEvent) -> Result<(), TransportError> {
            if self.remaining == 0 {
                return Err(TransportError::Closed);
            }
            self.remaining -= 1;
            self.events.push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hi_then_exit_zero() {
        let controller = ExecutionStreamController::default();
        let mut events: Vec<StreamEvent> = Vec::new();
        let outcome = controller
            .execute(shell_request("echo hi"), &mut events, &mut DetachedControl)
            .await;

        assert_well_formed(&events);
        assert!(output_text(&events).contains("hi"));
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Exited { exit_code: 0, .. })
        ));
        assert!(matches!(outcome, ExecutionOutcome::Exited { exit_code: 0, .. }));
        assert_eq!(outcome.exit_status(), 0);
    }

    #[tokio::test]
    async fn test_started_carries_command_line() {
        let controller = ExecutionStreamController::default();
        let request = shell_request("echo hi");
        let expected = request.command_line();
        let mut events: Vec<StreamEvent> = Vec::new();
        controller
            .execute(request, &mut events, &mut DetachedControl)
            .await;

        match &events[0] {
            StreamEvent::Started {
                operation_id,
                command_line,
            } => {
                assert_eq!(command_line, &expected);
                assert!(Uuid::parse_str(operation_id).is_ok());
            }
            other => panic!("expected started, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let controller = ExecutionStreamController::default();
        let mut events: Vec<StreamEvent> = Vec::new();
        let outcome = controller
            .execute(shell_request("exit 4"), &mut events, &mut DetachedControl)
            .await;
        assert_well_formed(&events);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Exited { exit_code: 4, .. })
        ));
        assert_eq!(outcome.exit_status(), 4);
    }

    #[tokio::test]
    async fn test_missing_executable_is_single_error() {
        let controller = ExecutionStreamController::default();
        let mut events: Vec<StreamEvent> = Vec::new();
        let outcome = controller
            .execute(missing_request(), &mut events, &mut DetachedControl)
            .await;

        assert_eq!(events.len(), 1, "{events:?}");
        match &events[0] {
            StreamEvent::Error {
                code,
                remediation_hint,
                ..
            } => {
                assert_eq!(code, "OS_RESOURCE_ERROR");
                assert!(remediation_hint.is_some());
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(matches!(
            outcome,
            ExecutionOutcome::Failed {
                code: "OS_RESOURCE_ERROR",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_resolver_error_never_starts() {
        struct Rejecting;
        impl CommandResolver for Rejecting {
            fn resolve(&self) -> Result<ExecutionRequest, ExecutionError> {
                Err(ExecutionError::dependency_missing(
                    "terraform not found",
                    "install terraform",
                ))
            }
        }

        let controller = ExecutionStreamController::default();
        let mut events: Vec<StreamEvent> = Vec::new();
        controller
            .run(&Rejecting, &mut events, &mut DetachedControl)
            .await;
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                code: "DEPENDENCY_MISSING".into(),
                message: "terraform not found".into(),
                remediation_hint: Some("install terraform".into()),
            }]
        );
    }

    #[tokio::test]
    async fn test_cancel_after_first_output() {
        let controller = ExecutionStreamController::default();
        let (tx, rx) = mpsc::channel(4);
        let mut sink = CancelOnFirstOutput::new(tx);
        let mut control = ChannelControl::new(rx);

        let outcome = controller
            .execute(shell_request(LONG_RUNNING), &mut sink, &mut control)
            .await;

        let sent = sink.cancel_sent_at.expect("cancel was sent");
        let ended = sink.terminal_at.expect("stream ended");
        let latency = ended.duration_since(sent);
        assert!(
            latency < Duration::from_secs(2),
            "terminal event {latency:?} after cancel"
        );

        let events = sink.events;
        assert_well_formed(&events);
        let outputs = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Output { .. }))
            .count();
        assert_eq!(outputs, 1, "no output may follow the cancel: {events:?}");
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error { code, .. }) if code == "CANCELLED"
        ));
        assert_eq!(outcome, ExecutionOutcome::Cancelled);
        assert_eq!(outcome.exit_status(), 130);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_single_threaded_runtime_keeps_ticking_during_execution() {
        let controller = ExecutionStreamController::default();
        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        let mut events: Vec<StreamEvent> = Vec::new();
        let outcome = controller
            .execute(shell_request("echo hi"), &mut events, &mut DetachedControl)
            .await;
        ticker.abort();

        assert_well_formed(&events);
        assert!(matches!(outcome, ExecutionOutcome::Exited { exit_code: 0, .. }));
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_control_channel_loss_cancels() {
        let controller = ExecutionStreamController::default();
        let (tx, rx) = mpsc::channel::<ControlMessage>(1);
        drop(tx);
        let mut control = ChannelControl::new(rx);
        let mut events: Vec<StreamEvent> = Vec::new();

        let outcome = controller
            .execute(shell_request(LONG_RUNNING), &mut events, &mut control)
            .await;
        assert_well_formed(&events);
        assert_eq!(outcome, ExecutionOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_sink_failure_cancels_without_hanging() {
        let controller = ExecutionStreamController::default();
        let mut sink = BrokenAfter {
            events: Vec::new(),
            remaining: 1,
        };
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            controller.execute(shell_request(LONG_RUNNING), &mut sink, &mut DetachedControl),
        )
        .await
        .expect("controller must not hang on a broken transport");
        assert_eq!(outcome, ExecutionOutcome::Cancelled);
        assert_eq!(sink.events.len(), 1);
        assert!(matches!(sink.events[0], StreamEvent::Started { .. }));
    }

    #[tokio::test]
    async fn test_probe_appends_report() {
        let controller = ExecutionStreamController::default();
        let mut events: Vec<StreamEvent> = Vec::new();
        let outcome = controller
            .probe(PtySize::default(), &mut events, &mut DetachedControl)
            .await;

        assert_well_formed(&events);
        let text = output_text(&events);
        assert!(text.contains("tty-probe"), "{text}");
        assert!(text.contains("[tty-probe] character device:"), "{text}");
        assert!(text.contains("[tty-probe] terminal mode query:"), "{text}");
        assert!(matches!(outcome, ExecutionOutcome::Exited { exit_code: 0, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_sees_terminal_on_unix() {
        let controller = ExecutionStreamController::default();
        let mut events: Vec<StreamEvent> = Vec::new();
        controller
            .probe(PtySize::new(100, 40), &mut events, &mut DetachedControl)
            .await;
        let text = output_text(&events);
        assert!(text.contains("stdout: tty"), "{text}");
        assert!(text.contains("40 100"), "{text}");
        assert!(text.contains("character device: yes"), "{text}");
        assert!(text.contains("terminal mode query: ok (100x40)"), "{text}");
    }

    #[tokio::test]
    async fn test_concurrent_executions_are_independent() {
        let controller = ExecutionStreamController::default();
        let mut first: Vec<StreamEvent> = Vec::new();
        let mut second: Vec<StreamEvent> = Vec::new();
        let mut first_control = DetachedControl;
        let mut second_control = DetachedControl;
        let (a, b) = tokio::join!(
            controller.execute(shell_request("echo one"), &mut first, &mut first_control),
            controller.execute(missing_request(), &mut second, &mut second_control),
        );
        assert!(matches!(a, ExecutionOutcome::Exited { exit_code: 0, .. }));
        assert!(matches!(b, ExecutionOutcome::Failed { .. }));
        assert_well_formed(&first);
        assert_well_formed(&second);
        assert!(output_text(&first).contains("one"));
    }

    #[tokio::test]
    async fn test_gate_enforces_phases() {
        let mut events: Vec<StreamEvent> = Vec::new();
        {
            let mut gate = EventGate::new(&mut events);
            gate.output(Bytes::from_static(b"early")).await.unwrap();
            gate.started("op".into(), "cmd".into()).await.unwrap();
            gate.output(Bytes::from_static(b"ok")).await.unwrap();
            gate.exited(0, Duration::ZERO).await;
            gate.output(Bytes::from_static(b"late")).await.unwrap();
            gate.error(&ExecutionError::Cancelled).await;
            assert_eq!(gate.phase, ControllerPhase::Exited);
        }
        assert_eq!(events.len(), 3);
        assert_well_formed(&events);
        assert_eq!(output_text(&events), "ok");
    }
}
