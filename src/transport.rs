//! Duplex transport adapters
//!
//! `NdjsonSink`/`NdjsonControl` speak newline-delimited JSON over any tokio
//! byte stream (stdio, a socket half). `ChannelSink`/`ChannelControl` wrap
//! tokio mpsc channels for embedding the controller in another service.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::stream::event::{ControlMessage, EventEncoder, StreamEvent};
use crate::stream::{ControlSource, EventSink};

/// Writes each event as one JSON line and flushes it.
pub struct NdjsonSink<W> {
    writer: W,
    encoder: EventEncoder,
}

impl<W: AsyncWrite + Unpin + Send> NdjsonSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            encoder: EventEncoder::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> EventSink for NdjsonSink<W> {
    async fn send(&mut self, event: StreamEvent) -> Result<(), TransportError> {
        for wire in self.encoder.encode(event) {
            let line = wire.to_line()?;
            self.writer.write_all(line.as_bytes()).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }
}

/// Reads control messages, one JSON object per line.
///
/// Blank and malformed lines are logged and skipped. End of input is
/// reported as `TransportError::Closed`.
pub struct NdjsonControl<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin + Send> NdjsonControl<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ControlSource for NdjsonControl<R> {
    async fn next_message(&mut self) -> Result<ControlMessage, TransportError> {
        // `next_line` is cancel safe, so a partially read line survives a
        // dropped call.
        loop {
            let line = self.lines.next_line().await?.ok_or(TransportError::Closed)?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match ControlMessage::parse(line) {
                Ok(message) => return Ok(message),
                Err(e) => warn!("Ignoring malformed control message {:?}: {}", line, e),
            }
        }
    }
}

/// Forwards events into an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&mut self, event: StreamEvent) -> Result<(), TransportError> {
        self.tx.send(event).await.map_err(|_| TransportError::Closed)
    }
}

/// Receives control messages from an mpsc channel; a closed channel is a
/// lost transport.
#[derive(Debug)]
pub struct ChannelControl {
    rx: mpsc::Receiver<ControlMessage>,
}

impl ChannelControl {
    pub fn new(rx: mpsc::Receiver<ControlMessage>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl ControlSource for ChannelControl {
    async fn next_message(&mut self) -> Result<ControlMessage, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

/// Wraps another control source and turns an interrupt into `Cancel`.
///
/// Interrupts arrive on a channel fed by a long-lived listener, so one that
/// lands while `next_message` is not being polled is still delivered.
pub struct InterruptControl<C: ?Sized> {
    interrupts: mpsc::UnboundedReceiver<()>,
    inner: Box<C>,
}

impl<C: ControlSource + ?Sized> InterruptControl<C> {
    pub fn new(inner: Box<C>, interrupts: mpsc::UnboundedReceiver<()>) -> Self {
        Self { interrupts, inner }
    }
}

#[async_trait]
impl<C: ControlSource + ?Sized> ControlSource for InterruptControl<C> {
    async fn next_message(&mut self) -> Result<ControlMessage, TransportError> {
        tokio::select! {
            biased;
            Some(()) = self.interrupts.recv() => {
                debug!("Interrupted");
                Ok(ControlMessage::Cancel)
            }
            message = self.inner.next_message() => message,
        }
    }
}

/// A control source that never delivers anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedControl;

#[async_trait]
impl ControlSource for DetachedControl {
    async fn next_message(&mut self) -> Result<ControlMessage, TransportError> {
        debug!("Control detached");
        std::future::pending().await
    }
}

/// Collects events in memory.
#[async_trait]
impl EventSink for Vec<StreamEvent> {
    async fn send(&mut self, event: StreamEvent) -> Result<(), TransportError> {
        self.push(event);
        Ok(())
    }
}
