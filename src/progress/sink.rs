//! Push-transport sinks and the stream writer task that feeds them.

use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::progress::emitter::ProgressReceiver;
use crate::progress::event::ProgressEvent;
use crate::progress::store::ProgressLog;

/// Destination for an ordered progress stream.
pub trait ProgressSink: Send {
    fn send(&mut self, event: &ProgressEvent) -> Result<(), ApiError>;

    fn close(&mut self) -> Result<(), ApiError> {
        Ok(())
    }
}

/// Writes server-sent-event frames: `event: <kind>\ndata: <json>\n\n`.
pub struct SseSink<W> {
    writer: W,
}

impl<W: Write + Send> SseSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

pub fn sse_frame(event: &ProgressEvent) -> Result<String, ApiError> {
    let data = serde_json::to_string(event)
        .map_err(|e| ApiError::Progress(format!("Failed to encode progress event: {}", e)))?;
    Ok(format!("event: {}\ndata: {}\n\n", event.kind, data))
}

impl<W: Write + Send> ProgressSink for SseSink<W> {
    fn send(&mut self, event: &ProgressEvent) -> Result<(), ApiError> {
        let frame = sse_frame(event)?;
        self.writer
            .write_all(frame.as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(|e| ApiError::Progress(format!("Failed to write progress frame: {}", e)))
    }

    fn close(&mut self) -> Result<(), ApiError> {
        self.writer
            .flush()
            .map_err(|e| ApiError::Progress(format!("Failed to flush progress stream: {}", e)))
    }
}

/// Collects events in memory; clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
    closed: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl ProgressSink for MemorySink {
    fn send(&mut self, event: &ProgressEvent) -> Result<(), ApiError> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<(), ApiError> {
        *self.closed.lock() = true;
        Ok(())
    }
}

impl ProgressSink for ProgressLog {
    fn send(&mut self, event: &ProgressEvent) -> Result<(), ApiError> {
        self.append_event(event)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ApiError> {
        self.flush()?;
        Ok(())
    }
}

/// Drains `receiver` into every sink until a terminal event arrives or all senders are
/// dropped, then closes the sinks. A failing sink is dropped from the fan-out.
///
/// Resolves to the number of events delivered.
pub fn spawn_stream_writer(
    mut receiver: ProgressReceiver,
    mut sinks: Vec<Box<dyn ProgressSink>>,
) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut delivered = 0usize;
        while let Some(event) = receiver.recv().await {
            sinks.retain_mut(|sink| match sink.send(&event) {
                Ok(()) => true,
                Err(err) => {
                    warn!(
                        generation_key = %event.generation_key,
                        seq = event.seq,
                        error = %err,
                        "Dropping progress sink after write failure"
                    );
                    false
                }
            });
            delivered += 1;
            if event.is_terminal() {
                break;
            }
        }
        for sink in &mut sinks {
            if let Err(err) = sink.close() {
                warn!(error = %err, "Failed to close progress sink");
            }
        }
        debug!(delivered, "Progress stream writer finished");
        delivered
    })
}
