//! Generation progress streaming.

pub mod emitter;
pub mod event;
pub mod sink;
pub mod store;

pub use emitter::{channel, ProgressEmitter, ProgressReceiver, ProgressSender};
pub use event::{ProgressEvent, ProgressKind, ProgressStage};
pub use sink::{spawn_stream_writer, sse_frame, MemorySink, ProgressSink, SseSink};
pub use store::{ProgressLog, StreamMeta};
