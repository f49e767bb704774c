use copyline::error::StageError;
use copyline::progress::{
    spawn_stream_writer, MemorySink, ProgressKind, ProgressLog, ProgressSink, ProgressStage,
    SseSink,
};
use copyline::types::{PipelineProfile, StageId};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

use crate::integration::test_utils::{in_memory_cache, orchestrator, request, ScriptedWorker};

/// `Write` handle over a shared buffer so the test can read what an owned sink wrote.
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn stream_is_fanned_out_and_replayable() {
    let dir = TempDir::new().unwrap();
    let log = ProgressLog::open(dir.path().join("progress")).unwrap();
    let memory = MemorySink::new();
    let buffer = SharedBuffer::default();

    let orchestrator = Arc::new(orchestrator(
        Arc::new(ScriptedWorker::new()),
        in_memory_cache(),
    ));
    let (run, events) = orchestrator.start(request(PipelineProfile::Full));
    let sinks: Vec<Box<dyn ProgressSink>> = vec![
        Box::new(memory.clone()),
        Box::new(log.clone()),
        Box::new(SseSink::new(buffer.clone())),
    ];
    let writer = spawn_stream_writer(events, sinks);
    let state = run.wait().await.unwrap();
    let delivered = writer.await.unwrap();

    let live = memory.events();
    assert_eq!(delivered, live.len());
    assert!(memory.is_closed());
    assert!(live
        .iter()
        .enumerate()
        .all(|(i, e)| e.seq == i as u64 + 1 && e.generation_key == state.generation_key));
    assert!(live.windows(2).all(|w| w[0].percentage <= w[1].percentage));

    // One start and one completion per stage, bracketed by initializing and complete.
    let started = live.iter().filter(|e| e.kind == ProgressKind::StageStarted).count();
    let completed = live.iter().filter(|e| e.kind == ProgressKind::StageCompleted).count();
    assert_eq!((started, completed), (8, 8));
    assert_eq!(live.first().unwrap().stage, ProgressStage::Initializing);
    let last = live.last().unwrap();
    assert_eq!(last.stage, ProgressStage::Complete);
    assert_eq!(last.completed_stages.len(), 8);
    assert_eq!(last.result.as_ref(), state.result.as_ref());

    let replayed = log.read_events(&state.generation_key).unwrap();
    assert_eq!(replayed, live);
    let tail = log.read_events_after(&state.generation_key, 3).unwrap();
    assert_eq!(tail.first().unwrap().seq, 4);
    assert_eq!(tail.len(), live.len() - 3);

    let meta = log.get_meta(&state.generation_key).unwrap().unwrap();
    assert!(meta.is_finished());
    assert_eq!(meta.last_kind, ProgressKind::Complete);
    assert_eq!(meta.last_percentage, 100);

    let sse = String::from_utf8(buffer.0.lock().clone()).unwrap();
    assert_eq!(sse.matches("\n\n").count(), live.len());
    assert!(sse.starts_with("event: initializing\ndata: {"));
    assert!(sse.trim_end().lines().rev().nth(1).unwrap().starts_with("event: complete"));
}

#[tokio::test(start_paused = true)]
async fn failed_run_ends_with_error_event() {
    let worker = Arc::new(
        ScriptedWorker::new().fail(StageId::Description, vec![StageError::validation("empty")]),
    );
    let orchestrator = Arc::new(orchestrator(worker, in_memory_cache()));
    let memory = MemorySink::new();

    let (run, events) = orchestrator.start(request(PipelineProfile::Quick));
    let writer = spawn_stream_writer(events, vec![Box::new(memory.clone())]);
    let state = run.wait().await.unwrap();
    writer.await.unwrap();

    let live = memory.events();
    let kinds: Vec<ProgressKind> = live.iter().map(|e| e.kind).collect();
    assert_eq!(kinds[0], ProgressKind::Initializing);
    assert_eq!(kinds[1], ProgressKind::StageStarted);
    assert_eq!(kinds[2], ProgressKind::StageFailed);
    assert_eq!(
        kinds.iter().filter(|k| **k == ProgressKind::StageSkipped).count(),
        state.stages.len() - 1
    );
    assert_eq!(*kinds.last().unwrap(), ProgressKind::Error);
    assert!(live.last().unwrap().message.contains("empty"));
    assert!(live.last().unwrap().result.is_none());
}

#[tokio::test(start_paused = true)]
async fn rerun_replaces_recorded_stream() {
    let dir = TempDir::new().unwrap();
    let log = ProgressLog::open(dir.path().join("progress")).unwrap();
    let orchestrator = Arc::new(orchestrator(
        Arc::new(ScriptedWorker::new()),
        in_memory_cache(),
    ));

    let (run, events) = orchestrator.start(request(PipelineProfile::Full));
    spawn_stream_writer(events, vec![Box::new(log.clone())]).await.unwrap();
    let key = run.wait().await.unwrap().generation_key;
    let first_len = log.read_events(&key).unwrap().len();
    assert!(first_len > 2);

    // The second run is a result-cache hit with a much shorter stream.
    let (run, events) = orchestrator.start(request(PipelineProfile::Full));
    spawn_stream_writer(events, vec![Box::new(log.clone())]).await.unwrap();
    run.wait().await.unwrap();

    let replayed = log.read_events(&key).unwrap();
    assert!(replayed.len() < first_len);
    assert_eq!(replayed.last().unwrap().kind, ProgressKind::Complete);
}
