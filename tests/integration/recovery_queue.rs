use copyline::error::{ApiError, ErrorCategory, StageError};
use copyline::recovery::{with_retry, BatchErrorItem, RecoveryOptions, RecoveryQueue, RetryOptions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn no_jitter(initial_ms: u64) -> RecoveryOptions {
    RecoveryOptions {
        initial_delay: Some(Duration::from_millis(initial_ms)),
        max_delay: Duration::from_secs(5),
        jitter_ratio: 0.0,
        ..RecoveryOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_until_retries_run_out() {
    let queue = RecoveryQueue::new();
    let attempts_at = Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();

    let state = queue
        .recover(
            vec![BatchErrorItem::new("faq", StageError::network("reset"))],
            |_item| {
                let attempts_at = Arc::clone(&attempts_at);
                async move {
                    attempts_at.lock().push(started.elapsed().as_millis() as u64);
                    Err::<(), _>(StageError::network("reset again"))
                }
            },
            &no_jitter(10),
        )
        .await
        .unwrap();

    assert_eq!(*attempts_at.lock(), vec![10, 30, 70]);
    assert!(state.recovered.is_empty());
    assert_eq!(state.failed.len(), 1);
    assert_eq!(state.failed[0].retry_count, 3);
    assert_eq!(state.failed[0].last_error(), "reset again");
}

#[tokio::test(start_paused = true)]
async fn mixed_batch_is_sorted_into_recovered_and_failed() {
    let queue = RecoveryQueue::new();
    let calls = Arc::new(Mutex::new(HashMap::<String, u32>::new()));
    let items = vec![
        BatchErrorItem::new(
            "chapters",
            StageError::rate_limited("slow down", Some(Duration::from_millis(250))),
        ),
        BatchErrorItem::new("faq", StageError::external("502 from upstream")),
        BatchErrorItem::new("keywords", StageError::validation("bad keyword list")),
        BatchErrorItem::new(
            "case_studies",
            StageError::external("model refused").mark_non_retryable(),
        ),
    ];

    let state = queue
        .recover(
            items,
            |item| {
                let calls = Arc::clone(&calls);
                async move {
                    *calls.lock().entry(item.item_id.clone()).or_default() += 1;
                    Ok::<_, StageError>(format!("{} ok", item.item_id))
                }
            },
            &no_jitter(10),
        )
        .await
        .unwrap();

    let mut recovered: Vec<&str> = state
        .recovered
        .iter()
        .map(|r| r.item.item_id.as_str())
        .collect();
    recovered.sort();
    assert_eq!(recovered, vec!["chapters", "faq"]);

    let mut failed: Vec<&str> = state.failed.iter().map(|i| i.item_id.as_str()).collect();
    failed.sort();
    assert_eq!(failed, vec!["case_studies", "keywords"]);

    let calls = calls.lock();
    assert_eq!(calls.get("chapters"), Some(&1));
    assert!(calls.get("keywords").is_none());
    assert!(calls.get("case_studies").is_none());
}

#[tokio::test(start_paused = true)]
async fn stats_accumulate_across_runs() {
    let queue = RecoveryQueue::new();
    for round in 0..2 {
        let state = queue
            .recover(
                vec![
                    BatchErrorItem::new(format!("a{round}"), StageError::network("x")),
                    BatchErrorItem::new(format!("b{round}"), StageError::validation("y")),
                ],
                |_item| async { Ok::<_, StageError>(()) },
                &no_jitter(5),
            )
            .await
            .unwrap();
        assert_eq!(state.recovered.len(), 1);
    }

    let stats = queue.stats();
    assert_eq!(stats.runs, 2);
    assert_eq!(stats.attempts, 2);
    assert_eq!(stats.recovered, 2);
    assert_eq!(stats.failed, 2);
    assert!(!queue.is_active());
}

#[tokio::test(start_paused = true)]
async fn shared_queue_rejects_overlapping_runs() {
    let queue = Arc::new(RecoveryQueue::new());
    let slow = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            queue
                .recover(
                    vec![BatchErrorItem::new("faq", StageError::network("x"))],
                    |_item| async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok::<_, StageError>(())
                    },
                    &no_jitter(10),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let overlapping = queue
        .recover(
            vec![BatchErrorItem::new("chapters", StageError::network("x"))],
            |_item| async { Ok::<_, StageError>(()) },
            &no_jitter(10),
        )
        .await;
    assert!(matches!(overlapping, Err(ApiError::RecoveryInProgress)));

    let first = slow.await.unwrap().unwrap();
    assert!(first.is_fully_recovered());
}

#[tokio::test(start_paused = true)]
async fn with_retry_honours_retry_after() {
    let calls = Arc::new(Mutex::new(0u32));
    let started = Instant::now();
    let options = RetryOptions {
        initial_delay: Duration::from_millis(10),
        jitter_ratio: 0.0,
        ..RetryOptions::default()
    };

    let value = with_retry(
        || {
            let calls = Arc::clone(&calls);
            async move {
                let mut calls = calls.lock();
                *calls += 1;
                if *calls == 1 {
                    Err(StageError::rate_limited("429", Some(Duration::from_secs(2))))
                } else {
                    Ok(*calls)
                }
            }
        },
        &options,
    )
    .await
    .unwrap();

    assert_eq!(value, 2);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(StageError::rate_limited("429", None).category, ErrorCategory::RateLimit);
}
