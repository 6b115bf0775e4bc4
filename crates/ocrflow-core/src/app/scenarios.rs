//! End-to-end runs of the queue against `ScriptedBackend`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};

use super::{PipelineBuilder, ProcessingQueue};
use crate::config::OcrflowConfig;
use crate::domain::{
    DocumentType, ErrorCode, FailureClass, Fingerprint, JobId, JobState, OcrError, OcrResult, OcrStatusKind,
    Priority, QueueError, QueueEvent, Submission,
};
use crate::impls::{ScriptStep, ScriptedBackend};
use crate::polling::PollingConfig;
use crate::processors::{DocumentProcessor, ProcessorError, ProcessorMetadata};

struct Harness {
    queue: ProcessingQueue,
    backend: Arc<ScriptedBackend>,
    events: broadcast::Receiver<QueueEvent>,
}

async fn harness(configure: impl FnOnce(&mut OcrflowConfig)) -> Harness {
    harness_with(ScriptedBackend::new(), configure).await
}

async fn harness_with(
    backend: ScriptedBackend,
    configure: impl FnOnce(&mut OcrflowConfig),
) -> Harness {
    let backend = Arc::new(backend);
    let mut builder = PipelineBuilder::new()
        .backend(backend.clone())
        .with_builtin_processors();
    let config = builder.config_mut();
    config.polling = PollingConfig::fixed(Duration::from_millis(5), Duration::from_secs(5));
    config.retry.base_delay_ms = 0;
    config.queue.housekeeping_interval_ms = 5;
    config.queue.concurrency = 1;
    configure(config);

    let queue = builder.build().await.unwrap();
    let events = queue.subscribe();
    Harness {
        queue,
        backend,
        events,
    }
}

async fn next_matching(
    events: &mut broadcast::Receiver<QueueEvent>,
    pred: impl Fn(&QueueEvent) -> bool,
) -> QueueEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event not observed in time")
}

fn completed(id: JobId) -> impl Fn(&QueueEvent) -> bool {
    move |e| matches!(e, QueueEvent::JobCompleted { job } if job.job_id == id)
}

fn entered(id: JobId, state: JobState) -> impl Fn(&QueueEvent) -> bool {
    move |e| matches!(e, QueueEvent::JobStateChanged { job, to, .. } if job.job_id == id && *to == state)
}

async fn wait_idle(queue: &ProcessingQueue) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.in_flight().await > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("in-flight jobs did not settle");
}

#[tokio::test]
async fn high_priority_document_is_processed_first_and_cached() {
    let mut h = harness(|_| {}).await;

    let mut normals = Vec::new();
    for i in 0..3 {
        let id = h
            .queue
            .enqueue(
                Submission::new(format!("normal {i}").into_bytes()),
                Priority::Normal,
            )
            .await
            .unwrap();
        normals.push(id);
    }
    let report = Submission::new(b"quarterly report\x0cpage two".to_vec())
        .with_metadata("pages", json!(2));
    let fingerprint = report.fingerprint();
    let high = h.queue.enqueue(report, Priority::High).await.unwrap();

    let mut two_pages = OcrResult::new("quarterly report\npage two", 0.97, 2);
    two_pages.language = Some("en".into());
    h.backend
        .push_status_script(vec![
            ScriptStep::Processing { percent: 20 },
            ScriptStep::Processing { percent: 50 },
            ScriptStep::Processing { percent: 80 },
            ScriptStep::Complete(two_pages.clone()),
        ])
        .await;

    h.queue.start().await.unwrap();

    let mut seen = Vec::new();
    let mut remaining = 4;
    while remaining > 0 {
        let event = next_matching(&mut h.events, |_| true).await;
        if matches!(event, QueueEvent::JobCompleted { .. }) {
            remaining -= 1;
        }
        seen.push(event);
    }
    h.queue.stop().await.unwrap();

    let started: Vec<JobId> = seen
        .iter()
        .filter_map(|e| match e {
            QueueEvent::JobStateChanged { job, to, .. } if *to == JobState::Processing => {
                Some(job.job_id)
            }
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![high, normals[0], normals[1], normals[2]]);

    let high_transitions: Vec<(JobState, JobState)> = seen
        .iter()
        .filter_map(|e| match e {
            QueueEvent::JobStateChanged { job, from, to } if job.job_id == high => {
                Some((*from, *to))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        high_transitions,
        vec![
            (JobState::Queued, JobState::Processing),
            (JobState::Processing, JobState::Completed),
        ]
    );

    let progress: Vec<(OcrStatusKind, u8)> = seen
        .iter()
        .filter_map(|e| match e {
            QueueEvent::JobProgress { job_id, status } if *job_id == high => {
                Some((status.status, status.progress_percent))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        progress,
        vec![
            (OcrStatusKind::Processing, 20),
            (OcrStatusKind::Processing, 50),
            (OcrStatusKind::Processing, 80),
            (OcrStatusKind::Completed, 100),
        ]
    );

    let done = seen
        .iter()
        .find_map(|e| match e {
            QueueEvent::JobCompleted { job } if job.job_id == high => Some(job.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(done.result, Some(two_pages.clone()));
    assert!(done.tracking_id.is_some());
    assert!(!done.served_from_cache);

    let cached = h.queue.cache().peek(&fingerprint).await.unwrap();
    assert_eq!(cached.result(), Some(&two_pages));

    let stats = h.queue.statistics();
    assert_eq!(stats.succeeded, 4);
    assert_eq!(stats.success_rate, 1.0);
}

#[tokio::test]
async fn transient_errors_are_retried_until_success() {
    let mut h = harness(|_| {}).await;
    h.backend
        .fail_next_submits(OcrError::Network("connection reset".into()), 2)
        .await;

    let id = h
        .queue
        .enqueue(Submission::new(b"flaky".to_vec()), Priority::Normal)
        .await
        .unwrap();
    h.queue.start().await.unwrap();

    next_matching(&mut h.events, completed(id)).await;
    h.queue.stop().await.unwrap();

    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.last_error.map(|e| e.code), Some(ErrorCode::Network));
    assert!(h.queue.failures().get(id).await.is_none());
    assert_eq!(h.backend.submit_count(), 3);

    let stats = h.queue.statistics();
    assert_eq!((stats.succeeded, stats.failed), (1, 2));
}

#[tokio::test]
async fn retry_ceiling_holds_while_the_last_retry_is_in_flight() {
    // each submit outlasts several housekeeping ticks
    let backend = ScriptedBackend::new().with_latency(Duration::from_millis(40));
    backend
        .fail_next_submits(OcrError::Network("connection refused".into()), 100)
        .await;
    let mut h = harness_with(backend, |c| c.retry.max_retries = 1).await;

    let id = h
        .queue
        .enqueue(Submission::new(b"unlucky".to_vec()), Priority::Normal)
        .await
        .unwrap();
    h.queue.start().await.unwrap();

    // first attempt, then the single allowed retry
    next_matching(&mut h.events, entered(id, JobState::Failed)).await;
    next_matching(&mut h.events, entered(id, JobState::Failed)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.queue.stop().await.unwrap();

    assert_eq!(h.backend.submit_count(), 2);
    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.retry_count, 1);
    assert!(h.queue.failures().get(id).await.is_none());
}

#[tokio::test]
async fn permanent_rejection_is_not_retried() {
    let mut h = harness(|_| {}).await;
    h.backend
        .push_submit_outcome(Err(OcrError::Rejected("unreadable scan".into())))
        .await;

    let id = h
        .queue
        .enqueue(Submission::new(b"blurry".to_vec()), Priority::Normal)
        .await
        .unwrap();
    h.queue.start().await.unwrap();
    next_matching(&mut h.events, entered(id, JobState::Failed)).await;

    // several housekeeping ticks
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.queue.stop().await.unwrap();

    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    let error = job.last_error.unwrap();
    assert_eq!(error.code, ErrorCode::Rejected);
    assert_eq!(error.class, FailureClass::Permanent);
    assert!(!error.retryable);

    let failed = h.queue.failures().get(id).await.unwrap();
    assert_eq!(failed.classification, FailureClass::Permanent);
    assert_eq!(h.backend.submit_count(), 1);

    assert!(matches!(
        h.queue.retry(id).await,
        Err(QueueError::NotRetryable { .. })
    ));

    // removable by hand
    h.queue.remove(id).await.unwrap();
    assert!(h.queue.failures().is_empty().await);
}

#[tokio::test]
async fn identical_content_is_served_from_cache_until_it_expires() {
    let mut h = harness(|c| c.cache.default_ttl_ms = 100).await;
    h.queue.start().await.unwrap();

    let content = b"TOTAL 4.50".to_vec();
    let first = h
        .queue
        .enqueue(Submission::new(content.clone()), Priority::Normal)
        .await
        .unwrap();
    next_matching(&mut h.events, completed(first)).await;

    let second = h
        .queue
        .enqueue(Submission::new(content.clone()), Priority::Normal)
        .await
        .unwrap();
    match next_matching(&mut h.events, completed(second)).await {
        QueueEvent::JobCompleted { job } => {
            assert!(job.served_from_cache);
            assert_eq!(job.result.unwrap().text, "TOTAL 4.50");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.backend.submit_count(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let third = h
        .queue
        .enqueue(Submission::new(content), Priority::Normal)
        .await
        .unwrap();
    next_matching(&mut h.events, completed(third)).await;
    h.queue.stop().await.unwrap();

    assert_eq!(h.backend.submit_count(), 2);
    assert_eq!(h.queue.statistics().served_from_cache, 1);
}

#[tokio::test]
async fn duplicate_waits_for_in_flight_original() {
    let mut h = harness(|c| c.queue.concurrency = 2).await;
    h.backend
        .push_status_script(vec![
            ScriptStep::Queued { position: 1 },
            ScriptStep::Processing { percent: 50 },
            ScriptStep::CompleteEcho,
        ])
        .await;

    let content = b"same bytes".to_vec();
    let original = h
        .queue
        .enqueue(Submission::new(content.clone()), Priority::Normal)
        .await
        .unwrap();
    let duplicate = h
        .queue
        .enqueue(Submission::new(content), Priority::High)
        .await
        .unwrap();
    h.queue.start().await.unwrap();

    next_matching(&mut h.events, completed(duplicate)).await;
    next_matching(&mut h.events, completed(original)).await;
    h.queue.stop().await.unwrap();

    // the High duplicate went first; the Normal original waited for it and
    // was then served from cache
    assert_eq!(h.backend.submit_count(), 1);
    let original = h.queue.get(original).await.unwrap();
    let duplicate = h.queue.get(duplicate).await.unwrap();
    assert!(original.served_from_cache);
    assert!(!duplicate.served_from_cache);
}

#[tokio::test]
async fn cancellation_mid_poll_stops_promptly() {
    let mut h = harness(|c| {
        c.polling = PollingConfig::fixed(Duration::from_millis(200), Duration::from_secs(30));
    })
    .await;
    h.backend
        .push_status_script(vec![ScriptStep::Processing { percent: 10 }])
        .await;

    let id = h
        .queue
        .enqueue(Submission::new(b"long job".to_vec()), Priority::Normal)
        .await
        .unwrap();
    h.queue.start().await.unwrap();
    next_matching(&mut h.events, |e| {
        matches!(e, QueueEvent::JobProgress { job_id, .. } if *job_id == id)
    })
    .await;

    let snapshot = h.queue.cancel(id).await.unwrap();
    assert_eq!(snapshot.state, JobState::Cancelled);
    tokio::time::timeout(Duration::from_millis(100), wait_idle(&h.queue))
        .await
        .expect("worker did not observe cancellation within one tick");
    h.queue.stop().await.unwrap();

    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.last_error.is_none());
    assert!(h.queue.failures().is_empty().await);

    let stats = h.queue.statistics();
    assert_eq!((stats.cancelled, stats.failed), (1, 0));
}

#[tokio::test]
async fn poll_timeout_fails_with_last_status() {
    let mut h = harness(|c| {
        c.polling = PollingConfig::fixed(Duration::from_millis(5), Duration::from_millis(30));
        c.queue.auto_retry = false;
    })
    .await;
    h.backend
        .push_status_script(vec![ScriptStep::Queued { position: 3 }])
        .await;

    let id = h
        .queue
        .enqueue(Submission::new(b"stuck".to_vec()), Priority::Normal)
        .await
        .unwrap();
    h.queue.start().await.unwrap();
    next_matching(&mut h.events, entered(id, JobState::Failed)).await;
    h.queue.stop().await.unwrap();

    let job = h.queue.get(id).await.unwrap();
    let error = job.last_error.unwrap();
    assert_eq!(error.code, ErrorCode::PollTimeout);
    assert_eq!(error.class, FailureClass::Transient);
    assert!(error.tracking_id.is_some());

    // manual retry is allowed and resubmits
    h.backend
        .push_status_script(vec![ScriptStep::CompleteEcho])
        .await;
    h.queue.start().await.unwrap();
    h.queue.retry(id).await.unwrap();
    next_matching(&mut h.events, completed(id)).await;
    h.queue.stop().await.unwrap();
    assert_eq!(h.queue.get(id).await.unwrap().retry_count, 1);
}

#[tokio::test]
async fn paused_queue_holds_queued_jobs() {
    let mut h = harness(|_| {}).await;
    h.queue.start().await.unwrap();
    h.queue.pause().await.unwrap();

    let id = h
        .queue
        .enqueue(Submission::new(b"later".to_vec()), Priority::Critical)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.queue.counts().await.queued, 1);
    assert_eq!(h.backend.submit_count(), 0);

    h.queue.resume().await.unwrap();
    next_matching(&mut h.events, completed(id)).await;
    h.queue.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_deadline_interrupts_in_flight_jobs() {
    let mut h = harness(|c| {
        c.queue.shutdown_timeout_ms = 20;
        c.polling = PollingConfig::fixed(Duration::from_millis(5), Duration::from_secs(30));
    })
    .await;
    h.backend
        .push_status_script(vec![ScriptStep::Processing { percent: 1 }])
        .await;

    let id = h
        .queue
        .enqueue(Submission::new(b"endless".to_vec()), Priority::Normal)
        .await
        .unwrap();
    h.queue.start().await.unwrap();
    next_matching(&mut h.events, entered(id, JobState::Processing)).await;

    h.queue.stop().await.unwrap();

    let job = h.queue.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.last_error.unwrap().code, ErrorCode::Interrupted);
    let failed = h.queue.failures().get(id).await.unwrap();
    assert_eq!(failed.classification, FailureClass::Transient);
}

#[tokio::test]
async fn completed_text_is_routed_to_a_processor() {
    let mut h = harness(|_| {}).await;
    h.queue.start().await.unwrap();

    let receipt = "CORNER SHOP\nMilk 1.99\nBread 2.49\nSUBTOTAL 4.48\nTAX 0.36\nTOTAL 4.84\nThank you";
    let auto = h
        .queue
        .enqueue(Submission::new(receipt.as_bytes().to_vec()), Priority::Normal)
        .await
        .unwrap();
    let hinted = h
        .queue
        .enqueue(
            Submission::new(b"Name: Sam Lee\n[x] Single".to_vec()).with_document_type("w4"),
            Priority::Normal,
        )
        .await
        .unwrap();

    let auto_job = match next_matching(&mut h.events, completed(auto)).await {
        QueueEvent::JobCompleted { job } => job,
        other => panic!("unexpected {other:?}"),
    };
    let hinted_job = match next_matching(&mut h.events, completed(hinted)).await {
        QueueEvent::JobCompleted { job } => job,
        other => panic!("unexpected {other:?}"),
    };
    h.queue.stop().await.unwrap();

    let extraction = auto_job.extraction.unwrap();
    assert_eq!(extraction.document_type, DocumentType::new("receipt"));
    assert_eq!(extraction.data["total_cents"], 484);

    // the hint forces the W-4 processor even though detection is weak
    let extraction = hinted_job.extraction.unwrap();
    assert_eq!(extraction.document_type, DocumentType::new("w4"));
    assert_eq!(extraction.data["filing_status"], "single");

    let cached = h
        .queue
        .cache()
        .peek(&Fingerprint::of(receipt.as_bytes()))
        .await
        .unwrap();
    assert_eq!(cached.document_type, Some(DocumentType::new("receipt")));
}

struct Exploding;

#[async_trait]
impl DocumentProcessor for Exploding {
    const DOCUMENT_TYPE: &'static str = "exploding";
    type Output = serde_json::Value;

    fn metadata(&self) -> ProcessorMetadata {
        ProcessorMetadata::new("Exploding", "0.0.1", 1)
    }

    fn detect(&self, _raw: &str) -> f32 {
        0.0
    }

    async fn process(&self, raw: &str) -> Result<serde_json::Value, ProcessorError> {
        if raw.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        panic!("processor bug on {} bytes", raw.len());
    }
}

#[tokio::test]
async fn panicking_processor_fails_only_its_job() {
    let backend = Arc::new(ScriptedBackend::new());
    let mut builder = PipelineBuilder::new()
        .backend(backend.clone())
        .register(Exploding);
    let config = builder.config_mut();
    config.polling = PollingConfig::fixed(Duration::from_millis(5), Duration::from_secs(5));
    config.queue.concurrency = 1;
    config.queue.auto_retry = false;
    let queue = builder.build().await.unwrap();
    let mut events = queue.subscribe();
    queue.start().await.unwrap();

    let content = b"crash me".to_vec();
    let doomed = queue
        .enqueue(
            Submission::new(content.clone()).with_document_type("exploding"),
            Priority::Normal,
        )
        .await
        .unwrap();
    next_matching(&mut events, entered(doomed, JobState::Failed)).await;

    // same content, so it would wait forever if the fingerprint stayed busy
    let again = queue
        .enqueue(Submission::new(content), Priority::Normal)
        .await
        .unwrap();
    next_matching(&mut events, completed(again)).await;
    queue.stop().await.unwrap();

    let job = queue.get(doomed).await.unwrap();
    let error = job.last_error.unwrap();
    assert_eq!(error.code, ErrorCode::ProcessingFailed);
    assert!(error.message.contains("panicked"));
    assert_eq!(queue.in_flight().await, 0);
    assert_eq!(backend.submit_count(), 2);
}
