//! Test: background runs through the queue and run service

use crate::helpers::*;
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use stepline::core::config::QueueConfig;
use stepline::events::{Channel, EventPublisher, NotificationLevel, PipelineEvent};
use stepline::queue::{
    BackoffStrategy, InMemoryDefinitions, JobHandle, JobOutcome, JobWorker, PipelineJobWorker, QueueJob,
};
use stepline::trigger::{RunMode, RunService, RunTicket};
use stepline::{ExecutionStatus, JobOptions, JobPayload, JobState, PipelineError, QueueDispatcher};

fn run_service(t: &TestEngine, workers: usize) -> RunService {
    let definitions: Arc<InMemoryDefinitions> = Arc::new(
        vec![
            pipeline("good", vec![append_step("a", 1), append_step("b", 2)]),
            pipeline("bad", vec![failing_step("x", 1)]),
        ]
        .into_iter()
        .collect(),
    );
    let worker = PipelineJobWorker::new(t.engine.clone(), definitions.clone());
    let queue = QueueDispatcher::new(QueueConfig::default(), workers, Arc::new(worker))
        .with_events(t.events.clone());
    RunService::new(t.engine.clone(), definitions, Arc::new(queue))
}

/// Worker whose every attempt errors, recording when it was called
#[derive(Default)]
struct AlwaysDown {
    attempts: Mutex<Vec<Instant>>,
}

#[async_trait]
impl JobWorker for AlwaysDown {
    async fn process(&self, _job: &QueueJob, _handle: JobHandle) -> anyhow::Result<JobOutcome> {
        self.attempts.lock().unwrap().push(Instant::now());
        anyhow::bail!("database unavailable")
    }
}

/// Worker that records the pipeline of every job it picks up
#[derive(Default)]
struct PickupOrder {
    picked: Mutex<Vec<String>>,
}

#[async_trait]
impl JobWorker for PickupOrder {
    async fn process(&self, job: &QueueJob, _handle: JobHandle) -> anyhow::Result<JobOutcome> {
        self.picked.lock().unwrap().push(job.payload.pipeline_id.clone());
        Ok(JobOutcome {
            execution_id: uuid::Uuid::new_v4(),
            status: ExecutionStatus::Completed,
            success: true,
        })
    }
}

#[tokio::test]
async fn test_sync_request_returns_result() {
    let t = test_engine();
    let service = run_service(&t, 1);

    let ticket = service
        .request_run("good", json!([]), Some("carol".to_string()), RunMode::Sync)
        .await
        .unwrap();

    let RunTicket::Finished(result) = ticket else {
        panic!("Expected a finished run");
    };
    assert_run_completed(&result);
    assert_visit_order(&result, &["a", "b"]);

    let record = service.get_execution(result.execution_id).await.unwrap();
    assert_eq!(record.triggered_by.as_deref(), Some("carol"));
}

#[tokio::test]
async fn test_async_request_runs_in_background() {
    let t = test_engine();
    let service = run_service(&t, 2);
    service.queue().start();

    let ticket = service
        .request_run("good", json!([{"id": 1}]), None, RunMode::Async)
        .await
        .unwrap();
    assert!(ticket.execution_id().is_none());
    let job_id = ticket.job_id().unwrap();

    let job = service.queue().wait_for_job(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 1);
    assert_eq!(job.progress, 100);

    let outcome = job.outcome.unwrap();
    assert!(outcome.success);
    let record = service.get_execution(outcome.execution_id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(
        record.output_snapshot,
        Some(json!([{"id": 1}, {"step": "a"}, {"step": "b"}]))
    );
    assert_eq!(service.list_executions("good").await.unwrap().len(), 1);

    service.queue().shutdown().await;
}

/// A pipeline that fails is a finished job, not a job to retry
#[tokio::test]
async fn test_failed_run_is_not_retried_by_queue() {
    let t = test_engine();
    let service = run_service(&t, 1);
    service.queue().start();

    let job_id = service
        .request_run("bad", json!([]), None, RunMode::Async)
        .await
        .unwrap()
        .job_id()
        .unwrap();
    let job = service.queue().wait_for_job(job_id).await.unwrap();

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 1);
    assert_eq!(job.outcome.unwrap().status, ExecutionStatus::Failed);
    assert_eq!(t.calls.count("x"), 1);
}

#[tokio::test]
async fn test_unknown_pipeline_sync_is_not_found() {
    let t = test_engine();
    let service = run_service(&t, 1);

    let err = service
        .request_run("missing", json!([]), None, RunMode::Sync)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::NotFound(_)));
}

/// Exhausted jobs fail for good and raise one notification
#[tokio::test]
async fn test_exhausted_job_fails_permanently() {
    let events = EventPublisher::new(64);
    let mut broadcast = events.subscribe_to(Channel::Broadcast);
    let worker = Arc::new(AlwaysDown::default());
    let queue = QueueDispatcher::new(QueueConfig::default(), 1, worker.clone()).with_events(events);
    queue.start();

    let options = JobOptions::default()
        .with_max_attempts(3)
        .with_backoff(BackoffStrategy::Fixed { delay_ms: 5 });
    let job_id = queue
        .enqueue(JobPayload::inline("any", json!([]), None), options)
        .unwrap();
    let job = queue.wait_for_job(job_id).await.unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 3);
    assert!(job.last_error.as_deref().unwrap().contains("database unavailable"));
    match job.exhausted_error() {
        Some(PipelineError::QueueExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("Expected exhausted error, got {:?}", other),
    }

    // Nothing picks it up again
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(worker.attempts.lock().unwrap().len(), 3);
    assert_eq!(queue.job(job_id).unwrap().state, JobState::Failed);
    assert_eq!(queue.counts().failed, 1);

    let envelope = broadcast.recv().await.unwrap();
    assert!(matches!(
        envelope.event,
        PipelineEvent::Notification {
            level: NotificationLevel::Error,
            ..
        }
    ));
    assert!(broadcast.try_recv().is_none());

    queue.shutdown().await;
}

/// Delays between attempts grow exponentially
#[tokio::test]
async fn test_exponential_backoff_between_attempts() {
    let worker = Arc::new(AlwaysDown::default());
    let queue = QueueDispatcher::new(QueueConfig::default(), 1, worker.clone());
    queue.start();

    let options = JobOptions::default()
        .with_max_attempts(3)
        .with_backoff(BackoffStrategy::Exponential {
            base_ms: 40,
            max_ms: 10_000,
        });
    let job_id = queue
        .enqueue(JobPayload::inline("any", json!([]), None), options)
        .unwrap();
    queue.wait_for_job(job_id).await.unwrap();

    let attempts = worker.attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 3);
    assert!(attempts[1] - attempts[0] >= Duration::from_millis(40));
    assert!(attempts[2] - attempts[1] >= Duration::from_millis(80));

    queue.shutdown().await;
}

/// Lower priority values are picked first; ties keep submission order
#[tokio::test]
async fn test_priority_order() {
    let worker = Arc::new(PickupOrder::default());
    let queue = QueueDispatcher::new(QueueConfig::default(), 1, worker.clone());

    let mut ids = Vec::new();
    for (pipeline, priority) in [("low", 10), ("first", 1), ("second", 1), ("mid", 5)] {
        let options = JobOptions::default().with_priority(priority);
        ids.push(
            queue
                .enqueue(JobPayload::inline(pipeline, json!([]), None), options)
                .unwrap(),
        );
    }
    assert_eq!(queue.counts().waiting, 4);

    queue.start();
    for id in ids {
        queue.wait_for_job(id).await.unwrap();
    }

    assert_eq!(
        *worker.picked.lock().unwrap(),
        vec!["first", "second", "mid", "low"]
    );
    queue.shutdown().await;
}

#[tokio::test]
async fn test_closed_queue_rejects_jobs() {
    let t = test_engine();
    let service = run_service(&t, 1);
    service.queue().start();
    service.queue().shutdown().await;

    let err = service
        .request_run("good", json!([]), None, RunMode::Async)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Queue(_)));
}
