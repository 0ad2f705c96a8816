//! Test: live events of a run across channels, inbox and callback

use crate::helpers::*;
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stepline::events::{Channel, EventPublisher, InboxSink, PipelineEvent, ProgressCallback};

#[derive(Default)]
struct RecordingInbox {
    delivered: Mutex<Vec<(String, &'static str)>>,
}

#[async_trait]
impl InboxSink for RecordingInbox {
    async fn deliver(&self, user_id: &str, event: &PipelineEvent) -> anyhow::Result<()> {
        self.delivered
            .lock()
            .unwrap()
            .push((user_id.to_string(), event.name()));
        Ok(())
    }
}

impl RecordingInbox {
    /// Deliveries happen in the background; poll until `count` arrived
    async fn delivered_after(&self, count: usize) -> Vec<(String, &'static str)> {
        for _ in 0..200 {
            let delivered = self.delivered.lock().unwrap().clone();
            if delivered.len() >= count {
                return delivered;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.delivered.lock().unwrap().clone()
    }
}

/// Inbox whose backend never answers
struct HangingInbox;

#[async_trait]
impl InboxSink for HangingInbox {
    async fn deliver(&self, _user_id: &str, _event: &PipelineEvent) -> anyhow::Result<()> {
        std::future::pending().await
    }
}

#[derive(Default)]
struct RecordingCallback {
    events: Mutex<Vec<PipelineEvent>>,
}

impl ProgressCallback for RecordingCallback {
    fn on_event(&self, event: &PipelineEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn tolerant_pipeline() -> stepline::PipelineDefinition {
    pipeline(
        "events",
        vec![
            append_step("a", 1),
            failing_step("b", 2).continue_on_error(true),
            append_step("c", 3),
        ],
    )
}

/// started, one progress per successful step, completed
#[tokio::test]
async fn test_pipeline_channel_sees_run_lifecycle() {
    let t = test_engine();
    let mut subscription = t.events.subscribe_to(Channel::Pipeline("events".to_string()));

    let result = t
        .engine
        .run(&tolerant_pipeline(), json!([]), None)
        .await
        .unwrap();

    let events: Vec<_> = subscription.drain().into_iter().map(|e| e.event).collect();
    let names: Vec<_> = events.iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["started", "progress", "progress", "completed"]);

    match &events[0] {
        PipelineEvent::Started {
            execution_id,
            total_steps,
            ..
        } => {
            assert_eq!(*execution_id, result.execution_id);
            assert_eq!(*total_steps, 3);
        }
        other => panic!("Expected started, got {:?}", other),
    }

    let progress: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Progress { step_id, percent, .. } => Some((step_id.as_str(), *percent)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![("a", 33), ("c", 100)]);

    match &events[3] {
        PipelineEvent::Completed { success, errors, .. } => {
            assert!(*success);
            assert_eq!(errors.len(), 1);
        }
        other => panic!("Expected completed, got {:?}", other),
    }
}

/// User-triggered runs also reach the user's channel and inbox
#[tokio::test]
async fn test_user_channel_and_inbox() {
    let inbox = Arc::new(RecordingInbox::default());
    let t = test_engine_with_events(EventPublisher::new(64).with_inbox(inbox.clone()));
    let mut user = t.events.subscribe_to(Channel::User("bob".to_string()));
    let mut everything = t.events.subscribe();

    let result = t
        .engine
        .run(&tolerant_pipeline(), json!([]), Some("bob".to_string()))
        .await
        .unwrap();

    assert_eq!(user.drain().len(), 4);
    let mut execution = 0;
    for envelope in everything.drain() {
        if envelope.channel == Channel::Execution(result.execution_id) {
            execution += 1;
        }
    }
    assert_eq!(execution, 4);

    let delivered = inbox.delivered_after(1).await;
    assert_eq!(delivered, vec![("bob".to_string(), "completed")]);
}

/// A stuck inbox never holds up the run that feeds it
#[tokio::test]
async fn test_hanging_inbox_does_not_stall_run() {
    let t = test_engine_with_events(EventPublisher::new(64).with_inbox(Arc::new(HangingInbox)));
    let mut user = t.events.subscribe_to(Channel::User("u1".to_string()));

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        t.engine
            .run(&tolerant_pipeline(), json!([]), Some("u1".to_string())),
    )
    .await
    .expect("run should not wait on the inbox")
    .unwrap();

    assert_run_completed(&result);
    assert_eq!(user.drain().len(), 4);
}

/// System runs never touch a user channel
#[tokio::test]
async fn test_system_run_has_no_user_events() {
    let inbox = Arc::new(RecordingInbox::default());
    let t = test_engine_with_events(EventPublisher::new(64).with_inbox(inbox.clone()));
    let mut all = t.events.subscribe();

    t.engine
        .run(&tolerant_pipeline(), json!([]), None)
        .await
        .unwrap();

    assert!(all
        .drain()
        .iter()
        .all(|e| !matches!(e.channel, Channel::User(_))));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(inbox.delivered.lock().unwrap().is_empty());
}

/// The callback sees the same events as the channels, in order
#[tokio::test]
async fn test_callback_receives_every_event() {
    let t = test_engine();
    let callback = RecordingCallback::default();

    t.engine
        .run_with_callback(&tolerant_pipeline(), json!([]), None, Some(&callback))
        .await
        .unwrap();

    let names: Vec<_> = callback
        .events
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.name())
        .collect();
    assert_eq!(names, vec!["started", "progress", "progress", "completed"]);
}

/// A critical abort ends with an unsuccessful completed event
#[tokio::test]
async fn test_aborted_run_reports_failure() {
    let t = test_engine();
    let mut subscription = t.events.subscribe_to(Channel::Pipeline("abort".to_string()));
    let definition = pipeline("abort", vec![failing_step("b", 1), append_step("c", 2)]);

    t.engine.run(&definition, json!([]), None).await.unwrap();

    let events: Vec<_> = subscription.drain().into_iter().map(|e| e.event).collect();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[1], PipelineEvent::Completed { success: false, .. }));
}
