//! Live progress and completion events
//!
//! Events go out on a broadcast channel, best effort: a publish with no
//! subscribers is dropped and a slow subscriber skips what it lagged behind.
//! The execution store stays the durable record of every run.

use crate::core::ExecutionStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};
use uuid::Uuid;

/// Audience of an event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Channel {
    User(String),
    Execution(Uuid),
    Pipeline(String),
    Broadcast,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::User(id) => write!(f, "user:{}", id),
            Channel::Execution(id) => write!(f, "execution:{}", id),
            Channel::Pipeline(id) => write!(f, "pipeline:{}", id),
            Channel::Broadcast => write!(f, "broadcast"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// Events emitted over the lifetime of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Started {
        execution_id: Uuid,
        pipeline_id: String,
        total_steps: usize,
    },
    Progress {
        execution_id: Uuid,
        step_id: String,
        percent: u8,
        records_processed: u64,
    },
    Completed {
        execution_id: Uuid,
        pipeline_id: String,
        success: bool,
        stats: ExecutionStats,
        errors: Vec<String>,
        warnings: Vec<String>,
        duration_ms: u64,
    },
    /// Out-of-band alert, not tied to a single step
    Notification {
        level: NotificationLevel,
        title: String,
        message: String,
    },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::Started { .. } => "started",
            PipelineEvent::Progress { .. } => "progress",
            PipelineEvent::Completed { .. } => "completed",
            PipelineEvent::Notification { .. } => "notification",
        }
    }

    /// Whether a user's inbox should receive this event
    fn forwards_to_inbox(&self) -> bool {
        matches!(
            self,
            PipelineEvent::Completed { .. } | PipelineEvent::Notification { .. }
        )
    }
}

/// An event together with where it was sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub channel: Channel,
    pub event: PipelineEvent,
    pub published_at: DateTime<Utc>,
}

/// Durable per-user inbox owned by the surrounding application
#[async_trait::async_trait]
pub trait InboxSink: Send + Sync {
    async fn deliver(&self, user_id: &str, event: &PipelineEvent) -> anyhow::Result<()>;
}

/// Synchronous hook invoked for every event of one run
pub trait ProgressCallback: Send + Sync {
    fn on_event(&self, event: &PipelineEvent);
}

/// Fans events out to channel subscribers and user inboxes
#[derive(Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<EventEnvelope>,
    inbox: Option<Arc<dyn InboxSink>>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, inbox: None }
    }

    pub fn with_inbox(mut self, inbox: Arc<dyn InboxSink>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    /// Publish one event; returns how many subscribers saw it
    pub fn publish(&self, channel: Channel, event: PipelineEvent) -> usize {
        debug!(channel = %channel, event = event.name(), "Publishing event");
        let envelope = EventEnvelope {
            channel,
            event,
            published_at: Utc::now(),
        };
        // An error only means nobody is listening
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Publish a run event to the execution, pipeline and (if any) user channels
    pub async fn publish_run_event(
        &self,
        pipeline_id: &str,
        execution_id: Uuid,
        triggered_by: Option<&str>,
        event: PipelineEvent,
    ) {
        self.publish(Channel::Execution(execution_id), event.clone());
        self.publish(Channel::Pipeline(pipeline_id.to_string()), event.clone());

        if let Some(user_id) = triggered_by {
            self.forward_to_inbox(user_id, &event);
            self.publish(Channel::User(user_id.to_string()), event);
        }
    }

    /// Send a notification to one user, or to everyone when `user_id` is `None`
    pub async fn notify(
        &self,
        user_id: Option<&str>,
        level: NotificationLevel,
        title: impl Into<String>,
        message: impl Into<String>,
    ) {
        let event = PipelineEvent::Notification {
            level,
            title: title.into(),
            message: message.into(),
        };

        match user_id {
            Some(user_id) => {
                self.forward_to_inbox(user_id, &event);
                self.publish(Channel::User(user_id.to_string()), event);
            }
            None => {
                self.publish(Channel::Broadcast, event);
            }
        }
    }

    /// Hand the event to the inbox in the background; the caller never waits on it
    fn forward_to_inbox(&self, user_id: &str, event: &PipelineEvent) {
        let Some(inbox) = self.inbox.clone() else {
            return;
        };
        if !event.forwards_to_inbox() {
            return;
        }
        let user_id = user_id.to_string();
        let event = event.clone();
        tokio::spawn(async move {
            if let Err(e) = inbox.deliver(&user_id, &event).await {
                warn!(user_id = %user_id, event = event.name(), "Inbox delivery failed: {:#}", e);
            }
        });
    }

    /// Subscribe to every channel
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            channel: None,
        }
    }

    /// Subscribe to a single channel
    pub fn subscribe_to(&self, channel: Channel) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            channel: Some(channel),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Receiving end of a subscription
pub struct EventSubscription {
    receiver: broadcast::Receiver<EventEnvelope>,
    channel: Option<Channel>,
}

impl EventSubscription {
    fn matches(&self, envelope: &EventEnvelope) -> bool {
        self.channel.as_ref().map_or(true, |c| *c == envelope.channel)
    }

    /// Next matching event; `None` once the publisher is gone
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if self.matches(&envelope) => return Some(envelope),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    warn!("Event subscriber lagged, dropped {} events", n);
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already buffered, without waiting
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) if self.matches(&envelope) => return Some(envelope),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => {
                    warn!("Event subscriber lagged, dropped {} events", n);
                    continue;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything currently buffered
    pub fn drain(&mut self) -> Vec<EventEnvelope> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
