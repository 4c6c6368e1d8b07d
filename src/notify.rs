use async_trait::async_trait;

use crate::state::models::{Task, TaskStatus};

/// Events the lifecycle reports to the notification dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    TaskComplete,
    TaskFailed,
    TaskTimeout,
    Drift,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::TaskComplete => "task_complete",
            Event::TaskFailed => "task_failed",
            Event::TaskTimeout => "task_timeout",
            Event::Drift => "drift",
        }
    }

    /// Status event for a terminal task status.
    pub fn for_status(status: TaskStatus) -> Option<Event> {
        match status {
            TaskStatus::Complete => Some(Event::TaskComplete),
            TaskStatus::Failed => Some(Event::TaskFailed),
            TaskStatus::Timeout => Some(Event::TaskTimeout),
            TaskStatus::Pending | TaskStatus::Running => None,
        }
    }
}

/// Fire-and-forget notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: Event, task: &Task);
}

/// Notifier that only records events in the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: Event, task: &Task) {
        tracing::info!(
            event = event.as_str(),
            task = %task.id,
            task_type = %task.task_type,
            env = task.env_id.as_deref().unwrap_or("-"),
            "Task notification"
        );
    }
}
