use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::state::models::ScanTask;
use crate::state::StateBackend;

/// Poll a scan task until it is terminal or `deadline` elapses.
///
/// Dropping the returned future cancels both the poll interval and the deadline.
pub async fn wait_for_scan(
    state: &dyn StateBackend,
    task_id: &str,
    poll: Duration,
    deadline: Duration,
) -> CoreResult<ScanTask> {
    match tokio::time::timeout(deadline, poll_until_terminal(state, task_id, poll)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(task = task_id, ?deadline, "Timed out waiting for parse task");
            Err(CoreError::ParseTimeout(task_id.to_string()))
        }
    }
}

async fn poll_until_terminal(
    state: &dyn StateBackend,
    task_id: &str,
    poll: Duration,
) -> CoreResult<ScanTask> {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match state.get_scan_task(task_id).await? {
            Some(scan) if scan.task.status.is_terminal() => return Ok(scan),
            Some(_) => {}
            None => return Err(CoreError::not_found("scan task", task_id)),
        }
    }
}
