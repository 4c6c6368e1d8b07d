use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};

use crate::state::models::{AutoDestroyUpdate, EnvStatus, Environment, Task, TaskType};

/// Parse a time-to-live such as `24h`, `90m`, `1d12h` or `3600` (seconds).
///
/// Empty and `0` mean "no auto-destroy".
pub fn parse_ttl(ttl: &str) -> Result<Option<Duration>> {
    let ttl = ttl.trim();
    if ttl.is_empty() || ttl == "0" {
        return Ok(None);
    }
    if let Ok(secs) = ttl.parse::<i64>() {
        if secs < 0 {
            bail!("negative ttl '{}'", ttl);
        }
        return Ok((secs > 0).then(|| Duration::seconds(secs)));
    }

    let mut total = Duration::zero();
    let mut digits = String::new();
    for ch in ttl.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            bail!("invalid ttl '{}'", ttl);
        }
        let n: i64 = digits.parse()?;
        digits.clear();
        total = total
            + match ch {
                's' => Duration::seconds(n),
                'm' => Duration::minutes(n),
                'h' => Duration::hours(n),
                'd' => Duration::days(n),
                _ => bail!("invalid ttl unit '{}' in '{}'", ch, ttl),
            };
    }
    if !digits.is_empty() {
        bail!("ttl '{}' is missing a unit after {}", ttl, digits);
    }
    Ok((total > Duration::zero()).then_some(total))
}

/// Auto-destroy columns to write after `task` completed against `env`.
///
/// `env` must reflect the environment after the task's own status transition.
pub fn auto_destroy_update(
    task: &Task,
    env: &Environment,
    now: DateTime<Utc>,
) -> Result<Option<AutoDestroyUpdate>> {
    match task.task_type {
        TaskType::Destroy if env.status == EnvStatus::Inactive => {
            Ok(Some(AutoDestroyUpdate::clear()))
        }
        TaskType::Apply if env.status == EnvStatus::Active && env.auto_destroy_at.is_none() => {
            Ok(parse_ttl(&env.ttl)?.map(|ttl| AutoDestroyUpdate::schedule(now + ttl)))
        }
        _ => Ok(None),
    }
}
