use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

use crate::compliance::{MergedStatus, ScanResultView};
use crate::lifecycle::{IngestReport, StepOutcome};
use crate::state::models::{
    action, Environment, PolicyStatus, ResourceDrift, Task, TaskChange, TaskOutput, TaskResource,
    TaskStatus, Template,
};

/// Print a success message.
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg.green());
}

/// Print an error message.
pub fn print_error(msg: &str) {
    println!("{} {}", "✗".red().bold(), msg.red());
}

/// Pretty-print any serializable value as JSON.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn task_status_colored(status: TaskStatus) -> String {
    match status {
        TaskStatus::Pending => status.as_str().blue().to_string(),
        TaskStatus::Running => status.as_str().cyan().to_string(),
        TaskStatus::Complete => status.as_str().green().to_string(),
        TaskStatus::Failed => status.as_str().red().to_string(),
        TaskStatus::Timeout => status.as_str().yellow().to_string(),
    }
}

fn policy_status_colored(status: &str) -> String {
    match status {
        "passed" => status.green().to_string(),
        "violated" => status.red().to_string(),
        "failed" => status.red().bold().to_string(),
        "suppressed" | "disabled" | "none" => status.dimmed().to_string(),
        "pending" => status.blue().to_string(),
        _ => status.to_string(),
    }
}

// ─── Templates & Environments ───────────────────────────────────────────────

pub fn print_template(template: &Template) {
    println!();
    println!("{} {}", "Template:".bold().cyan(), template.name.bold());
    println!("{}", "─".repeat(60));
    println!("  {:<18} {}", "ID:".bold(), template.id);
    println!("  {:<18} {}", "Org:".bold(), template.org_id);
    println!("  {:<18} {}", "Status:".bold(), template.status);
    println!("  {:<18} {}", "Compliance:".bold(), template.compliance_enabled);
    if !template.repo_addr.is_empty() {
        println!("  {:<18} {}", "Repository:".bold(), template.repo_addr);
    }
    if let Some(ref scan) = template.last_scan_task_id {
        println!("  {:<18} {}", "Last scan:".bold(), scan);
    }
    println!();
}

pub fn print_environment(env: &Environment) {
    println!();
    println!("{} {}", "Environment:".bold().cyan(), env.name.bold());
    println!("{}", "─".repeat(60));
    println!("  {:<18} {}", "ID:".bold(), env.id);
    println!("  {:<18} {}", "Template:".bold(), env.template_id);
    println!("  {:<18} {}", "Status:".bold(), env.status);
    println!("  {:<18} {}", "Compliance:".bold(), env.compliance_enabled);
    if !env.ttl.is_empty() {
        println!("  {:<18} {}", "TTL:".bold(), env.ttl);
    }
    if let Some(at) = env.auto_destroy_at {
        println!("  {:<18} {}", "Auto-destroy:".bold(), at.to_rfc3339());
    }
    for (label, value) in [
        ("Last task:", &env.last_task_id),
        ("Last scan:", &env.last_scan_task_id),
        ("Last resources:", &env.last_res_task_id),
    ] {
        if let Some(id) = value {
            println!("  {:<18} {}", label.bold(), id);
        }
    }
    println!();
}

// ─── Tasks ──────────────────────────────────────────────────────────────────

/// One-line task summary.
pub fn print_task(task: &Task) {
    println!(
        "  {} {} {} on {} ({})",
        "•".cyan(),
        task.task_type.as_str().bold(),
        task.id,
        task.runner_id,
        task_status_colored(task.status)
    );
}

pub fn print_task_detail(
    task: &Task,
    resources: &[TaskResource],
    outputs: &[TaskOutput],
    changes: &[TaskChange],
) {
    println!();
    println!("{} {}", "Task:".bold().cyan(), task.id.bold());
    println!("{}", "─".repeat(80));
    println!("  {:<18} {}", "Type:".bold(), task.task_type);
    println!("  {:<18} {}", "Status:".bold(), task_status_colored(task.status));
    println!("  {:<18} {}", "Template:".bold(), task.template_id);
    if let Some(ref env) = task.env_id {
        println!("  {:<18} {}", "Environment:".bold(), env);
    }
    println!("  {:<18} {}", "Runner:".bold(), task.runner_id);
    if let Some(ref container) = task.container_id {
        println!("  {:<18} {}", "Container:".bold(), container);
    }
    if let Some(ref message) = task.message {
        println!("  {:<18} {}", "Message:".bold(), message);
    }

    if !resources.is_empty() {
        println!();
        println!(
            "  {:<45} {:<25} {}",
            "ADDRESS".bold(),
            "TYPE".bold(),
            "PROVIDER".bold()
        );
        for r in resources {
            let provider_short = r.provider.split('/').next_back().unwrap_or(&r.provider);
            println!(
                "  {:<45} {:<25} {}",
                r.address,
                r.resource_type,
                provider_short.trim_end_matches('"').dimmed()
            );
        }
    }

    if !outputs.is_empty() {
        println!();
        println!("  {}:", "Outputs".bold());
        for o in outputs {
            let value = if o.sensitive {
                "(sensitive)".dimmed().to_string()
            } else {
                o.value_json.clone()
            };
            println!("    {:<20} = {}", o.name, value);
        }
    }

    if !changes.is_empty() {
        println!();
        println!("  {}:", "Planned changes".bold());
        for c in changes {
            let icon = match c.action.as_str() {
                action::CREATE => "+".green().bold(),
                action::UPDATE => "~".yellow().bold(),
                action::DELETE => "-".red().bold(),
                action::REPLACE => "-/+".magenta().bold(),
                action::READ => "<=".cyan().bold(),
                _ => "?".normal(),
            };
            println!("    {} {}", icon, c.address);
        }
    }

    println!("{}", "─".repeat(80));
    println!();
}

pub fn print_drift(drift: &[ResourceDrift]) {
    if drift.is_empty() {
        println!("{}", "No drift recorded.".green());
        return;
    }
    println!();
    println!("{}", "Drifted resources".bold().yellow());
    for d in drift {
        println!(
            "  {} {} {}",
            "~".yellow().bold(),
            d.address.bold(),
            d.detected_at.to_rfc3339().dimmed()
        );
    }
    println!();
}

/// Print per-step ingestion outcomes.
pub fn print_ingest_report(report: &IngestReport) {
    for (step, outcome) in &report.steps {
        let glyph = match outcome {
            StepOutcome::Done => "✓".green().bold(),
            StepOutcome::Absent | StepOutcome::Skipped => "-".dimmed(),
            StepOutcome::Failed(_) => "✗".red().bold(),
        };
        println!("  {} {:<14} {}", glyph, step, outcome);
    }
}

// ─── Compliance ─────────────────────────────────────────────────────────────

pub fn print_scan_result(view: &ScanResultView) {
    println!();
    println!(
        "{} {}",
        "Compliance:".bold().cyan(),
        policy_status_colored(view.policy_status.as_str())
    );
    if let Some(ref scan) = view.task {
        println!("  {:<18} {}", "Scan task:".bold(), scan.task.id);
    }
    if view.policy_status == MergedStatus::Pending || view.groups.is_empty() {
        println!();
        return;
    }

    for group in &view.groups {
        println!("{}", "─".repeat(80));
        println!(
            "  {} ({} passed, {} violated, {} failed, {} suppressed)",
            group.name.bold(),
            group.summary.passed,
            group.summary.violated,
            group.summary.failed,
            group.summary.suppressed
        );
        for row in &group.list {
            println!(
                "    {:<40} {:<8} {}",
                row.policy_name,
                row.result.severity,
                policy_status_colored(row.result.status.as_str())
            );
            if matches!(
                row.result.status,
                PolicyStatus::Violated | PolicyStatus::Failed
            ) && !row.result.message.is_empty()
            {
                println!("      {}", row.result.message.dimmed());
            }
        }
    }
    println!();
    println!("  {} result(s) total.", view.total);
    println!();
}
