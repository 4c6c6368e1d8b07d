use std::path::Path;
use std::sync::Arc;

/// Reset SIGPIPE to default behavior so piping (e.g. `iacflow summary | jq`) exits cleanly
/// instead of panicking on broken pipe.
#[cfg(unix)]
fn reset_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use iacflow::artifact::{FsArtifactStore, TaskPaths, ARTIFACT_NAMES};
use iacflow::compliance::{self, report};
use iacflow::config::{self, Settings};
use iacflow::error::CoreError;
use iacflow::lifecycle::{AnyTask, ExecutionOptions, TaskManager};
use iacflow::notify::LogNotifier;
use iacflow::output::formatter;
use iacflow::policy::{try_rule, OpaEvaluator};
use iacflow::runner::{DispatchClient, RunnerRegistry, StaticRunnerRegistry};
use iacflow::state::models::{
    Environment, Policy, PolicyGroup, Scope, Target, TaskStatus, TaskType, Template,
};
use iacflow::state::{SqliteBackend, StateBackend};

/// iacflow - infrastructure task orchestration and compliance
#[derive(Parser)]
#[command(name = "iacflow", version, about, long_about = None)]
struct Cli {
    /// Path to the settings file
    #[arg(short, long, default_value = "iacflow.yaml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Working directory for the state database and artifacts
    #[arg(short, long, default_value = ".iacflow")]
    working_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the working directory and state database
    Init,

    /// Manage templates
    Template {
        #[command(subcommand)]
        command: TemplateCommands,
    },

    /// Manage environments
    Env {
        #[command(subcommand)]
        command: EnvCommands,
    },

    /// Manage policy groups, policies, bindings and suppressions
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },

    /// Request a plan, apply or destroy task
    Run {
        /// Template id
        template: String,
        /// Environment id
        #[arg(short, long)]
        env: Option<String>,
        /// Task type: plan, apply or destroy
        #[arg(short = 't', long = "type", default_value = "plan")]
        task_type: String,
        /// Runner to pin the task to
        #[arg(long)]
        runner: Option<String>,
        /// Per-step timeout in seconds
        #[arg(long)]
        step_timeout: Option<u64>,
    },

    /// Request a compliance scan
    Scan {
        /// Template id
        template: String,
        #[arg(short, long)]
        env: Option<String>,
        /// Only parse the infrastructure, do not evaluate policies
        #[arg(long)]
        parse_only: bool,
    },

    /// Run a parse task and print the parsed infrastructure
    Parse {
        template: String,
        #[arg(short, long)]
        env: Option<String>,
    },

    /// Record that a runner started a task in a container
    Start { task: String, container: String },

    /// Record a task's final status and ingest its results
    Finalize {
        task: String,
        /// complete, failed or timeout
        status: String,
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Ask the runner to stop a task's container
    Stop { task: String },

    /// Re-run result ingestion for a finished task
    Reingest { task: String },

    /// Show a task with its ingested resources, outputs and changes
    Show { task: String },

    /// Show drift recorded for an environment
    Drift { env: String },

    /// Create destroy tasks for environments past their auto-destroy time
    Sweep,

    /// Manage task artifacts in the local store
    Artifact {
        #[command(subcommand)]
        command: ArtifactCommands,
    },

    /// Show the latest compliance results of a template or environment
    Results {
        template: String,
        #[arg(short, long)]
        env: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the compliance scan report as JSON
    Report {
        /// Limit to one policy
        #[arg(long)]
        policy: Option<String>,
        /// Number of days to include, today included
        #[arg(long, default_value_t = report::DEFAULT_REPORT_DAYS)]
        days: i64,
        /// Number of targets in the scan count ranking
        #[arg(long, default_value_t = report::DEFAULT_SHOW_COUNT)]
        show: usize,
    },

    /// Print the policy activity summary as JSON
    Summary,
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// Register a template
    Add {
        name: String,
        #[arg(long, default_value = "default")]
        org: String,
        /// Repository address, for display
        #[arg(long)]
        repo: Option<String>,
        /// Enable compliance scanning
        #[arg(long)]
        compliance: bool,
    },
    /// Show a template
    Show { id: String },
}

#[derive(Subcommand)]
enum EnvCommands {
    /// Register an environment of a template
    Add {
        template: String,
        name: String,
        /// Lifetime after apply, e.g. 12h or 1d12h
        #[arg(long)]
        ttl: Option<String>,
        #[arg(long)]
        compliance: bool,
    },
    /// Show an environment
    Show { id: String },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Create a policy group
    Group {
        name: String,
        #[arg(long, default_value = "default")]
        org: String,
    },
    /// Add a policy to a group from a Rego file
    Add {
        group: String,
        name: String,
        /// Path to the rule source
        #[arg(long)]
        rule: String,
        /// high, medium or low
        #[arg(long, default_value = "medium")]
        severity: String,
        #[arg(long, default_value = "")]
        fix: String,
    },
    /// Bind a group to a template or environment
    Bind {
        group: String,
        #[arg(long, conflicts_with = "env", required_unless_present = "env")]
        template: Option<String>,
        #[arg(long)]
        env: Option<String>,
    },
    /// Evaluate a Rego file against a JSON input file
    Test {
        /// Path to the rule source
        rule: String,
        /// Path to the JSON input document
        input: String,
    },
    /// Suppress a policy on a template or environment
    Suppress {
        policy: String,
        target: String,
        #[arg(long, default_value = "")]
        reason: String,
    },
}

#[derive(Subcommand)]
enum ArtifactCommands {
    /// Store a file as one of a task's artifacts
    Put {
        task: String,
        /// state, plan, provider-schema, tfparse or plan-log
        name: String,
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    #[cfg(unix)]
    reset_sigpipe();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let result = run(&cli).await;
    if let Err(ref e) = result {
        if let Some(core) = e.downcast_ref::<CoreError>() {
            formatter::print_error(&format!("[{}] {}", core.kind(), core));
            std::process::exit(if core.severity() == iacflow::error::Severity::BadRequest {
                2
            } else {
                1
            });
        }
    }
    result
}

async fn run(cli: &Cli) -> Result<()> {
    let settings = config::load_settings(Path::new(&cli.config), &cli.working_dir)?;
    match cli.command {
        Commands::Init => cmd_init(&settings).await,
        Commands::Template { ref command } => cmd_template(&settings, command).await,
        Commands::Env { ref command } => cmd_env(&settings, command).await,
        Commands::Policy { ref command } => cmd_policy(&settings, command).await,
        Commands::Run {
            ref template,
            ref env,
            ref task_type,
            ref runner,
            step_timeout,
        } => {
            let opts = ExecutionOptions {
                runner_id: runner.clone(),
                step_timeout_secs: step_timeout,
            };
            cmd_run(&settings, template, env.as_deref(), task_type, &opts).await
        }
        Commands::Scan {
            ref template,
            ref env,
            parse_only,
        } => cmd_scan(&settings, template, env.as_deref(), parse_only).await,
        Commands::Parse {
            ref template,
            ref env,
        } => cmd_parse(&settings, template, env.as_deref()).await,
        Commands::Start {
            ref task,
            ref container,
        } => cmd_start(&settings, task, container).await,
        Commands::Finalize {
            ref task,
            ref status,
            ref message,
        } => cmd_finalize(&settings, task, status, message.as_deref()).await,
        Commands::Stop { ref task } => cmd_stop(&settings, task).await,
        Commands::Reingest { ref task } => cmd_reingest(&settings, task).await,
        Commands::Show { ref task } => cmd_show(&settings, task).await,
        Commands::Drift { ref env } => cmd_drift(&settings, env).await,
        Commands::Sweep => cmd_sweep(&settings).await,
        Commands::Artifact { ref command } => cmd_artifact(&settings, command).await,
        Commands::Results {
            ref template,
            ref env,
            json,
        } => cmd_results(&settings, template, env.as_deref(), json).await,
        Commands::Report {
            ref policy,
            days,
            show,
        } => cmd_report(&settings, policy.as_deref(), days, show).await,
        Commands::Summary => cmd_summary(&settings).await,
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn open_backend(settings: &Settings) -> Result<Arc<SqliteBackend>> {
    let backend = SqliteBackend::open(&settings.database_path)?;
    backend.initialize().await?;
    Ok(Arc::new(backend))
}

async fn task_manager(settings: &Settings) -> Result<TaskManager> {
    let state = open_backend(settings).await?;
    let registry: Arc<dyn RunnerRegistry> = Arc::new(StaticRunnerRegistry::from_settings(settings));
    let control = DispatchClient::new(Arc::clone(&registry), settings.runner_timeout())?;
    Ok(TaskManager::new(
        state,
        registry,
        Arc::new(control),
        Arc::new(FsArtifactStore::new(&settings.artifact_dir)),
        Arc::new(OpaEvaluator::new(&settings.opa_binary, settings.parse_timeout())),
        Arc::new(LogNotifier),
        settings.clone(),
    ))
}

fn target_of(template: &str, env: Option<&str>) -> Target {
    match env {
        Some(env) => Target::Environment(env.to_string()),
        None => Target::Template(template.to_string()),
    }
}

// ─── Commands ────────────────────────────────────────────────────────────────

async fn cmd_init(settings: &Settings) -> Result<()> {
    std::fs::create_dir_all(&settings.artifact_dir).with_context(|| {
        format!("Failed to create artifact directory {}", settings.artifact_dir)
    })?;
    open_backend(settings).await?;
    formatter::print_success(&format!(
        "State database ready at {}",
        settings.database_path
    ));
    Ok(())
}

async fn cmd_template(settings: &Settings, command: &TemplateCommands) -> Result<()> {
    let backend = open_backend(settings).await?;
    match command {
        TemplateCommands::Add {
            name,
            org,
            repo,
            compliance,
        } => {
            let mut template = Template::new(org, name);
            template.repo_addr = repo.clone().unwrap_or_default();
            template.compliance_enabled = *compliance;
            backend.insert_template(&template).await?;
            formatter::print_success(&format!("Template '{}' created", name));
            println!("{}", template.id);
        }
        TemplateCommands::Show { id } => {
            let template = backend
                .get_template(id)
                .await?
                .ok_or_else(|| CoreError::not_found("template", id))?;
            formatter::print_template(&template);
        }
    }
    Ok(())
}

async fn cmd_env(settings: &Settings, command: &EnvCommands) -> Result<()> {
    let backend = open_backend(settings).await?;
    match command {
        EnvCommands::Add {
            template,
            name,
            ttl,
            compliance,
        } => {
            let tpl = backend
                .get_template(template)
                .await?
                .ok_or_else(|| CoreError::not_found("template", template))?;
            let mut env = Environment::new(&tpl, name);
            if let Some(ttl) = ttl {
                iacflow::lifecycle::scheduler::parse_ttl(ttl)
                    .with_context(|| format!("Invalid ttl '{}'", ttl))?;
                env.ttl = ttl.clone();
            }
            env.compliance_enabled = *compliance;
            backend.insert_environment(&env).await?;
            formatter::print_success(&format!("Environment '{}' created", name));
            println!("{}", env.id);
        }
        EnvCommands::Show { id } => {
            let env = backend
                .get_environment(id)
                .await?
                .ok_or_else(|| CoreError::not_found("environment", id))?;
            formatter::print_environment(&env);
        }
    }
    Ok(())
}

async fn cmd_policy(settings: &Settings, command: &PolicyCommands) -> Result<()> {
    let backend = open_backend(settings).await?;
    match command {
        PolicyCommands::Group { name, org } => {
            let group = PolicyGroup {
                id: uuid::Uuid::new_v4().to_string(),
                org_id: org.clone(),
                name: name.clone(),
            };
            backend.insert_policy_group(&group).await?;
            formatter::print_success(&format!("Policy group '{}' created", name));
            println!("{}", group.id);
        }
        PolicyCommands::Add {
            group,
            name,
            rule,
            severity,
            fix,
        } => {
            let source = std::fs::read_to_string(rule)
                .with_context(|| format!("Failed to read rule file {}", rule))?;
            let policy = Policy {
                id: uuid::Uuid::new_v4().to_string(),
                group_id: group.clone(),
                name: name.clone(),
                severity: severity.clone(),
                rule: source,
                fix_suggestion: fix.clone(),
            };
            backend.insert_policy(&policy).await?;
            formatter::print_success(&format!("Policy '{}' created", name));
            println!("{}", policy.id);
        }
        PolicyCommands::Bind {
            group,
            template,
            env,
        } => {
            let (scope, target) = match (template, env) {
                (_, Some(env)) => (Scope::Environment, env),
                (Some(template), None) => (Scope::Template, template),
                (None, None) => bail!("Either --template or --env is required"),
            };
            backend.bind_policy_group(scope, target, group).await?;
            formatter::print_success(&format!("Group bound to {} {}", scope, target));
        }
        PolicyCommands::Test { rule, input } => {
            let source = std::fs::read_to_string(rule)
                .with_context(|| format!("Failed to read rule file {}", rule))?;
            let input = std::fs::read_to_string(input)
                .with_context(|| format!("Failed to read input file {}", input))?;
            let evaluator = OpaEvaluator::new(&settings.opa_binary, settings.parse_timeout());
            let result = try_rule(&evaluator, &source, &input).await;
            formatter::print_json(&result)?;
        }
        PolicyCommands::Suppress {
            policy,
            target,
            reason,
        } => {
            backend.suppress_policy(policy, target, reason).await?;
            formatter::print_success(&format!("Policy suppressed on {}", target));
        }
    }
    Ok(())
}

async fn cmd_run(
    settings: &Settings,
    template: &str,
    env: Option<&str>,
    task_type: &str,
    opts: &ExecutionOptions,
) -> Result<()> {
    let task_type: TaskType = task_type.parse()?;
    let manager = task_manager(settings).await?;
    let task = manager
        .request_execution(template, env, task_type, opts)
        .await?;
    formatter::print_task(&task);
    Ok(())
}

async fn cmd_scan(
    settings: &Settings,
    template: &str,
    env: Option<&str>,
    parse_only: bool,
) -> Result<()> {
    let manager = task_manager(settings).await?;
    let scan = manager.request_scan(template, env, parse_only).await?;
    formatter::print_task(&scan.task);
    Ok(())
}

async fn cmd_parse(settings: &Settings, template: &str, env: Option<&str>) -> Result<()> {
    let manager = task_manager(settings).await?;
    let parsed = manager.parse_template(template, env).await?;
    formatter::print_json(&parsed)
}

async fn cmd_start(settings: &Settings, task: &str, container: &str) -> Result<()> {
    let manager = task_manager(settings).await?;
    manager.mark_running(task, container).await?;
    formatter::print_success(&format!("Task {} running in {}", task, container));
    Ok(())
}

async fn cmd_finalize(
    settings: &Settings,
    task: &str,
    status: &str,
    message: Option<&str>,
) -> Result<()> {
    let status: TaskStatus = status.parse()?;
    let manager = task_manager(settings).await?;
    let finalized = manager.finalize(task, status, message).await?;
    formatter::print_task(finalized.task.task());
    formatter::print_ingest_report(&finalized.report);
    if finalized.report.has_failures() {
        println!(
            "\n{}",
            "Some results could not be ingested; see the log for details.".yellow()
        );
    }
    Ok(())
}

async fn cmd_stop(settings: &Settings, task: &str) -> Result<()> {
    let manager = task_manager(settings).await?;
    manager.stop(task).await?;
    formatter::print_success(&format!("Stop requested for task {}", task));
    Ok(())
}

async fn cmd_reingest(settings: &Settings, task: &str) -> Result<()> {
    let manager = task_manager(settings).await?;
    let report = manager.reingest(task).await?;
    formatter::print_ingest_report(&report);
    Ok(())
}

async fn cmd_show(settings: &Settings, task: &str) -> Result<()> {
    let manager = task_manager(settings).await?;
    let state = manager.state();
    match manager.locate(task).await? {
        AnyTask::Execution(task) => {
            let resources = state.list_task_resources(&task.id).await?;
            let outputs = state.list_task_outputs(&task.id).await?;
            let changes = state.list_task_changes(&task.id).await?;
            formatter::print_task_detail(&task, &resources, &outputs, &changes);
        }
        AnyTask::Scan(scan) => {
            formatter::print_task_detail(&scan.task, &[], &[], &[]);
            println!("  {:<18} {}", "Policy status:".bold(), scan.policy_status);
        }
    }
    Ok(())
}

async fn cmd_drift(settings: &Settings, env_id: &str) -> Result<()> {
    let backend = open_backend(settings).await?;
    let env = backend
        .get_environment(env_id)
        .await?
        .ok_or_else(|| CoreError::not_found("environment", env_id))?;
    let drift = match env.last_res_task_id {
        Some(ref res_task) => backend.list_drift(res_task).await?,
        None => Vec::new(),
    };
    formatter::print_drift(&drift);
    Ok(())
}

async fn cmd_sweep(settings: &Settings) -> Result<()> {
    let manager = task_manager(settings).await?;
    let created = manager.sweep_auto_destroy(Utc::now()).await?;
    if created.is_empty() {
        println!("{}", "No environments due for auto-destroy.".dimmed());
        return Ok(());
    }
    for task in &created {
        formatter::print_task(task);
    }
    formatter::print_success(&format!("{} destroy task(s) created", created.len()));
    Ok(())
}

async fn cmd_artifact(settings: &Settings, command: &ArtifactCommands) -> Result<()> {
    match command {
        ArtifactCommands::Put { task, name, file } => {
            let manager = task_manager(settings).await?;
            let located = manager.locate(task).await?;
            let paths = TaskPaths::for_task(located.task());
            let Some(logical) = paths.by_name(name) else {
                bail!(
                    "Unknown artifact '{}', expected one of: {}",
                    name,
                    ARTIFACT_NAMES.join(", ")
                );
            };
            let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file))?;
            let store = FsArtifactStore::new(&settings.artifact_dir);
            let blob = store.write(&logical, &bytes).await?;
            tracing::info!(task = %task, artifact = %logical, "Artifact stored");
            formatter::print_success(&format!("Stored {} ({})", logical, blob.display()));
        }
    }
    Ok(())
}

async fn cmd_results(
    settings: &Settings,
    template: &str,
    env: Option<&str>,
    json: bool,
) -> Result<()> {
    let backend = open_backend(settings).await?;
    let view = compliance::scan_result(&*backend, &target_of(template, env)).await?;
    if json {
        return formatter::print_json(&view);
    }
    formatter::print_scan_result(&view);
    Ok(())
}

async fn cmd_report(
    settings: &Settings,
    policy: Option<&str>,
    days: i64,
    show: usize,
) -> Result<()> {
    if days < 1 {
        bail!("--days must be at least 1");
    }
    let backend = open_backend(settings).await?;
    let now = Utc::now();
    let from = report::last_days_midnight(days, now);
    let scan_report = compliance::scan_report(&*backend, policy, from, now, show).await?;
    formatter::print_json(&scan_report)
}

async fn cmd_summary(settings: &Settings) -> Result<()> {
    let backend = open_backend(settings).await?;
    let summary = compliance::policy_summary(&*backend, Utc::now()).await?;
    formatter::print_json(&summary)
}
