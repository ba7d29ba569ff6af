//! Command-line interface for threadflow.
//!
//! Provides commands for registering runs from Slack triggers, executing
//! them (one at a time or through the worker pool), and inspecting state.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::ThreadRef;
use crate::config::{AppConfig, Credentials};
use crate::core::{JobExecutor, JobRunner, Orchestrator, WorkerPool};
use crate::domain::{NewRun, RunStatus, WorkflowRun};
use crate::store::{RunStore, SqliteRunStore};

/// threadflow - Slack thread to Notion document workflows
#[derive(Parser, Debug)]
#[command(name = "threadflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register a run for a Slack message
    Create {
        /// Slack channel id
        #[arg(long)]
        channel: String,

        /// Timestamp of the triggering message
        #[arg(long)]
        message: String,

        /// Thread timestamp (defaults to the message timestamp)
        #[arg(long)]
        thread_ts: Option<String>,

        /// Template id (falls back to the configured default)
        #[arg(short, long)]
        template: Option<String>,

        /// Workflow name (defaults to the configured workflow)
        #[arg(short, long)]
        workflow: Option<String>,
    },

    /// Execute a single run
    Execute {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Execute all pending runs through the worker pool
    Work {
        /// Maximum number of runs to pick up
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = AppConfig::load()?;

        match self.command {
            Commands::Create {
                channel,
                message,
                thread_ts,
                template,
                workflow,
            } => create_run(&config, channel, message, thread_ts, template, workflow).await,
            Commands::Execute { run_id } => execute_run(&config, &run_id).await,
            Commands::Work { limit } => work(&config, limit).await,
            Commands::Status { run_id } => show_status(&config, &run_id).await,
            Commands::Runs { limit } => list_runs(&config, limit).await,
            Commands::Config => show_config(&config),
        }
    }
}

fn open_store(config: &AppConfig) -> Result<Arc<SqliteRunStore>> {
    Ok(Arc::new(SqliteRunStore::open(&config.database_path)?))
}

/// Wire the store, pipeline and job system together
fn build_runner(config: &AppConfig, store: Arc<SqliteRunStore>) -> Result<JobRunner> {
    let pipeline = config.standard_pipeline(&Credentials::from_env())?;
    let orchestrator = Orchestrator::new(pipeline, store.clone());
    let executor = Arc::new(JobExecutor::new(store, orchestrator));
    Ok(JobRunner::new(executor, config.job_retry.clone()))
}

fn parse_run_id(run_id: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id).with_context(|| format!("Invalid run ID: {}", run_id))
}

/// Register a new run for a Slack trigger
async fn create_run(
    config: &AppConfig,
    channel: String,
    message: String,
    thread_ts: Option<String>,
    template: Option<String>,
    workflow: Option<String>,
) -> Result<()> {
    if let Some(ref id) = template {
        config.template_registry().resolve(Some(id))?;
    }

    let thread = ThreadRef {
        channel_id: channel.clone(),
        thread_ts: thread_ts.clone().unwrap_or_else(|| message.clone()),
    };

    let store = open_store(config)?;
    let run = store
        .create(NewRun {
            workflow_name: workflow.unwrap_or_else(|| config.workflow_name.clone()),
            slack_channel_id: channel,
            slack_message_id: message,
            slack_thread_ts: thread_ts,
            template_id: template,
            input_data: Some(serde_json::to_value(&thread)?),
        })
        .await?;

    println!("{}", run.id);
    eprintln!("[Run {} created for workflow '{}']", run.id, run.workflow_name);
    Ok(())
}

/// Execute one run under the job system's retry loop
async fn execute_run(config: &AppConfig, run_id: &str) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let store = open_store(config)?;
    let runner = build_runner(config, store)?;

    match runner.run(run_id).await {
        Ok(run) => {
            if let Some(ref output) = run.output_data {
                println!("{}", serde_json::to_string_pretty(output)?);
            }
            eprintln!("\n[Run {} {}]", run.id, run.status);
        }
        Err(err) => {
            eprintln!("\n[Run {} failed: {}]", run_id, err);
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Drain pending runs through the worker pool
async fn work(config: &AppConfig, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let pending = store.pending(limit).await?;

    if pending.is_empty() {
        println!("No pending runs");
        return Ok(());
    }

    let runner = build_runner(config, store)?;
    let pool = WorkerPool::new(runner, config.workers);
    let (tx, rx) = WorkerPool::queue(pending.len());

    for run_id in pending {
        tx.send(run_id)
            .await
            .context("Worker queue closed before all runs were queued")?;
    }
    drop(tx);

    let report = pool.run(rx).await;
    println!(
        "Processed {} runs: {} completed, {} failed",
        report.total(),
        report.completed,
        report.failed
    );

    if report.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Show the status of a run
async fn show_status(config: &AppConfig, run_id: &str) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let store = open_store(config)?;
    let run = store
        .load(run_id)
        .await?
        .with_context(|| format!("Workflow run not found: {}", run_id))?;

    print_run(&run);
    Ok(())
}

fn print_run(run: &WorkflowRun) {
    println!("Run ID: {}", run.id);
    println!("Workflow: {}", run.workflow_name);
    println!("Status: {}", run.status);
    println!(
        "Slack: channel {} message {}{}",
        run.slack_channel_id,
        run.slack_message_id,
        run.slack_thread_ts
            .as_ref()
            .map(|ts| format!(" thread {}", ts))
            .unwrap_or_default()
    );
    if let Some(ref template) = run.template_id {
        println!("Template: {}", template);
    }
    println!("Created: {}", run.created_at);
    if let Some(started) = run.started_at {
        println!("Started: {}", started);
    }
    if let Some(finished) = run.finished_at {
        println!("Finished: {}", finished);
    }
    if run.status == RunStatus::Failed {
        if let Some(ref error) = run.error_message {
            println!("Error: {}", error);
        }
    }

    println!("\nSteps:");
    if run.steps.is_empty() {
        println!("  (none)");
    }
    for step in &run.steps {
        let elapsed = step
            .finished_at
            .map(|done| format!(" ({}ms)", (done - step.started_at).num_milliseconds()))
            .unwrap_or_default();
        println!("  {}: {:?}{}", step.name, step.status, elapsed);
        if let Some(ref error) = step.error {
            println!("    {}", error);
        }
    }
}

/// List recent runs
async fn list_runs(config: &AppConfig, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let runs = store.list(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<22} {:<11} {:<12}", "RUN ID", "WORKFLOW", "STATUS", "CHANNEL");
    println!("{}", "-".repeat(85));

    for run in runs {
        println!(
            "{:<38} {:<22} {:<11} {:<12}",
            run.id, run.workflow_name, run.status, run.slack_channel_id
        );
    }

    Ok(())
}

fn show_config(config: &AppConfig) -> Result<()> {
    let credentials = Credentials::from_env();

    println!("threadflow configuration");
    println!();
    println!(
        "Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Home:        {}", config.home.display());
    println!("Database:    {}", config.database_path.display());
    println!("Workflow:    {}", config.workflow_name);
    println!("Workers:     {}", config.workers);
    println!();
    println!("Job retry:");
    println!("  Max attempts: {}", config.job_retry.max_attempts);
    println!("  Wait:         {}s", config.job_retry.wait_seconds);
    println!("  Retry on:     {}", config.job_retry.retry_on.join(", "));
    println!();
    println!("Step retry policies:");
    for (name, policy) in [
        ("capture", &config.steps.capture),
        ("transform", &config.steps.transform),
        ("publish", &config.steps.publish),
        ("notify", &config.steps.notify),
    ] {
        println!(
            "  {:<10} max_attempts={} base_interval={}s jitter={}",
            name, policy.max_attempts, policy.base_interval, policy.jitter
        );
    }
    println!();
    println!("Services:");
    println!("  Slack:  {}", config.slack.api_base);
    println!("  OpenAI: {} (model {})", config.openai.api_base, config.openai.model);
    println!("  Notion: {} (version {})", config.notion.api_base, config.notion.api_version);
    println!("  Credentials: {:?}", credentials);
    println!();
    println!("Templates:");
    if config.templates.is_empty() {
        println!("  (none configured)");
    }
    for template in &config.templates {
        let marker = if config.default_template.as_deref() == Some(template.id.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!("  {} -> {}{}", template.id, template.destination, marker);
    }

    Ok(())
}
