use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use opguard::cancellation::{CancelReason, CancellationScope, OperationState, ProgressUpdate};
use opguard::checkpoint::{RollbackScope, SharedState};
use opguard::error::{AuditLog, SqliteAuditLog};
use opguard::logging::init_logging;
use opguard::notification::{NotificationHub, TracingSink};
use opguard::retry::{BackoffStrategy, RetryPolicy};
use opguard::ui::{format_elapsed, severity_label, state_label, ConsoleSink};
use opguard::{OpguardConfig, OperationRequest, OperationSupervisor};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "opguard")]
#[command(about = "Fault-tolerant operation runner: retries, circuit breakers, checkpoints and cancellation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to opguard.toml in the platform config dir)
    #[arg(long, global = true, env = "OPGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a demo document edit through the full resilience stack
    Simulate {
        /// Attempts that fail before the edit succeeds
        #[arg(short, long, default_value = "2")]
        failures: u32,

        /// Error message the failing attempts report
        #[arg(long, default_value = "connection reset by peer")]
        error_message: String,

        /// Retry policy to run under
        #[arg(long, default_value = "network")]
        operation_type: String,

        /// Service name for the circuit breaker
        #[arg(long, default_value = "document-store")]
        service: String,

        /// Steps of the edit once an attempt succeeds
        #[arg(long, default_value = "5")]
        steps: u32,

        /// Time spent per step (e.g. 200ms, 1s)
        #[arg(long, default_value = "200ms", value_parser = humantime::parse_duration)]
        step_delay: Duration,

        /// Cancel the operation with reason timeout after this long
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,

        /// Cancel the operation as the user after this long
        #[arg(long, value_parser = humantime::parse_duration)]
        cancel_after: Option<Duration>,

        /// Roll back on any failure, not only severe ones
        #[arg(long)]
        rollback: bool,
    },

    /// Print the delay schedule of a backoff strategy
    Backoff {
        /// fixed, linear, exponential, exponential_jitter or fibonacci
        #[arg(short, long, default_value = "exponential", value_parser = str::parse::<BackoffStrategy>)]
        strategy: BackoffStrategy,

        #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
        base: Duration,

        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        max: Duration,

        #[arg(long, default_value = "2.0")]
        multiplier: f64,

        /// Relative jitter range (0.1 = ±10%)
        #[arg(long, default_value = "0.1")]
        jitter: f64,

        /// Total attempts, including the first one
        #[arg(short, long, default_value = "6")]
        attempts: u32,
    },

    /// Print the effective retry policies as JSON
    Policies,

    /// List recent entries of the error audit log
    Audit {
        /// Maximum entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Only entries of this operation
        #[arg(long)]
        operation: Option<String>,

        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if !cfg!(feature = "color-output") {
        colored::control::set_override(false);
    }

    let mut config =
        OpguardConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.debug {
        config.logging.level = "debug".to_string();
    }
    if cli.json_logs {
        config.logging.json = true;
    }
    let _log_guard = init_logging(&config.logging)?;

    match cli.command {
        Commands::Simulate {
            failures,
            error_message,
            operation_type,
            service,
            steps,
            step_delay,
            timeout,
            cancel_after,
            rollback,
        } => {
            let request = OperationRequest::new(operation_type, service)
                .with_scope(RollbackScope::DocumentState)
                .with_total_steps(steps)
                .with_agents(["editor"]);
            let request = match timeout {
                Some(timeout) => request.with_timeout(timeout),
                None => request,
            };
            let request = if rollback {
                request.require_rollback()
            } else {
                request
            };
            simulate(&config, request, failures, error_message, step_delay, cancel_after).await
        }
        Commands::Backoff {
            strategy,
            base,
            max,
            multiplier,
            jitter,
            attempts,
        } => print_backoff(strategy, base, max, multiplier, jitter, attempts),
        Commands::Policies => print_policies(&config),
        Commands::Audit {
            limit,
            operation,
            json,
        } => print_audit(&config, limit, operation.as_deref(), json),
    }
}

async fn simulate(
    config: &OpguardConfig,
    request: OperationRequest,
    failures: u32,
    error_message: String,
    step_delay: Duration,
    cancel_after: Option<Duration>,
) -> Result<()> {
    let notifications = Arc::new(NotificationHub::new());
    if cfg!(feature = "progress-bars") {
        notifications.register(Arc::new(ConsoleSink::new()));
    } else {
        notifications.register(Arc::new(TracingSink));
    }

    let supervisor = Arc::new(OperationSupervisor::from_config(config, notifications)?);
    setup_signal_handlers(Arc::clone(&supervisor))?;

    let document = SharedState::new(json!({
        "title": "Quarterly report",
        "sections": ["summary"],
    }));
    supervisor.register_accessor(RollbackScope::DocumentState, Arc::new(document.clone()))?;

    let operation_id = request.operation_id.clone();
    let operation_type = request.operation_type.clone();
    let total_steps = request.total_steps.unwrap_or(1).max(1);

    println!(
        "{} {} ({} on {})",
        "Starting operation".bold(),
        operation_id,
        operation_type,
        request.service
    );
    println!("Document before: {}", document.get());

    if let Some(after) = cancel_after {
        let orchestrator = Arc::clone(supervisor.orchestrator());
        let id = operation_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = orchestrator.cancel(
                &id,
                CancelReason::UserRequested,
                "cancelled from the command line",
                CancellationScope::OperationAndChildren,
            );
        });
    }

    let outcome = supervisor
        .run_operation(request, |ctx| {
            let document = document.clone();
            let error_message = error_message.clone();
            async move {
                if ctx.attempt <= failures {
                    ctx.token
                        .run_until_cancelled(tokio::time::sleep(step_delay))
                        .await?;
                    anyhow::bail!("{} (attempt {})", error_message, ctx.attempt);
                }

                for step in 1..=total_steps {
                    ctx.report(
                        ProgressUpdate::new()
                            .state(OperationState::DocumentUpdating)
                            .step(format!("writing section {}/{}", step, total_steps))
                            .step_number(step)
                            .percentage(f64::from(step - 1) * 100.0 / f64::from(total_steps)),
                    );
                    document.update(|doc| {
                        if let Some(sections) = doc["sections"].as_array_mut() {
                            sections.push(json!(format!("section-{}", step)));
                        }
                    });
                    ctx.token
                        .run_until_cancelled(tokio::time::sleep(step_delay))
                        .await?;
                }
                ctx.report(ProgressUpdate::new().percentage(100.0).step("done"));
                Ok(document.get())
            }
        })
        .await;

    let stats = supervisor.engine().stats_for(&operation_type);
    println!();
    println!("Document after:  {}", document.get());
    println!(
        "Attempts: {}  successes: {}  failures: {}  total backoff: {}",
        stats.attempts,
        stats.successes,
        stats.failures,
        format_elapsed(stats.total_delay)
    );

    match outcome {
        Ok(_) => {
            println!("{} {}", "✓".green(), state_label(OperationState::Completed));
            Ok(())
        }
        Err(failure) => {
            let state = failure
                .final_state()
                .map(|s| state_label(s).to_string())
                .unwrap_or_else(|| "not started".to_string());
            println!("{} {}", "✗".red(), state);
            if let Some(response) = &failure.response {
                println!("{}", serde_json::to_string_pretty(response)?);
            }
            Err(anyhow::Error::new(failure)).context(format!("Operation {} failed", operation_id))
        }
    }
}

fn print_backoff(
    strategy: BackoffStrategy,
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    attempts: u32,
) -> Result<()> {
    let mut policy = RetryPolicy::new("cli")
        .with_max_attempts(attempts)
        .with_backoff(strategy, base, max);
    policy.multiplier = multiplier;
    policy.jitter = jitter;
    policy.validate()?;

    println!(
        "{} strategy={} base={} max={} multiplier={} jitter={}",
        "Backoff schedule".bold(),
        strategy.as_str(),
        humantime::format_duration(base),
        humantime::format_duration(max),
        multiplier,
        jitter
    );
    let mut total = Duration::ZERO;
    for (i, delay) in policy.schedule().into_iter().enumerate() {
        total += delay;
        println!(
            "  before attempt {:>2}: {:>10}  (cumulative {})",
            i + 2,
            format_elapsed(delay),
            format_elapsed(total)
        );
    }
    Ok(())
}

fn print_policies(config: &OpguardConfig) -> Result<()> {
    let registry = config.retry.build_registry()?;
    let mut policies: Vec<RetryPolicy> = registry.all().iter().map(|p| (**p).clone()).collect();
    policies.sort_by(|a, b| a.operation_type.cmp(&b.operation_type));
    println!("{}", serde_json::to_string_pretty(&policies)?);
    Ok(())
}

fn print_audit(
    config: &OpguardConfig,
    limit: usize,
    operation: Option<&str>,
    as_json: bool,
) -> Result<()> {
    let path = config.audit.effective_path();
    if !path.exists() {
        println!("No audit log at {}", path.display());
        return Ok(());
    }
    let log = SqliteAuditLog::open(&path)?;
    let entries = match operation {
        Some(operation_id) => log.for_operation(operation_id)?,
        None => log.recent(limit)?,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("Audit log is empty");
        return Ok(());
    }

    for entry in entries.iter().take(limit) {
        let record = &entry.record;
        println!(
            "{} {} {:<8} {:<20} {}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.short_id().dimmed(),
            severity_label(record.severity),
            record.category.as_str(),
            record.message
        );
        let mut details = vec![format!("handler {}", entry.response.handler)];
        if let Some(operation_id) = &record.operation_id {
            details.push(format!("operation {}", operation_id));
        }
        if let Some(reference) = &entry.response.support_reference {
            details.push(format!("escalated {}", reference));
        }
        if entry.response.rolled_back {
            details.push("rolled back".to_string());
        }
        println!("    {}", details.join(", ").dimmed());
    }
    Ok(())
}

fn setup_signal_handlers(supervisor: Arc<OperationSupervisor>) -> Result<()> {
    use signal_hook::{consts::SIGINT, iterator::Signals};

    let mut signals = Signals::new([SIGINT])?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            if sig == SIGINT {
                eprintln!("\n{}", "Interrupt received, cancelling active operations...".yellow());
                let cancelled = supervisor.shutdown();
                tracing::info!(cancelled, "Shutdown requested by SIGINT");
            }
        }
    });

    Ok(())
}
