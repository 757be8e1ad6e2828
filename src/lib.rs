//! Job Recovery - dead-letter quarantine and adaptive recovery for background job queues.
//!
//! Jobs that exhaust their primary-queue retries are quarantined, classified and
//! retried on a backoff schedule that respects business hours, holidays and
//! restricted periods. Recurring failures are grouped into patterns.

pub mod cli;
pub mod config;
pub mod error;
pub mod notify;
pub mod queue;
pub mod recovery;
pub mod store;
pub mod validation;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands, ListArgs, OutputFormat, PatternArgs, RetryArgs};
use crate::config::model::{AppConfig, StoreBackend};
use crate::config::{ConfigManager, ConfigReloadEvent, ConfigWatcher};
use crate::notify::{DiscordNotifier, EventSink, Metrics, MetricsServer, RecoveryEvent};
use crate::queue::{IntakeConsumer, RedisPrimaryQueue};
use crate::recovery::{
    DeadLetterJob, JobFilter, Orchestrator, PageRequest, PatternFilter, ScheduleOptions,
};
use crate::store::{MemoryStore, RecoveryStore, RedisStore};

/// Runs the recovery engine with the provided CLI arguments.
pub async fn run(cli: Cli) -> Result<()> {
    setup_logging(cli.log_level())?;

    let config_path = cli.config.as_path();
    match cli.command {
        Commands::Run => run_daemon(config_path).await,
        Commands::ConfigValidate => validate_config(config_path),
        Commands::ConfigShow => show_config(config_path),
        Commands::List(args) => list_jobs(config_path, args).await,
        Commands::Show(args) => {
            let orchestrator = connect(config_path).await?;
            let history = orchestrator
                .job_history(&args.tenant.tenant, args.job_id)
                .await?
                .with_context(|| format!("Job {} not found", args.job_id))?;
            print_json(&history)
        }
        Commands::Stats(args) => {
            let orchestrator = connect(config_path).await?;
            print_json(&orchestrator.get_stats(&args.tenant).await?)
        }
        Commands::Report { tenant, days } => {
            let orchestrator = connect(config_path).await?;
            print_json(
                &orchestrator
                    .get_performance_report(&tenant.tenant, days)
                    .await?,
            )
        }
        Commands::Patterns(args) => list_patterns(config_path, args).await,
        Commands::Retry(args) => retry_job(config_path, args).await,
        Commands::Approve(args) => {
            let orchestrator = connect(config_path).await?;
            let log = orchestrator
                .approve(&args.tenant.tenant, args.log_id, &args.by, args.notes)
                .await?;
            println!("Recovery attempt {} approved by {}.", log.id, args.by);
            Ok(())
        }
        Commands::Reject(args) => {
            let orchestrator = connect(config_path).await?;
            let log = orchestrator
                .reject(&args.tenant.tenant, args.log_id, &args.by, args.notes)
                .await?;
            println!("Recovery attempt {} rejected by {}.", log.id, args.by);
            Ok(())
        }
        Commands::Cancel { job, reason } => {
            let orchestrator = connect(config_path).await?;
            let job = orchestrator
                .cancel(&job.tenant.tenant, job.job_id, reason.as_deref())
                .await?;
            println!("Job {} archived.", job.id);
            Ok(())
        }
        Commands::Assign { job, to } => {
            let orchestrator = connect(config_path).await?;
            let job = orchestrator
                .assign_to(&job.tenant.tenant, job.job_id, to)
                .await?;
            match &job.assigned_to {
                Some(who) => println!("Job {} assigned to {}.", job.id, who),
                None => println!("Job {} unassigned.", job.id),
            }
            Ok(())
        }
        Commands::PatternStatus {
            tenant,
            pattern_id,
            status,
        } => {
            let orchestrator = connect(config_path).await?;
            let pattern = orchestrator
                .set_pattern_status(&tenant.tenant, pattern_id, status)
                .await?;
            println!("Pattern {} is now {}.", pattern.id, pattern.status.as_str());
            Ok(())
        }
        Commands::Sweep => {
            let orchestrator = connect(config_path).await?;
            print_json(&orchestrator.run_sweep().await?)
        }
    }
}

/// Initializes the tracing subscriber for structured logging.
fn setup_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

/// Runs the recovery daemon until Ctrl+C.
async fn run_daemon(config_path: &Path) -> Result<()> {
    info!("Starting recovery engine");

    let config_manager = ConfigManager::new(config_path)?;
    let config = config_manager.get_config();
    let snapshot = config_manager.snapshot().await;

    info!("Configuration loaded and validated");

    let redis_url = snapshot.global.redis.url();
    let store = open_store(&snapshot).await?;
    let queue = Arc::new(RedisPrimaryQueue::new(&redis_url, &snapshot.queue.prefix).await?);
    info!("Connected to Redis");

    let (events, events_rx) = EventSink::channel(snapshot.notifications.event_buffer);
    let orchestrator = Arc::new(Orchestrator::new(&snapshot, store, queue).with_events(events));

    let metrics = Arc::new(Metrics::new()?);
    let discord = snapshot
        .notifications
        .discord
        .as_ref()
        .map(|dc| Arc::new(DiscordNotifier::new(dc)));

    // Start Prometheus metrics server
    if snapshot.prometheus.enabled {
        let port = snapshot.prometheus.port;
        let metrics_server = MetricsServer::new(metrics.clone(), port);
        tokio::spawn(async move {
            if let Err(e) = metrics_server.start().await {
                error!(error = %e, "Prometheus server failed");
            }
        });
        info!(port, "Prometheus metrics server started");
    }

    tokio::spawn(forward_events(events_rx, metrics.clone(), discord));

    // Start intake of exhausted jobs
    if snapshot.queue.intake_enabled {
        let intake = IntakeConsumer::new(
            &redis_url,
            &snapshot.queue.intake_key,
            orchestrator.clone(),
            Duration::from_millis(snapshot.queue.intake_poll_ms),
        )
        .await?;
        tokio::spawn(async move {
            if let Err(e) = intake.run().await {
                error!(error = %e, "Intake consumer failed");
            }
        });
        info!(key = %snapshot.queue.intake_key, "Intake consumer started");
    }

    tokio::spawn(sweep_loop(orchestrator.clone(), config.clone(), metrics));
    info!("Sweeper started");

    // Start config hot-reload watcher; it stops when the handle is dropped
    let (reload_tx, mut reload_rx) = mpsc::channel(10);
    let _config_watcher = ConfigWatcher::new(config.clone(), config_path, reload_tx).start()?;
    info!("Config hot-reload enabled");

    info!("Recovery engine is running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }

            Some(event) = reload_rx.recv() => {
                match event {
                    ConfigReloadEvent::Reloaded => {
                        orchestrator.apply_config(&*config.read().await);
                    }
                    ConfigReloadEvent::ValidationFailed { error_count } => {
                        warn!(error_count, "Configuration reload failed validation");
                    }
                }
            }
        }
    }

    info!("Shutting down recovery engine");
    Ok(())
}

/// Sweeps on the configured interval. The interval is re-read every round so
/// reloads take effect without a restart.
async fn sweep_loop(
    orchestrator: Arc<Orchestrator>,
    config: Arc<RwLock<AppConfig>>,
    metrics: Arc<Metrics>,
) {
    loop {
        let interval = config.read().await.recovery.sweep_interval();
        tokio::time::sleep(interval).await;

        let started = Instant::now();
        if let Err(e) = orchestrator.run_sweep().await {
            error!(error = %e, "Sweep failed");
            continue;
        }
        metrics.observe_sweep(started.elapsed().as_secs_f64());

        match orchestrator.global_stats().await {
            Ok(stats) => metrics.set_job_gauges(&stats),
            Err(e) => warn!(error = %e, "Failed to refresh job gauges"),
        }
    }
}

/// Drains recovery events into metrics and Discord.
async fn forward_events(
    mut rx: mpsc::Receiver<RecoveryEvent>,
    metrics: Arc<Metrics>,
    discord: Option<Arc<DiscordNotifier>>,
) {
    while let Some(event) = rx.recv().await {
        metrics.observe_event(&event);

        if let Some(discord) = &discord {
            if let Err(e) = discord.handle(&event).await {
                warn!(event = event.kind(), error = %e, "Discord notification failed");
            }
        }
    }
}

/// Opens the configured store backend.
async fn open_store(config: &AppConfig) -> Result<Arc<dyn RecoveryStore>> {
    let store: Arc<dyn RecoveryStore> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store; quarantined jobs are lost on restart");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis => Arc::new(
            RedisStore::new(&config.global.redis.url(), &config.store.key_prefix).await?,
        ),
    };
    Ok(store)
}

/// Builds an orchestrator for a one-shot administrative command.
async fn connect(config_path: &Path) -> Result<Orchestrator> {
    let config = config::loader::load_and_validate(config_path)?;
    if config.store.backend == StoreBackend::Memory {
        warn!("Store backend is memory; administrative commands see an empty store");
    }

    let store = open_store(&config).await?;
    let queue = Arc::new(RedisPrimaryQueue::new(&config.global.redis.url(), &config.queue.prefix).await?);
    Ok(Orchestrator::new(&config, store, queue))
}

/// Validates the configuration file and reports any issues.
fn validate_config(config_path: &Path) -> Result<()> {
    let config = config::loader::load_from_path(config_path)?;
    let result = validation::validate_config(&config);

    println!("{}", validation::report::format_report(&result));

    if !result.is_valid() {
        anyhow::bail!(error::ConfigError::ValidationFailed {
            error_count: result.error_count()
        });
    }
    Ok(())
}

/// Displays the parsed configuration.
fn show_config(config_path: &Path) -> Result<()> {
    let config = config::loader::load_and_validate(config_path)?;
    let yaml = serde_yaml::to_string(&config)?;
    println!("{}", yaml);
    Ok(())
}

/// Lists quarantined jobs matching the filters.
async fn list_jobs(config_path: &Path, args: ListArgs) -> Result<()> {
    let orchestrator = connect(config_path).await?;

    let filter = JobFilter {
        status: args.status,
        priority: args.priority,
        failure_type: args.failure_type,
        queue: args.queue,
        platform: args.platform,
        channel: args.channel,
        assigned_to: args.assigned_to,
        is_critical: args.critical,
        ..JobFilter::default()
    };
    let page = orchestrator
        .query_jobs(
            &args.tenant.tenant,
            &filter,
            PageRequest::new(args.page, args.per_page),
        )
        .await?;

    match args.format {
        OutputFormat::Json => return print_json(&page),
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(&page)?);
            return Ok(());
        }
        OutputFormat::Table => {}
    }

    if page.items.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "Jobs (page {}/{}, {} total):",
        page.page, page.total_pages, page.total
    );
    for job in &page.items {
        println!("  {}", job_row(job));
    }

    Ok(())
}

fn job_row(job: &DeadLetterJob) -> String {
    let next = job
        .next_retry_at
        .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{} - {}/{} {} {} [{}] retries {}/{} next {}",
        job.id,
        job.original_queue,
        job.original_job_type,
        job.status.as_str(),
        job.failure_type.as_str(),
        job.priority.as_str(),
        job.retry_count,
        job.max_retries,
        next
    )
}

/// Lists failure patterns matching the filters.
async fn list_patterns(config_path: &Path, args: PatternArgs) -> Result<()> {
    let orchestrator = connect(config_path).await?;

    let filter = PatternFilter {
        status: args.status,
        pattern_type: args.pattern_type,
        min_severity: args.min_severity,
        queue: args.queue,
    };
    let patterns = orchestrator
        .list_patterns(&args.tenant.tenant, &filter)
        .await?;

    if patterns.is_empty() {
        println!("No patterns found.");
        return Ok(());
    }

    println!("Patterns ({}):", patterns.len());
    for pattern in patterns {
        println!(
            "  {} - {} {} on {} ({}) seen {}x, {} job(s)",
            pattern.id,
            pattern.severity.as_str(),
            pattern.pattern_type.as_str(),
            pattern.original_queue,
            pattern.status.as_str(),
            pattern.occurrence_count,
            pattern.affected_jobs_count
        );
    }

    Ok(())
}

/// Schedules a manual recovery attempt.
async fn retry_job(config_path: &Path, args: RetryArgs) -> Result<()> {
    let orchestrator = connect(config_path).await?;

    let modified_payload = args
        .payload
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--payload is not valid JSON")?;

    let options = ScheduleOptions {
        require_approval: args.require_approval,
        modified_payload,
        target_queue: args.target_queue,
        grant_retries: args.grant,
        ..ScheduleOptions::manual(args.by)
    };

    let log = orchestrator
        .schedule_retry(&args.job.tenant.tenant, args.job.job_id, args.strategy, options)
        .await?;

    println!(
        "Recovery attempt {} scheduled for {} ({}).",
        log.id,
        log.recovery_configuration
            .scheduled_for
            .format("%Y-%m-%d %H:%M:%S UTC"),
        log.status
    );
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
