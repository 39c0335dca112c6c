use anyhow::{Context, Result};
use campaign_pipeline::cli::commands::{
    CancelCommand, JobsCommand, RunCommand, ScheduleCommand, ServeCommand, StatusCommand,
    ValidateCommand,
};
use campaign_pipeline::cli::output::*;
use campaign_pipeline::cli::{Cli, Command};
use campaign_pipeline::core::config::CampaignConfig;
use campaign_pipeline::execution::{ExecutionEvent, Orchestrator, ThrottlePool};
use campaign_pipeline::persistence::{JobStore, NewJob};
use campaign_pipeline::publish::{PublishHandler, PublishRequest};
use campaign_pipeline::scheduling::{HandlerRegistry, RuntimeConfig, SchedulerRuntime};
use campaign_pipeline::settings::Settings;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_campaign(cmd, &settings).await?,
        Command::Validate(cmd) => validate_campaign(cmd, &settings)?,
        Command::Schedule(cmd) => schedule_job(cmd, &settings).await?,
        Command::Cancel(cmd) => cancel_job(cmd, &settings).await?,
        Command::Status(cmd) => show_job(cmd, &settings).await?,
        Command::Jobs(cmd) => list_jobs(cmd, &settings).await?,
        Command::Serve(cmd) => serve(cmd, &settings).await?,
    }

    Ok(())
}

async fn run_campaign(cmd: &RunCommand, settings: &Settings) -> Result<()> {
    // Load campaign config
    let config = CampaignConfig::from_file(&cmd.file).context("Failed to load campaign config")?;
    let throttles = Arc::new(ThrottlePool::from_settings(&settings.throttles));
    config.validate_throttles(&throttles)?;

    let mut request = config.to_request(&settings.step_defaults);
    for (key, value) in &cmd.variable {
        request = request.with_variable(key.clone(), value.clone());
    }

    if !cmd.json {
        println!(
            "{} Running campaign {} ({} pipelines, request {})",
            ROCKET,
            style(&config.name).bold(),
            request.pipelines.len(),
            style(&request.correlation_id).dim()
        );
    }

    let mut orchestrator = Orchestrator::new(throttles);
    let progress = (!cmd.json).then(|| create_progress_bar(request.pipelines.len()));
    if let Some(progress) = progress.clone() {
        orchestrator = orchestrator.with_event_handler(move |event| {
            if let ExecutionEvent::PipelineFinished { .. } = event {
                progress.inc(1);
            }
            progress.println(format_execution_event(&event));
        });
    }

    let cancel = CancellationToken::new();
    let run = orchestrator.submit_with_cancel(request, cancel.clone());
    tokio::pin!(run);
    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping pipelines after their current step");
            cancel.cancel();
            run.await
        }
    };

    if let Some(progress) = progress {
        progress.finish_and_clear();
    }

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!();
        for outcome in &result.outcomes {
            println!("{}", format_outcome(outcome));
        }
        let failed = result.failed().count();
        if failed == 0 {
            println!(
                "\n{} {} completed {}",
                CHECK,
                style(&config.name).bold(),
                style("successfully").green()
            );
        } else {
            println!(
                "\n{} {} finished with {} failed pipeline(s)",
                CROSS,
                style(&config.name).bold(),
                style(failed).red()
            );
        }
    }

    if !result.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn validate_campaign(cmd: &ValidateCommand, settings: &Settings) -> Result<()> {
    let throttles = ThrottlePool::from_settings(&settings.throttles);
    let validated = CampaignConfig::from_file(&cmd.file)
        .and_then(|config| config.validate_throttles(&throttles).map(|_| config));

    match validated {
        Ok(config) => {
            if cmd.json {
                let pipelines: Vec<_> = config
                    .pipelines
                    .iter()
                    .map(|p| {
                        serde_json::json!({
                            "id": p.id,
                            "steps": p.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "valid": true,
                        "name": config.name,
                        "pipelines": pipelines,
                    }))?
                );
            } else {
                println!("{} Campaign {} is valid", CHECK, style(&config.name).bold());
                for pipeline in &config.pipelines {
                    let steps: Vec<_> = pipeline.steps.iter().map(|s| s.name.as_str()).collect();
                    println!("  {} {}", style(&pipeline.id).cyan(), style(steps.join(" → ")).dim());
                }
            }
            Ok(())
        }
        Err(e) => {
            if cmd.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "valid": false,
                        "error": format!("{:#}", e),
                    }))?
                );
            } else {
                println!("{} Invalid campaign: {:#}", CROSS, e);
            }
            std::process::exit(1);
        }
    }
}

#[cfg(feature = "sqlite")]
async fn open_store(settings: &Settings) -> Result<Arc<dyn JobStore>> {
    let path = settings.database_path();
    let store = campaign_pipeline::persistence::SqliteJobStore::open(&path)
        .await
        .with_context(|| format!("Failed to open job store at {}", path.display()))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_store(_settings: &Settings) -> Result<Arc<dyn JobStore>> {
    anyhow::bail!("Scheduled jobs need the `sqlite` feature")
}

async fn schedule_job(cmd: &ScheduleCommand, settings: &Settings) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&cmd.payload).context("Invalid --payload JSON")?;
    if cmd.handler == PublishHandler::NAME {
        serde_json::from_value::<PublishRequest>(payload.clone())
            .context("Invalid publish payload")?;
    }

    let mut job = NewJob::new(cmd.handler.clone(), payload, cmd.at);
    if let Some(grace) = cmd.grace_secs.or(settings.scheduler.default_misfire_grace_secs) {
        job = job.with_misfire_grace(grace);
    }
    if cmd.at < Utc::now() {
        warn!("Run time {} is in the past; the job is due immediately", cmd.at);
    }

    let store = open_store(settings).await?;
    let id = store.enqueue(job).await.context("Failed to schedule job")?;

    println!(
        "{} Scheduled {} job {} for {}",
        CLOCK,
        style(&cmd.handler).bold(),
        style(&id).cyan(),
        cmd.at.to_rfc3339()
    );
    Ok(())
}

async fn cancel_job(cmd: &CancelCommand, settings: &Settings) -> Result<()> {
    let store = open_store(settings).await?;
    if store.cancel(&cmd.job_id).await.context("Failed to cancel job")? {
        println!("{} Cancelled job {}", CHECK, style(&cmd.job_id).cyan());
        return Ok(());
    }

    match store.get(&cmd.job_id).await? {
        Some(job) => println!(
            "{} Job {} is {} and can no longer be cancelled",
            CROSS,
            style(&cmd.job_id).cyan(),
            format_job_status(job.status)
        ),
        None => println!("{} No job {}", CROSS, style(&cmd.job_id).cyan()),
    }
    std::process::exit(1);
}

async fn show_job(cmd: &StatusCommand, settings: &Settings) -> Result<()> {
    let store = open_store(settings).await?;
    let job = store
        .get(&cmd.job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Job not found: {}", cmd.job_id))?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        println!("{}", format_job_details(&job));
    }
    Ok(())
}

async fn list_jobs(cmd: &JobsCommand, settings: &Settings) -> Result<()> {
    let store = open_store(settings).await?;
    let jobs = store.list(cmd.status).await?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("{} No jobs", INFO);
    }
    for job in &jobs {
        println!("{}", format_job(job));
    }
    Ok(())
}

async fn serve(cmd: &ServeCommand, settings: &Settings) -> Result<()> {
    let store = open_store(settings).await?;
    let throttles = Arc::new(ThrottlePool::from_settings(&settings.throttles));

    let mut registry = HandlerRegistry::new();
    let publish = PublishHandler::from_settings(settings, throttles)?;
    if publish.platforms().is_empty() {
        warn!("No publishers configured; publish jobs will fail");
    }
    publish.register(&mut registry);

    let mut config = RuntimeConfig::from_settings(&settings.scheduler);
    if let Some(tick_ms) = cmd.tick_ms {
        config.tick_interval = Duration::from_millis(tick_ms.max(1));
    }

    let runtime = Arc::new(SchedulerRuntime::new(store, registry, config));
    let shutdown = CancellationToken::new();
    let handle = runtime.start(shutdown.clone());

    println!("{} Scheduler running, press Ctrl-C to stop", ROCKET);
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }

    println!("{} Stopping, waiting for running jobs", INFO);
    shutdown.cancel();
    handle.await.context("Scheduler runtime task failed")?;
    Ok(())
}
