//! CLI command implementations

use crate::output::{format_counts, print_job, print_job_summary, print_jobs};
use crate::progress::DownloadProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Context, Result};
use console::style;
use fetchq_core::{DownloadService, Storage};
use fetchq_types::{
    DownloadJob, JobFilter, JobId, JobOptions, JobStatus, NotificationPolicy, Settings,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

async fn open_service(data_dir: &Path) -> Result<DownloadService> {
    DownloadService::open(data_dir.to_path_buf())
        .await
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))
}

fn parse_id(id: &str) -> Result<JobId> {
    id.parse()
        .map_err(|e| anyhow!("Invalid job ID '{}': {}", id, e))
}

/// Last path segment of the URL, or `download`
fn file_name_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.path_segments().and_then(|s| s.last().map(str::to_string)))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "download".to_string())
}

fn destination_for(url: &str, output: Option<&Path>, many: bool) -> Result<PathBuf> {
    let name = file_name_from_url(url);
    match output {
        Some(path) if many || path.is_dir() => Ok(path.join(name)),
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(std::env::current_dir()?.join(name)),
    }
}

// ============================================================================
// Download Commands
// ============================================================================

pub async fn get(
    data_dir: &Path,
    urls: Vec<String>,
    output: Option<PathBuf>,
    hidden: bool,
    notify: Option<NotificationPolicy>,
    format: OutputFormat,
) -> Result<()> {
    let service = open_service(data_dir).await?;
    let options = JobOptions {
        visible_in_ui: !hidden,
        notification_policy: notify.unwrap_or_default(),
    };

    let many = urls.len() > 1;
    let mut ids = Vec::new();
    for url in &urls {
        let destination = destination_for(url, output.as_deref(), many)?;
        match service.submit(url, destination, options.clone()) {
            Ok(id) => ids.push(id),
            Err(e) => eprintln!("{} {}: {}", style("✗").red().bold(), url, e),
        }
    }

    if ids.is_empty() {
        service.shutdown().await;
        bail!("No valid URLs to download");
    }

    let result = run_to_completion(&service, &ids, format).await;
    service.shutdown().await;
    result
}

pub async fn resume(data_dir: &Path, ids: Vec<String>, format: OutputFormat) -> Result<()> {
    let service = open_service(data_dir).await?;

    let resumed = if ids.is_empty() {
        service.resume_interrupted()
    } else {
        let mut resumed = Vec::new();
        for id in &ids {
            let id = parse_id(id)?;
            service.resume(id)?;
            resumed.push(id);
        }
        resumed
    };

    if resumed.is_empty() {
        println!("{}", style("Nothing to resume").dim());
        service.shutdown().await;
        return Ok(());
    }

    let result = run_to_completion(&service, &resumed, format).await;
    service.shutdown().await;
    result
}

/// Drive the given jobs until they all finish or Ctrl-C is pressed
async fn run_to_completion(
    service: &DownloadService,
    ids: &[JobId],
    format: OutputFormat,
) -> Result<()> {
    let human = matches!(format, OutputFormat::Human);
    let mut progress = DownloadProgress::new();
    let mut events = service.events();

    if human {
        for id in ids {
            if let Ok(job) = service.get_status(*id) {
                progress.add_job(&job);
            }
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut tick = tokio::time::interval(Duration::from_millis(250));
    let mut interrupted = false;

    loop {
        let unfinished = ids
            .iter()
            .filter(|id| service.get_status(**id).map(|job| !job.is_terminal()).unwrap_or(false))
            .count();
        if unfinished == 0 {
            break;
        }

        tokio::select! {
            _ = &mut ctrl_c => {
                interrupted = true;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if human {
                        progress.handle_event(&event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {} progress events", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tick.tick() => {
                if human {
                    for id in ids {
                        if let Ok(job) = service.get_status(*id) {
                            progress.sync(&job);
                        }
                    }
                }
            }
        }
    }
    progress.abandon_all();

    let jobs: Vec<DownloadJob> = ids
        .iter()
        .filter_map(|id| service.get_status(*id).ok())
        .collect();

    match format {
        OutputFormat::Human => {
            println!();
            for job in &jobs {
                print_job_summary(job, job.status == JobStatus::Failed);
            }
        }
        _ => print_jobs(&jobs, format)?,
    }

    if interrupted {
        eprintln!(
            "{} Interrupted. Run `fetchq resume` to continue.",
            style("⏸").yellow().bold()
        );
        return Ok(());
    }

    let failed = jobs.iter().filter(|j| j.status == JobStatus::Failed).count();
    if failed > 0 {
        bail!("{} of {} downloads failed", failed, jobs.len());
    }
    Ok(())
}

// ============================================================================
// Ledger Commands
// ============================================================================

pub async fn list(
    data_dir: &Path,
    status: Option<String>,
    all: bool,
    format: OutputFormat,
) -> Result<()> {
    let service = open_service(data_dir).await?;

    let statuses = status
        .map(|s| {
            s.split(',')
                .map(|part| part.parse::<JobStatus>())
                .collect::<std::result::Result<Vec<_>, _>>()
        })
        .transpose()
        .map_err(|e| anyhow!(e))?;
    let filter = JobFilter {
        ids: None,
        statuses,
    };

    let jobs: Vec<DownloadJob> = service
        .list_jobs(&filter)
        .into_iter()
        .filter(|job| all || job.visible_in_ui)
        .collect();

    print_jobs(&jobs, format)?;
    if matches!(format, OutputFormat::Human) && !jobs.is_empty() {
        println!();
        println!("{}", style(format_counts(&service.query().counts())).dim());
    }

    service.shutdown().await;
    Ok(())
}

pub async fn info(data_dir: &Path, id: &str, format: OutputFormat) -> Result<()> {
    let id = parse_id(id)?;
    let service = open_service(data_dir).await?;
    let job = service.get_status(id);
    service.shutdown().await;

    print_job(&job?, format)
}

pub async fn cancel(data_dir: &Path, id: &str, format: OutputFormat) -> Result<()> {
    let id = parse_id(id)?;
    let service = open_service(data_dir).await?;
    let result = service.cancel(id).and_then(|_| service.get_status(id));
    service.shutdown().await;

    let job = result?;
    match format {
        OutputFormat::Human => println!("{} Job {} cancelled", style("✓").green().bold(), id),
        _ => print_job(&job, format)?,
    }
    Ok(())
}

pub async fn purge(data_dir: &Path, id: &str, with_file: bool, format: OutputFormat) -> Result<()> {
    let id = parse_id(id)?;
    let service = open_service(data_dir).await?;
    let result = service.purge(id, with_file).await;
    service.shutdown().await;

    let job = result?;
    match format {
        OutputFormat::Human => {
            println!("{} Job {} purged", style("✓").green().bold(), id);
            if with_file {
                println!("  Removed {}", job.destination_path.display());
            }
        }
        _ => print_job(&job, format)?,
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config(data_dir: &Path, action: Option<ConfigAction>, format: OutputFormat) -> Result<()> {
    let storage = Storage::new(data_dir.to_path_buf()).await?;

    match action {
        None | Some(ConfigAction::Show) => {
            let settings = storage.load_settings().await?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                _ => {
                    println!("fetchq configuration:");
                    println!();
                    println!("  Data directory: {}", storage.data_dir().display());
                    println!("  Parallel downloads: {}", settings.max_concurrent);
                    println!("  Retry limit: {}", settings.retry_limit);
                    println!(
                        "  Retry delay: {} ms, up to {} ms",
                        settings.retry_base_delay_ms, settings.retry_max_delay_ms
                    );
                    println!("  Chunk size: {}", crate::output::format_bytes(settings.chunk_size as u64));
                    println!("  Observer budget: {} ms", settings.observer_budget_ms);
                    println!(
                        "  Timeouts: connect {} s, read {} s",
                        settings.connect_timeout_secs, settings.read_timeout_secs
                    );
                    println!("  User agent: {}", settings.user_agent);
                }
            }
        }

        Some(ConfigAction::Path) => match format {
            OutputFormat::Json => {
                let paths = serde_json::json!({
                    "data_dir": storage.data_dir(),
                    "settings": storage.settings_path(),
                    "ledger": storage.ledger_path(),
                });
                println!("{}", serde_json::to_string_pretty(&paths)?);
            }
            _ => {
                println!("Data directory: {}", storage.data_dir().display());
                println!("Settings: {}", storage.settings_path().display());
                println!("Job ledger: {}", storage.ledger_path().display());
            }
        },

        Some(ConfigAction::Init { force }) => {
            let path = storage.settings_path();
            if path.exists() && !force {
                bail!("{} already exists, use --force to overwrite", path.display());
            }
            storage.save_settings(&Settings::default()).await?;
            println!(
                "{} Wrote default settings to {}",
                style("✓").green().bold(),
                path.display()
            );
        }
    }

    Ok(())
}
