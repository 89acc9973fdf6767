//! Output formatting utilities

use crate::OutputFormat;
use console::{style, StyledObject};
use fetchq_core::StatusCounts;
use fetchq_types::{DownloadJob, JobStatus};
use tabled::{Table, Tabled};

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

pub fn status_icon(status: JobStatus) -> StyledObject<&'static str> {
    match status {
        JobStatus::Successful => style("✓").green(),
        JobStatus::Running => style("↓").cyan(),
        JobStatus::Paused => style("⏸").yellow(),
        JobStatus::Failed => style("✗").red(),
        JobStatus::Pending => style("·").dim(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

#[derive(Tabled)]
struct JobRow {
    id: String,
    file: String,
    size: String,
    progress: String,
    status: String,
}

impl From<&DownloadJob> for JobRow {
    fn from(job: &DownloadJob) -> Self {
        Self {
            id: job.id.to_string(),
            file: truncate(&job.file_name(), 30),
            size: job
                .total_bytes
                .map(format_bytes)
                .unwrap_or_else(|| "?".to_string()),
            progress: format!("{:.1}%", job.progress()),
            status: job.status.to_string(),
        }
    }
}

/// Print a one-line summary, with details when asked
pub fn print_job_summary(job: &DownloadJob, detailed: bool) {
    println!(
        "{} {} {} {} [{}]",
        status_icon(job.status),
        style(job.id).dim(),
        style(job.file_name()).bold(),
        style(format!("{:.1}%", job.progress())).dim(),
        style(job.status).dim()
    );

    if detailed {
        println!("    Source: {}", job.source_uri);
        println!("    Destination: {}", job.destination_path.display());
        match job.total_bytes {
            Some(total) => println!(
                "    Size: {} / {}",
                format_bytes(job.bytes_downloaded),
                format_bytes(total)
            ),
            None => println!("    Downloaded: {}", format_bytes(job.bytes_downloaded)),
        }
        if let Some(ref reason) = job.failure_reason {
            println!("    Error: {}", style(reason).red());
        }
        if let Some(reason) = job.pause_reason {
            println!("    Paused: {}", style(reason).yellow());
        }
        if job.retry_count > 0 {
            println!("    Retries: {}", job.retry_count);
        }
        println!("    Notifications: {:?}", job.notification_policy);
        println!("    Created: {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));
        println!("    Updated: {}", job.last_modified.format("%Y-%m-%d %H:%M:%S"));
        println!();
    }
}

/// Print a list of jobs in the requested format
pub fn print_jobs(jobs: &[DownloadJob], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(jobs)?);
        }
        OutputFormat::Table => {
            let rows: Vec<JobRow> = jobs.iter().map(JobRow::from).collect();
            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if jobs.is_empty() {
                println!("{}", style("No jobs found").dim());
                return Ok(());
            }
            for job in jobs {
                print_job_summary(job, false);
            }
        }
    }
    Ok(())
}

pub fn print_job(job: &DownloadJob, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(job)?),
        OutputFormat::Table => println!("{}", Table::new([JobRow::from(job)])),
        OutputFormat::Human => print_job_summary(job, true),
    }
    Ok(())
}

/// One-line totals, e.g. `2 successful, 1 failed`
pub fn format_counts(counts: &StatusCounts) -> String {
    let parts: Vec<String> = JobStatus::ALL
        .iter()
        .filter(|status| counts.get(**status) > 0)
        .map(|status| format!("{} {}", counts.get(*status), status))
        .collect();

    if parts.is_empty() {
        "no jobs".to_string()
    } else {
        parts.join(", ")
    }
}
