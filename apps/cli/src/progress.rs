//! Progress bar utilities for CLI downloads

use console::style;
use fetchq_types::{CoreEvent, DownloadJob, JobId, JobStatus, PauseReason};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;

const BAR_TEMPLATE: &str =
    "{spinner:.green} {msg:24} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Manages progress bars for the jobs of one CLI run
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: HashMap<JobId, ProgressBar>,
    names: HashMap<JobId, String>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
            names: HashMap::new(),
        }
    }

    /// Create a progress bar for a job
    pub fn add_job(&mut self, job: &DownloadJob) {
        let pb = self.multi.add(ProgressBar::new(job.total_bytes.unwrap_or(0)));

        if let Ok(bar_style) = ProgressStyle::default_bar().template(BAR_TEMPLATE) {
            pb.set_style(bar_style.progress_chars("█▓▒░  "));
        }
        pb.set_message(job.file_name());
        pb.set_position(job.bytes_downloaded);

        self.bars.insert(job.id, pb);
        self.names.insert(job.id, job.file_name());
    }

    /// Update a progress bar from an event
    pub fn handle_event(&self, event: &CoreEvent) {
        match event {
            CoreEvent::JobProgress {
                id,
                bytes_downloaded,
                total_bytes,
            } => {
                if let Some(pb) = self.bars.get(id) {
                    if let Some(total) = total_bytes {
                        pb.set_length(*total);
                    }
                    pb.set_position(*bytes_downloaded);
                }
            }

            CoreEvent::JobStatusChanged {
                id,
                status,
                failure_reason,
                pause_reason,
            } => {
                let Some(pb) = self.bars.get(id) else {
                    return;
                };

                match status {
                    JobStatus::Successful => {
                        pb.finish_with_message(format!("{} done", style("✓").green().bold()));
                    }
                    JobStatus::Failed => {
                        let reason = failure_reason
                            .as_ref()
                            .map(|r| r.to_string())
                            .unwrap_or_else(|| "unknown error".to_string());
                        pb.abandon_with_message(format!("{} {}", style("✗").red().bold(), reason));
                    }
                    JobStatus::Paused => {
                        let label = match pause_reason {
                            Some(PauseReason::WaitingToRetry) => "retrying",
                            _ => "paused",
                        };
                        let name = self.names.get(id).map(String::as_str).unwrap_or_default();
                        pb.set_message(format!("{} {} {}", style("⏸").yellow(), label, name));
                    }
                    JobStatus::Running => {
                        if let Some(name) = self.names.get(id) {
                            pb.set_message(name.clone());
                        }
                    }
                    JobStatus::Pending => {}
                }
            }

            _ => {}
        }
    }

    /// Bring a bar in line with a snapshot, for events that were missed
    pub fn sync(&self, job: &DownloadJob) {
        if let Some(pb) = self.bars.get(&job.id) {
            if let Some(total) = job.total_bytes {
                pb.set_length(total);
            }
            pb.set_position(job.bytes_downloaded);
        }
    }

    /// Stop drawing all bars, leaving their last state on screen
    pub fn abandon_all(&mut self) {
        for (_, pb) in self.bars.drain() {
            if !pb.is_finished() {
                pb.abandon();
            }
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}
