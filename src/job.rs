// src/job.rs - Job lifecycle and progress tracking
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Created,
    Running,
    Paused,
    Done,
    Stopped,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Job cannot {action} while {state:?}")]
    InvalidTransition { action: &'static str, state: JobState },
}

/// Emitted by lifecycle changes the owning bot must react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Finished(Uuid),
    /// Ended early; the rest of the source was not sent.
    Stopped(Uuid),
}

/// Where a job's instructions come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobSource {
    Path(PathBuf),
    Text(String),
}

impl JobSource {
    pub fn reference(&self) -> String {
        match self {
            JobSource::Path(path) => path.display().to_string(),
            JobSource::Text(_) => "<inline>".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub source: JobSource,
}

impl JobDescriptor {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { id: None, source: JobSource::Path(path.into()) }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self { id: None, source: JobSource::Text(text.into()) }
    }
}

/// Elapsed time that only accrues while running.
#[derive(Debug, Clone, Default)]
pub struct Stopwatch {
    accumulated: Duration,
    since: Option<Instant>,
}

impl Stopwatch {
    pub fn start(&mut self) {
        if self.since.is_none() {
            self.since = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        if let Some(since) = self.since.take() {
            self.accumulated += since.elapsed();
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.accumulated + self.since.map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.since.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub source_ref: String,
    pub current_line: u64,
    pub total_lines: u64,
    pub checkpoint: Option<u32>,
    state: JobState,
    percent_complete: u8,
    started_at: Option<DateTime<Utc>>,
    stopwatch: Stopwatch,
}

/// Serializable copy of a job for status snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: Uuid,
    pub source_ref: String,
    pub state: JobState,
    pub current_line: u64,
    pub total_lines: u64,
    pub percent_complete: u8,
    pub checkpoint: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
}

impl Job {
    pub fn new(descriptor: &JobDescriptor, total_lines: u64) -> Self {
        Self {
            id: descriptor.id.unwrap_or_else(Uuid::new_v4),
            source_ref: descriptor.source.reference(),
            current_line: 0,
            total_lines,
            checkpoint: None,
            state: JobState::Created,
            percent_complete: 0,
            started_at: None,
            stopwatch: Stopwatch::default(),
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn percent_complete(&self) -> u8 {
        self.percent_complete
    }

    pub fn elapsed(&self) -> Duration {
        self.stopwatch.elapsed()
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    pub fn start(&mut self) -> Result<(), JobError> {
        self.transition("start", &[JobState::Created], JobState::Running)?;
        self.started_at = Some(Utc::now());
        self.stopwatch.start();
        tracing::info!("Job {} started ({} lines)", self.id, self.total_lines);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), JobError> {
        self.transition("pause", &[JobState::Running], JobState::Paused)?;
        self.stopwatch.stop();
        tracing::info!("Job {} paused at line {}", self.id, self.current_line);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), JobError> {
        self.transition("resume", &[JobState::Paused], JobState::Running)?;
        self.stopwatch.start();
        tracing::info!("Job {} resumed", self.id);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), JobError> {
        self.transition("stop", &[JobState::Running, JobState::Paused], JobState::Stopped)?;
        self.stopwatch.stop();
        tracing::info!("Job {} stopped", self.id);
        Ok(())
    }

    /// Mark the job complete at 100%.
    pub fn complete(&mut self) -> Result<JobEvent, JobError> {
        self.transition("complete", &[JobState::Running], JobState::Done)?;
        self.percent_complete = 100;
        self.stopwatch.stop();
        tracing::info!("Job {} done in {:?}", self.id, self.stopwatch.elapsed());
        Ok(JobEvent::Finished(self.id))
    }

    /// Record one more consumed line. Progress never decreases and stays
    /// below 100 until `complete`.
    pub fn advance_line(&mut self) {
        self.current_line += 1;
        if self.total_lines == 0 {
            return;
        }
        let percent = (self.current_line.saturating_mul(100) / self.total_lines).min(99) as u8;
        self.percent_complete = self.percent_complete.max(percent);
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id,
            source_ref: self.source_ref.clone(),
            state: self.state,
            current_line: self.current_line,
            total_lines: self.total_lines,
            percent_complete: self.percent_complete,
            checkpoint: self.checkpoint,
            started_at: self.started_at,
            elapsed_ms: self.elapsed().as_millis() as u64,
        }
    }

    fn transition(
        &mut self,
        action: &'static str,
        from: &[JobState],
        to: JobState,
    ) -> Result<(), JobError> {
        if !from.contains(&self.state) {
            return Err(JobError::InvalidTransition { action, state: self.state });
        }
        self.state = to;
        Ok(())
    }
}
