// src/streamer.rs - Throttled job line production
//!
//! One streamer task per running job reads the instruction source and hands
//! exactly one line at a time to the queue. The [`LineGate`] is closed before
//! every line is processed and reopened by that line's completion, or right
//! away for lines that produce no command.

use crate::collaboration::{Barrier, CollaborationCoordinator};
use crate::directive::Directive;
use crate::job::{Job, JobEvent};
use crate::notify::{Notifier, SubscriberMessage};
use crate::queue::{Command, CommandQueue};
use crate::source::{InstructionSource, SourceError};
use crate::transform::Transforms;
use futures_core::Stream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Single-slot pause/resume flag between the streamer task and command
/// completions.
#[derive(Debug)]
pub struct LineGate {
    open: watch::Sender<bool>,
    line_pending: AtomicBool,
}

impl Default for LineGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LineGate {
    pub fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self { open, line_pending: AtomicBool::new(false) }
    }

    pub fn pause(&self) {
        self.open.send_replace(false);
    }

    pub fn resume(&self) {
        self.open.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Close the gate if it is open. Returns false when someone else already
    /// closed it.
    fn try_close(&self) -> bool {
        self.open.send_if_modified(|open| std::mem::replace(open, false))
    }

    /// Wait until the gate is open.
    pub async fn opened(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Whether a produced line is still waiting for its command to complete.
    pub fn line_pending(&self) -> bool {
        self.line_pending.load(Ordering::Acquire)
    }

    /// Forget a line whose command was dropped from the queue.
    pub fn clear_pending(&self) {
        self.set_line_pending(false);
    }

    fn set_line_pending(&self, pending: bool) {
        self.line_pending.store(pending, Ordering::Release);
    }
}

pub type JobEventFunc = Arc<dyn Fn(JobEvent) + Send + Sync>;

/// Everything a streamer touches, shared with the owning bot.
#[derive(Clone)]
pub struct StreamContext {
    pub queue: CommandQueue,
    pub transforms: Transforms,
    pub gate: Arc<LineGate>,
    pub job: Arc<Mutex<Option<Job>>>,
    pub collaboration: Arc<Mutex<CollaborationCoordinator>>,
    pub notifier: Arc<dyn Notifier>,
    /// Called when the trailing queue entry completes or stops the job.
    pub on_job_event: JobEventFunc,
}

impl StreamContext {
    /// Reopen the gate unless the job is paused or gone.
    fn release(&self, job_id: Uuid) {
        if job_running(&self.job, job_id) {
            self.gate.resume();
        }
    }

    fn advance(&self, job_id: Uuid) {
        if let Some(job) = self.job.lock().as_mut().filter(|job| job.id == job_id) {
            job.advance_line();
        }
    }

    fn handle_line(&self, job_id: Uuid, line: &str) {
        if let Some(parsed) = Directive::parse(line) {
            self.advance(job_id);
            match parsed {
                Ok(directive) => self.handle_directive(job_id, directive),
                // Production stays paused until an operator intervenes.
                Err(e) => tracing::error!("Unrecognized directive in '{}': {}", line, e),
            }
            return;
        }

        let executable = line.split(';').next().unwrap_or("").trim();
        if executable.is_empty() {
            self.advance(job_id);
            self.release(job_id);
            return;
        }

        let code = self.transforms.apply(executable);
        let gate = self.gate.clone();
        let job = self.job.clone();
        self.gate.set_line_pending(true);
        self.queue.queue_command(Command::new(code).post(move || {
            gate.set_line_pending(false);
            let mut guard = job.lock();
            let Some(job) = guard.as_mut().filter(|job| job.id == job_id) else {
                return;
            };
            job.advance_line();
            if job.is_running() {
                gate.resume();
            }
        }));
    }

    fn handle_directive(&self, job_id: Uuid, directive: Directive) {
        match directive {
            Directive::Checkpoint { bot, checkpoint } => {
                tracing::info!("Bot {} just reached checkpoint {}", bot, checkpoint);
                self.collaboration.lock().record_checkpoint(checkpoint);
                if let Some(job) = self.job.lock().as_mut().filter(|job| job.id == job_id) {
                    job.checkpoint = Some(checkpoint);
                }
                self.release(job_id);
                self.notifier.notify(SubscriberMessage::NotifyCheckpoint { bot, checkpoint });
            }
            Directive::Precursor { bot, checkpoint } => {
                tracing::info!("Just set blocker to bot {}, checkpoint {}", bot, checkpoint);
                let barrier = self.collaboration.lock().set_precursor(&bot, checkpoint);
                if barrier == Barrier::Release {
                    self.release(job_id);
                }
            }
            Directive::Dry => self.release(job_id),
        }
    }

    /// Queue the trailing entry that completes the job.
    fn finish(&self, job_id: Uuid) {
        let job = self.job.clone();
        let on_job_event = self.on_job_event.clone();
        self.queue.queue_command(Command::hook().post(move || {
            let completed = match job.lock().as_mut().filter(|job| job.id == job_id) {
                Some(job) => job.complete(),
                None => return,
            };
            match completed {
                Ok(event) => on_job_event(event),
                Err(e) => tracing::warn!("Job {} not completed: {}", job_id, e),
            }
        }));
    }

    /// Stop the job now and queue its stop transitions behind what is
    /// already in flight.
    fn abort(&self, job_id: Uuid) {
        let stopped = match self.job.lock().as_mut().filter(|job| job.id == job_id) {
            Some(job) => job.stop(),
            None => return,
        };
        if let Err(e) = stopped {
            tracing::warn!("Job {} not stopped: {}", job_id, e);
            return;
        }
        let on_job_event = self.on_job_event.clone();
        self.queue.queue_command(Command::hook().post(move || on_job_event(JobEvent::Stopped(job_id))));
    }
}

fn job_running(job: &Mutex<Option<Job>>, job_id: Uuid) -> bool {
    job.lock().as_ref().is_some_and(|job| job.id == job_id && job.is_running())
}

/// Handle to the task streaming one job.
#[derive(Debug)]
pub struct JobStreamer {
    job_id: Uuid,
    handle: JoinHandle<()>,
}

impl JobStreamer {
    /// Start streaming `source` for the job currently stored in the context.
    pub fn spawn(job_id: Uuid, source: InstructionSource, context: StreamContext) -> Self {
        Self::spawn_lines(job_id, source.lines(), context)
    }

    fn spawn_lines<S>(job_id: Uuid, lines: S, context: StreamContext) -> Self
    where
        S: Stream<Item = Result<String, SourceError>> + Send + 'static,
    {
        context.gate.set_line_pending(false);
        context.gate.resume();
        let handle = tokio::spawn(run(job_id, lines, context));
        Self { job_id, handle }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// True once the source is exhausted or the streamer was halted.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop producing lines. Commands already queued still run.
    pub fn halt(&self) {
        tracing::debug!("Halting streamer for job {}", self.job_id);
        self.handle.abort();
    }
}

impl Drop for JobStreamer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run<S>(job_id: Uuid, lines: S, context: StreamContext)
where
    S: Stream<Item = Result<String, SourceError>> + Send + 'static,
{
    tokio::pin!(lines);
    loop {
        context.gate.opened().await;
        let line = match lines.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                tracing::error!("Stopping job {}, line reader error: {}", job_id, e);
                context.abort(job_id);
                return;
            }
            None => break,
        };
        // A pause that landed while the line was read holds it back.
        while !context.gate.try_close() {
            context.gate.opened().await;
        }
        context.handle_line(job_id, &line);
    }
    tracing::info!("Completed reading job {}", job_id);
    context.finish(job_id);
}
