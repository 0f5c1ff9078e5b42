// src/bot.rs - One device: connection, queue, state machine and job
use crate::collaboration::{Barrier, Blocker, CollaborationCoordinator};
use crate::config::{BotConfig, ConfigError};
use crate::connection::{self, Connection, ConnectionError};
use crate::directive::normalize_bot_id;
use crate::job::{Job, JobDescriptor, JobError, JobEvent, JobState, JobStatus};
use crate::notify::{HttpNotifier, Notifier, StateUpdate, SubscriberMessage};
use crate::park::{ParkSequenceBuilder, ParkSettings};
use crate::queue::{Command, CommandQueue, QueueError};
use crate::reply::{Position, Sensors, parse_position, parse_temperatures};
use crate::source::{InstructionSource, SourceError};
use crate::state::{AdHocHooks, BotEvent, BotState, BotStateMachine, StateError};
use crate::streamer::{JobStreamer, LineGate, StreamContext};
use crate::transform::{Transforms, format_number};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Callers refuse to stream more work once the queue holds this many entries.
pub const STREAM_QUEUE_LIMIT: usize = 32;

#[derive(Debug, Error)]
pub enum BotError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Unknown axis '{0}'")]
    UnknownAxis(String),
    #[error("gcode is empty")]
    EmptyGcode,
    #[error("No job is loaded")]
    NoJob,
    #[error("Bot is not connected")]
    NotConnected,
    #[error("Job cannot run while the bot is {0}")]
    Parked(BotState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
    E,
}

impl Axis {
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::E => 'E',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for Axis {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x" => Ok(Axis::X),
            "y" => Ok(Axis::Y),
            "z" => Ok(Axis::Z),
            "e" => Ok(Axis::E),
            _ => Err(BotError::UnknownAxis(s.to_string())),
        }
    }
}

/// Owned snapshot of a bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotStatus {
    pub name: String,
    pub state: BotState,
    pub position: Position,
    pub sensors: Sensors,
    pub checkpoint: Option<u32>,
    pub collaborators: HashMap<String, u32>,
    pub blocker: Blocker,
    pub percent_complete: u8,
    pub job: Option<JobStatus>,
}

#[derive(Debug, Clone, Default)]
struct Telemetry {
    position: Position,
    sensors: Sensors,
}

/// Where park took the tool from, and whether it paused the job to do so.
#[derive(Debug, Clone, Default)]
struct ParkRecord {
    position: Position,
    paused_job: bool,
}

#[derive(Clone)]
struct Link {
    connection: Arc<dyn Connection>,
    queue: CommandQueue,
}

struct BotShared {
    config: BotConfig,
    transforms: Transforms,
    notifier: Arc<dyn Notifier>,
    fsm: Mutex<BotStateMachine>,
    telemetry: Mutex<Telemetry>,
    job: Arc<Mutex<Option<Job>>>,
    collaboration: Arc<Mutex<CollaborationCoordinator>>,
    gate: Arc<LineGate>,
    link: Mutex<Option<Link>>,
    streamer: Mutex<Option<JobStreamer>>,
    park: Mutex<Option<ParkRecord>>,
}

impl BotShared {
    fn state(&self) -> BotState {
        self.fsm.lock().current()
    }

    fn fire(&self, event: BotEvent) -> Result<BotState, StateError> {
        let state = self.fsm.lock().fire(event)?;
        self.notifier.notify(SubscriberMessage::UpdateState {
            body: StateUpdate { event, state, bot: self.config.name.clone() },
        });
        Ok(state)
    }

    /// Fire from a queue hook, where there is no caller to return an error to.
    fn fire_logged(&self, event: BotEvent) {
        if let Err(e) = self.fire(event) {
            tracing::warn!("{}: {}", self.config.name, e);
        }
    }

    fn queue(&self) -> Result<CommandQueue, BotError> {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.queue.clone())
            .ok_or(BotError::NotConnected)
    }

    fn job_running(&self) -> bool {
        self.job.lock().as_ref().is_some_and(Job::is_running)
    }

    /// Reopen line production if nothing is holding it.
    fn resume_production(&self) {
        if self.job_running()
            && !self.gate.line_pending()
            && !self.collaboration.lock().is_awaiting_precursor()
        {
            self.gate.resume();
        }
    }

    /// Bring the bot state in line with a job whose closing queue entry was
    /// dropped or already ran against a paused job. Returns whether the job
    /// is over.
    fn settle_job(&self) -> bool {
        let job_state = self.job.lock().as_ref().map(Job::state);
        match job_state {
            Some(JobState::Done | JobState::Stopped) => {
                if self.state() == BotState::ProcessingJob {
                    self.fire_logged(BotEvent::Stop);
                    self.fire_logged(BotEvent::StopDone);
                }
                true
            }
            Some(JobState::Running) => {
                let exhausted = self.streamer.lock().as_ref().is_some_and(JobStreamer::is_finished);
                if !exhausted {
                    return false;
                }
                let completed = self.job.lock().as_mut().filter(|job| job.is_running()).map(Job::complete);
                if let Some(Ok(event)) = completed {
                    self.on_job_event(event);
                }
                true
            }
            _ => false,
        }
    }

    fn on_job_event(&self, event: JobEvent) {
        match event {
            JobEvent::Finished(id) => tracing::info!("{}: job {} finished", self.config.name, id),
            JobEvent::Stopped(id) => tracing::warn!("{}: job {} stopped", self.config.name, id),
        }
        self.fire_logged(BotEvent::Stop);
        self.fire_logged(BotEvent::StopDone);
    }
}

/// A single device and everything needed to drive it.
#[derive(Clone)]
pub struct Bot {
    shared: Arc<BotShared>,
}

impl fmt::Debug for Bot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bot")
            .field("name", &self.shared.config.name)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl Bot {
    /// Notifications go to the configured subscribers over HTTP.
    pub fn new(config: BotConfig) -> Result<Self, BotError> {
        let notifier = Arc::new(HttpNotifier::new(config.subscribers.clone()));
        Self::with_notifier(config, notifier)
    }

    pub fn with_notifier(config: BotConfig, notifier: Arc<dyn Notifier>) -> Result<Self, BotError> {
        config.validate()?;
        let transforms = Transforms::from(&config);
        Ok(Self {
            shared: Arc::new(BotShared {
                config,
                transforms,
                notifier,
                fsm: Mutex::new(BotStateMachine::new()),
                telemetry: Mutex::new(Telemetry::default()),
                job: Arc::new(Mutex::new(None)),
                collaboration: Arc::new(Mutex::new(CollaborationCoordinator::new())),
                gate: Arc::new(LineGate::new()),
                link: Mutex::new(None),
                streamer: Mutex::new(None),
                park: Mutex::new(None),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &BotConfig {
        &self.shared.config
    }

    pub fn state(&self) -> BotState {
        self.shared.state()
    }

    /// Open the configured connection.
    pub async fn connect(&self) -> Result<(), BotError> {
        self.shared.fire(BotEvent::Connect)?;
        match connection::open(&self.shared.config.connection).await {
            Ok(connection) => self.attach(connection),
            Err(e) => {
                tracing::error!("{}: connect failed: {}", self.name(), e);
                self.shared.fire_logged(BotEvent::ConnectFail);
                Err(e.into())
            }
        }
    }

    /// Connect over an already opened link.
    pub fn connect_with(&self, connection: Arc<dyn Connection>) -> Result<(), BotError> {
        self.shared.fire(BotEvent::Connect)?;
        self.attach(connection)
    }

    fn attach(&self, connection: Arc<dyn Connection>) -> Result<(), BotError> {
        let name = self.shared.config.name.clone();
        connection.set_error_func(Box::new(move |message| {
            tracing::error!("{}: device error: {}", name, message);
        }));
        let weak = Arc::downgrade(&self.shared);
        connection.set_close_func(Box::new(move || {
            let Some(shared) = weak.upgrade() else { return };
            if shared.state() != BotState::Disconnected {
                tracing::warn!("{}: connection closed", shared.config.name);
                shared.fire_logged(BotEvent::Disconnect);
            }
        }));

        let queue = CommandQueue::new(connection.clone());
        *self.shared.link.lock() = Some(Link { connection, queue });
        self.shared.fire(BotEvent::ConnectDone)?;
        tracing::info!("{}: connected", self.name());
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), BotError> {
        self.shared.fire(BotEvent::Disconnect)?;
        if let Some(streamer) = self.shared.streamer.lock().take() {
            streamer.halt();
        }
        if let Some(job) = self.shared.job.lock().as_mut() {
            if matches!(job.state(), JobState::Running | JobState::Paused) {
                job.stop()?;
            }
        }
        let link = self.shared.link.lock().take();
        if let Some(link) = link {
            link.queue.clear();
            link.connection.close().await?;
        }
        *self.shared.park.lock() = None;
        tracing::info!("{}: disconnected", self.name());
        Ok(())
    }

    /// Open the job's source and start streaming it.
    pub async fn start_job(&self, descriptor: JobDescriptor) -> Result<JobStatus, BotError> {
        let queue = self.shared.queue()?;
        {
            let fsm = self.shared.fsm.lock();
            if fsm.can(BotEvent::Start).is_none() {
                return Err(StateError::InvalidTransition { state: fsm.current(), event: BotEvent::Start }.into());
            }
        }
        let source = InstructionSource::open(&descriptor.source).await?;
        let mut job = Job::new(&descriptor, source.total_lines());

        self.shared.fire(BotEvent::Start)?;
        job.start()?;
        let job_id = job.id;
        let status = job.status();
        *self.shared.job.lock() = Some(job);
        self.shared.collaboration.lock().reset();

        let weak: Weak<BotShared> = Arc::downgrade(&self.shared);
        let context = StreamContext {
            queue,
            transforms: self.shared.transforms.clone(),
            gate: self.shared.gate.clone(),
            job: self.shared.job.clone(),
            collaboration: self.shared.collaboration.clone(),
            notifier: self.shared.notifier.clone(),
            on_job_event: Arc::new(move |event| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_job_event(event);
                }
            }),
        };
        let streamer = JobStreamer::spawn(job_id, source, context);
        if let Some(previous) = self.shared.streamer.lock().replace(streamer) {
            previous.halt();
        }
        self.shared.fire(BotEvent::StartDone)?;
        tracing::info!(
            "{}: processing {} ({} lines)",
            self.name(),
            status.source_ref,
            status.total_lines
        );
        Ok(status)
    }

    /// Queue one instruction. `Ok(false)` means the queue is full; retry later.
    pub fn stream_gcode(&self, gcode: &str) -> Result<bool, BotError> {
        let queue = self.shared.queue()?;
        let gcode = gcode.trim();
        if gcode.is_empty() {
            return Err(BotError::EmptyGcode);
        }
        if queue.len() >= STREAM_QUEUE_LIMIT {
            return Ok(false);
        }
        let hooks = self.shared.fsm.lock().ad_hoc_hooks()?;
        let code = self.shared.transforms.add_offset(gcode);
        queue.queue_commands(self.bracket(hooks, Command::new(code)));
        Ok(true)
    }

    /// Queue one instruction and wait for its reply.
    pub async fn process_gcode(&self, gcode: &str) -> Result<String, BotError> {
        let queue = self.shared.queue()?;
        let gcode = gcode.trim();
        if gcode.is_empty() {
            return Err(BotError::EmptyGcode);
        }
        let hooks = self.shared.fsm.lock().ad_hoc_hooks()?;
        let code = self.shared.transforms.add_offset(gcode);
        let (command, reply) = Command::new(code).with_reply();
        queue.queue_commands(self.bracket(hooks, command));
        let reply = reply.wait().await?;
        Ok(reply.replace('\r', ""))
    }

    /// Move one axis by `amount` relative to where it is now.
    pub fn jog(&self, axis: &str, amount: f64, feed_rate: Option<f64>) -> Result<BotStatus, BotError> {
        let axis: Axis = axis.parse()?;
        let queue = self.shared.queue()?;
        let hooks = self.shared.fsm.lock().ad_hoc_hooks()?;
        let config = &self.shared.config;
        let feed_rate = feed_rate.unwrap_or(match axis {
            Axis::X => config.jog_x_speed,
            Axis::Y => config.jog_y_speed,
            Axis::Z => config.jog_z_speed,
            Axis::E => config.jog_e_speed,
        });

        let prepend_to = queue.clone();
        let query = Command::new("M114").process(move |_, reply| {
            let Some(current) = parse_position(reply).and_then(|p| p.axis(axis)) else {
                tracing::error!("Cannot jog, unreadable position reply: {}", reply);
                return true;
            };
            prepend_to.prepend_command(format!(
                "G1 {}{} F{}",
                axis,
                format_number(current + amount),
                format_number(feed_rate)
            ));
            true
        });
        queue.queue_commands(self.bracket(hooks, query));
        Ok(self.status())
    }

    /// Replace the collaborator map and re-check a held precursor.
    pub fn update_collaborator_checkpoints(&self, collaborators: HashMap<String, u32>) {
        let collaborators = collaborators
            .into_iter()
            .map(|(bot, checkpoint)| (normalize_bot_id(&bot).to_string(), checkpoint))
            .collect();
        let barrier = self.shared.collaboration.lock().update_collaborators(collaborators);
        if barrier == Barrier::Release && self.shared.job_running() {
            self.shared.gate.resume();
        }
    }

    /// Refresh position and temperatures. Only polls while idle; returns
    /// whether the queries were queued.
    pub fn update_routine(&self) -> Result<bool, BotError> {
        if self.state() != BotState::Connected {
            return Ok(false);
        }
        let queue = self.shared.queue()?;
        let offset = self.shared.transforms.offset;

        let weak = Arc::downgrade(&self.shared);
        let position = Command::new("M114").process(move |_, reply| {
            let Some(shared) = weak.upgrade() else { return true };
            match parse_position(reply) {
                Some(p) => {
                    shared.telemetry.lock().position = Position {
                        x: p.x.map(|x| x - offset[0]),
                        y: p.y.map(|y| y - offset[1]),
                        z: p.z.map(|z| z - offset[2]),
                        e: p.e,
                    };
                }
                None => tracing::error!("Failed to set position from '{}'", reply),
            }
            true
        });

        let weak = Arc::downgrade(&self.shared);
        let temperatures = Command::new("M105").process(move |_, reply| {
            let Some(shared) = weak.upgrade() else { return true };
            let (tool_head, bed) = parse_temperatures(reply);
            let mut telemetry = shared.telemetry.lock();
            if let Some(tool_head) = tool_head {
                telemetry.sensors.tool_head = tool_head;
            }
            if let Some(bed) = bed {
                telemetry.sensors.bed = bed;
            }
            true
        });

        queue.queue_commands([position, temperatures]);
        Ok(true)
    }

    /// Move the tool to its parking spot, pausing a running job first.
    pub fn park(&self) -> Result<(), BotError> {
        let queue = self.shared.queue()?;
        {
            let fsm = self.shared.fsm.lock();
            if fsm.can(BotEvent::Park).is_none() {
                return Err(StateError::InvalidTransition { state: fsm.current(), event: BotEvent::Park }.into());
            }
        }
        let paused_job = match self.shared.job.lock().as_mut() {
            Some(job) if job.is_running() => {
                job.pause()?;
                true
            }
            _ => false,
        };
        self.shared.gate.pause();
        self.shared.fire(BotEvent::Park)?;
        *self.shared.park.lock() = Some(ParkRecord { position: Position::default(), paused_job });

        let builder = ParkSequenceBuilder::new(queue.clone(), ParkSettings::from(&self.shared.config));
        let on_position = Arc::downgrade(&self.shared);
        let on_parked = Arc::downgrade(&self.shared);
        let commands = builder.park_commands(
            move |position| {
                if let Some(shared) = on_position.upgrade() {
                    if let Some(record) = shared.park.lock().as_mut() {
                        record.position = position;
                    }
                }
            },
            move || {
                if let Some(shared) = on_parked.upgrade() {
                    shared.fire_logged(BotEvent::ParkDone);
                }
            },
        );
        queue.prepend_commands(commands);
        tracing::info!("{}: parking", self.name());
        Ok(())
    }

    /// Return from the parking spot and resume a job that park paused.
    pub fn unpark(&self) -> Result<(), BotError> {
        let queue = self.shared.queue()?;
        self.shared.fire(BotEvent::Unpark)?;
        let record = self.shared.park.lock().take().unwrap_or_default();

        let builder = ParkSequenceBuilder::new(queue.clone(), ParkSettings::from(&self.shared.config));
        let weak = Arc::downgrade(&self.shared);
        let paused_job = record.paused_job;
        let commands = builder.unpark_commands(&record.position, move || {
            let Some(shared) = weak.upgrade() else { return };
            shared.fire_logged(BotEvent::UnparkDone);
            if paused_job {
                let resumed = shared.job.lock().as_mut().map(Job::resume);
                match resumed {
                    Some(Ok(())) => {
                        if !shared.settle_job() {
                            shared.resume_production();
                        }
                    }
                    Some(Err(e)) => tracing::warn!("{}: {}", shared.config.name, e),
                    None => {}
                }
            }
        });
        queue.prepend_commands(commands);
        tracing::info!("{}: unparking", self.name());
        Ok(())
    }

    pub fn pause_job(&self) -> Result<(), BotError> {
        self.shared.job.lock().as_mut().ok_or(BotError::NoJob)?.pause()?;
        self.shared.gate.pause();
        Ok(())
    }

    pub fn resume_job(&self) -> Result<(), BotError> {
        let state = self.state();
        if matches!(state, BotState::Parking | BotState::Parked | BotState::ProcessingParkGcode | BotState::Unparking) {
            return Err(BotError::Parked(state));
        }
        self.shared.job.lock().as_mut().ok_or(BotError::NoJob)?.resume()?;
        self.shared.resume_production();
        Ok(())
    }

    /// Stop producing lines. The stop transitions run once the commands
    /// already queued complete.
    pub fn stop_job(&self) -> Result<(), BotError> {
        let queue = self.shared.queue()?;
        let job_id = {
            let mut job = self.shared.job.lock();
            let job = job.as_mut().ok_or(BotError::NoJob)?;
            job.stop()?;
            job.id
        };
        if let Some(streamer) = self.shared.streamer.lock().take() {
            streamer.halt();
        }
        let weak = Arc::downgrade(&self.shared);
        queue.queue_command(Command::hook().post(move || {
            if let Some(shared) = weak.upgrade() {
                shared.on_job_event(JobEvent::Stopped(job_id));
            }
        }));
        tracing::info!("{}: stopping job", self.name());
        Ok(())
    }

    /// Drop everything queued, including a command that will never be
    /// answered, and repair the state the dropped hooks would have restored.
    pub fn clear_queue(&self) -> Result<(), BotError> {
        let queue = self.shared.queue()?;
        queue.clear();

        match self.state() {
            BotState::ProcessingJobGcode => self.shared.fire_logged(BotEvent::JobGcodeDone),
            BotState::ProcessingParkGcode => self.shared.fire_logged(BotEvent::ParkGcodeDone),
            _ => {}
        }

        if !self.shared.settle_job() {
            self.shared.gate.clear_pending();
            self.shared.resume_production();
        }
        Ok(())
    }

    pub fn status(&self) -> BotStatus {
        let state = self.state();
        let telemetry = self.shared.telemetry.lock().clone();
        let job = self.shared.job.lock().as_ref().map(Job::status);
        let collaboration = self.shared.collaboration.lock();
        BotStatus {
            name: self.shared.config.name.clone(),
            state,
            position: telemetry.position,
            sensors: telemetry.sensors,
            checkpoint: collaboration.checkpoint(),
            collaborators: collaboration.collaborators().clone(),
            blocker: collaboration.blocker().clone(),
            percent_complete: job.as_ref().map(|job| job.percent_complete).unwrap_or(0),
            job,
        }
    }

    /// Entries waiting in the queue, including the one in flight.
    pub fn queue_len(&self) -> usize {
        self.shared.queue().map(|queue| queue.len()).unwrap_or(0)
    }

    fn bracket(&self, hooks: AdHocHooks, command: Command) -> Vec<Command> {
        let Some((enter, leave)) = hooks else {
            return vec![command];
        };
        let on_enter = Arc::downgrade(&self.shared);
        let on_leave = Arc::downgrade(&self.shared);
        vec![
            Command::hook().pre(move || {
                if let Some(shared) = on_enter.upgrade() {
                    shared.fire_logged(enter);
                }
            }),
            command,
            Command::hook().pre(move || {
                if let Some(shared) = on_leave.upgrade() {
                    shared.fire_logged(leave);
                }
            }),
        ]
    }
}
