// src/queue.rs - Ordered command queue with single in-flight dispatch
//!
//! Commands are dispatched to the [`Connection`] strictly one at a time: the
//! head is popped, its pre-hook runs, the code is transmitted, and the next
//! command waits until the reply completes the current one. Nothing here
//! times out; an unanswered command holds the queue until [`CommandQueue::clear`].
//!
//! An abandoned command may still be executing on the device. Its reply is
//! delivered before its buffer slot is released, so the dispatcher waits for
//! the connection to drain and discards whatever arrived meanwhile before it
//! transmits anything else.

use crate::connection::Connection;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

const DRAIN_POLL: Duration = Duration::from_millis(10);
/// Upper bound on waiting for an abandoned command to be answered.
const DRAIN_LIMIT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Command '{0}' was dropped before it completed")]
    Abandoned(String),
}

pub type Hook = Box<dyn FnOnce() + Send>;
pub type ProcessData = Box<dyn FnMut(&str, &str) -> bool + Send>;

/// One queue entry. A command without `code` is a pure hook entry and
/// completes as soon as it is dispatched.
#[derive(Default)]
pub struct Command {
    pub code: Option<String>,
    pub pre_callback: Option<Hook>,
    pub post_callback: Option<Hook>,
    /// Receives `(code, reply)`; returning `true` completes the command.
    pub process_data: Option<ProcessData>,
}

impl Command {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: Some(code.into()), ..Default::default() }
    }

    /// An entry that only runs hooks.
    pub fn hook() -> Self {
        Self::default()
    }

    pub fn pre(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.pre_callback = Some(Box::new(hook));
        self
    }

    pub fn post(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.post_callback = Some(Box::new(hook));
        self
    }

    pub fn process(mut self, process: impl FnMut(&str, &str) -> bool + Send + 'static) -> Self {
        self.process_data = Some(Box::new(process));
        self
    }
}

/// Receives the reply that completed a command built with
/// [`Command::with_reply`].
#[derive(Debug)]
pub struct PendingReply {
    code: String,
    rx: oneshot::Receiver<String>,
}

impl PendingReply {
    pub async fn wait(self) -> Result<String, QueueError> {
        self.rx.await.map_err(|_| QueueError::Abandoned(self.code))
    }
}

impl Command {
    /// Capture the completing reply. Existing `process_data` and
    /// `post_callback` hooks still run.
    pub fn with_reply(mut self) -> (Command, PendingReply) {
        let code = self.code.clone().unwrap_or_default();
        let (tx, rx) = oneshot::channel();
        let reply = Arc::new(Mutex::new(None::<String>));
        let captured = reply.clone();
        let mut process = self.process_data.take();
        self.process_data = Some(Box::new(move |code, data| {
            let done = match process.as_mut() {
                Some(process) => process(code, data),
                None => true,
            };
            if done {
                *captured.lock() = Some(data.to_string());
            }
            done
        }));
        let post = self.post_callback.take();
        self.post_callback = Some(Box::new(move || {
            if let Some(post) = post {
                post();
            }
            let _ = tx.send(reply.lock().take().unwrap_or_default());
        }));
        (self, PendingReply { code, rx })
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("code", &self.code)
            .field("pre_callback", &self.pre_callback.is_some())
            .field("post_callback", &self.post_callback.is_some())
            .field("process_data", &self.process_data.is_some())
            .finish()
    }
}

/// What callers hand to the queue: a bare instruction or a full descriptor.
#[derive(Debug)]
pub enum Instruction {
    Plain(String),
    WithHooks(Command),
}

impl Instruction {
    pub fn into_command(self) -> Command {
        match self {
            Instruction::Plain(code) => Command::new(code),
            Instruction::WithHooks(command) => command,
        }
    }
}

impl From<&str> for Instruction {
    fn from(code: &str) -> Self {
        Instruction::Plain(code.to_string())
    }
}

impl From<String> for Instruction {
    fn from(code: String) -> Self {
        Instruction::Plain(code)
    }
}

impl From<Command> for Instruction {
    fn from(command: Command) -> Self {
        Instruction::WithHooks(command)
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Instruction>,
    in_flight: Option<String>,
    busy: bool,
    /// Bumped by `clear` so the dispatcher can abandon the in-flight command.
    generation: u64,
}

struct QueueShared {
    state: Mutex<QueueState>,
    wake: Notify,
    cleared: Notify,
}

/// Cloneable handle to a bot's command queue.
#[derive(Clone)]
pub struct CommandQueue {
    shared: Arc<QueueShared>,
    dispatcher: Arc<JoinHandle<()>>,
}

impl CommandQueue {
    /// Create the queue and spawn its dispatch task. Registers the queue as the
    /// data callback of `connection`.
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            cleared: Notify::new(),
        });
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<String>();
        connection.set_data_func(Box::new(move |reply| {
            let _ = reply_tx.send(reply);
        }));
        let dispatcher = tokio::spawn(dispatch_loop(shared.clone(), connection, reply_rx));
        Self { shared, dispatcher: Arc::new(dispatcher) }
    }

    /// Append to the tail, keeping the order of `commands`.
    pub fn queue_commands<I, T>(&self, commands: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<Instruction>,
    {
        let mut state = self.shared.state.lock();
        state.pending.extend(commands.into_iter().map(Into::into));
        drop(state);
        self.shared.wake.notify_one();
    }

    pub fn queue_command(&self, command: impl Into<Instruction>) {
        self.queue_commands([command]);
    }

    /// Insert ahead of everything not yet dispatched, keeping the order of
    /// `commands`.
    pub fn prepend_commands<I, T>(&self, commands: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<Instruction>,
    {
        let commands: Vec<Instruction> = commands.into_iter().map(Into::into).collect();
        let mut state = self.shared.state.lock();
        for command in commands.into_iter().rev() {
            state.pending.push_front(command);
        }
        drop(state);
        self.shared.wake.notify_one();
    }

    pub fn prepend_command(&self, command: impl Into<Instruction>) {
        self.prepend_commands([command]);
    }

    /// Append `code` and wait for the reply that completes it.
    pub async fn request(&self, code: impl Into<String>) -> Result<String, QueueError> {
        let (command, reply) = Command::new(code).with_reply();
        self.queue_command(command);
        reply.wait().await
    }

    /// Queued plus in-flight entries.
    pub fn len(&self) -> usize {
        let state = self.shared.state.lock();
        state.pending.len() + usize::from(state.busy)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Code of the command awaiting its reply.
    pub fn in_flight(&self) -> Option<String> {
        self.shared.state.lock().in_flight.clone()
    }

    /// Drop every queued command and abandon the in-flight one. Post hooks of
    /// dropped commands never run.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        let dropped = state.pending.len() + usize::from(state.busy);
        state.pending.clear();
        state.generation += 1;
        drop(state);
        tracing::warn!("Command queue cleared, {} entries dropped", dropped);
        self.shared.cleared.notify_waiters();
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if Arc::strong_count(&self.dispatcher) == 1 {
            self.dispatcher.abort();
        }
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("CommandQueue")
            .field("pending", &state.pending.len())
            .field("in_flight", &state.in_flight)
            .finish()
    }
}

async fn dispatch_loop(
    shared: Arc<QueueShared>,
    connection: Arc<dyn Connection>,
    mut replies: mpsc::UnboundedReceiver<String>,
) {
    loop {
        let (instruction, generation) = loop {
            // Register interest before checking so a push between the check and
            // the await is not missed.
            let notified = shared.wake.notified();
            {
                let mut state = shared.state.lock();
                if let Some(next) = state.pending.pop_front() {
                    state.busy = true;
                    break (next, state.generation);
                }
            }
            notified.await;
        };

        let mut command = instruction.into_command();
        if let Some(pre) = command.pre_callback.take() {
            pre();
        }

        if let Some(code) = command.code.clone() {
            while let Ok(stale) = replies.try_recv() {
                tracing::debug!("Discarding unmatched reply: {}", stale);
            }
            shared.state.lock().in_flight = Some(code.clone());
            tracing::debug!("Dispatching: {}", code);

            let completed = 'await_reply: {
                let cleared = shared.cleared.notified();
                tokio::pin!(cleared);
                if shared.state.lock().generation != generation {
                    break 'await_reply false;
                }

                tokio::select! {
                    sent = connection.send(&code) => {
                        if let Err(e) = sent {
                            // Without a transmitted command no reply can arrive.
                            tracing::error!("Failed to send '{}': {}", code, e);
                            cleared.as_mut().await;
                            break 'await_reply false;
                        }
                    }
                    _ = cleared.as_mut() => break 'await_reply false,
                }

                loop {
                    tokio::select! {
                        reply = replies.recv() => match reply {
                            Some(reply) => {
                                tracing::trace!("Reply to '{}': {}", code, reply);
                                let done = match command.process_data.as_mut() {
                                    Some(process) => process(&code, &reply),
                                    None => true,
                                };
                                if done {
                                    break 'await_reply true;
                                }
                            }
                            None => {
                                tracing::error!("Reply channel closed while waiting on '{}'", code);
                                cleared.as_mut().await;
                                break 'await_reply false;
                            }
                        },
                        _ = cleared.as_mut() => break 'await_reply false,
                    }
                }
            };

            if !completed {
                tracing::warn!("Abandoned in-flight command '{}'", code);
                {
                    let mut state = shared.state.lock();
                    state.in_flight = None;
                    state.busy = false;
                }
                drain_abandoned(connection.as_ref(), &mut replies).await;
                continue;
            }
        }

        {
            let mut state = shared.state.lock();
            state.in_flight = None;
            state.busy = false;
        }
        if let Some(post) = command.post_callback.take() {
            post();
        }
    }
}

/// Wait until the device has answered everything it was sent, then drop those
/// answers so none of them completes the next command.
async fn drain_abandoned(connection: &dyn Connection, replies: &mut mpsc::UnboundedReceiver<String>) {
    let started = tokio::time::Instant::now();
    while connection.outstanding() > 0 {
        if started.elapsed() >= DRAIN_LIMIT {
            tracing::warn!(
                "{} abandoned command(s) still unanswered after {:?}",
                connection.outstanding(),
                DRAIN_LIMIT
            );
            break;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
    while let Ok(stale) = replies.try_recv() {
        tracing::debug!("Discarding reply to abandoned command: {}", stale);
    }
}
