// src/lib.rs - Host for collaborating motion-control bots
pub mod bot;
pub mod collaboration;
pub mod config;
pub mod connection;
pub mod directive;
pub mod job;
pub mod notify;
pub mod park;
pub mod queue;
pub mod reply;
pub mod source;
pub mod state;
pub mod streamer;
pub mod transform;

pub use bot::{Axis, Bot, BotError, BotStatus};
pub use config::{BotConfig, load_config};
pub use job::{JobDescriptor, JobState};
pub use state::{BotEvent, BotState};
