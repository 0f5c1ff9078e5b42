//! # Bot Configuration
//!
//! Per-bot settings consumed by the line transforms, the jog and park helpers,
//! the subscriber notifier and the connection factory.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! name = "bot1"
//! offset_x = 10.0
//! speed_multiplier = 1.5
//! subscribers = ["http://conductor.local:9000/v1/conducts"]
//!
//! [park]
//! ceiling = 135.0
//! lift = 10.0
//!
//! [connection]
//! type = "serial"
//! port = "/dev/ttyACM0"
//! baud = 115200
//! ```
//!
//! Fields that are missing fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for a single bot.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BotConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub offset_x: f64,
    #[serde(default)]
    pub offset_y: f64,
    #[serde(default)]
    pub offset_z: f64,
    #[serde(default = "default_jog_xy_speed")]
    pub jog_x_speed: f64,
    #[serde(default = "default_jog_xy_speed")]
    pub jog_y_speed: f64,
    #[serde(default = "default_jog_z_speed")]
    pub jog_z_speed: f64,
    #[serde(default = "default_jog_e_speed")]
    pub jog_e_speed: f64,
    /// Scales every `F` word of a motion line.
    #[serde(default = "default_multiplier")]
    pub speed_multiplier: f64,
    /// Scales every `E` word of a motion line.
    #[serde(default = "default_multiplier")]
    pub feed_multiplier: f64,
    /// Endpoints receiving checkpoint and state notifications.
    #[serde(default)]
    pub subscribers: Vec<String>,
    #[serde(default)]
    pub park: ParkConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            offset_x: 0.0,
            offset_y: 0.0,
            offset_z: 0.0,
            jog_x_speed: default_jog_xy_speed(),
            jog_y_speed: default_jog_xy_speed(),
            jog_z_speed: default_jog_z_speed(),
            jog_e_speed: default_jog_e_speed(),
            speed_multiplier: default_multiplier(),
            feed_multiplier: default_multiplier(),
            subscribers: Vec::new(),
            park: ParkConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Geometry of the park sequence.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParkConfig {
    /// Highest reachable Z.
    #[serde(default = "default_ceiling")]
    pub ceiling: f64,
    #[serde(default = "default_lift")]
    pub lift: f64,
    #[serde(default = "default_retract")]
    pub retract: f64,
    /// Falls back to the zone of the bot when unset, see [`BotConfig::park_position`].
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default = "default_park_y")]
    pub y: f64,
}

impl Default for ParkConfig {
    fn default() -> Self {
        Self {
            ceiling: default_ceiling(),
            lift: default_lift(),
            retract: default_retract(),
            x: None,
            y: default_park_y(),
        }
    }
}

/// Which device link to open and how to throttle it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    #[serde(flatten)]
    pub kind: ConnectionKind,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Nominal duration of a simulated move.
    #[serde(default = "default_motion_delay_ms")]
    pub motion_delay_ms: u64,
}

impl ConnectionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn motion_delay(&self) -> Duration {
        Duration::from_millis(self.motion_delay_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            kind: ConnectionKind::Virtual,
            buffer_size: default_buffer_size(),
            poll_interval_ms: default_poll_interval_ms(),
            motion_delay_ms: default_motion_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionKind {
    Virtual,
    Serial {
        port: String,
        #[serde(default = "default_baud")]
        baud: u32,
    },
}

impl BotConfig {
    /// X/Y coordinate of this bot's parking spot. Bots share one work area, so
    /// bot 1 parks on the left edge and every other bot on the right edge
    /// unless the configuration says otherwise.
    pub fn park_position(&self) -> (f64, f64) {
        let x = self.park.x.unwrap_or_else(|| {
            if crate::directive::normalize_bot_id(&self.name) == "1" {
                5.0
            } else {
                495.0
            }
        });
        (x, self.park.y)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("Bot name cannot be empty".to_string()));
        }
        if self.speed_multiplier <= 0.0 {
            return Err(ConfigError::Invalid("speed_multiplier must be > 0".to_string()));
        }
        if self.feed_multiplier <= 0.0 {
            return Err(ConfigError::Invalid("feed_multiplier must be > 0".to_string()));
        }
        if self.connection.buffer_size == 0 {
            return Err(ConfigError::Invalid("connection.buffer_size must be > 0".to_string()));
        }
        if self.park.lift < 0.0 || self.park.retract < 0.0 {
            return Err(ConfigError::Invalid("park lift and retract must be >= 0".to_string()));
        }
        Ok(())
    }
}

// Default value functions
fn default_name() -> String { "bot1".to_string() }
fn default_jog_xy_speed() -> f64 { 2000.0 }
fn default_jog_z_speed() -> f64 { 1000.0 }
fn default_jog_e_speed() -> f64 { 120.0 }
fn default_multiplier() -> f64 { 1.0 }
fn default_ceiling() -> f64 { 135.0 }
fn default_lift() -> f64 { 10.0 }
fn default_retract() -> f64 { 2.0 }
fn default_park_y() -> f64 { 238.0 }
fn default_buffer_size() -> usize { 32 }
fn default_poll_interval_ms() -> u64 { 100 }
fn default_motion_delay_ms() -> u64 { 100 }
fn default_baud() -> u32 { 115200 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<BotConfig, ConfigError> {
    let config: BotConfig = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}
