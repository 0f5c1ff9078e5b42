//! Park and unpark sequences.
//!
//! Parking moves the tool out of the shared work area: drain motion, read the
//! current position, retract, lift (unless already near the ceiling), travel
//! to the parking spot, then home X/Y. The moves depend on the position, so
//! they are generated only once the `M114` reply arrives and are then
//! prepended ahead of anything else waiting in the queue.

use crate::config::BotConfig;
use crate::queue::{Command, CommandQueue};
use crate::reply::{Position, parse_position};
use crate::transform::format_number;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct ParkSettings {
    pub ceiling: f64,
    pub lift: f64,
    pub retract: f64,
    pub x: f64,
    pub y: f64,
}

impl From<&BotConfig> for ParkSettings {
    fn from(config: &BotConfig) -> Self {
        let (x, y) = config.park_position();
        Self {
            ceiling: config.park.ceiling,
            lift: config.park.lift,
            retract: config.park.retract,
            x,
            y,
        }
    }
}

/// Moves that take the tool from height `z` to the parking spot, ending
/// before the final `G28 X Y`.
pub fn park_moves(z: f64, settings: &ParkSettings) -> Vec<String> {
    let mut moves = vec![
        "G92 E0".to_string(),
        format!("G1 E-{} F3000", format_number(settings.retract)),
    ];
    if z < settings.ceiling - settings.lift {
        moves.push(format!("G1 Z{:.2} F1000", z + settings.lift));
    }
    moves.push(format!(
        "G1 X{} Y{} F3000",
        format_number(settings.x),
        format_number(settings.y)
    ));
    moves
}

/// Moves that return the tool to `parked` and restore the extruder.
pub fn unpark_moves(parked: &Position) -> Vec<String> {
    let mut moves = Vec::new();
    match (parked.x, parked.y) {
        (Some(x), Some(y)) => {
            moves.push(format!("G1 X{} Y{} F3000", format_number(x), format_number(y)))
        }
        _ => tracing::warn!("Parked X/Y unknown, staying at the parking spot"),
    }
    if let Some(z) = parked.z {
        moves.push(format!("G1 Z{:.2} F1000", z));
    }
    moves.push("G1 E0 F3000".to_string());
    if let Some(e) = parked.e {
        moves.push(format!("G92 E{}", format_number(e)));
    }
    moves
}

/// Builds the queue entries for park and unpark on one bot's queue.
#[derive(Debug, Clone)]
pub struct ParkSequenceBuilder {
    queue: CommandQueue,
    settings: ParkSettings,
}

impl ParkSequenceBuilder {
    pub fn new(queue: CommandQueue, settings: ParkSettings) -> Self {
        Self { queue, settings }
    }

    pub fn settings(&self) -> &ParkSettings {
        &self.settings
    }

    /// `M400` and the position query. `on_position` receives the position
    /// the tool was parked from; `on_parked` runs when the final homing move
    /// completes.
    pub fn park_commands(
        &self,
        on_position: impl FnOnce(Position) + Send + 'static,
        on_parked: impl FnOnce() + Send + 'static,
    ) -> Vec<Command> {
        let position: Arc<Mutex<Option<Position>>> = Arc::new(Mutex::new(None));
        let parsed = position.clone();
        let mut on_position = Some(on_position);
        let queue = self.queue.clone();
        let settings = self.settings.clone();

        let query = Command::new("M114")
            .pre(|| tracing::debug!("Starting park movements"))
            .process(move |_, reply| match parse_position(reply) {
                Some(current) => {
                    *parsed.lock() = Some(current);
                    if let Some(callback) = on_position.take() {
                        callback(current);
                    }
                    true
                }
                None => {
                    tracing::error!("Cannot park, unreadable position reply: {}", reply);
                    false
                }
            })
            .post(move || {
                let Some(current) = position.lock().take() else {
                    return;
                };
                // A parsed reply always carries Z.
                let z = current.z.unwrap_or(settings.ceiling);
                let mut moves: Vec<Command> =
                    park_moves(z, &settings).into_iter().map(Command::new).collect();
                moves.push(Command::new("G28 X Y").post(move || {
                    tracing::debug!("Done with park movements");
                    on_parked();
                }));
                queue.prepend_commands(moves);
            });

        vec![Command::new("M400"), query]
    }

    /// Return to `parked`. `on_unparked` runs once the last move completes.
    pub fn unpark_commands(
        &self,
        parked: &Position,
        on_unparked: impl FnOnce() + Send + 'static,
    ) -> Vec<Command> {
        let mut commands: Vec<Command> = unpark_moves(parked).into_iter().map(Command::new).collect();
        commands.push(Command::hook().post(move || {
            tracing::debug!("Done with unpark movements");
            on_unparked();
        }));
        commands
    }
}
