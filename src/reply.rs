//! Parsers for firmware replies to status queries.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static M114: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"X:([+-]?\d+(?:\.\d+)?)\s*Y:([+-]?\d+(?:\.\d+)?)\s*Z:([+-]?\d+(?:\.\d+)?)\s*E:([+-]?\d+(?:\.\d+)?)",
    )
    .expect("position pattern")
});
static TOOL_HEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"T:([+-]?\d+(?:\.\d+)?)\s*/\s*([+-]?\d+(?:\.\d+)?)").expect("tool head pattern")
});
static BED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"B:([+-]?\d+(?:\.\d+)?)\s*/\s*([+-]?\d+(?:\.\d+)?)").expect("bed pattern")
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub e: Option<f64>,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64, e: f64) -> Self {
        Self { x: Some(x), y: Some(y), z: Some(z), e: Some(e) }
    }

    pub fn axis(&self, axis: crate::bot::Axis) -> Option<f64> {
        use crate::bot::Axis;
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::E => self.e,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Heater {
    pub temperature: Option<f64>,
    pub setpoint: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sensors {
    pub tool_head: Heater,
    pub bed: Heater,
}

/// Parse an `M114` reply such as `X:10.00 Y:20.00 Z:0.30 E:1.20 Count X:...`.
pub fn parse_position(reply: &str) -> Option<Position> {
    let caps = M114.captures(reply)?;
    let field = |i: usize| caps[i].parse::<f64>().ok();
    Some(Position { x: field(1), y: field(2), z: field(3), e: field(4) })
        .filter(|p| p.x.is_some() && p.y.is_some() && p.z.is_some() && p.e.is_some())
}

/// Parse an `M105` reply such as `ok T:200.0 /200.0 B:60.0 /60.0`. Heaters
/// missing from the reply are returned as `None` so callers can keep the
/// previous reading.
pub fn parse_temperatures(reply: &str) -> (Option<Heater>, Option<Heater>) {
    let heater = |re: &Regex| {
        re.captures(reply).map(|caps| Heater {
            temperature: caps[1].parse().ok(),
            setpoint: caps[2].parse().ok(),
        })
    };
    (heater(&TOOL_HEAD), heater(&BED))
}
