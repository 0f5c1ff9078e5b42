//! Per-bot rewrites applied to motion lines before they are queued.

use crate::config::BotConfig;
use regex::{Captures, Regex};
use std::sync::LazyLock;

static WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z])\s*([+-]?(?:\d+\.?\d*|\.\d+))").expect("word pattern")
});

/// Line rewriting settings, copied out of [`BotConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transforms {
    pub offset: [f64; 3],
    pub speed_multiplier: f64,
    pub feed_multiplier: f64,
}

impl Default for Transforms {
    fn default() -> Self {
        Self { offset: [0.0; 3], speed_multiplier: 1.0, feed_multiplier: 1.0 }
    }
}

impl From<&BotConfig> for Transforms {
    fn from(config: &BotConfig) -> Self {
        Self {
            offset: [config.offset_x, config.offset_y, config.offset_z],
            speed_multiplier: config.speed_multiplier,
            feed_multiplier: config.feed_multiplier,
        }
    }
}

impl Transforms {
    /// Offset, then speed, then feed.
    pub fn apply(&self, line: &str) -> String {
        let line = self.add_offset(line);
        let line = self.add_speed_multiplier(&line);
        self.add_feed_multiplier(&line)
    }

    /// Shift X/Y/Z targets of a move into this bot's coordinate frame.
    pub fn add_offset(&self, line: &str) -> String {
        if self.offset == [0.0; 3] {
            return line.to_string();
        }
        let offset = self.offset;
        rewrite_motion_words(line, |letter, value| match letter {
            'X' => Some(value + offset[0]),
            'Y' => Some(value + offset[1]),
            'Z' => Some(value + offset[2]),
            _ => None,
        })
    }

    pub fn add_speed_multiplier(&self, line: &str) -> String {
        if self.speed_multiplier == 1.0 {
            return line.to_string();
        }
        let multiplier = self.speed_multiplier;
        rewrite_motion_words(line, |letter, value| (letter == 'F').then(|| value * multiplier))
    }

    pub fn add_feed_multiplier(&self, line: &str) -> String {
        if self.feed_multiplier == 1.0 {
            return line.to_string();
        }
        let multiplier = self.feed_multiplier;
        rewrite_motion_words(line, |letter, value| (letter == 'E').then(|| value * multiplier))
    }
}

/// `G0`..`G3`; everything else passes through untouched.
pub fn is_motion(line: &str) -> bool {
    let head: String = line
        .trim_start()
        .chars()
        .take_while(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    let head = head.split(|c: char| c.is_ascii_alphabetic() && c != 'G').next().unwrap_or("");
    matches!(head, "G0" | "G1" | "G2" | "G3" | "G00" | "G01" | "G02" | "G03")
}

fn rewrite_motion_words<F>(line: &str, mut rewrite: F) -> String
where
    F: FnMut(char, f64) -> Option<f64>,
{
    if !is_motion(line) {
        return line.to_string();
    }
    let mut first = true;
    WORD.replace_all(line, |caps: &Captures| {
        // The command word itself (G1) is never rewritten.
        if std::mem::take(&mut first) {
            return caps[0].to_string();
        }
        let letter = caps[1].chars().next().unwrap_or(' ').to_ascii_uppercase();
        match caps[2].parse::<f64>().ok().and_then(|value| rewrite(letter, value)) {
            Some(new_value) => format!("{}{}", &caps[1], format_number(new_value)),
            None => caps[0].to_string(),
        }
    })
    .into_owned()
}

/// Three decimals at most, trailing zeros trimmed.
pub fn format_number(value: f64) -> String {
    let formatted = format!("{:.3}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "-0" | "" => "0".to_string(),
        other => other.to_string(),
    }
}
