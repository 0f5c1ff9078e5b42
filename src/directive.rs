//! Synchronization directives embedded in instruction files.
//!
//! A directive is a comment line of the form
//! `<prefix>; <<<NAME>>> <payload>`. The format is shared with the job
//! annotators of every collaborating bot and must stay bit-exact.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

static DIRECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\d\s]*; <<<(\w+)>>> (.*)$").expect("directive pattern"));
static BOT_CHECKPOINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.*bot(\w+) : (\d+)$").expect("payload pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectiveError {
    #[error("Unknown directive <<<{0}>>>")]
    Unknown(String),
    #[error("Malformed {name} payload: '{payload}'")]
    MalformedPayload { name: String, payload: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// This bot reached `checkpoint`.
    Checkpoint { bot: String, checkpoint: u32 },
    /// Wait until `bot` has reported at least `checkpoint`.
    Precursor { bot: String, checkpoint: u32 },
    /// Segment without device interaction.
    Dry,
}

impl Directive {
    /// Classify a raw line. `None` means the line is not a directive and
    /// should be treated as an instruction.
    pub fn parse(line: &str) -> Option<Result<Directive, DirectiveError>> {
        let caps = DIRECTIVE.captures(line)?;
        let name = &caps[1];
        let payload = &caps[2];
        let parsed = match name {
            "CHECKPOINT" => parse_bot_checkpoint(name, payload)
                .map(|(bot, checkpoint)| Directive::Checkpoint { bot, checkpoint }),
            "PRECURSOR" => parse_bot_checkpoint(name, payload)
                .map(|(bot, checkpoint)| Directive::Precursor { bot, checkpoint }),
            "DRY" => Ok(Directive::Dry),
            other => Err(DirectiveError::Unknown(other.to_string())),
        };
        Some(parsed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Directive::Checkpoint { .. } => "CHECKPOINT",
            Directive::Precursor { .. } => "PRECURSOR",
            Directive::Dry => "DRY",
        }
    }
}

impl std::fmt::Display for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Directive::Checkpoint { bot, checkpoint } | Directive::Precursor { bot, checkpoint } => {
                write!(f, "; <<<{}>>> bot{} : {}", self.name(), bot, checkpoint)
            }
            Directive::Dry => write!(f, "; <<<DRY>>> "),
        }
    }
}

fn parse_bot_checkpoint(name: &str, payload: &str) -> Result<(String, u32), DirectiveError> {
    let malformed = || DirectiveError::MalformedPayload {
        name: name.to_string(),
        payload: payload.to_string(),
    };
    let caps = BOT_CHECKPOINT.captures(payload).ok_or_else(malformed)?;
    let checkpoint = caps[2].parse::<u32>().map_err(|_| malformed())?;
    Ok((caps[1].to_string(), checkpoint))
}

/// Strip the conventional `bot` prefix so `bot2` and `2` name the same bot.
pub fn normalize_bot_id(name: &str) -> &str {
    name.strip_prefix("bot").filter(|id| !id.is_empty()).unwrap_or(name)
}
