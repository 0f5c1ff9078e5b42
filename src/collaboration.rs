//! Checkpoint bookkeeping for bots that share one multi-part job.
//!
//! Each bot announces the checkpoints it passes and may block on another
//! bot's checkpoint before continuing. The collaborator map is only ever
//! replaced from outside; nothing here infers another bot's progress.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocker {
    pub bot: Option<String>,
    pub checkpoint: Option<u32>,
}

/// What the streamer should do after a directive or a map update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    Release,
    Hold,
}

#[derive(Debug, Clone, Default)]
pub struct CollaborationCoordinator {
    checkpoint: Option<u32>,
    collaborators: HashMap<String, u32>,
    blocker: Blocker,
    awaiting_precursor: bool,
}

impl CollaborationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint(&self) -> Option<u32> {
        self.checkpoint
    }

    pub fn collaborators(&self) -> &HashMap<String, u32> {
        &self.collaborators
    }

    pub fn blocker(&self) -> &Blocker {
        &self.blocker
    }

    pub fn is_awaiting_precursor(&self) -> bool {
        self.awaiting_precursor
    }

    pub fn record_checkpoint(&mut self, checkpoint: u32) {
        tracing::info!("Reached checkpoint {}", checkpoint);
        self.checkpoint = Some(checkpoint);
    }

    /// Install a new blocker and evaluate it against the current map.
    pub fn set_precursor(&mut self, bot: &str, checkpoint: u32) -> Barrier {
        self.blocker = Blocker { bot: Some(bot.to_string()), checkpoint: Some(checkpoint) };
        let barrier = self.evaluate();
        self.awaiting_precursor = barrier == Barrier::Hold;
        if self.awaiting_precursor {
            tracing::info!("Waiting for bot {} to reach checkpoint {}", bot, checkpoint);
        }
        barrier
    }

    /// Replace the collaborator map. Returns `Release` only when a held
    /// precursor is now satisfied; later updates return `Hold` until another
    /// precursor blocks.
    pub fn update_collaborators(&mut self, collaborators: HashMap<String, u32>) -> Barrier {
        self.collaborators = collaborators;
        if !self.awaiting_precursor {
            return Barrier::Hold;
        }
        let barrier = self.evaluate();
        if barrier == Barrier::Release {
            tracing::info!(
                "Precursor satisfied: bot {:?} reached {:?}",
                self.blocker.bot,
                self.blocker.checkpoint
            );
            self.awaiting_precursor = false;
        }
        barrier
    }

    /// Drop a hold left over from the previous job. The last checkpoint, the
    /// blocker and the collaborator map stay until a directive or an outside
    /// update replaces them.
    pub fn reset(&mut self) {
        self.awaiting_precursor = false;
    }

    fn evaluate(&self) -> Barrier {
        let (Some(bot), Some(needed)) = (&self.blocker.bot, self.blocker.checkpoint) else {
            return Barrier::Release;
        };
        match self.collaborators.get(bot) {
            Some(&reached) if reached >= needed => Barrier::Release,
            _ => Barrier::Hold,
        }
    }
}
