// src/state.rs - Bot operational state machine
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BotState {
    Disconnected,
    Connecting,
    Connected,
    StartingJob,
    ProcessingJob,
    ProcessingJobGcode,
    Stopping,
    Parking,
    Parked,
    ProcessingParkGcode,
    Unparking,
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BotState::Disconnected => "disconnected",
            BotState::Connecting => "connecting",
            BotState::Connected => "connected",
            BotState::StartingJob => "startingJob",
            BotState::ProcessingJob => "processingJob",
            BotState::ProcessingJobGcode => "processingJobGcode",
            BotState::Stopping => "stopping",
            BotState::Parking => "parking",
            BotState::Parked => "parked",
            BotState::ProcessingParkGcode => "processingParkGcode",
            BotState::Unparking => "unparking",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BotEvent {
    Connect,
    ConnectDone,
    ConnectFail,
    Disconnect,
    Start,
    StartDone,
    Stop,
    StopDone,
    JobToGcode,
    JobGcodeDone,
    Park,
    ParkDone,
    ParkToGcode,
    ParkGcodeDone,
    Unpark,
    UnparkDone,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Cannot {event:?} from state {state}")]
    InvalidTransition { state: BotState, event: BotEvent },
    #[error("Cannot process gcode from state {0}")]
    AdHocNotAllowed(BotState),
}

/// Events fired around an ad-hoc instruction: the first before it is sent,
/// the second once it completes.
pub type AdHocHooks = Option<(BotEvent, BotEvent)>;

#[derive(Debug, Clone)]
pub struct BotStateMachine {
    state: BotState,
    /// Where `Park` was issued from, restored by `UnparkDone`.
    parked_from: Option<BotState>,
}

impl Default for BotStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl BotStateMachine {
    pub fn new() -> Self {
        Self { state: BotState::Disconnected, parked_from: None }
    }

    pub fn current(&self) -> BotState {
        self.state
    }

    /// Target state for `event` from the current state, without applying it.
    pub fn can(&self, event: BotEvent) -> Option<BotState> {
        use BotEvent::*;
        use BotState::*;
        let to = match (self.state, event) {
            (Disconnected, Connect) => Connecting,
            (Connecting, ConnectDone) => Connected,
            (Connecting, ConnectFail) => Disconnected,
            (from, Disconnect) if from != Disconnected => Disconnected,
            (BotState::Connected, Start) => StartingJob,
            (StartingJob, StartDone) => ProcessingJob,
            (ProcessingJob | ProcessingJobGcode | StartingJob | Parked, Stop) => Stopping,
            (Stopping, StopDone) => BotState::Connected,
            (ProcessingJob, JobToGcode) => ProcessingJobGcode,
            (ProcessingJobGcode, JobGcodeDone) => ProcessingJob,
            (BotState::Connected | ProcessingJob, BotEvent::Park) => Parking,
            (Parking, ParkDone) => Parked,
            (Parked, ParkToGcode) => ProcessingParkGcode,
            (ProcessingParkGcode, ParkGcodeDone) => Parked,
            (Parked, BotEvent::Unpark) => Unparking,
            (Unparking, UnparkDone) => self.parked_from.unwrap_or(BotState::Connected),
            _ => return None,
        };
        Some(to)
    }

    pub fn fire(&mut self, event: BotEvent) -> Result<BotState, StateError> {
        let to = self
            .can(event)
            .ok_or(StateError::InvalidTransition { state: self.state, event })?;
        let from = self.state;
        match event {
            BotEvent::Park => self.parked_from = Some(from),
            BotEvent::UnparkDone | BotEvent::Disconnect | BotEvent::Stop => self.parked_from = None,
            _ => {}
        }
        self.state = to;
        tracing::debug!("Bot state {} -> {} ({:?})", from, to, event);
        Ok(to)
    }

    /// Bracketing events for an ad-hoc instruction issued in the current state.
    pub fn ad_hoc_hooks(&self) -> Result<AdHocHooks, StateError> {
        match self.state {
            BotState::Connected => Ok(None),
            BotState::ProcessingJob => Ok(Some((BotEvent::JobToGcode, BotEvent::JobGcodeDone))),
            BotState::Parked => Ok(Some((BotEvent::ParkToGcode, BotEvent::ParkGcodeDone))),
            other => Err(StateError::AdHocNotAllowed(other)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state != BotState::Disconnected && self.state != BotState::Connecting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_in(events: &[BotEvent]) -> BotStateMachine {
        let mut fsm = BotStateMachine::new();
        for event in events {
            fsm.fire(*event).unwrap();
        }
        fsm
    }

    #[test]
    fn test_connect_and_job_lifecycle() {
        let mut fsm = machine_in(&[BotEvent::Connect, BotEvent::ConnectDone]);
        assert_eq!(fsm.current(), BotState::Connected);
        assert_eq!(fsm.fire(BotEvent::Start), Ok(BotState::StartingJob));
        assert_eq!(fsm.fire(BotEvent::StartDone), Ok(BotState::ProcessingJob));
        assert_eq!(fsm.fire(BotEvent::Stop), Ok(BotState::Stopping));
        assert_eq!(fsm.fire(BotEvent::StopDone), Ok(BotState::Connected));
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let mut fsm = BotStateMachine::new();
        let err = fsm.fire(BotEvent::Start).unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidTransition { state: BotState::Disconnected, event: BotEvent::Start }
        );
        assert_eq!(fsm.current(), BotState::Disconnected);
        assert!(fsm.fire(BotEvent::Disconnect).is_err());
    }

    #[test]
    fn test_unpark_returns_to_origin() {
        let mut fsm = machine_in(&[
            BotEvent::Connect,
            BotEvent::ConnectDone,
            BotEvent::Start,
            BotEvent::StartDone,
            BotEvent::Park,
            BotEvent::ParkDone,
            BotEvent::Unpark,
        ]);
        assert_eq!(fsm.fire(BotEvent::UnparkDone), Ok(BotState::ProcessingJob));

        let mut idle = machine_in(&[
            BotEvent::Connect,
            BotEvent::ConnectDone,
            BotEvent::Park,
            BotEvent::ParkDone,
            BotEvent::Unpark,
        ]);
        assert_eq!(idle.fire(BotEvent::UnparkDone), Ok(BotState::Connected));
    }

    #[test]
    fn test_ad_hoc_hooks_by_state() {
        let mut fsm = machine_in(&[BotEvent::Connect, BotEvent::ConnectDone]);
        assert_eq!(fsm.ad_hoc_hooks(), Ok(None));
        fsm.fire(BotEvent::Start).unwrap();
        assert_eq!(fsm.ad_hoc_hooks(), Err(StateError::AdHocNotAllowed(BotState::StartingJob)));
        fsm.fire(BotEvent::StartDone).unwrap();
        assert_eq!(
            fsm.ad_hoc_hooks(),
            Ok(Some((BotEvent::JobToGcode, BotEvent::JobGcodeDone)))
        );
        fsm.fire(BotEvent::Park).unwrap();
        fsm.fire(BotEvent::ParkDone).unwrap();
        assert_eq!(
            fsm.ad_hoc_hooks(),
            Ok(Some((BotEvent::ParkToGcode, BotEvent::ParkGcodeDone)))
        );
    }

    #[test]
    fn test_stop_from_parked() {
        let mut fsm = machine_in(&[
            BotEvent::Connect,
            BotEvent::ConnectDone,
            BotEvent::Park,
            BotEvent::ParkDone,
        ]);
        assert_eq!(fsm.fire(BotEvent::Stop), Ok(BotState::Stopping));
        assert_eq!(fsm.fire(BotEvent::StopDone), Ok(BotState::Connected));
    }

    #[test]
    fn test_disconnect_from_anywhere() {
        let mut fsm = machine_in(&[BotEvent::Connect, BotEvent::ConnectDone, BotEvent::Start]);
        assert_eq!(fsm.fire(BotEvent::Disconnect), Ok(BotState::Disconnected));
        assert!(!fsm.is_connected());
    }
}
