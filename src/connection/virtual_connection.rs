//! Simulated Marlin firmware.
//!
//! Answers the instruction classes a job or the park helper needs, with
//! realistic delays, and deliberately never answers anything else so a stalled
//! queue can be reproduced without hardware.

use super::{Callbacks, CloseFunc, Connection, ConnectionError, DataFunc, ErrorFunc, OutstandingBuffer};
use crate::config::ConnectionConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct SimState {
    position: [f64; 4],
    tool_head: (f64, f64),
    bed: (f64, f64),
    history: Vec<String>,
}

pub struct VirtualConnection {
    callbacks: Arc<Callbacks>,
    buffer: Arc<OutstandingBuffer>,
    state: Arc<Mutex<SimState>>,
    motion_delay: Duration,
    closed: AtomicBool,
}

impl VirtualConnection {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            callbacks: Arc::new(Callbacks::default()),
            buffer: Arc::new(OutstandingBuffer::new(config.buffer_size, config.poll_interval())),
            state: Arc::new(Mutex::new(SimState {
                tool_head: (21.0, 0.0),
                bed: (21.0, 0.0),
                ..Default::default()
            })),
            motion_delay: config.motion_delay(),
            closed: AtomicBool::new(false),
        }
    }

    /// Start the simulated tool at `[x, y, z, e]`.
    pub fn with_position(self, position: [f64; 4]) -> Self {
        self.state.lock().position = position;
        self
    }

    pub fn position(&self) -> [f64; 4] {
        self.state.lock().position
    }

    /// Every command received so far, in order.
    pub fn history(&self) -> Vec<String> {
        self.state.lock().history.clone()
    }

    /// Returns the delay and reply for a recognized command, `None` otherwise.
    fn simulate(&self, command: &str) -> Option<(Duration, String)> {
        let mut tokens = command.split_whitespace();
        let prefix = tokens.next()?.to_ascii_uppercase();
        let words: Vec<(char, Option<f64>)> = tokens
            .filter_map(|token| {
                let mut chars = token.chars();
                let letter = chars.next()?.to_ascii_uppercase();
                Some((letter, chars.as_str().parse::<f64>().ok()))
            })
            .collect();
        let word = |letter: char| words.iter().find(|(l, _)| *l == letter).and_then(|(_, v)| *v);

        let mut state = self.state.lock();
        state.history.push(command.to_string());
        let ok = "ok".to_string();
        match prefix.as_str() {
            "G4" => {
                let delay = match (word('P'), word('S')) {
                    (Some(ms), _) => Duration::from_millis(ms.max(0.0) as u64),
                    (None, Some(s)) => Duration::from_secs_f64(s.max(0.0)),
                    _ => Duration::ZERO,
                };
                Some((delay, ok))
            }
            "G0" | "G1" => {
                for (i, axis) in ['X', 'Y', 'Z', 'E'].into_iter().enumerate() {
                    if let Some(value) = word(axis) {
                        state.position[i] = value;
                    }
                }
                Some((self.motion_delay, ok))
            }
            "G28" => {
                let named: Vec<usize> = ['X', 'Y', 'Z']
                    .into_iter()
                    .enumerate()
                    .filter(|(_, axis)| words.iter().any(|(l, _)| l == axis))
                    .map(|(i, _)| i)
                    .collect();
                let axes = if named.is_empty() { vec![0, 1, 2] } else { named };
                for i in axes {
                    state.position[i] = 0.0;
                }
                Some((self.motion_delay, ok))
            }
            "G92" => {
                for (i, axis) in ['X', 'Y', 'Z', 'E'].into_iter().enumerate() {
                    if let Some(value) = word(axis) {
                        state.position[i] = value;
                    }
                }
                Some((Duration::ZERO, ok))
            }
            "M114" => {
                let [x, y, z, e] = state.position;
                Some((
                    Duration::ZERO,
                    format!("X:{:.2} Y:{:.2} Z:{:.2} E:{:.2} Count X:0 Y:0 Z:0\nok", x, y, z, e),
                ))
            }
            "M104" | "M109" => {
                if let Some(target) = word('S') {
                    state.tool_head = (target, target);
                }
                Some((Duration::ZERO, ok))
            }
            "M140" | "M190" => {
                if let Some(target) = word('S') {
                    state.bed = (target, target);
                }
                Some((Duration::ZERO, ok))
            }
            "M105" => Some((
                Duration::ZERO,
                format!(
                    "ok T:{:.1} /{:.1} B:{:.1} /{:.1} @:0 B@:0",
                    state.tool_head.0, state.tool_head.1, state.bed.0, state.bed.1
                ),
            )),
            "M400" => Some((Duration::ZERO, ok)),
            _ => None,
        }
    }
}

#[async_trait]
impl Connection for VirtualConnection {
    async fn send(&self, command: &str) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        self.buffer.admit().await;
        let command = command.trim();
        tracing::trace!("Virtual TX: {}", command);
        match self.simulate(command) {
            Some((delay, reply)) => {
                let buffer = self.buffer.clone();
                let callbacks = self.callbacks.clone();
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    callbacks.data(reply);
                    buffer.release();
                });
            }
            None => {
                // The command never occupies the device buffer and is never answered.
                tracing::error!("Command not supported: {}", command);
                self.buffer.release();
            }
        }
        Ok(())
    }

    fn set_data_func(&self, func: DataFunc) {
        self.callbacks.set_data(func);
    }

    fn set_error_func(&self, func: ErrorFunc) {
        self.callbacks.set_error(func);
    }

    fn set_close_func(&self, func: CloseFunc) {
        self.callbacks.set_close(func);
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.closed.store(true, Ordering::Release);
        self.callbacks.close();
        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.buffer.outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig { poll_interval_ms: 5, motion_delay_ms: 5, ..Default::default() }
    }

    fn connect(conn: &VirtualConnection) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        conn.set_data_func(Box::new(move |reply| {
            let _ = tx.send(reply);
        }));
        rx
    }

    #[tokio::test]
    async fn test_motion_and_position_report() {
        let conn = VirtualConnection::new(&fast_config());
        let mut replies = connect(&conn);
        conn.send("G1 X10 Y20 Z0.3 F1500").await.unwrap();
        assert_eq!(replies.recv().await.unwrap(), "ok");
        conn.send("M114").await.unwrap();
        let reply = replies.recv().await.unwrap();
        assert!(reply.starts_with("X:10.00 Y:20.00 Z:0.30 E:0.00"));
    }

    #[tokio::test]
    async fn test_dwell_waits() {
        let conn = VirtualConnection::new(&fast_config());
        let mut replies = connect(&conn);
        let started = tokio::time::Instant::now();
        conn.send("G4 P50").await.unwrap();
        assert_eq!(replies.recv().await.unwrap(), "ok");
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_unsupported_command_never_replies() {
        let conn = VirtualConnection::new(&fast_config());
        let mut replies = connect(&conn);
        conn.send("M999").await.unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(100), replies.recv()).await;
        assert!(waited.is_err());
        assert_eq!(conn.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_thirty_third_send_waits_for_capacity() {
        let conn = Arc::new(VirtualConnection::new(&fast_config()));
        let mut replies = connect(&conn);
        for _ in 0..32 {
            conn.send("G4 P200").await.unwrap();
        }
        assert_eq!(conn.outstanding(), 32);

        let started = tokio::time::Instant::now();
        conn.send("G4 P0").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
        // At least one of the first 32 completed before the 33rd was admitted.
        assert_eq!(replies.recv().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_home_and_temperatures() {
        let conn = VirtualConnection::new(&fast_config()).with_position([5.0, 6.0, 7.0, 1.0]);
        let mut replies = connect(&conn);
        conn.send("G28 X Y").await.unwrap();
        replies.recv().await.unwrap();
        assert_eq!(conn.position(), [0.0, 0.0, 7.0, 1.0]);

        conn.send("M104 S210").await.unwrap();
        replies.recv().await.unwrap();
        conn.send("M105").await.unwrap();
        let reply = replies.recv().await.unwrap();
        assert!(reply.contains("T:210.0 /210.0"));
        assert_eq!(conn.history(), vec!["G28 X Y", "M104 S210", "M105"]);
    }

    #[tokio::test]
    async fn test_close_invokes_callback_and_rejects_sends() {
        let conn = VirtualConnection::new(&fast_config());
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        conn.set_close_func(Box::new(move || flag.store(true, Ordering::SeqCst)));
        conn.close().await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert!(matches!(conn.send("G1 X1").await, Err(ConnectionError::Closed)));
    }
}
