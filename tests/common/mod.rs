// Shared helpers for integration tests
#![allow(dead_code)]

use conductor_rs::Bot;
use conductor_rs::config::{BotConfig, ConnectionConfig};
use conductor_rs::connection::VirtualConnection;
use conductor_rs::notify::{Notifier, SubscriberMessage};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<SubscriberMessage>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: SubscriberMessage) {
        self.messages.lock().push(message);
    }
}

pub fn fast_connection_config() -> ConnectionConfig {
    ConnectionConfig { poll_interval_ms: 5, motion_delay_ms: 2, ..Default::default() }
}

pub fn virtual_connection(position: [f64; 4]) -> Arc<VirtualConnection> {
    Arc::new(VirtualConnection::new(&fast_connection_config()).with_position(position))
}

/// A bot connected to a fresh simulated device.
pub fn connected_bot(
    config: BotConfig,
    position: [f64; 4],
) -> (Bot, Arc<VirtualConnection>, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let bot = Bot::with_notifier(config, notifier.clone()).unwrap();
    let connection = virtual_connection(position);
    bot.connect_with(connection.clone()).unwrap();
    (bot, connection, notifier)
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
