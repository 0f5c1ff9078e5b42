// src/notify.rs - Outbound subscriber notifications
use crate::state::{BotEvent, BotState};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// At most this many notification requests are in flight per notifier.
pub const NOTIFY_CONCURRENCY: usize = 5;
/// Messages waiting for delivery before new ones are dropped.
pub const NOTIFY_BACKLOG: usize = 256;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    pub event: BotEvent,
    pub state: BotState,
    pub bot: String,
}

/// JSON body posted to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum SubscriberMessage {
    NotifyCheckpoint { bot: String, checkpoint: u32 },
    UpdateState { body: StateUpdate },
}

/// Fire-and-forget delivery. Implementations must not block the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: SubscriberMessage);
}

/// Drops every message.
#[derive(Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, message: SubscriberMessage) {
        tracing::trace!("No subscribers for {:?}", message);
    }
}

/// POSTs each message as JSON to every subscriber URL.
///
/// `notify` hands messages to one delivery task, started on first use, that
/// keeps at most [`NOTIFY_CONCURRENCY`] requests open across all messages.
/// When [`NOTIFY_BACKLOG`] messages are already waiting, new ones are dropped
/// with a warning.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    subscribers: Arc<Vec<String>>,
    outbox: Arc<OnceLock<mpsc::Sender<SubscriberMessage>>>,
}

impl HttpNotifier {
    pub fn new(subscribers: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            subscribers: Arc::new(subscribers),
            outbox: Arc::new(OnceLock::new()),
        }
    }

    pub fn subscribers(&self) -> &[String] {
        &self.subscribers
    }

    /// Deliver to every subscriber and wait for all attempts to finish.
    /// Failures are logged.
    pub async fn broadcast(&self, message: &SubscriberMessage) {
        futures_util::stream::iter(self.subscribers.iter())
            .for_each_concurrent(NOTIFY_CONCURRENCY, |url| post(&self.client, url, message))
            .await;
    }

    /// The delivery queue, starting its task on `handle` the first time.
    fn start_outbox(&self, handle: &Handle) -> &mpsc::Sender<SubscriberMessage> {
        self.outbox.get_or_init(|| {
            let (tx, rx) = mpsc::channel(NOTIFY_BACKLOG);
            handle.spawn(deliver(self.client.clone(), self.subscribers.clone(), rx));
            tx
        })
    }
}

impl Notifier for HttpNotifier {
    fn notify(&self, message: SubscriberMessage) {
        if self.subscribers.is_empty() {
            return;
        }
        let outbox = match self.outbox.get() {
            Some(outbox) => outbox,
            None => match Handle::try_current() {
                Ok(handle) => self.start_outbox(&handle),
                Err(e) => {
                    tracing::warn!("Dropping notification {:?}, no async runtime: {}", message, e);
                    return;
                }
            },
        };
        match outbox.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                tracing::warn!("Notification backlog full, dropping {:?}", message);
            }
            Err(TrySendError::Closed(message)) => {
                tracing::warn!("Notification task has stopped, dropping {:?}", message);
            }
        }
    }
}

/// Runs until every sender is gone. Each message fans out to all
/// subscribers; the fan-outs of consecutive messages share one concurrency
/// limit.
async fn deliver(
    client: reqwest::Client,
    subscribers: Arc<Vec<String>>,
    mut rx: mpsc::Receiver<SubscriberMessage>,
) {
    futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx))
        .flat_map(|message| {
            let message = Arc::new(message);
            let targets: Vec<(String, Arc<SubscriberMessage>)> =
                subscribers.iter().map(|url| (url.clone(), message.clone())).collect();
            futures_util::stream::iter(targets)
        })
        .for_each_concurrent(NOTIFY_CONCURRENCY, |(url, message)| {
            let client = client.clone();
            async move { post(&client, &url, &message).await }
        })
        .await;
    tracing::debug!("Notification task finished");
}

async fn post(client: &reqwest::Client, url: &str, message: &SubscriberMessage) {
    let sent = client
        .post(url)
        .timeout(REQUEST_TIMEOUT)
        .json(message)
        .send()
        .await
        .and_then(|resp| resp.error_for_status());
    match sent {
        Ok(_) => tracing::debug!("Notified {}", url),
        Err(e) => tracing::error!("Failed to update endpoint \"{}\": {}", url, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_message_shape() {
        let message = SubscriberMessage::NotifyCheckpoint { bot: "1".into(), checkpoint: 7 };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "command": "notifyCheckpoint", "bot": "1", "checkpoint": 7 })
        );
    }

    #[test]
    fn test_state_message_shape() {
        let message = SubscriberMessage::UpdateState {
            body: StateUpdate { event: BotEvent::ParkDone, state: BotState::Parked, bot: "left".into() },
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["command"], "updateState");
        assert_eq!(json["body"]["event"], "parkDone");
        assert_eq!(json["body"]["state"], "parked");
    }

    #[tokio::test]
    async fn test_unreachable_subscriber_is_logged_not_raised() {
        let notifier = HttpNotifier::new(vec!["http://127.0.0.1:9/unreachable".into()]);
        let message = SubscriberMessage::NotifyCheckpoint { bot: "1".into(), checkpoint: 1 };
        notifier.broadcast(&message).await;
    }

    #[test]
    fn test_notify_outside_runtime_is_dropped() {
        let notifier = HttpNotifier::new(vec!["http://127.0.0.1:9/unreachable".into()]);
        notifier.notify(SubscriberMessage::NotifyCheckpoint { bot: "1".into(), checkpoint: 2 });
        assert!(notifier.outbox.get().is_none());
    }

    #[tokio::test]
    async fn test_full_backlog_drops_without_blocking() {
        let notifier = HttpNotifier::new(vec!["http://127.0.0.1:9/unreachable".into()]);
        for checkpoint in 0..(NOTIFY_BACKLOG as u32 * 2) {
            notifier.notify(SubscriberMessage::NotifyCheckpoint { bot: "1".into(), checkpoint });
        }
        let outbox = notifier.outbox.get().unwrap();
        assert!(outbox.capacity() < NOTIFY_BACKLOG);
    }
}
