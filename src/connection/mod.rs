// src/connection/mod.rs - Device link abstraction
pub mod serial;
pub mod virtual_connection;

pub use serial::SerialConnection;
pub use virtual_connection::VirtualConnection;

use crate::config::{ConnectionConfig, ConnectionKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Serial port error: {0}")]
    Serial(#[from] std::io::Error),
    #[error("Connection is closed")]
    Closed,
}

pub type DataFunc = Box<dyn Fn(String) + Send + Sync>;
pub type ErrorFunc = Box<dyn Fn(String) + Send + Sync>;
pub type CloseFunc = Box<dyn Fn() + Send + Sync>;

/// A command/reply link to one device.
///
/// `send` returns once the device buffer has room for the command; the reply
/// arrives later through the data callback.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, command: &str) -> Result<(), ConnectionError>;
    fn set_data_func(&self, func: DataFunc);
    fn set_error_func(&self, func: ErrorFunc);
    fn set_close_func(&self, func: CloseFunc);
    async fn close(&self) -> Result<(), ConnectionError>;
    /// Commands sent but not yet answered.
    fn outstanding(&self) -> usize;
}

/// Single-slot callback registrations, last writer wins.
#[derive(Default)]
pub struct Callbacks {
    data: Mutex<Option<DataFunc>>,
    error: Mutex<Option<ErrorFunc>>,
    close: Mutex<Option<CloseFunc>>,
}

impl Callbacks {
    pub fn set_data(&self, func: DataFunc) {
        *self.data.lock() = Some(func);
    }

    pub fn set_error(&self, func: ErrorFunc) {
        *self.error.lock() = Some(func);
    }

    pub fn set_close(&self, func: CloseFunc) {
        *self.close.lock() = Some(func);
    }

    pub fn data(&self, reply: String) {
        match self.data.lock().as_ref() {
            Some(func) => func(reply),
            None => tracing::debug!("Dropping reply without data callback: {}", reply),
        }
    }

    pub fn error(&self, message: String) {
        match self.error.lock().as_ref() {
            Some(func) => func(message),
            None => tracing::error!("Connection error: {}", message),
        }
    }

    pub fn close(&self) {
        if let Some(func) = self.close.lock().as_ref() {
            func();
        }
    }
}

/// Models the limited command buffer of the firmware. Admission waits by
/// polling until a slot frees.
#[derive(Debug)]
pub struct OutstandingBuffer {
    count: AtomicUsize,
    capacity: usize,
    poll_interval: Duration,
}

impl OutstandingBuffer {
    pub fn new(capacity: usize, poll_interval: Duration) -> Self {
        Self { count: AtomicUsize::new(0), capacity: capacity.max(1), poll_interval }
    }

    pub async fn admit(&self) {
        let mut waited = false;
        loop {
            let current = self.count.load(Ordering::Acquire);
            if current < self.capacity {
                if self
                    .count
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            if !waited {
                tracing::debug!("Device buffer full ({} outstanding), waiting", current);
                waited = true;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub fn release(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn outstanding(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Open the link described by the configuration.
pub async fn open(config: &ConnectionConfig) -> Result<Arc<dyn Connection>, ConnectionError> {
    match &config.kind {
        ConnectionKind::Virtual => {
            tracing::info!("Using virtual connection");
            Ok(Arc::new(VirtualConnection::new(config)))
        }
        ConnectionKind::Serial { port, baud } => {
            let serial = SerialConnection::open(port, *baud, config)?;
            Ok(Arc::new(serial))
        }
    }
}
