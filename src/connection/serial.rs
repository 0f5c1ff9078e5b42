// src/connection/serial.rs - Line-oriented serial link to real firmware
use super::{Callbacks, CloseFunc, Connection, ConnectionError, DataFunc, ErrorFunc, OutstandingBuffer};
use crate::config::ConnectionConfig;
use async_trait::async_trait;
use serial2_tokio::SerialPort;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;

/// Serial connection to a Marlin-style firmware.
///
/// Firmware replies may span several lines (`M114` prints the position, then
/// `ok`). The reader task accumulates lines until the `ok` terminator and
/// delivers the whole reply at once.
pub struct SerialConnection {
    port: Arc<SerialPort>,
    port_name: String,
    callbacks: Arc<Callbacks>,
    buffer: Arc<OutstandingBuffer>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl SerialConnection {
    /// Open `port_name` and start the reader task. Must be called from within a
    /// tokio runtime.
    pub fn open(port_name: &str, baud: u32, config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        tracing::info!("Connecting to device on {} at {} baud", port_name, baud);
        let port = Arc::new(SerialPort::open(port_name, baud)?);
        let callbacks = Arc::new(Callbacks::default());
        let buffer = Arc::new(OutstandingBuffer::new(config.buffer_size, config.poll_interval()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            port.clone(),
            callbacks.clone(),
            buffer.clone(),
            closed.clone(),
        ));

        tracing::info!("Connected to {}", port_name);
        Ok(Self {
            port,
            port_name: port_name.to_string(),
            callbacks,
            buffer,
            closed,
            reader,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Names of serial ports present on this host.
    pub fn available_ports() -> Vec<String> {
        match SerialPort::available_ports() {
            Ok(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
            Err(e) => {
                tracing::warn!("Failed to list serial ports: {}", e);
                vec![]
            }
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), ConnectionError> {
        let packet = format!("{}\n", line);
        let mut bytes = packet.as_bytes();
        while !bytes.is_empty() {
            let n = self.port.write(bytes).await?;
            if n == 0 {
                return Err(ConnectionError::Closed);
            }
            bytes = &bytes[n..];
        }
        Ok(())
    }
}

async fn read_loop(
    port: Arc<SerialPort>,
    callbacks: Arc<Callbacks>,
    buffer: Arc<OutstandingBuffer>,
    closed: Arc<AtomicBool>,
) {
    let mut chunk = [0u8; 256];
    let mut partial = String::new();
    let mut reply_lines: Vec<String> = Vec::new();

    loop {
        let n = match port.read(&mut chunk).await {
            Ok(0) => {
                tracing::info!("Serial connection closed by remote");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                if closed.load(Ordering::Acquire) {
                    break;
                }
                tracing::error!("Serial read error: {}", e);
                callbacks.error(e.to_string());
                break;
            }
        };
        partial.push_str(&String::from_utf8_lossy(&chunk[..n]));

        while let Some(idx) = partial.find('\n') {
            let line: String = partial.drain(..=idx).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            tracing::debug!("Serial RX: {}", line);
            if line.starts_with("ok") {
                reply_lines.push(line.to_string());
                let reply = reply_lines.join("\n");
                reply_lines.clear();
                callbacks.data(reply);
                buffer.release();
            } else if line.starts_with("Error") || line.starts_with("error") {
                callbacks.error(line.to_string());
            } else if line.starts_with("echo:busy") {
                tracing::trace!("Firmware busy");
            } else {
                reply_lines.push(line.to_string());
            }
        }
    }
    callbacks.close();
}

#[async_trait]
impl Connection for SerialConnection {
    async fn send(&self, command: &str) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        self.buffer.admit().await;
        tracing::debug!("Serial TX: {}", command);
        if let Err(e) = self.write_line(command.trim()).await {
            self.buffer.release();
            tracing::error!("Serial write error: {}", e);
            return Err(e);
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
        tracing::info!("Closing serial connection {}", self.port_name);
        self.closed.store(true, Ordering::Release);
        self.reader.abort();
        self.callbacks.close();
        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.buffer.outstanding()
    }
}

impl std::fmt::Debug for SerialConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialConnection")
            .field("port_name", &self.port_name)
            .field("outstanding", &self.buffer.outstanding())
            .finish()
    }
}
