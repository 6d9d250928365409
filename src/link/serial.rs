use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, warn};

use crate::core::{Config, Error, Result};
use super::channel::{Channel, DataSink};

/// Read timeout of the reader thread, bounds how long it outlives `close`
const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Channel over a serial port
pub struct SerialChannel {
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
    reader: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl SerialChannel {
    /// Creates a channel for a port; nothing is opened yet
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        SerialChannel {
            path: path.into(),
            baud_rate,
            port: None,
            reader: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a channel from the port settings of a configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate_serial()?;
        Ok(Self::new(config.port.clone(), config.baud_rate))
    }

    /// Names of the serial ports present on this machine
    pub fn available_ports() -> Result<Vec<String>> {
        Ok(serialport::available_ports()?
            .into_iter()
            .map(|info| info.port_name)
            .collect())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

impl Channel for SerialChannel {
    fn open(&mut self, sink: DataSink) -> Result<()> {
        if self.is_open() {
            return Err(Error::channel(format!("{} is already open", self.path)));
        }

        let port = serialport::new(self.path.as_str(), self.baud_rate)
            .timeout(READ_TIMEOUT)
            .open()?;
        let reader_port = port.try_clone()?;

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let path = self.path.clone();
        let reader = thread::Builder::new()
            .name(format!("scom-reader {}", self.path))
            .spawn(move || read_loop(reader_port, sink, running, path))?;

        debug!(port = %self.path, baud_rate = self.baud_rate, "serial port opened");
        self.port = Some(port);
        self.reader = Some(reader);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::ConnectionClosed)?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    /// Stops the reader without waiting for it
    ///
    /// Runs on the async driver, so the reader is detached rather than
    /// joined; it exits within one read timeout and drops its port handle.
    fn close(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        if self.port.take().is_some() {
            debug!(port = %self.path, "serial port closed");
        }
        if let Some(reader) = self.reader.take() {
            if reader.is_finished() && reader.join().is_err() {
                return Err(Error::channel(format!("reader thread for {} panicked", self.path)));
            }
        }
        Ok(())
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close serial channel");
        }
    }
}

/// Forwards everything read from the port until stopped or the link is gone
fn read_loop<R: Read>(mut port: R, sink: DataSink, running: Arc<AtomicBool>, path: String) {
    let mut buf = [0u8; 64];
    while running.load(Ordering::Acquire) && !sink.is_closed() {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                if !sink.on_data(&buf[..n]) {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {
                continue
            }
            Err(e) => {
                warn!(port = %path, error = %e, "serial read failed");
                break;
            }
        }
    }
    debug!(port = %path, "serial reader stopped");
}
