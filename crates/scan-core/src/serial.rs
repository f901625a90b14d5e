//! Serial link to the stage controller.
//!
//! The controller speaks a line-oriented ASCII protocol: every command is a
//! comma-separated frame terminated by `\n`, and the controller acknowledges
//! with a reply whose trimmed text ends in `F`. One physical port is shared by
//! every motor, so the link lives behind a [`SharedLink`] and each request/reply
//! pair is performed while holding the lock.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//! - [`SerialLink`]: Framed command/acknowledge transactions over a port
//! - [`SharedLink`]: Thread-safe shared link
//!
//! # Example
//!
//! ```rust,ignore
//! use scan_core::serial::{open_serial_async, SerialLink};
//!
//! let port = open_serial_async("/dev/ttyACM0", 9600, "stage controller").await?;
//! let mut link = SerialLink::new("/dev/ttyACM0", Box::new(port), Duration::from_secs(300));
//! link.handshake().await?;
//! let reply = link.send("MOVETO,1,4000").await?;
//! ```

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

use crate::error::{ScanError, ScanResult};

/// Baud rate of the stage controller firmware.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Character that terminates every acknowledgement.
pub const ACK_TERMINATOR: char = 'F';

/// Banner the controller prints after reset.
pub const GREETING: &str = "<>";

/// Handshake command sent after the greeting.
pub const CONNECT_COMMAND: &str = "CON";

/// Reply to [`CONNECT_COMMAND`] identifying a ready controller.
pub const READY_TOKEN: &str = "MOTORUP";

/// How long the handshake waits for the greeting and the ready token.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Trait alias for async serial port I/O.
///
/// Covers `tokio_serial::SerialStream` on hardware and `tokio::io::DuplexStream`
/// in tests.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Thread-safe shared serial link.
pub type SharedLink = Arc<Mutex<SerialLink>>;

/// Join command fields into a protocol frame body (without terminator).
///
/// ```
/// use scan_core::serial::format_command;
/// assert_eq!(format_command(["MOVE".to_string(), "2".into(), "-1".into()]), "MOVE,2,-1");
/// ```
pub fn format_command<I, T>(fields: I) -> String
where
    I: IntoIterator<Item = T>,
    T: Display,
{
    fields
        .into_iter()
        .map(|field| field.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Command/acknowledge transactions over one serial port.
pub struct SerialLink {
    name: String,
    port: Option<DynSerial>,
    timeout: Duration,
}

impl SerialLink {
    /// Wrap an open port. `timeout` bounds each [`send`](Self::send).
    pub fn new(name: impl Into<String>, port: DynSerial, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            port: Some(port),
            timeout,
        }
    }

    /// Move this link behind a shared lock.
    pub fn into_shared(self) -> SharedLink {
        Arc::new(Mutex::new(self))
    }

    /// Port name used in errors and logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default reply deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether [`close`](Self::close) has not yet been called.
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Send one command and wait for its acknowledgement using the default deadline.
    pub async fn send(&mut self, command: &str) -> ScanResult<String> {
        let timeout = self.timeout;
        self.send_with_timeout(command, timeout).await
    }

    /// Send one command and accumulate reply bytes until the trimmed reply ends
    /// with [`ACK_TERMINATOR`] or `timeout` elapses.
    ///
    /// Bytes left over from an earlier transaction are not carried into this one.
    #[instrument(skip(self), fields(port = %self.name), err)]
    pub async fn send_with_timeout(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> ScanResult<String> {
        self.write_frame(command).await?;
        let reply = self
            .read_until(command, timeout, |text| text.trim_end().ends_with(ACK_TERMINATOR))
            .await?;
        let reply = reply.trim().to_string();
        debug!(reply = %reply, "controller acknowledged");
        Ok(reply)
    }

    /// Wait for the controller greeting, send [`CONNECT_COMMAND`] and require
    /// [`READY_TOKEN`] as the reply line.
    ///
    /// A missing greeting is tolerated, since the controller only prints it
    /// after a reset; a missing or wrong ready token is not.
    #[instrument(skip(self), fields(port = %self.name), err)]
    pub async fn handshake(&mut self) -> ScanResult<()> {
        match self
            .read_until("greeting", HANDSHAKE_TIMEOUT, |text| text.contains(GREETING))
            .await
        {
            Ok(_) => debug!("greeting received"),
            Err(ScanError::ProtocolTimeout { .. }) => debug!("no greeting, continuing"),
            Err(e) => {
                return Err(ScanError::Handshake {
                    port: self.name.clone(),
                    message: e.to_string(),
                })
            }
        }

        self.write_frame(CONNECT_COMMAND).await?;
        let reply = self
            .read_until(CONNECT_COMMAND, HANDSHAKE_TIMEOUT, |text| {
                first_complete_line(text).is_some()
            })
            .await
            .map_err(|e| ScanError::Handshake {
                port: self.name.clone(),
                message: e.to_string(),
            })?;

        let token = first_complete_line(&reply).unwrap_or_default();
        if token == READY_TOKEN {
            Ok(())
        } else {
            Err(ScanError::Handshake {
                port: self.name.clone(),
                message: format!("expected '{READY_TOKEN}', got '{token}'"),
            })
        }
    }

    /// Release the port. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.shutdown().await {
                debug!(port = %self.name, error = %e, "error while closing serial port");
            }
        }
    }

    async fn write_frame(&mut self, command: &str) -> ScanResult<()> {
        let port = self.port.as_mut().ok_or_else(|| closed(&self.name))?;
        let frame = format!("{command}\n");
        trace!(frame = %command, "tx");
        port.write_all(frame.as_bytes())
            .await
            .map_err(|e| fault(&self.name, e))?;
        port.flush().await.map_err(|e| fault(&self.name, e))
    }

    async fn read_until<F>(&mut self, context: &str, timeout: Duration, done: F) -> ScanResult<String>
    where
        F: Fn(&str) -> bool,
    {
        let port = self.port.as_mut().ok_or_else(|| closed(&self.name))?;
        let deadline = Instant::now() + timeout;
        let mut received = Vec::new();
        let mut chunk = [0u8; 64];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let read = if remaining.is_zero() {
                None
            } else {
                tokio::time::timeout(remaining, port.read(&mut chunk)).await.ok()
            };

            match read {
                None => {
                    return Err(ScanError::ProtocolTimeout {
                        command: context.to_string(),
                        timeout,
                        partial: String::from_utf8_lossy(&received).into_owned(),
                    })
                }
                Some(Ok(0)) => {
                    return Err(ScanError::LinkFault {
                        port: self.name.clone(),
                        message: "connection closed by peer".to_string(),
                    })
                }
                Some(Ok(n)) => {
                    received.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&received);
                    trace!(rx = %text, "rx");
                    if done(&text) {
                        return Ok(text.into_owned());
                    }
                }
                Some(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Some(Err(e)) => return Err(fault(&self.name, e)),
            }
        }
    }
}

/// First complete, non-blank line of `text`.
fn first_complete_line(text: &str) -> Option<&str> {
    let complete = &text[..text.rfind('\n')?];
    complete.lines().map(str::trim).find(|line| !line.is_empty())
}

fn closed(name: &str) -> ScanError {
    ScanError::LinkFault {
        port: name.to_string(),
        message: "link is closed".to_string(),
    }
}

fn fault(name: &str, error: std::io::Error) -> ScanError {
    ScanError::LinkFault {
        port: name.to_string(),
        message: error.to_string(),
    }
}

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control, RTS asserted.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> ScanResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::{SerialPort, SerialPortBuilderExt};

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        let mut port = tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| ScanError::LinkFault {
                port: port_path_owned.clone(),
                message: format!("failed to open {device_name_owned} serial port: {e}"),
            })?;
        port.write_request_to_send(true)
            .map_err(|e| ScanError::LinkFault {
                port: port_path_owned.clone(),
                message: format!("failed to assert RTS: {e}"),
            })?;
        Ok(port)
    })
    .await
    .map_err(|e| ScanError::LinkFault {
        port: port_path.to_string(),
        message: format!("spawn_blocking for serial port opening failed: {e}"),
    })?
}
