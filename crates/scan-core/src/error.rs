//! Error types shared by every layer of the scan.
//!
//! `ScanError` is the single error enum used from the serial link up to the
//! sweep engine. Hardware, persistence and external-process failures each get
//! their own variant so callers can tell a stalled stage apart from a failed
//! acquisition without string matching.
//!
//! ## Error Categories
//!
//! - **Link**: `LinkFault`, `ProtocolTimeout`, `Handshake`
//! - **Motion**: `MotionTimeout`, `PartialConfiguration`, `StageNotReady`
//! - **Settings**: `SettingsLoad`, `MissingColumn`, `PersistFailure`
//! - **External commands**: `AcquisitionFailure`, `ProcessingFailure`
//! - **Configuration**: `Config`, `Configuration`
//! - **Run**: `RunLog`, `Aborted`, `Io`

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the scan error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Primary error type for the calibration scan.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The serial link is closed or the transport reported an I/O error.
    #[error("Serial link fault on {port}: {message}")]
    LinkFault { port: String, message: String },

    /// No acknowledgement arrived before the transaction deadline.
    ///
    /// `partial` holds whatever bytes had been received when the deadline hit.
    #[error("Timed out after {timeout:?} waiting for reply to '{command}' (received: '{partial}')")]
    ProtocolTimeout {
        command: String,
        timeout: Duration,
        partial: String,
    },

    /// A move did not complete within the configured wait bound.
    #[error("Motor {axis} did not reach {target} within {timeout:?}")]
    MotionTimeout {
        axis: String,
        target: f64,
        timeout: Duration,
    },

    /// Controller discovery or the ready handshake failed.
    #[error("Handshake with controller on {port} failed: {message}")]
    Handshake { port: String, message: String },

    /// A motion-profile update stopped part way through.
    #[error("Motion profile for {axis} only partially applied (applied: [{}]): {source}", applied.join(", "))]
    PartialConfiguration {
        axis: String,
        applied: Vec<String>,
        #[source]
        source: Box<ScanError>,
    },

    /// An operation was attempted on a stage that is not connected.
    #[error("Motor {axis} is {state}, cannot {operation}")]
    StageNotReady {
        axis: String,
        state: String,
        operation: &'static str,
    },

    /// A settings table could not be written or backed up.
    #[error("Failed to persist {path}: {source}")]
    PersistFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A settings table could not be read or parsed.
    #[error("Failed to load settings from {path}: {message}")]
    SettingsLoad { path: PathBuf, message: String },

    /// A settings table lacks a column the scan needs.
    #[error("Settings file {path} has no column '{column}'")]
    MissingColumn { path: PathBuf, column: String },

    /// The acquisition binary could not be started or exited unsuccessfully.
    #[error("Acquisition '{name}' failed: {status}")]
    AcquisitionFailure { name: String, status: String },

    /// A processing binary could not be started or exited unsuccessfully.
    #[error("Processing of '{name}' failed: {status}")]
    ProcessingFailure { name: String, status: String },

    /// Semantic configuration error (invalid value, missing path).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Configuration file could not be parsed or extracted.
    #[error("Configuration parse error: {0}")]
    Config(#[from] figment::Error),

    /// The run log is unreadable or malformed.
    #[error("Run log {path}: {message}")]
    RunLog { path: PathBuf, message: String },

    /// File I/O error outside settings persistence.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The sweep was stopped by the operator.
    #[error("Scan aborted: {0}")]
    Aborted(String),
}

impl ScanError {
    /// True for errors raised by the serial link or stage controller.
    pub fn is_hardware(&self) -> bool {
        matches!(
            self,
            ScanError::LinkFault { .. }
                | ScanError::ProtocolTimeout { .. }
                | ScanError::MotionTimeout { .. }
                | ScanError::Handshake { .. }
                | ScanError::PartialConfiguration { .. }
                | ScanError::StageNotReady { .. }
        )
    }
}
