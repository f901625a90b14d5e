//! `scan-core`
//!
//! Shared building blocks for the SiPM calibration scan: the error taxonomy,
//! the framed serial link used by stage controllers, and the capability traits
//! the sweep engine drives hardware through.
//!
//! ## Modules
//!
//! - [`error`]: [`ScanError`] and the [`ScanResult`] alias
//! - [`serial`]: [`serial::SerialLink`] command/acknowledge transactions
//! - [`capabilities`]: [`capabilities::Movable`] for positioning axes

pub mod capabilities;
pub mod error;
pub mod serial;

pub use error::{ScanError, ScanResult};
