//! Capability traits implemented by hardware drivers.
//!
//! The sweep engine only needs to position an axis and report where it is, so
//! drivers are consumed through [`Movable`] rather than their concrete types.
//! Test doubles implement the same trait.

use async_trait::async_trait;

use crate::error::ScanResult;

/// A single positioning axis.
///
/// Moves are blocking from the caller's point of view: `move_abs` returns only
/// once the device has acknowledged that the target was reached.
#[async_trait]
pub trait Movable: Send {
    /// Axis name used in logs, run-log columns and output file names.
    fn axis_name(&self) -> &str;

    /// Last acknowledged position in axis units.
    fn position(&self) -> f64;

    /// Positions this axis visits during a sweep, in order.
    fn scan_positions(&self) -> Vec<f64>;

    /// Move to an absolute position and wait for completion.
    ///
    /// # Returns
    /// - Ok(()) once the device acknowledged the move
    /// - Err on timeout or link failure; `position()` is then unchanged
    async fn move_abs(&mut self, position: f64) -> ScanResult<()>;

    /// Stop any motion in progress.
    async fn stop(&mut self) -> ScanResult<()>;
}
