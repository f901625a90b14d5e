//! Stepper-motor stage controller driver.
//!
//! Up to three motors hang off one microcontroller that is reached over a
//! single serial port. Each motor is driven by its own [`StepperStage`], and
//! all stages share the port through a [`scan_core::serial::SharedLink`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use scan_driver_stepper::{find_controller_port, StepperStage};
//!
//! let link = find_controller_port("/dev/ttyACM0", timeout).await?.into_shared();
//! let mut stage = StepperStage::new("motorX", 1, config, link.clone());
//! stage.connect().await?;
//! stage.apply_motion_profile().await?;
//! stage.move_absolute(12.5).await?;
//! ```

pub mod config;
pub mod discovery;
pub mod stage;

pub use config::{enumerate_positions, AxisKind, StageConfig, STEPS_PER_REV};
pub use discovery::find_controller_port;
pub use stage::{StageState, StepperStage, HOMING_SWEEP_STEPS};

/// Motor names recognised in configuration, with their controller ids.
pub const MOTOR_AXES: [(&str, u8); 3] = [("motorX", 1), ("motorY", 2), ("motorZ", 3)];

/// Short axis label used in output file names (`motorX` -> `X`).
pub fn axis_label(motor_name: &str) -> &str {
    motor_name
        .char_indices()
        .last()
        .map_or(motor_name, |(i, _)| &motor_name[i..])
}
