//! Stepper Stage Axis Driver
//!
//! Protocol Overview:
//! - Format: comma-separated ASCII fields terminated by `\n`
//! - Baud: 9600, 8N1, no flow control, RTS asserted
//! - Every command blocks until the controller replies with text ending in `F`
//! - Example: "MOVETO,1,4000" (motor 1, absolute move to step 4000)
//!
//! All motors share one controller, so commands for different axes are
//! serialized through the shared link lock.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use scan_core::capabilities::Movable;
use scan_core::serial::{format_command, SharedLink, CONNECT_COMMAND};
use scan_core::{ScanError, ScanResult};
use tracing::{info, instrument, warn};

use crate::config::{StageConfig, STEPS_PER_REV};

/// Step count used by homing: far enough to always hit the limit switch.
pub const HOMING_SWEEP_STEPS: i64 = 1_000_000;

/// Lifecycle of one stage axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Constructed, controller not yet greeted.
    Uninitialized,
    /// Connected and idle.
    Ready,
    /// A motion command is in flight.
    Moving,
    /// The link was closed.
    Closed,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageState::Uninitialized => "uninitialized",
            StageState::Ready => "ready",
            StageState::Moving => "moving",
            StageState::Closed => "closed",
        };
        write!(f, "{label}")
    }
}

/// Driver for one motor on the stage controller.
///
/// `position` and `steps` are only updated after the controller acknowledges
/// a move, so after any error they still describe the last confirmed state.
pub struct StepperStage {
    name: String,
    motor_id: u8,
    config: StageConfig,
    link: SharedLink,
    move_timeout: Option<Duration>,
    state: StageState,
    position: f64,
    steps: i64,
}

impl StepperStage {
    /// Create a stage on a shared controller link. No I/O is performed.
    pub fn new(name: impl Into<String>, motor_id: u8, config: StageConfig, link: SharedLink) -> Self {
        let move_timeout = config.while_timeout.map(Duration::from_secs_f64);
        let position = config.start;
        Self {
            name: name.into(),
            motor_id,
            config,
            link,
            move_timeout,
            state: StageState::Uninitialized,
            position,
            steps: 0,
        }
    }

    /// Override how long moves may take before they count as stalled.
    pub fn with_move_timeout(mut self, timeout: Duration) -> Self {
        self.move_timeout = Some(timeout);
        self
    }

    /// Motor name (`motorX`, `motorY`, `motorZ`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Controller motor id.
    pub fn motor_id(&self) -> u8 {
        self.motor_id
    }

    /// Axis configuration.
    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StageState {
        self.state
    }

    /// Last acknowledged position.
    pub fn current_position(&self) -> f64 {
        self.position
    }

    /// Accumulated steps since the last home.
    pub fn steps_moved(&self) -> i64 {
        self.steps
    }

    /// Signed step count for `position` on this axis.
    pub fn position_to_steps(&self, position: f64) -> i64 {
        self.config.position_to_steps(position)
    }

    /// Greet the controller on behalf of this motor.
    #[instrument(skip(self), fields(axis = %self.name), err)]
    pub async fn connect(&mut self) -> ScanResult<()> {
        if self.state == StageState::Closed {
            return Err(self.not_ready("connect"));
        }
        self.transact(CONNECT_COMMAND.to_string(), None).await?;
        self.state = StageState::Ready;
        info!(axis = %self.name, id = self.motor_id, "motor connected");
        Ok(())
    }

    /// Set speed, maximum speed and acceleration, in that order.
    ///
    /// On failure the error lists the parameters that were already applied.
    #[instrument(skip(self), fields(axis = %self.name), err)]
    pub async fn configure_motion(
        &mut self,
        speed: f64,
        max_speed: f64,
        acceleration: f64,
    ) -> ScanResult<()> {
        self.require_ready("configure motion")?;

        let mut applied = Vec::new();
        for (parameter, value) in [
            ("SET_SPEED", speed),
            ("SET_MAX_SPEED", max_speed),
            ("SET_ACCEL", acceleration),
        ] {
            let command = format_command([
                parameter.to_string(),
                self.motor_id.to_string(),
                value.to_string(),
            ]);
            if let Err(source) = self.transact(command, None).await {
                return Err(ScanError::PartialConfiguration {
                    axis: self.name.clone(),
                    applied,
                    source: Box::new(source),
                });
            }
            info!(axis = %self.name, parameter, value, "motion parameter set");
            applied.push(parameter.to_string());
        }
        Ok(())
    }

    /// Apply the speed, maximum speed and acceleration from the axis configuration.
    pub async fn apply_motion_profile(&mut self) -> ScanResult<()> {
        let (speed, max_speed, acceleration) = (
            self.config.speed,
            self.config.max_speed,
            self.config.acceleration,
        );
        self.configure_motion(speed, max_speed, acceleration).await
    }

    /// Move to an absolute position and block until the controller reports completion.
    #[instrument(skip(self), fields(axis = %self.name), err)]
    pub async fn move_absolute(&mut self, position: f64) -> ScanResult<()> {
        self.require_ready("move")?;
        let target_steps = self.position_to_steps(position);
        info!(
            axis = %self.name,
            position,
            unit = self.config.kind.unit(),
            steps = target_steps,
            "moving"
        );

        let command = format_command([
            "MOVETO".to_string(),
            self.motor_id.to_string(),
            target_steps.to_string(),
        ]);
        self.motion(command, position).await?;
        self.position = position;
        self.steps = target_steps;
        Ok(())
    }

    /// Move `steps` steps forward (`direction > 0`) or backward.
    #[instrument(skip(self), fields(axis = %self.name), err)]
    pub async fn move_relative(&mut self, direction: i8, steps: i64) -> ScanResult<()> {
        self.require_ready("move")?;
        let sign: i64 = if direction > 0 { 1 } else { -1 };
        info!(
            axis = %self.name,
            direction = if sign > 0 { "forward" } else { "backward" },
            steps,
            "moving relative"
        );

        let command = format_command([
            "MOVE".to_string(),
            self.motor_id.to_string(),
            sign.to_string(),
            steps.to_string(),
        ]);
        let target = self.position + self.steps_to_distance(sign * steps);
        self.motion(command, target).await?;
        self.steps += sign * steps;
        self.position = target;
        Ok(())
    }

    /// Drive toward the limit switch, then declare that position zero.
    ///
    /// Position and step count are reset even when a command fails, since the
    /// axis has moved an unknown distance by then; the first error is returned.
    #[instrument(skip(self), fields(axis = %self.name), err)]
    pub async fn find_home(&mut self) -> ScanResult<()> {
        self.require_ready("home")?;
        info!(axis = %self.name, "searching for home position");

        let sweep = format_command([
            "MOVE".to_string(),
            self.motor_id.to_string(),
            "-1".to_string(),
            HOMING_SWEEP_STEPS.to_string(),
        ]);
        let result = match self.motion(sweep, 0.0).await {
            Ok(()) => {
                let zero = format_command(["SET_ZERO".to_string(), self.motor_id.to_string()]);
                self.transact(zero, None).await.map(|_| ())
            }
            Err(e) => Err(e),
        };

        self.position = 0.0;
        self.steps = 0;
        if result.is_ok() {
            info!(axis = %self.name, "home position set");
        } else {
            warn!(axis = %self.name, "homing did not complete, position reset to zero");
        }
        result
    }

    /// Return to the zero position set by [`find_home`](Self::find_home).
    #[instrument(skip(self), fields(axis = %self.name), err)]
    pub async fn move_to_home(&mut self) -> ScanResult<()> {
        self.require_ready("move")?;
        let command = format_command(["MOVETO".to_string(), self.motor_id.to_string(), "0".to_string()]);
        self.motion(command, 0.0).await?;
        self.position = 0.0;
        self.steps = 0;
        Ok(())
    }

    /// Stop this motor.
    #[instrument(skip(self), fields(axis = %self.name), err)]
    pub async fn stop(&mut self) -> ScanResult<()> {
        let command = format_command(["STOP".to_string(), self.motor_id.to_string()]);
        self.transact(command, None).await?;
        if self.state == StageState::Moving {
            self.state = StageState::Ready;
        }
        Ok(())
    }

    /// Blink the controller LED.
    #[instrument(skip(self), fields(axis = %self.name), err)]
    pub async fn ping_led(&mut self) -> ScanResult<()> {
        self.transact("LED".to_string(), None).await.map(|_| ())
    }

    /// Release the shared link. Idempotent; every stage on the link sees it closed.
    pub async fn close(&mut self) {
        self.link.lock().await.close().await;
        self.state = StageState::Closed;
    }

    /// Steps covered in `seconds` at `speed` steps per second, truncated.
    pub fn steps_for_duration(speed: f64, seconds: f64) -> i64 {
        (seconds * speed) as i64
    }

    fn steps_to_distance(&self, steps: i64) -> f64 {
        let revolutions =
            steps as f64 / (f64::from(STEPS_PER_REV) * f64::from(self.config.microstep));
        match self.config.kind {
            crate::AxisKind::Linear => revolutions * self.config.relation,
            crate::AxisKind::Rotary => revolutions / self.config.relation * 360.0,
        }
    }

    /// Run a motion command, mapping a missing acknowledgement to `MotionTimeout`.
    async fn motion(&mut self, command: String, target: f64) -> ScanResult<()> {
        self.state = StageState::Moving;
        let result = self.transact(command, self.move_timeout).await;
        self.state = StageState::Ready;

        match result {
            Ok(_) => Ok(()),
            Err(ScanError::ProtocolTimeout { timeout, .. }) => Err(ScanError::MotionTimeout {
                axis: self.name.clone(),
                target,
                timeout,
            }),
            Err(e) => Err(e),
        }
    }

    async fn transact(&self, command: String, timeout: Option<Duration>) -> ScanResult<String> {
        let mut link = self.link.lock().await;
        match timeout {
            Some(timeout) => link.send_with_timeout(&command, timeout).await,
            None => link.send(&command).await,
        }
    }

    fn require_ready(&self, operation: &'static str) -> ScanResult<()> {
        match self.state {
            StageState::Ready => Ok(()),
            _ => Err(self.not_ready(operation)),
        }
    }

    fn not_ready(&self, operation: &'static str) -> ScanError {
        ScanError::StageNotReady {
            axis: self.name.clone(),
            state: self.state.to_string(),
            operation,
        }
    }
}

#[async_trait]
impl Movable for StepperStage {
    fn axis_name(&self) -> &str {
        &self.name
    }

    fn position(&self) -> f64 {
        self.position
    }

    fn scan_positions(&self) -> Vec<f64> {
        self.config.positions()
    }

    async fn move_abs(&mut self, position: f64) -> ScanResult<()> {
        self.move_absolute(position).await
    }

    async fn stop(&mut self) -> ScanResult<()> {
        StepperStage::stop(self).await
    }
}
