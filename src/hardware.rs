//! Stage bring-up: find the controller, then connect and configure each motor.

use std::sync::Arc;

use scan_core::capabilities::Movable;
use scan_core::serial::SharedLink;
use scan_core::{ScanError, ScanResult};
use scan_driver_stepper::{find_controller_port, StageConfig, StepperStage};
use tracing::info;

use crate::config::ScanConfig;

/// The motors on one controller and the link they share.
pub struct StageRig {
    link: SharedLink,
    stages: Vec<StepperStage>,
}

impl StageRig {
    /// Locate the controller (`COM_port` or autodetect) and bring up `sections`.
    pub async fn open(config: &ScanConfig, sections: &[(&str, u8, &StageConfig)]) -> ScanResult<Self> {
        let link = find_controller_port(&config.com_port, config.serial_timeout())
            .await?
            .into_shared();
        Self::on_link(link, sections).await
    }

    /// Bring up `sections` on an already greeted link.
    ///
    /// Each motor is connected, then given its speed, maximum speed and
    /// acceleration.
    pub async fn on_link(link: SharedLink, sections: &[(&str, u8, &StageConfig)]) -> ScanResult<Self> {
        let mut stages = Vec::with_capacity(sections.len());
        for &(name, id, stage_config) in sections {
            let mut stage = StepperStage::new(name, id, stage_config.clone(), Arc::clone(&link));
            stage.connect().await?;
            stage.apply_motion_profile().await?;
            stages.push(stage);
        }
        info!(motors = stages.len(), "stages ready");
        Ok(Self { link, stages })
    }

    /// Connected stages in X, Y, Z order.
    pub fn stages(&self) -> &[StepperStage] {
        &self.stages
    }

    /// Stage by motor name.
    pub fn stage_mut(&mut self, name: &str) -> ScanResult<&mut StepperStage> {
        self.stages
            .iter_mut()
            .find(|s| s.name() == name)
            .ok_or_else(|| ScanError::Configuration(format!("no {name} section in the configuration")))
    }

    /// Hand the stages to the sweep engine, keeping the link for shutdown.
    pub fn into_movables(self) -> (SharedLink, Vec<Box<dyn Movable>>) {
        let movables = self
            .stages
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn Movable>)
            .collect();
        (self.link, movables)
    }

    /// Close the controller link.
    pub async fn close(mut self) {
        for stage in &mut self.stages {
            stage.close().await;
        }
    }
}

/// Close a link handed out by [`StageRig::into_movables`].
pub async fn close_link(link: &SharedLink) {
    link.lock().await.close().await;
}
