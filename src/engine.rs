//! Sweep engine.
//!
//! Drives one calibration run: stage combinations form the outer loop, and for
//! each of them the full iteration x overvoltage x T1 x T2 x E product is
//! acquired with E varying fastest. Every settings change is persisted before
//! the acquisition that depends on it, and a run-log line is written only once
//! the acquisition binary reported success.
//!
//! Everything is awaited in order; there is never more than one hardware
//! operation in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use scan_core::capabilities::Movable;
use scan_core::{ScanError, ScanResult};
use scan_driver_stepper::axis_label;
use tracing::{error, info, warn};

use crate::commands::{CommandRunner, Dispatcher};
use crate::config::FixedValues;
use crate::eta::{format_hms, RemainingTimeEstimator};
use crate::run_log::{RunLog, RunLogEntry};
use crate::settings::{BiasSettings, DiscSettings, ThresholdKind};
use crate::sweep::{output_base_name, StagePlan, SweepAxes, SweepPoint};

/// Which passes a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ScanMode {
    /// Acquire only; process later from the run log
    Acquire,
    /// Process the entries of an existing run log
    Process,
    /// Acquire and process each point as it completes
    #[default]
    Both,
}

/// Outcome of an acquisition sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepSummary {
    /// Acquisitions completed and logged
    pub acquisitions: usize,
    /// Points whose inline processing failed (data is acquired and logged)
    pub processing_failures: usize,
    /// Frames reported lost across all acquisitions
    pub lost_frames: u64,
    /// Stage combination to pass as start index to continue this run
    pub next_index: usize,
    /// True when the run stopped on a cancellation request
    pub cancelled: bool,
}

/// Outcome of a processing pass over the run log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    /// Entries processed successfully
    pub processed: usize,
    /// Entries whose processing failed
    pub failed: usize,
    /// True when the pass stopped on a cancellation request
    pub cancelled: bool,
}

/// Runs the calibration sweep over borrowed settings, stages and dispatcher.
pub struct SweepEngine<'a, R> {
    bias: &'a mut BiasSettings,
    disc: &'a mut DiscSettings,
    dispatcher: &'a Dispatcher<R>,
    run_log: &'a RunLog,
    stages: &'a mut [Box<dyn Movable>],
    axes: SweepAxes,
    out_name: String,
    mode: ScanMode,
    acquisition_pause: Duration,
    iteration_pause: Duration,
    cancel: Arc<AtomicBool>,
}

impl<'a, R: CommandRunner> SweepEngine<'a, R> {
    /// Engine without stages, pauses or cancellation.
    pub fn new(
        bias: &'a mut BiasSettings,
        disc: &'a mut DiscSettings,
        dispatcher: &'a Dispatcher<R>,
        run_log: &'a RunLog,
        axes: SweepAxes,
        out_name: impl Into<String>,
    ) -> Self {
        Self {
            bias,
            disc,
            dispatcher,
            run_log,
            stages: Default::default(),
            axes,
            out_name: out_name.into(),
            mode: ScanMode::Both,
            acquisition_pause: Duration::ZERO,
            iteration_pause: Duration::ZERO,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Scan these stages as the outer loop, first stage outermost.
    pub fn with_stages(mut self, stages: &'a mut [Box<dyn Movable>]) -> Self {
        self.stages = stages;
        self
    }

    /// Acquire only, or acquire and process.
    pub fn with_mode(mut self, mode: ScanMode) -> Self {
        self.mode = mode;
        self
    }

    /// Pause after every acquisition and when the iteration index changes.
    pub fn with_pauses(mut self, acquisition: Duration, iteration: Duration) -> Self {
        self.acquisition_pause = acquisition;
        self.iteration_pause = iteration;
        self
    }

    /// Flag checked between steps; setting it ends the run cleanly.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Stage combinations in visiting order.
    pub fn stage_plan(&self) -> StagePlan {
        StagePlan::new(
            self.stages
                .iter()
                .map(|s| (s.axis_name().to_string(), s.scan_positions()))
                .collect(),
        )
    }

    /// Run the sweep starting at stage combination `start_index`.
    pub async fn run(&mut self, fixed: &FixedValues, start_index: usize) -> ScanResult<SweepSummary> {
        if self.mode == ScanMode::Process {
            return Err(ScanError::Configuration(
                "process mode does not acquire; use the processing pass".to_string(),
            ));
        }
        let plan = self.stage_plan();
        if start_index > plan.len() {
            return Err(ScanError::Configuration(format!(
                "start index {start_index} is past the last stage combination ({})",
                plan.len()
            )));
        }

        self.bias.apply_fixed_values(
            fixed.prebreak_voltage,
            fixed.break_voltage,
            fixed.reference_voltages,
        );
        self.bias.persist()?;
        self.disc
            .apply_fixed_values(fixed.first_thresholds, fixed.reference_thresholds);
        self.disc.persist()?;

        let total_steps = (plan.len() - start_index) * self.axes.len();
        info!(
            stage_combinations = plan.len(),
            start_index,
            points_per_combination = self.axes.len(),
            total_steps,
            "starting sweep"
        );

        let mut summary = SweepSummary {
            next_index: start_index,
            ..SweepSummary::default()
        };
        let mut estimator = RemainingTimeEstimator::new();
        let mut last_overvoltage = None;
        let mut last_iteration = None;
        let axes = self.axes.clone();

        for (index, positions) in plan.iter_from(start_index) {
            if self.cancelled() {
                summary.cancelled = true;
                return Ok(summary);
            }
            if let Err(e) = self.position_stages(index, &positions).await {
                return self.stopped(e, index, summary);
            }

            for point in axes.iter() {
                if self.cancelled() {
                    summary.cancelled = true;
                    return Ok(summary);
                }
                if last_iteration.is_some_and(|it| it != point.iteration) {
                    info!(iteration = point.iteration, pause = ?self.iteration_pause, "iteration changed");
                    tokio::time::sleep(self.iteration_pause).await;
                }
                last_iteration = Some(point.iteration);

                let started = Instant::now();
                if let Err(e) = self.step(&point, &mut last_overvoltage, &mut summary).await {
                    return self.stopped(e, index, summary);
                }
                tokio::time::sleep(self.acquisition_pause).await;
                estimator.record(started.elapsed());

                let remaining = total_steps.saturating_sub(estimator.completed());
                if let Some(eta) = estimator.estimate(remaining) {
                    info!(
                        step = estimator.completed(),
                        total = total_steps,
                        remaining = %format_hms(eta),
                        "estimated remaining time"
                    );
                }
            }
            summary.next_index = index + 1;
        }

        info!(
            acquisitions = summary.acquisitions,
            processing_failures = summary.processing_failures,
            lost_frames = summary.lost_frames,
            "sweep complete"
        );
        Ok(summary)
    }

    async fn position_stages(&mut self, index: usize, positions: &[f64]) -> ScanResult<()> {
        if self.stages.is_empty() {
            return Ok(());
        }
        info!(index, ?positions, "moving to stage combination");
        for (stage, position) in self.stages.iter_mut().zip(positions) {
            stage.move_abs(*position).await?;
        }
        Ok(())
    }

    async fn step(
        &mut self,
        point: &SweepPoint,
        last_overvoltage: &mut Option<f64>,
        summary: &mut SweepSummary,
    ) -> ScanResult<()> {
        for (kind, value) in ThresholdKind::ALL.into_iter().zip([point.t1, point.t2, point.e]) {
            self.disc.set_threshold(value, kind);
        }
        if *last_overvoltage != Some(point.overvoltage) {
            self.bias.set_overvoltage(point.overvoltage);
            self.bias.persist()?;
            *last_overvoltage = Some(point.overvoltage);
        }
        self.disc.persist()?;

        let labels: Vec<(&str, f64)> = self
            .stages
            .iter()
            .map(|s| (axis_label(s.axis_name()), s.position()))
            .collect();
        let name = output_base_name(&self.out_name, &labels, point);
        info!(
            name,
            iteration = point.iteration,
            overvoltage = point.overvoltage,
            t1 = point.t1,
            t2 = point.t2,
            e = point.e,
            "acquiring"
        );

        if let Some(lost) = self.dispatcher.acquire(&name).await? {
            summary.lost_frames += lost.frames;
        }
        self.run_log.append(&RunLogEntry {
            file_name: name.clone(),
            positions: labels.iter().map(|(_, p)| *p).collect(),
        })?;
        summary.acquisitions += 1;

        if self.mode == ScanMode::Both {
            if let Err(e) = self.dispatcher.process(&name).await {
                error!(name, error = %e, "processing failed; entry stays in the run log");
                summary.processing_failures += 1;
            }
        }
        Ok(())
    }

    /// End the run after a failed step at stage combination `index`.
    ///
    /// A Ctrl-C also reaches the running child, so a step that fails while
    /// cancellation is pending counts as a clean stop.
    fn stopped(&self, err: ScanError, index: usize, mut summary: SweepSummary) -> ScanResult<SweepSummary> {
        summary.next_index = index;
        if self.cancelled() {
            warn!(error = %err, resume_index = index, "step interrupted by cancellation");
            summary.cancelled = true;
            return Ok(summary);
        }
        error!(
            error = %err,
            resume_index = index,
            acquisitions = summary.acquisitions,
            "sweep stopped; rerun with --start-index to resume"
        );
        Err(err)
    }

    fn cancelled(&self) -> bool {
        let cancelled = self.cancel.load(Ordering::SeqCst);
        if cancelled {
            warn!("sweep cancelled");
        }
        cancelled
    }
}

/// Process every entry of a run log.
///
/// A failing entry is logged and counted; the pass continues with the next.
pub async fn process_run_log<R: CommandRunner>(
    dispatcher: &Dispatcher<R>,
    run_log: &RunLog,
    cancel: &AtomicBool,
) -> ScanResult<ProcessSummary> {
    let entries = run_log.entries()?;
    info!(path = %run_log.path().display(), entries = entries.len(), "processing run log");

    let mut summary = ProcessSummary::default();
    let mut estimator = RemainingTimeEstimator::new();
    for (i, entry) in entries.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            warn!(processed = i, "processing cancelled");
            summary.cancelled = true;
            break;
        }
        let started = Instant::now();
        match dispatcher.process(&entry.file_name).await {
            Ok(()) => summary.processed += 1,
            Err(e) => {
                error!(name = %entry.file_name, error = %e, "processing failed");
                summary.failed += 1;
            }
        }
        estimator.record(started.elapsed());
        if let Some(eta) = estimator.estimate(entries.len() - i - 1) {
            info!(step = i + 1, total = entries.len(), remaining = %format_hms(eta), "estimated remaining time");
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::{failed, ok, RecordingRunner};
    use crate::commands::{Invocation, RunOutput};
    use crate::config::ScanConfig;
    use crate::settings::ChannelKey;
    use async_trait::async_trait;
    use figment::providers::{Format, Yaml};
    use figment::Figment;
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    const BIAS: &str = "portID\tslaveID\tslotID\tchannelID\tPre-breakdown\tBreakdown\tOvervoltage\n\
0\t0\t2\t5\t0\t0\t0\n\
0\t0\t2\t6\t0\t0\t0\n";

    const DISC: &str = "portID\tslaveID\tchipID\tchannelID\tvth_t1\tvth_t2\tvth_e\n\
0\t0\t0\t0\t1\t1\t1\n\
0\t0\t4\t0\t1\t1\t1\n";

    struct FakeStage {
        name: String,
        positions: Vec<f64>,
        position: f64,
        moves: Arc<Mutex<Vec<(String, f64)>>>,
        fail_at: Option<f64>,
    }

    #[async_trait]
    impl Movable for FakeStage {
        fn axis_name(&self) -> &str {
            &self.name
        }

        fn position(&self) -> f64 {
            self.position
        }

        fn scan_positions(&self) -> Vec<f64> {
            self.positions.clone()
        }

        async fn move_abs(&mut self, position: f64) -> ScanResult<()> {
            if self.fail_at == Some(position) {
                return Err(ScanError::MotionTimeout {
                    axis: self.name.clone(),
                    target: position,
                    timeout: Duration::from_secs(1),
                });
            }
            self.moves.lock().unwrap().push((self.name.clone(), position));
            self.position = position;
            Ok(())
        }

        async fn stop(&mut self) -> ScanResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        bias: BiasSettings,
        disc: DiscSettings,
        log: RunLog,
        config: ScanConfig,
    }

    fn fixture(axes: Vec<String>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("cfg");
        fs::create_dir_all(&cfg).unwrap();
        fs::write(cfg.join("bias_settings.tsv"), BIAS).unwrap();
        fs::write(cfg.join("disc_settings.tsv"), DISC).unwrap();

        let yaml = format!(
            r#"
config_directory: {cfg}
petsys_directory: /opt/petsys
out_directory: {out}
out_name: run
bias_file: bias_map.csv
FEM: FEM128
FEBD: FEBD8k
BIAS_board: BIAS_16P
ref_det_febd: 2
ref_det_volt: [21.0, 39.0, 9.9]
ref_det_ths: [30, 31, 32]
mode: qdc
time: 1.0
data_type: coincidence
data_format: binary
prebreak_voltage: 20.0
break_voltage: 38.0
over_voltage: [1.0, 1.5]
vth_t1: [10]
vth_t2: [20]
vth_e: [5, 6]
iterations: 2
"#,
            cfg = cfg.display(),
            out = dir.path().join("out").display(),
        );
        let config: ScanConfig = Figment::from(Yaml::string(&yaml)).extract().unwrap();

        let bias = BiasSettings::load(config.bias_settings_path(), BTreeSet::from([ChannelKey::new(2, 5)])).unwrap();
        let disc = DiscSettings::load(config.disc_settings_path(), BTreeSet::from([4, 5])).unwrap();
        let log = RunLog::new(config.run_log_path(), axes);
        log.prepare(|_| unreachable!()).unwrap();
        Fixture {
            dir,
            bias,
            disc,
            log,
            config,
        }
    }

    fn names(log: &RunLog) -> Vec<String> {
        log.entries().unwrap().into_iter().map(|e| e.file_name).collect()
    }

    #[tokio::test]
    async fn test_sweep_without_stages() {
        let mut f = fixture(Vec::new());
        let dispatcher = Dispatcher::new(&f.config, RecordingRunner::default());
        let fixed = f.config.fixed_values().unwrap();

        let summary = SweepEngine::new(&mut f.bias, &mut f.disc, &dispatcher, &f.log, f.config.sweep_axes(), "run")
            .with_mode(ScanMode::Acquire)
            .run(&fixed, 0)
            .await
            .unwrap();

        assert_eq!(summary.acquisitions, 8);
        assert_eq!(summary.next_index, 1);
        assert!(!summary.cancelled);
        assert_eq!(
            names(&f.log),
            vec![
                "run_0it_1.0OV_10T1_20T2_5E",
                "run_0it_1.0OV_10T1_20T2_6E",
                "run_0it_1.5OV_10T1_20T2_5E",
                "run_0it_1.5OV_10T1_20T2_6E",
                "run_1it_1.0OV_10T1_20T2_5E",
                "run_1it_1.0OV_10T1_20T2_6E",
                "run_1it_1.5OV_10T1_20T2_5E",
                "run_1it_1.5OV_10T1_20T2_6E",
            ]
        );
        // acquire only
        assert_eq!(dispatcher.runner().calls().len(), 8);

        // reference rows keep their values, swept rows hold the last point
        assert_eq!(f.bias.overvoltage(ChannelKey::new(2, 5)), Some(9.9));
        assert_eq!(f.bias.overvoltage(ChannelKey::new(2, 6)), Some(1.5));
        assert_eq!(f.disc.thresholds(4, ThresholdKind::E), vec![32]);
        assert_eq!(f.disc.thresholds(0, ThresholdKind::E), vec![6]);

        let on_disk = BiasSettings::load(f.config.bias_settings_path(), BTreeSet::new()).unwrap();
        assert_eq!(on_disk.overvoltage(ChannelKey::new(2, 6)), Some(1.5));
        assert!(f.dir.path().join("cfg").join("disc_settings_backup.tsv").exists());
    }

    #[tokio::test]
    async fn test_both_mode_processes_each_point() {
        let mut f = fixture(Vec::new());
        f.config.iterations = 1;
        f.config.over_voltage = vec![1.0];
        let dispatcher = Dispatcher::new(&f.config, RecordingRunner::default());
        let fixed = f.config.fixed_values().unwrap();

        SweepEngine::new(&mut f.bias, &mut f.disc, &dispatcher, &f.log, f.config.sweep_axes(), "run")
            .run(&fixed, 0)
            .await
            .unwrap();

        let programs: Vec<String> = dispatcher
            .runner()
            .calls()
            .iter()
            .map(|c| c.program.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            programs,
            vec![
                "acquire_sipm_data",
                "convert_raw_to_coincidence",
                "acquire_sipm_data",
                "convert_raw_to_coincidence",
            ]
        );
    }

    #[traced_test]
    #[tokio::test]
    async fn test_failed_acquisition_is_not_logged() {
        let mut f = fixture(Vec::new());
        let runner = RecordingRunner::replying([ok(&[]), failed()]);
        let dispatcher = Dispatcher::new(&f.config, runner);
        let fixed = f.config.fixed_values().unwrap();

        let err = SweepEngine::new(&mut f.bias, &mut f.disc, &dispatcher, &f.log, f.config.sweep_axes(), "run")
            .with_mode(ScanMode::Acquire)
            .run(&fixed, 0)
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::AcquisitionFailure { ref name, .. } if name == "run_0it_1.0OV_10T1_20T2_6E"));
        assert_eq!(names(&f.log), vec!["run_0it_1.0OV_10T1_20T2_5E"]);
        assert!(logs_contain("resume_index=0"));
    }

    #[tokio::test]
    async fn test_stage_resume_skips_visited_combinations() {
        let mut f = fixture(vec!["motorX".to_string(), "motorY".to_string()]);
        f.config.iterations = 1;
        f.config.over_voltage = vec![1.0];
        f.config.vth_e = vec![5];
        let dispatcher = Dispatcher::new(&f.config, RecordingRunner::default());
        let fixed = f.config.fixed_values().unwrap();

        let moves = Arc::new(Mutex::new(Vec::new()));
        let stage = |name: &str, positions: Vec<f64>| -> Box<dyn Movable> {
            Box::new(FakeStage {
                name: name.to_string(),
                positions,
                position: 0.0,
                moves: Arc::clone(&moves),
                fail_at: None,
            })
        };
        let mut stages = vec![stage("motorX", vec![0.0, 5.0]), stage("motorY", vec![0.0, 90.0])];

        let summary = SweepEngine::new(&mut f.bias, &mut f.disc, &dispatcher, &f.log, f.config.sweep_axes(), "run")
            .with_stages(&mut stages)
            .with_mode(ScanMode::Acquire)
            .run(&fixed, 2)
            .await
            .unwrap();

        assert_eq!(summary.acquisitions, 2);
        assert_eq!(summary.next_index, 4);
        assert_eq!(
            *moves.lock().unwrap(),
            vec![
                ("motorX".to_string(), 5.0),
                ("motorY".to_string(), 0.0),
                ("motorX".to_string(), 5.0),
                ("motorY".to_string(), 90.0),
            ]
        );
        let entries = f.log.entries().unwrap();
        assert_eq!(entries[0].file_name, "run_X5.0_Y0.0_0it_1.0OV_10T1_20T2_5E");
        assert_eq!(entries[1].positions, vec![5.0, 90.0]);
    }

    #[tokio::test]
    async fn test_motion_timeout_aborts_before_acquiring() {
        let mut f = fixture(vec!["motorX".to_string()]);
        let dispatcher = Dispatcher::new(&f.config, RecordingRunner::default());
        let fixed = f.config.fixed_values().unwrap();
        let mut stages: Vec<Box<dyn Movable>> = vec![Box::new(FakeStage {
            name: "motorX".to_string(),
            positions: vec![0.0, 5.0],
            position: 0.0,
            moves: Arc::default(),
            fail_at: Some(5.0),
        })];

        let err = SweepEngine::new(&mut f.bias, &mut f.disc, &dispatcher, &f.log, f.config.sweep_axes(), "run")
            .with_stages(&mut stages)
            .run(&fixed, 1)
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::MotionTimeout { .. }));
        assert!(dispatcher.runner().calls().is_empty());
        assert!(f.log.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_before_first_step() {
        let mut f = fixture(Vec::new());
        let dispatcher = Dispatcher::new(&f.config, RecordingRunner::default());
        let fixed = f.config.fixed_values().unwrap();

        let summary = SweepEngine::new(&mut f.bias, &mut f.disc, &dispatcher, &f.log, f.config.sweep_axes(), "run")
            .with_cancel(Arc::new(AtomicBool::new(true)))
            .run(&fixed, 0)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.next_index, 0);
        assert!(dispatcher.runner().calls().is_empty());
    }

    /// Lets the first acquisition through, then behaves like a terminal
    /// Ctrl-C: the flag is raised and the child dies on SIGINT.
    struct InterruptingRunner {
        cancel: Arc<AtomicBool>,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl CommandRunner for InterruptingRunner {
        async fn run(&self, _invocation: &Invocation) -> ScanResult<RunOutput> {
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(ok(&[]));
            }
            self.cancel.store(true, Ordering::SeqCst);
            Ok(RunOutput {
                success: false,
                status: "signal: 2 (SIGINT)".to_string(),
                lines: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_interrupted_acquisition_stops_cleanly() {
        let mut f = fixture(vec!["motorX".to_string()]);
        f.config.iterations = 1;
        f.config.over_voltage = vec![1.0];
        f.config.vth_e = vec![5];
        let cancel = Arc::new(AtomicBool::new(false));
        let runner = InterruptingRunner {
            cancel: Arc::clone(&cancel),
            runs: AtomicUsize::new(0),
        };
        let dispatcher = Dispatcher::new(&f.config, runner);
        let fixed = f.config.fixed_values().unwrap();
        let mut stages: Vec<Box<dyn Movable>> = vec![Box::new(FakeStage {
            name: "motorX".to_string(),
            positions: vec![0.0, 5.0, 10.0],
            position: 0.0,
            moves: Arc::default(),
            fail_at: None,
        })];

        let summary = SweepEngine::new(&mut f.bias, &mut f.disc, &dispatcher, &f.log, f.config.sweep_axes(), "run")
            .with_stages(&mut stages)
            .with_mode(ScanMode::Acquire)
            .with_cancel(cancel)
            .run(&fixed, 0)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.acquisitions, 1);
        assert_eq!(summary.next_index, 1);
        assert_eq!(names(&f.log), vec!["run_X0.0_0it_1.0OV_10T1_20T2_5E"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pauses_after_points_and_on_iteration_change() {
        let mut f = fixture(Vec::new());
        f.config.over_voltage = vec![1.0];
        let dispatcher = Dispatcher::new(&f.config, RecordingRunner::default());
        let fixed = f.config.fixed_values().unwrap();

        let started = tokio::time::Instant::now();
        let summary = SweepEngine::new(&mut f.bias, &mut f.disc, &dispatcher, &f.log, f.config.sweep_axes(), "run")
            .with_mode(ScanMode::Acquire)
            .with_pauses(Duration::from_secs(1), Duration::from_secs(100))
            .run(&fixed, 0)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        // 2 iterations x 2 E values: four acquisition pauses, one iteration pause
        assert_eq!(summary.acquisitions, 4);
        assert!(elapsed >= Duration::from_secs(104), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(105), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_bias_rewritten_only_on_overvoltage_change() {
        let mut f = fixture(Vec::new());
        f.config.iterations = 1;
        f.config.over_voltage = vec![1.0];
        let dispatcher = Dispatcher::new(&f.config, RecordingRunner::default());
        let fixed = f.config.fixed_values().unwrap();

        SweepEngine::new(&mut f.bias, &mut f.disc, &dispatcher, &f.log, f.config.sweep_axes(), "run")
            .with_mode(ScanMode::Acquire)
            .run(&fixed, 0)
            .await
            .unwrap();

        // E = 5 then E = 6 at the same overvoltage: the bias backup still
        // holds the fixed values, the disc backup holds the first point
        let cfg = f.dir.path().join("cfg");
        let swept = ChannelKey::new(2, 6);
        let bias_backup = BiasSettings::load(cfg.join("bias_settings_backup.tsv"), BTreeSet::new()).unwrap();
        assert_eq!(bias_backup.pre_breakdown(swept), Some(20.0));
        assert_eq!(bias_backup.overvoltage(swept), Some(0.0));
        let bias = BiasSettings::load(f.config.bias_settings_path(), BTreeSet::new()).unwrap();
        assert_eq!(bias.overvoltage(swept), Some(1.0));

        let disc_backup = DiscSettings::load(cfg.join("disc_settings_backup.tsv"), BTreeSet::new()).unwrap();
        assert_eq!(disc_backup.thresholds(0, ThresholdKind::E), vec![5]);
        let disc = DiscSettings::load(f.config.disc_settings_path(), BTreeSet::new()).unwrap();
        assert_eq!(disc.thresholds(0, ThresholdKind::E), vec![6]);
    }

    #[tokio::test]
    async fn test_start_index_out_of_range() {
        let mut f = fixture(Vec::new());
        let dispatcher = Dispatcher::new(&f.config, RecordingRunner::default());
        let fixed = f.config.fixed_values().unwrap();

        let err = SweepEngine::new(&mut f.bias, &mut f.disc, &dispatcher, &f.log, f.config.sweep_axes(), "run")
            .run(&fixed, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_processing_pass_continues_after_failure() {
        let f = fixture(Vec::new());
        for name in ["a", "b", "c"] {
            f.log
                .append(&RunLogEntry {
                    file_name: name.to_string(),
                    positions: Vec::new(),
                })
                .unwrap();
        }
        let runner = RecordingRunner::replying([ok(&[]), failed(), ok(&[])]);
        let dispatcher = Dispatcher::new(&f.config, runner);

        let summary = process_run_log(&dispatcher, &f.log, &AtomicBool::new(false)).await.unwrap();
        assert_eq!(
            summary,
            ProcessSummary {
                processed: 2,
                failed: 1,
                cancelled: false
            }
        );
        let inputs: Vec<bool> = dispatcher
            .runner()
            .calls()
            .iter()
            .map(|c| c.args.iter().any(|a| Path::new(a).ends_with("c")))
            .collect();
        assert_eq!(inputs, vec![false, false, true]);
        assert_eq!(f.log.entries().unwrap().len(), 3, "log is not modified");
    }
}
