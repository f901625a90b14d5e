//! CLI entry point for sipm-scan
//!
//! Subcommands:
//! - `scan`: run the calibration sweep (acquire, process, or both)
//! - `process`: process every entry of an existing run log
//! - `home`, `move-to`, `move-time`, `ping-led`: stage maintenance
//!
//! # Usage
//!
//! ```bash
//! sipm-scan scan scan.yaml --mode both
//! sipm-scan scan scan.yaml --start-index 4 --on-existing-log append
//! sipm-scan move-to scan.yaml motorX 12.5
//! ```

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use scan_driver_stepper::StepperStage;
use sipm_scan::bias_map::{read_bias_map, reference_channels};
use sipm_scan::commands::{Dispatcher, ProcessRunner};
use sipm_scan::config::ScanConfig;
use sipm_scan::engine::{process_run_log, ScanMode, SweepEngine};
use sipm_scan::hardware::{close_link, StageRig};
use sipm_scan::run_log::{ExistingLogAction, RunLog};
use sipm_scan::settings::{BiasSettings, DiscSettings};
use sipm_scan::tracing_setup::{self, OutputFormat, TracingConfig};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sipm-scan")]
#[command(about = "SiPM calibration sweeps over bias, thresholds and stage positions", long_about = None)]
struct Cli {
    /// Log format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the calibration sweep
    Scan {
        /// Scan configuration file
        config: PathBuf,

        /// Acquire, process, or both
        #[arg(long, value_enum, default_value_t = ScanMode::Both)]
        mode: ScanMode,

        /// Stage combination to start from (defaults to `pos_ini`)
        #[arg(long)]
        start_index: Option<usize>,

        /// What to do when the run log already exists
        #[arg(long, value_enum, default_value_t = OnExistingLog::Ask)]
        on_existing_log: OnExistingLog,
    },

    /// Process every entry of the run log
    Process {
        /// Scan configuration file
        config: PathBuf,
    },

    /// Drive every configured motor to its limit switch and zero it
    Home {
        /// Scan configuration file
        config: PathBuf,
    },

    /// Move one motor to an absolute position
    MoveTo {
        /// Scan configuration file
        config: PathBuf,
        /// motorX, motorY or motorZ
        axis: String,
        /// Target in mm (linear) or degrees (rotary)
        position: f64,
    },

    /// Run one motor for a number of seconds at its configured speed
    MoveTime {
        /// Scan configuration file
        config: PathBuf,
        /// motorX, motorY or motorZ
        axis: String,
        /// Motion time in seconds
        seconds: f64,
        /// 1 forward, 0 backward
        #[arg(value_parser = clap::value_parser!(u8).range(0..=1))]
        direction: u8,
    },

    /// Blink the controller LED
    PingLed {
        /// Scan configuration file
        config: PathBuf,
    },
}

impl Commands {
    fn config_path(&self) -> &Path {
        match self {
            Commands::Scan { config, .. }
            | Commands::Process { config }
            | Commands::Home { config }
            | Commands::MoveTo { config, .. }
            | Commands::MoveTime { config, .. }
            | Commands::PingLed { config } => config,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OnExistingLog {
    /// Prompt on the terminal
    Ask,
    /// Delete the old log
    Delete,
    /// Append to the old log
    Append,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.command.config_path().to_path_buf();
    let config = ScanConfig::load_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate()?;
    tracing_setup::init(TracingConfig::from_level_str(&config.log_level)?.with_format(cli.log_format))?;
    info!(config = %config_path.display(), "configuration loaded");

    match cli.command {
        Commands::Scan {
            mode,
            start_index,
            on_existing_log,
            ..
        } => match mode {
            ScanMode::Process => run_processing(&config).await,
            _ => run_scan(&config, mode, start_index.unwrap_or(config.pos_ini), on_existing_log).await,
        },
        Commands::Process { .. } => run_processing(&config).await,
        Commands::Home { .. } => home(&config).await,
        Commands::MoveTo { axis, position, .. } => move_to(&config, &axis, position).await,
        Commands::MoveTime {
            axis,
            seconds,
            direction,
            ..
        } => move_time(&config, &axis, seconds, direction).await,
        Commands::PingLed { .. } => ping_led(&config).await,
    }
}

async fn run_scan(
    config: &ScanConfig,
    mode: ScanMode,
    start_index: usize,
    on_existing_log: OnExistingLog,
) -> Result<()> {
    let map = read_bias_map(&config.bias_file)?;
    let reference = reference_channels(config, &map)?;
    info!(
        bias_channels = reference.bias.len(),
        chips = ?reference.chips,
        "reference detector resolved"
    );
    let mut bias = BiasSettings::load(config.bias_settings_path(), reference.bias)?;
    let mut disc = DiscSettings::load(config.disc_settings_path(), reference.chips)?;
    let dispatcher = Dispatcher::new(config, ProcessRunner);

    let sections = config.stage_configs();
    let run_log = RunLog::new(
        config.run_log_path(),
        sections.iter().map(|(name, _, _)| name.to_string()).collect(),
    );
    run_log.prepare(|path| decide_existing_log(on_existing_log, path))?;

    let cancel = cancel_on_ctrl_c();
    let (link, mut stages) = if sections.is_empty() {
        (None, Vec::new())
    } else {
        let (link, stages) = StageRig::open(config, &sections).await?.into_movables();
        (Some(link), stages)
    };

    let fixed = config.fixed_values()?;
    let result = SweepEngine::new(
        &mut bias,
        &mut disc,
        &dispatcher,
        &run_log,
        config.sweep_axes(),
        config.out_name.clone(),
    )
    .with_stages(&mut stages)
    .with_mode(mode)
    .with_pauses(config.acquisition_pause(), config.iteration_pause())
    .with_cancel(cancel)
    .run(&fixed, start_index)
    .await;

    if let Some(link) = &link {
        close_link(link).await;
    }
    let summary = result?;

    if summary.cancelled {
        warn!(resume_index = summary.next_index, "scan interrupted; rerun with --start-index to resume");
        bail!("scan interrupted at stage combination {}", summary.next_index);
    }
    println!(
        "Scan complete: {} acquisitions, {} frames lost, log at {}",
        summary.acquisitions,
        summary.lost_frames,
        run_log.path().display()
    );
    if summary.processing_failures > 0 {
        bail!("{} acquisitions failed to process", summary.processing_failures);
    }
    Ok(())
}

async fn run_processing(config: &ScanConfig) -> Result<()> {
    let run_log = RunLog::open(config.run_log_path())?;
    let dispatcher = Dispatcher::new(config, ProcessRunner);
    let cancel = cancel_on_ctrl_c();

    let summary = process_run_log(&dispatcher, &run_log, &cancel).await?;
    println!(
        "Processing complete: {} processed, {} failed",
        summary.processed, summary.failed
    );
    if summary.cancelled {
        bail!("processing interrupted");
    }
    if summary.failed > 0 {
        bail!("{} run-log entries failed to process", summary.failed);
    }
    Ok(())
}

async fn home(config: &ScanConfig) -> Result<()> {
    let sections = config.stage_sections();
    if sections.is_empty() {
        bail!("no motorX/motorY/motorZ section in the configuration");
    }
    let mut rig = StageRig::open(config, &sections).await?;
    let mut result = Ok(());
    for (name, _, _) in &sections {
        result = rig.stage_mut(name)?.find_home().await;
        if result.is_err() {
            break;
        }
    }
    rig.close().await;
    Ok(result?)
}

async fn move_to(config: &ScanConfig, axis: &str, position: f64) -> Result<()> {
    let section = config
        .stage_sections()
        .into_iter()
        .find(|(name, _, _)| *name == axis)
        .with_context(|| format!("no {axis} section in the configuration"))?;

    let mut rig = StageRig::open(config, &[section]).await?;
    let result = rig.stage_mut(axis)?.move_absolute(position).await;
    rig.close().await;
    result?;
    println!("{axis} at {position}");
    Ok(())
}

async fn move_time(config: &ScanConfig, axis: &str, seconds: f64, direction: u8) -> Result<()> {
    let (name, id, section) = config
        .stage_sections()
        .into_iter()
        .find(|(name, _, _)| *name == axis)
        .with_context(|| format!("no {axis} section in the configuration"))?;

    // the move may legitimately take `seconds`, so allow a minute on top
    let mut section = section.clone();
    section.while_timeout = Some(seconds + 60.0);
    let steps = StepperStage::steps_for_duration(section.speed, seconds);

    let mut rig = StageRig::open(config, &[(name, id, &section)]).await?;
    let sign = if direction == 1 { 1 } else { -1 };
    let result = rig.stage_mut(axis)?.move_relative(sign, steps).await;
    rig.close().await;
    Ok(result?)
}

async fn ping_led(config: &ScanConfig) -> Result<()> {
    let sections = config.stage_sections();
    let Some(&first) = sections.first() else {
        bail!("no motorX/motorY/motorZ section in the configuration");
    };
    let mut rig = StageRig::open(config, &[first]).await?;
    let result = rig.stage_mut(first.0)?.ping_led().await;
    rig.close().await;
    Ok(result?)
}

fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping after the current step");
            flag.store(true, Ordering::SeqCst);
        }
    });
    cancel
}

fn decide_existing_log(policy: OnExistingLog, path: &Path) -> ExistingLogAction {
    match policy {
        OnExistingLog::Delete => ExistingLogAction::Delete,
        OnExistingLog::Append => ExistingLogAction::Append,
        OnExistingLog::Ask => prompt_existing_log(path),
    }
}

fn prompt_existing_log(path: &Path) -> ExistingLogAction {
    let stdin = io::stdin();
    loop {
        print!(
            "Run log {} already exists. [d]elete, [a]ppend or [q]uit? ",
            path.display()
        );
        if io::stdout().flush().is_err() {
            return ExistingLogAction::Abort;
        }
        let mut answer = String::new();
        match stdin.lock().read_line(&mut answer) {
            Ok(0) | Err(_) => return ExistingLogAction::Abort,
            Ok(_) => {}
        }
        match answer.trim().to_lowercase().as_str() {
            "d" | "delete" => return ExistingLogAction::Delete,
            "a" | "append" => return ExistingLogAction::Append,
            "q" | "quit" | "n" | "no" => return ExistingLogAction::Abort,
            _ => println!("Please answer d, a or q."),
        }
    }
}
