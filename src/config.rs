//! Scan configuration using Figment
//!
//! Configuration is loaded from:
//! 1. the YAML scan file given on the command line
//! 2. environment variables prefixed with `SIPM_SCAN_`
//!    (e.g. `SIPM_SCAN_LOG_LEVEL=debug`)
//!
//! Enumerated settings are serde enums, so typos fail at load time. Everything
//! that parses but is semantically wrong is caught by [`ScanConfig::validate`].
//!
//! # Example
//! ```no_run
//! use sipm_scan::config::ScanConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ScanConfig::load_from("scan.yaml")?;
//! config.validate()?;
//! println!("writing to {}", config.out_directory.display());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use scan_core::{ScanError, ScanResult};
use scan_driver_stepper::{StageConfig, MOTOR_AXES};
use serde::{Deserialize, Serialize};

use crate::settings::{BIAS_SETTINGS_FILE, DISC_SETTINGS_FILE};
use crate::sweep::SweepAxes;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SIPM_SCAN_";

/// Front-end module type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FemType {
    /// 128-channel module, two chips per port.
    #[serde(rename = "FEM128")]
    Fem128,
    /// 256-channel module, four chips per port.
    #[serde(rename = "FEM256")]
    Fem256,
}

impl FemType {
    /// ASICs served by one front-end port.
    pub fn chips_per_port(self) -> u32 {
        match self {
            FemType::Fem128 => 2,
            FemType::Fem256 => 4,
        }
    }
}

/// Front-end board type; selects the port column of the bias map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FebdType {
    /// FEB/D-1k
    #[serde(rename = "FEBD1k")]
    Febd1k,
    /// FEB/D-8k
    #[serde(rename = "FEBD8k")]
    Febd8k,
}

impl fmt::Display for FebdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FebdType::Febd1k => "FEBD1k",
            FebdType::Febd8k => "FEBD8k",
        })
    }
}

/// Bias board type; selects the DAC column of the bias map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BiasBoard {
    /// 16-channel bias board
    #[serde(rename = "BIAS_16P")]
    Bias16P,
    /// 32-channel bias board
    #[serde(rename = "BIAS_32P")]
    Bias32P,
    /// 64-channel bias board
    #[serde(rename = "BIAS_64P")]
    Bias64P,
}

impl fmt::Display for BiasBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BiasBoard::Bias16P => "BIAS_16P",
            BiasBoard::Bias32P => "BIAS_32P",
            BiasBoard::Bias64P => "BIAS_64P",
        })
    }
}

/// Energy measurement mode of the acquisition binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMode {
    /// Charge integration
    Qdc,
    /// Time over threshold
    Tot,
}

impl fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AcquisitionMode::Qdc => "qdc",
            AcquisitionMode::Tot => "tot",
        })
    }
}

/// Event grouping applied when processing raw data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Coincidence pairs
    Coincidence,
    /// Single hits
    #[serde(alias = "single")]
    Singles,
    /// Hit groups
    Group,
}

/// Writer used by the processing binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// Binary files
    Binary,
    /// Text files
    Txt,
    /// ROOT files
    Root,
}

/// Complete scan configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Directory holding `config.ini` and the two settings tables
    pub config_directory: PathBuf,
    /// Directory holding the acquisition and processing binaries
    pub petsys_directory: PathBuf,
    /// Directory receiving raw and processed data
    pub out_directory: PathBuf,
    /// Prefix of every output file name
    pub out_name: String,
    /// Semicolon-separated bias map
    pub bias_file: PathBuf,

    /// Front-end module type
    #[serde(rename = "FEM")]
    pub fem: FemType,
    /// Front-end board type
    #[serde(rename = "FEBD")]
    pub febd: FebdType,
    /// Bias board type
    #[serde(rename = "BIAS_board")]
    pub bias_board: BiasBoard,

    /// Front-end port of the reference detector (-1 = none)
    #[serde(default = "default_ref_det_febd")]
    pub ref_det_febd: i32,
    /// Reference pre-breakdown, breakdown and overvoltage
    pub ref_det_volt: Vec<f64>,
    /// Reference T1, T2 and E thresholds
    pub ref_det_ths: Vec<u32>,

    /// Acquisition mode
    pub mode: AcquisitionMode,
    /// Enable the external hardware trigger
    #[serde(default)]
    pub hw_trigger: bool,
    /// Acquisition time per point in seconds
    pub time: f64,
    /// Processing event grouping
    pub data_type: DataType,
    /// Processing output format
    pub data_format: DataFormat,
    /// Use compact writers
    #[serde(default)]
    pub data_compact: bool,
    /// Percentage of events kept
    #[serde(default = "default_fraction")]
    pub fraction: u32,
    /// Hits per group for `--writeMultipleHits`
    #[serde(default = "default_hits")]
    pub hits: u32,

    /// Pre-breakdown voltage for non-reference channels
    pub prebreak_voltage: f64,
    /// Breakdown voltage for non-reference channels
    pub break_voltage: f64,
    /// Overvoltage sweep values
    pub over_voltage: Vec<f64>,
    /// T1 threshold sweep values
    pub vth_t1: Vec<u32>,
    /// T2 threshold sweep values
    pub vth_t2: Vec<u32>,
    /// E threshold sweep values
    pub vth_e: Vec<u32>,

    /// Repetitions of the full threshold sweep
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Pause in seconds when the iteration changes
    #[serde(default)]
    pub time_between_iterations: f64,
    /// Pause in seconds after every acquisition
    #[serde(default)]
    pub time_between_acquisitions: f64,
    /// Seconds per processed output file (<= 0 disables splitting)
    #[serde(default = "default_split_time")]
    pub split_time: f64,
    /// Run-log path (defaults to `<out_directory>/<out_name>_files.log`)
    #[serde(default)]
    pub run_log: Option<PathBuf>,

    /// Enable stage scanning
    #[serde(default)]
    pub motor: bool,
    /// Controller serial port (empty = autodetect)
    #[serde(rename = "COM_port", default)]
    pub com_port: String,
    /// Stage combination to resume from
    #[serde(default)]
    pub pos_ini: usize,
    /// Default serial reply deadline in seconds
    #[serde(default = "default_serial_timeout")]
    pub serial_timeout: f64,
    /// X axis
    #[serde(rename = "motorX", default)]
    pub motor_x: Option<StageConfig>,
    /// Y axis
    #[serde(rename = "motorY", default)]
    pub motor_y: Option<StageConfig>,
    /// Z axis
    #[serde(rename = "motorZ", default)]
    pub motor_z: Option<StageConfig>,

    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_ref_det_febd() -> i32 {
    -1
}

fn default_fraction() -> u32 {
    100
}

fn default_hits() -> u32 {
    1
}

fn default_iterations() -> usize {
    1
}

fn default_split_time() -> f64 {
    -1.0
}

fn default_serial_timeout() -> f64 {
    300.0
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Fixed settings written before the sweep starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedValues {
    /// Pre-breakdown voltage for ordinary channels
    pub prebreak_voltage: f64,
    /// Breakdown voltage for ordinary channels
    pub break_voltage: f64,
    /// Reference pre-breakdown, breakdown and overvoltage
    pub reference_voltages: [f64; 3],
    /// First sweep value of T1, T2 and E for ordinary chips
    pub first_thresholds: [u32; 3],
    /// Reference T1, T2 and E
    pub reference_thresholds: [u32; 3],
}

impl ScanConfig {
    /// Load configuration from a YAML file and `SIPM_SCAN_` environment variables
    pub fn load_from<P: AsRef<Path>>(path: P) -> ScanResult<Self> {
        let config = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> ScanResult<()> {
        require_dir(&self.config_directory, "config_directory")?;
        require_dir(&self.petsys_directory, "petsys_directory")?;
        if !self.bias_file.is_file() {
            return invalid(format!(
                "bias_file {} does not exist",
                self.bias_file.display()
            ));
        }
        if self.out_name.trim().is_empty() {
            return invalid("out_name must not be empty");
        }

        if self.ref_det_volt.len() != 3 {
            return invalid("ref_det_volt must hold pre-breakdown, breakdown and overvoltage");
        }
        if self.ref_det_ths.len() != 3 {
            return invalid("ref_det_ths must hold the T1, T2 and E thresholds");
        }
        if self.ref_det_febd < -1 {
            return invalid("ref_det_febd must be -1 (no reference) or a port number");
        }

        if !positive(self.time) {
            return invalid("time must be greater than 0");
        }
        if !(1..=100).contains(&self.fraction) {
            return invalid("fraction must be greater than 0 and at most 100");
        }
        if !(1..=64).contains(&self.hits) {
            return invalid("hits must be greater than 0 and at most 64");
        }

        for (name, empty) in [
            ("over_voltage", self.over_voltage.is_empty()),
            ("vth_t1", self.vth_t1.is_empty()),
            ("vth_t2", self.vth_t2.is_empty()),
            ("vth_e", self.vth_e.is_empty()),
        ] {
            if empty {
                return invalid(format!("{name} must list at least one value"));
            }
        }
        if self.iterations == 0 {
            return invalid("iterations must be at least 1");
        }
        for (name, value) in [
            ("time_between_iterations", self.time_between_iterations),
            ("time_between_acquisitions", self.time_between_acquisitions),
        ] {
            if value < 0.0 {
                return invalid(format!("{name} must not be negative"));
            }
        }
        if !positive(self.serial_timeout) {
            return invalid("serial_timeout must be greater than 0");
        }

        if self.motor && self.stage_configs().is_empty() {
            return invalid("motor is enabled but no motorX/motorY/motorZ section is present");
        }
        // maintenance commands drive every present section, scanned or not
        for (name, _, stage) in self.stage_sections() {
            stage.validate(name)?;
        }

        crate::tracing_setup::parse_log_level(&self.log_level)?;
        Ok(())
    }

    /// Configured stage axes in X, Y, Z order with their controller ids.
    ///
    /// Empty when stage scanning is disabled.
    pub fn stage_configs(&self) -> Vec<(&'static str, u8, &StageConfig)> {
        if !self.motor {
            return Vec::new();
        }
        self.stage_sections()
    }

    /// Every stage section present, whether or not stage scanning is enabled.
    pub fn stage_sections(&self) -> Vec<(&'static str, u8, &StageConfig)> {
        let sections = [&self.motor_x, &self.motor_y, &self.motor_z];
        MOTOR_AXES
            .iter()
            .zip(sections)
            .filter_map(|(&(name, id), section)| section.as_ref().map(|cfg| (name, id, cfg)))
            .collect()
    }

    /// Stage axis section by motor name.
    pub fn stage_config(&self, name: &str) -> Option<&StageConfig> {
        match name {
            "motorX" => self.motor_x.as_ref(),
            "motorY" => self.motor_y.as_ref(),
            "motorZ" => self.motor_z.as_ref(),
            _ => None,
        }
    }

    /// Inner sweep axes: iterations x overvoltage x T1 x T2 x E.
    pub fn sweep_axes(&self) -> SweepAxes {
        SweepAxes::new(
            self.iterations,
            self.over_voltage.clone(),
            self.vth_t1.clone(),
            self.vth_t2.clone(),
            self.vth_e.clone(),
        )
    }

    /// Values written to the settings tables before the sweep.
    pub fn fixed_values(&self) -> ScanResult<FixedValues> {
        let triple_f64 = |values: &[f64], name: &str| -> ScanResult<[f64; 3]> {
            values
                .try_into()
                .map_err(|_| ScanError::Configuration(format!("{name} must hold three values")))
        };
        let triple_u32 = |values: &[u32], name: &str| -> ScanResult<[u32; 3]> {
            values
                .try_into()
                .map_err(|_| ScanError::Configuration(format!("{name} must hold three values")))
        };
        let first = |values: &[u32], name: &str| -> ScanResult<u32> {
            values
                .first()
                .copied()
                .ok_or_else(|| ScanError::Configuration(format!("{name} is empty")))
        };

        Ok(FixedValues {
            prebreak_voltage: self.prebreak_voltage,
            break_voltage: self.break_voltage,
            reference_voltages: triple_f64(&self.ref_det_volt, "ref_det_volt")?,
            first_thresholds: [
                first(&self.vth_t1, "vth_t1")?,
                first(&self.vth_t2, "vth_t2")?,
                first(&self.vth_e, "vth_e")?,
            ],
            reference_thresholds: triple_u32(&self.ref_det_ths, "ref_det_ths")?,
        })
    }

    /// Run-log location.
    pub fn run_log_path(&self) -> PathBuf {
        self.run_log.clone().unwrap_or_else(|| {
            self.out_directory
                .join(format!("{}_files.log", self.out_name))
        })
    }

    /// Path of the bias settings table.
    pub fn bias_settings_path(&self) -> PathBuf {
        self.config_directory.join(BIAS_SETTINGS_FILE)
    }

    /// Path of the discriminator settings table.
    pub fn disc_settings_path(&self) -> PathBuf {
        self.config_directory.join(DISC_SETTINGS_FILE)
    }

    /// Path of the acquisition system `config.ini`.
    pub fn ini_path(&self) -> PathBuf {
        self.config_directory.join("config.ini")
    }

    /// Default serial reply deadline.
    pub fn serial_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.serial_timeout)
    }

    /// Pause after every acquisition.
    pub fn acquisition_pause(&self) -> Duration {
        Duration::from_secs_f64(self.time_between_acquisitions.max(0.0))
    }

    /// Pause when the iteration index changes.
    pub fn iteration_pause(&self) -> Duration {
        Duration::from_secs_f64(self.time_between_iterations.max(0.0))
    }
}

fn require_dir(path: &Path, key: &str) -> ScanResult<()> {
    if path.is_dir() {
        Ok(())
    } else {
        invalid(format!("{key} {} does not exist", path.display()))
    }
}

fn positive(value: f64) -> bool {
    value > 0.0
}

fn invalid<T>(message: impl Into<String>) -> ScanResult<T> {
    Err(ScanError::Configuration(message.into()))
}
