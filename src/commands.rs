//! Command dispatcher for the acquisition and processing binaries.
//!
//! The binaries are opaque collaborators: the dispatcher builds their argument
//! lists, runs them through a [`CommandRunner`], and decides success from the
//! exit status alone. Output is streamed to the log and scanned for the
//! lost-frame report, which is informational.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scan_core::{ScanError, ScanResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::config::{AcquisitionMode, DataFormat, DataType, ScanConfig};

/// Acquisition binary, resolved inside `petsys_directory`.
pub const ACQUIRE_BINARY: &str = "acquire_sipm_data";

static LOST_FRAMES: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)all events were lost for\s+(\d+)\s*\(\s*([\d\.]+)%\)\s*frames").ok()
});

/// A fully resolved external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Executable path
    pub program: PathBuf,
    /// Arguments, one per element
    pub args: Vec<String>,
}

impl Invocation {
    fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn path_arg(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Result of running an [`Invocation`] to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// True when the process exited with status 0
    pub success: bool,
    /// Exit status as reported by the OS
    pub status: String,
    /// Combined stdout/stderr lines
    pub lines: Vec<String>,
}

/// Runs external commands to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `invocation` and wait for it to exit.
    ///
    /// Errors only when the process could not be started; a non-zero exit is
    /// reported through [`RunOutput::success`].
    async fn run(&self, invocation: &Invocation) -> ScanResult<RunOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> ScanResult<RunOutput> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // own process group: a terminal Ctrl-C stops the sweep between steps
        // instead of killing the acquisition mid-run
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn()?;

        let program = invocation.program.display().to_string();
        let (stdout, stderr) = tokio::join!(
            stream_lines(child.stdout.take(), &program),
            stream_lines(child.stderr.take(), &program),
        );
        let status = child.wait().await?;

        let mut lines = stdout?;
        lines.extend(stderr?);
        Ok(RunOutput {
            success: status.success(),
            status: status.to_string(),
            lines,
        })
    }
}

async fn stream_lines<R>(pipe: Option<R>, program: &str) -> ScanResult<Vec<String>>
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return Ok(Vec::new());
    };
    let mut reader = BufReader::new(pipe).lines();
    let mut lines = Vec::new();
    while let Some(line) = reader.next_line().await? {
        info!(target: "sipm_scan::external", program, "{line}");
        lines.push(line);
    }
    Ok(lines)
}

/// Lost-frame report printed by the acquisition binary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LostFrames {
    /// Frames in which every event was dropped
    pub frames: u64,
    /// Share of all frames, in percent
    pub percent: f64,
}

impl LostFrames {
    /// Find the last lost-frame report in `lines`.
    pub fn scan<S: AsRef<str>>(lines: &[S]) -> Option<Self> {
        let pattern = LOST_FRAMES.as_ref()?;
        lines.iter().rev().find_map(|line| {
            let captures = pattern.captures(line.as_ref())?;
            Some(Self {
                frames: captures.get(1)?.as_str().parse().ok()?,
                percent: captures.get(2)?.as_str().parse().ok()?,
            })
        })
    }
}

/// Converter binary and output suffix for a data type.
pub fn converter(data_type: DataType) -> (&'static str, &'static str) {
    match data_type {
        DataType::Coincidence => ("convert_raw_to_coincidence", "_coinc"),
        DataType::Singles => ("convert_raw_to_single", "_single"),
        DataType::Group => ("convert_raw_to_group", "_group"),
    }
}

/// Writer flag for a data format; text output without compaction takes none.
pub fn format_flag(format: DataFormat, compact: bool) -> Option<&'static str> {
    match (format, compact) {
        (DataFormat::Txt, true) => Some("--writeTextCompact"),
        (DataFormat::Txt, false) => None,
        (DataFormat::Binary, true) => Some("--writeBinaryCompact"),
        (DataFormat::Binary, false) => Some("--writeBinary"),
        (DataFormat::Root, _) => Some("--writeRoot"),
    }
}

/// Builds and runs acquisition and processing commands.
#[derive(Debug, Clone)]
pub struct Dispatcher<R = ProcessRunner> {
    runner: R,
    petsys_directory: PathBuf,
    ini_path: PathBuf,
    out_directory: PathBuf,
    mode: AcquisitionMode,
    time: f64,
    hw_trigger: bool,
    data_type: DataType,
    data_format: DataFormat,
    compact: bool,
    hits: u32,
    split_time: f64,
}

impl<R: CommandRunner> Dispatcher<R> {
    /// Capture the command-relevant parts of `config`.
    pub fn new(config: &ScanConfig, runner: R) -> Self {
        Self {
            runner,
            petsys_directory: config.petsys_directory.clone(),
            ini_path: config.ini_path(),
            out_directory: config.out_directory.clone(),
            mode: config.mode,
            time: config.time,
            hw_trigger: config.hw_trigger,
            data_type: config.data_type,
            data_format: config.data_format,
            compact: config.data_compact,
            hits: config.hits,
            split_time: config.split_time,
        }
    }

    /// The runner commands are sent to.
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Acquisition command for one output base name.
    pub fn acquisition_invocation(&self, name: &str) -> Invocation {
        let invocation = Invocation::new(self.petsys_directory.join(ACQUIRE_BINARY))
            .arg("--config")
            .path_arg(&self.ini_path)
            .arg("--mode")
            .arg(self.mode.to_string())
            .arg("--time")
            .arg(self.time.to_string())
            .arg("-o")
            .path_arg(&self.out_directory.join(name));
        if self.hw_trigger {
            invocation.arg("--enable-hw-trigger")
        } else {
            invocation
        }
    }

    /// Processing command for one output base name.
    pub fn processing_invocation(&self, name: &str) -> Invocation {
        let (binary, suffix) = converter(self.data_type);
        let compact = if self.compact { "Compact" } else { "" };

        let mut invocation = Invocation::new(self.petsys_directory.join(binary))
            .arg("--config")
            .path_arg(&self.ini_path)
            .arg("-i")
            .path_arg(&self.out_directory.join(name))
            .arg("-o")
            .path_arg(&self.out_directory.join(format!("{name}{suffix}{compact}")))
            .arg("--writeMultipleHits")
            .arg(self.hits.to_string());
        if let Some(flag) = format_flag(self.data_format, self.compact) {
            invocation = invocation.arg(flag);
        }
        if self.split_time > 0.0 {
            invocation = invocation.arg("--splitTime").arg(self.split_time.to_string());
        }
        invocation
    }

    /// Run one acquisition; returns the lost-frame report if one was printed.
    #[instrument(skip(self), err)]
    pub async fn acquire(&self, name: &str) -> ScanResult<Option<LostFrames>> {
        tokio::fs::create_dir_all(&self.out_directory).await?;

        let invocation = self.acquisition_invocation(name);
        debug!(command = %invocation, "starting acquisition");
        let output = self.runner.run(&invocation).await?;
        if !output.success {
            return Err(ScanError::AcquisitionFailure {
                name: name.to_string(),
                status: output.status,
            });
        }

        let lost = LostFrames::scan(&output.lines);
        match lost {
            Some(lost) if lost.frames > 0 => {
                warn!(name, frames = lost.frames, percent = lost.percent, "frames lost during acquisition");
            }
            _ => info!(name, "acquisition complete"),
        }
        Ok(lost)
    }

    /// Convert one acquisition's raw data.
    #[instrument(skip(self), err)]
    pub async fn process(&self, name: &str) -> ScanResult<()> {
        let invocation = self.processing_invocation(name);
        debug!(command = %invocation, "starting processing");
        let output = self.runner.run(&invocation).await?;
        if !output.success {
            return Err(ScanError::ProcessingFailure {
                name: name.to_string(),
                status: output.status,
            });
        }
        info!(name, "processing complete");
        Ok(())
    }
}
