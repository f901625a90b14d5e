//! # SiPM calibration scan
//!
//! Orchestrates calibration sweeps for SiPM detectors read out through the
//! PETsys TOFPET2 system: bias overvoltage and the three discriminator
//! thresholds are swept, optionally across up to three motorized stage axes,
//! and every point is acquired (and optionally processed) by the PETsys
//! command-line tools.
//!
//! ## Crate Structure
//!
//! - **`config`**: YAML configuration (`ScanConfig`) loaded with figment and validated.
//! - **`bias_map`**: reader for the bias map and the reference-channel lookup.
//! - **`settings`**: the bias and discriminator tables, with atomic persist and backup.
//! - **`commands`**: builds and runs the acquisition and processing binaries.
//! - **`sweep`**: pure Cartesian-product enumeration and output naming.
//! - **`run_log`**: the per-acquisition log used for resuming and processing.
//! - **`eta`**: remaining-time projection.
//! - **`engine`**: the sweep engine and the processing pass.
//! - **`hardware`**: controller discovery and stage bring-up.
//! - **`tracing_setup`**: subscriber initialisation.
//!
//! The serial protocol and the stage driver live in the `scan-core` and
//! `scan-driver-stepper` workspace crates.

pub mod bias_map;
pub mod commands;
pub mod config;
pub mod engine;
pub mod eta;
pub mod hardware;
pub mod run_log;
pub mod settings;
pub mod sweep;
pub mod tracing_setup;

pub use scan_core::{ScanError, ScanResult};
