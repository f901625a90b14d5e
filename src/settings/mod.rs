//! Detector settings tables.
//!
//! The acquisition system reads its bias voltages and discriminator thresholds
//! from two tab-separated files in the configuration directory. The scan keeps
//! both tables in memory, mutates them between acquisitions and writes them
//! back through [`TsvTable::persist`], which always leaves a `_backup` copy
//! of the previous file next to the new one.
//!
//! Rows that belong to the reference detector are pinned to their own values
//! and never touched by the sweep setters.

mod bias;
mod disc;
mod table;

pub use bias::BiasSettings;
pub use disc::{DiscSettings, ThresholdKind};
pub use table::TsvTable;

/// File name of the bias settings table.
pub const BIAS_SETTINGS_FILE: &str = "bias_settings.tsv";

/// File name of the discriminator settings table.
pub const DISC_SETTINGS_FILE: &str = "disc_settings.tsv";

/// A bias channel, identified by its slot and channel ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelKey {
    /// Bias board slot
    pub slot: u32,
    /// Channel (DAC) within the slot
    pub channel: u32,
}

impl ChannelKey {
    /// Build a key from slot and channel ids.
    pub fn new(slot: u32, channel: u32) -> Self {
        Self { slot, channel }
    }
}
