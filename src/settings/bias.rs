use std::collections::BTreeSet;
use std::path::Path;

use scan_core::ScanResult;
use tracing::{debug, info};

use super::{ChannelKey, TsvTable};

const SLOT: &str = "slotID";
const CHANNEL: &str = "channelID";
const PRE_BREAKDOWN: &str = "Pre-breakdown";
const BREAKDOWN: &str = "Breakdown";
const OVERVOLTAGE: &str = "Overvoltage";

/// The bias voltage table, keyed by (slot, channel).
#[derive(Debug, Clone)]
pub struct BiasSettings {
    table: TsvTable,
    keys: Vec<ChannelKey>,
    reference: BTreeSet<ChannelKey>,
    pre_breakdown: usize,
    breakdown: usize,
    overvoltage: usize,
}

impl BiasSettings {
    /// Load the table; rows whose key is in `reference` are pinned.
    pub fn load(path: impl AsRef<Path>, reference: BTreeSet<ChannelKey>) -> ScanResult<Self> {
        let table = TsvTable::load(path)?;
        let slots = table.parse_column(table.column(SLOT)?)?;
        let channels = table.parse_column(table.column(CHANNEL)?)?;
        let keys = slots
            .into_iter()
            .zip(channels)
            .map(|(slot, channel)| ChannelKey::new(slot, channel))
            .collect();

        Ok(Self {
            pre_breakdown: table.column(PRE_BREAKDOWN)?,
            breakdown: table.column(BREAKDOWN)?,
            overvoltage: table.column(OVERVOLTAGE)?,
            table,
            keys,
            reference,
        })
    }

    /// Write the sweep-independent voltages.
    ///
    /// Every row gets `prebreak` and `breakdown`; reference rows are then set
    /// to `reference = [pre-breakdown, breakdown, overvoltage]`.
    pub fn apply_fixed_values(&mut self, prebreak: f64, breakdown: f64, reference: [f64; 3]) {
        self.table
            .set_where(self.pre_breakdown, &prebreak.to_string(), |_| true);
        self.table
            .set_where(self.breakdown, &breakdown.to_string(), |_| true);

        let keys = &self.keys;
        let pinned = &self.reference;
        for (column, value) in [
            (self.pre_breakdown, reference[0]),
            (self.breakdown, reference[1]),
            (self.overvoltage, reference[2]),
        ] {
            self.table
                .set_where(column, &value.to_string(), |row| pinned.contains(&keys[row]));
        }
        info!(
            prebreak,
            breakdown,
            reference_channels = self.reference.len(),
            "fixed bias voltages applied"
        );
    }

    /// Set the overvoltage of every non-reference channel.
    pub fn set_overvoltage(&mut self, voltage: f64) {
        let keys = &self.keys;
        let pinned = &self.reference;
        self.table.set_where(self.overvoltage, &voltage.to_string(), |row| {
            !pinned.contains(&keys[row])
        });
        debug!(voltage, "overvoltage set");
    }

    /// Overvoltage cell of a channel, parsed.
    pub fn overvoltage(&self, key: ChannelKey) -> Option<f64> {
        self.value(key, self.overvoltage)
    }

    /// Pre-breakdown cell of a channel, parsed.
    pub fn pre_breakdown(&self, key: ChannelKey) -> Option<f64> {
        self.value(key, self.pre_breakdown)
    }

    /// Breakdown cell of a channel, parsed.
    pub fn breakdown(&self, key: ChannelKey) -> Option<f64> {
        self.value(key, self.breakdown)
    }

    /// Back up and rewrite the table file.
    pub fn persist(&self) -> ScanResult<()> {
        self.table.persist()
    }

    /// Underlying table.
    pub fn table(&self) -> &TsvTable {
        &self.table
    }

    fn value(&self, key: ChannelKey, column: usize) -> Option<f64> {
        let row = self.keys.iter().position(|k| *k == key)?;
        self.table.cell(row, column)?.trim().parse().ok()
    }
}
