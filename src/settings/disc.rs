use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use scan_core::ScanResult;
use tracing::{debug, info};

use super::TsvTable;

const CHIP: &str = "chipID";

/// One of the three discriminator thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdKind {
    /// Timing trigger
    T1,
    /// Second timing trigger
    T2,
    /// Energy trigger
    E,
}

impl ThresholdKind {
    /// All thresholds, in the order the sweep sets them.
    pub const ALL: [ThresholdKind; 3] = [ThresholdKind::T1, ThresholdKind::T2, ThresholdKind::E];

    /// Column holding this threshold.
    pub fn column(self) -> &'static str {
        match self {
            ThresholdKind::T1 => "vth_t1",
            ThresholdKind::T2 => "vth_t2",
            ThresholdKind::E => "vth_e",
        }
    }
}

impl fmt::Display for ThresholdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ThresholdKind::T1 => "T1",
            ThresholdKind::T2 => "T2",
            ThresholdKind::E => "E",
        })
    }
}

/// The discriminator threshold table, keyed by chip id.
#[derive(Debug, Clone)]
pub struct DiscSettings {
    table: TsvTable,
    chips: Vec<u32>,
    reference: BTreeSet<u32>,
    columns: [usize; 3],
}

impl DiscSettings {
    /// Load the table; rows whose chip is in `reference` are pinned.
    pub fn load(path: impl AsRef<Path>, reference: BTreeSet<u32>) -> ScanResult<Self> {
        let table = TsvTable::load(path)?;
        let chips = table.parse_column(table.column(CHIP)?)?;
        let columns = [
            table.column(ThresholdKind::T1.column())?,
            table.column(ThresholdKind::T2.column())?,
            table.column(ThresholdKind::E.column())?,
        ];
        Ok(Self {
            table,
            chips,
            reference,
            columns,
        })
    }

    /// Write the first sweep value of each threshold everywhere, then pin
    /// reference chips to `reference = [t1, t2, e]`.
    pub fn apply_fixed_values(&mut self, first: [u32; 3], reference: [u32; 3]) {
        let chips = &self.chips;
        let pinned = &self.reference;
        for (i, kind) in ThresholdKind::ALL.into_iter().enumerate() {
            let column = self.columns[i];
            self.table.set_where(column, &first[i].to_string(), |_| true);
            self.table.set_where(column, &reference[i].to_string(), |row| {
                pinned.contains(&chips[row])
            });
            debug!(threshold = %kind, value = first[i], reference = reference[i], "fixed threshold applied");
        }
        info!(reference_chips = self.reference.len(), "fixed thresholds applied");
    }

    /// Set one threshold on every non-reference chip.
    pub fn set_threshold(&mut self, value: u32, kind: ThresholdKind) {
        let chips = &self.chips;
        let pinned = &self.reference;
        let column = self.columns[kind as usize];
        self.table.set_where(column, &value.to_string(), |row| {
            !pinned.contains(&chips[row])
        });
        debug!(threshold = %kind, value, "threshold set");
    }

    /// Threshold values of every row belonging to `chip`, parsed.
    pub fn thresholds(&self, chip: u32, kind: ThresholdKind) -> Vec<u32> {
        let column = self.columns[kind as usize];
        self.chips
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == chip)
            .filter_map(|(row, _)| self.table.cell(row, column)?.trim().parse().ok())
            .collect()
    }

    /// Back up and rewrite the table file.
    pub fn persist(&self) -> ScanResult<()> {
        self.table.persist()
    }

    /// Underlying table.
    pub fn table(&self) -> &TsvTable {
        &self.table
    }
}
