//! Bias map: which bias channels feed which front-end port.
//!
//! The map is a semicolon-separated file shipped with the readout hardware.
//! Line one names the two front-end board types, line two names the three bias
//! board DAC columns (positions 5..7), and every following line maps one
//! connector row:
//!
//! ```text
//! port1k;_;port8k;_;slotID;DAC_64P;DAC_16P;DAC_32P
//! ```
//!
//! `port1k` may be `n/a` when the FEB/D-1k has no matching port.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use scan_core::{ScanError, ScanResult};
use tracing::debug;

use crate::config::ScanConfig;
use crate::settings::ChannelKey;

/// Parsed bias map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BiasMap {
    entries: BTreeMap<(String, String), BTreeMap<u32, BTreeSet<ChannelKey>>>,
}

impl BiasMap {
    /// Channels feeding `port` for a board combination.
    pub fn channels(&self, febd: &str, bias_board: &str, port: u32) -> Option<&BTreeSet<ChannelKey>> {
        self.entries
            .get(&(febd.to_string(), bias_board.to_string()))?
            .get(&port)
    }

    /// Ports known for a board combination.
    pub fn ports(&self, febd: &str, bias_board: &str) -> Vec<u32> {
        self.entries
            .get(&(febd.to_string(), bias_board.to_string()))
            .map(|ports| ports.keys().copied().collect())
            .unwrap_or_default()
    }

    fn insert(&mut self, febd: &str, bias_board: &str, port: u32, key: ChannelKey) {
        self.entries
            .entry((febd.to_string(), bias_board.to_string()))
            .or_default()
            .entry(port)
            .or_default()
            .insert(key);
    }
}

/// The pinned rows of both settings tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceSet {
    /// Bias channels of the reference detector
    pub bias: BTreeSet<ChannelKey>,
    /// ASICs of the reference detector
    pub chips: BTreeSet<u32>,
}

/// Read and parse a bias map file.
pub fn read_bias_map(path: impl AsRef<Path>) -> ScanResult<BiasMap> {
    let path = path.as_ref();
    let error = |message: String| ScanError::SettingsLoad {
        path: path.to_path_buf(),
        message,
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| error(e.to_string()))?;
    let mut records = reader.records();
    let mut next_record = |what: &str| -> ScanResult<csv::StringRecord> {
        records
            .next()
            .ok_or_else(|| error(format!("missing {what} line")))?
            .map_err(|e| error(e.to_string()))
    };

    let febd_line = next_record("board name")?;
    let (febd1k, febd8k) = match (febd_line.get(0), febd_line.get(1)) {
        (Some(a), Some(b)) => (a.trim().to_string(), b.trim().to_string()),
        _ => return Err(error("board name line needs two fields".to_string())),
    };

    let dac_line = next_record("bias board")?;
    let boards: Vec<String> = (5..8)
        .map(|i| dac_line.get(i).map(|s| s.trim().to_string()))
        .collect::<Option<_>>()
        .ok_or_else(|| error("bias board line needs eight fields".to_string()))?;

    let mut map = BiasMap::default();
    let mut line_no = 2;
    for record in records {
        line_no += 1;
        let record = record.map_err(|e| error(e.to_string()))?;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let field = |i: usize| -> ScanResult<u32> {
            let text = record.get(i).unwrap_or_default().trim();
            text.parse()
                .map_err(|_| error(format!("line {line_no}: field {} ('{text}') is not an integer", i + 1)))
        };

        let port8k = field(2)?;
        let slot = field(4)?;
        let dacs = [field(5)?, field(6)?, field(7)?];
        let port1k = match record.get(0).map(str::trim) {
            Some("n/a") => None,
            _ => Some(field(0)?),
        };

        for (board, dac) in boards.iter().zip(dacs) {
            let key = ChannelKey::new(slot, dac);
            if let Some(port) = port1k {
                map.insert(&febd1k, board, port, key);
            }
            map.insert(&febd8k, board, port8k, key);
        }
    }

    debug!(path = %path.display(), rows = line_no - 2, "bias map loaded");
    Ok(map)
}

/// Resolve the reference detector's bias channels and chips.
///
/// Empty when `ref_det_febd` is -1.
pub fn reference_channels(config: &ScanConfig, map: &BiasMap) -> ScanResult<ReferenceSet> {
    let Ok(port) = u32::try_from(config.ref_det_febd) else {
        return Ok(ReferenceSet::default());
    };

    let febd = config.febd.to_string();
    let board = config.bias_board.to_string();
    let bias = map
        .channels(&febd, &board, port)
        .cloned()
        .ok_or_else(|| {
            ScanError::Configuration(format!(
                "bias map {} has no port {port} for {febd}/{board}",
                config.bias_file.display()
            ))
        })?;

    let per_port = config.fem.chips_per_port();
    let chips = [port * per_port, port * per_port + 1].into_iter().collect();

    Ok(ReferenceSet { bias, chips })
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::{Format, Yaml};
    use figment::Figment;
    use std::fs;
    use std::path::PathBuf;

    const MAP: &str = "FEBD1k;FEBD8k;\n\
port1k;;port8k;;slot;BIAS_64P;BIAS_16P;BIAS_32P\n\
0;;0;;2;5;1;3\n\
0;;0;;2;5;1;3\n\
n/a;;1;;2;6;2;4\n\
1;;1;;3;7;3;5\n";

    fn write_map() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bias_map.csv");
        fs::write(&path, MAP).unwrap();
        (dir, path)
    }

    #[test]
    fn test_read_bias_map() {
        let (_dir, path) = write_map();
        let map = read_bias_map(&path).unwrap();

        let port0 = map.channels("FEBD8k", "BIAS_64P", 0).unwrap();
        assert_eq!(port0.len(), 1, "duplicate rows collapse");
        assert!(port0.contains(&ChannelKey::new(2, 5)));

        let port1 = map.channels("FEBD8k", "BIAS_16P", 1).unwrap();
        assert_eq!(
            port1.iter().copied().collect::<Vec<_>>(),
            vec![ChannelKey::new(2, 2), ChannelKey::new(3, 3)]
        );

        // the n/a row is absent from the 1k mapping
        let port1_1k = map.channels("FEBD1k", "BIAS_16P", 1).unwrap();
        assert_eq!(port1_1k.len(), 1);
        assert_eq!(map.ports("FEBD1k", "BIAS_32P"), vec![0, 1]);
    }

    #[test]
    fn test_bad_field_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bias_map.csv");
        fs::write(&path, "FEBD1k;FEBD8k;\na;b;c;d;e;F;G;H\n0;;x;;2;5;1;3\n").unwrap();

        let err = read_bias_map(&path).unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }

    fn config(fem: &str, port: i32) -> ScanConfig {
        let yaml = format!(
            r#"
config_directory: cfg
petsys_directory: petsys
out_directory: out
out_name: run
bias_file: bias_map.csv
FEM: {fem}
FEBD: FEBD8k
BIAS_board: BIAS_16P
ref_det_febd: {port}
ref_det_volt: [20.0, 38.5, 4.0]
ref_det_ths: [20, 20, 15]
mode: qdc
time: 1.0
data_type: coincidence
data_format: binary
prebreak_voltage: 20.0
break_voltage: 38.0
over_voltage: [3.0]
vth_t1: [10]
vth_t2: [15]
vth_e: [10]
"#
        );
        Figment::from(Yaml::string(&yaml)).extract().unwrap()
    }

    #[test]
    fn test_reference_channels() {
        let (_dir, path) = write_map();
        let map = read_bias_map(&path).unwrap();

        let set = reference_channels(&config("FEM256", 1), &map).unwrap();
        assert_eq!(set.chips, BTreeSet::from([4, 5]));
        assert!(set.bias.contains(&ChannelKey::new(3, 3)));

        let set = reference_channels(&config("FEM128", 1), &map).unwrap();
        assert_eq!(set.chips, BTreeSet::from([2, 3]));
    }

    #[test]
    fn test_no_reference_detector() {
        let (_dir, path) = write_map();
        let map = read_bias_map(&path).unwrap();

        let set = reference_channels(&config("FEM128", -1), &map).unwrap();
        assert_eq!(set, ReferenceSet::default());

        let err = reference_channels(&config("FEM128", 7), &map).unwrap_err();
        assert!(matches!(err, ScanError::Configuration(_)));
    }
}
