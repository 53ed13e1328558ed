//! Job config - one (cell type, synapse class) experiment description

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::{Error, Result};

const FILE_PREFIX: &str = "config_";
const FILE_SUFFIX: &str = ".yaml";

/// Synapse class whose spontaneous minis are simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SynapseClass {
    /// Excitatory minis (inward, negative clamp current)
    Exc,
    /// Inhibitory minis
    Inh,
}

impl SynapseClass {
    /// Label used in file names and task identifiers.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Exc => "Exc",
            Self::Inh => "Inh",
        }
    }

    /// Factor that turns this class's events into positive deflections.
    #[must_use]
    pub const fn polarity(&self) -> f64 {
        match self {
            Self::Exc => -1.0,
            Self::Inh => 1.0,
        }
    }
}

impl FromStr for SynapseClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Exc" => Ok(Self::Exc),
            "Inh" => Ok(Self::Inh),
            other => Err(Error::Config(format!(
                "unrecognized synapse class `{other}`, expected `Exc` or `Inh`"
            ))),
        }
    }
}

impl fmt::Display for SynapseClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mean and standard deviation of a published measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeanStd {
    /// Mean
    pub mean: f64,
    /// Standard deviation
    pub std: f64,
}

/// Reference statistics from the source article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceStats {
    /// Minis frequency (Hz)
    pub frequency: MeanStd,
    /// Minis amplitude (pA), when published
    #[serde(default)]
    pub amplitude: Option<MeanStd>,
    /// Number of recorded cells
    #[serde(default)]
    pub n: Option<u32>,
}

/// Recording protocol handed to the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    /// Simulated duration (ms)
    pub t_stop: f64,
    /// Recording interval (ms)
    pub record_dt: f64,
    /// Integration step (ms)
    #[serde(default)]
    pub dt: Option<f64>,
    /// Voltage clamp holding level (mV); no clamp when absent
    #[serde(default, rename = "hold_V")]
    pub hold_v: Option<f64>,
    /// Block sodium channels
    #[serde(default)]
    pub enable_ttx: bool,
    /// Extracellular calcium concentration (mM)
    pub calcium: f64,
    /// Initial simulated time that is skipped (ms)
    #[serde(default)]
    pub forward_skip: Option<f64>,
}

/// Peak detection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysisParams {
    /// Minimum baseline-subtracted peak height (pA)
    pub peak_min_height: f64,
}

/// Campaign-wide overrides applied on load.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Overrides {
    /// Replaces `protocol.t_stop`
    pub duration: Option<f64>,
    /// Replaces `protocol.forward_skip`
    pub forward_skip: Option<f64>,
}

#[derive(Deserialize)]
struct JobConfigDoc {
    #[serde(default)]
    cells: Value,
    protocol: Protocol,
    results: ReferenceStats,
    analysis: AnalysisParams,
}

/// Job config for one (cell type, synapse class) pair.
///
/// The pair comes from the file name, `config_<CELL_TYPE>_<SYN>.yaml`. The
/// synapse label is kept verbatim so that the matrix builder can reject
/// unrecognized classes with a proper error.
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    path: PathBuf,
    cell_type: String,
    synapse: String,
    cells: Value,
    protocol: Protocol,
    reference: ReferenceStats,
    analysis: AnalysisParams,
    raw: Value,
}

/// Split a job config file name into (cell type, synapse label).
///
/// Returns `None` unless the name looks like `config_<CELL_TYPE>_<SYN>.yaml`.
#[must_use]
pub fn parse_job_config_filename(file_name: &str) -> Option<(String, String)> {
    let stem = file_name
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?;
    let (cell_type, synapse) = stem.rsplit_once('_')?;
    let is_word = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_');
    (is_word(cell_type) && is_word(synapse)).then(|| (cell_type.to_string(), synapse.to_string()))
}

impl JobConfig {
    /// Load a job config file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file name does not follow the
    /// `config_<CELL_TYPE>_<SYN>.yaml` pattern or the document misses a
    /// required field.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read job config {}: {e}", path.display())))?;
        Self::from_yaml_str(path, &text)
    }

    /// Parse a job config from YAML text; `path` provides the name.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on a bad file name or document.
    pub fn from_yaml_str<P: AsRef<Path>>(path: P, text: &str) -> Result<Self> {
        let path = path.as_ref();
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let (cell_type, synapse) = parse_job_config_filename(file_name).ok_or_else(|| {
            Error::Config(format!(
                "{file_name} must be named as \"config_<CELL_TYPE>_<SYN_TYPE>.yaml\""
            ))
        })?;

        let raw: Value = serde_yaml::from_str(text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let doc: JobConfigDoc = serde_yaml::from_value(raw.clone())
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;

        if !(doc.analysis.peak_min_height.is_finite() && doc.analysis.peak_min_height > 0.0) {
            return Err(Error::Config(format!(
                "{}: analysis.peak_min_height must be positive",
                path.display()
            )));
        }
        if !(doc.protocol.record_dt > 0.0 && doc.protocol.t_stop > 0.0) {
            return Err(Error::Config(format!(
                "{}: protocol.t_stop and protocol.record_dt must be positive",
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            cell_type,
            synapse,
            cells: doc.cells,
            protocol: doc.protocol,
            reference: doc.results,
            analysis: doc.analysis,
            raw,
        })
    }

    /// Apply campaign-wide overrides, keeping the raw document in sync.
    #[must_use]
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(duration) = overrides.duration {
            self.protocol.t_stop = duration;
            self.set_protocol_key("t_stop", duration);
        }
        if let Some(forward_skip) = overrides.forward_skip {
            self.protocol.forward_skip = Some(forward_skip);
            self.set_protocol_key("forward_skip", forward_skip);
        }
        self
    }

    fn set_protocol_key(&mut self, key: &str, value: f64) {
        if let Some(protocol) = self
            .raw
            .as_mapping_mut()
            .and_then(|m| m.get_mut("protocol"))
            .and_then(Value::as_mapping_mut)
        {
            protocol.insert(Value::from(key), Value::from(value));
        }
    }

    /// Source file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the source file.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{FILE_PREFIX}{}{FILE_SUFFIX}", self.title())
    }

    /// Cell type part of the file name.
    #[must_use]
    pub fn cell_type(&self) -> &str {
        &self.cell_type
    }

    /// Synapse label as written in the file name.
    #[must_use]
    pub fn synapse_label(&self) -> &str {
        &self.synapse
    }

    /// Recognized synapse class.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the label is neither `Exc` nor `Inh`.
    pub fn synapse_class(&self) -> Result<SynapseClass> {
        self.synapse.parse().map_err(|_| {
            Error::Config(format!(
                "{} must be named as \"config_<CELL_TYPE>_<SYN_TYPE>.yaml\" where SYN_TYPE \
                 is either \"Exc\" or \"Inh\"",
                self.path.display()
            ))
        })
    }

    /// `<CELL_TYPE>_<SYN>`, the pathway name and the output sub-directory.
    #[must_use]
    pub fn title(&self) -> String {
        format!("{}_{}", self.cell_type, self.synapse)
    }

    /// Cell selection, passed through to the simulator.
    #[must_use]
    pub const fn cells(&self) -> &Value {
        &self.cells
    }

    /// Recording protocol.
    #[must_use]
    pub const fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Published reference statistics.
    #[must_use]
    pub const fn reference(&self) -> &ReferenceStats {
        &self.reference
    }

    /// Peak detection parameters.
    #[must_use]
    pub const fn analysis(&self) -> &AnalysisParams {
        &self.analysis
    }

    /// The document with a `minis_frequency` entry added.
    ///
    /// # Errors
    ///
    /// Returns error if the document cannot be serialized.
    pub fn calibrated_yaml(&self, minis_frequency: f64) -> Result<String> {
        let mut raw = self.raw.clone();
        if let Some(map) = raw.as_mapping_mut() {
            map.insert(Value::from("minis_frequency"), Value::from(minis_frequency));
        }
        Ok(serde_yaml::to_string(&raw)?)
    }
}

/// Load every `config_*.yaml` in `dir`, sorted by file name.
///
/// # Errors
///
/// Returns `Error::Config` if the directory holds no job config or one of them
/// fails to parse.
pub fn load_job_configs<P: AsRef<Path>>(dir: P, overrides: Overrides) -> Result<Vec<JobConfig>> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::Config(format!("cannot read job configs dir {}: {e}", dir.display())))?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX) {
            paths.push(path);
        }
    }
    paths.sort();

    if paths.is_empty() {
        return Err(Error::Config(format!(
            "No job configs at {}. Config files must follow the pattern: \
             \"config_<CELL_TYPE>_<SYN_MINIS>.yaml\"",
            dir.display()
        )));
    }

    paths
        .iter()
        .map(|p| JobConfig::load(p).map(|c| c.with_overrides(overrides)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fixtures::SAMPLE_JOB_CONFIG as SAMPLE;

    #[test]
    fn test_parse_filename() {
        assert_eq!(
            parse_job_config_filename("config_L5_TPC_Exc.yaml"),
            Some(("L5_TPC".to_string(), "Exc".to_string()))
        );
        assert_eq!(
            parse_job_config_filename("config_PC_Gaba.yaml"),
            Some(("PC".to_string(), "Gaba".to_string()))
        );
        assert_eq!(parse_job_config_filename("PC_Exc.yaml"), None);
        assert_eq!(parse_job_config_filename("config_PC.yaml"), None);
        assert_eq!(parse_job_config_filename("config_PC_Exc.yml"), None);
    }

    #[test]
    fn test_from_yaml_str() {
        let config = JobConfig::from_yaml_str("config_L5_TPC_Exc.yaml", SAMPLE).unwrap();
        assert_eq!(config.title(), "L5_TPC_Exc");
        assert_eq!(config.synapse_class().unwrap(), SynapseClass::Exc);
        assert_eq!(config.protocol().hold_v, Some(-70.0));
        assert!(config.protocol().enable_ttx);
        assert!((config.analysis().peak_min_height - 4.5).abs() < f64::EPSILON);
        assert_eq!(config.reference().n, Some(12));
        assert_eq!(config.reference().amplitude.map(|a| a.mean), Some(10.7));
    }

    #[test]
    fn test_unrecognized_synapse_class() {
        let config = JobConfig::from_yaml_str("config_PC_Gaba.yaml", SAMPLE).unwrap();
        assert!(matches!(config.synapse_class(), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_section_is_config_error() {
        let err = JobConfig::from_yaml_str("config_PC_Exc.yaml", "protocol: {}").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_overrides_update_raw_document() {
        let config = JobConfig::from_yaml_str("config_PC_Exc.yaml", SAMPLE)
            .unwrap()
            .with_overrides(Overrides {
                duration: Some(2000.0),
                forward_skip: Some(5000.0),
            });
        assert!((config.protocol().t_stop - 2000.0).abs() < f64::EPSILON);
        assert_eq!(config.protocol().forward_skip, Some(5000.0));

        let yaml = config.calibrated_yaml(0.42).unwrap();
        assert!(yaml.contains("minis_frequency: 0.42"));
        assert!(yaml.contains("t_stop: 2000"));
        assert!(yaml.contains("forward_skip: 5000"));
    }

    #[test]
    fn test_load_dir_requires_configs() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_job_configs(dir.path(), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("No job configs"));
    }

    #[test]
    fn test_load_dir_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config_PC_Inh.yaml"), SAMPLE).unwrap();
        std::fs::write(dir.path().join("config_PC_Exc.yaml"), SAMPLE).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let configs = load_job_configs(dir.path(), Overrides::default()).unwrap();
        let titles: Vec<_> = configs.iter().map(JobConfig::title).collect();
        assert_eq!(titles, vec!["PC_Exc", "PC_Inh"]);
    }
}
