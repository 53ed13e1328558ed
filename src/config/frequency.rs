//! Frequency file - the campaign-wide input frequency axis

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Column holding the input frequencies in the tab-separated frequency file.
pub const FREQUENCY_COLUMN: &str = "MINIS_FREQ";

/// Ordered input frequencies (Hz). Each point is swept independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencySet {
    values: Vec<f64>,
}

impl FrequencySet {
    /// Create a frequency set, validating every value.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the set is empty or a value is negative or
    /// not finite.
    pub fn new(values: Vec<f64>) -> Result<Self> {
        if values.is_empty() {
            return Err(Error::Config("frequency set is empty".to_string()));
        }
        if let Some(bad) = values.iter().find(|f| !f.is_finite() || **f < 0.0) {
            return Err(Error::Config(format!(
                "input frequencies must be finite and non-negative, got {bad}"
            )));
        }
        Ok(Self { values })
    }

    /// Load a tab-separated frequency file with a `MINIS_FREQ` column.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file is missing, lacks the column or
    /// holds a value that is not a number.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| Error::Config(format!("cannot read frequency file {}: {e}", path.display())))?;

        let column = reader
            .headers()?
            .iter()
            .position(|h| h == FREQUENCY_COLUMN)
            .ok_or_else(|| {
                Error::Config(format!(
                    "frequency file {} has no `{FREQUENCY_COLUMN}` column",
                    path.display()
                ))
            })?;

        let mut values = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let raw = record.get(column).unwrap_or_default();
            let value = raw.parse::<f64>().map_err(|e| {
                Error::Config(format!(
                    "{}: row {}: `{raw}` is not a frequency: {e}",
                    path.display(),
                    line + 1
                ))
            })?;
            values.push(value);
        }

        Self::new(values)
    }

    /// Frequencies in file order.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Number of frequency points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Always false for a validated set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
