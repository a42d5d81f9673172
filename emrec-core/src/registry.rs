//! Known datasets.
//!
//! Datasets are looked up by a forgiving name match so `FER-2013` and `fer2013`
//! resolve to the same entry.

use crate::dataset::DatasetConfig;
use crate::error::DatasetError;

/// A named dataset the pipeline knows how to prepare.
#[derive(Debug, Clone, Copy)]
pub struct DatasetEntry {
    /// Name used on the command line and in artifact file names.
    pub name: &'static str,
    /// Short description for tooling.
    pub description: &'static str,
    /// Where the raw table can be obtained.
    pub source_url: &'static str,
    config: fn() -> DatasetConfig,
}

impl DatasetEntry {
    pub const fn new(
        name: &'static str,
        description: &'static str,
        source_url: &'static str,
        config: fn() -> DatasetConfig,
    ) -> Self {
        Self {
            name,
            description,
            source_url,
            config,
        }
    }

    pub fn config(&self) -> DatasetConfig {
        (self.config)()
    }
}

static DATASETS: [DatasetEntry; 1] = [DatasetEntry::new(
    "fer2013",
    "48x48 grayscale faces labelled with seven emotions (Training/PublicTest/PrivateTest)",
    "https://www.kaggle.com/datasets/deadskull7/fer2013",
    DatasetConfig::fer2013,
)];

pub fn registered_datasets() -> &'static [DatasetEntry] {
    &DATASETS
}

/// Find a dataset entry by name (case and punctuation insensitive).
pub fn dataset_entry(name: &str) -> Option<&'static DatasetEntry> {
    let lookup_key = normalize_name(name);
    registered_datasets()
        .iter()
        .find(|entry| normalize_name(entry.name) == lookup_key)
}

/// Resolve a dataset name to its configuration.
pub fn dataset_by_name(name: &str) -> Result<DatasetConfig, DatasetError> {
    dataset_entry(name)
        .map(DatasetEntry::config)
        .ok_or_else(|| DatasetError::UnknownDataset(name.to_string()))
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}
