//! Reading raw dataset tables.

use std::{fs::File, io::Read, path::Path};

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Deserialize;

use crate::record::{RawRecord, SplitTag};

#[derive(Debug, Deserialize)]
struct RawRow {
    emotion: usize,
    pixels: String,
    #[serde(rename = "Usage")]
    usage: String,
}

/// Rows read from a raw table.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    pub records: Vec<RawRecord>,
    /// Rows whose split tag is not one of the known partitions.
    pub ignored: usize,
}

/// Read an `emotion,pixels,Usage` table from any reader.
pub fn read_records<R: Read>(reader: R) -> Result<RawTable> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Fields)
        .from_reader(reader);

    let mut table = RawTable::default();
    for (index, row) in csv.deserialize::<RawRow>().enumerate() {
        // header is line 1
        let row = row.with_context(|| format!("malformed raw row at line {}", index + 2))?;
        match row.usage.parse::<SplitTag>() {
            Ok(usage) => table.records.push(RawRecord {
                emotion: row.emotion,
                pixels: row.pixels,
                usage,
            }),
            Err(reason) => {
                debug!("ignoring raw row at line {}: {reason}", index + 2);
                table.ignored += 1;
            }
        }
    }

    if table.ignored > 0 {
        warn!(
            "{} raw row(s) carried an unknown split tag and were ignored",
            table.ignored
        );
    }
    Ok(table)
}

/// Read a raw table from disk.
pub fn read_records_from_path<P: AsRef<Path>>(path: P) -> Result<RawTable> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("failed to open raw dataset {}", path.display()))?;
    read_records(file).with_context(|| format!("failed to read raw dataset {}", path.display()))
}
