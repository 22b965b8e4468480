//! JSON-lines snapshots of stream records, one record per line.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::model::StreamRecord;

pub fn save_streams(records: &[StreamRecord], path: &Path) -> Result<()> {
    log::info!(
        "Saving {} stream records to {}",
        records.len(),
        path.display()
    );
    let file = File::create(path)
        .with_context(|| format!("Failed to create snapshot {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut writer, record).context("Failed to encode stream record")?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn load_streams(path: &Path) -> Result<Vec<StreamRecord>> {
    log::info!("Loading stream records from {}", path.display());
    let file =
        File::open(path).with_context(|| format!("Failed to open snapshot {}", path.display()))?;

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: StreamRecord = serde_json::from_str(&line)
            .with_context(|| format!("Malformed record on line {}", index + 1))?;
        records.push(record);
    }
    log::info!("Loaded {} stream records from {}", records.len(), path.display());
    Ok(records)
}
