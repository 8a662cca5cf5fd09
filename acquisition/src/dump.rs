//! CSV export of composed cycles for inspection.

use std::io;
use std::path::Path;

use shared::{OutputRow, WaveformMatrix};
use strum::IntoEnumIterator;

/// Write `waveform` as CSV: a time column in seconds followed by one column
/// per output row, one line per sample.
pub fn write_csv<W: io::Write>(
    waveform: &WaveformMatrix,
    sample_rate: f64,
    writer: W,
) -> csv::Result<()> {
    let mut csv = csv::Writer::from_writer(writer);

    let mut header = vec!["time_s".to_string()];
    header.extend(OutputRow::iter().map(|row| row.to_string()));
    csv.write_record(&header)?;

    let samples = waveform.samples();
    for (i, column) in samples.columns().into_iter().enumerate() {
        let mut record = Vec::with_capacity(column.len() + 1);
        record.push(format!("{:.6}", i as f64 / sample_rate));
        record.extend(column.iter().map(|v| format!("{v:.6}")));
        csv.write_record(&record)?;
    }

    csv.flush()?;
    Ok(())
}

/// Write `waveform` to a CSV file at `path`.
pub fn write_csv_file(waveform: &WaveformMatrix, sample_rate: f64, path: &Path) -> csv::Result<()> {
    let file = std::fs::File::create(path)?;
    write_csv(waveform, sample_rate, file)
}
