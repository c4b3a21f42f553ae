use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::LinkResult;
use crate::telemetry::{local_time, LastGoodTelemetry, TelemetrySample};

pub const CSV_HEADERS: [&str; 8] = [
    "datetime_local",
    "ts",
    "uuid",
    "temperature_c",
    "humidity",
    "methane_ppm",
    "ammonia_ppm",
    "alcohol_ppm",
];

/// Recorder state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingState {
    /// Not appending; the buffer is kept
    Stopped,
    Recording,
}

/// One exported row, holding the smoothed values at arrival time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedRow {
    pub local_datetime: String,
    pub ts: f64,
    pub uuid: String,
    pub temperature_c: Option<f64>,
    pub humidity: Option<f64>,
    pub methane_ppm: Option<f64>,
    pub ammonia_ppm: Option<f64>,
    pub alcohol_ppm: Option<f64>,
}

/// Deduplicating telemetry recorder.
///
/// `last_recorded_ts` deliberately outlives pause/resume and connection sessions.
pub struct SampleRecorder {
    state: RecordingState,
    rows: Vec<RecordedRow>,
    last_recorded_ts: Option<f64>,
}

impl SampleRecorder {
    pub fn new() -> Self {
        SampleRecorder {
            state: RecordingState::Stopped,
            rows: Vec::new(),
            last_recorded_ts: None,
        }
    }

    /// Stopped → Recording, Recording → Stopped
    pub fn toggle(&mut self) -> RecordingState {
        self.state = match self.state {
            RecordingState::Stopped => RecordingState::Recording,
            RecordingState::Recording => RecordingState::Stopped,
        };
        self.state
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecordingState::Recording
    }

    /// Offer one sample. Returns true when a row was appended.
    pub fn on_sample(
        &mut self,
        sample: &TelemetrySample,
        smoothed: &LastGoodTelemetry,
        fallback_uuid: &str,
        now: DateTime<Local>,
    ) -> bool {
        if !self.is_recording() {
            return false;
        }

        let ts = sample
            .logical_ts()
            .unwrap_or_else(|| now.timestamp() as f64);
        if self.last_recorded_ts == Some(ts) {
            return false;
        }
        self.last_recorded_ts = Some(ts);

        let local_datetime = local_time(ts)
            .unwrap_or(now)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();

        self.rows.push(RecordedRow {
            local_datetime,
            ts,
            uuid: sample
                .uuid
                .clone()
                .unwrap_or_else(|| fallback_uuid.to_string()),
            temperature_c: smoothed.temperature_c,
            humidity: smoothed.humidity,
            methane_ppm: smoothed.methane_ppm,
            ammonia_ppm: smoothed.ammonia_ppm,
            alcohol_ppm: smoothed.alcohol_ppm,
        });
        true
    }

    pub fn rows(&self) -> &[RecordedRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn last_recorded_ts(&self) -> Option<f64> {
        self.last_recorded_ts
    }

    /// Explicit user action; the dedup key is left alone.
    pub fn clear(&mut self) {
        self.rows.clear();
    }

    pub fn status_text(&self) -> String {
        match self.state {
            RecordingState::Recording => format!("Recording ({} rows)", self.rows.len()),
            RecordingState::Stopped => "Not recording".to_string(),
        }
    }

    /// Render all rows as CSV with a header line.
    pub fn to_csv(&self) -> LinkResult<String> {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer.write_record(CSV_HEADERS)?;
        for row in &self.rows {
            writer.write_record([
                row.local_datetime.clone(),
                row.ts.to_string(),
                row.uuid.clone(),
                csv_number(row.temperature_c),
                csv_number(row.humidity),
                csv_number(row.methane_ppm),
                csv_number(row.ammonia_ppm),
                csv_number(row.alcohol_ppm),
            ])?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| crate::error::LinkError::Export(e.to_string()))?;
        let mut text = String::from_utf8(bytes)
            .map_err(|e| crate::error::LinkError::Export(e.to_string()))?;
        // No trailing newline after the last row
        if text.ends_with('\n') {
            text.pop();
        }
        Ok(text)
    }

    /// Write `telemetry_<timestamp>.csv` into `dir`. Nothing is written without rows.
    pub fn write_csv(&self, dir: &Path, now: DateTime<Local>) -> LinkResult<Option<PathBuf>> {
        if self.rows.is_empty() {
            return Ok(None);
        }
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "telemetry_{}.csv",
            now.format("%Y-%m-%d_%H-%M-%S")
        ));
        fs::write(&path, self.to_csv()?)?;
        Ok(Some(path))
    }
}

impl Default for SampleRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn csv_number(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
