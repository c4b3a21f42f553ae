use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Text slots the presentation layer exposes to the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Element {
    Status,
    Temperature,
    Humidity,
    Methane,
    Ammonia,
    Alcohol,
    LastUpdate,
    RecordingStatus,
    CommandLog,
    Speed,
}

/// Setter hook into whatever renders the view
pub trait Presenter {
    fn set_text(&mut self, element: Element, value: &str);
}

/// Snapshot of everything on screen, saved as JSON for external viewers
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub status: String,
    pub temperature: String,
    pub humidity: String,
    pub methane: String,
    pub ammonia: String,
    pub alcohol: String,
    pub last_update: String,
    pub recording_status: String,
    pub speed: String,
    pub command_log: Vec<String>,
}

impl LiveStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            status: "Status: idle".to_string(),
            temperature: "--".to_string(),
            humidity: "--".to_string(),
            methane: "--".to_string(),
            ammonia: "--".to_string(),
            alcohol: "--".to_string(),
            last_update: String::new(),
            recording_status: "Not recording".to_string(),
            speed: String::new(),
            command_log: Vec::new(),
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// `Presenter` backed by a `LiveStatus` snapshot
#[derive(Debug, Default)]
pub struct StatusBoard {
    status: LiveStatus,
    dirty: bool,
}

impl StatusBoard {
    pub fn new() -> Self {
        StatusBoard {
            status: LiveStatus::new(),
            dirty: true,
        }
    }

    pub fn snapshot(&self) -> &LiveStatus {
        &self.status
    }

    /// Write the snapshot if anything changed since the last save
    pub fn flush(&mut self, path: &Path) -> std::io::Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        self.status.timestamp = current_timestamp();
        self.status.save(path)?;
        self.dirty = false;
        Ok(true)
    }
}

impl Presenter for StatusBoard {
    fn set_text(&mut self, element: Element, value: &str) {
        let slot = match element {
            Element::Status => {
                let line = format!("Status: {}", value);
                if self.status.status != line {
                    log::info!("[status] {}", value);
                }
                self.status.status = line;
                self.dirty = true;
                return;
            }
            Element::CommandLog => {
                self.status.command_log = value.lines().map(str::to_string).collect();
                self.dirty = true;
                return;
            }
            Element::Temperature => &mut self.status.temperature,
            Element::Humidity => &mut self.status.humidity,
            Element::Methane => &mut self.status.methane,
            Element::Ammonia => &mut self.status.ammonia,
            Element::Alcohol => &mut self.status.alcohol,
            Element::LastUpdate => &mut self.status.last_update,
            Element::RecordingStatus => &mut self.status.recording_status,
            Element::Speed => &mut self.status.speed,
        };
        if slot.as_str() != value {
            *slot = value.to_string();
            self.dirty = true;
        }
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
