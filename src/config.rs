use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::LinkResult;

pub const DEFAULT_ROBOT_ID: &str = "detectionbot";
pub const DEFAULT_CLIENT_ID: &str = "web-control";

/// Persisted client configuration. Only the remote base address survives restarts.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub server_url: Option<String>,
}

impl ClientConfig {
    /// Load from a JSON file. A missing file yields the default (no server).
    pub fn load(path: &Path) -> LinkResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> LinkResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// A CLI-provided server wins over the stored one; blank values count as unset.
    pub fn with_override(mut self, server: Option<String>) -> Self {
        if let Some(server) = server.filter(|s| !s.trim().is_empty()) {
            self.server_url = Some(server);
        }
        self
    }
}

/// Runtime tunables handed to the session controller.
#[derive(Clone, Debug)]
pub struct LinkSettings {
    pub server_url: Option<String>,
    pub robot_id: String,
    pub client_id: String,
    /// Pull the video stream over HTTP multipart instead of the websocket.
    pub video_pull: bool,
    /// Pull the thermal stream over HTTP multipart instead of the websocket.
    pub thermal_pull: bool,
    pub silence_threshold: Duration,
    pub check_interval: Duration,
    pub command_log_capacity: usize,
}

impl LinkSettings {
    pub fn new(server_url: Option<String>) -> Self {
        LinkSettings {
            server_url,
            robot_id: DEFAULT_ROBOT_ID.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            video_pull: false,
            thermal_pull: false,
            silence_threshold: Duration::from_millis(10_000),
            check_interval: Duration::from_millis(2_000),
            command_log_capacity: 200,
        }
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self::new(None)
    }
}
