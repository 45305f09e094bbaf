use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_start_delimiter")]
    pub start_delimiter: String,
    #[serde(default = "default_end_delimiter")]
    pub end_delimiter: String,
    /// Display policy: hide a trigger once its slot holds a result, otherwise reset its label.
    #[serde(default = "default_true")]
    pub hide_trigger_on_success: bool,
    #[serde(default = "default_trigger_label")]
    pub trigger_label: String,
    #[serde(default = "default_busy_label")]
    pub busy_label: String,
    #[serde(default = "default_auto_mode_window_ms")]
    pub auto_mode_window_ms: u64,
    #[serde(default)]
    pub batch_interval_ms: u64,
    #[serde(default = "default_fingerprint_width")]
    pub fingerprint_width: usize,
    #[serde(default = "default_true")]
    pub record_saved_tags: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            start_delimiter: default_start_delimiter(),
            end_delimiter: default_end_delimiter(),
            hide_trigger_on_success: true,
            trigger_label: default_trigger_label(),
            busy_label: default_busy_label(),
            auto_mode_window_ms: default_auto_mode_window_ms(),
            batch_interval_ms: 0,
            fingerprint_width: default_fingerprint_width(),
            record_saved_tags: true,
        }
    }
}

impl EngineConfig {
    /// Missing file means defaults. A file that exists but does not parse is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn with_delimiters(mut self, start: &str, end: &str) -> Self {
        self.start_delimiter = start.to_string();
        self.end_delimiter = end.to_string();
        self
    }
}

fn default_start_delimiter() -> String {
    "<<".to_string()
}

fn default_end_delimiter() -> String {
    ">>".to_string()
}

fn default_true() -> bool {
    true
}

fn default_trigger_label() -> String {
    "Generate".to_string()
}

fn default_busy_label() -> String {
    "Generating...".to_string()
}

fn default_auto_mode_window_ms() -> u64 {
    5000
}

fn default_fingerprint_width() -> usize {
    20
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;

    #[test]
    fn missing_file_yields_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let config = EngineConfig::load(&temp.path().join("nope.json"))?;
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.start_delimiter, "<<");
        assert_eq!(config.fingerprint_width, 20);
        Ok(())
    }

    #[test]
    fn partial_file_fills_remaining_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"start_delimiter": "[pic ", "end_delimiter": "]", "hide_trigger_on_success": false}"#,
        )?;
        let config = EngineConfig::load(&path)?;
        assert_eq!(config.start_delimiter, "[pic ");
        assert_eq!(config.end_delimiter, "]");
        assert!(!config.hide_trigger_on_success);
        assert_eq!(config.trigger_label, "Generate");
        assert!(config.record_saved_tags);
        Ok(())
    }

    #[test]
    fn malformed_file_is_an_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{not json")?;
        assert!(EngineConfig::load(&path).is_err());
        Ok(())
    }
}
