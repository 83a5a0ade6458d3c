//! Replication configuration stored at `<git dir>/dreview.json`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Well-known annotation channels.
pub mod channels {
    /// Review requests and their status changes.
    pub const REVIEWS: &str = "refs/notes/devtools/reviews";
    /// Comment threads.
    pub const DISCUSS: &str = "refs/notes/devtools/discuss";
    /// Continuous integration results.
    pub const CI: &str = "refs/notes/devtools/ci";
    /// Static analysis results.
    pub const ANALYSES: &str = "refs/notes/devtools/analyses";
    /// Pattern covering every channel above.
    pub const ALL: &str = "refs/notes/devtools/*";
}

const CONFIG_FILE: &str = "dreview.json";

/// Replication settings for one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Remote used when none is given.
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Channels pushed and pulled.
    #[serde(default = "default_channel_pattern")]
    pub channel_pattern: String,
    /// Channels listed by default.
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_channel_pattern() -> String {
    channels::ALL.to_string()
}

fn default_channels() -> Vec<String> {
    [channels::REVIEWS, channels::DISCUSS, channels::CI, channels::ANALYSES]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            channel_pattern: default_channel_pattern(),
            channels: default_channels(),
        }
    }
}

impl ReviewConfig {
    /// Load config from a git directory, falling back to defaults.
    pub fn load(git_dir: &Path) -> Result<Self> {
        let config_path = Self::config_path(git_dir);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read dreview config from {:?}", config_path))?;
        let config: ReviewConfig = serde_json::from_str(&data)
            .with_context(|| "Failed to parse dreview config JSON")?;
        Ok(config)
    }

    /// Save config to a git directory.
    pub fn save(&self, git_dir: &Path) -> Result<()> {
        let config_path = Self::config_path(git_dir);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    fn config_path(git_dir: &Path) -> PathBuf {
        git_dir.join(CONFIG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_missing() {
        let tmp = TempDir::new().unwrap();
        let config = ReviewConfig::load(tmp.path()).unwrap();
        assert_eq!(config, ReviewConfig::default());
        assert_eq!(config.remote, "origin");
        assert_eq!(config.channel_pattern, "refs/notes/devtools/*");
        assert_eq!(config.channels.len(), 4);
    }

    #[test]
    fn test_save_load() {
        let tmp = TempDir::new().unwrap();
        let config = ReviewConfig {
            remote: "upstream".to_string(),
            channel_pattern: channels::REVIEWS.to_string(),
            channels: vec![channels::REVIEWS.to_string()],
        };
        config.save(tmp.path()).unwrap();
        assert!(!tmp.path().join("dreview.tmp").exists());

        let loaded = ReviewConfig::load(tmp.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("dreview.json"), r#"{"remote": "mirror"}"#).unwrap();
        let loaded = ReviewConfig::load(tmp.path()).unwrap();
        assert_eq!(loaded.remote, "mirror");
        assert_eq!(loaded.channel_pattern, channels::ALL);
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("dreview.json"), "not json").unwrap();
        assert!(ReviewConfig::load(tmp.path()).is_err());
    }
}
