use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Filename of the sqlite database under the data directory.
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Minimum similarity score for the duplicate scan to flag a pair.
    #[serde(default = "default_duplicate_similarity_threshold")]
    pub duplicate_similarity_threshold: f64,

    /// How many days back the "This Week" inbox bucket reaches.
    #[serde(default = "default_date_bucket_week_days")]
    pub date_bucket_week_days: i64,
}

fn default_database_file() -> String {
    "reverie.db".to_string()
}

fn default_duplicate_similarity_threshold() -> f64 {
    0.95
}

fn default_date_bucket_week_days() -> i64 {
    7
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_file: default_database_file(),
            duplicate_similarity_threshold: default_duplicate_similarity_threshold(),
            date_bucket_week_days: default_date_bucket_week_days(),
        }
    }
}

impl EngineConfig {
    /// Load from `$REVERIE_CONFIG` or the platform config dir, falling back
    /// to defaults when the file is missing or malformed.
    pub fn load() -> Self {
        let path = Self::config_path();
        match fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}; using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn config_path() -> PathBuf {
        if let Ok(custom) = env::var("REVERIE_CONFIG") {
            return PathBuf::from(custom);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("reverie")
            .join("config.toml")
    }

    pub fn database_path(&self) -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("reverie")
            .join(&self.database_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.database_file, "reverie.db");
        assert_eq!(config.duplicate_similarity_threshold, 0.95);
        assert_eq!(config.date_bucket_week_days, 7);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let config: EngineConfig =
            toml::from_str("duplicate_similarity_threshold = 0.8").unwrap();
        assert_eq!(config.duplicate_similarity_threshold, 0.8);
        assert_eq!(config.database_file, "reverie.db");
    }
}
