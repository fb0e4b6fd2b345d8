use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::EngineSettings;
use crate::error::{Error, Result};
use crate::models::Difficulty;

const APP_DIR: &str = "sqldrill";
const DEFAULT_DB_NAME: &str = "sqldrill.db";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database; defaults to `<config_dir>/sqldrill/sqldrill.db`
    pub db_path: Option<PathBuf>,
    /// JSON item bank; the built-in bank is used when unset
    pub bank_path: Option<PathBuf>,
    pub learner: String,
    // Judge every cell after two attempts
    pub test_mode: bool,
    pub log_level: String,
    pub synthesis: SynthesisConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub enabled: bool,
    // Overall cell accuracy below which review items are generated
    pub weak_accuracy_threshold: f64,
    pub max_retries: u32,
    pub difficulty: Difficulty,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            bank_path: None,
            learner: "default".to_string(),
            test_mode: false,
            log_level: "warn".to_string(),
            synthesis: SynthesisConfig::default(),
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weak_accuracy_threshold: 60.0,
            max_retries: 3,
            difficulty: Difficulty::Medium,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&config_path())?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = var("SQLDRILL_DB") {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("SQLDRILL_BANK") {
            self.bank_path = Some(PathBuf::from(path));
        }
        if let Some(learner) = var("SQLDRILL_LEARNER") {
            self.learner = learner;
        }
        if let Some(flag) = var("SQLDRILL_TEST_MODE") {
            self.test_mode = parse_flag(&flag).ok_or_else(|| {
                Error::Config(format!("SQLDRILL_TEST_MODE must be a boolean, got '{}'", flag))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.learner.trim().is_empty() {
            return Err(Error::Config("learner id must not be empty".to_string()));
        }
        if self.synthesis.max_retries < 1 {
            return Err(Error::Config("synthesis.max_retries must be at least 1".to_string()));
        }
        let threshold = self.synthesis.weak_accuracy_threshold;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(Error::Config(format!(
                "synthesis.weak_accuracy_threshold must be within 0..=100, got {}",
                threshold
            )));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| app_dir().join(DEFAULT_DB_NAME))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            test_mode: self.test_mode,
            synthesis_enabled: self.synthesis.enabled,
            weak_accuracy_threshold: self.synthesis.weak_accuracy_threshold,
            max_synthesis_retries: self.synthesis.max_retries,
            difficulty: self.synthesis.difficulty,
        }
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn app_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// `$SQLDRILL_CONFIG`, or `config.toml` in the app's config directory.
pub fn config_path() -> PathBuf {
    match std::env::var("SQLDRILL_CONFIG") {
        Ok(path) => PathBuf::from(path),
        Err(_) => app_dir().join(CONFIG_FILE),
    }
}
