//! Layered runtime configuration: built-in defaults, overridden by an
//! optional TOML file, overridden again by a handful of environment
//! variables for the knobs operators tend to flip without editing a file.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    Cooperative,
    WorkStealing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub worker_count: usize,
    pub scheduler_mode: SchedulerMode,

    pub young_threshold: usize,
    pub old_threshold: usize,
    pub promotion_threshold: u8,
    pub mark_work_limit: usize,
    pub trigger_ratio: f64,

    pub jit_enabled: bool,
    pub jit_hot_threshold: u64,
    pub jit_async_compile: bool,
    pub jit_opt_level: u8,

    pub ic_enabled: bool,
    pub max_call_site_entries: usize,
    pub max_method_cache_functions: usize,
    pub max_property_cache_entries: usize,

    pub stack_size: usize,
    pub call_stack_size: usize,
    pub globals_size: usize,

    pub time_slice: u32,

    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            worker_count: num_cpus::get(),
            scheduler_mode: SchedulerMode::Cooperative,

            young_threshold: 1024,
            old_threshold: 16 * 1024,
            promotion_threshold: 3,
            mark_work_limit: 512,
            trigger_ratio: 0.8,

            jit_enabled: true,
            jit_hot_threshold: 1000,
            jit_async_compile: false,
            jit_opt_level: 1,

            ic_enabled: true,
            max_call_site_entries: 4,
            max_method_cache_functions: 4096,
            max_property_cache_entries: 4096,

            stack_size: 4096,
            call_stack_size: 1024,
            globals_size: 4096,

            time_slice: 1000,

            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&text)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn with_env_overrides() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VESPER_WORKER_COUNT") {
            if let Ok(n) = v.parse() {
                self.worker_count = n;
            }
        }
        if let Ok(v) = std::env::var("VESPER_SCHEDULER_MODE") {
            match v.as_str() {
                "cooperative" => self.scheduler_mode = SchedulerMode::Cooperative,
                "work_stealing" => self.scheduler_mode = SchedulerMode::WorkStealing,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("VESPER_LOG") {
            self.log_filter = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_internally_consistent() {
        let config = Config::default();
        assert!(config.worker_count >= 1);
        assert_eq!(config.scheduler_mode, SchedulerMode::Cooperative);
        assert!(config.young_threshold < config.old_threshold);
    }

    #[test]
    fn parses_partial_toml_over_defaults() {
        let toml_text = "jit_enabled = false\nworker_count = 2\n";
        let config: Config = toml::from_str(toml_text).unwrap();
        assert!(!config.jit_enabled);
        assert_eq!(config.worker_count, 2);
        // Untouched fields still carry their defaults.
        assert_eq!(config.promotion_threshold, 3);
    }
}
