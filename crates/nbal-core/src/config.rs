//! Settings file parsing for the balancer.
//!
//! The driver reads all tunables from a single JSON file. A missing file is
//! created with defaults on first run so an operator always has a template
//! to edit.
//!
//! # Example settings.json
//!
//! ```json
//! {
//!   "analysis_period": 60,
//!   "switching_frequency": 20,
//!   "maximum_cpu_value": 70.0,
//!   "delta_cpu_values": 30.0,
//!   "log_storage_duration": 24,
//!   "processes": ["rphost.exe"]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::BalancerError;

fn default_analysis_period() -> u64 {
    60
}
fn default_switching_frequency() -> u64 {
    20
}
fn default_maximum_cpu_value() -> f64 {
    70.0
}
fn default_delta_cpu_values() -> f64 {
    30.0
}
fn default_log_storage_duration() -> u64 {
    24
}

/// All balancer tunables, deserialized from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Window over which CPU utilization is averaged, in seconds.
    #[serde(default = "default_analysis_period")]
    pub analysis_period: u64,

    /// Cadence of the rebalance cycle (`read` + `set_affinity`), in seconds.
    #[serde(default = "default_switching_frequency")]
    pub switching_frequency: u64,

    /// Rebalancing triggers only if the busiest domain exceeds this
    /// utilization percentage.
    #[serde(default = "default_maximum_cpu_value")]
    pub maximum_cpu_value: f64,

    /// ... and the busiest-vs-idlest domain spread exceeds this many
    /// percentage points.
    #[serde(default = "default_delta_cpu_values")]
    pub delta_cpu_values: f64,

    /// Rotated log files older than this many hours are pruned at startup.
    #[serde(default = "default_log_storage_duration")]
    pub log_storage_duration: u64,

    /// Image-name allow-list. Empty means every process is tracked.
    #[serde(default)]
    pub processes: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            analysis_period: default_analysis_period(),
            switching_frequency: default_switching_frequency(),
            maximum_cpu_value: default_maximum_cpu_value(),
            delta_cpu_values: default_delta_cpu_values(),
            log_storage_duration: default_log_storage_duration(),
            processes: Vec::new(),
        }
    }
}

impl Settings {
    /// Samples held per process CPU-delta window.
    pub fn delta_window(&self) -> usize {
        (self.analysis_period / self.switching_frequency.max(1)) as usize
    }

    fn validate(&self) -> Result<(), BalancerError> {
        if self.switching_frequency == 0 {
            return Err(BalancerError::Config(
                "switching_frequency must be at least 1 second".into(),
            ));
        }
        if self.analysis_period < self.switching_frequency {
            return Err(BalancerError::Config(format!(
                "analysis_period ({}) must not be shorter than switching_frequency ({})",
                self.analysis_period, self.switching_frequency
            )));
        }
        Ok(())
    }
}

/// Load the settings file, creating it with defaults if absent.
pub fn load_or_create(path: &Path) -> Result<Settings, BalancerError> {
    if !path.exists() {
        let defaults = Settings::default();
        let body = serde_json::to_string_pretty(&defaults)
            .map_err(|e| BalancerError::Config(e.to_string()))?;
        std::fs::write(path, body)
            .map_err(|e| BalancerError::Config(format!("cannot create {}: {e}", path.display())))?;
        info!("created default settings file {}", path.display());
        return Ok(defaults);
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| BalancerError::Config(format!("cannot read {}: {e}", path.display())))?;
    let settings: Settings = serde_json::from_str(&content).map_err(|e| {
        BalancerError::Config(format!("parsing {} failed: {e}", path.display()))
    })?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_settings() {
        let json = r#"{
            "analysis_period": 120,
            "switching_frequency": 30,
            "maximum_cpu_value": 80.0,
            "delta_cpu_values": 25.0,
            "log_storage_duration": 48,
            "processes": ["rphost.exe", "sqlservr.exe"]
        }"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.analysis_period, 120);
        assert_eq!(s.delta_window(), 4);
        assert_eq!(s.processes.len(), 2);
        s.validate().unwrap();
    }

    #[test]
    fn missing_fields_take_defaults() {
        let s: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(s.analysis_period, 60);
        assert_eq!(s.switching_frequency, 20);
        assert!(s.processes.is_empty()); // empty filter tracks everything
    }

    #[test]
    fn rejects_inverted_periods() {
        let s: Settings =
            serde_json::from_str(r#"{"analysis_period": 5, "switching_frequency": 10}"#).unwrap();
        assert!(s.validate().is_err());
    }
}
