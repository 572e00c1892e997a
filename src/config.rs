use serde::{Deserialize, Serialize};

use crate::worker_error::{ErrorDetails, ErrorLayer, Result, WorkerError};

/// Tunables for a worker.  Every field has a default so a config file only
/// needs to mention what it changes:
///
/// ```toml
/// cache_budget = 50000000
/// max_search_results = 5000
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Total node ids the search cache may hold across all entries.
    pub cache_budget: usize,
    /// Searches matching more nodes than this only return the matches inside
    /// the current view.
    pub max_search_results: usize,
    /// Grid cells per axis when thinning overlapping tips in a view.
    pub plot_precision: f64,
    /// Camera zoom suggested to the UI unless the dataset overrides it.
    pub initial_zoom: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            cache_budget: 100_000_000,
            max_search_results: 10_000,
            plot_precision: 2000.0,
            initial_zoom: -2.0,
        }
    }
}

pub fn parse_config(text: &str) -> Result<WorkerConfig> {
    let config: WorkerConfig = toml::from_str(text)?;
    if !(config.plot_precision > 0.0) {
        return Err(WorkerError::RequestProblem(ErrorDetails {
            layer: ErrorLayer::BadInput,
            message: format!("plot_precision must be positive, not {}", config.plot_precision),
        }));
    }
    Ok(config)
}

pub fn load_config(config_path: &str) -> Result<WorkerConfig> {
    let text = std::fs::read_to_string(config_path)?;
    parse_config(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = parse_config("max_search_results = 5\n").unwrap();
        assert_eq!(config.max_search_results, 5);
        assert_eq!(config.cache_budget, 100_000_000);
        assert_eq!(config.initial_zoom, -2.0);
    }

    #[test]
    fn test_bad_config() {
        assert!(parse_config("plot_precision = 0.0\n").is_err());
        assert!(parse_config("cache_budget = \"lots\"\n").is_err());
    }
}
