use std::path::Path;
use std::time::Duration;

use config::{Environment, File};
use serde::Deserialize;

use crate::Error;
use crate::budget::DEFAULT_MAX_SAMPLES;
use crate::state::{CubeState, ViewState};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub access_key: Option<String>,
    pub access_key_header: String,
    pub request_timeout_ms: u64,
    pub max_samples: u64,
    pub retry_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub timeframe_ms: u64,
    pub interval_ms: u64,
    pub cube_limit: u32,
    pub group_dimension: String,
    pub legend_dimension: String,
}

impl Default for Config {
    fn default() -> Self {
        let cube = CubeState::default();
        Config {
            base_url: "http://localhost:7080".to_string(),
            access_key: None,
            access_key_header: "Autodba-Access-Key".to_string(),
            request_timeout_ms: 5000,
            max_samples: DEFAULT_MAX_SAMPLES,
            retry_delay_ms: 5000,
            poll_interval_ms: 10_000,
            timeframe_ms: 15 * 60 * 1000,
            interval_ms: 10 * 1000,
            cube_limit: cube.limit,
            group_dimension: cube.group_dimension,
            legend_dimension: cube.legend_dimension,
        }
    }
}

impl Config {
    /// Layers `./dbwatch.toml`, then `path` if given, then `DBWATCH_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut builder = config::Config::builder()
            .add_source(File::with_name("./dbwatch.toml").required(false));
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config = builder
            .add_source(Environment::with_prefix("DBWATCH"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Initial view: live, full timeframe, configured cube dimensions.
    pub fn view_defaults(&self) -> ViewState {
        ViewState {
            timeframe_ms: self.timeframe_ms,
            interval_ms: self.interval_ms,
            cube: CubeState {
                legend_dimension: self.legend_dimension.clone(),
                group_dimension: self.group_dimension.clone(),
                limit: self.cube_limit,
                ..CubeState::default()
            },
            ..ViewState::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_live() {
        let view = Config::default().view_defaults();
        assert_eq!(view.range_end_pct, 100.0);
        assert_eq!(view.range_begin_pct, 0.0);
        assert_eq!(view.timeframe_ms, 900_000);
        assert_eq!(view.interval_ms, 10_000);
        assert!(view.cube.groups_by_time());
        assert!(view.server_now.is_none());
    }

    #[test]
    fn test_load_file_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("dbwatch_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dbwatch.toml");
        std::fs::write(
            &path,
            "base_url = \"http://db.internal:9000\"\nmax_samples = 500\ngroup_dimension = \"usename\"\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.base_url, "http://db.internal:9000");
        assert_eq!(config.max_samples, 500);
        assert_eq!(config.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.view_defaults().cube.group_dimension, "usename");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let res = Config::load(Some(Path::new("/nonexistent/dbwatch.toml")));
        assert!(matches!(res, Err(Error::Config(_))));
    }
}
