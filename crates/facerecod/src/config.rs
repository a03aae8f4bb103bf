use crate::pipeline::ProcessingMode;
use facereco_core::{SearchPolicy, DEFAULT_DISTANCE_THRESHOLD};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("bad config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Database file, loaded at startup and written by `Save`.
    pub db_path: PathBuf,
    /// Chi-square distance below which a descriptor matches.
    pub distance_threshold: f32,
    /// Time-bounded search: earliest decision once a match is known.
    pub search_min: Duration,
    /// Time-bounded search: latest decision.
    pub search_max: Duration,
    /// When set, searches decide after this many queries instead of by time.
    pub search_queries: Option<usize>,
    pub mode: ProcessingMode,
    /// Worker sleep when a session has nothing queued.
    pub poll_interval: Duration,
    /// Save the database on shutdown.
    pub autosave: bool,
}

/// Optional overrides read from the TOML file named by `FACERECO_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    distance_threshold: Option<f32>,
    search_min_ms: Option<u64>,
    search_max_ms: Option<u64>,
    search_queries: Option<usize>,
    mode: Option<ProcessingMode>,
    poll_interval_ms: Option<u64>,
    autosave: Option<bool>,
}

impl Config {
    /// Load defaults, then the optional config file, then `FACERECO_*`
    /// environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("FACERECO_CONFIG") {
            Ok(path) => {
                let path = PathBuf::from(path);
                let text = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path, source })?;
                Some(text)
            }
            Err(_) => None,
        };
        Self::from_sources(file.as_deref(), |key| std::env::var(key).ok())
    }

    fn from_sources(
        file: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file: FileConfig = match file {
            Some(text) => toml::from_str(text)?,
            None => FileConfig::default(),
        };

        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facereco");

        let db_path = env("FACERECO_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("faces.frdb"));

        let mode = match env("FACERECO_MODE") {
            Some(v) => v.parse::<ProcessingMode>().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "ignoring FACERECO_MODE");
                file.mode.unwrap_or_default()
            }),
            None => file.mode.unwrap_or_default(),
        };

        let config = Self {
            db_path,
            distance_threshold: env_parse(
                &env,
                "FACERECO_DISTANCE_THRESHOLD",
                file.distance_threshold.unwrap_or(DEFAULT_DISTANCE_THRESHOLD),
            ),
            search_min: Duration::from_millis(env_parse(
                &env,
                "FACERECO_SEARCH_MIN_MS",
                file.search_min_ms.unwrap_or(1000),
            )),
            search_max: Duration::from_millis(env_parse(
                &env,
                "FACERECO_SEARCH_MAX_MS",
                file.search_max_ms.unwrap_or(1000),
            )),
            search_queries: env("FACERECO_SEARCH_QUERIES")
                .and_then(|v| v.parse().ok())
                .or(file.search_queries),
            mode,
            poll_interval: Duration::from_millis(env_parse(
                &env,
                "FACERECO_POLL_INTERVAL_MS",
                file.poll_interval_ms.unwrap_or(2),
            )),
            autosave: env("FACERECO_AUTOSAVE")
                .map(|v| v != "0")
                .or(file.autosave)
                .unwrap_or(true),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.distance_threshold.is_nan() || self.distance_threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "distance threshold {} must be positive",
                self.distance_threshold
            )));
        }
        if self.search_min > self.search_max {
            return Err(ConfigError::Invalid(format!(
                "search min {:?} exceeds max {:?}",
                self.search_min, self.search_max
            )));
        }
        Ok(())
    }

    /// Policy used for learn and recognize tracks.
    pub fn search_policy(&self) -> SearchPolicy {
        match self.search_queries {
            Some(queries) => SearchPolicy::CountBounded { queries },
            None => SearchPolicy::TimeBounded {
                min: self.search_min,
                max: self.search_max,
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(env: impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(file: Option<&str>, vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_sources(file, |k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = load(None, &[("HOME", "/home/alice")]).unwrap();
        assert_eq!(c.db_path, PathBuf::from("/home/alice/.local/share/facereco/faces.frdb"));
        assert_eq!(c.distance_threshold, 0.37);
        assert_eq!(
            c.search_policy(),
            SearchPolicy::TimeBounded {
                min: Duration::from_millis(1000),
                max: Duration::from_millis(1000),
            }
        );
        assert_eq!(c.mode, ProcessingMode::Learn);
        assert_eq!(c.poll_interval, Duration::from_millis(2));
        assert!(c.autosave);
    }

    #[test]
    fn test_xdg_data_home() {
        let c = load(None, &[("XDG_DATA_HOME", "/data")]).unwrap();
        assert_eq!(c.db_path, PathBuf::from("/data/facereco/faces.frdb"));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = r#"
            db_path = "/srv/faces.frdb"
            distance_threshold = 0.5
            search_queries = 8
            mode = "recognize"
            autosave = false
        "#;
        let c = load(Some(file), &[]).unwrap();
        assert_eq!(c.db_path, PathBuf::from("/srv/faces.frdb"));
        assert_eq!(c.distance_threshold, 0.5);
        assert_eq!(c.search_policy(), SearchPolicy::CountBounded { queries: 8 });
        assert_eq!(c.mode, ProcessingMode::Recognize);
        assert!(!c.autosave);
    }

    #[test]
    fn test_env_overrides_file() {
        let file = "distance_threshold = 0.5\nmode = \"recognize\"";
        let c = load(
            Some(file),
            &[
                ("FACERECO_DISTANCE_THRESHOLD", "0.3"),
                ("FACERECO_MODE", "test"),
                ("FACERECO_AUTOSAVE", "0"),
                ("FACERECO_SEARCH_MIN_MS", "200"),
            ],
        )
        .unwrap();
        assert_eq!(c.distance_threshold, 0.3);
        assert_eq!(c.mode, ProcessingMode::Test);
        assert!(!c.autosave);
        assert_eq!(c.search_min, Duration::from_millis(200));
    }

    #[test]
    fn test_unparseable_env_falls_back() {
        let c = load(
            None,
            &[("FACERECO_DISTANCE_THRESHOLD", "close"), ("FACERECO_MODE", "enroll")],
        )
        .unwrap();
        assert_eq!(c.distance_threshold, 0.37);
        assert_eq!(c.mode, ProcessingMode::Learn);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        assert!(matches!(
            load(Some("camera = \"/dev/video0\""), &[]),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            load(None, &[("FACERECO_SEARCH_MIN_MS", "5000")]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            load(None, &[("FACERECO_DISTANCE_THRESHOLD", "-1")]),
            Err(ConfigError::Invalid(_))
        ));
    }
}
