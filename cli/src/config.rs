use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use transcoder_server::ServerConfig;
use transcoder_worker::WorkerConfig;

/// Set for spawned workers so they read the same file as the host.
pub const CONFIG_ENV: &str = "TRANSCODER_CONFIG";

const DEFAULT_FILES: [&str; 3] = ["config.toml", "config.yaml", "config.yml"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub output: Option<PathBuf>,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: None,
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> Result<LevelFilter> {
        self.level
            .parse()
            .with_context(|| format!("Invalid log level: {:?}", self.level))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        serde_yaml::from_str(&read_config(path)?)
            .with_context(|| format!("{} is not a valid YAML transcoder config", path.display()))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        toml::from_str(&read_config(path)?)
            .with_context(|| format!("{} is not a valid TOML transcoder config", path.display()))
    }

    /// Picks the format from the file extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "toml" => Self::from_toml_file(path),
            _ => anyhow::bail!(
                "{}: unknown config format, expected .toml, .yaml or .yml",
                path.display()
            ),
        }
    }

    /// Explicit file first, then `$TRANSCODER_CONFIG`, then the first
    /// config file found in the user config directory. Built-in defaults
    /// when there is none.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::from_file(Path::new(&path))
                .with_context(|| format!("while loading the config named by ${}", CONFIG_ENV));
        }
        Self::load_from_dir(&common::paths::config_dir())
    }

    fn load_from_dir(dir: &Path) -> Result<Self> {
        match DEFAULT_FILES.iter().map(|name| dir.join(name)).find(|path| path.is_file()) {
            Some(path) => {
                log::debug!("Using config file {}", path.display());
                Self::from_file(&path)
            }
            None => Ok(Self::default()),
        }
    }
}

fn read_config(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Cannot read config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[server]
socket_path = "/tmp/t.socket"
state_interval_ms = 50

[worker]
job_wait_ms = 250

[logging]
level = "debug"
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.server.socket_path, PathBuf::from("/tmp/t.socket"));
        assert_eq!(config.server.state_interval_ms, 50);
        assert_eq!(config.server.accept_interval_ms, 100);
        assert_eq!(config.worker.job_wait_ms, 250);
        assert_eq!(config.worker.comm_interval_ms, 100);
        assert_eq!(config.logging.level_filter().unwrap(), LevelFilter::Debug);
    }

    #[test]
    fn test_yaml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "server:\n  worker_verbosity: 3\nlogging:\n  output: /tmp/t.log\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.server.worker_verbosity, 3);
        assert_eq!(config.logging.output, Some(PathBuf::from("/tmp/t.log")));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_unsupported_extension() {
        let err = Config::from_file(Path::new("/tmp/config.ini")).unwrap_err();
        assert!(err.to_string().contains("unknown config format"));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[server\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
        assert!(err.to_string().contains("TOML"));
    }

    #[test]
    fn test_bad_level_is_an_error() {
        let logging = LoggingConfig { level: "loud".to_string(), output: None };
        assert!(logging.level_filter().is_err());
    }

    #[test]
    fn test_default_dir_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.worker.job_wait_ms, 1000);

        fs::write(dir.path().join("config.yaml"), "worker:\n  status_interval_ms: 20\n").unwrap();
        let config = Config::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.worker.status_interval_ms, 20);
    }
}
