//! Configuration for a kite run. Read once at startup from a YAML file and
//! handed to each component by reference; nothing in kite reads settings from
//! anywhere else.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::log::*;

/// Name of the config file looked up next to the executable.
pub const DEFAULT_CONFIG_FILE: &str = "kite.yml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("required setting `{0}` is missing or empty")]
    MissingValue(&'static str),
    #[error("setting `{0}` is invalid: {1}")]
    InvalidValue(&'static str, String),
    #[error("could not locate the running executable: {0}")]
    ExecutableDir(#[source] std::io::Error),
}

pub fn default_scheme() -> String {
    "http".into()
}

pub fn default_port() -> u16 {
    8080
}

pub fn default_api_path() -> String {
    "/client/api".into()
}

pub fn default_request_timeout_secs() -> u64 {
    30
}

pub fn default_hooks_enabled() -> bool {
    true
}

pub fn default_hooks_directory() -> PathBuf {
    PathBuf::from("hooks")
}

pub fn default_hook_timeout_secs() -> u64 {
    60
}

/// Command identifiers the platform reports for VM lifecycle jobs, mapped to
/// the hook event they trigger.
pub fn default_events() -> BTreeMap<String, String> {
    [
        ("com.cloud.api.commands.DestroyVMCmd", "vmdestroy"),
        ("com.cloud.api.commands.CreateVMCmd", "vmcreate"),
        ("com.cloud.api.commands.DeployVMCmd", "vmdeploy"),
        (
            "org.apache.cloudstack.api.command.user.vm.DestroyVMCmd",
            "vmdestroy",
        ),
        (
            "org.apache.cloudstack.api.command.user.vm.DeployVMCmd",
            "vmdeploy",
        ),
    ]
    .into_iter()
    .map(|(cmd, event)| (cmd.to_string(), event.to_string()))
    .collect()
}

pub fn default_state_path() -> PathBuf {
    PathBuf::from("kite.jobs.json")
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    platform: PlatformConfig,
    #[serde(default)]
    hooks: HooksConfig,
    #[serde(default)]
    queue: QueueConfig,
    #[serde(default)]
    state: StateConfig,
}

/// Where and how to reach the platform API.
#[derive(Getters, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "self::default_scheme")]
    scheme: String,
    host: String,
    #[serde(default = "self::default_port")]
    port: u16,
    #[serde(default = "self::default_api_path")]
    path: String,
    api_key: String,
    secret_key: String,
    /// Skip TLS certificate validation. Only meant for platforms fronted by
    /// self-signed certificates.
    #[serde(default)]
    insecure_tls: bool,
    #[serde(default = "self::default_request_timeout_secs")]
    timeout_secs: u64,
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default = "self::default_hooks_enabled")]
    enabled: bool,
    #[serde(default = "self::default_hooks_directory")]
    directory: PathBuf,
    #[serde(default = "self::default_hook_timeout_secs")]
    timeout_secs: u64,
    /// Platform command identifier -> hook event name.
    #[serde(default = "self::default_events")]
    events: BTreeMap<String, String>,
}

#[derive(Getters, Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    destination: Option<String>,
    #[serde(default)]
    mode: QueueMode,
}

/// How a job is handed to the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Broadcast to every subscriber of a channel.
    #[default]
    Channel,
    /// Append to a list consumed as a work queue.
    List,
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "self::default_state_path")]
    path: PathBuf,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            enabled: default_hooks_enabled(),
            directory: default_hooks_directory(),
            timeout_secs: default_hook_timeout_secs(),
            events: default_events(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

impl fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("api_key", &redact(&self.api_key))
            .field("secret_key", &"***")
            .field("insecure_tls", &self.insecure_tls)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Config {
    /// Path of the config file when none is given explicitly: `kite.yml`
    /// next to the running executable.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let exe = std::env::current_exe().map_err(ConfigError::ExecutableDir)?;
        let dir = exe.parent().unwrap_or_else(|| Path::new("."));
        Ok(dir.join(DEFAULT_CONFIG_FILE))
    }

    /// Read, parse and validate the config file at `path`. Relative paths in
    /// the file are resolved against the file's own directory.
    #[tracing::instrument]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let config = Self::from_yaml_str(&raw, base_dir).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a YAML document. Relative paths resolve against
    /// `base_dir`.
    pub fn from_yaml_str(raw: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let mut config: Config =
            serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
                path: PathBuf::new(),
                source,
            })?;
        config.resolve_paths(base_dir);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        if self.hooks.directory.is_relative() {
            self.hooks.directory = base_dir.join(&self.hooks.directory);
        }
        if self.state.path.is_relative() {
            self.state.path = base_dir.join(&self.state.path);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let platform = &self.platform;
        if platform.host.trim().is_empty() {
            return Err(ConfigError::MissingValue("platform.host"));
        }
        if platform.api_key.is_empty() {
            return Err(ConfigError::MissingValue("platform.api_key"));
        }
        if platform.secret_key.is_empty() {
            return Err(ConfigError::MissingValue("platform.secret_key"));
        }
        if !matches!(platform.scheme.as_str(), "http" | "https") {
            return Err(ConfigError::InvalidValue(
                "platform.scheme",
                format!("expected http or https, got `{}`", platform.scheme),
            ));
        }
        if platform.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "platform.timeout_secs",
                "must be greater than zero".into(),
            ));
        }
        if self.hooks.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "hooks.timeout_secs",
                "must be greater than zero".into(),
            ));
        }
        if self.queue.enabled {
            if self.queue.url.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::MissingValue("queue.url"));
            }
            if self.queue.destination.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::MissingValue("queue.destination"));
            }
        }
        if platform.insecure_tls {
            warn!("TLS certificate validation is disabled for the platform API");
        }
        Ok(())
    }
}

impl PlatformConfig {
    /// `<scheme>://<host>:<port><path>`, without a query string.
    pub fn base_url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl HooksConfig {
    /// The hook event a platform command triggers, if any.
    pub fn event_for(&self, cmd: &str) -> Option<&str> {
        self.events.get(cmd).map(String::as_str)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    const MINIMAL: &str = r#"
platform:
  host: cloud.example.com
  api_key: key
  secret_key: secret
"#;

    #[test]
    fn test_defaults_are_applied() -> Result<(), ConfigError> {
        let config = Config::from_yaml_str(MINIMAL, Path::new("/etc/kite"))?;
        assert_eq!(
            "http://cloud.example.com:8080/client/api",
            config.platform().base_url()
        );
        assert!(!config.platform().insecure_tls());
        assert!(*config.hooks().enabled());
        assert!(!config.queue().enabled());
        assert_eq!(Path::new("/etc/kite/hooks"), config.hooks().directory());
        assert_eq!(Path::new("/etc/kite/kite.jobs.json"), config.state().path());
        assert_eq!(
            Some("vmdestroy"),
            config
                .hooks()
                .event_for("com.cloud.api.commands.DestroyVMCmd")
        );
        assert_eq!(None, config.hooks().event_for("com.cloud.api.commands.StopVMCmd"));
        Ok(())
    }

    #[test]
    fn test_absolute_paths_are_kept() -> Result<(), ConfigError> {
        let raw = format!("{MINIMAL}hooks:\n  directory: /opt/hooks\nstate:\n  path: /var/lib/kite/jobs.json\n");
        let config = Config::from_yaml_str(&raw, Path::new("/etc/kite"))?;
        assert_eq!(Path::new("/opt/hooks"), config.hooks().directory());
        assert_eq!(Path::new("/var/lib/kite/jobs.json"), config.state().path());
        Ok(())
    }

    #[test]
    fn test_custom_events_replace_the_defaults() -> Result<(), ConfigError> {
        let raw = format!("{MINIMAL}hooks:\n  events:\n    StartVMCmd: vmstart\n");
        let config = Config::from_yaml_str(&raw, Path::new("."))?;
        assert_eq!(Some("vmstart"), config.hooks().event_for("StartVMCmd"));
        assert_eq!(
            None,
            config
                .hooks()
                .event_for("com.cloud.api.commands.DestroyVMCmd")
        );
        Ok(())
    }

    #[test]
    fn test_missing_secret_is_rejected() {
        let raw = "platform:\n  host: h\n  api_key: key\n  secret_key: ''\n";
        let err = Config::from_yaml_str(raw, Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingValue("platform.secret_key")));
    }

    #[test]
    fn test_enabled_queue_needs_a_destination() {
        let raw = format!("{MINIMAL}queue:\n  enabled: true\n  url: redis://127.0.0.1/\n");
        let err = Config::from_yaml_str(&raw, Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingValue("queue.destination")));
    }

    #[test]
    fn test_queue_mode_parses() -> Result<(), ConfigError> {
        let raw = format!(
            "{MINIMAL}queue:\n  enabled: true\n  url: redis://127.0.0.1/\n  destination: jobs\n  mode: list\n"
        );
        let config = Config::from_yaml_str(&raw, Path::new("."))?;
        assert_eq!(QueueMode::List, *config.queue().mode());
        Ok(())
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        let raw = format!("{MINIMAL}  scheme: ftp\n");
        let err = Config::from_yaml_str(&raw, Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue("platform.scheme", _)));
    }

    #[test]
    fn test_debug_output_hides_the_secret() -> Result<(), ConfigError> {
        let config = Config::from_yaml_str(MINIMAL, Path::new("."))?;
        let debug = format!("{:?}", config.platform());
        assert!(!debug.contains("secret\""));
        assert!(debug.contains("secret_key: \"***\""));
        Ok(())
    }

    #[test]
    fn test_missing_file_is_a_read_error() {
        let err = Config::load(Path::new("/nonexistent/kite.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
