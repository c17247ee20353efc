//! Daemon configuration.
//!
//! Values are layered: built-in defaults, then the persisted config file,
//! then command-line overrides. The merged result is validated before the
//! daemon starts; an ambiguous configuration never reaches the broker or the
//! capture loop.
//!
//! The file format follows the extension: `.toml` (preferred) or `.json`.
//! JSON files may use the flat legacy layout
//! (`{"port", "host", "max_clients", "welcome_message"}`).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use mop_core::Suppression;
use mop_protocol::DEFAULT_WELCOME_MESSAGE;

/// Default TCP port of the session listener.
pub const DEFAULT_PORT: u16 = 4343;

/// Default listen host (all IPv4 addresses).
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default maximum number of concurrent sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 10;

/// Default directory holding MOP load images.
pub const DEFAULT_MOP_DIR: &str = "/usr/local/mop";

/// Config file name inside the config directory.
const CONFIG_FILE_NAME: &str = "config.toml";

// ============================================================================
// Configuration Types
// ============================================================================

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub capture: CaptureConfig,
}

/// Session broker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_sessions: usize,
    pub welcome_message: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_sessions: DEFAULT_MAX_SESSIONS,
            welcome_message: DEFAULT_WELCOME_MESSAGE.to_string(),
        }
    }
}

/// Frame capture settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture on every non-loopback interface
    pub all_interfaces: bool,
    /// Explicit interface names (exclusive with `all_interfaces`)
    pub interfaces: Vec<String>,
    /// Do not process MOP V3 (dump/load) messages
    pub suppress_v3: bool,
    /// Do not process MOP V4 (remote console) messages
    pub suppress_v4: bool,
    /// Directory holding MOP load images
    pub mop_dir: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            all_interfaces: false,
            interfaces: Vec::new(),
            suppress_v3: false,
            suppress_v4: false,
            mop_dir: PathBuf::from(DEFAULT_MOP_DIR),
        }
    }
}

/// Which interfaces capture mode listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceSelection {
    All,
    Named(Vec<String>),
}

/// Flat layout of the legacy JSON config file.
#[derive(Debug, Deserialize)]
struct LegacyJsonConfig {
    port: Option<u16>,
    host: Option<String>,
    max_clients: Option<usize>,
    welcome_message: Option<String>,
}

impl From<LegacyJsonConfig> for DaemonConfig {
    fn from(legacy: LegacyJsonConfig) -> Self {
        let defaults = ServerConfig::default();
        Self {
            server: ServerConfig {
                host: legacy.host.unwrap_or(defaults.host),
                port: legacy.port.unwrap_or(defaults.port),
                max_sessions: legacy.max_clients.unwrap_or(defaults.max_sessions),
                welcome_message: legacy.welcome_message.unwrap_or(defaults.welcome_message),
            },
            capture: CaptureConfig::default(),
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_sessions: Option<usize>,
    pub welcome_message: Option<String>,
    pub suppress_v3: bool,
    pub suppress_v4: bool,
    pub all_interfaces: bool,
    pub interfaces: Vec<String>,
    pub mop_dir: Option<PathBuf>,
}

// ============================================================================
// Loading and Saving
// ============================================================================

/// Returns the default config file path (`$XDG_CONFIG_HOME/mopd/config.toml`).
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("mopd")
        .join(CONFIG_FILE_NAME)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Toml,
    Json,
}

fn file_format(path: &Path) -> Result<FileFormat, ConfigError> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => Ok(FileFormat::Toml),
        Some("json") => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}

impl DaemonConfig {
    /// Loads the config file at `path`, falling back to defaults if it
    /// does not exist.
    ///
    /// # Errors
    ///
    /// `ConfigError::Read` / `ConfigError::Parse` for unreadable or malformed
    /// files, `ConfigError::UnsupportedFormat` for unknown extensions.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let format = file_format(path)?;
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&text, format).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })
    }

    fn parse(text: &str, format: FileFormat) -> Result<Self, String> {
        match format {
            FileFormat::Toml => toml::from_str(text).map_err(|e| e.to_string()),
            FileFormat::Json => {
                let value: serde_json::Value =
                    serde_json::from_str(text).map_err(|e| e.to_string())?;
                let sectioned = value.get("server").is_some() || value.get("capture").is_some();
                if sectioned {
                    serde_json::from_value(value).map_err(|e| e.to_string())
                } else {
                    serde_json::from_value::<LegacyJsonConfig>(value)
                        .map(DaemonConfig::from)
                        .map_err(|e| e.to_string())
                }
            }
        }
    }

    /// Writes this configuration to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// `ConfigError::Write` on I/O failure, `ConfigError::Serialize` if the
    /// value cannot be encoded.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = match file_format(path)? {
            FileFormat::Toml => self.to_toml()?,
            FileFormat::Json => serde_json::to_string_pretty(self)
                .map_err(|e| ConfigError::Serialize(e.to_string()))?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;
        }

        fs::write(path, text).map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Applies command-line overrides on top of the loaded values.
    ///
    /// An override of one side of a mutually exclusive pair clears the other
    /// side coming from the file, so the command line always wins.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        let server = &mut self.server;
        if let Some(host) = overrides.host {
            server.host = host;
        }
        if let Some(port) = overrides.port {
            server.port = port;
        }
        if let Some(max) = overrides.max_sessions {
            server.max_sessions = max;
        }
        if let Some(welcome) = overrides.welcome_message {
            server.welcome_message = welcome;
        }

        let capture = &mut self.capture;
        if overrides.suppress_v3 || overrides.suppress_v4 {
            capture.suppress_v3 = overrides.suppress_v3;
            capture.suppress_v4 = overrides.suppress_v4;
        }
        if overrides.all_interfaces || !overrides.interfaces.is_empty() {
            capture.all_interfaces = overrides.all_interfaces;
            capture.interfaces = overrides.interfaces;
        }
        if let Some(dir) = overrides.mop_dir {
            capture.mop_dir = dir;
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ServerConfig {
    /// Checks the broker settings.
    ///
    /// # Errors
    ///
    /// `ConfigError::InvalidMaxSessions` for zero, `ConfigError::EmptyHost`
    /// for a blank host.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::InvalidMaxSessions);
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        Ok(())
    }
}

impl CaptureConfig {
    /// Returns the validated suppression setting.
    ///
    /// # Errors
    ///
    /// `ConfigError::ConflictingSuppression` if both versions are suppressed.
    pub fn suppression(&self) -> Result<Suppression, ConfigError> {
        Suppression::from_flags(self.suppress_v3, self.suppress_v4)
            .map_err(|_| ConfigError::ConflictingSuppression)
    }

    /// Returns the validated interface selection.
    ///
    /// # Errors
    ///
    /// `ConfigError::ConflictingInterfaceSelection` when "all" is combined
    /// with names, `ConfigError::NoInterfaceSelection` when neither is given.
    pub fn interface_selection(&self) -> Result<InterfaceSelection, ConfigError> {
        match (self.all_interfaces, self.interfaces.is_empty()) {
            (true, false) => Err(ConfigError::ConflictingInterfaceSelection),
            (true, true) => Ok(InterfaceSelection::All),
            (false, false) => Ok(InterfaceSelection::Named(self.interfaces.clone())),
            (false, true) => Err(ConfigError::NoInterfaceSelection),
        }
    }

    /// Validates every capture setting.
    pub fn validate(&self) -> Result<(Suppression, InterfaceSelection), ConfigError> {
        Ok((self.suppression()?, self.interface_selection()?))
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from loading, saving or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to write config {path}: {error}")]
    Write { path: PathBuf, error: String },

    #[error("Failed to parse config {path}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Unsupported config format for {path} (use .toml or .json)")]
    UnsupportedFormat { path: PathBuf },

    #[error("Options -3 and -4 are mutually exclusive")]
    ConflictingSuppression,

    #[error("Listening on all interfaces (-a) cannot be combined with an interface list")]
    ConflictingInterfaceSelection,

    #[error("No interfaces selected: pass -a or at least one interface name")]
    NoInterfaceSelection,

    #[error("max_sessions must be at least 1")]
    InvalidMaxSessions,

    #[error("Listen host must not be empty")]
    EmptyHost,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.server.port, 4343);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.max_sessions, 10);
        assert_eq!(config.server.welcome_message, "Welcome to MOP-D Service");
        assert_eq!(config.capture.mop_dir, PathBuf::from("/usr/local/mop"));
        assert!(config.server.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, DaemonConfig::default());
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[server]\nport = 5000\n\n[capture]\nsuppress_v4 = true\ninterfaces = [\"eth1\"]\n",
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.max_sessions, DEFAULT_MAX_SESSIONS);
        assert_eq!(config.capture.suppression().unwrap(), Suppression::V4);
        assert_eq!(
            config.capture.interface_selection().unwrap(),
            InterfaceSelection::Named(vec!["eth1".to_string()])
        );
    }

    #[test]
    fn test_load_legacy_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"port": 4444, "host": "127.0.0.1", "max_clients": 3, "welcome_message": "hi"}"#,
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 4444);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.max_sessions, 3);
        assert_eq!(config.server.welcome_message, "hi");
    }

    #[test]
    fn test_load_malformed_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server\nport = ").unwrap();

        let err = DaemonConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "port: 1").unwrap();
        assert!(matches!(
            DaemonConfig::load(&path),
            Err(ConfigError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_save_then_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = DaemonConfig::default();
        config.server.welcome_message = "Hello operator".to_string();
        config.capture.all_interfaces = true;
        config.save(&path).unwrap();

        assert_eq!(DaemonConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = DaemonConfig::default();
        config.server.port = 5000;
        config.capture.suppress_v4 = true;
        config.capture.all_interfaces = true;

        config.apply_overrides(ConfigOverrides {
            port: Some(6000),
            suppress_v3: true,
            interfaces: vec!["eth0".to_string()],
            ..Default::default()
        });

        assert_eq!(config.server.port, 6000);
        assert_eq!(config.capture.suppression().unwrap(), Suppression::V3);
        assert_eq!(
            config.capture.interface_selection().unwrap(),
            InterfaceSelection::Named(vec!["eth0".to_string()])
        );
    }

    #[test]
    fn test_empty_overrides_keep_file_values() {
        let mut config = DaemonConfig::default();
        config.capture.suppress_v4 = true;
        config.capture.interfaces = vec!["eth2".to_string()];
        let before = config.clone();

        config.apply_overrides(ConfigOverrides::default());
        assert_eq!(config, before);
    }

    #[test]
    fn test_conflicting_suppression_rejected() {
        let capture = CaptureConfig {
            suppress_v3: true,
            suppress_v4: true,
            all_interfaces: true,
            ..Default::default()
        };
        assert_eq!(capture.validate(), Err(ConfigError::ConflictingSuppression));
    }

    #[test]
    fn test_interface_selection_rules() {
        let both = CaptureConfig {
            all_interfaces: true,
            interfaces: vec!["eth0".to_string()],
            ..Default::default()
        };
        assert_eq!(
            both.interface_selection(),
            Err(ConfigError::ConflictingInterfaceSelection)
        );

        let neither = CaptureConfig::default();
        assert_eq!(
            neither.interface_selection(),
            Err(ConfigError::NoInterfaceSelection)
        );

        let all = CaptureConfig {
            all_interfaces: true,
            ..Default::default()
        };
        assert_eq!(all.interface_selection(), Ok(InterfaceSelection::All));
    }

    #[test]
    fn test_server_validation() {
        let mut server = ServerConfig::default();
        server.max_sessions = 0;
        assert_eq!(server.validate(), Err(ConfigError::InvalidMaxSessions));

        let mut server = ServerConfig::default();
        server.host = "  ".to_string();
        assert_eq!(server.validate(), Err(ConfigError::EmptyHost));
    }
}
