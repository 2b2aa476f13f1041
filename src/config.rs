use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from `lua-console.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub console: ConsoleOptions,

    #[serde(default)]
    pub extensions: Vec<ExtensionConfig>,

    /// Constant tables opened into the session, keyed by namespace name.
    #[serde(default)]
    pub namespaces: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,

    #[serde(default)]
    pub motd: String,

    /// Whether the host authenticates player identities.
    #[serde(default = "default_true")]
    pub online_mode: bool,

    #[serde(default = "default_max_players")]
    pub max_players: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            motd: String::new(),
            online_mode: true,
            max_players: default_max_players(),
        }
    }
}

fn default_server_name() -> String {
    "server".to_string()
}

fn default_max_players() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

/// Session and gateway behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleOptions {
    /// Allow-list file name, relative to the data directory.
    #[serde(default = "default_allow_list_file")]
    pub allow_list_file: String,

    /// Load every safe Lua standard library, `io` and `os` included.
    #[serde(default)]
    pub unrestricted: bool,

    /// Abort an evaluation after this many VM instructions.
    #[serde(default)]
    pub instruction_limit: Option<u32>,

    /// Cap on interpreter memory, in bytes.
    #[serde(default)]
    pub memory_limit: Option<usize>,

    /// Send full diagnostics for unexpected failures back to the caller.
    #[serde(default = "default_true")]
    pub show_traces: bool,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            allow_list_file: default_allow_list_file(),
            unrestricted: false,
            instruction_limit: None,
            memory_limit: None,
            show_traces: true,
        }
    }
}

fn default_allow_list_file() -> String {
    "allowedPlayers.txt".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionConfig {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    /// Binding name inside the session. Derived from `name` when absent.
    #[serde(default)]
    pub class: Option<String>,

    /// A disabled extension is loaded without an instance.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl ExtensionConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {message}")]
    Parse { message: String },
}
