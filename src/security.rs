use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use rmcp::schemars::{self, JsonSchema};
use serde::Deserialize;
use tracing::{error, info};
use uuid::Uuid;

/// Where a command invocation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// The server console
    Console,
    /// A connected player
    Player,
    /// A command block or other in-world automation
    CommandBlock,
    /// A remote console connection
    Rcon,
}

/// The identity a command runs as
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invoker {
    Console,
    Player { id: Uuid, name: Option<String> },
    CommandBlock,
    Rcon,
}

impl Invoker {
    pub fn kind(&self) -> SourceKind {
        match self {
            Invoker::Console => SourceKind::Console,
            Invoker::Player { .. } => SourceKind::Player,
            Invoker::CommandBlock => SourceKind::CommandBlock,
            Invoker::Rcon => SourceKind::Rcon,
        }
    }

    /// Stable identity token matched against the allow-list.
    pub fn identity_token(&self) -> Option<String> {
        match self {
            Invoker::Player { id, .. } => Some(id.hyphenated().to_string()),
            _ => None,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Invoker::Console => "Console".to_string(),
            Invoker::Player { id, name } => name.clone().unwrap_or_else(|| id.to_string()),
            Invoker::CommandBlock => "@".to_string(),
            Invoker::Rcon => "Rcon".to_string(),
        }
    }
}

/// File of player ids allowed to evaluate code, one per line.
///
/// Kept apart from the host's own permission system: access to that should
/// not imply control of the machine.
#[derive(Debug, Clone)]
pub struct AllowList {
    path: PathBuf,
}

impl AllowList {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file (and its directory) if it does not exist yet.
    pub fn ensure_exists(&self) -> io::Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        info!("No {} found; creating one.", self.file_name());
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        Ok(())
    }

    /// Read the file fresh and look for an exact full-line match.
    pub fn contains(&self, token: &str) -> io::Result<bool> {
        let reader = BufReader::new(File::open(&self.path)?);
        for line in reader.lines() {
            if line? == token {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Decide whether `invoker` may evaluate code.
///
/// Console is always allowed. Command blocks and remote consoles are never
/// allowed. Players are allowed iff their id is listed; read failures deny.
pub fn is_authorized(allow_list: &AllowList, invoker: &Invoker) -> bool {
    match invoker {
        Invoker::Console => true,
        Invoker::CommandBlock | Invoker::Rcon => false,
        Invoker::Player { .. } => {
            let Some(token) = invoker.identity_token() else {
                return false;
            };
            match allow_list.contains(&token) {
                Ok(allowed) => allowed,
                Err(e) => {
                    error!(
                        "Failed to read allow-list {}: {e}",
                        allow_list.path().display()
                    );
                    false
                }
            }
        }
    }
}

/// Validation error types
#[derive(Debug, PartialEq)]
pub enum ValidationError {
    MissingPlayerId,
    InvalidPlayerId(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::MissingPlayerId => {
                write!(f, "Error: player_id is required when source is 'player'")
            }
            ValidationError::InvalidPlayerId(id) => {
                write!(f, "Error: '{}' is not a valid player UUID", id)
            }
        }
    }
}

/// Trait for request types that need validation before execution
pub trait Validatable {
    /// Validate the request, returning an error if invalid
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Parse a player id as sent by the host
pub fn parse_player_id(id: &str) -> Result<Uuid, ValidationError> {
    Uuid::parse_str(id).map_err(|_| ValidationError::InvalidPlayerId(id.to_string()))
}
