use rmcp::schemars::{self, JsonSchema};
use serde::Deserialize;

use crate::security::{parse_player_id, Invoker, SourceKind, Validatable, ValidationError};

/// Request parameters for the eval tool, as forwarded by the host's
/// command dispatcher.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct EvalRequest {
    /// The Lua code to evaluate
    pub code: String,

    /// Where the command was issued from
    pub source: SourceKind,

    /// UUID of the invoking player. Required when source is "player".
    #[serde(default)]
    pub player_id: Option<String>,

    /// Display name of the invoking player
    #[serde(default)]
    pub player_name: Option<String>,
}

impl Validatable for EvalRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.source == SourceKind::Player {
            let id = self
                .player_id
                .as_deref()
                .ok_or(ValidationError::MissingPlayerId)?;
            parse_player_id(id)?;
        }
        Ok(())
    }
}

impl EvalRequest {
    /// The identity this request runs as
    pub fn invoker(&self) -> Result<Invoker, ValidationError> {
        Ok(match self.source {
            SourceKind::Console => Invoker::Console,
            SourceKind::CommandBlock => Invoker::CommandBlock,
            SourceKind::Rcon => Invoker::Rcon,
            SourceKind::Player => {
                let id = self
                    .player_id
                    .as_deref()
                    .ok_or(ValidationError::MissingPlayerId)?;
                Invoker::Player {
                    id: parse_player_id(id)?,
                    name: self.player_name.clone(),
                }
            }
        })
    }
}
