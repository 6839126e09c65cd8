use thiserror::Error;

/// Failure taxonomy for the forecasting core.
///
/// `DataInsufficiency` and `ExternalJoinGap` are recoverable at the row level;
/// the rest reject a request or abort a batch.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("insufficient history for player {player_id}: {detail}")]
    DataInsufficiency { player_id: i64, detail: String },

    #[error("no trained model artifact matches prefix {prefix:?} in {dir}")]
    MissingArtifact { prefix: String, dir: String },

    #[error("no opposing team-game row for game {game_id}")]
    ExternalJoinGap { game_id: String },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("required column {name:?} absent from feature table")]
    MissingColumn { name: String },

    #[error("only {have} distinct training dates, need at least {need}")]
    MinTrainingDates { have: usize, need: usize },
}

impl EngineError {
    /// Row-local failures that callers recover from by dropping the row.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::DataInsufficiency { .. } | EngineError::ExternalJoinGap { .. }
        )
    }
}
