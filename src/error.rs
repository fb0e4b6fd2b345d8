use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("item bank error: {0}")]
    Bank(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("no active item for learner '{0}'; run `sqldrill next` first")]
    NoActiveItem(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// Failures of the grading oracle or the item synthesizer. The engine always
// recovers from these with a deterministic fallback.
#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

// Reasons a synthesized item is rejected before it reaches a learner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("item has no title")]
    MissingTitle,

    #[error("item has no reference answer")]
    MissingAnswer,

    #[error("item has {0} usable choices, need at least 3")]
    TooFewChoices(usize),

    #[error("reference answer is not among the choices")]
    AnswerNotAmongChoices,
}
