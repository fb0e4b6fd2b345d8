use chrono::{DateTime, Utc};

use crate::error::{ExternalError, Result};
use crate::models::{Attempt, Difficulty, Format, Graded, Item, Outcome, ProgressionState, Topic};

pub trait GradingOracle {
    fn grade(&self, answer: &str, item: &Item, format: Format) -> std::result::Result<Graded, ExternalError>;
}

pub trait ItemRepository {
    fn items_for(&self, topic: Topic) -> Vec<Item>;

    fn all_items(&self) -> Vec<Item>;
}

// Generates a fresh, unvalidated candidate item for a topic.
pub trait ItemSynthesizer {
    fn synthesize(
        &self,
        topic: Topic,
        reference: Option<&str>,
        difficulty: Difficulty,
    ) -> std::result::Result<Item, ExternalError>;
}

#[derive(Debug, Clone)]
pub struct NewAttempt<'a> {
    pub learner: &'a str,
    pub topic: Topic,
    pub format: Format,
    pub item_id: Option<&'a str>,
    pub answer: &'a str,
    pub outcome: Outcome,
    pub feedback: &'a str,
    pub recorded_at: DateTime<Utc>,
}

// Append-only log of graded attempts.
pub trait AttemptLog {
    fn record(&self, attempt: &NewAttempt<'_>) -> Result<i64>;

    /// Most recent first. `limit = None` returns the whole history for the cell.
    fn recent(
        &self,
        learner: &str,
        topic: Topic,
        format: Format,
        limit: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Attempt>>;

    // The latest answer the learner got wrong on a topic, in any format.
    fn last_incorrect_answer(&self, learner: &str, topic: Topic) -> Result<Option<String>>;
}

pub trait ProgressStore {
    fn load(&self, learner: &str) -> Result<Option<ProgressionState>>;
    fn save(&self, learner: &str, state: &ProgressionState) -> Result<()>;
}
