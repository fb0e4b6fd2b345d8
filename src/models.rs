use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// How many recently served item ids are remembered per topic.
pub const RECENT_ITEM_WINDOW: usize = 15;

// Choices a multiple-choice question shows.
pub const CHOICE_COUNT: usize = 3;

// The SQL concepts of the curriculum, in teaching order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Select,
    Where,
    OrderBy,
    Aggregate,
    GroupBy,
    Having,
    Join,
    Subquery,
}

impl Topic {
    pub const ALL: [Topic; 8] = [
        Topic::Select,
        Topic::Where,
        Topic::OrderBy,
        Topic::Aggregate,
        Topic::GroupBy,
        Topic::Having,
        Topic::Join,
        Topic::Subquery,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn next(&self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn first() -> Self {
        Self::ALL[0]
    }

    #[cfg(test)]
    pub fn last() -> Self {
        Self::ALL[Self::ALL.len() - 1]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Select => "select",
            Topic::Where => "where",
            Topic::OrderBy => "order_by",
            Topic::Aggregate => "aggregate",
            Topic::GroupBy => "group_by",
            Topic::Having => "having",
            Topic::Join => "join",
            Topic::Subquery => "subquery",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Topic::Select => "SELECT",
            Topic::Where => "WHERE",
            Topic::OrderBy => "ORDER BY",
            Topic::Aggregate => "Aggregate",
            Topic::GroupBy => "GROUP BY",
            Topic::Having => "HAVING",
            Topic::Join => "JOIN",
            Topic::Subquery => "Subquery",
        }
    }

    // Prefix used for item identifiers of this topic.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Topic::Select => "SELECT",
            Topic::Where => "WHERE",
            Topic::OrderBy => "ORDERBY",
            Topic::Aggregate => "AGG",
            Topic::GroupBy => "GROUPBY",
            Topic::Having => "HAVING",
            Topic::Join => "JOIN",
            Topic::Subquery => "SUBQUERY",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        let key: String = s
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .collect();
        match key.as_str() {
            "select" => Some(Topic::Select),
            "where" => Some(Topic::Where),
            "orderby" | "order" | "sort" => Some(Topic::OrderBy),
            "aggregate" | "agg" | "aggregates" => Some(Topic::Aggregate),
            "groupby" | "group" => Some(Topic::GroupBy),
            "having" => Some(Topic::Having),
            "join" | "joins" => Some(Topic::Join),
            "subquery" | "sub" | "subqueries" => Some(Topic::Subquery),
            _ => None,
        }
    }
}

// Answer formats, from recognition to production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    MultipleChoice,
    FillInBlank,
    FreeForm,
    Explanation,
}

impl Format {
    pub const ALL: [Format; 4] = [
        Format::MultipleChoice,
        Format::FillInBlank,
        Format::FreeForm,
        Format::Explanation,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn next(&self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn prev(&self) -> Option<Self> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    pub fn first() -> Self {
        Self::ALL[0]
    }

    #[cfg(test)]
    pub fn last() -> Self {
        Self::ALL[Self::ALL.len() - 1]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::MultipleChoice => "multiple_choice",
            Format::FillInBlank => "fill_in_blank",
            Format::FreeForm => "free_form",
            Format::Explanation => "explanation",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Format::MultipleChoice => "Multiple choice",
            Format::FillInBlank => "Fill in the blank",
            Format::FreeForm => "Free form",
            Format::Explanation => "Explanation",
        }
    }

    pub fn short_label(&self) -> &'static str {
        match self {
            Format::MultipleChoice => "MC",
            Format::FillInBlank => "FIB",
            Format::FreeForm => "FREE",
            Format::Explanation => "EXPL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        let key: String = s
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .collect();
        match key.as_str() {
            "multiplechoice" | "mc" | "choice" => Some(Format::MultipleChoice),
            "fillinblank" | "fillintheblank" | "fib" | "blank" | "fill" => {
                Some(Format::FillInBlank)
            }
            "freeform" | "free" | "written" => Some(Format::FreeForm),
            "explanation" | "explain" | "expl" => Some(Format::Explanation),
            _ => None,
        }
    }
}

// One square of the Topic x Format grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub topic: Topic,
    pub format: Format,
}

impl Cell {
    pub fn new(topic: Topic, format: Format) -> Self {
        Self { topic, format }
    }

    pub fn first() -> Self {
        Self::new(Topic::first(), Format::first())
    }

    #[cfg(test)]
    pub fn last() -> Self {
        Self::new(Topic::last(), Format::last())
    }

    // Parses user or storage supplied names. Anything outside the
    // curriculum is a caller error.
    pub fn parse(topic: &str, format: &str) -> crate::error::Result<Self> {
        let t = Topic::from_str(topic).ok_or_else(|| {
            crate::error::Error::InvariantViolation(format!("unknown topic '{}'", topic))
        })?;
        let f = Format::from_str(format).ok_or_else(|| {
            crate::error::Error::InvariantViolation(format!("unknown format '{}'", format))
        })?;
        Ok(Self::new(t, f))
    }

    pub fn label(&self) -> String {
        format!("{} / {}", self.topic.label(), self.format.label())
    }

    pub fn all() -> impl Iterator<Item = Cell> {
        Topic::ALL
            .into_iter()
            .flat_map(|t| Format::ALL.into_iter().map(move |f| Cell::new(t, f)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Correct,
    Partial,
    Incorrect,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Correct => "correct",
            Outcome::Partial => "partial",
            Outcome::Incorrect => "incorrect",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Correct => "Correct",
            Outcome::Partial => "Partially correct",
            Outcome::Incorrect => "Incorrect",
        }
    }

    // Only a full Correct counts toward window accuracy.
    pub fn is_correct(&self) -> bool {
        matches!(self, Outcome::Correct)
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "correct" | "c" | "ok" | "pass" => Some(Outcome::Correct),
            "partial" | "p" => Some(Outcome::Partial),
            "incorrect" | "i" | "wrong" | "fail" => Some(Outcome::Incorrect),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

// A practice question. Static items come from the bank, synthesized ones
// carry a generated id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub topic: Topic,
    pub title: String,
    pub answer_sql: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default)]
    pub blank_template: Option<String>,
    #[serde(default)]
    pub blank_answer: Option<String>,
}

impl Item {
    #[cfg(test)]
    pub fn is_synthesized(&self) -> bool {
        self.id.contains("_GEN_")
    }

    pub fn usable_choices(&self) -> Vec<&str> {
        self.choices
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect()
    }

    // The multiple-choice variant only exists with a full set of choices.
    // Otherwise the item is asked and graded as free-form.
    pub fn choice_options(&self) -> Option<Vec<&str>> {
        let choices = self.usable_choices();
        (choices.len() >= CHOICE_COUNT).then_some(choices)
    }

    // The blank-filling variant only exists when both halves are present.
    pub fn blank(&self) -> Option<(&str, &str)> {
        match (&self.blank_template, &self.blank_answer) {
            (Some(t), Some(a)) if !t.trim().is_empty() && !a.trim().is_empty() => {
                Some((t.as_str(), a.as_str()))
            }
            _ => None,
        }
    }
}

// Adaptive items move the learner through the grid; practice items are
// logged but never counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Adaptive,
    Practice,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Adaptive => "adaptive",
            Mode::Practice => "practice",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "adaptive" => Some(Mode::Adaptive),
            "practice" => Some(Mode::Practice),
            _ => None,
        }
    }
}

// The item a learner is currently answering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveItem {
    pub format: Format,
    pub item: Item,
    pub mode: Mode,
}

// A graded answer as recorded in the attempt log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: i64,
    pub learner: String,
    pub topic: Topic,
    pub format: Format,
    pub item_id: Option<String>,
    pub answer: String,
    pub outcome: Outcome,
    pub feedback: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graded {
    pub outcome: Outcome,
    pub feedback: String,
}

impl Graded {
    pub fn new(outcome: Outcome, feedback: impl Into<String>) -> Self {
        Self {
            outcome,
            feedback: feedback.into(),
        }
    }
}

// Accuracy over a window of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccuracyWindow {
    pub total: u32,
    pub correct: u32,
    pub accuracy_percent: f64,
}

impl AccuracyWindow {
    // None when there is nothing to measure, which is different from 0%.
    pub fn from_outcomes<I: IntoIterator<Item = Outcome>>(outcomes: I) -> Option<Self> {
        let (total, correct) = outcomes.into_iter().fold((0u32, 0u32), |(t, c), o| {
            (t + 1, if o.is_correct() { c + 1 } else { c })
        });
        if total == 0 {
            return None;
        }
        Some(Self {
            total,
            correct,
            accuracy_percent: percent(correct, total),
        })
    }
}

// correct/total as a percentage, rounded half away from zero to one decimal.
pub fn percent(correct: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (correct as f64 * 1000.0 / total as f64).round() / 10.0
}

// Per-learner position in the curriculum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressionState {
    pub current_topic: Topic,
    pub current_format: Format,
    pub format_attempt_count: u32,
    pub format_window_start: DateTime<Utc>,
    pub completed: BTreeSet<Cell>,
    pub recent_item_ids: BTreeMap<Topic, VecDeque<String>>,
    #[serde(default)]
    pub curriculum_complete: bool,
}

impl ProgressionState {
    pub fn new(now: DateTime<Utc>) -> Self {
        let mut completed = BTreeSet::new();
        // The first cell of a fresh topic is navigable from the start.
        completed.insert(Cell::first());
        Self {
            current_topic: Topic::first(),
            current_format: Format::first(),
            format_attempt_count: 0,
            format_window_start: now,
            completed,
            recent_item_ids: BTreeMap::new(),
            curriculum_complete: false,
        }
    }

    pub fn cell(&self) -> Cell {
        Cell::new(self.current_topic, self.current_format)
    }

    // Moves to `cell` and opens a fresh observation window there.
    pub fn enter(&mut self, cell: Cell, now: DateTime<Utc>) {
        self.current_topic = cell.topic;
        self.current_format = cell.format;
        self.reset_window(now);
    }

    pub fn reset_window(&mut self, now: DateTime<Utc>) {
        self.format_attempt_count = 0;
        self.format_window_start = now;
    }

    pub fn mark_completed(&mut self, cell: Cell) -> bool {
        self.completed.insert(cell)
    }

    #[cfg(test)]
    pub fn is_completed(&self, cell: Cell) -> bool {
        self.completed.contains(&cell)
    }

    #[cfg(test)]
    pub fn recent_for(&self, topic: Topic) -> Vec<&str> {
        self.recent_item_ids
            .get(&topic)
            .map(|ids| ids.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn is_recent(&self, topic: Topic, item_id: &str) -> bool {
        self.recent_item_ids
            .get(&topic)
            .is_some_and(|ids| ids.iter().any(|id| id == item_id))
    }

    pub fn remember_item(&mut self, topic: Topic, item_id: &str) {
        let ids = self.recent_item_ids.entry(topic).or_default();
        ids.push_back(item_id.to_string());
        while ids.len() > RECENT_ITEM_WINDOW {
            ids.pop_front();
        }
    }

    pub fn clear_recent(&mut self, topic: Topic) {
        if let Some(ids) = self.recent_item_ids.get_mut(&topic) {
            ids.clear();
        }
    }
}

// Result of evaluating a full observation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    Advance { from: Cell, to: Cell },
    Hold { cell: Cell },
    Regress { from: Cell, to: Cell },
    NextTopic { from: Cell, to: Cell },
    CurriculumComplete { from: Cell },
}

impl Transition {
    // The cell the learner ends up in, if any remains.
    #[cfg(test)]
    pub fn target(&self) -> Option<Cell> {
        match self {
            Transition::Advance { to, .. }
            | Transition::Regress { to, .. }
            | Transition::NextTopic { to, .. } => Some(*to),
            Transition::Hold { cell } => Some(*cell),
            Transition::CurriculumComplete { .. } => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Transition::Advance { from, to } => format!(
                "Advanced from {} to {}",
                from.format.label(),
                to.format.label()
            ),
            Transition::Hold { cell } => format!("Staying on {} for another round", cell.label()),
            Transition::Regress { from, to } if from == to => {
                format!("Repeating {}", to.label())
            }
            Transition::Regress { from, to } => format!(
                "Stepping back from {} to {}",
                from.format.label(),
                to.format.label()
            ),
            Transition::NextTopic { from, to } => format!(
                "{} mastered, moving on to {}",
                from.topic.label(),
                to.topic.label()
            ),
            Transition::CurriculumComplete { .. } => "Curriculum complete".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverallStats {
    pub total: u32,
    pub correct: u32,
    pub partial: u32,
    pub incorrect: u32,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellStats {
    pub topic: Topic,
    pub format: Format,
    pub total: u32,
    pub correct: u32,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeakPoint {
    pub topic: Topic,
    pub total: u32,
    pub correct: u32,
    pub accuracy: f64,
}

// JSON output wrapper for CLI
#[derive(Debug, Serialize)]
pub struct JsonOutput<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> JsonOutput<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}
