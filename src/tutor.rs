use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::db::Database;
use crate::engine::{MasteryEngine, NextItem, Served, Submission};
use crate::error::{Error, Result};
use crate::models::{ActiveItem, Cell, Format, Item, Mode, ProgressionState};
use crate::ports::ProgressStore;

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub learner: String,
    pub cell: Cell,
    pub format_attempt_count: u32,
    pub threshold: u32,
    pub format_window_start: DateTime<Utc>,
    pub curriculum_complete: bool,
    pub completed: Vec<Cell>,
    pub active_item: Option<ActiveItem>,
}

// One learner's session: loads the progression state, runs the engine,
// and stores the result along with the item being answered.
pub struct Tutor<'a> {
    db: &'a Database,
    engine: MasteryEngine<'a>,
    learner: String,
}

impl<'a> Tutor<'a> {
    pub fn new(db: &'a Database, engine: MasteryEngine<'a>, learner: impl Into<String>) -> Self {
        Self {
            db,
            engine,
            learner: learner.into(),
        }
    }

    pub fn learner(&self) -> &str {
        &self.learner
    }

    pub fn db(&self) -> &'a Database {
        self.db
    }

    // Unknown learners start at the beginning of the curriculum.
    pub fn state(&self, now: DateTime<Utc>) -> Result<ProgressionState> {
        Ok(self
            .db
            .load(&self.learner)?
            .unwrap_or_else(|| ProgressionState::new(now)))
    }

    pub fn active_item(&self) -> Result<Option<ActiveItem>> {
        self.db.active_item(&self.learner)
    }

    pub fn status(&self, now: DateTime<Utc>) -> Result<Status> {
        let state = self.state(now)?;
        Ok(Status {
            learner: self.learner.clone(),
            cell: state.cell(),
            format_attempt_count: state.format_attempt_count,
            threshold: self.engine.threshold(state.current_format),
            format_window_start: state.format_window_start,
            curriculum_complete: state.curriculum_complete,
            completed: state.completed.iter().copied().collect(),
            active_item: self.active_item()?,
        })
    }

    pub fn next(&mut self, now: DateTime<Utc>) -> Result<NextItem> {
        let mut state = self.state(now)?;
        let next = self.engine.next_item(&self.learner, &mut state, now)?;
        self.db.save(&self.learner, &state)?;

        match &next {
            NextItem::Serve(served) => self.serve(served, Mode::Adaptive, now)?,
            NextItem::CurriculumComplete { .. } => self.db.clear_active_item(&self.learner)?,
        }
        Ok(next)
    }

    // Free practice in any cell; answers are logged but the learner stays put.
    pub fn practice(&mut self, topic: &str, format: &str, now: DateTime<Utc>) -> Result<Served> {
        let cell = Cell::parse(topic, format)?;
        let mut state = self.state(now)?;
        let served = self.engine.practice_item(&mut state, cell)?;
        self.db.save(&self.learner, &state)?;
        self.serve(&served, Mode::Practice, now)?;
        Ok(served)
    }

    fn serve(&self, served: &Served, mode: Mode, now: DateTime<Utc>) -> Result<()> {
        let active = ActiveItem {
            format: served.cell.format,
            item: served.item.clone(),
            mode,
        };
        self.db.set_active_item(&self.learner, &active, now)
    }

    /// Grades `raw` against the active item. Each item takes one answer.
    pub fn answer(&mut self, raw: &str, now: DateTime<Utc>) -> Result<Submission> {
        let active = self
            .active_item()?
            .ok_or_else(|| Error::NoActiveItem(self.learner.clone()))?;

        let answer = match active.format {
            Format::MultipleChoice => resolve_choice(&active.item, raw),
            _ => raw.to_string(),
        };
        let cell = Cell::new(active.item.topic, active.format);

        let submission = match active.mode {
            Mode::Adaptive => {
                let mut state = self.state(now)?;
                let submission =
                    self.engine
                        .submit(&self.learner, &mut state, cell, &active.item, &answer, now)?;
                self.db.save(&self.learner, &state)?;
                submission
            }
            Mode::Practice => {
                self.engine
                    .submit_practice(&self.learner, cell, &active.item, &answer, now)?
            }
        };
        self.db.clear_active_item(&self.learner)?;
        Ok(submission)
    }

    pub fn jump(&mut self, topic: &str, format: &str, now: DateTime<Utc>) -> Result<Cell> {
        let cell = Cell::parse(topic, format)?;
        let mut state = self.state(now)?;
        self.engine.jump_to(&mut state, cell, now);
        self.db.save(&self.learner, &state)?;
        self.db.clear_active_item(&self.learner)?;
        Ok(cell)
    }

    pub fn reset(&mut self) -> Result<bool> {
        let existed = self.db.delete_state(&self.learner)?;
        debug!(learner = %self.learner, existed, "progression reset");
        Ok(existed)
    }
}

// A bare 1-based number picks that choice; anything else is the answer itself.
// Items without a full set of choices are answered as free-form.
pub fn resolve_choice(item: &Item, raw: &str) -> String {
    let Some(choices) = item.choice_options() else {
        return raw.to_string();
    };
    match raw.trim().parse::<usize>() {
        Ok(n) if (1..=choices.len()).contains(&n) => choices[n - 1].to_string(),
        _ => raw.to_string(),
    }
}
