use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, ValidationError};
use crate::grading::{grade_locally, normalize_answer};
use crate::models::{
    AccuracyWindow, Cell, Difficulty, CHOICE_COUNT, Format, Graded, Item, Outcome, ProgressionState, Topic,
    Transition,
};
use crate::ports::{AttemptLog, GradingOracle, ItemRepository, ItemSynthesizer, NewAttempt};

const ADVANCE_ACCURACY: f64 = 80.0;
const HOLD_ACCURACY: f64 = 70.0;
const EXPLANATION_PASS_ACCURACY: f64 = 70.0;

pub fn attempt_threshold(format: Format, test_mode: bool) -> u32 {
    if test_mode {
        return 2;
    }
    match format {
        Format::FreeForm | Format::Explanation => 3,
        Format::MultipleChoice | Format::FillInBlank => 5,
    }
}

/// The transition for a full window at `accuracy` percent. Pure.
pub fn decide(cell: Cell, accuracy: f64) -> Transition {
    if cell.format == Format::Explanation {
        if accuracy >= EXPLANATION_PASS_ACCURACY {
            return match cell.topic.next() {
                Some(topic) => Transition::NextTopic {
                    from: cell,
                    to: Cell::new(topic, Format::first()),
                },
                None => Transition::CurriculumComplete { from: cell },
            };
        }
        // Failed explanations go back to written practice, not one step.
        return Transition::Regress {
            from: cell,
            to: Cell::new(cell.topic, Format::FreeForm),
        };
    }

    if accuracy >= ADVANCE_ACCURACY {
        match cell.format.next() {
            Some(format) => Transition::Advance {
                from: cell,
                to: Cell::new(cell.topic, format),
            },
            None => Transition::Hold { cell },
        }
    } else if accuracy >= HOLD_ACCURACY {
        Transition::Hold { cell }
    } else {
        let format = cell.format.prev().unwrap_or(cell.format);
        Transition::Regress {
            from: cell,
            to: Cell::new(cell.topic, format),
        }
    }
}

pub fn validate_item(item: &Item) -> std::result::Result<(), ValidationError> {
    if item.title.trim().is_empty() {
        return Err(ValidationError::MissingTitle);
    }
    if item.answer_sql.trim().is_empty() {
        return Err(ValidationError::MissingAnswer);
    }
    let choices = item.usable_choices();
    if choices.len() < CHOICE_COUNT {
        return Err(ValidationError::TooFewChoices(choices.len()));
    }
    let answer = normalize_answer(&item.answer_sql);
    if !choices.iter().any(|c| normalize_answer(c) == answer) {
        return Err(ValidationError::AnswerNotAmongChoices);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub test_mode: bool,
    pub synthesis_enabled: bool,
    pub weak_accuracy_threshold: f64,
    pub max_synthesis_retries: u32,
    pub difficulty: Difficulty,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            test_mode: false,
            synthesis_enabled: true,
            weak_accuracy_threshold: 60.0,
            max_synthesis_retries: 3,
            difficulty: Difficulty::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSource {
    Static,
    Synthesized,
    // Drawn from another topic because the requested one has no items.
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct Selected {
    pub item: Item,
    pub source: ItemSource,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Served {
    pub cell: Cell,
    pub item: Item,
    pub source: ItemSource,
    pub transition: Option<Transition>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NextItem {
    Serve(Served),
    CurriculumComplete { transition: Option<Transition> },
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub attempt_id: i64,
    pub cell: Cell,
    pub outcome: Outcome,
    pub feedback: String,
    // Whether the answer counted toward the learner's current window.
    pub counted: bool,
    pub graded_locally: bool,
}

pub struct MasteryEngine<'a> {
    log: &'a dyn AttemptLog,
    repo: &'a dyn ItemRepository,
    oracle: &'a dyn GradingOracle,
    synthesizer: Option<&'a dyn ItemSynthesizer>,
    settings: EngineSettings,
    rng: StdRng,
}

impl<'a> MasteryEngine<'a> {
    pub fn new(
        log: &'a dyn AttemptLog,
        repo: &'a dyn ItemRepository,
        oracle: &'a dyn GradingOracle,
        settings: EngineSettings,
    ) -> Self {
        Self {
            log,
            repo,
            oracle,
            synthesizer: None,
            settings,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_synthesizer(mut self, synthesizer: &'a dyn ItemSynthesizer) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    #[cfg(test)]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn threshold(&self, format: Format) -> u32 {
        attempt_threshold(format, self.settings.test_mode)
    }

    /// Accuracy over the latest `window` attempts in a cell (all of them
    /// when `window` is None), optionally only those at or after `since`.
    pub fn recent_accuracy(
        &self,
        learner: &str,
        topic: Topic,
        format: Format,
        window: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<AccuracyWindow>> {
        let attempts = self.log.recent(learner, topic, format, window, since)?;
        Ok(AccuracyWindow::from_outcomes(
            attempts.iter().map(|a| a.outcome),
        ))
    }

    /// Judges the current window and applies the resulting transition.
    /// Returns None while the window is not yet full.
    pub fn evaluate(
        &self,
        learner: &str,
        state: &mut ProgressionState,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>> {
        let cell = state.cell();
        let threshold = self.threshold(cell.format);

        if state.format_attempt_count < threshold {
            debug!(
                cell = %cell.label(),
                count = state.format_attempt_count,
                threshold,
                "window not full"
            );
            return Ok(None);
        }

        let window = self.recent_accuracy(
            learner,
            cell.topic,
            cell.format,
            Some(threshold as usize),
            Some(state.format_window_start),
        )?;
        let window = match window {
            Some(w) if w.total >= threshold => w,
            other => {
                debug!(
                    cell = %cell.label(),
                    logged = other.map(|w| w.total).unwrap_or(0),
                    threshold,
                    "attempt log does not cover the window yet"
                );
                return Ok(None);
            }
        };

        let transition = decide(cell, window.accuracy_percent);
        info!(
            learner,
            cell = %cell.label(),
            total = window.total,
            correct = window.correct,
            accuracy = window.accuracy_percent,
            transition = %transition.describe(),
            "window evaluated"
        );
        apply(state, transition, now);
        Ok(Some(transition))
    }

    // Picks an unseen static item for `topic`, clearing the avoidance window
    // when every item has been served recently.
    pub fn select_item(&mut self, state: &mut ProgressionState, topic: Topic) -> Result<Selected> {
        let pool = self.repo.items_for(topic);

        if pool.is_empty() {
            let all = self.repo.all_items();
            let item = all
                .choose(&mut self.rng)
                .cloned()
                .ok_or_else(|| Error::Bank("item bank is empty".to_string()))?;
            let warning = format!(
                "no items for {}; serving {} from {} instead",
                topic.label(),
                item.id,
                item.topic.label()
            );
            warn!(topic = topic.as_str(), item = %item.id, "repository exhausted for topic");
            return Ok(Selected {
                item,
                source: ItemSource::Fallback,
                warning: Some(warning),
            });
        }

        let mut candidates: Vec<&Item> = pool
            .iter()
            .filter(|i| !state.is_recent(topic, &i.id))
            .collect();
        if candidates.is_empty() {
            debug!(topic = topic.as_str(), pool = pool.len(), "all items seen recently, clearing window");
            state.clear_recent(topic);
            candidates = pool.iter().collect();
        }

        // Non-empty: the pool itself is non-empty.
        let item = match candidates.choose(&mut self.rng) {
            Some(item) => (*item).clone(),
            None => return Err(Error::Bank(format!("no items for {}", topic.label()))),
        };
        state.remember_item(topic, &item.id);
        debug!(topic = topic.as_str(), item = %item.id, "selected static item");

        Ok(Selected {
            item,
            source: ItemSource::Static,
            warning: None,
        })
    }

    pub fn synthesize_item(
        &self,
        topic: Topic,
        reference: Option<&str>,
        difficulty: Difficulty,
        max_retries: u32,
    ) -> Option<Item> {
        let synthesizer = self.synthesizer?;

        for attempt in 1..=max_retries {
            let candidate = match synthesizer.synthesize(topic, reference, difficulty) {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(topic = topic.as_str(), attempt, error = %e, "synthesizer failed");
                    continue;
                }
            };
            if candidate.topic != topic {
                warn!(
                    topic = topic.as_str(),
                    attempt,
                    got = candidate.topic.as_str(),
                    "synthesized item has the wrong topic"
                );
                continue;
            }
            match validate_item(&candidate) {
                Ok(()) => {
                    info!(topic = topic.as_str(), attempt, item = %candidate.id, "synthesized item accepted");
                    return Some(candidate);
                }
                Err(e) => {
                    warn!(topic = topic.as_str(), attempt, error = %e, "synthesized item rejected");
                }
            }
        }

        warn!(topic = topic.as_str(), max_retries, "synthesis gave up, using static pool");
        None
    }

    /// Grades and logs an answer to `item` in `cell`.
    pub fn submit(
        &self,
        learner: &str,
        state: &mut ProgressionState,
        cell: Cell,
        item: &Item,
        answer: &str,
        now: DateTime<Utc>,
    ) -> Result<Submission> {
        let (attempt_id, graded, graded_locally) = self.record(learner, cell, item, answer, now)?;

        let counted = cell == state.cell() && !state.curriculum_complete;
        if counted {
            state.format_attempt_count += 1;
        }
        debug!(
            learner,
            cell = %cell.label(),
            outcome = graded.outcome.as_str(),
            counted,
            count = state.format_attempt_count,
            "answer recorded"
        );

        Ok(Submission {
            attempt_id,
            cell,
            outcome: graded.outcome,
            feedback: graded.feedback,
            counted,
            graded_locally,
        })
    }

    /// Grades and logs a free-practice answer. Progression is left alone,
    /// even when `cell` is the learner's current cell.
    pub fn submit_practice(
        &self,
        learner: &str,
        cell: Cell,
        item: &Item,
        answer: &str,
        now: DateTime<Utc>,
    ) -> Result<Submission> {
        let (attempt_id, graded, graded_locally) = self.record(learner, cell, item, answer, now)?;
        debug!(
            learner,
            cell = %cell.label(),
            outcome = graded.outcome.as_str(),
            "practice answer recorded"
        );

        Ok(Submission {
            attempt_id,
            cell,
            outcome: graded.outcome,
            feedback: graded.feedback,
            counted: false,
            graded_locally,
        })
    }

    fn record(
        &self,
        learner: &str,
        cell: Cell,
        item: &Item,
        answer: &str,
        now: DateTime<Utc>,
    ) -> Result<(i64, Graded, bool)> {
        if item.topic != cell.topic {
            return Err(Error::InvariantViolation(format!(
                "item {} belongs to {}, not {}",
                item.id,
                item.topic.label(),
                cell.topic.label()
            )));
        }

        let (graded, graded_locally) = self.grade(answer, item, cell.format);
        let attempt_id = self.log.record(&NewAttempt {
            learner,
            topic: cell.topic,
            format: cell.format,
            item_id: Some(&item.id),
            answer,
            outcome: graded.outcome,
            feedback: &graded.feedback,
            recorded_at: now,
        })?;
        Ok((attempt_id, graded, graded_locally))
    }

    fn grade(&self, answer: &str, item: &Item, format: Format) -> (Graded, bool) {
        if answer.trim().is_empty() {
            return (grade_locally(answer, item, format), true);
        }
        match self.oracle.grade(answer, item, format) {
            Ok(graded) => (graded, false),
            Err(e) => {
                warn!(item = %item.id, error = %e, "grading oracle failed, using string match");
                (grade_locally(answer, item, format), true)
            }
        }
    }

    pub fn next_item(
        &mut self,
        learner: &str,
        state: &mut ProgressionState,
        now: DateTime<Utc>,
    ) -> Result<NextItem> {
        if state.curriculum_complete {
            return Ok(NextItem::CurriculumComplete { transition: None });
        }

        let transition = self.evaluate(learner, state, now)?;
        if state.curriculum_complete {
            info!(learner, "curriculum complete");
            return Ok(NextItem::CurriculumComplete { transition });
        }

        let cell = state.cell();
        let selected = match self.try_synthesis(learner, state, cell)? {
            Some(item) => {
                state.remember_item(cell.topic, &item.id);
                Selected {
                    item,
                    source: ItemSource::Synthesized,
                    warning: None,
                }
            }
            None => self.select_item(state, cell.topic)?,
        };

        Ok(NextItem::Serve(Served {
            cell,
            item: selected.item,
            source: selected.source,
            transition,
            warning: selected.warning,
        }))
    }

    /// Serves an item for a freely chosen cell. Only the repeat-avoidance
    /// window is updated; position, window and completed cells stay as they are.
    pub fn practice_item(&mut self, state: &mut ProgressionState, cell: Cell) -> Result<Served> {
        let selected = self.select_item(state, cell.topic)?;
        debug!(cell = %cell.label(), item = %selected.item.id, "serving practice item");
        Ok(Served {
            cell: Cell::new(selected.item.topic, cell.format),
            item: selected.item,
            source: selected.source,
            transition: None,
            warning: selected.warning,
        })
    }

    // Synthesis only kicks in for weak learners who have seen every static item.
    fn try_synthesis(
        &self,
        learner: &str,
        state: &ProgressionState,
        cell: Cell,
    ) -> Result<Option<Item>> {
        if !self.settings.synthesis_enabled || self.synthesizer.is_none() {
            return Ok(None);
        }

        let exhausted = self
            .repo
            .items_for(cell.topic)
            .iter()
            .all(|i| state.is_recent(cell.topic, &i.id));
        if !exhausted {
            return Ok(None);
        }

        let overall = self.recent_accuracy(learner, cell.topic, cell.format, None, None)?;
        let weak = overall.is_some_and(|w| w.accuracy_percent < self.settings.weak_accuracy_threshold);
        if !weak {
            return Ok(None);
        }

        let reference = self.log.last_incorrect_answer(learner, cell.topic)?;
        debug!(
            cell = %cell.label(),
            accuracy = overall.map(|w| w.accuracy_percent),
            "static pool exhausted for weak learner, synthesizing"
        );
        Ok(self.synthesize_item(
            cell.topic,
            reference.as_deref(),
            self.settings.difficulty,
            self.settings.max_synthesis_retries,
        ))
    }

    pub fn jump_to(&self, state: &mut ProgressionState, cell: Cell, now: DateTime<Utc>) {
        state.enter(cell, now);
        state.mark_completed(cell);
        state.curriculum_complete = false;
        info!(cell = %cell.label(), "jumped");
    }
}

// Every transition resets the window. Passed cells are marked completed,
// as is the first cell of a newly entered topic.
fn apply(state: &mut ProgressionState, transition: Transition, now: DateTime<Utc>) {
    match transition {
        Transition::Advance { from, to } => {
            state.mark_completed(from);
            state.enter(to, now);
        }
        Transition::Hold { .. } => state.reset_window(now),
        Transition::Regress { to, .. } => state.enter(to, now),
        Transition::NextTopic { from, to } => {
            state.mark_completed(from);
            state.enter(to, now);
            state.mark_completed(to);
        }
        Transition::CurriculumComplete { from } => {
            state.mark_completed(from);
            state.reset_window(now);
            state.curriculum_complete = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::ItemBank;
    use crate::db::Database;
    use crate::error::ExternalError;
    use crate::grading::StringMatchGrader;
    use chrono::{Duration, TimeZone};
    use std::cell::Cell as Counter;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(secs)
    }

    fn setup_db() -> Database {
        let db = Database::open(":memory:").expect("Failed to create in-memory database");
        db.init().expect("Failed to initialize database");
        db
    }

    fn item(id: &str, topic: Topic) -> Item {
        Item {
            id: id.to_string(),
            topic,
            title: format!("Question {}", id),
            answer_sql: "SELECT a FROM t;".to_string(),
            explanation: "Returns column a".to_string(),
            choices: vec![
                "SELECT a FROM t;".to_string(),
                "SELECT b FROM t;".to_string(),
                "SELECT c FROM t;".to_string(),
            ],
            blank_template: None,
            blank_answer: None,
        }
    }

    // "right" is correct, "meh" partial, anything else incorrect.
    struct ScriptedOracle;

    impl GradingOracle for ScriptedOracle {
        fn grade(
            &self,
            answer: &str,
            _item: &Item,
            _format: Format,
        ) -> std::result::Result<Graded, ExternalError> {
            Ok(match answer {
                "right" => Graded::new(Outcome::Correct, "ok"),
                "meh" => Graded::new(Outcome::Partial, "almost"),
                _ => Graded::new(Outcome::Incorrect, "no"),
            })
        }
    }

    struct DownOracle;

    impl GradingOracle for DownOracle {
        fn grade(
            &self,
            _answer: &str,
            _item: &Item,
            _format: Format,
        ) -> std::result::Result<Graded, ExternalError> {
            Err(ExternalError::Unavailable("timeout".to_string()))
        }
    }

    // Returns invalid items until `valid_from` calls have been made.
    struct CountingSynth {
        calls: Counter<u32>,
        valid_from: u32,
    }

    impl CountingSynth {
        fn new(valid_from: u32) -> Self {
            Self {
                calls: Counter::new(0),
                valid_from,
            }
        }
    }

    impl ItemSynthesizer for CountingSynth {
        fn synthesize(
            &self,
            topic: Topic,
            _reference: Option<&str>,
            _difficulty: Difficulty,
        ) -> std::result::Result<Item, ExternalError> {
            let n = self.calls.get() + 1;
            self.calls.set(n);
            let mut candidate = item(&format!("{}_GEN_{}", topic.id_prefix(), n), topic);
            if n < self.valid_from {
                candidate.choices.truncate(2);
            }
            Ok(candidate)
        }
    }

    fn settings(test_mode: bool) -> EngineSettings {
        EngineSettings {
            test_mode,
            ..EngineSettings::default()
        }
    }

    fn answer_n(
        engine: &MasteryEngine<'_>,
        state: &mut ProgressionState,
        answers: &[&str],
        start: i64,
    ) {
        let cell = state.cell();
        let it = item(&format!("{}_1", cell.topic.id_prefix()), cell.topic);
        for (i, a) in answers.iter().enumerate() {
            engine
                .submit("ana", state, cell, &it, a, at(start + i as i64))
                .unwrap();
        }
    }

    mod threshold_tests {
        use super::*;

        #[test]
        fn test_mode_is_two_for_every_format() {
            for format in Format::ALL {
                assert_eq!(attempt_threshold(format, true), 2);
            }
        }

        #[test]
        fn written_formats_need_three() {
            assert_eq!(attempt_threshold(Format::FreeForm, false), 3);
            assert_eq!(attempt_threshold(Format::Explanation, false), 3);
        }

        #[test]
        fn recognition_formats_need_five() {
            assert_eq!(attempt_threshold(Format::MultipleChoice, false), 5);
            assert_eq!(attempt_threshold(Format::FillInBlank, false), 5);
        }
    }

    mod decide_tests {
        use super::*;

        fn cell(format: Format) -> Cell {
            Cell::new(Topic::GroupBy, format)
        }

        #[test]
        fn exactly_80_advances() {
            let t = decide(cell(Format::FillInBlank), 80.0);
            assert_eq!(t.target(), Some(cell(Format::FreeForm)));
            assert!(matches!(t, Transition::Advance { .. }));
        }

        #[test]
        fn just_below_80_holds() {
            let t = decide(cell(Format::FillInBlank), 79.9);
            assert_eq!(t, Transition::Hold { cell: cell(Format::FillInBlank) });
        }

        #[test]
        fn exactly_70_holds() {
            let t = decide(cell(Format::FreeForm), 70.0);
            assert_eq!(t, Transition::Hold { cell: cell(Format::FreeForm) });
        }

        #[test]
        fn just_below_70_regresses_one_format() {
            let t = decide(cell(Format::FreeForm), 69.9);
            assert_eq!(t.target(), Some(cell(Format::FillInBlank)));
            assert!(matches!(t, Transition::Regress { .. }));
        }

        #[test]
        fn free_form_advances_to_explanation() {
            let t = decide(cell(Format::FreeForm), 100.0);
            assert_eq!(t.target(), Some(cell(Format::Explanation)));
        }

        #[test]
        fn multiple_choice_never_regresses_below_first_format() {
            let t = decide(cell(Format::MultipleChoice), 0.0);
            assert_eq!(t.target(), Some(cell(Format::MultipleChoice)));
        }

        #[test]
        fn explanation_at_70_moves_to_next_topic() {
            let t = decide(cell(Format::Explanation), 70.0);
            assert_eq!(
                t,
                Transition::NextTopic {
                    from: cell(Format::Explanation),
                    to: Cell::new(Topic::Having, Format::MultipleChoice),
                }
            );
        }

        #[test]
        fn explanation_below_70_drops_to_free_form() {
            let t = decide(cell(Format::Explanation), 69.9);
            assert_eq!(t.target(), Some(cell(Format::FreeForm)));
        }

        #[test]
        fn last_explanation_completes_curriculum() {
            let t = decide(Cell::last(), 100.0);
            assert_eq!(t, Transition::CurriculumComplete { from: Cell::last() });
            assert_eq!(t.target(), None);
        }

        #[test]
        fn decide_is_deterministic() {
            for c in Cell::all() {
                for acc in [0.0, 33.3, 69.9, 70.0, 79.9, 80.0, 100.0] {
                    assert_eq!(decide(c, acc), decide(c, acc));
                }
            }
        }
    }

    mod accuracy_tests {
        use super::*;

        #[test]
        fn none_without_attempts() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false));
            let acc = engine
                .recent_accuracy("ana", Topic::Join, Format::FreeForm, Some(3), None)
                .unwrap();
            assert!(acc.is_none());
        }

        #[test]
        fn window_limits_to_latest_attempts() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false));
            let mut state = ProgressionState::new(t0());
            answer_n(&engine, &mut state, &["wrong", "wrong", "right", "right", "meh"], 1);

            let acc = engine
                .recent_accuracy("ana", Topic::Select, Format::MultipleChoice, Some(3), None)
                .unwrap()
                .unwrap();
            assert_eq!(acc.total, 3);
            assert_eq!(acc.correct, 2);
            assert_eq!(acc.accuracy_percent, 66.7);

            let all = engine
                .recent_accuracy("ana", Topic::Select, Format::MultipleChoice, None, Some(at(3)))
                .unwrap()
                .unwrap();
            assert_eq!(all.total, 3);
        }
    }

    mod evaluate_tests {
        use super::*;

        #[test]
        fn scenario_a_two_correct_in_test_mode_advance() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let mut engine =
                MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(true)).with_seed(7);
            let mut state = ProgressionState::new(t0());

            answer_n(&engine, &mut state, &["right", "right"], 1);
            assert_eq!(state.format_attempt_count, 2);

            let next = engine.next_item("ana", &mut state, at(10)).unwrap();
            let NextItem::Serve(served) = next else {
                panic!("expected an item");
            };
            let fib = Cell::new(Topic::Select, Format::FillInBlank);
            assert_eq!(
                served.transition,
                Some(Transition::Advance {
                    from: Cell::first(),
                    to: fib
                })
            );
            assert_eq!(served.cell, fib);
            assert_eq!(state.cell(), fib);
            assert_eq!(state.format_attempt_count, 0);
            assert_eq!(state.format_window_start, at(10));
            assert!(state.is_completed(Cell::first()));
            assert!(!state.is_completed(fib));
        }

        #[test]
        fn scenario_b_failed_join_explanation_drops_to_free_form() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false));
            let mut state = ProgressionState::new(t0());
            let expl = Cell::new(Topic::Join, Format::Explanation);
            engine.jump_to(&mut state, expl, t0());

            answer_n(&engine, &mut state, &["wrong", "right", "wrong"], 1);
            let t = engine.evaluate("ana", &mut state, at(10)).unwrap();

            assert_eq!(
                t,
                Some(Transition::Regress {
                    from: expl,
                    to: Cell::new(Topic::Join, Format::FreeForm)
                })
            );
            assert_eq!(state.cell(), Cell::new(Topic::Join, Format::FreeForm));
            assert_eq!(state.format_attempt_count, 0);
        }

        #[test]
        fn scenario_c_last_cell_completes_curriculum() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let mut engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false));
            let mut state = ProgressionState::new(t0());
            engine.jump_to(&mut state, Cell::last(), t0());

            answer_n(&engine, &mut state, &["right", "right", "right"], 1);
            let next = engine.next_item("ana", &mut state, at(10)).unwrap();

            assert!(matches!(
                next,
                NextItem::CurriculumComplete {
                    transition: Some(Transition::CurriculumComplete { .. })
                }
            ));
            assert!(state.curriculum_complete);
            assert!(state.is_completed(Cell::last()));

            // Stays complete, and further answers do not count.
            let again = engine.next_item("ana", &mut state, at(11)).unwrap();
            assert!(matches!(again, NextItem::CurriculumComplete { transition: None }));
            answer_n(&engine, &mut state, &["right"], 12);
            assert_eq!(state.format_attempt_count, 0);
        }

        #[test]
        fn explanation_pass_moves_to_next_topic_first_format() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false));
            let mut state = ProgressionState::new(t0());
            let expl = Cell::new(Topic::Where, Format::Explanation);
            engine.jump_to(&mut state, expl, t0());

            answer_n(&engine, &mut state, &["right", "right", "wrong"], 1);
            engine.evaluate("ana", &mut state, at(10)).unwrap();

            let order_mc = Cell::new(Topic::OrderBy, Format::MultipleChoice);
            assert_eq!(state.cell(), order_mc);
            assert!(state.is_completed(expl));
            assert!(state.is_completed(order_mc));
        }

        #[test]
        fn regress_at_first_format_stays_with_fresh_window() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false));
            let mut state = ProgressionState::new(t0());

            answer_n(&engine, &mut state, &["right", "right", "right", "meh", "meh"], 1);
            let t = engine.evaluate("ana", &mut state, at(10)).unwrap();

            assert_eq!(
                t,
                Some(Transition::Regress {
                    from: Cell::first(),
                    to: Cell::first()
                })
            );
            assert_eq!(state.format_attempt_count, 0);
            assert_eq!(state.format_window_start, at(10));
        }

        #[test]
        fn below_threshold_count_is_not_evaluated() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false));
            let mut state = ProgressionState::new(t0());

            answer_n(&engine, &mut state, &["right", "right", "right", "right"], 1);
            assert_eq!(engine.evaluate("ana", &mut state, at(10)).unwrap(), None);
            assert_eq!(state.format_attempt_count, 4);
            assert_eq!(state.cell(), Cell::first());
        }

        #[test]
        fn attempts_before_window_start_do_not_fill_window() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(true));
            let mut state = ProgressionState::new(t0());
            answer_n(&engine, &mut state, &["right", "right"], 1);

            // Window restarted after those answers; the count alone is not enough.
            state.format_window_start = at(5);
            assert_eq!(engine.evaluate("ana", &mut state, at(10)).unwrap(), None);
            assert_eq!(state.cell(), Cell::first());
        }

        #[test]
        fn advance_marks_passed_cell_not_entered_cell() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(true));
            let mut state = ProgressionState::new(t0());
            let free = Cell::new(Topic::Having, Format::FreeForm);
            engine.jump_to(&mut state, free, t0());

            answer_n(&engine, &mut state, &["right", "right"], 1);
            engine.evaluate("ana", &mut state, at(10)).unwrap();

            assert!(state.is_completed(free));
            assert!(!state.is_completed(Cell::new(Topic::Having, Format::Explanation)));
        }
    }

    mod selection_tests {
        use super::*;

        #[test]
        fn scenario_d_two_item_pool_clears_window() {
            let db = setup_db();
            let bank = ItemBank::from_items(vec![
                item("WHERE_1", Topic::Where),
                item("WHERE_2", Topic::Where),
            ])
            .unwrap();
            let mut engine =
                MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false)).with_seed(1);
            let mut state = ProgressionState::new(t0());

            let first = engine.select_item(&mut state, Topic::Where).unwrap().item.id;
            let second = engine.select_item(&mut state, Topic::Where).unwrap().item.id;
            assert_ne!(first, second);

            let third = engine.select_item(&mut state, Topic::Where).unwrap();
            assert!(third.item.id == "WHERE_1" || third.item.id == "WHERE_2");
            assert_eq!(state.recent_for(Topic::Where), vec![third.item.id.as_str()]);
        }

        #[test]
        fn never_repeats_recent_items_while_pool_lasts() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let mut engine =
                MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false)).with_seed(42);
            let mut state = ProgressionState::new(t0());
            let pool = bank.count_for(Topic::Join);

            let mut seen = std::collections::HashSet::new();
            for _ in 0..pool {
                let picked = engine.select_item(&mut state, Topic::Join).unwrap();
                assert_eq!(picked.source, ItemSource::Static);
                assert!(seen.insert(picked.item.id));
            }
        }

        #[test]
        fn empty_topic_falls_back_to_whole_curriculum() {
            let db = setup_db();
            let bank = ItemBank::from_items(vec![item("SELECT_1", Topic::Select)]).unwrap();
            let mut engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false));
            let mut state = ProgressionState::new(t0());

            let picked = engine.select_item(&mut state, Topic::Subquery).unwrap();
            assert_eq!(picked.item.id, "SELECT_1");
            assert_eq!(picked.source, ItemSource::Fallback);
            assert!(picked.warning.is_some());
        }

        #[test]
        fn empty_bank_is_an_error() {
            let db = setup_db();
            let bank = ItemBank::from_items(vec![]).unwrap();
            let mut engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false));
            let mut state = ProgressionState::new(t0());
            assert!(matches!(
                engine.select_item(&mut state, Topic::Select),
                Err(Error::Bank(_))
            ));
        }
    }

    mod synthesis_tests {
        use super::*;

        #[test]
        fn validate_rejects_each_defect() {
            let mut i = item("JOIN_GEN_1", Topic::Join);
            assert_eq!(validate_item(&i), Ok(()));

            i.title = " ".to_string();
            assert_eq!(validate_item(&i), Err(ValidationError::MissingTitle));

            let mut i = item("JOIN_GEN_1", Topic::Join);
            i.answer_sql.clear();
            assert_eq!(validate_item(&i), Err(ValidationError::MissingAnswer));

            let mut i = item("JOIN_GEN_1", Topic::Join);
            i.choices[2] = "  ".to_string();
            assert_eq!(validate_item(&i), Err(ValidationError::TooFewChoices(2)));

            let mut i = item("JOIN_GEN_1", Topic::Join);
            i.choices[0] = "SELECT z FROM t".to_string();
            assert_eq!(validate_item(&i), Err(ValidationError::AnswerNotAmongChoices));
        }

        #[test]
        fn validate_normalizes_answer() {
            let mut i = item("JOIN_GEN_1", Topic::Join);
            i.choices[0] = "  select   a from T  ".to_string();
            i.answer_sql = "SELECT a FROM t;".to_string();
            assert_eq!(validate_item(&i), Ok(()));
        }

        #[test]
        fn retries_are_bounded() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let synth = CountingSynth::new(u32::MAX);
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false))
                .with_synthesizer(&synth);

            let result = engine.synthesize_item(Topic::Join, None, Difficulty::Medium, 3);
            assert!(result.is_none());
            assert_eq!(synth.calls.get(), 3);
        }

        #[test]
        fn stops_at_first_valid_candidate() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let synth = CountingSynth::new(2);
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false))
                .with_synthesizer(&synth);

            let result = engine.synthesize_item(Topic::Join, Some("SELECT 1"), Difficulty::Hard, 3);
            assert_eq!(result.map(|i| i.id), Some("JOIN_GEN_2".to_string()));
            assert_eq!(synth.calls.get(), 2);
        }

        #[test]
        fn no_synthesizer_means_none() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false));
            assert!(engine
                .synthesize_item(Topic::Join, None, Difficulty::Easy, 3)
                .is_none());
        }

        fn weak_learner(db: &Database) {
            for i in 0..3 {
                db.record_attempt(&NewAttempt {
                    learner: "ana",
                    topic: Topic::Where,
                    format: Format::MultipleChoice,
                    item_id: Some("WHERE_1"),
                    answer: "SELECT * FROM t",
                    outcome: Outcome::Incorrect,
                    feedback: "",
                    recorded_at: at(i),
                })
                .unwrap();
            }
        }

        #[test]
        fn exhausted_pool_and_weak_learner_get_synthesized_item() {
            let db = setup_db();
            weak_learner(&db);
            let bank = ItemBank::from_items(vec![item("WHERE_1", Topic::Where)]).unwrap();
            let synth = CountingSynth::new(1);
            let mut engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false))
                .with_synthesizer(&synth);
            let mut state = ProgressionState::new(t0());
            engine.jump_to(&mut state, Cell::new(Topic::Where, Format::MultipleChoice), t0());
            state.remember_item(Topic::Where, "WHERE_1");

            let NextItem::Serve(served) = engine.next_item("ana", &mut state, at(10)).unwrap() else {
                panic!("expected an item");
            };
            assert_eq!(served.source, ItemSource::Synthesized);
            assert!(state.is_recent(Topic::Where, &served.item.id));
        }

        #[test]
        fn failed_synthesis_falls_back_to_static_pool() {
            let db = setup_db();
            weak_learner(&db);
            let bank = ItemBank::from_items(vec![item("WHERE_1", Topic::Where)]).unwrap();
            let synth = CountingSynth::new(u32::MAX);
            let mut engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false))
                .with_synthesizer(&synth);
            let mut state = ProgressionState::new(t0());
            engine.jump_to(&mut state, Cell::new(Topic::Where, Format::MultipleChoice), t0());
            state.remember_item(Topic::Where, "WHERE_1");

            let NextItem::Serve(served) = engine.next_item("ana", &mut state, at(10)).unwrap() else {
                panic!("expected an item");
            };
            assert_eq!(served.source, ItemSource::Static);
            assert_eq!(served.item.id, "WHERE_1");
            assert_eq!(synth.calls.get(), 3);
        }

        #[test]
        fn strong_learner_is_not_synthesized_for() {
            let db = setup_db();
            let bank = ItemBank::from_items(vec![item("WHERE_1", Topic::Where)]).unwrap();
            let synth = CountingSynth::new(1);
            let mut engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false))
                .with_synthesizer(&synth);
            let mut state = ProgressionState::new(t0());
            engine.jump_to(&mut state, Cell::new(Topic::Where, Format::MultipleChoice), t0());
            state.remember_item(Topic::Where, "WHERE_1");

            engine.next_item("ana", &mut state, at(10)).unwrap();
            assert_eq!(synth.calls.get(), 0);
        }

        #[test]
        fn disabled_synthesis_is_never_called() {
            let db = setup_db();
            weak_learner(&db);
            let bank = ItemBank::from_items(vec![item("WHERE_1", Topic::Where)]).unwrap();
            let synth = CountingSynth::new(1);
            let disabled = EngineSettings {
                synthesis_enabled: false,
                ..EngineSettings::default()
            };
            let mut engine =
                MasteryEngine::new(&db, &bank, &ScriptedOracle, disabled).with_synthesizer(&synth);
            let mut state = ProgressionState::new(t0());
            engine.jump_to(&mut state, Cell::new(Topic::Where, Format::MultipleChoice), t0());
            state.remember_item(Topic::Where, "WHERE_1");

            engine.next_item("ana", &mut state, at(10)).unwrap();
            assert_eq!(synth.calls.get(), 0);
        }
    }

    mod submit_tests {
        use super::*;

        #[test]
        fn oracle_failure_falls_back_to_string_match() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &DownOracle, settings(false));
            let mut state = ProgressionState::new(t0());
            let it = item("SELECT_1", Topic::Select);

            let sub = engine
                .submit("ana", &mut state, Cell::first(), &it, "select a from t", at(1))
                .unwrap();
            assert_eq!(sub.outcome, Outcome::Correct);
            assert!(sub.graded_locally);
            assert!(sub.counted);
        }

        #[test]
        fn empty_answer_skips_oracle() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &StringMatchGrader, settings(false));
            let mut state = ProgressionState::new(t0());
            let it = item("SELECT_1", Topic::Select);

            let sub = engine
                .submit("ana", &mut state, Cell::first(), &it, "  ", at(1))
                .unwrap();
            assert_eq!(sub.outcome, Outcome::Incorrect);
            assert!(sub.graded_locally);
            assert_eq!(db.history("ana", 10).unwrap().len(), 1);
        }

        #[test]
        fn other_cells_are_logged_but_not_counted() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false));
            let mut state = ProgressionState::new(t0());
            let it = item("JOIN_1", Topic::Join);

            let sub = engine
                .submit(
                    "ana",
                    &mut state,
                    Cell::new(Topic::Join, Format::FreeForm),
                    &it,
                    "right",
                    at(1),
                )
                .unwrap();
            assert!(!sub.counted);
            assert_eq!(state.format_attempt_count, 0);
            assert_eq!(db.history("ana", 10).unwrap().len(), 1);
        }

        #[test]
        fn mismatched_item_topic_is_rejected() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false));
            let mut state = ProgressionState::new(t0());
            let it = item("JOIN_1", Topic::Join);

            let result = engine.submit("ana", &mut state, Cell::first(), &it, "right", at(1));
            assert!(matches!(result, Err(Error::InvariantViolation(_))));
            assert!(db.history("ana", 10).unwrap().is_empty());
        }

        #[test]
        fn submission_records_item_id() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false));
            let mut state = ProgressionState::new(t0());
            let it = item("SELECT_2", Topic::Select);

            engine
                .submit("ana", &mut state, Cell::first(), &it, "meh", at(1))
                .unwrap();
            let logged = &db.history("ana", 1).unwrap()[0];
            assert_eq!(logged.item_id.as_deref(), Some("SELECT_2"));
            assert_eq!(logged.outcome, Outcome::Partial);
        }
    }

    mod practice_tests {
        use super::*;

        #[test]
        fn practice_item_leaves_progression_alone() {
            let db = setup_db();
            let bank = ItemBank::from_items(vec![
                item("JOIN_1", Topic::Join),
                item("JOIN_2", Topic::Join),
            ])
            .unwrap();
            let mut engine =
                MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false)).with_seed(5);
            let mut state = ProgressionState::new(t0());
            state.format_attempt_count = 2;
            let before = state.clone();

            let target = Cell::new(Topic::Join, Format::Explanation);
            let served = engine.practice_item(&mut state, target).unwrap();

            assert_eq!(served.cell, target);
            assert_eq!(served.item.topic, Topic::Join);
            assert!(served.transition.is_none());
            assert_eq!(state.cell(), before.cell());
            assert_eq!(state.format_attempt_count, 2);
            assert_eq!(state.format_window_start, before.format_window_start);
            assert_eq!(state.completed, before.completed);
            assert!(state.is_recent(Topic::Join, &served.item.id));
        }

        #[test]
        fn practice_answers_are_logged_but_never_counted() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(true));
            let mut state = ProgressionState::new(t0());
            let it = item("SELECT_1", Topic::Select);

            // Even the learner's own cell does not move in practice.
            for i in 0..3 {
                let sub = engine
                    .submit_practice("ana", Cell::first(), &it, "right", at(i))
                    .unwrap();
                assert!(!sub.counted);
                assert_eq!(sub.outcome, Outcome::Correct);
            }

            assert_eq!(db.history("ana", 10).unwrap().len(), 3);
            assert_eq!(state.format_attempt_count, 0);
            assert_eq!(engine.evaluate("ana", &mut state, at(10)).unwrap(), None);
            assert_eq!(state.cell(), Cell::first());
        }

        #[test]
        fn practice_rejects_mismatched_item_topic() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false));
            let it = item("JOIN_1", Topic::Join);

            let result = engine.submit_practice("ana", Cell::first(), &it, "right", at(1));
            assert!(matches!(result, Err(Error::InvariantViolation(_))));
            assert!(db.history("ana", 10).unwrap().is_empty());
        }
    }

    mod jump_tests {
        use super::*;

        #[test]
        fn jump_resets_window_and_marks_target() {
            let db = setup_db();
            let bank = ItemBank::builtin().unwrap();
            let engine = MasteryEngine::new(&db, &bank, &ScriptedOracle, settings(false));
            let mut state = ProgressionState::new(t0());
            state.format_attempt_count = 3;
            state.curriculum_complete = true;

            let target = Cell::new(Topic::Aggregate, Format::FillInBlank);
            engine.jump_to(&mut state, target, at(30));

            assert_eq!(state.cell(), target);
            assert_eq!(state.format_attempt_count, 0);
            assert_eq!(state.format_window_start, at(30));
            assert!(state.is_completed(target));
            assert!(!state.curriculum_complete);
        }
    }
}
