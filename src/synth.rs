use std::collections::HashSet;

use chrono::Utc;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::error::ExternalError;
use crate::grading::{normalize_answer, normalize_sql_strict};
use crate::models::{Difficulty, Item, Topic};
use crate::ports::{ItemRepository, ItemSynthesizer};

const DISTRACTORS: usize = 2;

// Keyword swaps used to derive near-miss distractors for hard items.
const MUTATIONS: &[(&str, &str)] = &[
    (">=", "<="),
    ("<=", ">="),
    (" > ", " < "),
    (" < ", " > "),
    (" DESC", " ASC"),
    (" AND ", " OR "),
    ("LEFT JOIN", "INNER JOIN"),
    (" HAVING ", " WHERE "),
    ("GROUP BY", "ORDER BY"),
    (" IN (", " = ("),
    ("COUNT(", "SUM("),
    ("AVG(", "SUM("),
    ("MAX(", "MIN("),
    ("DISTINCT ", ""),
    (" = ", " <> "),
];

// Builds review items by recombining bank material. Harder difficulties
// draw distractors closer to the reference query.
pub struct RecombineSynthesizer<'a> {
    repo: &'a dyn ItemRepository,
}

impl<'a> RecombineSynthesizer<'a> {
    pub fn new(repo: &'a dyn ItemRepository) -> Self {
        Self { repo }
    }

    fn pick_base(&self, pool: &[Item], reference: Option<&str>) -> Option<Item> {
        match reference {
            Some(r) if !r.trim().is_empty() => pool
                .iter()
                .max_by(|a, b| {
                    token_overlap(&a.answer_sql, r)
                        .partial_cmp(&token_overlap(&b.answer_sql, r))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .cloned(),
            _ => pool.choose(&mut rand::thread_rng()).cloned(),
        }
    }

    fn distractors(&self, base: &Item, pool: &[Item], difficulty: Difficulty) -> Vec<String> {
        let mut rng = rand::thread_rng();
        let mut candidates: Vec<String> = match difficulty {
            Difficulty::Easy => self
                .repo
                .all_items()
                .into_iter()
                .filter(|i| i.topic != base.topic)
                .map(|i| i.answer_sql)
                .collect(),
            Difficulty::Medium => pool
                .iter()
                .filter(|i| i.id != base.id)
                .map(|i| i.answer_sql.clone())
                .chain(base.choices.iter().cloned())
                .collect(),
            Difficulty::Hard => mutations(&base.answer_sql),
        };
        candidates.shuffle(&mut rng);

        // Top up from the base item's own wrong choices.
        let mut fallback = base.choices.clone();
        fallback.shuffle(&mut rng);
        candidates.extend(fallback);

        let answer = normalize_answer(&base.answer_sql);
        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .filter(|c| !c.trim().is_empty())
            .filter(|c| {
                let n = normalize_answer(c);
                n != answer && seen.insert(n)
            })
            .take(DISTRACTORS)
            .collect()
    }
}

impl ItemSynthesizer for RecombineSynthesizer<'_> {
    fn synthesize(
        &self,
        topic: Topic,
        reference: Option<&str>,
        difficulty: Difficulty,
    ) -> Result<Item, ExternalError> {
        let pool = self.repo.items_for(topic);
        let base = self.pick_base(&pool, reference).ok_or_else(|| {
            ExternalError::Unavailable(format!("no bank material for {}", topic.label()))
        })?;

        let mut choices = self.distractors(&base, &pool, difficulty);
        choices.push(base.answer_sql.clone());
        choices.shuffle(&mut rand::thread_rng());

        let id = format!(
            "{}_GEN_{}",
            topic.id_prefix(),
            Utc::now().format("%Y%m%d%H%M%S%6f")
        );
        debug!(id = %id, base = %base.id, difficulty = difficulty.as_str(), "synthesized item");

        Ok(Item {
            id,
            topic,
            title: format!("Review: {}", base.title),
            answer_sql: base.answer_sql,
            explanation: base.explanation,
            choices,
            blank_template: base.blank_template,
            blank_answer: base.blank_answer,
        })
    }
}

fn mutations(sql: &str) -> Vec<String> {
    let answer = normalize_answer(sql);
    MUTATIONS
        .iter()
        .filter(|(from, _)| sql.contains(from))
        .map(|(from, to)| sql.replacen(from, to, 1))
        .filter(|m| normalize_answer(m) != answer)
        .collect()
}

// Jaccard similarity of the two queries' token sets.
fn token_overlap(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| -> HashSet<String> {
        normalize_sql_strict(s)
            .replace([',', '(', ')'], " ")
            .split_whitespace()
            .map(str::to_string)
            .collect()
    };
    let (ta, tb) = (tokens(a), tokens(b));
    let union = ta.union(&tb).count();
    if union == 0 {
        return 0.0;
    }
    ta.intersection(&tb).count() as f64 / union as f64
}
