use crate::error::ExternalError;
use crate::models::{Format, Graded, Item, Outcome};
use crate::ports::GradingOracle;

// Share of reference keywords an explanation must cover.
const EXPLANATION_CORRECT_COVERAGE: f64 = 0.8;
const EXPLANATION_PARTIAL_COVERAGE: f64 = 0.5;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "from", "with", "that", "this", "are", "all", "each", "its", "into",
    "than", "then", "which", "who", "whose", "only", "their", "them", "they", "were", "was",
    "has", "have", "not", "but", "per", "any", "one", "two", "out", "get", "gets", "returns",
    "return", "shows", "show", "lists", "list",
];

/// Lower-cases, trims, drops trailing semicolons and collapses whitespace.
pub fn normalize_answer(s: &str) -> String {
    let lowered = s.trim().to_lowercase();
    let stripped = lowered.trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    collapse_whitespace(stripped)
}

// [`normalize_answer`] plus canonical spacing around commas and parentheses.
pub fn normalize_sql_strict(s: &str) -> String {
    let base = normalize_answer(s);
    let commas = collapse_whitespace(&base.replace(" ,", ",").replace(',', ", "));
    commas.replace("( ", "(").replace(" )", ")")
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn sql_tokens(s: &str) -> Vec<String> {
    let strict = normalize_sql_strict(s);
    let mut tokens: Vec<String> = strict
        .replace([',', '(', ')'], " ")
        .split_whitespace()
        .map(str::to_string)
        .collect();
    tokens.sort();
    tokens
}

fn keywords(s: &str) -> Vec<String> {
    let mut words: Vec<String> = s
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.chars().count() >= 3 && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect();
    words.sort();
    words.dedup();
    words
}

/// Deterministic grading used on its own or whenever a remote oracle fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringMatchGrader;

impl GradingOracle for StringMatchGrader {
    fn grade(&self, answer: &str, item: &Item, format: Format) -> Result<Graded, ExternalError> {
        Ok(grade_locally(answer, item, format))
    }
}

pub fn grade_locally(answer: &str, item: &Item, format: Format) -> Graded {
    if answer.trim().is_empty() {
        return Graded::new(Outcome::Incorrect, "No answer was entered.");
    }

    match format {
        Format::MultipleChoice => match item.choice_options() {
            Some(_) => grade_choice(answer, item),
            None => grade_free_form(answer, &item.answer_sql),
        },
        Format::FillInBlank => match item.blank() {
            Some((_, expected)) => grade_blank(answer, expected),
            None => grade_free_form(answer, &item.answer_sql),
        },
        Format::FreeForm => grade_free_form(answer, &item.answer_sql),
        Format::Explanation => grade_explanation(answer, &item.explanation),
    }
}

fn grade_choice(answer: &str, item: &Item) -> Graded {
    if normalize_answer(answer) == normalize_answer(&item.answer_sql) {
        Graded::new(Outcome::Correct, "That's the right query.")
    } else {
        Graded::new(
            Outcome::Incorrect,
            format!("Not quite. The correct query is: {}", item.answer_sql.trim()),
        )
    }
}

fn grade_blank(answer: &str, expected: &str) -> Graded {
    let squash = |s: &str| -> String {
        s.chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase()
    };
    if squash(answer) == squash(expected) {
        Graded::new(Outcome::Correct, "Exactly right.")
    } else {
        Graded::new(
            Outcome::Incorrect,
            format!("The blank should be \"{}\".", expected.trim()),
        )
    }
}

fn grade_free_form(answer: &str, reference: &str) -> Graded {
    let user = normalize_sql_strict(answer);
    let expected = normalize_sql_strict(reference);

    if user == expected {
        return Graded::new(Outcome::Correct, "Exactly right.");
    }

    let user_tokens = sql_tokens(answer);
    if user_tokens == sql_tokens(reference) {
        return Graded::new(
            Outcome::Partial,
            "All the right pieces, but the column or clause order differs from the expected query.",
        );
    }

    let has = |tokens: &[String], word: &str| tokens.iter().any(|t| t == word);
    let expected_tokens = sql_tokens(reference);

    let hint = if has(&expected_tokens, "where") && !has(&user_tokens, "where") {
        "The WHERE clause is missing. Use WHERE to filter rows."
    } else if !has(&user_tokens, "from") {
        "The FROM clause is missing. Name the table to read from."
    } else if !user.starts_with("select") && !user.starts_with("with") {
        "A query must start with SELECT."
    } else {
        "The query does not produce the expected result."
    };
    Graded::new(Outcome::Incorrect, hint)
}

fn grade_explanation(answer: &str, reference: &str) -> Graded {
    if normalize_answer(answer) == normalize_answer(reference) {
        return Graded::new(Outcome::Correct, "A precise explanation.");
    }

    let expected = keywords(reference);
    if expected.is_empty() {
        return Graded::new(
            Outcome::Incorrect,
            "No reference explanation is available for this item.",
        );
    }

    let given = keywords(answer);
    let missing: Vec<&str> = expected
        .iter()
        .filter(|w| !given.contains(w))
        .map(String::as_str)
        .collect();
    let coverage = 1.0 - missing.len() as f64 / expected.len() as f64;

    if coverage >= EXPLANATION_CORRECT_COVERAGE {
        Graded::new(Outcome::Correct, "Your explanation covers the key points.")
    } else if coverage >= EXPLANATION_PARTIAL_COVERAGE {
        Graded::new(
            Outcome::Partial,
            format!("Mostly there. Also mention: {}", missing.join(", ")),
        )
    } else {
        Graded::new(
            Outcome::Incorrect,
            format!("Key points are missing. Reference: {}", reference.trim()),
        )
    }
}
