mod bank;
mod config;
mod db;
mod engine;
mod error;
mod grading;
mod logging;
mod models;
mod ports;
mod synth;
mod tui;
mod tutor;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;

use bank::ItemBank;
use config::Config;
use db::Database;
use engine::{ItemSource, MasteryEngine, NextItem, Served};
use grading::StringMatchGrader;
use logging::LogTarget;
use models::{Format, Item, JsonOutput, Mode, Topic};
use ports::ItemRepository;
use synth::RecombineSynthesizer;
use tutor::Tutor;

const DEFAULT_HISTORY_LIMIT: usize = 10;
const WEAK_MIN_ATTEMPTS: u32 = 3;
const WEAK_BELOW: f64 = 60.0;

#[derive(Parser)]
#[command(name = "sqldrill")]
#[command(about = "An adaptive SQL tutor that drills each topic through four answer formats")]
#[command(version)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Learner id (overrides config and SQLDRILL_LEARNER)
    #[arg(long, global = true)]
    learner: Option<String>,

    /// Judge every cell after two attempts
    #[arg(long, global = true)]
    test_mode: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database and write a default config
    Init,

    /// Show where the learner is in the curriculum
    Status,

    /// Serve the next question
    Next,

    /// Practice any topic and format without moving through the curriculum
    Practice {
        /// Topic, e.g. where, "group by", join
        topic: String,

        /// Format: mc, fib, free, explanation
        format: String,
    },

    /// Answer the current question (multiple choice accepts 1-3)
    Answer {
        /// The answer text
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },

    /// Move straight to a topic and format for review
    Jump {
        /// Topic, e.g. where, "group by", join
        topic: String,

        /// Format: mc, fib, free, explanation
        format: String,
    },

    /// Show accuracy statistics and weak points
    Stats,

    /// Show recent attempts
    History {
        /// Number of attempts to show
        #[arg(long, short, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },

    /// List items in the bank
    Items {
        /// Filter by topic
        #[arg(long, short)]
        topic: Option<String>,
    },

    /// Return the learner to the start (attempt history is kept)
    Reset,

    /// Launch interactive terminal UI
    Tui,
}

fn main() {
    let cli = Cli::parse();
    let json = cli.json;

    if let Err(e) = run(cli) {
        if json {
            if let Ok(out) = serde_json::to_string(&JsonOutput::<()>::err(e.to_string())) {
                println!("{}", out);
            }
        } else {
            eprintln!("Error: {}", e);
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load()?;
    if let Some(learner) = &cli.learner {
        config.learner = learner.clone();
    }
    if cli.test_mode {
        config.test_mode = true;
    }
    config.validate()?;

    let db_path = config.db_path();
    let log_target = match cli.command {
        Commands::Tui => LogTarget::beside(&db_path),
        _ => LogTarget::Stderr,
    };
    logging::init(&config.log_level, log_target)?;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open(&db_path)?;
    db.init()?;

    let bank = ItemBank::open(config.bank_path.as_deref())?;
    let synthesizer = RecombineSynthesizer::new(&bank);
    let engine = MasteryEngine::new(&db, &bank, &StringMatchGrader, config.engine_settings())
        .with_synthesizer(&synthesizer);
    let mut tutor = Tutor::new(&db, engine, config.learner.clone());
    let now = Utc::now();

    match cli.command {
        Commands::Init => {
            let config_path = config::config_path();
            if !config_path.exists() {
                Config::default().save(&config_path)?;
            }
            if cli.json {
                print_json(serde_json::json!({
                    "database": db_path,
                    "config": config_path,
                    "items": bank.len(),
                }))?;
            } else {
                println!("Database initialized at: {}", db_path.display());
                println!("Config: {}", config_path.display());
                println!("Item bank: {} items", bank.len());
            }
        }

        Commands::Status => {
            let status = tutor.status(now)?;
            if cli.json {
                print_json(&status)?;
            } else {
                println!("=== {} ===", status.learner);
                if status.curriculum_complete {
                    println!("Curriculum complete.");
                } else {
                    println!("Current: {}", status.cell.label());
                    println!(
                        "Window: {}/{} attempts",
                        status.format_attempt_count.min(status.threshold),
                        status.threshold
                    );
                }
                println!("Completed cells: {}/32", status.completed.len());
                match &status.active_item {
                    Some(active) => {
                        let mode = match active.mode {
                            Mode::Practice => " (practice)",
                            Mode::Adaptive => "",
                        };
                        println!("Waiting for an answer to: {}{}", active.item.title, mode);
                    }
                    None => println!("No open question. Run `sqldrill next`."),
                }
            }
        }

        Commands::Next => {
            let next = tutor.next(now)?;
            if cli.json {
                print_json(&next)?;
            } else {
                match next {
                    NextItem::Serve(served) => {
                        if let Some(t) = &served.transition {
                            println!("{}", t.describe());
                        }
                        print_served(&served, "");
                    }
                    NextItem::CurriculumComplete { transition } => {
                        if let Some(t) = transition {
                            println!("{}", t.describe());
                        }
                        println!("Curriculum complete! Use `sqldrill jump` to review any cell.");
                    }
                }
            }
        }

        Commands::Practice { topic, format } => {
            let served = tutor.practice(&topic, &format, now)?;
            if cli.json {
                print_json(&served)?;
            } else {
                print_served(&served, " (practice)");
            }
        }

        Commands::Answer { text } => {
            let answer = text.join(" ");
            let submission = tutor.answer(&answer, now)?;
            if cli.json {
                print_json(&submission)?;
            } else {
                println!("{}", submission.outcome.label());
                if !submission.feedback.is_empty() {
                    println!("{}", submission.feedback);
                }
                if submission.counted {
                    let status = tutor.status(now)?;
                    println!(
                        "Window: {}/{} attempts on {}",
                        status.format_attempt_count.min(status.threshold),
                        status.threshold,
                        status.cell.label()
                    );
                }
                println!();
                println!("Next question: sqldrill next");
            }
        }

        Commands::Jump { topic, format } => {
            let cell = tutor.jump(&topic, &format, now)?;
            if cli.json {
                print_json(cell)?;
            } else {
                println!("Jumped to {}.", cell.label());
            }
        }

        Commands::Stats => {
            let learner = tutor.learner().to_string();
            let overall = db.overall_stats(&learner)?;
            let cells = db.cell_stats(&learner)?;
            let weak = db.weak_points(&learner, WEAK_MIN_ATTEMPTS, WEAK_BELOW)?;
            if cli.json {
                print_json(serde_json::json!({
                    "overall": overall,
                    "cells": cells,
                    "weak_points": weak,
                }))?;
            } else {
                println!("=== Statistics for {} ===", learner);
                println!("Attempts: {}", overall.total);
                println!(
                    "Correct: {}  Partial: {}  Incorrect: {}",
                    overall.correct, overall.partial, overall.incorrect
                );
                println!("Accuracy: {:.1}%", overall.accuracy);

                let attempted: Vec<_> = cells.iter().filter(|c| c.total > 0).collect();
                if !attempted.is_empty() {
                    println!();
                    println!("{:<12} {:<6} {:>8} {:>9}", "TOPIC", "FORMAT", "ATTEMPTS", "ACCURACY");
                    println!("{}", "-".repeat(38));
                    for c in attempted {
                        println!(
                            "{:<12} {:<6} {:>8} {:>8.1}%",
                            c.topic.label(),
                            c.format.short_label(),
                            c.total,
                            c.accuracy
                        );
                    }
                }

                if !weak.is_empty() {
                    println!();
                    println!("Weak points:");
                    for w in weak {
                        println!(
                            "  {:<12} {:>5.1}% ({}/{})",
                            w.topic.label(),
                            w.accuracy,
                            w.correct,
                            w.total
                        );
                    }
                }
            }
        }

        Commands::History { limit } => {
            let attempts = db.history(tutor.learner(), limit)?;
            if cli.json {
                print_json(&attempts)?;
            } else if attempts.is_empty() {
                println!("No attempts yet.");
            } else {
                println!(
                    "{:<17} {:<10} {:<6} {:<18} ANSWER",
                    "WHEN", "TOPIC", "FORMAT", "OUTCOME"
                );
                println!("{}", "-".repeat(80));
                for a in attempts {
                    println!(
                        "{:<17} {:<10} {:<6} {:<18} {}",
                        a.recorded_at.format("%Y-%m-%d %H:%M"),
                        a.topic.label(),
                        a.format.short_label(),
                        a.outcome.label(),
                        truncate(&a.answer, 30)
                    );
                }
            }
        }

        Commands::Items { topic } => {
            let items = match topic {
                Some(t) => {
                    let topic = Topic::from_str(&t).ok_or_else(|| {
                        format!("Invalid topic '{}'. Use one of: {}", t, topic_names())
                    })?;
                    bank.items_for(topic)
                }
                None => bank.all_items(),
            };
            if cli.json {
                print_json(&items)?;
            } else if items.is_empty() {
                println!("No items found.");
            } else {
                println!("{:<12} {:<10} TITLE", "ID", "TOPIC");
                println!("{}", "-".repeat(70));
                for item in items {
                    println!(
                        "{:<12} {:<10} {}",
                        item.id,
                        item.topic.label(),
                        truncate(&item.title, 46)
                    );
                }
            }
        }

        Commands::Reset => {
            let existed = tutor.reset()?;
            if cli.json {
                print_json(serde_json::json!({ "reset": existed }))?;
            } else if existed {
                println!("Progress for '{}' reset to the start.", tutor.learner());
            } else {
                println!("No progress stored for '{}'.", tutor.learner());
            }
        }

        Commands::Tui => {
            tui::run(tutor)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(data: T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string(&JsonOutput::ok(data))?);
    Ok(())
}

fn print_served(served: &Served, mode: &str) {
    if let Some(w) = &served.warning {
        eprintln!("Warning: {}", w);
    }
    println!();
    let source = match served.source {
        ItemSource::Synthesized => " (review)",
        _ => "",
    };
    println!("=== {}{}{} ===", served.cell.label(), source, mode);
    print_question(served.cell.format, &served.item);
    println!();
    println!("Answer with:");
    println!(
        "  sqldrill answer <{}>",
        answer_hint(served.cell.format, &served.item)
    );
}

fn print_question(format: Format, item: &Item) {
    println!("{}", item.title);
    println!();
    match format {
        Format::MultipleChoice => match item.choice_options() {
            Some(choices) => {
                for (i, choice) in choices.into_iter().enumerate() {
                    println!("  {}. {}", i + 1, choice);
                }
            }
            None => println!("Write the query."),
        },
        Format::FillInBlank => match item.blank() {
            Some((template, _)) => println!("  {}", template),
            None => println!("Write the full query."),
        },
        Format::FreeForm => println!("Write the query."),
        Format::Explanation => {
            println!("Explain what this query returns:");
            println!("  {}", item.answer_sql);
        }
    }
}

fn answer_hint(format: Format, item: &Item) -> &'static str {
    match format {
        Format::MultipleChoice if item.choice_options().is_some() => "1-3",
        Format::MultipleChoice => "query",
        Format::FillInBlank => "missing keyword",
        Format::FreeForm => "query",
        Format::Explanation => "explanation",
    }
}

fn topic_names() -> String {
    Topic::ALL
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    mod truncate_tests {
        use super::*;

        #[test]
        fn truncate_short_string() {
            assert_eq!(truncate("SELECT 1", 10), "SELECT 1");
        }

        #[test]
        fn truncate_exact_length() {
            assert_eq!(truncate("hello", 5), "hello");
        }

        #[test]
        fn truncate_long_string() {
            assert_eq!(truncate("SELECT name FROM t", 9), "SELECT...");
        }

        #[test]
        fn truncate_counts_chars_not_bytes() {
            assert_eq!(truncate("ééééé", 4), "é...");
        }
    }

    mod cli_parsing_tests {
        use super::*;

        #[test]
        fn parse_init_command() {
            let cli = Cli::try_parse_from(["sqldrill", "init"]).unwrap();
            assert!(!cli.json);
            assert!(!cli.test_mode);
            assert!(cli.learner.is_none());
            assert!(matches!(cli.command, Commands::Init));
        }

        #[test]
        fn parse_global_flags_anywhere() {
            let cli = Cli::try_parse_from([
                "sqldrill",
                "--json",
                "status",
                "--learner",
                "ana",
                "--test-mode",
            ])
            .unwrap();
            assert!(cli.json);
            assert!(cli.test_mode);
            assert_eq!(cli.learner.as_deref(), Some("ana"));
            assert!(matches!(cli.command, Commands::Status));
        }

        #[test]
        fn parse_answer_joins_words() {
            let cli = Cli::try_parse_from([
                "sqldrill",
                "answer",
                "SELECT",
                "name",
                "FROM",
                "employees;",
            ])
            .unwrap();
            match cli.command {
                Commands::Answer { text } => {
                    assert_eq!(text.join(" "), "SELECT name FROM employees;");
                }
                _ => panic!("Expected Answer command"),
            }
        }

        #[test]
        fn parse_answer_choice_number() {
            let cli = Cli::try_parse_from(["sqldrill", "answer", "2"]).unwrap();
            match cli.command {
                Commands::Answer { text } => assert_eq!(text, vec!["2".to_string()]),
                _ => panic!("Expected Answer command"),
            }
        }

        #[test]
        fn parse_answer_requires_text() {
            assert!(Cli::try_parse_from(["sqldrill", "answer"]).is_err());
        }

        #[test]
        fn parse_jump() {
            let cli = Cli::try_parse_from(["sqldrill", "jump", "group by", "free"]).unwrap();
            match cli.command {
                Commands::Jump { topic, format } => {
                    assert_eq!(topic, "group by");
                    assert_eq!(format, "free");
                }
                _ => panic!("Expected Jump command"),
            }
        }

        #[test]
        fn parse_practice() {
            let cli = Cli::try_parse_from(["sqldrill", "practice", "join", "mc"]).unwrap();
            match cli.command {
                Commands::Practice { topic, format } => {
                    assert_eq!(topic, "join");
                    assert_eq!(format, "mc");
                }
                _ => panic!("Expected Practice command"),
            }
        }

        #[test]
        fn parse_jump_requires_both_args() {
            assert!(Cli::try_parse_from(["sqldrill", "jump", "join"]).is_err());
        }

        #[test]
        fn parse_history_default_limit() {
            let cli = Cli::try_parse_from(["sqldrill", "history"]).unwrap();
            match cli.command {
                Commands::History { limit } => assert_eq!(limit, DEFAULT_HISTORY_LIMIT),
                _ => panic!("Expected History command"),
            }
        }

        #[test]
        fn parse_history_short_limit() {
            let cli = Cli::try_parse_from(["sqldrill", "history", "-l", "25"]).unwrap();
            match cli.command {
                Commands::History { limit } => assert_eq!(limit, 25),
                _ => panic!("Expected History command"),
            }
        }

        #[test]
        fn parse_items_with_topic() {
            let cli = Cli::try_parse_from(["sqldrill", "items", "--topic", "join"]).unwrap();
            match cli.command {
                Commands::Items { topic } => assert_eq!(topic.as_deref(), Some("join")),
                _ => panic!("Expected Items command"),
            }
        }

        #[test]
        fn parse_simple_commands() {
            assert!(matches!(
                Cli::try_parse_from(["sqldrill", "next"]).unwrap().command,
                Commands::Next
            ));
            assert!(matches!(
                Cli::try_parse_from(["sqldrill", "stats"]).unwrap().command,
                Commands::Stats
            ));
            assert!(matches!(
                Cli::try_parse_from(["sqldrill", "reset"]).unwrap().command,
                Commands::Reset
            ));
            assert!(matches!(
                Cli::try_parse_from(["sqldrill", "tui"]).unwrap().command,
                Commands::Tui
            ));
        }

        #[test]
        fn parse_invalid_command_fails() {
            assert!(Cli::try_parse_from(["sqldrill", "invalid"]).is_err());
        }
    }

    mod output_tests {
        use super::*;

        fn item() -> Item {
            Item {
                id: "WHERE_1".to_string(),
                topic: Topic::Where,
                title: "Filter".to_string(),
                answer_sql: "SELECT a FROM t WHERE b = 1;".to_string(),
                explanation: "Returns a where b is one".to_string(),
                choices: vec![
                    "SELECT a FROM t WHERE b = 1;".to_string(),
                    "SELECT a FROM t;".to_string(),
                    "SELECT b FROM t;".to_string(),
                ],
                blank_template: None,
                blank_answer: None,
            }
        }

        #[test]
        fn answer_hint_per_format() {
            assert_eq!(answer_hint(Format::MultipleChoice, &item()), "1-3");
            assert_eq!(answer_hint(Format::Explanation, &item()), "explanation");
        }

        #[test]
        fn answer_hint_without_choices_asks_for_query() {
            let mut i = item();
            i.choices.clear();
            assert_eq!(answer_hint(Format::MultipleChoice, &i), "query");
        }

        #[test]
        fn topic_names_list_every_topic() {
            let names = topic_names();
            for topic in Topic::ALL {
                assert!(names.contains(topic.as_str()));
            }
        }
    }
}
