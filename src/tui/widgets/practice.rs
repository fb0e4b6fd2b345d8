use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame,
};

use crate::models::{Format, Item, Mode, Outcome};
use crate::tui::App;

pub fn draw(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(8),    // Question
            Constraint::Length(3), // Answer input
            Constraint::Length(7), // Feedback
        ])
        .split(area);

    draw_question(f, app, chunks[0]);
    draw_input(f, app, chunks[1]);
    draw_feedback(f, app, chunks[2]);
}

fn draw_question(f: &mut Frame, app: &App, area: Rect) {
    let Some(active) = &app.current else {
        let message = if app.complete {
            Line::from(Span::styled(
                "Curriculum complete. Jump to any cell from the CLI to keep drilling.",
                Style::default()
                    .fg(Color::Green)
                    .add_modifier(Modifier::BOLD),
            ))
        } else {
            Line::from(vec![
                Span::raw("Press "),
                Span::styled("n", Style::default().fg(Color::Cyan)),
                Span::raw(" for the next question."),
            ])
        };
        let block = Block::default().borders(Borders::ALL).title(" Practice ");
        f.render_widget(Paragraph::new(message).block(block), area);
        return;
    };

    let item = &active.item;
    let suffix = match active.mode {
        Mode::Practice => " (practice)",
        Mode::Adaptive => "",
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .title(format!(
            " {} / {}{} ",
            item.topic.label(),
            active.format.label(),
            suffix
        ))
        .title_style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        );

    let paragraph = Paragraph::new(question_lines(active.format, item))
        .block(block)
        .wrap(Wrap { trim: false });
    f.render_widget(paragraph, area);
}

pub(crate) fn question_lines(format: Format, item: &Item) -> Vec<Line<'_>> {
    let mut lines = vec![
        Line::from(Span::styled(
            item.title.as_str(),
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
    ];

    match format {
        Format::MultipleChoice => match item.choice_options() {
            Some(choices) => {
                lines.push(Line::from(Span::styled(
                    "Pick the query that answers this (type 1-3):",
                    Style::default().fg(Color::Gray),
                )));
                for (i, choice) in choices.into_iter().enumerate() {
                    lines.push(Line::from(vec![
                        Span::styled(format!("  {}. ", i + 1), Style::default().fg(Color::Cyan)),
                        Span::raw(choice),
                    ]));
                }
            }
            None => lines.push(Line::from(Span::styled(
                "Write the query:",
                Style::default().fg(Color::Gray),
            ))),
        },
        Format::FillInBlank => match item.blank() {
            Some((template, _)) => {
                lines.push(Line::from(Span::styled(
                    "Fill in the blank:",
                    Style::default().fg(Color::Gray),
                )));
                lines.push(Line::from(Span::styled(
                    format!("  {}", template),
                    Style::default().fg(Color::Cyan),
                )));
            }
            None => lines.push(Line::from(Span::styled(
                "Write the full query:",
                Style::default().fg(Color::Gray),
            ))),
        },
        Format::FreeForm => lines.push(Line::from(Span::styled(
            "Write the query:",
            Style::default().fg(Color::Gray),
        ))),
        Format::Explanation => {
            lines.push(Line::from(Span::styled(
                "Explain in your own words what this query returns:",
                Style::default().fg(Color::Gray),
            )));
            lines.push(Line::from(Span::styled(
                format!("  {}", item.answer_sql),
                Style::default().fg(Color::Cyan),
            )));
        }
    }

    lines
}

fn draw_input(f: &mut Frame, app: &App, area: Rect) {
    let (border, cursor) = if app.insert_mode {
        (Color::Yellow, "█")
    } else {
        (Color::DarkGray, "")
    };

    let line = Line::from(vec![
        Span::styled("> ", Style::default().fg(Color::Cyan)),
        Span::raw(app.input.as_str()),
        Span::styled(cursor, Style::default().fg(Color::Yellow)),
    ]);

    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Answer ")
        .border_style(Style::default().fg(border));

    f.render_widget(Paragraph::new(line).block(block), area);
}

fn draw_feedback(f: &mut Frame, app: &App, area: Rect) {
    let mut lines = Vec::new();

    if let Some(sub) = &app.last_submission {
        lines.push(Line::from(Span::styled(
            sub.outcome.label(),
            Style::default()
                .fg(outcome_color(sub.outcome))
                .add_modifier(Modifier::BOLD),
        )));
        if !sub.feedback.is_empty() {
            lines.push(Line::from(sub.feedback.as_str()));
        }
    }

    if let Some(notice) = &app.notice {
        lines.push(Line::from(Span::styled(
            notice.as_str(),
            Style::default().fg(Color::Magenta),
        )));
    }

    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Feedback ")
        .title_style(Style::default().fg(Color::Cyan));

    let paragraph = Paragraph::new(lines).block(block).wrap(Wrap { trim: true });
    f.render_widget(paragraph, area);
}

pub(crate) fn outcome_color(outcome: Outcome) -> Color {
    match outcome {
        Outcome::Correct => Color::Green,
        Outcome::Partial => Color::Yellow,
        Outcome::Incorrect => Color::Red,
    }
}
