use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
    Frame,
};

use super::practice::outcome_color;
use crate::truncate;
use crate::tui::App;

pub fn draw(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(0),    // Attempts
            Constraint::Length(6), // Selected attempt
        ])
        .split(area);

    draw_attempts(f, app, chunks[0]);
    draw_selected(f, app, chunks[1]);
}

fn draw_attempts(f: &mut Frame, app: &App, area: Rect) {
    let items: Vec<ListItem> = app
        .history
        .items
        .iter()
        .map(|a| {
            ListItem::new(Line::from(vec![
                Span::styled(
                    format!("{:<14}", a.recorded_at.format("%b %d %H:%M")),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(
                    format!("{:<10}", a.topic.label()),
                    Style::default().fg(Color::White),
                ),
                Span::styled(
                    format!("{:<6}", a.format.short_label()),
                    Style::default().fg(Color::Cyan),
                ),
                Span::styled(
                    format!("{:<19}", a.outcome.label()),
                    Style::default().fg(outcome_color(a.outcome)),
                ),
                Span::raw(truncate(&a.answer, 40)),
            ]))
        })
        .collect();

    let block = Block::default()
        .borders(Borders::ALL)
        .title(format!(" History ({}) ", app.history.items.len()))
        .title_style(Style::default().fg(Color::Cyan));

    let list = List::new(items)
        .block(block)
        .highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");

    let mut state = ListState::default();
    state.select(app.history.selected);

    f.render_stateful_widget(list, area, &mut state);
}

fn draw_selected(f: &mut Frame, app: &App, area: Rect) {
    let selected = app.history.selected.and_then(|i| app.history.items.get(i));

    let text = match selected {
        Some(a) => vec![
            Line::from(vec![
                Span::styled("Answer: ", Style::default().fg(Color::Gray)),
                Span::raw(a.answer.as_str()),
            ]),
            Line::from(vec![
                Span::styled("Feedback: ", Style::default().fg(Color::Gray)),
                Span::raw(a.feedback.as_str()),
            ]),
            Line::from(vec![
                Span::styled("Item: ", Style::default().fg(Color::Gray)),
                Span::raw(a.item_id.as_deref().unwrap_or("-")),
            ]),
        ],
        None => vec![Line::from(Span::styled(
            "No attempts yet",
            Style::default().fg(Color::DarkGray),
        ))],
    };

    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Detail ")
        .title_style(Style::default().fg(Color::Magenta));

    f.render_widget(Paragraph::new(text).block(block).wrap(Wrap { trim: true }), area);
}
