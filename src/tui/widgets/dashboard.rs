use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell as TableCell, List, ListItem, Paragraph, Row, Table},
    Frame,
};

use crate::models::{Cell, Format, Topic};
use crate::tui::App;

pub fn draw(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(8),  // Progress + stats row
            Constraint::Length(12), // Curriculum grid
            Constraint::Min(0),     // Weak points
        ])
        .split(area);

    let top_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(chunks[0]);

    draw_progress(f, app, top_chunks[0]);
    draw_stats(f, app, top_chunks[1]);
    draw_grid(f, app, chunks[1]);
    draw_weak_points(f, app, chunks[2]);
}

fn draw_progress(f: &mut Frame, app: &App, area: Rect) {
    let status = &app.status;

    let text = if status.curriculum_complete {
        vec![Line::from(Span::styled(
            "Curriculum complete",
            Style::default()
                .fg(Color::Green)
                .add_modifier(Modifier::BOLD),
        ))]
    } else {
        vec![
            Line::from(vec![
                Span::styled("Topic: ", Style::default().fg(Color::Gray)),
                Span::styled(
                    status.cell.topic.label(),
                    Style::default()
                        .fg(Color::White)
                        .add_modifier(Modifier::BOLD),
                ),
            ]),
            Line::from(vec![
                Span::styled("Format: ", Style::default().fg(Color::Gray)),
                Span::styled(status.cell.format.label(), Style::default().fg(Color::Cyan)),
            ]),
            Line::from(vec![
                Span::styled("Window: ", Style::default().fg(Color::Gray)),
                Span::styled(
                    window_bar(status.format_attempt_count, status.threshold),
                    Style::default().fg(Color::Green),
                ),
                Span::styled(
                    format!(" {}/{}", status.format_attempt_count.min(status.threshold), status.threshold),
                    Style::default().fg(Color::Yellow),
                ),
            ]),
            Line::from(vec![
                Span::styled("Completed cells: ", Style::default().fg(Color::Gray)),
                Span::styled(
                    format!("{}/32", status.completed.len()),
                    Style::default().fg(Color::White),
                ),
            ]),
        ]
    };

    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Progress ")
        .title_style(Style::default().fg(Color::Yellow));

    f.render_widget(Paragraph::new(text).block(block), area);
}

fn draw_stats(f: &mut Frame, app: &App, area: Rect) {
    let stats = &app.overall;

    let text = vec![
        Line::from(vec![
            Span::styled("Attempts: ", Style::default().fg(Color::Gray)),
            Span::styled(format!("{}", stats.total), Style::default().fg(Color::White)),
        ]),
        Line::from(vec![
            Span::styled("Correct: ", Style::default().fg(Color::Gray)),
            Span::styled(format!("{}", stats.correct), Style::default().fg(Color::Green)),
            Span::styled("  Partial: ", Style::default().fg(Color::Gray)),
            Span::styled(format!("{}", stats.partial), Style::default().fg(Color::Yellow)),
            Span::styled("  Incorrect: ", Style::default().fg(Color::Gray)),
            Span::styled(format!("{}", stats.incorrect), Style::default().fg(Color::Red)),
        ]),
        Line::from(vec![
            Span::styled("Accuracy: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!("{:.1}%", stats.accuracy),
                Style::default().fg(accuracy_color(stats.accuracy, stats.total)),
            ),
        ]),
    ];

    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Stats ")
        .title_style(Style::default().fg(Color::Cyan));

    f.render_widget(Paragraph::new(text).block(block), area);
}

// One row per topic, one column per format.
fn draw_grid(f: &mut Frame, app: &App, area: Rect) {
    let header = Row::new(
        std::iter::once(TableCell::from("Topic")).chain(
            Format::ALL
                .iter()
                .map(|format| TableCell::from(format.short_label())),
        ),
    )
    .style(Style::default().fg(Color::DarkGray));

    let rows = Topic::ALL.iter().map(|&topic| {
        let cells = Format::ALL.iter().map(|&format| {
            let cell = Cell::new(topic, format);
            let (text, style) = grid_cell(app, cell);
            TableCell::from(text).style(style)
        });
        Row::new(std::iter::once(TableCell::from(topic.label())).chain(cells))
    });

    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Curriculum ")
        .title_style(Style::default().fg(Color::Magenta));

    let table = Table::new(
        rows,
        [
            Constraint::Length(12),
            Constraint::Length(10),
            Constraint::Length(10),
            Constraint::Length(10),
            Constraint::Length(10),
        ],
    )
    .header(header)
    .block(block);

    f.render_widget(table, area);
}

fn grid_cell(app: &App, cell: Cell) -> (String, Style) {
    let stats = app
        .cells
        .iter()
        .find(|s| s.topic == cell.topic && s.format == cell.format);
    let accuracy = match stats {
        Some(s) if s.total > 0 => format!("{:.0}%", s.accuracy),
        _ => "-".to_string(),
    };

    if !app.status.curriculum_complete && app.status.cell == cell {
        (
            format!("> {}", accuracy),
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )
    } else if app.status.completed.contains(&cell) {
        (format!("+ {}", accuracy), Style::default().fg(Color::Green))
    } else {
        (format!("  {}", accuracy), Style::default().fg(Color::DarkGray))
    }
}

fn draw_weak_points(f: &mut Frame, app: &App, area: Rect) {
    let items: Vec<ListItem> = if app.weak_points.is_empty() {
        vec![ListItem::new(Span::styled(
            "No weak topics",
            Style::default().fg(Color::DarkGray),
        ))]
    } else {
        app.weak_points
            .iter()
            .enumerate()
            .map(|(i, w)| {
                ListItem::new(Line::from(vec![
                    Span::styled(format!("{}. ", i + 1), Style::default().fg(Color::DarkGray)),
                    Span::styled(format!("{:<12}", w.topic.label()), Style::default().fg(Color::White)),
                    Span::styled(format!("{:>5.1}%", w.accuracy), Style::default().fg(Color::Red)),
                    Span::styled(
                        format!("  ({}/{})", w.correct, w.total),
                        Style::default().fg(Color::DarkGray),
                    ),
                ]))
            })
            .collect()
    };

    let block = Block::default()
        .borders(Borders::ALL)
        .title(" Weak Points ")
        .title_style(Style::default().fg(Color::Red));

    f.render_widget(List::new(items).block(block), area);
}

fn window_bar(count: u32, threshold: u32) -> String {
    let filled = count.min(threshold) as usize;
    let empty = threshold as usize - filled;
    format!("{}{}", "█".repeat(filled), "░".repeat(empty))
}

fn accuracy_color(accuracy: f64, total: u32) -> Color {
    if total == 0 {
        Color::White
    } else if accuracy >= 80.0 {
        Color::Green
    } else if accuracy >= 60.0 {
        Color::Yellow
    } else {
        Color::Red
    }
}
