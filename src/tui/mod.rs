mod ui;
mod widgets;

use std::io;
use std::time::Duration;

use chrono::Utc;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};

use crate::engine::{NextItem, Submission};
use crate::models::{ActiveItem, Attempt, CellStats, Mode, OverallStats, WeakPoint};
use crate::tutor::{Status, Tutor};

const HISTORY_LIMIT: usize = 50;
const WEAK_MIN_ATTEMPTS: u32 = 3;
const WEAK_BELOW: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Dashboard,
    Practice,
    History,
}

impl View {
    fn next(&self) -> Self {
        match self {
            View::Dashboard => View::Practice,
            View::Practice => View::History,
            View::History => View::Dashboard,
        }
    }

    fn prev(&self) -> Self {
        match self {
            View::Dashboard => View::History,
            View::Practice => View::Dashboard,
            View::History => View::Practice,
        }
    }
}

pub struct StatefulList<T> {
    pub items: Vec<T>,
    pub selected: Option<usize>,
}

impl<T> StatefulList<T> {
    fn with_items(items: Vec<T>) -> Self {
        let selected = if items.is_empty() { None } else { Some(0) };
        Self { items, selected }
    }

    fn next(&mut self) {
        if self.items.is_empty() {
            return;
        }
        let i = match self.selected {
            Some(i) if i + 1 < self.items.len() => i + 1,
            _ => 0,
        };
        self.selected = Some(i);
    }

    fn previous(&mut self) {
        if self.items.is_empty() {
            return;
        }
        let i = match self.selected {
            Some(0) | None => self.items.len() - 1,
            Some(i) => i - 1,
        };
        self.selected = Some(i);
    }
}

pub struct App<'a> {
    tutor: Tutor<'a>,
    pub view: View,
    pub status: Status,
    pub overall: OverallStats,
    pub cells: Vec<CellStats>,
    pub weak_points: Vec<WeakPoint>,
    pub history: StatefulList<Attempt>,
    pub current: Option<ActiveItem>,
    pub last_submission: Option<Submission>,
    pub notice: Option<String>,
    pub complete: bool,
    pub input: String,
    pub insert_mode: bool,
    pub should_quit: bool,
}

impl<'a> App<'a> {
    pub fn new(tutor: Tutor<'a>) -> Result<Self, Box<dyn std::error::Error>> {
        let status = tutor.status(Utc::now())?;
        let current = tutor.active_item()?;
        let complete = status.curriculum_complete;

        let mut app = Self {
            tutor,
            view: View::Dashboard,
            status,
            overall: OverallStats::default(),
            cells: Vec::new(),
            weak_points: Vec::new(),
            history: StatefulList::with_items(Vec::new()),
            current,
            last_submission: None,
            notice: None,
            complete,
            input: String::new(),
            insert_mode: false,
            should_quit: false,
        };
        app.refresh_data()?;
        Ok(app)
    }

    pub fn refresh_data(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let learner = self.tutor.learner().to_string();
        let db = self.tutor.db();
        self.overall = db.overall_stats(&learner)?;
        self.cells = db.cell_stats(&learner)?;
        self.weak_points = db.weak_points(&learner, WEAK_MIN_ATTEMPTS, WEAK_BELOW)?;
        self.history = StatefulList::with_items(db.history(&learner, HISTORY_LIMIT)?);
        self.status = self.tutor.status(Utc::now())?;
        self.complete = self.status.curriculum_complete;
        Ok(())
    }

    fn next_item(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.last_submission = None;
        self.input.clear();
        match self.tutor.next(Utc::now())? {
            NextItem::Serve(served) => {
                self.notice = match (served.transition, served.warning) {
                    (Some(t), Some(w)) => Some(format!("{}. {}", t.describe(), w)),
                    (Some(t), None) => Some(t.describe()),
                    (None, w) => w,
                };
                self.current = Some(ActiveItem {
                    format: served.cell.format,
                    item: served.item,
                    mode: Mode::Adaptive,
                });
            }
            NextItem::CurriculumComplete { transition } => {
                self.notice = transition.map(|t| t.describe());
                self.current = None;
            }
        }
        self.view = View::Practice;
        self.refresh_data()
    }

    fn submit(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if self.current.is_none() {
            self.insert_mode = false;
            return Ok(());
        }
        let submission = self.tutor.answer(&self.input, Utc::now())?;
        self.last_submission = Some(submission);
        self.current = None;
        self.input.clear();
        self.insert_mode = false;
        self.refresh_data()
    }

    fn handle_key(
        &mut self,
        key: KeyCode,
        modifiers: KeyModifiers,
    ) -> Result<(), Box<dyn std::error::Error>> {
        // Typing an answer
        if self.insert_mode {
            match key {
                KeyCode::Esc => self.insert_mode = false,
                KeyCode::Enter => self.submit()?,
                KeyCode::Backspace => {
                    self.input.pop();
                }
                KeyCode::Char(c) => self.input.push(c),
                _ => {}
            }
            return Ok(());
        }

        match key {
            KeyCode::Char('q') => self.should_quit = true,

            KeyCode::Char('r') if modifiers.contains(KeyModifiers::CONTROL) => {
                self.refresh_data()?;
            }

            KeyCode::Char('h') | KeyCode::Left | KeyCode::BackTab => self.view = self.view.prev(),
            KeyCode::Char('l') | KeyCode::Right | KeyCode::Tab => self.view = self.view.next(),

            KeyCode::Char('n') => self.next_item()?,

            KeyCode::Char('i') | KeyCode::Enter if self.current.is_some() => {
                self.view = View::Practice;
                self.insert_mode = true;
            }

            KeyCode::Char('j') | KeyCode::Down if self.view == View::History => {
                self.history.next();
            }
            KeyCode::Char('k') | KeyCode::Up if self.view == View::History => {
                self.history.previous();
            }

            KeyCode::Char('g') if self.view == View::History && !self.history.items.is_empty() => {
                self.history.selected = Some(0);
            }
            KeyCode::Char('G') if self.view == View::History && !self.history.items.is_empty() => {
                self.history.selected = Some(self.history.items.len() - 1);
            }

            _ => {}
        }
        Ok(())
    }
}

pub fn run(tutor: Tutor<'_>) -> Result<(), Box<dyn std::error::Error>> {
    // Create app state before touching the terminal so load errors print normally
    let mut app = App::new(tutor)?;

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Main loop
    let result = run_app(&mut terminal, &mut app);

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    result
}

fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App<'_>,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        terminal.draw(|f| ui::draw(f, app))?;

        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                app.handle_key(key.code, key.modifiers)?;
            }
        }

        if app.should_quit {
            return Ok(());
        }
    }
}
