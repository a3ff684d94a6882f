use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use tracing::warn;

use crate::app::{App, FetchOptions, FetchPlan, FetchResult, action_label};
use crate::coordinator::{AcquisitionListener, AcquisitionOutcome};
use crate::dispatch::{Job, drain};
use crate::domain::DatasetKey;
use crate::manifest::Manifest;
use crate::progress::ProgressUpdate;
use crate::task::Stage;
use crate::transfer::TransferClient;
use crate::verify::IntegrityResult;

const EVENTS_MAX: usize = 8;
const TICK: Duration = Duration::from_millis(120);

#[derive(Debug, Clone)]
struct Row {
    key: DatasetKey,
    stage: Stage,
    percent: Option<f64>,
    detail: String,
}

#[derive(Debug)]
struct DashboardState {
    rows: Vec<Row>,
    events: VecDeque<String>,
    started: Instant,
    cancelling: bool,
}

impl DashboardState {
    fn row_mut(&mut self, key: &DatasetKey) -> Option<&mut Row> {
        self.rows.iter_mut().find(|row| &row.key == key)
    }

    fn push_event(&mut self, message: String) {
        self.events
            .push_back(format!("[{}] {message}", timestamp()));
        while self.events.len() > EVENTS_MAX {
            self.events.pop_front();
        }
    }
}

/// Applies acquisition events to the dashboard. Runs on the thread that
/// drains the dispatcher, i.e. the draw loop.
struct TuiListener {
    state: Arc<Mutex<DashboardState>>,
}

impl AcquisitionListener for TuiListener {
    fn on_stage(&self, key: &DatasetKey, stage: Stage) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(row) = state.row_mut(key) {
                row.stage = stage;
                row.percent = None;
                row.detail.clear();
            }
            state.push_event(format!("{key}: {stage}"));
        }
    }

    fn on_progress(&self, key: &DatasetKey, progress: &ProgressUpdate) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(row) = state.row_mut(key) {
                row.percent = progress.percent();
                row.detail = progress.label();
            }
        }
    }

    fn on_integrity(&self, key: &DatasetKey, result: &IntegrityResult) {
        let message = match result {
            IntegrityResult::Match { .. } => format!("{key}: checksum ok"),
            IntegrityResult::Mismatch { .. } => format!("{key}: checksum mismatch"),
            IntegrityResult::Unavailable => format!("{key}: no checksum available"),
        };
        if let Ok(mut state) = self.state.lock() {
            state.push_event(message);
        }
    }

    fn on_finished(&self, outcome: &AcquisitionOutcome) {
        if let Ok(mut state) = self.state.lock() {
            let (stage, detail) = match outcome {
                AcquisitionOutcome::Installed { verified, .. } => (
                    Stage::Completed,
                    if *verified { "verified" } else { "unverified" }.to_string(),
                ),
                AcquisitionOutcome::Failed { reason, .. } => (Stage::Failed, reason.clone()),
                AcquisitionOutcome::Cancelled { .. } => (Stage::Cancelled, String::new()),
            };
            if let Some(row) = state.row_mut(outcome.key()) {
                row.stage = stage;
                row.detail = detail;
                if stage == Stage::Completed {
                    row.percent = Some(100.0);
                }
            }
            state.push_event(format!("{}: {}", outcome.key(), action_label(outcome)));
        }
    }
}

pub struct Tui {
    state: Arc<Mutex<DashboardState>>,
    selected: usize,
}

impl Default for Tui {
    fn default() -> Self {
        Self::new()
    }
}

impl Tui {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DashboardState {
                rows: Vec::new(),
                events: VecDeque::new(),
                started: Instant::now(),
                cancelling: false,
            })),
            selected: 0,
        }
    }

    /// Starts the requested acquisitions and shows them until every one has
    /// ended. `jobs` must be the receiver paired with the coordinator's
    /// dispatcher.
    pub fn run_fetch<T>(
        &mut self,
        app: &App<T>,
        manifest: &Manifest,
        keys: &[DatasetKey],
        options: FetchOptions,
        jobs: &Receiver<Job>,
    ) -> miette::Result<FetchResult>
    where
        T: TransferClient + 'static,
    {
        let listener = Arc::new(TuiListener {
            state: self.state.clone(),
        });
        let plan = app
            .start_fetch(manifest, keys, options, listener)
            .into_diagnostic()?;
        self.seed_rows(&plan);

        let looped = TerminalGuard::enter()
            .into_diagnostic()
            .and_then(|_guard| self.event_loop(app, &plan, jobs));
        if looped.is_err() {
            app.coordinator().cancel_all();
        }
        let finished = plan.finish().into_diagnostic();
        drain(jobs);
        looped?;
        finished
    }

    fn seed_rows(&self, plan: &FetchPlan) {
        if let Ok(mut state) = self.state.lock() {
            for handle in &plan.handles {
                state.rows.push(Row {
                    key: handle.key().clone(),
                    stage: Stage::Downloading,
                    percent: None,
                    detail: "queued".to_string(),
                });
            }
            for key in &plan.skipped {
                state.rows.push(Row {
                    key: key.clone(),
                    stage: Stage::Completed,
                    percent: Some(100.0),
                    detail: "up to date".to_string(),
                });
            }
            for key in &plan.in_progress {
                state.rows.push(Row {
                    key: key.clone(),
                    stage: Stage::Downloading,
                    percent: None,
                    detail: "already in progress elsewhere".to_string(),
                });
            }
        }
    }

    fn event_loop<T>(
        &mut self,
        app: &App<T>,
        plan: &FetchPlan,
        jobs: &Receiver<Job>,
    ) -> miette::Result<()>
    where
        T: TransferClient + 'static,
    {
        let backend = CrosstermBackend::new(io::stdout());
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let mut tick = 0usize;
        loop {
            drain(jobs);
            let data_root = app.settings().data_root.to_string();
            if let Ok(state) = self.state.lock() {
                terminal
                    .draw(|frame| draw_ui(frame, &state, self.selected, &data_root, tick))
                    .into_diagnostic()?;
            }

            if plan.handles.iter().all(|handle| handle.is_finished()) {
                drain(jobs);
                return Ok(());
            }

            if event::poll(TICK).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    self.handle_key(key, app);
                }
            }
            tick = tick.wrapping_add(1);
        }
    }

    fn handle_key<T>(&mut self, key: KeyEvent, app: &App<T>)
    where
        T: TransferClient + 'static,
    {
        if key.kind != KeyEventKind::Press {
            return;
        }
        let row_count = self.state.lock().map(|state| state.rows.len()).unwrap_or(0);
        match key.code {
            KeyCode::Up => self.selected = self.selected.saturating_sub(1),
            KeyCode::Down => {
                if self.selected + 1 < row_count {
                    self.selected += 1;
                }
            }
            KeyCode::Char('c') => {
                let selected = self
                    .state
                    .lock()
                    .ok()
                    .and_then(|state| state.rows.get(self.selected).map(|row| row.key.clone()));
                if let Some(key) = selected {
                    if app.coordinator().cancel(&key) {
                        if let Ok(mut state) = self.state.lock() {
                            state.push_event(format!("{key}: cancel requested"));
                        }
                    }
                }
            }
            KeyCode::Char('q') | KeyCode::Esc => {
                let cancelled = app.coordinator().cancel_all();
                if let Ok(mut state) = self.state.lock() {
                    state.cancelling = true;
                    state.push_event(format!("cancelling {cancelled} acquisitions"));
                }
            }
            _ => {}
        }
    }
}

fn draw_ui(
    frame: &mut ratatui::Frame,
    state: &DashboardState,
    selected: usize,
    data_root: &str,
    tick: usize,
) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(EVENTS_MAX as u16 + 2),
            Constraint::Length(1),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(state, data_root, tick), chunks[0]);
    frame.render_widget(draw_tasks(state, selected), chunks[1]);
    frame.render_widget(draw_events(state), chunks[2]);

    let footer = if state.cancelling {
        "cancelling, waiting for workers to stop"
    } else {
        "Up/Down select   c cancel selected   q/Esc cancel all"
    };
    frame.render_widget(
        Paragraph::new(Span::styled(footer, Style::default().fg(Color::Gray))),
        chunks[3],
    );
}

fn draw_header(state: &DashboardState, data_root: &str, tick: usize) -> Paragraph<'static> {
    let hb = if tick % 2 == 0 { "*" } else { " " };
    let running = state
        .rows
        .iter()
        .filter(|row| !row.stage.is_terminal())
        .count();
    let header_line = Line::from(vec![
        Span::styled(
            "SKYDATA",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw(format!(
            "   Running: {running}/{}   Elapsed: {}s   ",
            state.rows.len(),
            state.started.elapsed().as_secs()
        )),
        Span::styled(hb, Style::default().fg(Color::Green)),
    ]);
    let root_line = Line::from(Span::styled(
        format!("Data root: {data_root}"),
        Style::default().fg(Color::Gray),
    ));
    Paragraph::new(vec![header_line, root_line])
        .alignment(Alignment::Left)
        .block(Block::default().borders(Borders::BOTTOM))
}

fn draw_tasks(state: &DashboardState, selected: usize) -> Paragraph<'static> {
    let width = state
        .rows
        .iter()
        .map(|row| row.key.as_str().len())
        .max()
        .unwrap_or(0);
    let mut lines = Vec::new();
    for (index, row) in state.rows.iter().enumerate() {
        let marker = if index == selected { ">" } else { " " };
        let percent = row.percent.map(|p| p.round() as u8);
        lines.push(Line::from(vec![
            Span::raw(format!("{marker} {:<width$} ", row.key.as_str())),
            Span::styled(
                format!("{:<11} ", row.stage.to_string()),
                Style::default().fg(stage_color(row.stage)),
            ),
            Span::raw(progress_bar(percent.unwrap_or(0))),
            Span::raw(
                percent
                    .map(|p| format!(" {p:>3}% "))
                    .unwrap_or_else(|| "   -- ".to_string()),
            ),
            Span::styled(row.detail.clone(), Style::default().fg(Color::Gray)),
        ]));
    }
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Acquisitions"))
        .wrap(Wrap { trim: false })
}

fn draw_events(state: &DashboardState) -> Paragraph<'static> {
    let lines = state
        .events
        .iter()
        .map(|event| Line::from(event.clone()))
        .collect::<Vec<_>>();
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Events"))
        .wrap(Wrap { trim: true })
}

fn stage_color(stage: Stage) -> Color {
    match stage {
        Stage::Downloading | Stage::Verifying | Stage::Extracting => Color::Cyan,
        Stage::Completed => Color::Green,
        Stage::Failed => Color::Red,
        Stage::Cancelled => Color::Yellow,
    }
}

fn progress_bar(percent: u8) -> String {
    let total = 20;
    let filled = (percent.min(100) as usize * total) / 100;
    let mut out = String::from("[");
    for i in 0..total {
        out.push(if i < filled { '#' } else { '.' });
    }
    out.push(']');
    out
}

fn timestamp() -> String {
    let now = SystemTime::now();
    let secs = now
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs();
    let mins = (secs / 60) % 60;
    let hours = (secs / 3600) % 24;
    let seconds = secs % 60;
    format!("{hours:02}:{mins:02}:{seconds:02}")
}

/// Raw mode and the alternate screen, restored on drop even when the event
/// loop fails.
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        if let Err(err) = io::stdout().execute(EnterAlternateScreen) {
            let _ = disable_raw_mode();
            return Err(err);
        }
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let restored = restore_terminal(disable_raw_mode, || {
            io::stdout().execute(LeaveAlternateScreen).map(|_| ())
        });
        if let Err(err) = restored {
            warn!("failed to restore terminal: {err}");
        }
    }
}

/// Runs both restore steps and reports the first failure.
fn restore_terminal(
    disable: impl FnOnce() -> io::Result<()>,
    leave: impl FnOnce() -> io::Result<()>,
) -> io::Result<()> {
    let disabled = disable();
    let left = leave();
    disabled.and(left)
}
