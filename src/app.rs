//! App: terminal init, main loop, physics ticks and key/mouse handling.

use crate::GameConfig;
use crate::board::Vec2;
use crate::input::{Action, key_to_action, session_command};
use crate::persist::Persistence;
use crate::physics::Physics;
use crate::session::{Session, SessionError, SessionEvent};
use crate::theme::Theme;
use crate::ui::{self, BoardView, Effects, Hud};
use anyhow::Result;
use crossterm::event::{self, Event, KeyEventKind, MouseButton, MouseEventKind};
use ratatui::DefaultTerminal;
use std::time::{Duration, Instant};

const FRAME: Duration = Duration::from_millis(16);

pub struct App<P: Persistence> {
    session: Session<P>,
    theme: Theme,
    physics: Physics,
    hud: Hud,
    effects: Effects,
    /// Geometry of the last drawn frame; maps the cursor and mouse to board points.
    view: Option<BoardView>,
    tick_interval: Duration,
    last_tick: Instant,
}

impl<P: Persistence> App<P> {
    pub fn new(session: Session<P>, config: &GameConfig, theme: Theme) -> Self {
        let rate = if config.tick_rate > 0.0 { config.tick_rate } else { 30.0 };
        Self {
            session,
            theme,
            physics: Physics::default(),
            hud: Hud::default(),
            effects: Effects::new(!config.no_animation),
            view: None,
            tick_interval: Duration::from_secs_f64(1.0 / rate),
            last_tick: Instant::now(),
        }
    }

    /// Hand the session back, e.g. to drain persistence after the terminal is restored.
    pub fn into_session(self) -> Session<P> {
        self.session
    }

    pub fn run(&mut self) -> Result<()> {
        use crossterm::{
            event::{DisableFocusChange, DisableMouseCapture, EnableFocusChange, EnableMouseCapture},
            execute,
            terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
        };

        enable_raw_mode()?;
        let mut stdout = std::io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture, EnableFocusChange)?;
        let mut terminal = DefaultTerminal::new(ratatui::backend::CrosstermBackend::new(stdout))?;

        let result = self.run_loop(&mut terminal);
        self.session.close();

        let _ = execute!(std::io::stdout(), DisableFocusChange, DisableMouseCapture);
        execute!(std::io::stdout(), LeaveAlternateScreen)?;
        disable_raw_mode()?;
        result
    }

    fn run_loop(&mut self, terminal: &mut DefaultTerminal) -> Result<()> {
        loop {
            let now = Instant::now();
            let mut drawn = None;
            terminal.draw(|f| {
                drawn = Some(ui::draw(f, &self.session, &self.theme, &self.hud, &mut self.effects, now));
            })?;
            self.view = drawn;

            let timeout = FRAME.saturating_sub(now.elapsed());
            if event::poll(timeout)? {
                while event::poll(Duration::ZERO)? {
                    if !self.handle_event(event::read()?, Instant::now()) {
                        return Ok(());
                    }
                }
            }

            if self.last_tick.elapsed() >= self.tick_interval {
                self.last_tick = Instant::now();
                self.step(self.last_tick);
            }
            self.absorb_events();
        }
    }

    /// Physics settle then session timers.
    fn step(&mut self, now: Instant) {
        if self.session.is_playing() && !self.session.is_paused() {
            let updates = self
                .physics
                .step(self.session.board(), self.session.rules(), self.session.gravity());
            if !updates.is_empty() {
                self.session.apply_positions(&updates, now);
            }
        }
        self.session.tick(now);
    }

    /// Returns false to quit.
    fn handle_event(&mut self, event: Event, now: Instant) -> bool {
        match event {
            Event::Key(key) if key.kind == KeyEventKind::Press => self.handle_action(key_to_action(key), now),
            Event::Mouse(mouse) if mouse.kind == MouseEventKind::Down(MouseButton::Left) => {
                if let Some(cell) = self.view.and_then(|v| v.hit(mouse.column, mouse.row)) {
                    self.hud.cursor = cell;
                    self.handle_action(Action::Tap, now)
                } else {
                    true
                }
            }
            Event::FocusLost => {
                log::debug!("focus lost, suspending");
                self.session.pause();
                true
            }
            _ => true,
        }
    }

    fn handle_action(&mut self, action: Action, now: Instant) -> bool {
        if self.session.is_paused() {
            match action {
                Action::Pause => self.session.resume(now),
                Action::Quit => return false,
                _ => {}
            }
            return true;
        }

        if let Some(command) = session_command(action, self.cursor_point()) {
            self.session.apply(command, now);
            return true;
        }

        let level = self.session.progress().level_number;
        match action {
            Action::Quit => return false,
            Action::Cursor(dx, dy) => self.move_cursor(dx, dy),
            Action::Pause => self.session.pause(),
            Action::Restart => {
                self.effects.clear();
                self.session.restart(now);
            }
            Action::Continue => {
                if self.session.continue_level(now) {
                    self.effects.clear();
                }
            }
            Action::EndLevel => self.session.end_level(now),
            Action::CycleVariant => {
                let color = crate::level::level_color(level);
                if let Some(variant) = self.session.cycle_variant(color) {
                    self.hud.status = Some(format!("{color} is now {variant}"));
                }
            }
            Action::PrevLevel if level > 1 => self.switch_level(level - 1, now),
            Action::NextLevel => self.switch_level(level + 1, now),
            Action::NewGame => {
                self.effects.clear();
                if let Err(e) = self.session.new_game(now) {
                    log::error!("new game failed: {e}");
                    self.hud.status = Some("Could not reset save".to_string());
                }
            }
            _ => {}
        }
        true
    }

    fn switch_level(&mut self, level: u32, now: Instant) {
        self.effects.clear();
        match self.session.start(level, now) {
            Ok(()) => self.hud.status = None,
            Err(SessionError::Locked { pack, .. }) => {
                self.hud.status = Some(format!("Level {level} needs {pack}"));
            }
            Err(e) => {
                log::error!("could not start level {level}: {e}");
                self.hud.status = Some(format!("Level {level} unavailable"));
            }
        }
    }

    fn move_cursor(&mut self, dx: i8, dy: i8) {
        let Some(view) = self.view else {
            return;
        };
        let (col, row) = self.hud.cursor;
        let col = col.saturating_add_signed(i16::from(dx)).min(view.cols - 1);
        let row = row.saturating_add_signed(i16::from(dy)).min(view.rows - 1);
        self.hud.cursor = (col, row);
    }

    fn cursor_point(&self) -> Vec2 {
        self.view
            .map_or(Vec2::ZERO, |v| v.point_of(self.hud.cursor.0, self.hud.cursor.1))
    }

    /// Turn session notifications into HUD text and effects.
    fn absorb_events(&mut self) {
        for event in self.session.drain_events() {
            match event {
                SessionEvent::SelectionReady { len, .. } => {
                    self.hud.status = Some(format!("{len} selected, enter to merge"));
                }
                SessionEvent::SelectionRejected { piece } => {
                    self.effects.flash_reject(piece);
                    self.hud.status = Some("Too small to merge".to_string());
                }
                SessionEvent::Evolved(evolution) => {
                    let mut text = format!(
                        "{} {} → {} {}",
                        evolution.removed.len(),
                        self.session.variant(evolution.from),
                        evolution.spawned.len(),
                        self.session.variant(evolution.to)
                    );
                    if evolution.potatoes > 0 {
                        text.push_str(&format!("  +{}", evolution.potatoes));
                    }
                    self.hud.status = Some(text);
                }
                SessionEvent::LevelFinished { .. } => self.effects.fade_in_finish(),
                SessionEvent::VariantUnlocked { color, variant } => {
                    self.hud.status = Some(format!("Unlocked {variant} for {color}!"));
                }
                SessionEvent::NewGame => self.hud.status = Some("New game".to_string()),
                SessionEvent::LevelUpdated { level, state, potatoes } => {
                    log::debug!("level {level} now {} with {potatoes} potatoes", state.label());
                }
            }
        }
    }
}
