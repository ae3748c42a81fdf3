//! Layout and drawing: board, sidebar, pause and level-finished overlays.

use crate::board::{PieceId, Vec2};
use crate::color::PieceColor;
use crate::persist::Persistence;
use crate::progress::LevelState;
use crate::session::Session;
use crate::theme::Theme;
use ratatui::Frame;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Paragraph, Widget};
use std::time::Instant;
use tachyonfx::{Duration as TfxDuration, Effect, EffectRenderer, Interpolation, fx};

const SIDEBAR_WIDTH: u16 = 30;
/// Each board cell is two terminal columns so emoji fit.
const CELL_COLS: u16 = 2;
const REJECT_FLASH_MS: u32 = 350;
const FINISH_FADE_MS: u32 = 500;

/// Where the board sits on screen and how terminal cells map to board units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoardView {
    /// Inner board rect (inside the border).
    pub inner: Rect,
    pub cols: u16,
    pub rows: u16,
    pub width: f32,
    pub height: f32,
}

impl BoardView {
    /// Largest grid with roughly square cells that fits `area` next to the sidebar.
    pub fn fit(area: Rect, width: f32, height: f32) -> Self {
        let max_rows = area.height.saturating_sub(2).max(1);
        let max_cols = (area.width.saturating_sub(SIDEBAR_WIDTH + 2) / CELL_COLS).max(1);
        let aspect = if height > 0.0 { width / height } else { 1.0 };
        let mut rows = max_rows;
        let mut cols = ((f32::from(rows) * aspect).round() as u16).max(1);
        if cols > max_cols {
            cols = max_cols;
            rows = ((f32::from(cols) / aspect).round() as u16).clamp(1, max_rows);
        }
        let outer_w = cols * CELL_COLS + 2;
        let outer_h = rows + 2;
        let total_w = outer_w + SIDEBAR_WIDTH;
        let x = area.x + area.width.saturating_sub(total_w) / 2;
        let y = area.y + area.height.saturating_sub(outer_h) / 2;
        Self {
            inner: Rect::new(x + 1, y + 1, cols * CELL_COLS, rows),
            cols,
            rows,
            width,
            height,
        }
    }

    pub fn outer(&self) -> Rect {
        Rect::new(
            self.inner.x.saturating_sub(1),
            self.inner.y.saturating_sub(1),
            self.inner.width + 2,
            self.inner.height + 2,
        )
    }

    fn cell_size(&self) -> (f32, f32) {
        (self.width / f32::from(self.cols), self.height / f32::from(self.rows))
    }

    /// Grid cell containing a board point. Board y grows up, rows grow down.
    pub fn cell_of(&self, point: Vec2) -> (u16, u16) {
        let (sx, sy) = self.cell_size();
        let col = (point.x / sx).floor().max(0.0) as u16;
        let row = ((self.height - point.y) / sy).floor().max(0.0) as u16;
        (col.min(self.cols - 1), row.min(self.rows - 1))
    }

    /// Board point at the centre of a grid cell.
    pub fn point_of(&self, col: u16, row: u16) -> Vec2 {
        let (sx, sy) = self.cell_size();
        Vec2::new(
            (f32::from(col) + 0.5) * sx,
            self.height - (f32::from(row) + 0.5) * sy,
        )
    }

    pub fn cell_rect(&self, col: u16, row: u16) -> Rect {
        Rect::new(self.inner.x + col * CELL_COLS, self.inner.y + row, CELL_COLS, 1)
    }

    /// Grid cell under a terminal position, if on the board.
    pub fn hit(&self, column: u16, row: u16) -> Option<(u16, u16)> {
        let inside = column >= self.inner.x
            && column < self.inner.x + self.inner.width
            && row >= self.inner.y
            && row < self.inner.y + self.inner.height;
        inside.then(|| ((column - self.inner.x) / CELL_COLS, row - self.inner.y))
    }

    fn sidebar(&self) -> Rect {
        let outer = self.outer();
        Rect::new(outer.x + outer.width, outer.y, SIDEBAR_WIDTH, outer.height)
    }
}

/// Front-end state that is not part of the session.
#[derive(Debug, Clone, Default)]
pub struct Hud {
    pub cursor: (u16, u16),
    pub status: Option<String>,
}

#[derive(Default)]
enum FxSlot {
    #[default]
    Idle,
    Requested,
    Running(Effect),
}

/// TachyonFX effects: reject flash on a piece and the fade-in of the level-finished panel.
#[derive(Default)]
pub struct Effects {
    enabled: bool,
    reject_piece: Option<PieceId>,
    reject: FxSlot,
    finish: FxSlot,
    processed_at: Option<Instant>,
}

impl Effects {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub fn flash_reject(&mut self, piece: PieceId) {
        if self.enabled {
            self.reject_piece = Some(piece);
            self.reject = FxSlot::Requested;
        }
    }

    pub fn fade_in_finish(&mut self) {
        if self.enabled {
            self.finish = FxSlot::Requested;
        }
    }

    pub fn clear(&mut self) {
        self.reject_piece = None;
        self.reject = FxSlot::Idle;
        self.finish = FxSlot::Idle;
    }

    fn delta(&mut self, now: Instant) -> TfxDuration {
        let delta = self
            .processed_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        self.processed_at = Some(now);
        TfxDuration::from_millis(delta.as_millis().min(u128::from(u32::MAX)) as u32)
    }
}

/// Draw the whole frame. Returns the board geometry so the caller can map the cursor and mouse.
pub fn draw<P: Persistence>(
    frame: &mut Frame,
    session: &Session<P>,
    theme: &Theme,
    hud: &Hud,
    effects: &mut Effects,
    now: Instant,
) -> BoardView {
    let board = session.board();
    let view = BoardView::fit(frame.area(), board.width, board.height);
    let delta = effects.delta(now);

    draw_board(frame, session, theme, hud, &view);
    draw_sidebar(frame, session, theme, hud, view.sidebar());

    if let Some(piece) = effects.reject_piece {
        apply_reject_flash(frame, session, theme, &view, effects, piece, delta);
    }
    if session.progress().state.is_finished() {
        let panel = draw_finished(frame, session, theme, &view);
        apply_finish_fade(frame, theme, panel, effects, delta);
    } else if session.is_paused() {
        draw_pause_overlay(frame, theme, &view);
    }
    view
}

fn draw_board<P: Persistence>(frame: &mut Frame, session: &Session<P>, theme: &Theme, hud: &Hud, view: &BoardView) {
    let title = format!(" Level {} ", session.progress().level_number);
    let block = Block::default()
        .borders(Borders::ALL)
        .title(Span::styled(title, Style::default().fg(theme.title)))
        .border_style(Style::default().fg(theme.div_line).bg(theme.bg))
        .style(Style::default().bg(theme.bg));
    block.render(view.outer(), frame.buffer_mut());

    let selection = session.selection();
    let buf = frame.buffer_mut();
    for piece in session.board().pieces() {
        let (col, row) = view.cell_of(piece.position);
        let rect = view.cell_rect(col, row);
        let mut style = Style::default().bg(theme.piece_color(piece.color));
        if selection.contains(&piece.id) {
            style = style
                .bg(theme.title)
                .add_modifier(Modifier::BOLD | Modifier::UNDERLINED);
        }
        buf.set_string(rect.x, rect.y, session.variant(piece.color), style);
    }

    let (col, row) = hud.cursor;
    let cursor = view.cell_rect(col.min(view.cols - 1), row.min(view.rows - 1));
    for x in cursor.x..cursor.x + cursor.width {
        buf[(x, cursor.y)].modifier.insert(Modifier::REVERSED);
    }
}

fn draw_sidebar<P: Persistence>(frame: &mut Frame, session: &Session<P>, theme: &Theme, hud: &Hud, area: Rect) {
    let title_style = Style::default().fg(theme.title);
    let fg_style = Style::default().fg(theme.main_fg);
    let dim_style = Style::default().fg(theme.inactive_fg);
    let border_style = Style::default().fg(theme.div_line).bg(theme.bg);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6),
            Constraint::Length(COLOR_ROWS + 2),
            Constraint::Fill(1),
        ])
        .split(area);

    let progress = session.progress();
    let level_color = crate::level::level_color(progress.level_number);
    let perfect = session.unlock(level_color).map_or(0, |u| u.perfect_win_count);
    let stats = vec![
        Line::from(vec![
            Span::styled("State: ", title_style),
            Span::styled(progress.state.label(), fg_style),
            Span::styled(if session.is_finishing() { "  settling…" } else { "" }, dim_style),
        ]),
        Line::from(vec![
            Span::styled("Potatoes: ", title_style),
            Span::styled(progress.potatoes_created_this_level.to_string(), fg_style),
            Span::styled(format!("  (total {})", session.account().potato_count), dim_style),
        ]),
        Line::from(vec![
            Span::styled("Perfect wins: ", title_style),
            Span::styled(format!("{perfect} {}", session.variant(level_color)), fg_style),
        ]),
        Line::from(Span::styled(hud.status.clone().unwrap_or_default(), fg_style)),
    ];
    Paragraph::new(stats)
        .block(Block::default().borders(Borders::ALL).border_style(border_style))
        .render(chunks[0], frame.buffer_mut());

    let histogram = session.board().histogram();
    let colours: Vec<Line> = PieceColor::all()
        .map(|c| {
            Line::from(vec![
                Span::styled("  ", Style::default().bg(theme.piece_color(c))),
                Span::raw(" "),
                Span::raw(session.variant(c).to_string()),
                Span::styled(format!(" {:>3}", histogram[c.index()]), fg_style),
            ])
        })
        .collect();
    Paragraph::new(colours)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(border_style)
                .title(Span::styled(" Board ", title_style)),
        )
        .render(chunks[1], frame.buffer_mut());

    let help = [
        ("arrows/hjkl", "move"),
        ("space", "tap"),
        ("enter", "merge"),
        ("tab", "next cluster"),
        ("v", "next emoji"),
        ("esc", "clear"),
        ("wasd", "tilt"),
        ("[ ]", "level"),
        ("p e r", "pause end restart"),
        ("N q", "new game, quit"),
    ];
    let lines: Vec<Line> = help
        .iter()
        .map(|(k, v)| {
            Line::from(vec![
                Span::styled(format!("{k:>11} "), title_style),
                Span::styled(*v, dim_style),
            ])
        })
        .collect();
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).border_style(border_style))
        .render(chunks[2], frame.buffer_mut());
}

const COLOR_ROWS: u16 = crate::color::COLOR_COUNT as u16;

fn centered(area: Rect, w: u16, h: u16) -> Rect {
    Rect {
        x: area.x + area.width.saturating_sub(w) / 2,
        y: area.y + area.height.saturating_sub(h) / 2,
        width: w.min(area.width),
        height: h.min(area.height),
    }
}

fn draw_pause_overlay(frame: &mut Frame, theme: &Theme, view: &BoardView) {
    let popup = centered(view.outer(), 26, 5);
    let lines = vec![
        Line::from(""),
        Line::from(Span::styled(
            " Paused ",
            Style::default().fg(theme.bg).bg(theme.title),
        )),
        Line::from(""),
        Line::from(Span::styled(" P resume   Q quit ", Style::default().fg(theme.main_fg))),
    ];
    Clear.render(popup, frame.buffer_mut());
    Paragraph::new(lines)
        .alignment(Alignment::Center)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.div_line).bg(theme.bg)),
        )
        .render(popup, frame.buffer_mut());
}

fn draw_finished<P: Persistence>(frame: &mut Frame, session: &Session<P>, theme: &Theme, view: &BoardView) -> Rect {
    let progress = session.progress();
    let headline = match progress.state {
        LevelState::WinPerfect => " Perfect! ",
        LevelState::Win => " Level won ",
        _ => " Out of moves ",
    };
    let mut keys = String::from(" R restart   ] next ");
    if progress.state == LevelState::Win {
        keys.push_str("  C continue ");
    }
    let lines = vec![
        Line::from(""),
        Line::from(Span::styled(headline, Style::default().fg(theme.bg).bg(theme.title))),
        Line::from(""),
        Line::from(Span::styled(
            format!(
                "{} x{}",
                session.variant(PieceColor::TERMINAL),
                progress.potatoes_created_this_level
            ),
            Style::default().fg(theme.main_fg),
        )),
        Line::from(""),
        Line::from(Span::styled(keys.clone(), Style::default().fg(theme.inactive_fg))),
    ];
    let width = (keys.chars().count() as u16 + 4).max(24);
    let panel = centered(view.outer(), width, 8);
    Clear.render(panel, frame.buffer_mut());
    Paragraph::new(lines)
        .alignment(Alignment::Center)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.title).bg(theme.bg))
                .style(Style::default().bg(theme.bg)),
        )
        .render(panel, frame.buffer_mut());
    panel
}

fn apply_reject_flash<P: Persistence>(
    frame: &mut Frame,
    session: &Session<P>,
    theme: &Theme,
    view: &BoardView,
    effects: &mut Effects,
    piece: PieceId,
    delta: TfxDuration,
) {
    let Some(target) = session.board().get(piece) else {
        effects.reject_piece = None;
        effects.reject = FxSlot::Idle;
        return;
    };
    let (col, row) = view.cell_of(target.position);
    let area = view.cell_rect(col, row);
    if matches!(effects.reject, FxSlot::Requested) {
        let flash = theme.piece_color(PieceColor::new(0).unwrap_or(PieceColor::TERMINAL));
        let effect = fx::fade_from(flash, flash, (REJECT_FLASH_MS, Interpolation::QuadOut)).with_area(area);
        effects.reject = FxSlot::Running(effect);
    }
    if let FxSlot::Running(effect) = &mut effects.reject {
        frame.render_effect(effect, area, delta);
        if effect.done() {
            effects.reject = FxSlot::Idle;
            effects.reject_piece = None;
        }
    }
}

fn apply_finish_fade(frame: &mut Frame, theme: &Theme, panel: Rect, effects: &mut Effects, delta: TfxDuration) {
    if matches!(effects.finish, FxSlot::Requested) {
        let effect = fx::fade_from(theme.bg, theme.bg, (FINISH_FADE_MS, Interpolation::Linear)).with_area(panel);
        effects.finish = FxSlot::Running(effect);
    }
    if let FxSlot::Running(effect) = &mut effects.finish {
        frame.render_effect(effect, panel, delta);
        if effect.done() {
            effects.finish = FxSlot::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> BoardView {
        BoardView::fit(Rect::new(0, 0, 120, 40), 320.0, 480.0)
    }

    #[test]
    fn fit_keeps_board_aspect_and_leaves_room_for_sidebar() {
        let v = view();
        assert_eq!(v.rows, 38);
        assert_eq!(v.cols, 25);
        assert!(v.outer().width + SIDEBAR_WIDTH <= 120);
    }

    #[test]
    fn fit_narrows_rows_when_width_is_short() {
        let v = BoardView::fit(Rect::new(0, 0, 50, 60), 320.0, 480.0);
        assert_eq!(v.cols, 9);
        assert!(v.rows < 58);
    }

    #[test]
    fn cell_centres_map_back_to_their_cell() {
        let v = view();
        for (col, row) in [(0, 0), (3, 7), (v.cols - 1, v.rows - 1)] {
            assert_eq!(v.cell_of(v.point_of(col, row)), (col, row));
        }
    }

    #[test]
    fn top_row_is_high_y() {
        let v = view();
        assert!(v.point_of(0, 0).y > v.point_of(0, v.rows - 1).y);
        assert_eq!(v.cell_of(Vec2::new(0.0, 480.0)), (0, 0));
        assert_eq!(v.cell_of(Vec2::new(320.0, 0.0)), (v.cols - 1, v.rows - 1));
    }

    #[test]
    fn hit_maps_terminal_cells_and_rejects_border() {
        let v = view();
        assert_eq!(v.hit(v.inner.x, v.inner.y), Some((0, 0)));
        assert_eq!(v.hit(v.inner.x + 3, v.inner.y + 2), Some((1, 2)));
        assert_eq!(v.hit(v.inner.x - 1, v.inner.y), None);
        assert_eq!(v.hit(v.inner.x, v.inner.y + v.inner.height), None);
    }
}
