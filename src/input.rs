//! Key bindings, and the adapter from terminal actions to normalized session commands.

use crate::board::Vec2;
use crate::session::SessionCommand;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tilt {
    Up,
    Down,
    Left,
    Right,
}

impl Tilt {
    /// Gravity vector in board space (y up).
    pub const fn vector(self) -> Vec2 {
        match self {
            Self::Up => Vec2::new(0.0, 1.0),
            Self::Down => Vec2::new(0.0, -1.0),
            Self::Left => Vec2::new(-1.0, 0.0),
            Self::Right => Vec2::new(1.0, 0.0),
        }
    }
}

/// Action from a key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Move the board cursor by (columns, rows); rows grow downward on screen.
    Cursor(i8, i8),
    /// Tap at the cursor.
    Tap,
    Confirm,
    CycleNext,
    /// Draw the level's colour with its next unlocked emoji.
    CycleVariant,
    Clear,
    Gravity(Tilt),
    PrevLevel,
    NextLevel,
    Pause,
    Restart,
    Continue,
    EndLevel,
    NewGame,
    Quit,
    None,
}

/// Map key event to action. Arrows or hjkl move the cursor, WASD tilts the board.
pub fn key_to_action(key: KeyEvent) -> Action {
    let KeyEvent { code, modifiers, .. } = key;
    if modifiers == KeyModifiers::CONTROL && code == KeyCode::Char('c') {
        return Action::Quit;
    }
    if !(modifiers.is_empty() || modifiers == KeyModifiers::SHIFT) {
        return Action::None;
    }
    match code {
        KeyCode::Char('q') => Action::Quit,
        KeyCode::Esc => Action::Clear,
        KeyCode::Char('p') => Action::Pause,
        KeyCode::Left | KeyCode::Char('h') => Action::Cursor(-1, 0),
        KeyCode::Right | KeyCode::Char('l') => Action::Cursor(1, 0),
        KeyCode::Up | KeyCode::Char('k') => Action::Cursor(0, -1),
        KeyCode::Down | KeyCode::Char('j') => Action::Cursor(0, 1),
        KeyCode::Char(' ') => Action::Tap,
        KeyCode::Enter => Action::Confirm,
        KeyCode::Tab => Action::CycleNext,
        KeyCode::Char('v') => Action::CycleVariant,
        KeyCode::Char('w') => Action::Gravity(Tilt::Up),
        KeyCode::Char('s') => Action::Gravity(Tilt::Down),
        KeyCode::Char('a') => Action::Gravity(Tilt::Left),
        KeyCode::Char('d') => Action::Gravity(Tilt::Right),
        KeyCode::Char('[') => Action::PrevLevel,
        KeyCode::Char(']') => Action::NextLevel,
        KeyCode::Char('r') => Action::Restart,
        KeyCode::Char('c') => Action::Continue,
        KeyCode::Char('e') => Action::EndLevel,
        KeyCode::Char('N') => Action::NewGame,
        _ => Action::None,
    }
}

/// The part of an action the session understands. `cursor` is the board point under the cursor.
pub fn session_command(action: Action, cursor: Vec2) -> Option<SessionCommand> {
    match action {
        Action::Tap => Some(SessionCommand::SelectAt(cursor)),
        Action::Confirm => Some(SessionCommand::Confirm),
        Action::CycleNext => Some(SessionCommand::CycleNext),
        Action::Clear => Some(SessionCommand::Clear),
        Action::Gravity(tilt) => Some(SessionCommand::SetGravity(tilt.vector())),
        _ => None,
    }
}
