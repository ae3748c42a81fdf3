//! Colour sequence: a fixed, totally ordered list of piece colours ending in the potato.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of colours in the sequence (including the terminal potato).
pub const COLOR_COUNT: usize = 8;

/// Ordinal of a piece colour. `PieceColor(0) < PieceColor(1) < ... < PieceColor::TERMINAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PieceColor(u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("colour ordinal {0} is past the potato")]
pub struct InvalidColor(pub u8);

impl TryFrom<u8> for PieceColor {
    type Error = InvalidColor;

    fn try_from(ordinal: u8) -> Result<Self, Self::Error> {
        Self::new(ordinal).ok_or(InvalidColor(ordinal))
    }
}

impl From<PieceColor> for u8 {
    fn from(color: PieceColor) -> Self {
        color.0
    }
}

impl PieceColor {
    /// The potato. Scoring unit; never selectable, never merges.
    pub const TERMINAL: Self = Self(COLOR_COUNT as u8 - 1);

    /// Colour at `ordinal`, or `None` past the end of the sequence.
    pub const fn new(ordinal: u8) -> Option<Self> {
        if (ordinal as usize) < COLOR_COUNT {
            Some(Self(ordinal))
        } else {
            None
        }
    }

    /// Every colour, lowest first.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..COLOR_COUNT as u8).map(Self)
    }

    /// Non-terminal colours, lowest first.
    pub fn mergeable() -> impl Iterator<Item = Self> {
        (0..Self::TERMINAL.0).map(Self)
    }

    #[inline]
    pub const fn ordinal(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        self.0 == Self::TERMINAL.0
    }

    /// Successor in the sequence; saturates at the potato.
    pub const fn next(self) -> Self {
        if self.is_terminal() {
            self
        } else {
            Self(self.0 + 1)
        }
    }

    /// Visual/match radius scale. Later colours are a little larger.
    pub fn scale(self) -> f32 {
        1.0 + 0.08 * f32::from(self.0)
    }

    pub const fn name(self) -> &'static str {
        match self.0 {
            0 => "red",
            1 => "orange",
            2 => "yellow",
            3 => "green",
            4 => "blue",
            5 => "purple",
            6 => "pink",
            _ => "potato",
        }
    }

    /// Emoji variants a player can pick for this colour. The first is the default.
    pub const fn available_variants(self) -> &'static [&'static str] {
        match self.0 {
            0 => &["🍎", "🍓", "🍒", "🍅"],
            1 => &["🍊", "🥕", "🍑"],
            2 => &["🍋", "🍌", "🌽", "🧀"],
            3 => &["🍏", "🥦", "🥒", "🥝"],
            4 => &["🫐", "💧", "🐳"],
            5 => &["🍇", "🍆", "🔮"],
            6 => &["🌸", "🍥", "🐷"],
            _ => &["🥔"],
        }
    }

    /// Default variant (first available).
    pub const fn default_variant(self) -> &'static str {
        self.available_variants()[0]
    }
}

impl fmt::Display for PieceColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_saturates_at_potato() {
        let six = PieceColor::new(6).unwrap();
        assert_eq!(six.next(), PieceColor::TERMINAL);
        assert_eq!(PieceColor::TERMINAL.next(), PieceColor::TERMINAL);
        assert!(PieceColor::new(COLOR_COUNT as u8).is_none());
    }

    #[test]
    fn mergeable_excludes_terminal() {
        let colors: Vec<_> = PieceColor::mergeable().collect();
        assert_eq!(colors.len(), COLOR_COUNT - 1);
        assert!(colors.iter().all(|c| !c.is_terminal()));
    }

    #[test]
    fn every_colour_has_a_variant() {
        for c in PieceColor::all() {
            assert!(!c.available_variants().is_empty(), "{c} has no variants");
        }
    }

    #[test]
    fn out_of_range_ordinal_is_rejected_when_loading() {
        assert_eq!(serde_json::from_str::<PieceColor>("3").unwrap(), PieceColor::new(3).unwrap());
        assert_eq!(serde_json::to_string(&PieceColor::TERMINAL).unwrap(), "7");
        assert!(serde_json::from_str::<PieceColor>("9").is_err());
        assert_eq!(PieceColor::try_from(8), Err(InvalidColor(8)));
    }
}
