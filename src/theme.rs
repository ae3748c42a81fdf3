//! Theme loading: btop-style `theme[key]="value"` and hex → ratatui Color.

use crate::Palette;
use crate::color::{COLOR_COUNT, PieceColor};
use ratatui::style::Color;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// One Dark palette for pieces and UI chrome.
#[derive(Debug, Clone)]
pub struct Theme {
    /// Piece colours by ordinal: red, orange, yellow, green, blue, purple, pink, potato.
    pub pieces: [Color; COLOR_COUNT],
    /// Board background.
    pub bg: Color,
    /// Borders.
    pub div_line: Color,
    /// Body text.
    pub main_fg: Color,
    /// Titles and the selection outline.
    pub title: Color,
    /// Locked levels, hints.
    pub inactive_fg: Color,
}

#[derive(Debug, Error)]
pub enum ThemeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

const fn rgb(hex: u32) -> Color {
    Color::Rgb((hex >> 16) as u8, (hex >> 8) as u8, hex as u8)
}

const ONEDARK_PIECES: [Color; COLOR_COUNT] = [
    rgb(0xE06C75), // red
    rgb(0xD19A66), // orange
    rgb(0xE5C07B), // yellow
    rgb(0x98C379), // green
    rgb(0x61AFEF), // blue
    rgb(0xC678DD), // purple
    rgb(0xF5A3C7), // pink
    rgb(0xC8A165), // potato
];

const HIGH_CONTRAST_PIECES: [Color; COLOR_COUNT] = [
    rgb(0xFF0000),
    rgb(0xFF8800),
    rgb(0xFFFF00),
    rgb(0x00FF00),
    rgb(0x0088FF),
    rgb(0xAA00FF),
    rgb(0xFF00FF),
    rgb(0xFFFFFF),
];

// Paul Tol's "vibrant" set plus two neutrals.
const COLORBLIND_PIECES: [Color; COLOR_COUNT] = [
    rgb(0xCC3311),
    rgb(0xEE7733),
    rgb(0xBBBB00),
    rgb(0x009988),
    rgb(0x0077BB),
    rgb(0x33BBEE),
    rgb(0xEE3377),
    rgb(0xBBBBBB),
];

/// btop keys tried, in order, for each piece colour when no `piece<N>` key is given.
const PIECE_FALLBACK_KEYS: [&[&str]; COLOR_COUNT] = [
    &["cpu_end", "temp_end"],
    &["temp_mid", "used_mid"],
    &["cpu_mid", "title"],
    &["mem_box", "cpu_start"],
    &["cpu_box"],
    &["net_box"],
    &["proc_box", "used_end"],
    &["free_mid"],
];

impl Default for Theme {
    fn default() -> Self {
        Self::onedark_default()
    }
}

impl Theme {
    pub const fn onedark_default() -> Self {
        Self {
            pieces: ONEDARK_PIECES,
            bg: rgb(0x282C34),
            div_line: rgb(0x3F444F),
            main_fg: rgb(0xABB2BF),
            title: rgb(0xE5C07B),
            inactive_fg: rgb(0x5C6370),
        }
    }

    /// Load theme from a btop-style file: `theme[key]="value"` or `theme[key]='value'`.
    /// Falls back to One Dark when `path` is None or missing.
    pub fn load(path: Option<&Path>, palette: Palette) -> Result<Self, ThemeError> {
        let mut theme = match path {
            Some(p) if p.exists() => {
                let s = std::fs::read_to_string(p)?;
                Self::from_map(&parse_theme_file(&s))
            }
            Some(p) => {
                log::warn!("theme file {} not found, using defaults", p.display());
                Self::default()
            }
            None => Self::default(),
        };
        theme.apply_palette(palette);
        Ok(theme)
    }

    /// Override piece colours for high-contrast or colorblind play.
    pub fn apply_palette(&mut self, palette: Palette) {
        match palette {
            Palette::Normal => {}
            Palette::HighContrast => self.pieces = HIGH_CONTRAST_PIECES,
            Palette::Colorblind => self.pieces = COLORBLIND_PIECES,
        }
    }

    fn from_map(map: &HashMap<String, String>) -> Self {
        let get = |key: &str| map.get(key).and_then(|v| parse_hex(v).ok());
        let defaults = Self::onedark_default();

        let mut pieces = defaults.pieces;
        for (i, slot) in pieces.iter_mut().enumerate() {
            let own = get(&format!("piece{i}"));
            let fallback = || PIECE_FALLBACK_KEYS[i].iter().find_map(|k| get(k));
            if let Some(c) = own.or_else(fallback) {
                *slot = c;
            }
        }

        Self {
            pieces,
            bg: get("main_bg").or_else(|| get("meter_bg")).unwrap_or(defaults.bg),
            div_line: get("div_line").unwrap_or(defaults.div_line),
            main_fg: get("main_fg").unwrap_or(defaults.main_fg),
            title: get("title").unwrap_or(defaults.title),
            inactive_fg: get("inactive_fg").unwrap_or(defaults.inactive_fg),
        }
    }

    #[inline]
    pub fn piece_color(&self, color: PieceColor) -> Color {
        self.pieces[color.index()]
    }
}

/// Parse btop-style theme file into key -> value map.
fn parse_theme_file(s: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in s.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(stripped) = line.strip_prefix("theme[") else {
            continue;
        };
        let Some(end) = stripped.find(']') else {
            continue;
        };
        let key = stripped[..end].trim();
        let rest = stripped[end + 1..].trim();
        if let Some(value) = rest.strip_prefix('=') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            if !value.is_empty() {
                map.insert(key.to_string(), value.to_string());
            }
        }
    }
    map
}

/// Parse hex colour "#RRGGBB" or "#RGB" into ratatui Color.
pub fn parse_hex(s: &str) -> Result<Color, ThemeError> {
    let s = s.trim().trim_start_matches('#');
    let invalid = || ThemeError::InvalidHex(s.to_string());
    let channel = |range: std::ops::Range<usize>| {
        s.get(range)
            .and_then(|h| u8::from_str_radix(h, 16).ok())
            .ok_or_else(invalid)
    };
    let (r, g, b) = match s.len() {
        6 => (channel(0..2)?, channel(2..4)?, channel(4..6)?),
        3 => (channel(0..1)? * 17, channel(1..2)? * 17, channel(2..3)? * 17),
        _ => return Err(invalid()),
    };
    Ok(Color::Rgb(r, g, b))
}
