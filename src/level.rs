//! Level catalogue: deterministic starting layouts, level colours and pack gating.

use crate::board::{Board, Vec2};
use crate::cluster::MatchRules;
use crate::color::PieceColor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

/// Levels 1..=FREE_LEVELS need no pack.
pub const FREE_LEVELS: u32 = 12;
/// Levels per purchasable pack after the free ones.
pub const LEVELS_PER_PACK: u32 = 12;

/// Pack that owns `level`, or `None` for free levels.
pub fn level_pack_id(level: u32) -> Option<String> {
    (level > FREE_LEVELS).then(|| format!("pack-{}", (level - FREE_LEVELS - 1) / LEVELS_PER_PACK + 1))
}

/// Playable with the given owned packs.
pub fn is_accessible(level: u32, owned_packs: &BTreeSet<String>) -> bool {
    level >= 1 && level_pack_id(level).is_none_or(|pack| owned_packs.contains(&pack))
}

/// Theme colour of a level; perfect-win counters are kept per theme colour.
pub fn level_color(level: u32) -> PieceColor {
    let span = PieceColor::TERMINAL.ordinal() as u32;
    let ordinal = level.saturating_sub(1) % span;
    PieceColor::new(ordinal as u8).unwrap_or(PieceColor::TERMINAL)
}

/// Starting layout for a level. Same level, same layout.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelTemplate {
    pub level: u32,
    pub pieces: Vec<(PieceColor, Vec2)>,
}

impl LevelTemplate {
    pub fn generate(level: u32, width: f32, height: f32, rules: &MatchRules) -> Self {
        let level = level.max(1);
        let mut rng = StdRng::seed_from_u64(u64::from(level).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let count = 16 + 2 * level.min(16) as usize;
        // Early levels only use the first few colours.
        let top = (1 + level / 2).min(u32::from(PieceColor::TERMINAL.ordinal()) - 1) as u8;

        let pieces = (0..count)
            .map(|_| {
                // Min of two rolls biases toward low colours.
                let ordinal = rng.random_range(0..=top).min(rng.random_range(0..=top));
                let color = PieceColor::new(ordinal).unwrap_or(PieceColor::TERMINAL);
                let r = rules.visual_radius(color).max(1.0);
                let x = rng.random_range(r..=(width - r).max(r));
                let y = rng.random_range(r..=(height - r).max(r));
                (color, Vec2::new(x, y))
            })
            .collect();
        Self { level, pieces }
    }

    /// Replace the board contents with this layout.
    pub fn hydrate(&self, board: &mut Board) {
        board.clear();
        for &(color, pos) in &self.pieces {
            board.spawn(color, pos);
        }
    }
}
