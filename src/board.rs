//! Board entity store: the authoritative list of pieces for the active level.
//!
//! Board space is in abstract units with the origin at the bottom-left and y pointing up.
//! Positions are written by the physics collaborator; colour and id never change.

use crate::color::{COLOR_COUNT, PieceColor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default board size in board units.
pub const BOARD_WIDTH: f32 = 320.0;
pub const BOARD_HEIGHT: f32 = 480.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn distance(self, other: Self) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    #[inline]
    pub fn length(self) -> f32 {
        self.x.hypot(self.y)
    }

    pub fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y)
    }

    pub fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y)
    }

    pub fn scale(self, k: f32) -> Self {
        Self::new(self.x * k, self.y * k)
    }
}

/// Opaque, unique piece identifier. Never reused within a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PieceId(u64);

impl fmt::Display for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Piece {
    pub id: PieceId,
    pub color: PieceColor,
    pub position: Vec2,
}

/// Pieces in construction order. Pure data: no matching or scoring here.
#[derive(Debug, Clone)]
pub struct Board {
    pub width: f32,
    pub height: f32,
    pieces: Vec<Piece>,
    next_id: u64,
}

impl Board {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            width,
            height,
            pieces: Vec::new(),
            next_id: 1,
        }
    }

    /// Rebuild a board from persisted pieces. Id allocation resumes past the highest id seen.
    pub fn from_pieces(width: f32, height: f32, pieces: Vec<Piece>) -> Self {
        let next_id = pieces.iter().map(|p| p.id.0 + 1).max().unwrap_or(1);
        Self {
            width,
            height,
            pieces,
            next_id,
        }
    }

    #[inline]
    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn get(&self, id: PieceId) -> Option<&Piece> {
        self.pieces.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: PieceId) -> bool {
        self.get(id).is_some()
    }

    /// Add a piece and return its new id.
    pub fn spawn(&mut self, color: PieceColor, position: Vec2) -> PieceId {
        let id = PieceId(self.next_id);
        self.next_id += 1;
        self.pieces.push(Piece {
            id,
            color,
            position,
        });
        id
    }

    /// Remove every listed piece; returns how many were actually present.
    pub fn remove_many(&mut self, ids: &[PieceId]) -> usize {
        let before = self.pieces.len();
        self.pieces.retain(|p| !ids.contains(&p.id));
        before - self.pieces.len()
    }

    pub fn clear(&mut self) {
        self.pieces.clear();
    }

    /// Apply `(id, position)` updates from the physics collaborator. Unknown ids are ignored.
    pub fn update_positions(&mut self, updates: &[(PieceId, Vec2)]) {
        for &(id, pos) in updates {
            if let Some(p) = self.pieces.iter_mut().find(|p| p.id == id) {
                p.position = pos;
            }
        }
    }

    /// Clamp a point into `[half_extent, size - half_extent]` on both axes.
    pub fn clamp(&self, pos: Vec2, half_extent: f32) -> Vec2 {
        let clamp_axis = |v: f32, size: f32| {
            let lo = half_extent.min(size / 2.0);
            let hi = (size - half_extent).max(size / 2.0);
            v.clamp(lo, hi)
        };
        Vec2::new(clamp_axis(pos.x, self.width), clamp_axis(pos.y, self.height))
    }

    /// Piece count per colour ordinal.
    pub fn histogram(&self) -> [usize; COLOR_COUNT] {
        let mut counts = [0usize; COLOR_COUNT];
        for p in &self.pieces {
            counts[p.color.index()] += 1;
        }
        counts
    }

    /// Value copy of the pieces, safe to hand across threads.
    pub fn snapshot(&self) -> Vec<Piece> {
        self.pieces.clone()
    }
}
