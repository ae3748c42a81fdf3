//! Stand-in physics: pieces drift along the gravity vector, stay inside the walls and push
//! overlapping neighbours apart. Produces `(id, position)` updates; never touches the board.

use crate::board::{Board, PieceId, Vec2};
use crate::cluster::MatchRules;

/// Movement below this is treated as settled.
const SETTLE_EPSILON: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Physics {
    /// Board units moved per step along gravity.
    pub fall_speed: f32,
    /// Overlap relaxation passes per step.
    pub iterations: usize,
}

impl Default for Physics {
    fn default() -> Self {
        Self {
            fall_speed: 6.0,
            iterations: 4,
        }
    }
}

impl Physics {
    /// One step. Returns only the pieces that moved.
    pub fn step(&self, board: &Board, rules: &MatchRules, gravity: Vec2) -> Vec<(PieceId, Vec2)> {
        let pieces = board.pieces();
        let radii: Vec<f32> = pieces
            .iter()
            .map(|p| rules.visual_radius(p.color).max(0.0))
            .collect();
        let len = gravity.length();
        let pull = if len > f32::EPSILON {
            gravity.scale(self.fall_speed / len)
        } else {
            Vec2::ZERO
        };

        let mut next: Vec<Vec2> = pieces
            .iter()
            .zip(&radii)
            .map(|(p, &r)| board.clamp(p.position.add(pull), r))
            .collect();

        for _ in 0..self.iterations {
            for i in 0..next.len() {
                for j in (i + 1)..next.len() {
                    let delta = next[j].sub(next[i]);
                    let dist = delta.length();
                    let min = radii[i] + radii[j];
                    if dist >= min {
                        continue;
                    }
                    let dir = if dist > f32::EPSILON {
                        delta.scale(1.0 / dist)
                    } else {
                        // Coincident centres: split sideways.
                        Vec2::new(1.0, 0.0)
                    };
                    let push = dir.scale((min - dist) / 2.0);
                    next[i] = board.clamp(next[i].sub(push), radii[i]);
                    next[j] = board.clamp(next[j].add(push), radii[j]);
                }
            }
        }

        pieces
            .iter()
            .zip(next)
            .filter(|(p, q)| p.position.distance(*q) > SETTLE_EPSILON)
            .map(|(p, q)| (p.id, q))
            .collect()
    }
}
