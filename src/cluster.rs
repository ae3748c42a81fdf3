//! Cluster finder: connected components of same-colour pieces that touch.
//!
//! Two pieces touch when the distance between their centres is at most the sum of their
//! expanded match radii. The traversal is a plain stack flood fill, so the member *set* is
//! fixed for a board snapshot even though visitation order is not part of the contract.

use crate::board::{Board, Piece, PieceId};
use crate::color::PieceColor;
use std::collections::HashSet;

/// Matching parameters shared by the finder, the engine and the evaluator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchRules {
    /// Smallest selectable cluster.
    pub match_minimum: usize,
    /// Visual radius of a colour-0 piece, in board units.
    pub base_radius: f32,
    /// Lower bound on the touch expansion added to each radius.
    pub min_expansion: f32,
    /// Expansion as a fraction of the visual radius.
    pub expansion_fraction: f32,
}

impl Default for MatchRules {
    fn default() -> Self {
        Self {
            match_minimum: 2,
            base_radius: 18.0,
            min_expansion: 8.0,
            expansion_fraction: 0.2,
        }
    }
}

impl MatchRules {
    /// Drawn radius of a piece of `color`.
    pub fn visual_radius(&self, color: PieceColor) -> f32 {
        self.base_radius * color.scale()
    }

    /// Radius used for the touch test, or `None` when the piece is degenerate
    /// (zero, negative or NaN visual radius) and takes part in no edges.
    pub fn match_radius(&self, color: PieceColor) -> Option<f32> {
        let radius = self.visual_radius(color);
        if !(radius > 0.0) {
            return None;
        }
        let expansion = self.min_expansion.max(radius * self.expansion_fraction);
        Some(radius + expansion)
    }

    pub fn touching(&self, a: &Piece, b: &Piece) -> bool {
        match (self.match_radius(a.color), self.match_radius(b.color)) {
            (Some(ra), Some(rb)) => a.position.distance(b.position) <= ra + rb,
            _ => false,
        }
    }

    /// Threshold the evaluator uses for forced promotions.
    pub fn match_threshold(&self) -> usize {
        self.match_minimum.max(2)
    }
}

/// A maximal set of touching same-colour pieces. `members[0]` is the anchor (the seed).
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub color: PieceColor,
    pub members: Vec<PieceId>,
}

impl Cluster {
    #[inline]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[inline]
    pub fn anchor(&self) -> PieceId {
        self.members[0]
    }

    pub fn contains(&self, id: PieceId) -> bool {
        self.members.contains(&id)
    }

    /// Member ids as an ordered set, independent of traversal order.
    #[cfg(test)]
    pub fn ids(&self) -> std::collections::BTreeSet<PieceId> {
        self.members.iter().copied().collect()
    }

    pub fn is_selectable(&self, rules: &MatchRules) -> bool {
        !self.is_empty() && self.len() >= rules.match_minimum && !self.color.is_terminal()
    }
}

/// Flood fill from `seed` over pieces of the seed's colour. `None` if the seed is not on the board.
pub fn find_cluster(board: &Board, rules: &MatchRules, seed: PieceId) -> Option<Cluster> {
    let seed_piece = board.get(seed)?;
    let same: Vec<&Piece> = board
        .pieces()
        .iter()
        .filter(|p| p.color == seed_piece.color)
        .collect();
    Some(flood(&same, rules, seed_piece, &mut HashSet::new()))
}

fn flood(candidates: &[&Piece], rules: &MatchRules, seed: &Piece, visited: &mut HashSet<PieceId>) -> Cluster {
    let mut members = Vec::new();
    let mut stack = vec![seed];
    visited.insert(seed.id);

    while let Some(current) = stack.pop() {
        members.push(current.id);
        for &other in candidates {
            if !visited.contains(&other.id) && rules.touching(current, other) {
                visited.insert(other.id);
                stack.push(other);
            }
        }
    }

    Cluster {
        color: seed.color,
        members,
    }
}

/// Partition the whole board into clusters (each piece visited once), keep the selectable ones,
/// and order them top-to-bottom (descending anchor y), then left-to-right (ascending anchor x).
pub fn all_selectable_clusters(board: &Board, rules: &MatchRules) -> Vec<Cluster> {
    let mut visited = HashSet::new();
    let mut clusters = Vec::new();

    for seed in board.pieces() {
        if visited.contains(&seed.id) {
            continue;
        }
        let same: Vec<&Piece> = board
            .pieces()
            .iter()
            .filter(|p| p.color == seed.color)
            .collect();
        let cluster = flood(&same, rules, seed, &mut visited);
        if cluster.is_selectable(rules) {
            clusters.push(cluster);
        }
    }

    let anchor_pos = |c: &Cluster| board.get(c.anchor()).map(|p| p.position).unwrap_or_default();
    clusters.sort_by(|a, b| {
        let (pa, pb) = (anchor_pos(a), anchor_pos(b));
        pb.y.total_cmp(&pa.y).then(pa.x.total_cmp(&pb.x))
    });
    clusters
}

/// True if any selectable cluster exists.
pub fn has_selectable_cluster(board: &Board, rules: &MatchRules) -> bool {
    !all_selectable_clusters(board, rules).is_empty()
}
