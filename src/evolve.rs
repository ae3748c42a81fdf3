//! Match/evolution engine: selection state machine and cluster merges.
//!
//! `Idle -> Selected -> (confirm) -> Idle`, with a reject path for taps on clusters that are
//! too small. The engine only mutates the board; scoring, saving and end-of-level checks
//! belong to the session that owns it.

use crate::board::{Board, PieceId, Vec2};
use crate::cluster::{self, MatchRules};
use crate::color::PieceColor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Pieces spawned by merging a cluster of `k`: integer ceiling of `k / 2`.
#[inline]
pub const fn spawn_count(k: usize) -> usize {
    k.div_ceil(2)
}

/// Result of one merge.
#[derive(Debug, Clone, PartialEq)]
pub struct Evolution {
    pub from: PieceColor,
    pub to: PieceColor,
    pub removed: Vec<PieceId>,
    pub spawned: Vec<PieceId>,
    /// Potatoes created by this merge (zero unless `to` is the potato).
    pub potatoes: u32,
}

/// What a tap or command did to the selection.
#[derive(Debug, Clone, PartialEq)]
pub enum TapOutcome {
    /// Nothing under the point, or nothing to cycle to; selection is now empty.
    Cleared,
    /// A potato was tapped. Potatoes never select.
    Ignored,
    /// Cluster too small. Selection is now empty; the front end flashes the piece.
    Rejected { piece: PieceId },
    /// Cluster highlighted and ready to confirm.
    Selected { anchor: PieceId, len: usize },
    Evolved(Evolution),
}

#[derive(Debug)]
pub struct Evolver {
    rules: MatchRules,
    selection: Vec<PieceId>,
    selection_color: Option<PieceColor>,
    /// Piece the selection started from; spawns scatter around it on a command confirm.
    anchor: Option<PieceId>,
    /// Position in the sorted selectable-cluster list; `None` when idle.
    cycle_index: Option<usize>,
    rng: StdRng,
}

impl Evolver {
    pub fn new(rules: MatchRules, seed: u64) -> Self {
        Self {
            rules,
            selection: Vec::new(),
            selection_color: None,
            anchor: None,
            cycle_index: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn rules(&self) -> &MatchRules {
        &self.rules
    }

    pub fn selection(&self) -> &[PieceId] {
        &self.selection
    }

    pub fn is_selected(&self, id: PieceId) -> bool {
        self.selection.contains(&id)
    }

    #[cfg(test)]
    pub fn cycle_index(&self) -> Option<usize> {
        self.cycle_index
    }

    /// Topmost-drawn piece whose visual disc contains `point`; nearest centre wins ties.
    pub fn piece_at(&self, board: &Board, point: Vec2) -> Option<PieceId> {
        board
            .pieces()
            .iter()
            .filter_map(|p| {
                let d = p.position.distance(point);
                (d <= self.rules.visual_radius(p.color)).then_some((d, p.id))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, id)| id)
    }

    /// Tap at a board point.
    pub fn select_at(&mut self, board: &mut Board, point: Vec2) -> TapOutcome {
        let Some(id) = self.piece_at(board, point) else {
            self.clear_selection();
            return TapOutcome::Cleared;
        };
        let Some(color) = board.get(id).map(|p| p.color) else {
            self.clear_selection();
            return TapOutcome::Cleared;
        };
        if color.is_terminal() {
            self.clear_selection();
            return TapOutcome::Ignored;
        }
        if self.is_selected(id) {
            return match self.confirm_from(board, Some(id)) {
                Some(evolution) => TapOutcome::Evolved(evolution),
                None => TapOutcome::Cleared,
            };
        }
        self.start_selection(board, id)
    }

    /// Highlight the cluster around `piece` if it is big enough.
    pub fn start_selection(&mut self, board: &Board, piece: PieceId) -> TapOutcome {
        self.clear_selection();
        let Some(found) = cluster::find_cluster(board, &self.rules, piece) else {
            return TapOutcome::Cleared;
        };
        if found.color.is_terminal() {
            return TapOutcome::Ignored;
        }
        if found.len() < self.rules.match_minimum {
            log::debug!("reject {piece}: cluster of {} below minimum", found.len());
            return TapOutcome::Rejected { piece };
        }

        self.cycle_index = cluster::all_selectable_clusters(board, &self.rules)
            .iter()
            .position(|c| c.contains(piece));
        let len = found.len();
        self.selection_color = Some(found.color);
        self.selection = found.members;
        self.anchor = Some(piece);
        TapOutcome::Selected { anchor: piece, len }
    }

    /// Merge the current selection. `None` when there is nothing selected.
    pub fn confirm(&mut self, board: &mut Board) -> Option<Evolution> {
        let anchor = self.anchor;
        self.confirm_from(board, anchor)
    }

    fn confirm_from(&mut self, board: &mut Board, origin: Option<PieceId>) -> Option<Evolution> {
        let from = self.selection_color?;
        let selected: Vec<PieceId> = self
            .selection
            .iter()
            .copied()
            .filter(|&id| board.contains(id))
            .collect();
        let k = selected.len();
        if k == 0 || from.is_terminal() {
            self.clear_selection();
            return None;
        }

        let center = origin
            .and_then(|id| board.get(id))
            .or_else(|| board.get(selected[0]))
            .map(|p| p.position)?;
        let to = from.next();
        let radius = self.rules.visual_radius(to).max(0.0);

        let mut spawned = Vec::with_capacity(spawn_count(k));
        for _ in 0..spawn_count(k) {
            let jitter = if radius > 0.0 {
                Vec2::new(
                    self.rng.random_range(-radius..=radius),
                    self.rng.random_range(-radius..=radius),
                )
            } else {
                Vec2::ZERO
            };
            let pos = board.clamp(center.add(jitter), radius);
            spawned.push(board.spawn(to, pos));
        }
        board.remove_many(&selected);

        let potatoes = if to.is_terminal() { spawned.len() as u32 } else { 0 };
        log::debug!("evolved {k} {from} into {} {to}", spawned.len());
        self.clear_selection();
        Some(Evolution {
            from,
            to,
            removed: selected,
            spawned,
            potatoes,
        })
    }

    /// Back to idle.
    pub fn clear_selection(&mut self) {
        self.selection.clear();
        self.selection_color = None;
        self.anchor = None;
        self.cycle_index = None;
    }

    /// Select the next cluster in top-to-bottom, left-to-right order, wrapping around.
    pub fn cycle_next_cluster(&mut self, board: &Board) -> TapOutcome {
        let clusters = cluster::all_selectable_clusters(board, &self.rules);
        if clusters.is_empty() {
            self.clear_selection();
            return TapOutcome::Cleared;
        }
        let next = self.cycle_index.map_or(0, |i| (i + 1) % clusters.len());
        self.start_selection(board, clusters[next].anchor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color(n: u8) -> PieceColor {
        PieceColor::new(n).unwrap()
    }

    fn row(board: &mut Board, c: PieceColor, n: usize, x: f32, y: f32) -> Vec<PieceId> {
        (0..n)
            .map(|i| board.spawn(c, Vec2::new(x + 30.0 * i as f32, y)))
            .collect()
    }

    fn engine() -> Evolver {
        Evolver::new(MatchRules::default(), 7)
    }

    #[test]
    fn spawn_count_is_integer_ceiling() {
        assert_eq!(spawn_count(1), 1);
        assert_eq!(spawn_count(2), 1);
        assert_eq!(spawn_count(5), 3);
        assert_eq!(spawn_count(7), 4);
        assert_eq!(spawn_count(8), 4);
    }

    #[test]
    fn tap_selects_then_second_tap_confirms() {
        let mut board = Board::new(400.0, 400.0);
        let ids = row(&mut board, color(0), 3, 30.0, 30.0);
        let mut ev = engine();

        let first = ev.select_at(&mut board, Vec2::new(30.0, 30.0));
        assert_eq!(first, TapOutcome::Selected { anchor: ids[0], len: 3 });
        assert_eq!(ev.cycle_index(), Some(0));

        let TapOutcome::Evolved(evolution) = ev.select_at(&mut board, Vec2::new(60.0, 30.0)) else {
            panic!("second tap should confirm");
        };
        assert_eq!(evolution.removed.len(), 3);
        assert_eq!(evolution.spawned.len(), 2);
        assert!(board.pieces().iter().all(|p| p.color == color(1)));
        assert!(ev.selection().is_empty());
        assert_eq!(ev.cycle_index(), None);
    }

    #[test]
    fn confirm_seven_of_colour_two_spawns_four_of_colour_three() {
        let mut board = Board::new(400.0, 400.0);
        row(&mut board, color(2), 7, 20.0, 100.0);
        let bystander = board.spawn(color(5), Vec2::new(350.0, 350.0));
        let mut ev = engine();
        ev.select_at(&mut board, Vec2::new(20.0, 100.0));

        let evolution = ev.confirm(&mut board).unwrap();
        assert_eq!(evolution.removed.len(), 7);
        assert_eq!(evolution.spawned.len(), 4);
        assert_eq!(evolution.to, color(3));
        assert_eq!(evolution.potatoes, 0);
        assert_eq!(board.len(), 5);
        assert_eq!(board.histogram()[3], 4);
        assert!(board.contains(bystander));
        assert!(ev.selection().is_empty());
    }

    #[test]
    fn merging_into_potato_counts_potatoes() {
        let mut board = Board::new(400.0, 400.0);
        row(&mut board, color(6), 5, 20.0, 100.0);
        let mut ev = engine();
        ev.select_at(&mut board, Vec2::new(20.0, 100.0));
        let evolution = ev.confirm(&mut board).unwrap();
        assert_eq!(evolution.to, PieceColor::TERMINAL);
        assert_eq!(evolution.potatoes, 3);
    }

    #[test]
    fn spawns_stay_on_board() {
        let mut board = Board::new(100.0, 100.0);
        row(&mut board, color(0), 2, 1.0, 1.0);
        let mut ev = engine();
        ev.select_at(&mut board, Vec2::new(1.0, 1.0));
        ev.confirm(&mut board).unwrap();
        let r = ev.rules().visual_radius(color(1));
        for p in board.pieces() {
            assert!(p.position.x >= r && p.position.x <= 100.0 - r);
            assert!(p.position.y >= r && p.position.y <= 100.0 - r);
        }
    }

    #[test]
    fn lone_piece_is_rejected() {
        let mut board = Board::new(400.0, 400.0);
        let lone = board.spawn(color(0), Vec2::new(50.0, 50.0));
        let mut ev = engine();
        assert_eq!(
            ev.select_at(&mut board, Vec2::new(50.0, 50.0)),
            TapOutcome::Rejected { piece: lone }
        );
        assert!(ev.selection().is_empty());
    }

    #[test]
    fn potatoes_never_select() {
        let mut board = Board::new(400.0, 400.0);
        row(&mut board, PieceColor::TERMINAL, 3, 30.0, 30.0);
        let mut ev = engine();
        assert_eq!(ev.select_at(&mut board, Vec2::new(30.0, 30.0)), TapOutcome::Ignored);
        assert!(ev.selection().is_empty());
    }

    #[test]
    fn tap_on_empty_space_clears() {
        let mut board = Board::new(400.0, 400.0);
        row(&mut board, color(0), 2, 30.0, 30.0);
        let mut ev = engine();
        ev.select_at(&mut board, Vec2::new(30.0, 30.0));
        assert_eq!(ev.select_at(&mut board, Vec2::new(300.0, 300.0)), TapOutcome::Cleared);
        assert!(ev.selection().is_empty());
    }

    #[test]
    fn confirm_with_nothing_selected_is_a_no_op() {
        let mut board = Board::new(400.0, 400.0);
        row(&mut board, color(0), 2, 30.0, 30.0);
        let mut ev = engine();
        assert!(ev.confirm(&mut board).is_none());
        assert_eq!(board.len(), 2);
    }

    #[test]
    fn cycle_walks_clusters_in_order_and_wraps() {
        let mut board = Board::new(400.0, 400.0);
        let top = row(&mut board, color(0), 2, 30.0, 350.0);
        let bottom = row(&mut board, color(1), 2, 30.0, 50.0);
        let mut ev = engine();

        assert_eq!(
            ev.cycle_next_cluster(&board),
            TapOutcome::Selected { anchor: top[0], len: 2 }
        );
        assert_eq!(
            ev.cycle_next_cluster(&board),
            TapOutcome::Selected { anchor: bottom[0], len: 2 }
        );
        assert_eq!(ev.cycle_index(), Some(1));
        assert_eq!(
            ev.cycle_next_cluster(&board),
            TapOutcome::Selected { anchor: top[0], len: 2 }
        );
    }

    #[test]
    fn cycle_with_no_clusters_clears() {
        let mut board = Board::new(400.0, 400.0);
        board.spawn(color(0), Vec2::new(30.0, 30.0));
        let mut ev = engine();
        assert_eq!(ev.cycle_next_cluster(&board), TapOutcome::Cleared);
        assert_eq!(ev.cycle_index(), None);
    }
}
