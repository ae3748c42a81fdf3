//! Game-end evaluation: continue, win, perfect win or lose, from a board snapshot.

use crate::board::Board;
use crate::cluster::{self, MatchRules};
use crate::color::{COLOR_COUNT, PieceColor};
use std::time::{Duration, Instant};

/// Grace delay before a natural win/loss is finalized, so in-flight spawns can settle.
pub const FINALIZE_GRACE: Duration = Duration::from_millis(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Win { perfect: bool },
    Lose,
}

impl Verdict {
    pub const fn is_final(self) -> bool {
        !matches!(self, Self::Continue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub terminal_count: usize,
    pub extra_potatoes_possible: usize,
    pub has_won: bool,
    pub is_perfect_win: bool,
    pub should_lose: bool,
}

impl Evaluation {
    pub const fn verdict(&self) -> Verdict {
        if self.has_won {
            Verdict::Win {
                perfect: self.is_perfect_win,
            }
        } else if self.should_lose {
            Verdict::Lose
        } else {
            Verdict::Continue
        }
    }
}

/// Potatoes that forced promotions would still create from this histogram.
///
/// Every non-terminal colour with at least `threshold` units promotes `ceil(n / 2)` units into
/// the next colour and empties, in ascending order, until nothing promotes. Each promotion
/// strictly lowers the unit total, so the loop terminates.
pub fn extra_potatoes_possible(histogram: &[usize; COLOR_COUNT], threshold: usize) -> usize {
    let threshold = threshold.max(2);
    let terminal = PieceColor::TERMINAL.index();
    let mut counts = *histogram;
    loop {
        let mut promoted = false;
        for color in PieceColor::mergeable() {
            let i = color.index();
            if counts[i] >= threshold {
                counts[i + 1] += counts[i].div_ceil(2);
                counts[i] = 0;
                promoted = true;
            }
        }
        if !promoted {
            break;
        }
    }
    counts[terminal] - histogram[terminal]
}

/// Evaluate the board. `forced` is an explicit end-level command: it ends the level on the
/// spot, as a win if any potato exists and a loss otherwise.
pub fn evaluate(board: &Board, rules: &MatchRules, forced: bool) -> Evaluation {
    let histogram = board.histogram();
    let terminal_count = histogram[PieceColor::TERMINAL.index()];
    let non_terminal = board.len() - terminal_count;
    let extra = extra_potatoes_possible(&histogram, rules.match_threshold());

    let has_won = terminal_count > 0 && (extra == 0 || forced);
    let is_perfect_win = has_won && extra == 0 && non_terminal == 0;
    let should_lose = terminal_count == 0
        && (forced || !cluster::has_selectable_cluster(board, rules));

    Evaluation {
        terminal_count,
        extra_potatoes_possible: extra,
        has_won,
        is_perfect_win,
        should_lose,
    }
}

/// Cancellable, supersedable deadline for finalizing a natural verdict.
#[derive(Debug, Clone)]
pub struct Finalizer {
    grace: Duration,
    pending: Option<(Instant, Verdict)>,
}

impl Finalizer {
    pub const fn new(grace: Duration) -> Self {
        Self {
            grace,
            pending: None,
        }
    }

    /// Arm finalization `grace` after `now`. An already pending deadline for the same verdict is kept.
    pub fn schedule(&mut self, now: Instant, verdict: Verdict) {
        if self.pending.is_some_and(|(_, v)| v == verdict) {
            return;
        }
        self.pending = Some((now + self.grace, verdict));
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the scheduled verdict once its deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> Option<Verdict> {
        match self.pending {
            Some((at, verdict)) if now >= at => {
                self.pending = None;
                Some(verdict)
            }
            _ => None,
        }
    }
}

impl Default for Finalizer {
    fn default() -> Self {
        Self::new(FINALIZE_GRACE)
    }
}
