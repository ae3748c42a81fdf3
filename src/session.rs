//! Session manager: one active level's lifecycle, wired to the engine, the evaluator and
//! the persistence coordinator.
//!
//! Everything here runs on the single simulation thread; the only thing that leaves it is a
//! [`Snapshot`] value. Timers (autosave, finalization grace) are deadlines checked in
//! [`Session::tick`], so cancelling one is just clearing it.

use crate::board::{BOARD_HEIGHT, BOARD_WIDTH, Board, PieceId, Vec2};
use crate::cluster::MatchRules;
use crate::color::PieceColor;
use crate::evolve::{Evolution, Evolver, TapOutcome};
use crate::level::{self, LevelTemplate};
use crate::persist::{Persistence, PersistError, Snapshot};
use crate::progress::{Account, DEFAULT_ACCOUNT_ID, LevelProgress, LevelState, PERFECT_WIN_MILESTONE, UnlockSelection};
use crate::verdict::{self, FINALIZE_GRACE, Finalizer, Verdict};
use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use twox_hash::XxHash64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionTimings {
    /// Periodic save while playing.
    pub autosave: Duration,
    /// Delay before a natural win/loss is finalized.
    pub finalize_grace: Duration,
    /// Evolutions closer together than this use the debounced save path.
    pub evolution_cooldown: Duration,
    /// Perfect wins per variant unlock.
    pub perfect_win_milestone: u32,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            autosave: Duration::from_secs(30),
            finalize_grace: FINALIZE_GRACE,
            evolution_cooldown: Duration::from_secs(2),
            perfect_win_milestone: PERFECT_WIN_MILESTONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    pub rules: MatchRules,
    pub timings: SessionTimings,
    pub board_width: f32,
    pub board_height: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rules: MatchRules::default(),
            timings: SessionTimings::default(),
            board_width: BOARD_WIDTH,
            board_height: BOARD_HEIGHT,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("level {level} requires {pack}")]
    Locked { level: u32, pack: String },
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Normalized input. Platform decoding (keys, mouse, pads) happens outside the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionCommand {
    SelectAt(Vec2),
    CycleNext,
    Confirm,
    Clear,
    SetGravity(Vec2),
}

/// Notifications for the front end, drained with [`Session::drain_events`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LevelUpdated {
        level: u32,
        state: LevelState,
        potatoes: u32,
    },
    SelectionReady {
        anchor: PieceId,
        len: usize,
    },
    SelectionRejected {
        piece: PieceId,
    },
    Evolved(Evolution),
    LevelFinished {
        level: u32,
        verdict: Verdict,
    },
    VariantUnlocked {
        color: PieceColor,
        variant: String,
    },
    NewGame,
}

/// Structural view hashed to suppress redundant level-updated notifications.
/// Positions are left out: physics moves them every frame.
#[derive(Serialize)]
struct DigestView<'a> {
    level: u32,
    state: LevelState,
    potatoes: u32,
    account_potatoes: u64,
    pieces: Vec<(PieceId, PieceColor)>,
    selection: &'a [PieceId],
}

pub struct Session<P: Persistence> {
    config: SessionConfig,
    persistence: P,
    board: Board,
    evolver: Evolver,
    finalizer: Finalizer,
    progress: LevelProgress,
    account: Account,
    unlocks: BTreeMap<PieceColor, UnlockSelection>,
    autosave_at: Option<Instant>,
    last_evolution_at: Option<Instant>,
    gravity: Vec2,
    paused: bool,
    events: Vec<SessionEvent>,
    last_digest: Option<u64>,
    rng: StdRng,
}

impl<P: Persistence> Session<P> {
    /// Repair duplicate records, load the account and unlocks, and start `level`.
    pub fn open(mut persistence: P, config: SessionConfig, level: u32, now: Instant, seed: u64) -> Result<Self, SessionError> {
        match persistence.prune_duplicates() {
            Ok(report) if report.total() > 0 => log::info!("repaired {} duplicate record(s)", report.total()),
            Ok(_) => {}
            Err(e) => log::warn!("duplicate pruning failed: {e}"),
        }

        let profile = persistence.load_profile(DEFAULT_ACCOUNT_ID)?;
        let account = profile
            .account
            .unwrap_or_else(|| Account::new(DEFAULT_ACCOUNT_ID, Utc::now()));
        let mut unlocks = default_unlocks();
        for mut unlock in profile.unlocks {
            if unlock.heal() {
                log::warn!("repaired variant selection for {}", unlock.color);
            }
            unlocks.insert(unlock.color, unlock);
        }

        let mut session = Self {
            config,
            persistence,
            board: Board::new(config.board_width, config.board_height),
            evolver: Evolver::new(config.rules, seed),
            finalizer: Finalizer::new(config.timings.finalize_grace),
            progress: LevelProgress::fresh(level, Utc::now()),
            account,
            unlocks,
            autosave_at: None,
            last_evolution_at: None,
            gravity: Vec2::new(0.0, -1.0),
            paused: false,
            events: Vec::new(),
            last_digest: None,
            rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
        };
        match session.start(level, now) {
            Err(e @ SessionError::Locked { .. }) => {
                log::warn!("{e}, opening level 1");
                session.start(1, now)?;
            }
            other => other?,
        }
        Ok(session)
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn progress(&self) -> &LevelProgress {
        &self.progress
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn unlock(&self, color: PieceColor) -> Option<&UnlockSelection> {
        self.unlocks.get(&color)
    }

    /// Emoji to draw for a colour.
    pub fn variant(&self, color: PieceColor) -> &str {
        self.unlocks
            .get(&color)
            .map_or(color.default_variant(), |u| u.selected_variant.as_str())
    }

    pub fn selection(&self) -> &[PieceId] {
        self.evolver.selection()
    }

    pub fn rules(&self) -> &MatchRules {
        self.evolver.rules()
    }

    pub fn gravity(&self) -> Vec2 {
        self.gravity
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_playing(&self) -> bool {
        self.progress.state == LevelState::Playing
    }

    /// A natural win or loss is waiting out its grace delay.
    pub fn is_finishing(&self) -> bool {
        self.finalizer.is_pending()
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Value copy of everything persisted. Pieces are only kept while the level is in play.
    pub fn snapshot(&self) -> Snapshot {
        let now = Utc::now();
        let mut level = self.progress.clone();
        level.pieces_snapshot = if self.is_playing() {
            self.board.snapshot()
        } else {
            Vec::new()
        };
        level.updated_at = now;
        let mut account = self.account.clone();
        account.updated_at = now;
        Snapshot {
            level,
            account,
            unlocks: self.unlocks.values().cloned().collect(),
        }
    }

    /// Start (or switch to) `level`. A finished level opens in its finished state.
    pub fn start(&mut self, level: u32, now: Instant) -> Result<(), SessionError> {
        if !level::is_accessible(level, &self.account.owned_level_pack_ids) {
            return Err(SessionError::Locked {
                level,
                pack: level::level_pack_id(level).unwrap_or_default(),
            });
        }
        self.leave_level();

        let progress = self
            .persistence
            .load_level(level)?
            .unwrap_or_else(|| LevelProgress::fresh(level, Utc::now()));
        self.progress = progress;
        self.paused = false;
        if self.progress.state.is_finished() {
            // The layout was discarded when the level ended; replaying needs an explicit restart.
            self.board = Board::new(self.config.board_width, self.config.board_height);
            log::info!("level {level} opened as {}", self.progress.state.label());
            self.notify_level_updated();
            return Ok(());
        }

        if self.progress.pieces_snapshot.is_empty() {
            log::info!("hydrating level {level} from template");
            self.hydrate_template();
        } else {
            self.board = Board::from_pieces(
                self.config.board_width,
                self.config.board_height,
                std::mem::take(&mut self.progress.pieces_snapshot),
            );
        }
        self.progress.state = LevelState::Playing;
        self.progress.started_at.get_or_insert_with(Utc::now);
        self.arm_autosave(now);
        log::info!("level {level} started with {} pieces", self.board.len());

        self.reevaluate(now);
        self.persistence.save_debounced(self.snapshot());
        self.notify_level_updated();
        Ok(())
    }

    /// Throw the layout away, regenerate it from the template and play again.
    pub fn restart(&mut self, now: Instant) {
        self.finalizer.cancel();
        self.evolver.clear_selection();
        self.persistence.cancel_pending(self.progress.level_number);
        self.last_evolution_at = None;

        self.hydrate_template();
        self.progress.potatoes_created_this_level = 0;
        self.progress.state = LevelState::Playing;
        self.progress.started_at = Some(Utc::now());
        self.progress.completed_at = None;
        self.paused = false;
        self.arm_autosave(now);
        log::info!("level {} restarted", self.progress.level_number);

        self.flush();
        self.notify_level_updated();
    }

    /// Keep playing after a non-perfect win. Returns false in any other state, or when the
    /// win was loaded from disk and its layout is gone.
    pub fn continue_level(&mut self, now: Instant) -> bool {
        if self.progress.state != LevelState::Win || self.board.is_empty() {
            return false;
        }
        self.progress.state = LevelState::Playing;
        self.progress.completed_at = None;
        self.paused = false;
        self.arm_autosave(now);
        self.flush();
        self.notify_level_updated();
        true
    }

    /// Explicit end-level command: decide now and cancel any pending natural finalization.
    pub fn end_level(&mut self, _now: Instant) {
        if !self.is_playing() {
            return;
        }
        self.finalizer.cancel();
        let verdict = verdict::evaluate(&self.board, self.evolver.rules(), true).verdict();
        self.finish(verdict);
    }

    /// Switch `color` to its next unlocked variant in catalogue order, wrapping around.
    pub fn cycle_variant(&mut self, color: PieceColor) -> Option<String> {
        let unlock = self.unlocks.get_mut(&color)?;
        let order: Vec<&str> = color
            .available_variants()
            .iter()
            .copied()
            .filter(|v| unlock.unlocked_variants.contains(*v))
            .collect();
        if order.len() < 2 {
            return None;
        }
        let at = order
            .iter()
            .position(|v| *v == unlock.selected_variant)
            .map_or(0, |i| (i + 1) % order.len());
        let next = order[at].to_string();
        unlock.select(&next);
        unlock.updated_at = Utc::now();
        log::debug!("{color} now drawn as {next}");
        let snapshot = self.snapshot();
        self.persistence.save_debounced(snapshot);
        Some(next)
    }

    /// Stop timers and flush; used for pause and app suspension.
    pub fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.autosave_at = None;
        self.finalizer.cancel();
        self.evolver.clear_selection();
        if self.is_playing() {
            self.flush();
        }
    }

    pub fn resume(&mut self, now: Instant) {
        if !self.paused {
            return;
        }
        self.paused = false;
        if self.is_playing() {
            self.arm_autosave(now);
            self.reevaluate(now);
        }
    }

    /// Wipe every record and start over from level 1.
    pub fn new_game(&mut self, now: Instant) -> Result<(), SessionError> {
        self.finalizer.cancel();
        self.autosave_at = None;
        self.evolver.clear_selection();
        self.persistence.cancel_pending(self.progress.level_number);
        self.persistence.wipe()?;

        self.account = Account::new(DEFAULT_ACCOUNT_ID, Utc::now());
        self.unlocks = default_unlocks();
        self.progress = LevelProgress::fresh(1, Utc::now());
        self.last_digest = None;
        self.events.push(SessionEvent::NewGame);
        log::info!("new game");
        self.start(1, now)
    }

    /// Final flush before the process goes away.
    pub fn close(&mut self) {
        self.autosave_at = None;
        self.finalizer.cancel();
        if self.is_playing() {
            self.flush();
        }
    }

    /// Position updates from the physics collaborator. Moving pieces can make or break
    /// clusters, so the board is evaluated again.
    pub fn apply_positions(&mut self, updates: &[(PieceId, Vec2)], now: Instant) {
        if updates.is_empty() {
            return;
        }
        self.board.update_positions(updates);
        if self.is_playing() && !self.paused {
            self.reevaluate(now);
        }
    }

    pub fn apply(&mut self, command: SessionCommand, now: Instant) {
        if let SessionCommand::SetGravity(g) = command {
            self.gravity = g;
            return;
        }
        if !self.is_playing() || self.paused {
            return;
        }
        let outcome = match command {
            SessionCommand::SelectAt(point) => self.evolver.select_at(&mut self.board, point),
            SessionCommand::CycleNext => self.evolver.cycle_next_cluster(&self.board),
            SessionCommand::Confirm => match self.evolver.confirm(&mut self.board) {
                Some(evolution) => TapOutcome::Evolved(evolution),
                None => TapOutcome::Cleared,
            },
            SessionCommand::Clear => {
                self.evolver.clear_selection();
                TapOutcome::Cleared
            }
            SessionCommand::SetGravity(_) => return,
        };
        self.handle_outcome(outcome, now);
    }

    /// Advance timers: finalization grace and periodic autosave.
    pub fn tick(&mut self, now: Instant) {
        if self.paused {
            return;
        }
        if self.finalizer.take_due(now).is_some() {
            // The board may have changed during the grace period; decide on what is there now.
            let verdict = verdict::evaluate(&self.board, self.evolver.rules(), false).verdict();
            if verdict.is_final() {
                self.finish(verdict);
            }
        }
        if self.is_playing() && self.autosave_at.is_some_and(|at| now >= at) {
            log::debug!("autosave level {}", self.progress.level_number);
            self.persistence.save_debounced(self.snapshot());
            self.arm_autosave(now);
        }
    }

    fn handle_outcome(&mut self, outcome: TapOutcome, now: Instant) {
        match outcome {
            TapOutcome::Selected { anchor, len } => {
                self.events.push(SessionEvent::SelectionReady { anchor, len });
            }
            TapOutcome::Rejected { piece } => {
                self.events.push(SessionEvent::SelectionRejected { piece });
            }
            TapOutcome::Evolved(evolution) => self.on_evolution(evolution, now),
            TapOutcome::Cleared | TapOutcome::Ignored => {}
        }
        self.notify_level_updated();
    }

    fn on_evolution(&mut self, evolution: Evolution, now: Instant) {
        if evolution.potatoes > 0 {
            self.progress.potatoes_created_this_level += evolution.potatoes;
            self.account.add_potatoes(evolution.potatoes);
        }
        self.events.push(SessionEvent::Evolved(evolution));
        self.reevaluate(now);

        let within_cooldown = self
            .last_evolution_at
            .is_some_and(|t| now.saturating_duration_since(t) < self.config.timings.evolution_cooldown);
        self.last_evolution_at = Some(now);
        if within_cooldown {
            self.persistence.save_debounced(self.snapshot());
        } else {
            self.flush();
        }
    }

    /// Natural evaluation after a board change: arm or cancel the finalization grace.
    fn reevaluate(&mut self, now: Instant) {
        let evaluation = verdict::evaluate(&self.board, self.evolver.rules(), false);
        let verdict = evaluation.verdict();
        if verdict.is_final() {
            log::debug!(
                "level {} heading to {verdict:?} ({} potatoes on board, {} more possible)",
                self.progress.level_number,
                evaluation.terminal_count,
                evaluation.extra_potatoes_possible
            );
            self.finalizer.schedule(now, verdict);
        } else {
            self.finalizer.cancel();
        }
    }

    fn finish(&mut self, verdict: Verdict) {
        let state = match verdict {
            Verdict::Continue => return,
            Verdict::Win { perfect: true } => LevelState::WinPerfect,
            Verdict::Win { perfect: false } => LevelState::Win,
            Verdict::Lose => LevelState::Lose,
        };
        self.autosave_at = None;
        self.finalizer.cancel();
        self.evolver.clear_selection();
        self.progress.state = state;
        self.progress.completed_at = Some(Utc::now());
        if state == LevelState::WinPerfect {
            self.record_perfect_win();
        }
        log::info!(
            "level {} finished: {} ({} potatoes)",
            self.progress.level_number,
            state.label(),
            self.progress.potatoes_created_this_level
        );
        self.flush();
        self.events.push(SessionEvent::LevelFinished {
            level: self.progress.level_number,
            verdict,
        });
        self.notify_level_updated();
    }

    fn record_perfect_win(&mut self) {
        let color = level::level_color(self.progress.level_number);
        let milestone = self.config.timings.perfect_win_milestone;
        let unlock = self
            .unlocks
            .entry(color)
            .or_insert_with(|| UnlockSelection::new(color, Utc::now()));
        let unlocked = unlock.record_perfect_win(milestone, &mut self.rng);
        unlock.updated_at = Utc::now();
        if let Some(variant) = unlocked {
            log::info!("unlocked {variant} for {color}");
            self.events.push(SessionEvent::VariantUnlocked { color, variant });
        }
    }

    fn hydrate_template(&mut self) {
        let template = LevelTemplate::generate(
            self.progress.level_number,
            self.config.board_width,
            self.config.board_height,
            self.evolver.rules(),
        );
        self.board = Board::new(self.config.board_width, self.config.board_height);
        template.hydrate(&mut self.board);
        self.progress.pieces_snapshot.clear();
    }

    /// Cancel everything tied to the current level before another one takes over.
    fn leave_level(&mut self) {
        self.finalizer.cancel();
        self.autosave_at = None;
        self.evolver.clear_selection();
        self.last_evolution_at = None;
        if self.is_playing() {
            self.flush();
        }
        self.persistence.cancel_pending(self.progress.level_number);
    }

    fn arm_autosave(&mut self, now: Instant) {
        self.autosave_at = Some(now + self.config.timings.autosave);
    }

    /// Immediate write of the latest state. Failures are logged; memory stays authoritative.
    fn flush(&mut self) {
        let snapshot = self.snapshot();
        if let Err(e) = self.persistence.flush(snapshot) {
            log::warn!("save of level {} failed: {e}", self.progress.level_number);
        }
    }

    fn digest(&self) -> Option<u64> {
        let view = DigestView {
            level: self.progress.level_number,
            state: self.progress.state,
            potatoes: self.progress.potatoes_created_this_level,
            account_potatoes: self.account.potato_count,
            pieces: self.board.pieces().iter().map(|p| (p.id, p.color)).collect(),
            selection: self.evolver.selection(),
        };
        serde_json::to_vec(&view)
            .ok()
            .map(|bytes| XxHash64::oneshot(0, &bytes))
    }

    fn notify_level_updated(&mut self) {
        let digest = self.digest();
        if digest.is_some() && digest == self.last_digest {
            return;
        }
        self.last_digest = digest;
        self.events.push(SessionEvent::LevelUpdated {
            level: self.progress.level_number,
            state: self.progress.state,
            potatoes: self.progress.potatoes_created_this_level,
        });
    }

    #[cfg(test)]
    fn replace_board(&mut self, pieces: Vec<crate::board::Piece>, now: Instant) {
        self.board = Board::from_pieces(self.config.board_width, self.config.board_height, pieces);
        self.evolver.clear_selection();
        self.reevaluate(now);
    }
}

fn default_unlocks() -> BTreeMap<PieceColor, UnlockSelection> {
    let now = Utc::now();
    PieceColor::all()
        .map(|c| (c, UnlockSelection::new(c, now)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::Piece;
    use crate::persist::Profile;
    use crate::store::PruneReport;
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Debounced(u32, LevelState),
        Flush(u32, LevelState),
        Cancel(u32),
        Prune,
        Wipe,
    }

    /// Records every persistence call; remembers the last written level rows.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
        levels: HashMap<u32, LevelProgress>,
        unlocks: Vec<UnlockSelection>,
        fail_flush: bool,
    }

    impl Recorder {
        fn writes(&self) -> Vec<Call> {
            self.calls
                .iter()
                .filter(|c| matches!(c, Call::Debounced(..) | Call::Flush(..)))
                .cloned()
                .collect()
        }
    }

    impl Persistence for Recorder {
        fn save_debounced(&mut self, snapshot: Snapshot) {
            self.calls.push(Call::Debounced(snapshot.level.level_number, snapshot.level.state));
            self.levels.insert(snapshot.level.level_number, snapshot.level);
        }
        fn flush(&mut self, snapshot: Snapshot) -> Result<(), PersistError> {
            self.calls.push(Call::Flush(snapshot.level.level_number, snapshot.level.state));
            if self.fail_flush {
                return Err(PersistError::WorkerGone);
            }
            self.levels.insert(snapshot.level.level_number, snapshot.level);
            Ok(())
        }
        fn cancel_pending(&mut self, level: u32) {
            self.calls.push(Call::Cancel(level));
        }
        fn load_level(&mut self, level: u32) -> Result<Option<LevelProgress>, PersistError> {
            Ok(self.levels.get(&level).cloned())
        }
        fn load_profile(&mut self, _account_id: &str) -> Result<Profile, PersistError> {
            Ok(Profile {
                account: None,
                unlocks: self.unlocks.clone(),
            })
        }
        fn prune_duplicates(&mut self) -> Result<PruneReport, PersistError> {
            self.calls.push(Call::Prune);
            Ok(PruneReport::default())
        }
        fn wipe(&mut self) -> Result<(), PersistError> {
            self.calls.push(Call::Wipe);
            self.levels.clear();
            Ok(())
        }
    }

    fn color(n: u8) -> PieceColor {
        PieceColor::new(n).unwrap()
    }

    fn open(recorder: Recorder, t0: Instant) -> Session<Recorder> {
        Session::open(recorder, SessionConfig::default(), 1, t0, 42).unwrap()
    }

    fn row(c: PieceColor, n: usize, x: f32, y: f32) -> Vec<(PieceColor, Vec2)> {
        (0..n).map(|i| (c, Vec2::new(x + 30.0 * i as f32, y))).collect()
    }

    fn layout(board_width: f32, board_height: f32, pieces: &[(PieceColor, Vec2)]) -> Vec<Piece> {
        let mut board = Board::new(board_width, board_height);
        for &(color, pos) in pieces {
            board.spawn(color, pos);
        }
        board.snapshot()
    }

    fn set_board(s: &mut Session<Recorder>, pieces: &[(PieceColor, Vec2)], now: Instant) {
        let built = layout(BOARD_WIDTH, BOARD_HEIGHT, pieces);
        s.replace_board(built, now);
        s.drain_events();
        s.persistence.calls.clear();
    }

    fn merge_at(s: &mut Session<Recorder>, point: Vec2, now: Instant) {
        s.apply(SessionCommand::SelectAt(point), now);
        s.apply(SessionCommand::Confirm, now);
    }

    #[test]
    fn open_prunes_then_hydrates_from_template() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        let template = LevelTemplate::generate(1, BOARD_WIDTH, BOARD_HEIGHT, &MatchRules::default());
        assert_eq!(s.persistence().calls.first(), Some(&Call::Prune));
        assert_eq!(s.board().len(), template.pieces.len());
        assert!(s.is_playing());
        assert!(s.progress().started_at.is_some());
        assert!(
            s.drain_events()
                .iter()
                .any(|e| matches!(e, SessionEvent::LevelUpdated { level: 1, state: LevelState::Playing, .. }))
        );
    }

    #[test]
    fn start_restores_a_saved_layout() {
        let t0 = Instant::now();
        let mut recorder = Recorder::default();
        let mut saved = LevelProgress::fresh(1, Utc::now());
        saved.state = LevelState::Playing;
        saved.pieces_snapshot = layout(BOARD_WIDTH, BOARD_HEIGHT, &row(color(0), 3, 30.0, 30.0));
        saved.potatoes_created_this_level = 2;
        recorder.levels.insert(1, saved);
        let s = open(recorder, t0);
        assert_eq!(s.board().len(), 3);
        assert_eq!(s.progress().potatoes_created_this_level, 2);
    }

    #[test]
    fn confirming_seven_of_colour_two_spawns_four_of_colour_three() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        let mut pieces = row(color(2), 7, 20.0, 100.0);
        pieces.extend(row(color(0), 2, 20.0, 400.0));
        set_board(&mut s, &pieces, t0);

        merge_at(&mut s, Vec2::new(20.0, 100.0), t0);
        let events = s.drain_events();
        let evolution = events
            .iter()
            .find_map(|e| match e {
                SessionEvent::Evolved(ev) => Some(ev.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(evolution.removed.len(), 7);
        assert_eq!(evolution.spawned.len(), 4);
        assert_eq!(evolution.to, color(3));
        assert_eq!(s.board().histogram()[3], 4);
        assert_eq!(s.board().len(), 6);
        assert!(s.selection().is_empty());
        // Evaluator ran: a red pair remains, so nothing is pending.
        assert!(!s.finalizer.is_pending());
    }

    #[test]
    fn evolutions_within_cooldown_use_debounced_save() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        let mut pieces = row(color(0), 2, 30.0, 400.0);
        pieces.extend(row(color(1), 2, 30.0, 200.0));
        pieces.extend(row(color(2), 2, 30.0, 40.0));
        set_board(&mut s, &pieces, t0);

        merge_at(&mut s, Vec2::new(30.0, 400.0), t0);
        merge_at(&mut s, Vec2::new(30.0, 200.0), t0 + Duration::from_millis(500));
        assert_eq!(
            s.persistence().writes(),
            vec![Call::Flush(1, LevelState::Playing), Call::Debounced(1, LevelState::Playing)]
        );

        merge_at(&mut s, Vec2::new(30.0, 40.0), t0 + Duration::from_secs(4));
        assert_eq!(s.persistence().writes().last(), Some(&Call::Flush(1, LevelState::Playing)));
    }

    #[test]
    fn merging_into_potatoes_credits_level_and_account() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        let mut pieces = row(color(6), 3, 30.0, 30.0);
        pieces.extend(row(color(0), 2, 30.0, 400.0));
        set_board(&mut s, &pieces, t0);

        merge_at(&mut s, Vec2::new(30.0, 30.0), t0);
        assert_eq!(s.progress().potatoes_created_this_level, 2);
        assert_eq!(s.account().potato_count, 2);
    }

    #[test]
    fn natural_win_finalizes_after_grace() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        set_board(&mut s, &row(color(6), 2, 100.0, 100.0), t0);

        merge_at(&mut s, Vec2::new(100.0, 100.0), t0);
        assert!(s.is_playing());
        s.tick(t0 + Duration::from_millis(300));
        assert!(s.is_playing());
        s.tick(t0 + FINALIZE_GRACE);

        assert_eq!(s.progress().state, LevelState::WinPerfect);
        assert!(s.progress().completed_at.is_some());
        assert_eq!(s.unlock(level::level_color(1)).unwrap().perfect_win_count, 1);
        assert_eq!(s.persistence().writes().last(), Some(&Call::Flush(1, LevelState::WinPerfect)));
        assert!(s.persistence().levels[&1].pieces_snapshot.is_empty());
        assert!(
            s.drain_events()
                .contains(&SessionEvent::LevelFinished { level: 1, verdict: Verdict::Win { perfect: true } })
        );
        // Autosave stopped with the level.
        s.persistence.calls.clear();
        s.tick(t0 + Duration::from_secs(120));
        assert!(s.persistence().writes().is_empty());
    }

    #[test]
    fn merge_during_grace_reevaluates() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        // One red alone: loss pending; then physics pushes a second red next to it.
        let pieces = vec![(color(0), Vec2::new(30.0, 30.0)), (color(0), Vec2::new(300.0, 400.0))];
        set_board(&mut s, &pieces, t0);
        assert!(s.finalizer.is_pending());

        let far = s.board().pieces()[1].id;
        s.apply_positions(&[(far, Vec2::new(60.0, 30.0))], t0);
        s.tick(t0 + FINALIZE_GRACE);
        assert!(s.is_playing());
    }

    #[test]
    fn forced_end_wins_with_potato_and_continue_resumes() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        let mut pieces = vec![(PieceColor::TERMINAL, Vec2::new(30.0, 30.0))];
        pieces.extend(row(color(0), 2, 30.0, 400.0));
        set_board(&mut s, &pieces, t0);

        s.end_level(t0);
        assert_eq!(s.progress().state, LevelState::Win);
        assert_eq!(s.board().len(), 3);

        assert!(s.continue_level(t0));
        assert!(s.is_playing());
        assert_eq!(s.persistence().writes().last(), Some(&Call::Flush(1, LevelState::Playing)));
        assert!(!s.persistence().levels[&1].pieces_snapshot.is_empty());
    }

    #[test]
    fn forced_end_without_potato_loses_and_cannot_continue() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        set_board(&mut s, &row(color(0), 2, 30.0, 30.0), t0);
        s.end_level(t0);
        assert_eq!(s.progress().state, LevelState::Lose);
        assert!(!s.continue_level(t0));
    }

    #[test]
    fn forced_end_supersedes_pending_finalization() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        set_board(&mut s, &[(PieceColor::TERMINAL, Vec2::new(30.0, 30.0))], t0);
        assert!(s.finalizer.is_pending());
        s.end_level(t0);
        assert!(!s.finalizer.is_pending());
        let finished = s
            .drain_events()
            .iter()
            .filter(|e| matches!(e, SessionEvent::LevelFinished { .. }))
            .count();
        s.tick(t0 + Duration::from_secs(5));
        assert_eq!(finished, 1);
        assert!(s.drain_events().iter().all(|e| !matches!(e, SessionEvent::LevelFinished { .. })));
    }

    #[test]
    fn restart_regenerates_layout_and_resets_counters() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        set_board(&mut s, &row(color(6), 2, 100.0, 100.0), t0);
        merge_at(&mut s, Vec2::new(100.0, 100.0), t0);
        assert_eq!(s.progress().potatoes_created_this_level, 1);

        s.restart(t0);
        let template = LevelTemplate::generate(1, BOARD_WIDTH, BOARD_HEIGHT, &MatchRules::default());
        assert_eq!(s.board().len(), template.pieces.len());
        assert_eq!(s.progress().potatoes_created_this_level, 0);
        assert_eq!(s.account().potato_count, 1);
        assert!(!s.finalizer.is_pending());
        assert!(s.persistence().calls.contains(&Call::Cancel(1)));
        assert_eq!(s.persistence().writes().last(), Some(&Call::Flush(1, LevelState::Playing)));
    }

    #[test]
    fn autosave_fires_on_interval_while_playing() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        set_board(&mut s, &row(color(0), 2, 30.0, 30.0), t0);
        s.tick(t0 + Duration::from_secs(29));
        assert!(s.persistence().writes().is_empty());
        s.tick(t0 + Duration::from_secs(30));
        assert_eq!(s.persistence().writes(), vec![Call::Debounced(1, LevelState::Playing)]);
    }

    #[test]
    fn pause_flushes_and_stops_timers() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        set_board(&mut s, &row(color(0), 2, 30.0, 30.0), t0);
        s.pause();
        assert_eq!(s.persistence().writes(), vec![Call::Flush(1, LevelState::Playing)]);
        s.tick(t0 + Duration::from_secs(60));
        assert_eq!(s.persistence().writes().len(), 1);

        s.resume(t0 + Duration::from_secs(60));
        s.tick(t0 + Duration::from_secs(90));
        assert_eq!(s.persistence().writes().len(), 2);
    }

    #[test]
    fn switching_levels_flushes_and_cancels_old_level_first() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        s.persistence.calls.clear();
        s.start(2, t0).unwrap();
        let calls = &s.persistence().calls;
        assert_eq!(calls[0], Call::Flush(1, LevelState::Playing));
        assert_eq!(calls[1], Call::Cancel(1));
        assert_eq!(s.progress().level_number, 2);
        assert!(s.is_playing());
    }

    #[test]
    fn pack_levels_are_locked_without_the_pack() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        let err = s.start(level::FREE_LEVELS + 1, t0).unwrap_err();
        assert!(matches!(err, SessionError::Locked { .. }));
        assert_eq!(s.progress().level_number, 1);
    }

    #[test]
    fn finished_level_opens_finished_until_restarted() {
        let t0 = Instant::now();
        let mut recorder = Recorder::default();
        let mut done = LevelProgress::fresh(3, Utc::now());
        done.state = LevelState::Win;
        done.potatoes_created_this_level = 4;
        recorder.levels.insert(3, done);
        let mut s = open(recorder, t0);
        s.start(3, t0).unwrap();
        assert_eq!(s.progress().state, LevelState::Win);
        assert!(s.board().is_empty());
        assert!(!s.continue_level(t0));

        s.restart(t0);
        assert!(s.is_playing());
        assert_eq!(s.progress().potatoes_created_this_level, 0);
        assert!(!s.board().is_empty());
    }

    #[test]
    fn opening_a_locked_level_falls_back_to_level_one() {
        let t0 = Instant::now();
        let s = Session::open(Recorder::default(), SessionConfig::default(), level::FREE_LEVELS + 1, t0, 1).unwrap();
        assert_eq!(s.progress().level_number, 1);
        assert!(s.is_playing());
    }

    #[test]
    fn fifth_perfect_win_unlocks_a_variant() {
        let t0 = Instant::now();
        let lc = level::level_color(1);
        let mut unlock = UnlockSelection::new(lc, Utc::now());
        unlock.perfect_win_count = 4;
        let recorder = Recorder {
            unlocks: vec![unlock],
            ..Recorder::default()
        };
        let mut s = open(recorder, t0);
        set_board(&mut s, &[(PieceColor::TERMINAL, Vec2::new(30.0, 30.0))], t0);
        s.tick(t0 + FINALIZE_GRACE);

        assert_eq!(s.progress().state, LevelState::WinPerfect);
        assert!(
            s.drain_events()
                .iter()
                .any(|e| matches!(e, SessionEvent::VariantUnlocked { color, .. } if *color == lc))
        );
        assert_eq!(s.unlock(lc).unwrap().unlocked_variants.len(), 2);
    }

    #[test]
    fn corrupt_unlocks_heal_on_open() {
        let t0 = Instant::now();
        let mut bad = UnlockSelection::new(color(1), Utc::now());
        bad.selected_variant = "🦄".to_string();
        let recorder = Recorder {
            unlocks: vec![bad],
            ..Recorder::default()
        };
        let s = open(recorder, t0);
        assert_eq!(s.variant(color(1)), color(1).default_variant());
    }

    #[test]
    fn failed_flush_keeps_memory_state() {
        let t0 = Instant::now();
        let recorder = Recorder {
            fail_flush: true,
            ..Recorder::default()
        };
        let mut s = open(recorder, t0);
        set_board(&mut s, &row(color(6), 2, 100.0, 100.0), t0);
        merge_at(&mut s, Vec2::new(100.0, 100.0), t0);
        assert_eq!(s.account().potato_count, 1);
        assert!(s.is_playing());
    }

    #[test]
    fn level_updated_is_not_repeated_without_change() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        s.drain_events();
        s.apply(SessionCommand::Clear, t0);
        s.apply(SessionCommand::Clear, t0);
        assert!(s.drain_events().is_empty());
    }

    #[test]
    fn new_game_wipes_and_restarts_at_level_one() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        set_board(&mut s, &row(color(6), 2, 100.0, 100.0), t0);
        merge_at(&mut s, Vec2::new(100.0, 100.0), t0);
        s.start(2, t0).unwrap();

        s.new_game(t0).unwrap();
        assert!(s.persistence().calls.contains(&Call::Wipe));
        assert_eq!(s.account().potato_count, 0);
        assert_eq!(s.progress().level_number, 1);
        assert!(s.is_playing());
        assert!(s.drain_events().contains(&SessionEvent::NewGame));
    }

    #[test]
    fn commands_are_ignored_while_paused() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        set_board(&mut s, &row(color(0), 2, 30.0, 30.0), t0);
        s.pause();
        merge_at(&mut s, Vec2::new(30.0, 30.0), t0);
        assert_eq!(s.board().len(), 2);
        s.apply(SessionCommand::SetGravity(Vec2::new(1.0, 0.0)), t0);
        assert_eq!(s.gravity(), Vec2::new(1.0, 0.0));
    }

    #[test]
    fn cycle_variant_walks_unlocked_variants_only() {
        let t0 = Instant::now();
        let red = color(0);
        let mut unlock = UnlockSelection::new(red, Utc::now());
        unlock.unlocked_variants.insert("🍒".to_string());
        let recorder = Recorder {
            unlocks: vec![unlock],
            ..Recorder::default()
        };
        let mut s = open(recorder, t0);
        assert_eq!(s.variant(red), "🍎");

        assert_eq!(s.cycle_variant(red).as_deref(), Some("🍒"));
        assert_eq!(s.variant(red), "🍒");
        assert!(matches!(s.persistence().calls.last(), Some(Call::Debounced(1, LevelState::Playing))));
        assert_eq!(s.cycle_variant(red).as_deref(), Some("🍎"));
        assert_eq!(s.cycle_variant(color(2)), None);
    }

    #[test]
    fn settling_that_separates_the_last_pair_loses() {
        let t0 = Instant::now();
        let mut s = open(Recorder::default(), t0);
        set_board(&mut s, &row(color(0), 2, 30.0, 30.0), t0);
        assert!(!s.is_finishing());

        let moved = s.board().pieces()[1].id;
        let t1 = t0 + Duration::from_millis(100);
        s.apply_positions(&[(moved, Vec2::new(300.0, 400.0))], t1);
        assert!(s.is_finishing());
        // Further settling does not push the deadline back.
        s.apply_positions(&[(moved, Vec2::new(300.0, 398.0))], t1 + Duration::from_millis(300));
        s.tick(t1 + FINALIZE_GRACE);
        assert_eq!(s.progress().state, LevelState::Lose);
    }
}
