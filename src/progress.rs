//! Persisted aggregates: level progress, the account, and per-colour unlock selections.

use crate::board::Piece;
use crate::color::PieceColor;
use crate::level;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Id of the single local account.
pub const DEFAULT_ACCOUNT_ID: &str = "local";

/// Every n-th perfect win on a colour unlocks one of its variants.
pub const PERFECT_WIN_MILESTONE: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LevelState {
    NewUnlocked,
    NewLevelPack,
    Playing,
    Win,
    WinPerfect,
    Lose,
}

impl LevelState {
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Win | Self::WinPerfect | Self::Lose)
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::NewUnlocked => "new",
            Self::NewLevelPack => "new (pack)",
            Self::Playing => "playing",
            Self::Win => "won",
            Self::WinPerfect => "perfect",
            Self::Lose => "lost",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelProgress {
    pub level_number: u32,
    pub state: LevelState,
    /// Board layout; empty until hydrated from the level template, and after the level ends.
    pub pieces_snapshot: Vec<Piece>,
    pub potatoes_created_this_level: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl LevelProgress {
    /// First-access record for a level.
    pub fn fresh(level_number: u32, now: DateTime<Utc>) -> Self {
        let state = if level::level_pack_id(level_number).is_some() {
            LevelState::NewLevelPack
        } else {
            LevelState::NewUnlocked
        };
        Self {
            level_number,
            state,
            pieces_snapshot: Vec::new(),
            potatoes_created_this_level: 0,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    /// Only grows, except on a new-game wipe.
    pub potato_count: u64,
    pub owned_level_pack_ids: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            potato_count: 0,
            owned_level_pack_ids: BTreeSet::new(),
            updated_at: now,
        }
    }

    pub fn add_potatoes(&mut self, n: u32) {
        self.potato_count = self.potato_count.saturating_add(u64::from(n));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockSelection {
    pub color: PieceColor,
    pub selected_variant: String,
    pub unlocked_variants: BTreeSet<String>,
    pub perfect_win_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl UnlockSelection {
    pub fn new(color: PieceColor, now: DateTime<Utc>) -> Self {
        let default = color.default_variant().to_string();
        Self {
            color,
            selected_variant: default.clone(),
            unlocked_variants: BTreeSet::from([default]),
            perfect_win_count: 0,
            updated_at: now,
        }
    }

    /// Restore `unlocked ⊆ available` and `selected ∈ unlocked`. Returns true if anything changed.
    pub fn heal(&mut self) -> bool {
        let available = self.color.available_variants();
        let before = (self.selected_variant.clone(), self.unlocked_variants.len());

        self.unlocked_variants.retain(|v| available.contains(&v.as_str()));
        if self.unlocked_variants.is_empty() {
            self.unlocked_variants.insert(self.color.default_variant().to_string());
        }
        if !self.unlocked_variants.contains(&self.selected_variant) {
            let first = available
                .iter()
                .find(|v| self.unlocked_variants.contains(**v))
                .copied()
                .unwrap_or(self.color.default_variant());
            self.selected_variant = first.to_string();
        }

        before != (self.selected_variant.clone(), self.unlocked_variants.len())
    }

    /// Available variants not yet unlocked, in catalogue order.
    pub fn locked_variants(&self) -> Vec<&'static str> {
        self.color
            .available_variants()
            .iter()
            .copied()
            .filter(|v| !self.unlocked_variants.contains(*v))
            .collect()
    }

    /// Count a perfect win; every `milestone`-th one unlocks a random locked variant.
    pub fn record_perfect_win<R: Rng + ?Sized>(&mut self, milestone: u32, rng: &mut R) -> Option<String> {
        self.perfect_win_count = self.perfect_win_count.saturating_add(1);
        if milestone == 0 || self.perfect_win_count % milestone != 0 {
            return None;
        }
        let variant = self.locked_variants().choose(rng).map(|v| (*v).to_string())?;
        self.unlocked_variants.insert(variant.clone());
        Some(variant)
    }

    /// Pick a variant; ignored unless unlocked.
    pub fn select(&mut self, variant: &str) -> bool {
        if self.unlocked_variants.contains(variant) {
            self.selected_variant = variant.to_string();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn red() -> PieceColor {
        PieceColor::new(0).unwrap()
    }

    #[test]
    fn fresh_state_depends_on_pack() {
        let now = Utc::now();
        assert_eq!(LevelProgress::fresh(1, now).state, LevelState::NewUnlocked);
        assert_eq!(
            LevelProgress::fresh(level::FREE_LEVELS + 1, now).state,
            LevelState::NewLevelPack
        );
    }

    #[test]
    fn heal_drops_unknown_variants_and_reselects() {
        let mut u = UnlockSelection::new(red(), Utc::now());
        u.unlocked_variants = BTreeSet::from(["🦄".to_string(), "🍓".to_string()]);
        u.selected_variant = "🦄".to_string();
        assert!(u.heal());
        assert_eq!(u.unlocked_variants, BTreeSet::from(["🍓".to_string()]));
        assert_eq!(u.selected_variant, "🍓");
        assert!(!u.heal());
    }

    #[test]
    fn heal_refills_an_empty_set() {
        let mut u = UnlockSelection::new(red(), Utc::now());
        u.unlocked_variants.clear();
        u.selected_variant.clear();
        u.heal();
        assert_eq!(u.selected_variant, red().default_variant());
        assert!(u.unlocked_variants.contains(red().default_variant()));
    }

    #[test]
    fn every_fifth_perfect_win_unlocks_one_variant() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut u = UnlockSelection::new(red(), Utc::now());
        for _ in 0..4 {
            assert_eq!(u.record_perfect_win(PERFECT_WIN_MILESTONE, &mut rng), None);
        }
        let unlocked = u.record_perfect_win(PERFECT_WIN_MILESTONE, &mut rng).unwrap();
        assert!(red().available_variants().contains(&unlocked.as_str()));
        assert_eq!(u.unlocked_variants.len(), 2);
    }

    #[test]
    fn milestone_with_nothing_locked_unlocks_nothing() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut u = UnlockSelection::new(PieceColor::TERMINAL, Utc::now());
        for _ in 0..PERFECT_WIN_MILESTONE {
            assert_eq!(u.record_perfect_win(PERFECT_WIN_MILESTONE, &mut rng), None);
        }
        assert_eq!(u.perfect_win_count, PERFECT_WIN_MILESTONE);
    }

    #[test]
    fn select_requires_unlocked() {
        let mut u = UnlockSelection::new(red(), Utc::now());
        assert!(!u.select("🍓"));
        u.unlocked_variants.insert("🍓".to_string());
        assert!(u.select("🍓"));
        assert_eq!(u.selected_variant, "🍓");
    }

    #[test]
    fn level_state_serializes_camel_case() {
        let json = serde_json::to_string(&LevelState::WinPerfect).unwrap();
        assert_eq!(json, "\"winPerfect\"");
    }
}
