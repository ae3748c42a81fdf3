//! Potatotui — tile-merging emoji puzzle in the terminal.

mod app;
mod board;
mod cluster;
mod color;
mod evolve;
mod input;
mod level;
mod persist;
mod physics;
mod progress;
mod session;
mod store;
mod theme;
mod ui;
mod verdict;

use anyhow::{Context, Result};
use app::App;
use clap::{Parser, ValueEnum};
use cluster::MatchRules;
use log::LevelFilter;
use persist::Coordinator;
use session::{Session, SessionConfig, SessionTimings};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use store::{JsonStore, MemoryStore};

const SAVE_FILE: &str = "save.json";
const LOG_FILE: &str = "potatotui.log";

/// Tunables gathered from the command line.
#[derive(Debug, Clone)]
pub struct GameConfig {
    pub session: SessionConfig,
    pub debounce: Duration,
    pub tick_rate: f64,
    pub no_animation: bool,
    pub seed: u64,
}

impl GameConfig {
    fn from_args(args: &Args) -> Self {
        let rules = MatchRules {
            match_minimum: args.match_minimum.max(2),
            ..MatchRules::default()
        };
        let timings = SessionTimings {
            autosave: Duration::from_secs(args.autosave_secs.max(1)),
            ..SessionTimings::default()
        };
        Self {
            session: SessionConfig {
                rules,
                timings,
                ..SessionConfig::default()
            },
            debounce: args.debounce_ms.map_or(persist::DEBOUNCE, Duration::from_millis),
            tick_rate: args.tick_rate,
            no_animation: args.no_animation,
            seed: args.seed.unwrap_or_else(rand::random),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| default_data_dir(std::env::var("XDG_DATA_HOME").ok(), std::env::var("HOME").ok()));
    std::fs::create_dir_all(&data_dir).with_context(|| format!("creating {}", data_dir.display()))?;
    init_logging(&data_dir, args.verbose);
    log::info!("potatotui starting, data in {}", data_dir.display());

    let theme = theme::Theme::load(args.theme.as_deref(), args.palette).unwrap_or_else(|e| {
        log::warn!("theme not loaded: {e}");
        theme::Theme::default()
    });
    let config = GameConfig::from_args(&args);

    let save_path = data_dir.join(SAVE_FILE);
    let coordinator = match JsonStore::open(&save_path) {
        Ok(store) => Coordinator::spawn(store, config.debounce)?,
        Err(e) => {
            log::error!("save {} unusable, progress will not be kept: {e}", save_path.display());
            Coordinator::spawn(MemoryStore::new(), config.debounce)?
        }
    };
    let now = Instant::now();
    let mut session = Session::open(coordinator, config.session, args.level.max(1), now, config.seed)?;
    if args.new_game {
        session.new_game(now)?;
    }

    let mut app = App::new(session, &config, theme);
    let result = app.run();
    let session = app.into_session();
    if let Err(e) = session.persistence().drain() {
        log::error!("final save failed: {e}");
    }
    log::info!("potatotui exiting");
    result
}

/// `$XDG_DATA_HOME/potatotui`, else `~/.local/share/potatotui`, else `./potatotui`.
fn default_data_dir(xdg_data_home: Option<String>, home: Option<String>) -> PathBuf {
    match (xdg_data_home.filter(|x| !x.is_empty()), home.filter(|h| !h.is_empty())) {
        (Some(xdg), _) => PathBuf::from(xdg).join("potatotui"),
        (None, Some(home)) => PathBuf::from(home).join(".local").join("share").join("potatotui"),
        (None, None) => PathBuf::from("potatotui"),
    }
}

/// The terminal is in raw mode while playing, so logs go to a file in the data dir.
fn init_logging(data_dir: &Path, verbose: bool) {
    let target: Box<dyn std::io::Write + Send> = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(data_dir.join(LOG_FILE))
    {
        Ok(file) => Box::new(file),
        Err(_) => Box::new(std::io::sink()),
    };
    let session_level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Info)
        .filter_module("potatotui::session", session_level)
        .filter_module("potatotui::evolve", session_level)
        .filter_module("potatotui::persist", LevelFilter::Info)
        .target(env_logger::Target::Pipe(target))
        .try_init();
}

/// Tile-merging emoji puzzle in the terminal.
#[derive(Debug, Parser)]
#[command(
    name = "potatotui",
    version,
    about = "Tile-merging emoji puzzle in the terminal. Merge touching same-colour pieces until only potatoes remain.",
    long_about = "Potatotui is a terminal merge puzzle.\n\n\
        Pieces settle under gravity. Tap a cluster of touching same-colour pieces to select it, \
        tap again (or press Enter) to merge it into half as many pieces of the next colour. \
        The last colour is the potato. Clear the board down to potatoes for a perfect win.\n\n\
        CONTROLS:\n  Arrows/hjkl Move cursor   Space  Tap      Enter  Merge    Tab  Next cluster\n  \
        Esc  Clear selection   WASD  Tilt gravity   [ / ]  Previous/next level\n  \
        P  Pause   V  Next emoji   E  End level   R  Restart   C  Continue after a win   N (shift)  New game   Q  Quit\n\n\
        Mouse clicks tap too. Use --theme to load a btop-style theme (e.g. onedark.theme)."
)]
pub struct Args {
    /// Level to open.
    #[arg(short, long, default_value = "1", value_name = "N")]
    pub level: u32,

    /// Directory for the save file and log. Defaults to $XDG_DATA_HOME/potatotui.
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Path to theme file (btop-style theme[key]=\"value\"). Uses One Dark if not set.
    #[arg(short, long, value_name = "FILE")]
    pub theme: Option<PathBuf>,

    /// Colour palette: normal (theme), high-contrast, or colorblind.
    #[arg(long, default_value = "normal")]
    pub palette: Palette,

    /// Smallest selectable cluster (at least 2).
    #[arg(long, default_value = "2", value_name = "N")]
    pub match_minimum: usize,

    /// Autosave interval while playing.
    #[arg(long, default_value = "30", value_name = "SECS")]
    pub autosave_secs: u64,

    /// Debounce window for coalesced saves. Defaults to 250 ms.
    #[arg(long, value_name = "MS")]
    pub debounce_ms: Option<u64>,

    /// Wipe all progress before starting.
    #[arg(long)]
    pub new_game: bool,

    /// Disable flash and fade effects.
    #[arg(long)]
    pub no_animation: bool,

    /// Physics ticks per second.
    #[arg(long, default_value = "30.0", value_name = "RATE")]
    pub tick_rate: f64,

    /// Seed for spawn jitter and unlock picks (random if unset).
    #[arg(long, value_name = "SEED")]
    pub seed: Option<u64>,

    /// Debug logging for session and merge events.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Palette {
    #[default]
    Normal,

    #[value(alias = "highcontrast", alias = "contrast")]
    HighContrast,

    #[value(alias = "colourblind")]
    Colorblind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_prefers_xdg_then_home() {
        assert_eq!(
            default_data_dir(Some("/x".into()), Some("/home/a".into())),
            PathBuf::from("/x/potatotui")
        );
        assert_eq!(
            default_data_dir(Some(String::new()), Some("/home/a".into())),
            PathBuf::from("/home/a/.local/share/potatotui")
        );
        assert_eq!(default_data_dir(None, None), PathBuf::from("potatotui"));
    }

    #[test]
    fn config_clamps_match_minimum_and_keeps_defaults() {
        let args = Args::parse_from(["potatotui", "--match-minimum", "1", "--seed", "7"]);
        let config = GameConfig::from_args(&args);
        assert_eq!(config.session.rules.match_minimum, 2);
        assert_eq!(config.session.timings.autosave, Duration::from_secs(30));
        assert_eq!(config.debounce, persist::DEBOUNCE);
        assert_eq!(config.seed, 7);
    }

    #[test]
    fn palette_aliases_parse() {
        let args = Args::parse_from(["potatotui", "--palette", "colourblind"]);
        assert_eq!(args.palette, Palette::Colorblind);
    }
}
