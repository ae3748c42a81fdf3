//! Persistence coordinator: a single worker thread owns the store and writes snapshots.
//!
//! The simulation side only sends value snapshots over a channel. Debounced saves are
//! coalesced: the first one in a window arms the deadline, later ones replace the payload,
//! and a single write happens when the deadline passes. A flush drops whatever is pending
//! and writes the caller's (newer) snapshot before replying.

use crate::progress::{Account, LevelProgress, UnlockSelection};
use crate::store::{self, PruneReport, Store, StoreError};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default debounce window.
pub const DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to start persistence worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("persistence worker has stopped")]
    WorkerGone,
}

/// Everything a session persists, by value.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub level: LevelProgress,
    pub account: Account,
    pub unlocks: Vec<UnlockSelection>,
}

/// Account-wide state loaded once per run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub account: Option<Account>,
    pub unlocks: Vec<UnlockSelection>,
}

/// What the session needs from persistence.
pub trait Persistence {
    /// Coalesced write; returns immediately.
    fn save_debounced(&mut self, snapshot: Snapshot);
    /// Drop any pending write and write `snapshot` now; returns once it is durable (or failed).
    fn flush(&mut self, snapshot: Snapshot) -> Result<(), PersistError>;
    /// Forget a pending debounced write for `level`, if any.
    fn cancel_pending(&mut self, level: u32);
    fn load_level(&mut self, level: u32) -> Result<Option<LevelProgress>, PersistError>;
    fn load_profile(&mut self, account_id: &str) -> Result<Profile, PersistError>;
    fn prune_duplicates(&mut self) -> Result<PruneReport, PersistError>;
    /// Delete every record of every entity type.
    fn wipe(&mut self) -> Result<(), PersistError>;
}

enum Command {
    Save(Snapshot),
    Flush(Snapshot, Sender<Result<(), PersistError>>),
    Cancel(u32),
    LoadLevel(u32, Sender<Option<LevelProgress>>),
    LoadProfile(String, Sender<Profile>),
    Prune(Sender<Result<PruneReport, PersistError>>),
    Wipe(Sender<Result<(), PersistError>>),
    Drain(Sender<Result<(), PersistError>>),
}

/// Handle to the worker. Dropping it writes anything pending and joins the thread.
pub struct Coordinator {
    tx: Option<Sender<Command>>,
    handle: Option<JoinHandle<()>>,
}

impl Coordinator {
    pub fn spawn<S: Store + 'static>(store: S, debounce: Duration) -> Result<Self, PersistError> {
        let (tx, rx) = mpsc::channel();
        let worker = Worker {
            store: Box::new(store),
            debounce,
            pending: None,
        };
        let handle = thread::Builder::new()
            .name("persist".to_string())
            .spawn(move || worker.run(&rx))?;
        log::info!("persistence worker started (debounce {} ms)", debounce.as_millis());
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    fn send(&self, cmd: Command) -> Result<(), PersistError> {
        self.tx
            .as_ref()
            .ok_or(PersistError::WorkerGone)?
            .send(cmd)
            .map_err(|_| PersistError::WorkerGone)
    }

    fn request<T>(&self, make: impl FnOnce(Sender<T>) -> Command) -> Result<T, PersistError> {
        let (reply, rx) = mpsc::channel();
        self.send(make(reply))?;
        rx.recv().map_err(|_| PersistError::WorkerGone)
    }

    /// Write any pending debounced snapshot now and wait for it.
    pub fn drain(&self) -> Result<(), PersistError> {
        self.request(Command::Drain)?
    }
}

impl Persistence for Coordinator {
    fn save_debounced(&mut self, snapshot: Snapshot) {
        if let Err(e) = self.send(Command::Save(snapshot)) {
            log::warn!("debounced save dropped: {e}");
        }
    }

    fn flush(&mut self, snapshot: Snapshot) -> Result<(), PersistError> {
        self.request(|reply| Command::Flush(snapshot, reply))?
    }

    fn cancel_pending(&mut self, level: u32) {
        if let Err(e) = self.send(Command::Cancel(level)) {
            log::warn!("cancel for level {level} not delivered: {e}");
        }
    }

    fn load_level(&mut self, level: u32) -> Result<Option<LevelProgress>, PersistError> {
        self.request(|reply| Command::LoadLevel(level, reply))
    }

    fn load_profile(&mut self, account_id: &str) -> Result<Profile, PersistError> {
        let id = account_id.to_string();
        self.request(|reply| Command::LoadProfile(id, reply))
    }

    fn prune_duplicates(&mut self) -> Result<PruneReport, PersistError> {
        self.request(Command::Prune)?
    }

    fn wipe(&mut self) -> Result<(), PersistError> {
        self.request(Command::Wipe)?
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        // Closing the channel makes the worker write what is pending and exit.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("persistence worker panicked");
            }
        }
    }
}

struct Worker {
    store: Box<dyn Store>,
    debounce: Duration,
    pending: Option<(Instant, Snapshot)>,
}

impl Worker {
    fn run(mut self, rx: &Receiver<Command>) {
        loop {
            let deadline = self.pending.as_ref().map(|(at, _)| *at);
            let cmd = match deadline {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(wait) {
                        Ok(cmd) => cmd,
                        Err(RecvTimeoutError::Timeout) => {
                            let _ = self.write_pending();
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(cmd) => cmd,
                    Err(_) => break,
                },
            };
            self.handle(cmd);
        }
        let _ = self.write_pending();
        log::info!("persistence worker stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Save(snapshot) => {
                let deadline = self
                    .pending
                    .as_ref()
                    .map_or_else(|| Instant::now() + self.debounce, |(at, _)| *at);
                self.pending = Some((deadline, snapshot));
            }
            Command::Flush(snapshot, reply) => {
                if self.pending.take().is_some() {
                    log::debug!("flush superseded a pending save");
                }
                let _ = reply.send(self.write(&snapshot));
            }
            Command::Cancel(level) => {
                if self
                    .pending
                    .as_ref()
                    .is_some_and(|(_, s)| s.level.level_number == level)
                {
                    log::debug!("cancelled pending save for level {level}");
                    self.pending = None;
                }
            }
            Command::LoadLevel(level, reply) => {
                let found = match &self.pending {
                    Some((_, s)) if s.level.level_number == level => Some(s.level.clone()),
                    _ => self.store.tables().fetch_one::<LevelProgress>(&level).cloned(),
                };
                let _ = reply.send(found);
            }
            Command::LoadProfile(id, reply) => {
                let profile = match &self.pending {
                    Some((_, s)) if s.account.id == id => Profile {
                        account: Some(s.account.clone()),
                        unlocks: s.unlocks.clone(),
                    },
                    _ => Profile {
                        account: self.store.tables().fetch_one::<Account>(&id).cloned(),
                        unlocks: self.store.tables().all::<UnlockSelection>(),
                    },
                };
                let _ = reply.send(profile);
            }
            Command::Prune(reply) => {
                let _ = reply.send(store::prune_duplicates(self.store.as_mut()).map_err(Into::into));
            }
            Command::Wipe(reply) => {
                self.pending = None;
                self.store.tables_mut().clear();
                let result = self.store.save().map_err(Into::into);
                log::info!("save data wiped");
                let _ = reply.send(result);
            }
            Command::Drain(reply) => {
                let _ = reply.send(self.write_pending());
            }
        }
    }

    fn write_pending(&mut self) -> Result<(), PersistError> {
        match self.pending.take() {
            Some((_, snapshot)) => self.write(&snapshot),
            None => Ok(()),
        }
    }

    /// Entities are written independently; a failure is logged and the rest still go out.
    fn write(&mut self, snapshot: &Snapshot) -> Result<(), PersistError> {
        let mut first_err = None;
        let mut note = |kind: &str, result: Result<(), StoreError>| {
            if let Err(e) = result {
                log::warn!("{kind} write failed: {e}");
                first_err.get_or_insert(e);
            }
        };
        note("level", store::write_entity(self.store.as_mut(), snapshot.level.clone()));
        note("account", store::write_entity(self.store.as_mut(), snapshot.account.clone()));
        for unlock in &snapshot.unlocks {
            note("unlock", store::write_entity(self.store.as_mut(), unlock.clone()));
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => {
                log::debug!("saved level {}", snapshot.level.level_number);
                Ok(())
            }
        }
    }
}
