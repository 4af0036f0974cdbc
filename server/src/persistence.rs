//! Boundaries to external stores.
//!
//! Neither store may stall or crash a zone:
//! - The session cache is best effort. [`ResilientSessionCache`] mirrors every
//!   write in memory and serves from the mirror while the backing store fails.
//! - Combat events go through a bounded queue to an asynchronous writer that
//!   batches them into a [`DurableStore`]. A full queue drops the event.

use crate::components::GlobalId;
use crate::error::PersistenceError;
use crate::zone::migration::MigrantSnapshot;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// State of a player that logged out, kept so they resume where they left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub player_id: u64,
    pub zone: u32,
    pub saved_ms: u64,
    pub snapshot: MigrantSnapshot,
}

/// Low-latency key-value store for sessions and cross-zone notices.
pub trait SessionStore: Send {
    fn save(&mut self, record: &SessionRecord) -> Result<(), PersistenceError>;
    fn load(&mut self, player_id: u64) -> Result<Option<SessionRecord>, PersistenceError>;
    fn remove(&mut self, player_id: u64) -> Result<(), PersistenceError>;
    fn publish(&mut self, channel: &str, payload: &str) -> Result<(), PersistenceError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    sessions: HashMap<u64, Vec<u8>>,
    published: Vec<(String, String)>,
}

/// Process-local store. Clones share the same contents, so every zone in a
/// process sees one cache. Records are kept encoded, the way a remote
/// key-value store would hold them.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T, PersistenceError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PersistenceError::Unavailable("session store lock poisoned".into()))?;
        Ok(f(&mut state))
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.with(|state| state.published.clone()).unwrap_or_default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn save(&mut self, record: &SessionRecord) -> Result<(), PersistenceError> {
        let blob = bincode::serialize(record)?;
        self.with(|state| {
            state.sessions.insert(record.player_id, blob);
        })
    }

    fn load(&mut self, player_id: u64) -> Result<Option<SessionRecord>, PersistenceError> {
        match self.with(|state| state.sessions.get(&player_id).cloned())? {
            Some(blob) => Ok(Some(bincode::deserialize(&blob)?)),
            None => Ok(None),
        }
    }

    fn remove(&mut self, player_id: u64) -> Result<(), PersistenceError> {
        self.with(|state| {
            state.sessions.remove(&player_id);
        })
    }

    fn publish(&mut self, channel: &str, payload: &str) -> Result<(), PersistenceError> {
        self.with(|state| {
            state.published.push((channel.to_string(), payload.to_string()));
        })
    }
}

/// Session cache that keeps working when its backing store does not.
pub struct ResilientSessionCache {
    backing: Box<dyn SessionStore>,
    mirror: InMemorySessionStore,
    degraded: bool,
}

impl ResilientSessionCache {
    pub fn new(backing: Box<dyn SessionStore>) -> Self {
        Self {
            backing,
            mirror: InMemorySessionStore::new(),
            degraded: false,
        }
    }

    pub fn in_memory(store: InMemorySessionStore) -> Self {
        Self::new(Box::new(store))
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn save(&mut self, record: &SessionRecord) {
        if let Err(err) = self.mirror.save(record) {
            debug!("Session mirror save for {} failed: {}", record.player_id, err);
        }
        let result = self.backing.save(record);
        self.observe(result, "save");
    }

    pub fn load(&mut self, player_id: u64) -> Option<SessionRecord> {
        let result = self.backing.load(player_id);
        match self.observe(result, "load") {
            Some(Some(record)) => Some(record),
            _ => self.mirror.load(player_id).ok().flatten(),
        }
    }

    pub fn remove(&mut self, player_id: u64) {
        if let Err(err) = self.mirror.remove(player_id) {
            debug!("Session mirror remove for {} failed: {}", player_id, err);
        }
        let result = self.backing.remove(player_id);
        self.observe(result, "remove");
    }

    /// Cross-zone notice. Dropped while degraded; there is no local fan-out.
    pub fn publish(&mut self, channel: &str, payload: &str) -> bool {
        let result = self.backing.publish(channel, payload);
        self.observe(result, "publish").is_some()
    }

    /// Tracks healthy/degraded transitions, logging once per transition.
    fn observe<T>(&mut self, result: Result<T, PersistenceError>, operation: &str) -> Option<T> {
        match result {
            Ok(value) => {
                if self.degraded {
                    info!("Session cache recovered on {}", operation);
                    self.degraded = false;
                }
                Some(value)
            }
            Err(err) => {
                if !self.degraded {
                    warn!(
                        "Session cache unavailable ({} failed: {}), continuing in memory",
                        operation, err
                    );
                    self.degraded = true;
                }
                None
            }
        }
    }
}

/// One applied hit, as written to the durable log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatLogEntry {
    pub timestamp_ms: u64,
    pub zone: u32,
    pub tick: u32,
    pub attacker: GlobalId,
    pub target: GlobalId,
    pub sequence: u32,
    pub damage: u16,
    pub killed: bool,
    pub critical: bool,
}

/// Append-only store for combat events.
pub trait DurableStore: Send {
    fn append(&mut self, batch: &[CombatLogEntry]) -> Result<(), PersistenceError>;
}

/// One JSON object per line, appended to a file.
#[derive(Debug, Clone)]
pub struct JsonLinesStore {
    path: PathBuf,
}

impl JsonLinesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DurableStore for JsonLinesStore {
    fn append(&mut self, batch: &[CombatLogEntry]) -> Result<(), PersistenceError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        for entry in batch {
            serde_json::to_writer(&mut writer, entry)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Collects appended entries in memory. Clones share contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryDurableStore {
    entries: Arc<Mutex<Vec<CombatLogEntry>>>,
}

impl MemoryDurableStore {
    pub fn entries(&self) -> Vec<CombatLogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl DurableStore for MemoryDurableStore {
    fn append(&mut self, batch: &[CombatLogEntry]) -> Result<(), PersistenceError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| PersistenceError::Unavailable("durable store lock poisoned".into()))?;
        entries.extend_from_slice(batch);
        Ok(())
    }
}

/// Simulation-side handle of the combat event log. Never blocks.
#[derive(Debug, Clone)]
pub struct EventLog {
    sender: mpsc::Sender<CombatLogEntry>,
    dropped: u64,
}

impl EventLog {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<CombatLogEntry>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender, dropped: 0 }, receiver)
    }

    /// A log nobody reads; every entry counts as dropped.
    pub fn detached() -> Self {
        Self::new(1).0
    }

    pub fn record(&mut self, entry: CombatLogEntry) -> bool {
        match self.sender.try_send(entry) {
            Ok(()) => true,
            Err(err) => {
                self.dropped += 1;
                // Logged sparsely; a full queue would otherwise log every hit.
                if self.dropped.is_power_of_two() {
                    warn!("Combat event log dropping entries ({} so far): {}", self.dropped, err);
                }
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub written: u64,
    pub failed_batches: u64,
    pub discarded: u64,
}

/// Drains the event log into `store` until every sender is gone.
///
/// Entries are written in batches of `batch_size` or every `flush_interval`,
/// whichever comes first. A failed write keeps the batch for the next
/// attempt, up to ten batches' worth; older entries beyond that are dropped.
pub async fn run_event_writer<D: DurableStore + 'static>(
    mut receiver: mpsc::Receiver<CombatLogEntry>,
    store: D,
    batch_size: usize,
    flush_interval: Duration,
) -> WriterStats {
    // Stores do blocking I/O, so every append runs on the blocking pool
    let store = Arc::new(Mutex::new(store));
    let batch_size = batch_size.max(1);
    let max_pending = batch_size * 10;
    let mut pending: VecDeque<CombatLogEntry> = VecDeque::new();
    let mut stats = WriterStats::default();
    let mut interval = tokio::time::interval(flush_interval.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            entry = receiver.recv() => match entry {
                Some(entry) => {
                    pending.push_back(entry);
                    if pending.len() >= batch_size {
                        flush(&store, &mut pending, batch_size, &mut stats).await;
                    }
                }
                None => break,
            },
            _ = interval.tick() => {
                if !pending.is_empty() {
                    flush(&store, &mut pending, batch_size, &mut stats).await;
                }
            }
        }

        if pending.len() > max_pending {
            let excess = pending.len() - max_pending;
            pending.drain(..excess);
            stats.discarded += excess as u64;
            warn!("Durable store backlog full, discarded {} combat events", excess);
        }
    }

    while !pending.is_empty() {
        let before = stats.failed_batches;
        flush(&store, &mut pending, batch_size, &mut stats).await;
        if stats.failed_batches > before {
            stats.discarded += pending.len() as u64;
            warn!("Shutting down with {} unwritten combat events", pending.len());
            break;
        }
    }
    info!(
        "Combat event writer stopped: {} written, {} failed batches",
        stats.written, stats.failed_batches
    );
    stats
}

/// Writes up to one batch; a failure leaves it pending.
async fn flush<D: DurableStore + 'static>(
    store: &Arc<Mutex<D>>,
    pending: &mut VecDeque<CombatLogEntry>,
    batch_size: usize,
    stats: &mut WriterStats,
) {
    let count = pending.len().min(batch_size);
    let batch: Vec<CombatLogEntry> = pending.iter().take(count).cloned().collect();
    let store = Arc::clone(store);
    let result = tokio::task::spawn_blocking(move || {
        let mut store = store
            .lock()
            .map_err(|_| PersistenceError::Unavailable("durable store lock poisoned".into()))?;
        store.append(&batch)
    })
    .await
    .unwrap_or_else(|err| Err(PersistenceError::Unavailable(format!("write task failed: {}", err))));
    match result {
        Ok(()) => {
            pending.drain(..count);
            stats.written += count as u64;
            debug!("Wrote {} combat events", count);
        }
        Err(err) => {
            stats.failed_batches += 1;
            warn!("Durable store write failed, will retry: {}", err);
        }
    }
}
