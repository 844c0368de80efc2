//! Capability registry: command hash to descriptor.
//!
//! Entries live in a backing map behind a read-mostly lock. A bounded LRU
//! cache sits in front of it; a miss only costs latency. Lock order is
//! always store then cache, and writers invalidate the cache while still
//! holding the store's write lock, so a reader can never repopulate the
//! cache with a retired descriptor.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::descriptor::{
    decode, encode, split_records, CodecError, CommandId, Descriptor, DescriptorFields,
    RegistryEntry,
};

/// Default number of descriptors kept in the LRU cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An entry for this command already exists.
    #[error("command {0} is already registered")]
    DuplicateCommand(CommandId),
    /// The raw bytes failed to decode.
    #[error("malformed descriptor: {0}")]
    Malformed(#[from] CodecError),
    /// The descriptor describes a different command than the one supplied.
    #[error("descriptor hash {found} does not match registered hash {expected}")]
    HashMismatch {
        /// Hash supplied by the caller.
        expected: CommandId,
        /// Hash inside the descriptor.
        found: CommandId,
    },
    /// No entry for this command.
    #[error("command {0} is not registered")]
    NotFound(CommandId),
}

/// Cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that fell through to the backing store.
    pub misses: u64,
    /// Entries currently cached.
    pub cached: usize,
    /// Maximum cached entries.
    pub capacity: usize,
}

/// One record of a descriptor database that could not be registered.
#[derive(Debug)]
pub struct RecordFailure {
    /// Position of the record in the file.
    pub index: usize,
    /// Byte offset of the record.
    pub offset: usize,
    /// Why it was rejected.
    pub error: RegistryError,
}

/// Outcome of [`CapabilityRegistry::load_database`].
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Records registered.
    pub loaded: usize,
    /// Records rejected.
    pub failures: Vec<RecordFailure>,
}

/// Maps command identifiers to their descriptors.
pub struct CapabilityRegistry {
    store: RwLock<HashMap<CommandId, RegistryEntry>>,
    cache: Mutex<LruCache>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("entries", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl CapabilityRegistry {
    /// Empty registry with an LRU cache of `cache_capacity` entries.
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
            cache: Mutex::new(LruCache::new(cache_capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Decode `raw` and register it under `command`.
    ///
    /// Corrupted bytes are rejected here, never at lookup. An existing entry
    /// is left untouched and reported as [`RegistryError::DuplicateCommand`].
    pub fn register(
        &self,
        command: impl Into<CommandId>,
        raw: &[u8],
        source: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let entry = checked_entry(command.into(), raw, source.into())?;
        let command = entry.descriptor.command();

        let mut store = self.store.write();
        if store.contains_key(&command) {
            return Err(RegistryError::DuplicateCommand(command));
        }
        store.insert(command, entry);
        drop(store);

        info!(command_hash = %command, "descriptor registered");
        Ok(())
    }

    /// Encode `fields` and register the result.
    pub fn register_fields(
        &self,
        fields: &DescriptorFields,
        source: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let raw = encode(fields)?;
        self.register(fields.command, &raw, source)
    }

    /// Overwrite an existing entry. Fails with [`RegistryError::NotFound`]
    /// when there is nothing to replace.
    pub fn replace(
        &self,
        command: impl Into<CommandId>,
        raw: &[u8],
        source: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let entry = checked_entry(command.into(), raw, source.into())?;
        let command = entry.descriptor.command();

        let mut store = self.store.write();
        let Some(slot) = store.get_mut(&command) else {
            return Err(RegistryError::NotFound(command));
        };
        *slot = entry;
        self.cache.lock().remove(command);
        drop(store);

        info!(command_hash = %command, "descriptor replaced");
        Ok(())
    }

    /// Retire an entry, returning it.
    pub fn remove(&self, command: impl Into<CommandId>) -> Result<RegistryEntry, RegistryError> {
        let command = command.into();
        let mut store = self.store.write();
        let entry = store
            .remove(&command)
            .ok_or(RegistryError::NotFound(command))?;
        self.cache.lock().remove(command);
        drop(store);

        info!(command_hash = %command, "descriptor removed");
        Ok(entry)
    }

    /// Descriptor for `command`, if registered.
    pub fn lookup(&self, command: impl Into<CommandId>) -> Option<Descriptor> {
        let command = command.into();
        if let Some(hit) = self.cache.lock().get(command) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(hit);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(command_hash = %command, "registry cache miss");

        let store = self.store.read();
        let descriptor = store.get(&command).map(|entry| entry.descriptor)?;
        self.cache.lock().put(command, descriptor);
        Some(descriptor)
    }

    /// Full entry (descriptor plus metadata) for `command`.
    pub fn entry(&self, command: impl Into<CommandId>) -> Option<RegistryEntry> {
        self.store.read().get(&command.into()).cloned()
    }

    /// Every entry, ordered by command hash.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<_> = self.store.read().values().cloned().collect();
        entries.sort_by_key(|entry| entry.descriptor.command());
        entries
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Cache counters.
    pub fn stats(&self) -> CacheStats {
        let cache = self.cache.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            cached: cache.len(),
            capacity: cache.capacity,
        }
    }

    /// Register every record of a descriptor database file.
    ///
    /// Each record is registered under the hash it carries, with source
    /// `"<path>#<index>"`. Bad records are collected in the report; only a
    /// failure to read the file aborts the load.
    pub fn load_database(&self, path: &Path) -> anyhow::Result<LoadReport> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read descriptor database {}", path.display()))?;
        Ok(self.load_records(&bytes, &path.display().to_string()))
    }

    /// [`load_database`](Self::load_database) over bytes already in memory.
    pub fn load_records(&self, bytes: &[u8], origin: &str) -> LoadReport {
        let mut report = LoadReport::default();
        let mut offset = 0usize;
        for (index, record) in split_records(bytes).into_iter().enumerate() {
            let result = match record {
                Ok(raw) => {
                    let at = offset;
                    offset = offset.saturating_add(raw.len());
                    decode(raw)
                        .map_err(RegistryError::from)
                        .and_then(|d| self.register(d.command(), raw, format!("{origin}#{index}")))
                        .map_err(|error| (at, error))
                }
                Err((at, error)) => Err((at, RegistryError::Malformed(error))),
            };
            match result {
                Ok(()) => report.loaded = report.loaded.saturating_add(1),
                Err((offset, error)) => {
                    warn!(origin, index, offset, error = %error, "descriptor record rejected");
                    report.failures.push(RecordFailure {
                        index,
                        offset,
                        error,
                    });
                }
            }
        }
        info!(
            origin,
            loaded = report.loaded,
            rejected = report.failures.len(),
            "descriptor database loaded"
        );
        report
    }
}

fn checked_entry(
    expected: CommandId,
    raw: &[u8],
    source: String,
) -> Result<RegistryEntry, RegistryError> {
    let descriptor = decode(raw)?;
    let found = descriptor.command();
    if found != expected {
        return Err(RegistryError::HashMismatch { expected, found });
    }
    Ok(RegistryEntry {
        descriptor,
        registered_at: Utc::now(),
        source,
    })
}

// ---------------------------------------------------------------------------
// LRU cache
// ---------------------------------------------------------------------------

/// Recency is a monotonically increasing tick; the smallest tick is evicted.
struct LruCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<CommandId, (Descriptor, u64)>,
    order: BTreeMap<u64, CommandId>,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            entries: HashMap::with_capacity(capacity),
            order: BTreeMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick = self.tick.wrapping_add(1);
        self.tick
    }

    fn get(&mut self, command: CommandId) -> Option<Descriptor> {
        let tick = self.next_tick();
        let (descriptor, last) = self.entries.get_mut(&command)?;
        self.order.remove(&*last);
        *last = tick;
        self.order.insert(tick, command);
        Some(*descriptor)
    }

    fn put(&mut self, command: CommandId, descriptor: Descriptor) {
        if self.capacity == 0 {
            return;
        }
        let tick = self.next_tick();
        if let Some((_, old)) = self.entries.insert(command, (descriptor, tick)) {
            self.order.remove(&old);
        }
        self.order.insert(tick, command);
        while self.entries.len() > self.capacity {
            let Some((_, evicted)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&evicted);
        }
    }

    fn remove(&mut self, command: CommandId) {
        if let Some((_, tick)) = self.entries.remove(&command) {
            self.order.remove(&tick);
        }
    }
}
