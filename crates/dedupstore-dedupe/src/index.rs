//! The deduplication index interface.
//!
//! The index maps content hashes to advised physical locations. Queries
//! and updates are asynchronous in production; the hash zone expresses
//! them as actions and is re-entered with the result, so this module only
//! carries the advice type, its validation, and an in-memory double.

use std::collections::HashMap;

use dedupstore_core::mapping::ZonedPbn;
use dedupstore_core::types::ChunkName;

/// A physical location advised by the index for some content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupeAdvice {
    /// The advised location and mapping state.
    pub location: ZonedPbn,
}

impl DedupeAdvice {
    /// Creates advice for a location.
    pub fn new(location: ZonedPbn) -> Self {
        Self { location }
    }

    /// Advice is usable only if it names a real mapped block. The zero
    /// block never carries counted references, so advice pointing at it is
    /// stale by definition.
    pub fn is_usable(&self) -> bool {
        !self.location.is_unmapped() && !self.location.pbn.is_zero_block()
    }
}

/// The asynchronous index operations, shaped for a driver loop.
pub trait DedupeIndex {
    /// Queries the index for `name`. When `new_location` is supplied the
    /// query also posts it as the hash's location if the index had no
    /// entry, in which case no later update is needed.
    fn query(&mut self, name: ChunkName, new_location: Option<ZonedPbn>) -> Option<DedupeAdvice>;

    /// Overwrites the index entry for `name`.
    fn update(&mut self, name: ChunkName, location: ZonedPbn);
}

/// In-memory index double.
#[derive(Default)]
pub struct InMemoryDedupeIndex {
    entries: HashMap<ChunkName, ZonedPbn>,
    queries: u64,
    updates: u64,
}

impl InMemoryDedupeIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queries served.
    pub fn queries(&self) -> u64 {
        self.queries
    }

    /// Number of updates applied.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// The stored location for `name`, if any.
    pub fn entry(&self, name: &ChunkName) -> Option<ZonedPbn> {
        self.entries.get(name).copied()
    }
}

impl DedupeIndex for InMemoryDedupeIndex {
    fn query(&mut self, name: ChunkName, new_location: Option<ZonedPbn>) -> Option<DedupeAdvice> {
        self.queries += 1;
        match self.entries.get(&name) {
            Some(location) => Some(DedupeAdvice::new(*location)),
            None => {
                if let Some(location) = new_location {
                    self.entries.insert(name, location);
                }
                None
            }
        }
    }

    fn update(&mut self, name: ChunkName, location: ZonedPbn) {
        self.updates += 1;
        self.entries.insert(name, location);
    }
}
