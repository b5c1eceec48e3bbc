//! Process-local shared-memory client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Segment, SegmentStatus, SegmentWriter, ShmClient, ShmError};

enum Slot {
    Pending,
    Ready(Arc<[u8]>),
}

#[derive(Default)]
struct Store {
    segments: HashMap<String, Slot>,
    opens: HashMap<String, usize>,
    allocations: usize,
}

/// In-memory client with the same semantics as the OS backend.
///
/// Clones share one store, so a test can keep a handle while the code
/// under test owns another and then inspect how often each segment was opened.
#[derive(Clone, Default)]
pub struct InMemoryShmClient {
    store: Arc<Mutex<Store>>,
}

impl InMemoryShmClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of successful `get` calls for a segment.
    pub fn open_count(&self, name: &str) -> usize {
        self.store().opens.get(name).copied().unwrap_or(0)
    }

    /// Number of successful `allocate` calls.
    pub fn allocation_count(&self) -> usize {
        self.store().allocations
    }

    /// Names of all segments, pending or ready, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.store().segments.keys().cloned().collect();
        names.sort();
        names
    }

    /// Store a published segment directly, bypassing the writer.
    pub fn insert(&self, name: &str, bytes: &[u8]) {
        self.store()
            .segments
            .insert(name.to_string(), Slot::Ready(Arc::from(bytes)));
    }
}

impl ShmClient for InMemoryShmClient {
    fn allocate(&self, name: &str, size: usize) -> Result<Box<dyn SegmentWriter>, ShmError> {
        let mut store = self.store();
        if store.segments.contains_key(name) {
            return Err(ShmError::AlreadyExists(name.to_string()));
        }
        store.segments.insert(name.to_string(), Slot::Pending);
        store.allocations += 1;

        Ok(Box::new(MemoryWriter {
            name: name.to_string(),
            buf: vec![0; size],
            store: Arc::clone(&self.store),
            closed: false,
        }))
    }

    fn get(&self, name: &str) -> Result<Box<dyn Segment>, ShmError> {
        let mut store = self.store();
        let bytes = match store.segments.get(name) {
            Some(Slot::Ready(bytes)) => Arc::clone(bytes),
            Some(Slot::Pending) => return Err(ShmError::NotReady(name.to_string())),
            None => return Err(ShmError::NotFound(name.to_string())),
        };
        *store.opens.entry(name.to_string()).or_default() += 1;

        Ok(Box::new(MemorySegment {
            name: name.to_string(),
            bytes,
        }))
    }

    fn status(&self, name: &str) -> Result<SegmentStatus, ShmError> {
        Ok(match self.store().segments.get(name) {
            Some(Slot::Ready(_)) => SegmentStatus::Ready,
            _ => SegmentStatus::Pending,
        })
    }

    fn purge(&self, name: &str) -> Result<(), ShmError> {
        self.store().segments.remove(name);
        Ok(())
    }
}

struct MemorySegment {
    name: String,
    bytes: Arc<[u8]>,
}

impl Segment for MemorySegment {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

struct MemoryWriter {
    name: String,
    buf: Vec<u8>,
    store: Arc<Mutex<Store>>,
    closed: bool,
}

impl SegmentWriter for MemoryWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn close(mut self: Box<Self>) -> Result<(), ShmError> {
        let bytes: Arc<[u8]> = Arc::from(std::mem::take(&mut self.buf));
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        match store.segments.get_mut(&self.name) {
            Some(slot) if matches!(slot, Slot::Pending) => *slot = Slot::Ready(bytes),
            _ => return Err(ShmError::NotFound(self.name.clone())),
        }
        drop(store);
        self.closed = true;
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(store.segments.get(&self.name), Some(Slot::Pending)) {
            store.segments.remove(&self.name);
        }
    }
}
