//! Per-process cache over the shared-memory client.
//!
//! One [`ExecutionMemoryManager`] lives for one worker-process execution.
//! Every segment opened through [`get`](ExecutionMemoryManager::get) stays
//! mapped until the manager is dropped, and is released exactly once then,
//! whichever way the scope is left. Decoded values are owned copies and
//! [`view`](ExecutionMemoryManager::view) borrows from the manager, so no
//! reference into a mapping can outlive it.

use std::any::Any;
use std::collections::hash_map::Entry;

use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::serde_registry::{SerdeRegistry, Value};
use crate::shm::{Segment, ShmClient};

/// Scoped cache of open segments for one task-process execution.
pub struct ExecutionMemoryManager<'a> {
    client: &'a dyn ShmClient,
    registry: &'a SerdeRegistry,
    handles: FxHashMap<String, Box<dyn Segment>>,
}

impl<'a> ExecutionMemoryManager<'a> {
    pub fn new(client: &'a dyn ShmClient, registry: &'a SerdeRegistry) -> Self {
        Self {
            client,
            registry,
            handles: FxHashMap::default(),
        }
    }

    /// Fetch and decode a segment.
    ///
    /// The segment is opened on first use and reused afterwards.
    pub fn get(&mut self, shm_id: &str, annotation: &str) -> Result<Value> {
        let registry = self.registry;
        let bytes = self.view(shm_id)?;
        registry.decode(annotation, bytes)
    }

    /// Raw bytes of a segment, borrowed from the cached mapping.
    pub fn view(&mut self, shm_id: &str) -> Result<&[u8]> {
        let segment = match self.handles.entry(shm_id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let segment = self.client.get(shm_id)?;
                tracing::trace!(shm_id, len = segment.as_bytes().len(), "opened segment");
                entry.insert(segment)
            }
        };
        Ok(segment.as_bytes())
    }

    /// Encode a value and publish it as a new segment.
    ///
    /// The local mapping is closed immediately; readers open their own.
    pub fn put(&self, value: &(dyn Any + Send), shm_id: &str, annotation: &str) -> Result<()> {
        let bytes = self.registry.encode(annotation, value)?;
        let mut writer = self.client.allocate(shm_id, bytes.len())?;
        writer.as_bytes_mut().copy_from_slice(&bytes);
        writer.close()?;
        tracing::trace!(shm_id, len = bytes.len(), "published segment");
        Ok(())
    }

    /// Number of segments currently held open.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for ExecutionMemoryManager<'_> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            tracing::trace!(count = self.handles.len(), "releasing segments");
        }
        self.handles.clear();
    }
}
