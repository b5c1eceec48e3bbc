//! Client side of the shared-memory segment store.
//!
//! Segments are named, write-once byte buffers that outlive the process
//! that wrote them. The executor and its task processes only ever talk to a
//! [`ShmClient`]; who owns the pages behind it is the client's business.
//!
//! - [`PosixShmClient`] - OS named shared memory, visible to every process
//!   on the host.
//! - [`InMemoryShmClient`] - a process-local map with open counters, for
//!   tests and single-process dry runs.
//!
//! # Lifecycle
//!
//! ```text
//! allocate(name, n) -> SegmentWriter --write--> close()   status: Pending -> Ready
//! get(name)         -> Segment (read-only view, released on drop)
//! purge(name)       -> segment removed (idempotent)
//! ```

mod memory;
mod posix;

use thiserror::Error;

pub use memory::InMemoryShmClient;
pub use posix::PosixShmClient;

/// Errors reported by a shared-memory client.
#[derive(Debug, Error)]
pub enum ShmError {
    /// No segment exists under the name.
    #[error("segment not found: {0}")]
    NotFound(String),

    /// A segment already exists under the name (double write or hash collision).
    #[error("segment already exists: {0}")]
    AlreadyExists(String),

    /// The segment exists but its writer has not closed it yet.
    #[error("segment not ready: {0}")]
    NotReady(String),

    /// The segment contents are not in the expected layout.
    #[error("segment {name} is corrupt: {reason}")]
    Corrupt { name: String, reason: String },

    /// Any other backend failure.
    #[error("shared memory error for {name}: {message}")]
    Backend { name: String, message: String },
}

/// Retrieval status of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    /// Not yet created, or created but not yet closed by its writer.
    Pending,
    /// Closed by its writer; `get` will succeed.
    Ready,
}

/// Read-only view of a published segment. The mapping is released on drop.
pub trait Segment {
    fn name(&self) -> &str;
    fn as_bytes(&self) -> &[u8];
}

/// Writable view of a freshly allocated segment.
///
/// Dropping a writer without calling [`close`](SegmentWriter::close)
/// abandons the allocation and removes the segment.
pub trait SegmentWriter {
    fn name(&self) -> &str;
    fn as_bytes_mut(&mut self) -> &mut [u8];

    /// Publish the segment and release the local mapping.
    fn close(self: Box<Self>) -> Result<(), ShmError>;
}

/// Operations offered by the shared-memory server.
pub trait ShmClient {
    /// Create a new segment of exactly `size` bytes. Fails if the name exists.
    fn allocate(&self, name: &str, size: usize) -> Result<Box<dyn SegmentWriter>, ShmError>;

    /// Open a published segment.
    fn get(&self, name: &str) -> Result<Box<dyn Segment>, ShmError>;

    /// Non-blocking status poll.
    fn status(&self, name: &str) -> Result<SegmentStatus, ShmError>;

    /// Remove a segment. Removing an absent segment is not an error.
    fn purge(&self, name: &str) -> Result<(), ShmError>;
}
