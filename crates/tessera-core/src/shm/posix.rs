//! OS named shared memory backend.
//!
//! Every segment starts with a 16-byte header:
//!
//! ```text
//! [0..8)   state   (u64, atomic: 0 = pending, 1 = ready)
//! [8..16)  length  (u64, native endian: payload size in bytes)
//! [16..)   payload
//! ```
//!
//! The mapping may be rounded up to a page by the OS, so the payload length
//! is stored rather than taken from the mapping size.

use std::sync::atomic::{AtomicU64, Ordering};

use shared_memory::{Shmem, ShmemConf, ShmemError};

use super::{Segment, SegmentStatus, SegmentWriter, ShmClient, ShmError};

const HEADER_LEN: usize = 16;
const STATE_READY: u64 = 1;

/// Default prefix for OS object names. Short enough that prefix + 24-char id
/// stays under the 31-character limit some platforms impose.
pub const DEFAULT_PREFIX: &str = "/ts";

/// Shared-memory client over OS named shared memory objects.
#[derive(Debug, Clone)]
pub struct PosixShmClient {
    prefix: String,
}

impl Default for PosixShmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PosixShmClient {
    /// Create a client using [`DEFAULT_PREFIX`].
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }

    /// Create a client whose OS object names start with `prefix`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn os_id(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn open(&self, name: &str) -> Result<Shmem, ShmError> {
        let shmem = ShmemConf::new()
            .os_id(self.os_id(name))
            .open()
            .map_err(|e| map_error(name, e))?;
        if shmem.len() < HEADER_LEN {
            return Err(ShmError::Corrupt {
                name: name.to_string(),
                reason: format!("mapping of {} bytes has no header", shmem.len()),
            });
        }
        Ok(shmem)
    }
}

fn map_error(name: &str, err: ShmemError) -> ShmError {
    match err {
        ShmemError::MappingIdExists | ShmemError::LinkExists => {
            ShmError::AlreadyExists(name.to_string())
        }
        ShmemError::MapOpenFailed(_) | ShmemError::LinkDoesNotExist | ShmemError::NoLinkOrOsId => {
            ShmError::NotFound(name.to_string())
        }
        other => ShmError::Backend {
            name: name.to_string(),
            message: other.to_string(),
        },
    }
}

fn state(shmem: &Shmem) -> &AtomicU64 {
    // SAFETY: the mapping is page aligned and at least HEADER_LEN long
    // (checked on open, guaranteed on create); the first 8 bytes are only
    // ever accessed through this atomic.
    unsafe { &*(shmem.as_ptr() as *const AtomicU64) }
}

fn payload_len(shmem: &Shmem) -> u64 {
    // SAFETY: see `state`; bytes 8..16 are written once before publishing.
    unsafe { (shmem.as_ptr().add(8) as *const u64).read() }
}

impl ShmClient for PosixShmClient {
    fn allocate(&self, name: &str, size: usize) -> Result<Box<dyn SegmentWriter>, ShmError> {
        // Creation is exclusive: the creator stays owner until close, so an
        // abandoned writer unlinks the object when it is dropped.
        let shmem = ShmemConf::new()
            .os_id(self.os_id(name))
            .size(HEADER_LEN + size)
            .create()
            .map_err(|e| map_error(name, e))?;

        // SAFETY: freshly created mapping of HEADER_LEN + size bytes.
        unsafe { (shmem.as_ptr().add(8) as *mut u64).write(size as u64) };

        tracing::trace!(name, size, "allocated segment");
        Ok(Box::new(PosixSegmentWriter {
            name: name.to_string(),
            shmem: Some(shmem),
            len: size,
        }))
    }

    fn get(&self, name: &str) -> Result<Box<dyn Segment>, ShmError> {
        let shmem = self.open(name)?;
        if state(&shmem).load(Ordering::Acquire) != STATE_READY {
            return Err(ShmError::NotReady(name.to_string()));
        }

        let len = payload_len(&shmem) as usize;
        if HEADER_LEN + len > shmem.len() {
            return Err(ShmError::Corrupt {
                name: name.to_string(),
                reason: format!(
                    "payload of {} bytes exceeds mapping of {} bytes",
                    len,
                    shmem.len()
                ),
            });
        }

        Ok(Box::new(PosixSegment {
            name: name.to_string(),
            shmem,
            len,
        }))
    }

    fn status(&self, name: &str) -> Result<SegmentStatus, ShmError> {
        match self.open(name) {
            Ok(shmem) if state(&shmem).load(Ordering::Acquire) == STATE_READY => {
                Ok(SegmentStatus::Ready)
            }
            Ok(_) | Err(ShmError::NotFound(_)) => Ok(SegmentStatus::Pending),
            Err(e) => Err(e),
        }
    }

    fn purge(&self, name: &str) -> Result<(), ShmError> {
        match self.open(name) {
            Ok(mut shmem) => {
                // Taking ownership makes the drop below unlink the object.
                shmem.set_owner(true);
                tracing::trace!(name, "purged segment");
                Ok(())
            }
            Err(ShmError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

struct PosixSegment {
    name: String,
    shmem: Shmem,
    len: usize,
}

impl Segment for PosixSegment {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_bytes(&self) -> &[u8] {
        // SAFETY: bounds checked in `get`; published segments are never
        // written again.
        unsafe { std::slice::from_raw_parts(self.shmem.as_ptr().add(HEADER_LEN), self.len) }
    }
}

struct PosixSegmentWriter {
    name: String,
    shmem: Option<Shmem>,
    len: usize,
}

impl SegmentWriter for PosixSegmentWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self.shmem.as_mut() {
            // SAFETY: mapping holds HEADER_LEN + len bytes and is exclusively
            // ours until published.
            Some(shmem) => unsafe {
                std::slice::from_raw_parts_mut(shmem.as_ptr().add(HEADER_LEN), self.len)
            },
            None => &mut [],
        }
    }

    fn close(mut self: Box<Self>) -> Result<(), ShmError> {
        let Some(mut shmem) = self.shmem.take() else {
            return Ok(());
        };
        state(&shmem).store(STATE_READY, Ordering::Release);
        // Hand the object over to the store; dropping only unmaps.
        shmem.set_owner(false);
        Ok(())
    }
}
