//! IPC protocol messages for Tessera worker processes.
//!
//! Uses length-prefixed rkyv messages.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message.
//!
//! - parent -> child: one [`WorkerPayload`] on the worker's stdin.
//! - child -> parent: at most one [`ChildReport`] on the report pipe, written
//!   just before a failing worker exits. The exit code is authoritative; the
//!   report only explains it.

use std::fmt;
use std::io::{Read, Write};

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::Subgraph;

/// Work sent from parent to worker process.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub struct WorkerPayload {
    /// Scheduler id of the unit, for log lines.
    pub proc_id: u64,
    /// Tasks to run, in order.
    pub subgraph: Subgraph,
}

/// Diagnostic sent from a failing worker to the parent.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum ChildReport {
    /// A task (or the worker before any task ran) returned an error.
    Failed {
        /// Task that failed, if one had started.
        task: Option<String>,
        /// Error message including its context chain.
        message: String,
    },

    /// A task panicked.
    Panicked {
        task: String,
        /// Panic message if available.
        message: String,
    },
}

impl fmt::Display for ChildReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildReport::Failed {
                task: Some(task),
                message,
            } => write!(f, "task {} failed: {}", task, message),
            ChildReport::Failed { task: None, message } => write!(f, "worker failed: {}", message),
            ChildReport::Panicked { task, message } => {
                write!(f, "task {} panicked: {}", task, message)
            }
        }
    }
}

/// Write a message to a writer using length-prefixed rkyv encoding.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::Ipc(format!("IPC message too large: {} bytes", bytes.len())))?;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Upper bound on a single frame body.
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024 * 1024;

/// Read a message from a reader using length-prefixed rkyv encoding.
///
/// The archive is validated before it is deserialized, so a corrupt or
/// hostile frame (a task can write to the report pipe) yields an error
/// rather than undefined behavior.
pub fn read_message<R: Read, T>(reader: &mut R) -> Result<T>
where
    T: Archive,
    T::Archived: for<'a> rkyv::bytecheck::CheckBytes<rkyv::api::high::HighValidator<'a, rkyv::rancor::Error>>
        + Deserialize<T, rkyv::api::high::HighDeserializer<rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message length: {}", e)))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    let mut bytes = rkyv::util::AlignedVec::<16>::with_capacity(len);
    bytes.resize(len, 0);
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    rkyv::from_bytes::<T, rkyv::rancor::Error>(&bytes)
        .map_err(|e| Error::Deserialization(format!("Failed to decode IPC message: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{EncodedValue, TaskUnit, WireTarget};
    use std::io::Cursor;

    #[test]
    fn test_payload_roundtrip() {
        let subgraph = Subgraph::new(
            "job-7",
            vec![
                TaskUnit::new("reader")
                    .with_entrypoint("sample.reader")
                    .output("out", "bytes"),
                TaskUnit::new("writer")
                    .with_func("write")
                    .gap()
                    .kwarg(
                        "fmt",
                        EncodedValue {
                            annotation: "str".to_string(),
                            bytes: b"value is {}".to_vec(),
                        },
                    )
                    .wire("reader", "out", WireTarget::Position(0), "bytes")
                    .output("out", "bytes"),
            ],
        )
        .with_packages(vec!["examplepkg".to_string()]);
        let payload = WorkerPayload {
            proc_id: 3,
            subgraph: subgraph.clone(),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &payload).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: WorkerPayload = read_message(&mut cursor).unwrap();
        assert_eq!(decoded.proc_id, 3);
        assert_eq!(decoded.subgraph, subgraph);
    }

    #[test]
    fn test_report_roundtrip() {
        let report = ChildReport::Failed {
            task: Some("processor".to_string()),
            message: "boom: inner cause".to_string(),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &report).unwrap();

        let decoded: ChildReport = read_message(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, report);
        assert_eq!(decoded.to_string(), "task processor failed: boom: inner cause");
    }

    #[test]
    fn test_truncated_frame() {
        let mut buf = Vec::new();
        write_message(&mut buf, &ChildReport::Panicked {
            task: "t".to_string(),
            message: "m".to_string(),
        })
        .unwrap();
        buf.truncate(buf.len() - 1);

        let result: Result<ChildReport> = read_message(&mut Cursor::new(buf));
        assert!(matches!(result, Err(Error::Ipc(_))));
    }

    #[test]
    fn test_garbage_frame_rejected() {
        // A well-formed length prefix followed by bytes that are not a valid archive.
        let mut buf = 16u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0xff; 16]);

        let result: Result<ChildReport> = read_message(&mut Cursor::new(buf));
        assert!(matches!(result, Err(Error::Deserialization(_))));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let buf = u32::MAX.to_le_bytes().to_vec();
        let result: Result<ChildReport> = read_message(&mut Cursor::new(buf));
        assert!(matches!(result, Err(Error::Ipc(_))));
    }
}
