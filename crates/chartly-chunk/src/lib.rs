// SPDX-License-Identifier: MIT OR Apache-2.0
//! CHTS1 time-series chunks for Chartly.
//!
//! A chunk is a self-describing binary blob: a `CHTS1` header with a JSON
//! meta document, followed by an optionally gzipped body of sorted series.
//! Point timestamps are delta-encoded signed varints, values are IEEE-754
//! bit patterns, and both each series and the whole body carry CRC32
//! checks computed over the uncompressed bytes.
//!
//! [`ingest`] accepts JSON (plain or gzipped) payloads and writes chunks
//! through a generic [`Sink`]; [`compact`] merges decoded chunks of the
//! same `(tenant, namespace)` deterministically.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod compact;
mod ingest;

pub use codec::{Decoded, Writer, WriterOptions, decode};
pub use compact::{CompactOptions, CompactWarning, DupPolicy, RangePolicy, compact};
pub use ingest::{IngestOptions, ingest};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Magic bytes opening every chunk.
pub const MAGIC: &[u8; 5] = b"CHTS1";
/// Current format version.
pub const VERSION: u16 = 1;
/// Flag bit 0: the body is gzip-compressed.
pub const FLAG_GZIP: u16 = 1;

/// Chunk-level metadata stored in the header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// Owning tenant.
    pub tenant: String,
    /// Namespace within the tenant.
    pub namespace: String,
    /// Inclusive window start (UTC).
    pub start: DateTime<Utc>,
    /// Exclusive window end (UTC).
    pub end: DateTime<Utc>,
}

/// A series key: an open, key-sorted map of identifying labels.
pub type SeriesKey = BTreeMap<String, Value>;

/// Canonical string form of a series key, used for sorting and identity.
#[must_use]
pub fn series_key_string(key: &SeriesKey) -> String {
    let value = Value::Object(key.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    let (bytes, _) = chartly_canonical::Canonicalizer::default().canonical_bytes(&value);
    String::from_utf8_lossy(&bytes).into_owned()
}

/// One observation: timestamp in nanoseconds since the epoch, plus value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Timestamp in nanoseconds since the Unix epoch (UTC).
    pub ts_ns: i64,
    /// Observed value.
    pub value: f64,
}

impl Point {
    /// The timestamp rendered as RFC3339Nano UTC.
    #[must_use]
    pub fn rfc3339(&self) -> String {
        chartly_canonical::format_rfc3339_nanos(DateTime::from_timestamp_nanos(self.ts_ns))
    }
}

/// One decoded series: key plus points sorted by timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    /// Identifying labels.
    pub key: SeriesKey,
    /// Points in ascending timestamp order.
    pub points: Vec<Point>,
}

/// A decoded chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Header metadata.
    pub meta: ChunkMeta,
    /// Series in canonical key order.
    pub series: Vec<Series>,
}

/// Accounting for an encoded chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRef {
    /// SHA-256 of the raw chunk bytes.
    pub sha256: String,
    /// Number of series in the chunk.
    pub series: usize,
    /// Total number of points across all series.
    pub points: usize,
    /// Size of the encoded chunk in bytes.
    pub bytes: usize,
}

/// Destination for encoded chunks. Persistence drivers live elsewhere;
/// the writer only needs `put`.
pub trait Sink {
    /// Store `bytes` at `path`.
    ///
    /// # Errors
    ///
    /// Implementations surface their own I/O failures.
    fn put(&mut self, path: &str, bytes: &[u8]) -> std::io::Result<()>;
}

/// In-memory sink for tests and buffering.
#[derive(Debug, Default)]
pub struct MemorySink {
    /// Stored objects by path.
    pub objects: BTreeMap<String, Vec<u8>>,
}

impl Sink for MemorySink {
    fn put(&mut self, path: &str, bytes: &[u8]) -> std::io::Result<()> {
        self.objects.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Errors from chunk encoding, decoding, ingestion, and compaction.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    /// The blob is not a structurally valid CHTS1 chunk.
    #[error("invalid chunk: {reason}")]
    DecodeInvalid {
        /// What failed.
        reason: String,
    },

    /// A CRC32 check failed.
    #[error("crc mismatch in {what}")]
    CrcMismatch {
        /// `"body"` or `"series <n>"`.
        what: String,
    },

    /// A size cap was exceeded.
    #[error("{what} exceeds {limit} bytes")]
    TooBig {
        /// What breached the cap.
        what: String,
        /// Configured cap.
        limit: usize,
    },

    /// A non-finite value was pushed without `allow_nan`.
    #[error("non-finite value in series {key}")]
    NonFinite {
        /// Canonical series key.
        key: String,
    },

    /// The writer was flushed twice.
    #[error("writer already flushed")]
    AlreadyFlushed,

    /// A series names a tenant or namespace different from the chunk meta.
    #[error("series tenant/namespace does not match meta: {detail}")]
    MetaMismatch {
        /// What disagreed.
        detail: String,
    },

    /// JSON (de)serialization failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying I/O failed (sink writes, gzip streams).
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}
