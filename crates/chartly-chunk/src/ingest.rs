// SPDX-License-Identifier: MIT OR Apache-2.0

//! JSON/gzip time-series ingestion into CHTS1 chunks.

use chrono::DateTime;
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Read;
use tracing::debug;

use crate::codec::{Writer, WriterOptions};
use crate::{ChunkError, ChunkMeta, ChunkRef, Sink};

/// Gzip stream magic bytes.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Knobs for ingestion.
#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    /// Cap on the (decompressed) payload size.
    pub max_bytes: usize,
    /// Writer options for the produced chunk.
    pub writer: WriterOptions,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_bytes: 32 << 20,
            writer: WriterOptions::default(),
        }
    }
}

/// Wire shape of an ingestion payload.
#[derive(Debug, Deserialize)]
struct IngestPayload {
    meta: ChunkMeta,
    series: Vec<IngestSeries>,
}

#[derive(Debug, Deserialize)]
struct IngestSeries {
    /// Optional per-series tenant; must match `meta.tenant` when present.
    #[serde(default)]
    tenant: Option<String>,
    /// Optional per-series namespace; must match `meta.namespace`.
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    key: BTreeMap<String, Value>,
    points: Vec<IngestPoint>,
}

#[derive(Debug, Deserialize)]
struct IngestPoint {
    /// RFC3339 timestamp.
    ts: String,
    value: f64,
}

/// Read a JSON (or gzipped JSON) payload and write it as one CHTS1 chunk.
///
/// The payload is strictly decoded (unknown shapes and trailing data are
/// errors). Series whose `tenant`/`namespace` disagree with the meta fail
/// closed before anything is written.
///
/// # Errors
///
/// Size-cap, decode, meta-mismatch, and sink failures.
pub fn ingest<R: Read>(
    reader: R,
    sink: &mut dyn Sink,
    prefix: &str,
    opts: IngestOptions,
) -> Result<ChunkRef, ChunkError> {
    let raw = read_bounded(reader, opts.max_bytes, "payload")?;
    let json = if raw.len() >= 2 && raw[..2] == GZIP_MAGIC {
        read_bounded(GzDecoder::new(raw.as_slice()), opts.max_bytes, "decompressed payload")?
    } else {
        raw
    };

    let payload: IngestPayload = serde_json::from_slice(&json)?;

    for series in &payload.series {
        if let Some(tenant) = &series.tenant
            && tenant != &payload.meta.tenant
        {
            return Err(ChunkError::MetaMismatch {
                detail: format!("series tenant '{tenant}' != meta tenant '{}'", payload.meta.tenant),
            });
        }
        if let Some(namespace) = &series.namespace
            && namespace != &payload.meta.namespace
        {
            return Err(ChunkError::MetaMismatch {
                detail: format!(
                    "series namespace '{namespace}' != meta namespace '{}'",
                    payload.meta.namespace
                ),
            });
        }
    }

    let path = format!(
        "{prefix}{}/{}/{}.chts1",
        payload.meta.tenant,
        payload.meta.namespace,
        payload.meta.start.timestamp_nanos_opt().unwrap_or_default()
    );

    let mut writer = Writer::new(payload.meta, opts.writer);
    for series in &payload.series {
        for point in &series.points {
            let ts = DateTime::parse_from_rfc3339(&point.ts).map_err(|e| {
                ChunkError::DecodeInvalid {
                    reason: format!("bad timestamp '{}': {e}", point.ts),
                }
            })?;
            let ts_ns = ts
                .timestamp_nanos_opt()
                .ok_or_else(|| ChunkError::DecodeInvalid {
                    reason: format!("timestamp '{}' outside the nanosecond range", point.ts),
                })?;
            writer.push(&series.key, ts_ns, point.value)?;
        }
    }

    let reference = writer.flush(sink, &path)?;
    debug!(path, sha256 = %reference.sha256, "ingested chunk");
    Ok(reference)
}

fn read_bounded<R: Read>(mut reader: R, limit: usize, what: &str) -> Result<Vec<u8>, ChunkError> {
    let mut buf = Vec::new();
    let mut take = reader.by_ref().take(limit as u64 + 1);
    take.read_to_end(&mut buf)?;
    if buf.len() > limit {
        return Err(ChunkError::TooBig {
            what: what.to_string(),
            limit,
        });
    }
    Ok(buf)
}
