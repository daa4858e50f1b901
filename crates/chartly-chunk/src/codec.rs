// SPDX-License-Identifier: MIT OR Apache-2.0

//! CHTS1 binary encode/decode.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! "CHTS1" | u16 version=1 | u16 flags | u32 meta_len | meta_json | body
//! body:   u32 series_count
//!         ( u32 key_len | key_json | u32 points_count
//!           | i64 base_ts_ns | f64 value
//!           | ( varint dts | f64 value )*
//!           | u32 series_crc32 )*
//!         u32 body_crc32
//! ```
//!
//! The series CRC covers `key_json + raw_point_bytes`; the body CRC covers
//! everything after `series_count` through the final series CRC inclusive.
//! When flag bit 0 is set the body is gzipped; CRCs are always computed
//! over the uncompressed bytes.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use tracing::debug;

use crate::{
    Chunk, ChunkError, ChunkMeta, ChunkRef, FLAG_GZIP, MAGIC, Point, Series, SeriesKey, Sink,
    VERSION, series_key_string,
};

/// Hard sanity cap on per-series point counts during decode.
const MAX_POINTS_PER_SERIES: u32 = 1 << 24;

/// Knobs for the chunk writer.
#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    /// Gzip the body (flag bit 0).
    pub gzip_body: bool,
    /// Accept NaN/Inf values instead of rejecting them.
    pub allow_nan: bool,
    /// Cap on the serialized meta document.
    pub max_meta_bytes: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            gzip_body: false,
            allow_nan: false,
            max_meta_bytes: 1 << 20,
        }
    }
}

/// Accumulates points and encodes a CHTS1 chunk exactly once.
///
/// # Examples
///
/// ```
/// use chartly_chunk::{ChunkMeta, MemorySink, Writer, WriterOptions};
/// use chrono::{TimeZone, Utc};
///
/// let meta = ChunkMeta {
///     tenant: "t".into(),
///     namespace: "n".into(),
///     start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
///     end: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
/// };
/// let mut writer = Writer::new(meta, WriterOptions::default());
/// let key = std::collections::BTreeMap::from([("a".to_string(), serde_json::json!(1))]);
/// writer.push(&key, 1_700_000_000_000_000_000, 1.0).unwrap();
///
/// let mut sink = MemorySink::default();
/// let reference = writer.flush(&mut sink, "t/n/0.chts1").unwrap();
/// assert_eq!(reference.series, 1);
/// assert_eq!(reference.points, 1);
/// ```
#[derive(Debug)]
pub struct Writer {
    meta: ChunkMeta,
    opts: WriterOptions,
    series: BTreeMap<String, Series>,
    flushed: bool,
}

impl Writer {
    /// Create a writer for one chunk.
    #[must_use]
    pub fn new(meta: ChunkMeta, opts: WriterOptions) -> Self {
        Self {
            meta,
            opts,
            series: BTreeMap::new(),
            flushed: false,
        }
    }

    /// Append one point to the series identified by `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::NonFinite`] for NaN/Inf values unless
    /// `allow_nan` is set.
    pub fn push(&mut self, key: &SeriesKey, ts_ns: i64, value: f64) -> Result<(), ChunkError> {
        let key_string = series_key_string(key);
        if !value.is_finite() && !self.opts.allow_nan {
            return Err(ChunkError::NonFinite { key: key_string });
        }
        self.series
            .entry(key_string)
            .or_insert_with(|| Series {
                key: key.clone(),
                points: Vec::new(),
            })
            .points
            .push(Point { ts_ns, value });
        Ok(())
    }

    /// Encode the chunk and write it to `sink` at `path`.
    ///
    /// Series are sorted by canonical key string and points by timestamp;
    /// encoding happens exactly once per writer.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::AlreadyFlushed`] on a second flush, meta-cap
    /// and serialization failures, or sink I/O errors.
    pub fn flush(&mut self, sink: &mut dyn Sink, path: &str) -> Result<ChunkRef, ChunkError> {
        if self.flushed {
            return Err(ChunkError::AlreadyFlushed);
        }
        self.flushed = true;

        let meta_json = serde_json::to_vec(&self.meta)?;
        if meta_json.len() > self.opts.max_meta_bytes {
            return Err(ChunkError::TooBig {
                what: "meta".into(),
                limit: self.opts.max_meta_bytes,
            });
        }

        // The series map is keyed by canonical key string, so iteration is
        // already in the deterministic output order.
        let mut body = Vec::new();
        body.extend_from_slice(&u32::try_from(self.series.len()).unwrap_or(u32::MAX).to_le_bytes());
        let mut total_points = 0usize;
        for (key_string, series) in &mut self.series {
            series.points.sort_by_key(|p| p.ts_ns);
            total_points += series.points.len();

            let mut guarded = Vec::new();
            guarded.extend_from_slice(key_string.as_bytes());
            encode_points(&series.points, &mut guarded);

            body.extend_from_slice(&u32::try_from(key_string.len()).unwrap_or(u32::MAX).to_le_bytes());
            let points_offset = key_string.len();
            body.extend_from_slice(&guarded[..points_offset]);
            body.extend_from_slice(
                &u32::try_from(series.points.len()).unwrap_or(u32::MAX).to_le_bytes(),
            );
            body.extend_from_slice(&guarded[points_offset..]);
            body.extend_from_slice(&crc32fast::hash(&guarded).to_le_bytes());
        }
        let body_crc = crc32fast::hash(&body[4..]);
        body.extend_from_slice(&body_crc.to_le_bytes());

        let (flags, body) = if self.opts.gzip_body {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&body)?;
            (FLAG_GZIP, encoder.finish()?)
        } else {
            (0, body)
        };

        let mut out = Vec::with_capacity(5 + 2 + 2 + 4 + meta_json.len() + body.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&u32::try_from(meta_json.len()).unwrap_or(u32::MAX).to_le_bytes());
        out.extend_from_slice(&meta_json);
        out.extend_from_slice(&body);

        sink.put(path, &out)?;
        let reference = ChunkRef {
            sha256: chartly_canonical::sha256_hex(&out),
            series: self.series.len(),
            points: total_points,
            bytes: out.len(),
        };
        debug!(path, series = reference.series, points = reference.points, "flushed chunk");
        Ok(reference)
    }
}

/// Encode sorted points: full base timestamp, then delta varints.
fn encode_points(points: &[Point], out: &mut Vec<u8>) {
    let mut previous = 0i64;
    for (i, point) in points.iter().enumerate() {
        if i == 0 {
            out.extend_from_slice(&point.ts_ns.to_le_bytes());
        } else {
            write_varint(point.ts_ns - previous, out);
        }
        previous = point.ts_ns;
        out.extend_from_slice(&point.value.to_bits().to_le_bytes());
    }
}

/// Zigzag + LEB128 signed varint.
fn write_varint(value: i64, out: &mut Vec<u8>) {
    let mut zigzag = ((value << 1) ^ (value >> 63)) as u64;
    loop {
        let mut byte = (zigzag & 0x7f) as u8;
        zigzag >>= 7;
        if zigzag != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if zigzag == 0 {
            break;
        }
    }
}

fn read_varint(bytes: &[u8], cursor: &mut usize) -> Result<i64, ChunkError> {
    let mut zigzag = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*cursor).ok_or_else(|| ChunkError::DecodeInvalid {
            reason: "truncated varint".into(),
        })?;
        *cursor += 1;
        zigzag |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return Err(ChunkError::DecodeInvalid {
                reason: "varint overflow".into(),
            });
        }
    }
    Ok(((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64))
}

/// A decoded chunk together with its accounting reference.
#[derive(Debug, Clone)]
pub struct Decoded {
    /// The decoded chunk.
    pub chunk: Chunk,
    /// Accounting over the raw bytes.
    pub reference: ChunkRef,
}

/// Decode and integrity-check a CHTS1 chunk.
///
/// The body CRC is verified before any series parsing; each series CRC is
/// verified before its points are trusted; point counts are range-checked.
///
/// # Errors
///
/// [`ChunkError::DecodeInvalid`] for structural failures and
/// [`ChunkError::CrcMismatch`] for integrity failures.
pub fn decode(bytes: &[u8], max_meta_bytes: usize) -> Result<Decoded, ChunkError> {
    let mut cursor = 0usize;
    let magic = take(bytes, &mut cursor, 5)?;
    if magic != MAGIC.as_slice() {
        return Err(ChunkError::DecodeInvalid {
            reason: "bad magic".into(),
        });
    }
    let version = u16::from_le_bytes(take(bytes, &mut cursor, 2)?.try_into().unwrap_or_default());
    if version != VERSION {
        return Err(ChunkError::DecodeInvalid {
            reason: format!("unsupported version {version}"),
        });
    }
    let flags = u16::from_le_bytes(take(bytes, &mut cursor, 2)?.try_into().unwrap_or_default());
    let meta_len =
        u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().unwrap_or_default()) as usize;
    if meta_len > max_meta_bytes {
        return Err(ChunkError::TooBig {
            what: "meta".into(),
            limit: max_meta_bytes,
        });
    }
    let meta_json = take(bytes, &mut cursor, meta_len)?;
    let meta: ChunkMeta = serde_json::from_slice(meta_json)?;

    let raw_body = &bytes[cursor..];
    let body: Vec<u8> = if flags & FLAG_GZIP != 0 {
        let mut decoder = GzDecoder::new(raw_body);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        decompressed
    } else {
        raw_body.to_vec()
    };

    if body.len() < 8 {
        return Err(ChunkError::DecodeInvalid {
            reason: "body too short".into(),
        });
    }

    // Body CRC first: no series is parsed from a corrupt body.
    let stored_body_crc =
        u32::from_le_bytes(body[body.len() - 4..].try_into().unwrap_or_default());
    if crc32fast::hash(&body[4..body.len() - 4]) != stored_body_crc {
        return Err(ChunkError::CrcMismatch {
            what: "body".into(),
        });
    }

    let mut cursor = 0usize;
    let series_count =
        u32::from_le_bytes(take(&body, &mut cursor, 4)?.try_into().unwrap_or_default());
    let payload_end = body.len() - 4;

    let mut series_out = Vec::with_capacity(series_count as usize);
    let mut total_points = 0usize;
    for index in 0..series_count {
        let key_len =
            u32::from_le_bytes(take(&body, &mut cursor, 4)?.try_into().unwrap_or_default())
                as usize;
        let key_start = cursor;
        let key_json = take(&body, &mut cursor, key_len)?;
        let key: SeriesKey = serde_json::from_slice(key_json)?;

        let points_count =
            u32::from_le_bytes(take(&body, &mut cursor, 4)?.try_into().unwrap_or_default());
        if points_count > MAX_POINTS_PER_SERIES {
            return Err(ChunkError::DecodeInvalid {
                reason: format!("series {index} claims {points_count} points"),
            });
        }

        let points_start = cursor;
        let mut points = Vec::with_capacity(points_count as usize);
        let mut previous = 0i64;
        for i in 0..points_count {
            let ts_ns = if i == 0 {
                i64::from_le_bytes(take(&body, &mut cursor, 8)?.try_into().unwrap_or_default())
            } else {
                previous
                    .checked_add(read_varint(&body, &mut cursor)?)
                    .ok_or_else(|| ChunkError::DecodeInvalid {
                        reason: "timestamp overflow".into(),
                    })?
            };
            previous = ts_ns;
            let value = f64::from_bits(u64::from_le_bytes(
                take(&body, &mut cursor, 8)?.try_into().unwrap_or_default(),
            ));
            points.push(Point { ts_ns, value });
        }

        // Series CRC covers key_json + raw point bytes.
        let mut guarded = Vec::new();
        guarded.extend_from_slice(&body[key_start..key_start + key_len]);
        guarded.extend_from_slice(&body[points_start..cursor]);
        let stored_crc =
            u32::from_le_bytes(take(&body, &mut cursor, 4)?.try_into().unwrap_or_default());
        if crc32fast::hash(&guarded) != stored_crc {
            return Err(ChunkError::CrcMismatch {
                what: format!("series {index}"),
            });
        }

        total_points += points.len();
        series_out.push(Series { key, points });
    }

    if cursor != payload_end {
        return Err(ChunkError::DecodeInvalid {
            reason: "trailing bytes after last series".into(),
        });
    }

    Ok(Decoded {
        chunk: Chunk {
            meta,
            series: series_out,
        },
        reference: ChunkRef {
            sha256: chartly_canonical::sha256_hex(bytes),
            series: series_count as usize,
            points: total_points,
            bytes: bytes.len(),
        },
    })
}

fn take<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8], ChunkError> {
    let end = cursor.checked_add(len).ok_or_else(|| ChunkError::DecodeInvalid {
        reason: "length overflow".into(),
    })?;
    if end > bytes.len() {
        return Err(ChunkError::DecodeInvalid {
            reason: "truncated chunk".into(),
        });
    }
    let slice = &bytes[*cursor..end];
    *cursor = end;
    Ok(slice)
}
