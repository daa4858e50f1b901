// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic compaction of decoded chunks.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::{Chunk, ChunkError, ChunkMeta, Point, Series, series_key_string};

/// How duplicate timestamps are resolved.
///
/// Candidates at the same timestamp are ordered by
/// `(ts asc, value asc, canonical(meta) asc)`; the policy picks the first
/// or last of each duplicate group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupPolicy {
    /// Keep the first candidate in the deterministic order.
    KeepFirst,
    /// Keep the last candidate in the deterministic order.
    KeepLast,
}

/// What to do with points outside the merged window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangePolicy {
    /// Silently drop out-of-range points.
    Drop,
    /// Drop them and record a warning per series.
    Warn,
}

/// Advisory issues recorded during compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactWarning {
    /// Points fell outside `[meta.start, meta.end)`.
    OutOfRange {
        /// Canonical series key.
        key: String,
        /// Number of dropped points.
        dropped: usize,
    },
    /// A series was truncated to the per-series cap.
    Truncated {
        /// Canonical series key.
        key: String,
        /// Number of points cut.
        cut: usize,
    },
}

impl std::fmt::Display for CompactWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactWarning::OutOfRange { key, dropped } => {
                write!(f, "dropped {dropped} out-of-range points from {key}")
            }
            CompactWarning::Truncated { key, cut } => {
                write!(f, "truncated {cut} points from {key}")
            }
        }
    }
}

/// Knobs for compaction.
#[derive(Debug, Clone, Copy)]
pub struct CompactOptions {
    /// Duplicate-timestamp resolution policy.
    pub dup: DupPolicy,
    /// Per-series point cap in the output; `None` means unbounded.
    pub max_points_per_series: Option<usize>,
    /// Policy for points outside the merged window.
    pub out_of_range: RangePolicy,
}

impl Default for CompactOptions {
    fn default() -> Self {
        Self {
            dup: DupPolicy::KeepLast,
            max_points_per_series: None,
            out_of_range: RangePolicy::Warn,
        }
    }
}

/// Merge decoded chunks of one `(tenant, namespace)` into a single chunk.
///
/// The output window is the union of the input windows; series merge by
/// canonical key; duplicates at identical timestamps resolve per the
/// [`DupPolicy`]; per-series caps truncate deterministically from the tail.
///
/// # Errors
///
/// [`ChunkError::MetaMismatch`] when inputs span more than one tenant or
/// namespace, or [`ChunkError::DecodeInvalid`] for an empty input.
pub fn compact(
    chunks: &[Chunk],
    opts: CompactOptions,
) -> Result<(Chunk, Vec<CompactWarning>), ChunkError> {
    let Some(first) = chunks.first() else {
        return Err(ChunkError::DecodeInvalid {
            reason: "no chunks to compact".into(),
        });
    };
    for chunk in chunks {
        if chunk.meta.tenant != first.meta.tenant || chunk.meta.namespace != first.meta.namespace {
            return Err(ChunkError::MetaMismatch {
                detail: format!(
                    "cannot compact {}/{} with {}/{}",
                    first.meta.tenant, first.meta.namespace, chunk.meta.tenant, chunk.meta.namespace
                ),
            });
        }
    }

    let meta = ChunkMeta {
        tenant: first.meta.tenant.clone(),
        namespace: first.meta.namespace.clone(),
        start: chunks.iter().map(|c| c.meta.start).min().unwrap_or(first.meta.start),
        end: chunks.iter().map(|c| c.meta.end).max().unwrap_or(first.meta.end),
    };

    // Candidate points per series, tagged with their source chunk's
    // canonical meta bytes for the deterministic tiebreak.
    let mut candidates: BTreeMap<String, (crate::SeriesKey, Vec<(i64, f64, String)>)> =
        BTreeMap::new();
    for chunk in chunks {
        let meta_canonical = canonical_meta(&chunk.meta);
        for series in &chunk.series {
            let key_string = series_key_string(&series.key);
            let entry = candidates
                .entry(key_string)
                .or_insert_with(|| (series.key.clone(), Vec::new()));
            for point in &series.points {
                entry
                    .1
                    .push((point.ts_ns, point.value, meta_canonical.clone()));
            }
        }
    }

    let mut warnings = Vec::new();
    let mut series_out = Vec::with_capacity(candidates.len());
    for (key_string, (key, mut points)) in candidates {
        // (ts asc, value asc, canonical(meta) asc)
        points.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.total_cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        let mut merged: Vec<Point> = Vec::with_capacity(points.len());
        for (ts_ns, value, _) in points {
            match merged.last_mut() {
                Some(last) if last.ts_ns == ts_ns => {
                    if opts.dup == DupPolicy::KeepLast {
                        last.value = value;
                    }
                }
                _ => merged.push(Point { ts_ns, value }),
            }
        }

        let in_range_end = meta.end.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let in_range_start = meta.start.timestamp_nanos_opt().unwrap_or(i64::MIN);
        let before = merged.len();
        merged.retain(|p| p.ts_ns >= in_range_start && p.ts_ns < in_range_end);
        let dropped = before - merged.len();
        if dropped > 0 && opts.out_of_range == RangePolicy::Warn {
            warnings.push(CompactWarning::OutOfRange {
                key: key_string.clone(),
                dropped,
            });
        }

        if let Some(cap) = opts.max_points_per_series
            && merged.len() > cap
        {
            let cut = merged.len() - cap;
            merged.truncate(cap);
            warnings.push(CompactWarning::Truncated {
                key: key_string.clone(),
                cut,
            });
        }

        if !merged.is_empty() {
            series_out.push(Series {
                key,
                points: merged,
            });
        }
    }

    debug!(
        tenant = %meta.tenant,
        namespace = %meta.namespace,
        series = series_out.len(),
        "compacted chunks"
    );
    Ok((
        Chunk {
            meta,
            series: series_out,
        },
        warnings,
    ))
}

fn canonical_meta(meta: &ChunkMeta) -> String {
    let value = serde_json::to_value(meta).unwrap_or(Value::Null);
    let (bytes, _) = chartly_canonical::Canonicalizer::default().canonical_bytes(&value);
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn meta(start_hour: u32, end_hour: u32) -> ChunkMeta {
        ChunkMeta {
            tenant: "t".into(),
            namespace: "n".into(),
            start: Utc.with_ymd_and_hms(2024, 1, 1, start_hour, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 1, end_hour, 0, 0).unwrap(),
        }
    }

    fn ns(hour: u32) -> i64 {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0)
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap()
    }

    fn key() -> crate::SeriesKey {
        crate::SeriesKey::from([("s".to_string(), json!(1))])
    }

    fn chunk(meta: ChunkMeta, points: Vec<Point>) -> Chunk {
        Chunk {
            meta,
            series: vec![Series { key: key(), points }],
        }
    }

    #[test]
    fn merges_across_chunks_with_union_window() {
        let a = chunk(meta(0, 2), vec![Point { ts_ns: ns(0), value: 1.0 }]);
        let b = chunk(meta(2, 4), vec![Point { ts_ns: ns(2), value: 2.0 }]);
        let (out, warnings) = compact(&[a, b], CompactOptions::default()).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(out.meta.start, meta(0, 4).start);
        assert_eq!(out.meta.end, meta(0, 4).end);
        assert_eq!(out.series.len(), 1);
        assert_eq!(out.series[0].points.len(), 2);
    }

    #[test]
    fn duplicate_timestamps_keep_first_or_last() {
        let a = chunk(meta(0, 4), vec![Point { ts_ns: ns(1), value: 5.0 }]);
        let b = chunk(meta(0, 4), vec![Point { ts_ns: ns(1), value: 7.0 }]);

        let (first, _) = compact(
            &[a.clone(), b.clone()],
            CompactOptions {
                dup: DupPolicy::KeepFirst,
                ..Default::default()
            },
        )
        .unwrap();
        // Value ascending: 5.0 sorts first.
        assert_eq!(first.series[0].points, vec![Point { ts_ns: ns(1), value: 5.0 }]);

        let (last, _) = compact(&[a, b], CompactOptions::default()).unwrap();
        assert_eq!(last.series[0].points, vec![Point { ts_ns: ns(1), value: 7.0 }]);
    }

    #[test]
    fn duplicate_resolution_is_input_order_independent() {
        let a = chunk(meta(0, 4), vec![Point { ts_ns: ns(1), value: 5.0 }]);
        let b = chunk(meta(1, 4), vec![Point { ts_ns: ns(1), value: 7.0 }]);
        let (ab, _) = compact(&[a.clone(), b.clone()], CompactOptions::default()).unwrap();
        let (ba, _) = compact(&[b, a], CompactOptions::default()).unwrap();
        assert_eq!(ab.series, ba.series);
        assert_eq!(ab.meta, ba.meta);
    }

    #[test]
    fn out_of_range_points_drop_with_warning() {
        let c = chunk(
            meta(1, 2),
            vec![
                Point { ts_ns: ns(0), value: 1.0 }, // before start
                Point { ts_ns: ns(1), value: 2.0 },
                Point { ts_ns: ns(2), value: 3.0 }, // at end (exclusive)
            ],
        );
        let (out, warnings) = compact(&[c], CompactOptions::default()).unwrap();
        assert_eq!(out.series[0].points.len(), 1);
        assert_eq!(out.series[0].points[0].value, 2.0);
        assert!(matches!(warnings[0], CompactWarning::OutOfRange { dropped: 2, .. }));
    }

    #[test]
    fn drop_policy_suppresses_warnings() {
        let c = chunk(meta(1, 2), vec![Point { ts_ns: ns(0), value: 1.0 }]);
        let (out, warnings) = compact(
            &[c],
            CompactOptions {
                out_of_range: RangePolicy::Drop,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(out.series.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn per_series_cap_truncates_deterministically() {
        let c = chunk(
            meta(0, 4),
            (0..4).map(|h| Point { ts_ns: ns(h), value: f64::from(h) }).collect(),
        );
        let (out, warnings) = compact(
            &[c],
            CompactOptions {
                max_points_per_series: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
        let ts: Vec<i64> = out.series[0].points.iter().map(|p| p.ts_ns).collect();
        assert_eq!(ts, vec![ns(0), ns(1)]);
        assert!(matches!(warnings[0], CompactWarning::Truncated { cut: 2, .. }));
    }

    #[test]
    fn mixed_tenants_are_rejected() {
        let a = chunk(meta(0, 1), vec![]);
        let mut b = chunk(meta(0, 1), vec![]);
        b.meta.tenant = "other".into();
        let err = compact(&[a, b], CompactOptions::default()).unwrap_err();
        assert!(matches!(err, ChunkError::MetaMismatch { .. }));
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = compact(&[], CompactOptions::default()).unwrap_err();
        assert!(matches!(err, ChunkError::DecodeInvalid { .. }));
    }
}
