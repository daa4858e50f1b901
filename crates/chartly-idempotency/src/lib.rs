// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory idempotency lease store for Chartly ingestion endpoints.
//!
//! A caller that wants to execute a keyed operation exactly once calls
//! [`IdempotencyStore::try_begin`]; a fresh lease hands back an owner token
//! that gates [`touch`](IdempotencyStore::touch),
//! [`complete`](IdempotencyStore::complete), and
//! [`fail`](IdempotencyStore::fail). Completed and failed records stay
//! readable until their TTL elapses; expired records are swept lazily and
//! deterministically (no background tasks).
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Lease states a record moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// An owner currently holds the lease.
    InProgress,
    /// The operation finished and its result is cached.
    Complete,
    /// The operation failed terminally.
    Failed,
}

/// One idempotency record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// The idempotency key.
    pub key: String,
    /// Current lease state.
    pub state: LeaseState,
    /// Owner token, present only while `in_progress`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_token: Option<String>,
    /// Creation time of the current lease.
    pub created_at: DateTime<Utc>,
    /// Last state transition time.
    pub updated_at: DateTime<Utc>,
    /// Expiry; the record is unreadable past this instant.
    pub expires_at: DateTime<Utc>,
    /// SHA-256 of the cached result bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_hash: Option<String>,
    /// Cached result bytes (bounded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_bytes: Option<Vec<u8>>,
    /// Failure code for `failed` records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Failure message for `failed` records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

/// Outcome of [`IdempotencyStore::try_begin`].
#[derive(Debug, Clone)]
pub struct Begin {
    /// The record after the call.
    pub record: IdempotencyRecord,
    /// `true` when a new lease was created and the caller owns it.
    pub fresh: bool,
}

/// Errors from idempotency operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdempotencyError {
    /// Another owner holds an unexpired `in_progress` lease.
    #[error("conflict: key '{key}' is in progress under another owner")]
    Conflict {
        /// The contested key.
        key: String,
    },

    /// The caller's owner token does not match the lease.
    #[error("not owner of key '{key}'")]
    NotOwner {
        /// The key whose lease is held by someone else.
        key: String,
    },

    /// The key does not exist (or was swept).
    #[error("key '{key}' not found")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// The lease expired before the operation.
    #[error("key '{key}' expired")]
    Expired {
        /// The expired key.
        key: String,
    },

    /// The record is not `in_progress`.
    #[error("key '{key}' is not in progress")]
    NotInProgress {
        /// The key in a terminal state.
        key: String,
    },

    /// The result payload exceeds the configured byte cap.
    #[error("result for key '{key}' exceeds {limit} bytes")]
    TooLarge {
        /// The key being completed.
        key: String,
        /// Configured cap in bytes.
        limit: usize,
    },

    /// The store is at `max_entries` and pruning freed nothing.
    #[error("store is full ({limit} entries)")]
    StoreFull {
        /// Configured entry cap.
        limit: usize,
    },
}

/// Injectable time source so sweeps and TTLs are deterministic in tests.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Knobs for the store.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Cap on cached result bytes per record.
    pub max_result_bytes: usize,
    /// Hard cap on total records.
    pub max_entries: usize,
    /// Opportunistic prune cadence, counted in write operations.
    pub prune_every: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_result_bytes: 1 << 20,
            max_entries: 100_000,
            prune_every: 128,
        }
    }
}

struct Inner {
    records: BTreeMap<String, IdempotencyRecord>,
    writes: u64,
}

/// Mutex-guarded in-memory lease store.
///
/// # Examples
///
/// ```
/// use chartly_idempotency::{IdempotencyStore, LeaseState};
/// use chrono::Duration;
///
/// let store = IdempotencyStore::default();
/// let begin = store.try_begin("ingest:batch-1", Duration::seconds(60)).unwrap();
/// assert!(begin.fresh);
///
/// let owner = begin.record.owner_token.unwrap();
/// let done = store.complete("ingest:batch-1", &owner, b"{\"rows\":3}").unwrap();
/// assert_eq!(done.state, LeaseState::Complete);
/// ```
pub struct IdempotencyStore {
    inner: Mutex<Inner>,
    clock: Box<dyn Clock>,
    opts: StoreOptions,
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new(StoreOptions::default(), Box::new(SystemClock))
    }
}

impl IdempotencyStore {
    /// Create a store with explicit options and clock.
    #[must_use]
    pub fn new(opts: StoreOptions, clock: Box<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: BTreeMap::new(),
                writes: 0,
            }),
            clock,
            opts,
        }
    }

    /// Begin (or observe) the operation under `key`.
    ///
    /// - Missing or expired key: creates a fresh `in_progress` lease with a
    ///   random owner token; `fresh = true`.
    /// - Unexpired `complete`/`failed` key: returns the record,
    ///   `fresh = false`. Terminal records are never re-leased within their
    ///   TTL; callers that want a re-run must [`delete`](Self::delete) first.
    /// - Unexpired `in_progress` key: [`IdempotencyError::Conflict`].
    ///
    /// # Errors
    ///
    /// [`IdempotencyError::Conflict`] or [`IdempotencyError::StoreFull`].
    pub fn try_begin(&self, key: &str, ttl: Duration) -> Result<Begin, IdempotencyError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.count_write(&mut inner, now);

        match inner.records.get(key) {
            Some(existing) if existing.expires_at > now => match existing.state {
                LeaseState::InProgress => {
                    return Err(IdempotencyError::Conflict {
                        key: key.to_string(),
                    });
                }
                LeaseState::Complete | LeaseState::Failed => {
                    return Ok(Begin {
                        record: existing.clone(),
                        fresh: false,
                    });
                }
            },
            _ => {}
        }

        if !inner.records.contains_key(key) && inner.records.len() >= self.opts.max_entries {
            prune_expired(&mut inner, now);
            if inner.records.len() >= self.opts.max_entries {
                return Err(IdempotencyError::StoreFull {
                    limit: self.opts.max_entries,
                });
            }
        }

        let record = IdempotencyRecord {
            key: key.to_string(),
            state: LeaseState::InProgress,
            owner_token: Some(Uuid::new_v4().simple().to_string()),
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            result_hash: None,
            result_bytes: None,
            error_code: None,
            error_msg: None,
        };
        inner.records.insert(key.to_string(), record.clone());
        Ok(Begin {
            record,
            fresh: true,
        })
    }

    /// Extend an in-progress lease.
    ///
    /// # Errors
    ///
    /// Fails unless `owner` holds an unexpired `in_progress` lease.
    pub fn touch(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<IdempotencyRecord, IdempotencyError> {
        self.with_lease(key, owner, |record, now| {
            record.updated_at = now;
            record.expires_at = now + ttl;
            Ok(())
        })
    }

    /// Complete the operation, caching its result.
    ///
    /// The owner token is cleared and `expires_at` is preserved so the
    /// result stays readable for the remainder of the TTL window.
    ///
    /// # Errors
    ///
    /// Ownership/state failures, or [`IdempotencyError::TooLarge`] when the
    /// result exceeds the byte cap.
    pub fn complete(
        &self,
        key: &str,
        owner: &str,
        result: &[u8],
    ) -> Result<IdempotencyRecord, IdempotencyError> {
        if result.len() > self.opts.max_result_bytes {
            return Err(IdempotencyError::TooLarge {
                key: key.to_string(),
                limit: self.opts.max_result_bytes,
            });
        }
        self.with_lease(key, owner, |record, now| {
            record.state = LeaseState::Complete;
            record.updated_at = now;
            record.result_hash = Some(chartly_canonical::sha256_hex(result));
            record.result_bytes = Some(result.to_vec());
            record.owner_token = None;
            Ok(())
        })
    }

    /// Fail the operation terminally.
    ///
    /// # Errors
    ///
    /// Fails unless `owner` holds an unexpired `in_progress` lease.
    pub fn fail(
        &self,
        key: &str,
        owner: &str,
        code: &str,
        msg: &str,
    ) -> Result<IdempotencyRecord, IdempotencyError> {
        self.with_lease(key, owner, |record, now| {
            record.state = LeaseState::Failed;
            record.updated_at = now;
            record.error_code = Some(code.to_string());
            record.error_msg = Some(msg.to_string());
            record.owner_token = None;
            Ok(())
        })
    }

    /// Read a record; expired records read as not-found.
    ///
    /// # Errors
    ///
    /// [`IdempotencyError::NotFound`] for missing or expired keys.
    pub fn get(&self, key: &str) -> Result<IdempotencyRecord, IdempotencyError> {
        let now = self.clock.now();
        let inner = self.lock();
        match inner.records.get(key) {
            Some(record) if record.expires_at > now => Ok(record.clone()),
            _ => Err(IdempotencyError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    /// Remove a record regardless of state.
    pub fn delete(&self, key: &str) {
        let mut inner = self.lock();
        inner.records.remove(key);
    }

    /// Deterministically remove every expired record, returning the count.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.lock();
        prune_expired(&mut inner, now)
    }

    /// Number of live (unexpired) records.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let inner = self.lock();
        inner
            .records
            .values()
            .filter(|r| r.expires_at > now)
            .count()
    }

    /// Returns `true` when no live records exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_lease(
        &self,
        key: &str,
        owner: &str,
        apply: impl FnOnce(&mut IdempotencyRecord, DateTime<Utc>) -> Result<(), IdempotencyError>,
    ) -> Result<IdempotencyRecord, IdempotencyError> {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.count_write(&mut inner, now);

        let Some(record) = inner.records.get_mut(key) else {
            return Err(IdempotencyError::NotFound {
                key: key.to_string(),
            });
        };
        if record.expires_at <= now {
            return Err(IdempotencyError::Expired {
                key: key.to_string(),
            });
        }
        if record.state != LeaseState::InProgress {
            return Err(IdempotencyError::NotInProgress {
                key: key.to_string(),
            });
        }
        if record.owner_token.as_deref() != Some(owner) {
            return Err(IdempotencyError::NotOwner {
                key: key.to_string(),
            });
        }
        apply(record, now)?;
        Ok(record.clone())
    }

    fn count_write(&self, inner: &mut Inner, now: DateTime<Utc>) {
        inner.writes += 1;
        if self.opts.prune_every > 0 && inner.writes % self.opts.prune_every == 0 {
            prune_expired(inner, now);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned mutex only happens if a panic escaped while holding the
        // lock; the map itself stays structurally intact.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn prune_expired(inner: &mut Inner, now: DateTime<Utc>) -> usize {
    let before = inner.records.len();
    inner.records.retain(|_, record| record.expires_at > now);
    before - inner.records.len()
}
