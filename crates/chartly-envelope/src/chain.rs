// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ordered hash-chain verification over envelope sequences.

use std::fmt;

use crate::Envelope;

/// Errors from hash-chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// An envelope's stored hash does not match the recomputed hash.
    HashMismatch {
        /// Index of the envelope with the mismatched hash.
        index: usize,
    },
    /// An envelope's `prev_hash` does not link to its predecessor.
    BrokenLink {
        /// Index of the envelope with the broken link.
        index: usize,
    },
    /// The chain is empty when a non-empty chain was expected.
    EmptyChain,
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HashMismatch { index } => {
                write!(f, "hash mismatch at chain index {index}")
            }
            Self::BrokenLink { index } => {
                write!(f, "broken link at chain index {index}")
            }
            Self::EmptyChain => write!(f, "chain is empty"),
        }
    }
}

impl std::error::Error for ChainError {}

/// Verify an ordered sequence of envelopes as a tamper-evident chain.
///
/// Each entry's stored hash must match its recomputed metadata hash, and
/// each entry's `prev_hash` must equal the predecessor's stored hash. The
/// first entry may carry any `prev_hash` (it links to state outside the
/// slice).
///
/// # Errors
///
/// - [`ChainError::EmptyChain`] if `items` is empty.
/// - [`ChainError::HashMismatch`] at the first envelope whose stored hash
///   fails verification.
/// - [`ChainError::BrokenLink`] at the first envelope whose `prev_hash`
///   does not match its predecessor.
///
/// # Examples
///
/// ```
/// use chartly_envelope::{verify_chain, Envelope, SourceEnvelope};
///
/// let mut first = SourceEnvelope::new("acme", "api", "https://a.example.com");
/// let h1 = first.compute_hash(None).unwrap();
/// let mut second = first.clone();
/// second.status = "paused".into();
/// second.compute_hash(Some(&h1)).unwrap();
///
/// assert!(verify_chain(&[first, second]).is_ok());
/// ```
pub fn verify_chain<E: Envelope>(items: &[E]) -> Result<(), ChainError> {
    if items.is_empty() {
        return Err(ChainError::EmptyChain);
    }
    for (i, item) in items.iter().enumerate() {
        if !item.verify_hash() {
            return Err(ChainError::HashMismatch { index: i });
        }
        if i > 0 && item.prev_hash() != items[i - 1].stored_hash() {
            return Err(ChainError::BrokenLink { index: i });
        }
    }
    Ok(())
}
