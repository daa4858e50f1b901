// SPDX-License-Identifier: MIT OR Apache-2.0
//! Schema store and constrained JSON-Schema subset validator for Chartly.
//!
//! The [`SchemaStore`] loads schema documents under a pinned root, resolves
//! local `$ref`s (in-document and relative-document forms only), and emits
//! [`CompiledSchema`]s whose `hash_sha256` always equals the SHA-256 of the
//! canonical compiled bytes.
//!
//! The [`Validator`] checks instances against the compiled subset: `type`
//! (with `integer` distinct from `number`), `const`/`enum`, string bounds
//! and `pattern`, numeric bounds with arbitrary-precision comparison, array
//! and object keywords, and `allOf`/`anyOf`/`oneOf`/`not` composition.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod store;
mod validator;

pub use store::{CompiledSchema, LoadedDoc, SchemaStore, StoreOptions};
pub use validator::{Report, Severity, Validator, ValidatorOptions, Violation};

/// Errors from schema loading, compilation, and resolution.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// A `$ref` uses a disallowed form (absolute path, URL, or `..`).
    #[error("ref not allowed: {reference}")]
    RefNotAllowed {
        /// The offending reference.
        reference: String,
    },

    /// Reference resolution exceeded the depth bound (includes cycles).
    #[error("ref resolution exceeded depth {limit}")]
    RefTooDeep {
        /// Configured depth bound.
        limit: usize,
    },

    /// Reference resolution exceeded the total ref-count bound.
    #[error("ref resolution exceeded {limit} total refs")]
    TooManyRefs {
        /// Configured ref-count bound.
        limit: usize,
    },

    /// A JSON pointer did not resolve inside its target document.
    #[error("pointer '{pointer}' not found in {path}")]
    PointerNotFound {
        /// The pointer that failed to resolve.
        pointer: String,
        /// Document the pointer was applied to.
        path: String,
    },

    /// A resolved path exits the pinned root.
    #[error("path escapes schema root: {path}")]
    PathEscape {
        /// The offending path.
        path: String,
    },

    /// A schema document was not found.
    #[error("schema document not found: {path}")]
    NotFound {
        /// The missing document path.
        path: String,
    },

    /// A schema document is not valid JSON.
    #[error("failed to parse {path}: {reason}")]
    Parse {
        /// Document path.
        path: String,
        /// Parser detail.
        reason: String,
    },

    /// A schema document exceeds the per-file size cap.
    #[error("schema document too big: {path} ({size} > {limit} bytes)")]
    DocTooBig {
        /// Document path.
        path: String,
        /// Actual size in bytes.
        size: u64,
        /// Configured cap in bytes.
        limit: usize,
    },

    /// The store root holds more schema files than the walk cap allows.
    #[error("schema root holds more than {limit} files")]
    TooManyFiles {
        /// Configured file-count cap.
        limit: usize,
    },

    /// Filesystem error while reading a document.
    #[error("failed to read {path}")]
    Io {
        /// Document path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}
