// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Chartly drone: an edge worker that pulls ingestion profiles from the
//! control plane, decides due-ness with deterministic per-profile jitter,
//! fetches source JSON through an SSRF-hardened client, runs the record
//! pipeline, and reports one run per attempted execution.
//!
//! A single drone is single-threaded; many drones run independently. Every
//! suspension point (HTTP call, backoff sleep, iteration pause) observes
//! the cooperative [`Shutdown`] token.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod executor;
mod schedule;
mod shutdown;
mod ssrf;
mod wire;

pub use client::{ClientOptions, ControlPlaneClient};
pub use config::{DroneConfig, parse_duration};
pub use executor::Drone;
pub use schedule::{deterministic_jitter, is_due, next_run};
pub use shutdown::{Shutdown, ShutdownHandle, shutdown_pair};
pub use ssrf::{check_url, expand_placeholders};
pub use wire::{
    HeartbeatRequest, ProfileEnvelope, RegisterRequest, RegisterResponse, ResultsRequest, Run,
    RunStatus, WorkResponse,
};

/// Default User-Agent sent on every outbound request.
pub const DEFAULT_USER_AGENT: &str = "Chartly-Drone/1.0";

/// Maximum bytes kept from a run error before reporting.
pub const MAX_RUN_ERROR_BYTES: usize = 2048;

/// Errors from drone configuration, transport, and execution.
#[derive(Debug, thiserror::Error)]
pub enum DroneError {
    /// A required environment variable is missing.
    #[error("missing required environment variable {name}")]
    MissingEnv {
        /// Variable name.
        name: &'static str,
    },

    /// An environment variable holds an unusable value.
    #[error("invalid value '{value}' for {name}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The server answered with a non-retryable, non-2xx status.
    #[error("http_error status={status} body={snippet}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Bounded snippet of the error body.
        snippet: String,
    },

    /// Transport failure (or 5xx) that survived retry exhaustion.
    #[error("transport: {detail}")]
    Transport {
        /// Last failure detail.
        detail: String,
    },

    /// A response body exceeded its byte cap.
    #[error("{what} exceeds {limit} bytes")]
    TooBig {
        /// What breached the cap.
        what: &'static str,
        /// Configured cap.
        limit: usize,
    },

    /// The target host is blocked by the SSRF policy.
    #[error("blocked host '{host}'")]
    BlockedHost {
        /// The rejected host.
        host: String,
    },

    /// A `${VAR}` placeholder in a source URL has no value; fail closed.
    #[error("unresolved placeholder '${{{name}}}' in source url")]
    MissingPlaceholder {
        /// Placeholder name.
        name: String,
    },

    /// The URL could not be parsed.
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Parser detail.
        reason: String,
    },

    /// The operation was cancelled by shutdown.
    #[error("cancelled")]
    Cancelled,

    /// JSON (de)serialization failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// One or more profiles failed during an iteration.
    #[error("iteration finished with {} error(s): {}", .details.len(), .details.join("; "))]
    Iteration {
        /// Per-profile failure summaries.
        details: Vec<String>,
    },
}

/// Truncate an error message to [`MAX_RUN_ERROR_BYTES`] on a char boundary.
#[must_use]
pub fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_RUN_ERROR_BYTES {
        return message.to_string();
    }
    let mut end = MAX_RUN_ERROR_BYTES;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
