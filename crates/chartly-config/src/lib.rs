// SPDX-License-Identifier: MIT OR Apache-2.0
//! Layered configuration loading, merging, and canonical emission for
//! Chartly services.
//!
//! Documents are discovered in a fixed order (`<root>/<service>.*`, then
//! `<root>/env/<env>/<service>.*`, then `<root>/tenants/<tenant>/<service>.*`),
//! strictly decoded as JSON objects, deep-merged deterministically with
//! later layers winning, and finally overridden by environment variables.
//! The loader root is pinned after symlink resolution; any path that escapes
//! it fails with [`ConfigError::PathEscape`] before any I/O on the target.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

/// Valid env-var path segments after lowercasing.
static ENV_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").unwrap());

/// Extensions probed for each discovery location, in order.
const EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or emission.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A resolved path exits the pinned root.
    #[error("path escapes config root: {path}")]
    PathEscape {
        /// The offending path.
        path: String,
    },

    /// A service, environment, or tenant name is not a valid identifier.
    #[error("invalid identifier '{name}' for {what}")]
    InvalidIdentifier {
        /// What the identifier names (service, env, tenant).
        what: &'static str,
        /// The rejected value.
        name: String,
    },

    /// A document exceeds the per-file size cap.
    #[error("document too big: {path} ({size} > {limit} bytes)")]
    DocTooBig {
        /// Document path.
        path: String,
        /// Actual size in bytes.
        size: u64,
        /// Configured cap in bytes.
        limit: usize,
    },

    /// A document is not valid strict JSON.
    #[error("failed to parse {path}: {reason}")]
    Parse {
        /// Document path.
        path: String,
        /// Parser detail.
        reason: String,
    },

    /// A document decoded to something other than a JSON object.
    #[error("document is not a JSON object: {path}")]
    NotAnObject {
        /// Document path.
        path: String,
    },

    /// The canonical emission exceeds its byte cap.
    #[error("canonical config exceeds {limit} bytes")]
    CanonicalTooBig {
        /// Configured cap in bytes.
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

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory issues recorded while loading or merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The merge depth budget was breached; the overlay subtree replaced
    /// the merged subtree wholesale.
    MergeDepthExceeded {
        /// Dotted path of the replaced subtree.
        path: String,
    },
    /// The merge node budget was breached; remaining subtrees were replaced
    /// rather than merged.
    MergeNodesExceeded {
        /// Dotted path where the budget ran out.
        path: String,
    },
    /// An environment variable matched the prefix but was ignored.
    EnvVarIgnored {
        /// Variable name.
        name: String,
        /// Why it was ignored.
        reason: String,
    },
    /// More matching environment variables existed than the configured cap.
    EnvVarsTruncated {
        /// Configured cap.
        limit: usize,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MergeDepthExceeded { path } => {
                write!(f, "merge depth budget breached at '{path}'")
            }
            ConfigWarning::MergeNodesExceeded { path } => {
                write!(f, "merge node budget breached at '{path}'")
            }
            ConfigWarning::EnvVarIgnored { name, reason } => {
                write!(f, "ignored env var '{name}': {reason}")
            }
            ConfigWarning::EnvVarsTruncated { limit } => {
                write!(f, "env overrides truncated to {limit} variables")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Knobs for the layered loader.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Environment layer name (`env/<env>/...`), if any.
    pub env: Option<String>,
    /// Tenant layer name (`tenants/<tenant>/...`), if any.
    pub tenant: Option<String>,
    /// Env-var prefix. Defaults to `UPPER(service) + "_"`.
    pub env_prefix: Option<String>,
    /// Delimiter between path segments in env-var names.
    pub path_delimiter: String,
    /// Per-document size cap in bytes.
    pub max_doc_bytes: usize,
    /// Maximum number of env-var overrides applied.
    pub max_env_vars: usize,
    /// Merge depth budget.
    pub max_depth: usize,
    /// Merge node budget.
    pub max_nodes: usize,
    /// Byte cap for [`Bundle::canonical_json`].
    pub max_canonical_bytes: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            env: None,
            tenant: None,
            env_prefix: None,
            path_delimiter: "__".into(),
            max_doc_bytes: 1 << 20,
            max_env_vars: 128,
            max_depth: 32,
            max_nodes: 10_000,
            max_canonical_bytes: 1 << 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// One loaded document: its root-relative path and content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedDoc {
    /// Path relative to the pinned root.
    pub path: String,
    /// SHA-256 of the raw document bytes.
    pub sha256: String,
}

/// The merged configuration for one service.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Service name the bundle was loaded for.
    pub service: String,
    /// Documents that contributed, in merge order.
    pub docs: Vec<LoadedDoc>,
    /// The merged configuration tree.
    pub merged: Value,
    /// Advisory warnings from merging and env overrides.
    pub warnings: Vec<ConfigWarning>,

    canonical_limit: usize,
}

impl Bundle {
    /// Emit deterministic canonical bytes of the merged tree.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::CanonicalTooBig`] when the emission exceeds
    /// the configured cap.
    pub fn canonical_json(&self) -> Result<Vec<u8>, ConfigError> {
        let (bytes, _) = chartly_canonical::Canonicalizer::default().canonical_bytes(&self.merged);
        if bytes.len() > self.canonical_limit {
            return Err(ConfigError::CanonicalTooBig {
                limit: self.canonical_limit,
            });
        }
        Ok(bytes)
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Layered configuration loader with a symlink-safe pinned root.
#[derive(Debug)]
pub struct Loader {
    root: PathBuf,
    opts: LoaderOptions,
}

impl Loader {
    /// Pin `root` (resolving symlinks) and build a loader.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the root cannot be resolved, or
    /// [`ConfigError::InvalidIdentifier`] for bad env/tenant names.
    pub fn open(root: impl AsRef<Path>, opts: LoaderOptions) -> Result<Self, ConfigError> {
        if let Some(env) = &opts.env {
            check_identifier(env, "env")?;
        }
        if let Some(tenant) = &opts.tenant {
            check_identifier(tenant, "tenant")?;
        }
        let root = root.as_ref();
        let pinned = std::fs::canonicalize(root).map_err(|source| ConfigError::Io {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self { root: pinned, opts })
    }

    /// Load and merge every layer for `service`, applying overrides from
    /// the process environment.
    ///
    /// # Errors
    ///
    /// Propagates any discovery, parse, or path-containment failure.
    pub fn load(&self, service: &str) -> Result<Bundle, ConfigError> {
        let vars: Vec<(String, String)> = std::env::vars().collect();
        self.load_with_env(service, &vars)
    }

    /// Load and merge every layer for `service` with an explicit
    /// environment, for deterministic tests.
    ///
    /// # Errors
    ///
    /// Propagates any discovery, parse, or path-containment failure.
    pub fn load_with_env(
        &self,
        service: &str,
        vars: &[(String, String)],
    ) -> Result<Bundle, ConfigError> {
        check_identifier(service, "service")?;

        let mut layers: Vec<String> = vec![String::new()];
        if let Some(env) = &self.opts.env {
            layers.push(format!("env/{env}"));
        }
        if let Some(tenant) = &self.opts.tenant {
            layers.push(format!("tenants/{tenant}"));
        }

        let mut docs = Vec::new();
        let mut merged = Value::Object(serde_json::Map::new());
        let mut warnings = Vec::new();
        let mut budget = MergeBudget::new(self.opts.max_depth, self.opts.max_nodes);

        for layer in &layers {
            // Each layer contributes at most one document: the first
            // extension that exists wins.
            for ext in EXTENSIONS {
                let rel = if layer.is_empty() {
                    format!("{service}.{ext}")
                } else {
                    format!("{layer}/{service}.{ext}")
                };
                let Some(abs) = self.resolve(&rel)? else {
                    continue;
                };
                let (doc, sha256) = self.read_doc(&abs, &rel)?;
                debug!(path = %rel, sha256 = %sha256, "loaded config document");
                docs.push(LoadedDoc { path: rel, sha256 });
                merge_values(&mut merged, &doc, &mut budget, &mut warnings);
                break;
            }
        }

        let prefix = self
            .opts
            .env_prefix
            .clone()
            .unwrap_or_else(|| format!("{}_", service.to_uppercase()));
        apply_env_overrides(
            &mut merged,
            vars,
            &prefix,
            &self.opts.path_delimiter,
            self.opts.max_env_vars,
            &mut warnings,
        );

        Ok(Bundle {
            service: service.to_string(),
            docs,
            merged,
            warnings,
            canonical_limit: self.opts.max_canonical_bytes,
        })
    }

    /// Resolve a root-relative path, returning `None` when the file does
    /// not exist and erroring when the resolved path leaves the root.
    fn resolve(&self, rel: &str) -> Result<Option<PathBuf>, ConfigError> {
        let cleaned = clean_relative(rel).ok_or_else(|| ConfigError::PathEscape {
            path: rel.to_string(),
        })?;
        let candidate = self.root.join(cleaned);
        if !candidate.exists() {
            return Ok(None);
        }
        // Symlinks inside the tree may still point outside the pinned root.
        let resolved = std::fs::canonicalize(&candidate).map_err(|source| ConfigError::Io {
            path: candidate.display().to_string(),
            source,
        })?;
        if !resolved.starts_with(&self.root) {
            return Err(ConfigError::PathEscape {
                path: rel.to_string(),
            });
        }
        Ok(Some(resolved))
    }

    fn read_doc(&self, abs: &Path, rel: &str) -> Result<(Value, String), ConfigError> {
        let meta = std::fs::metadata(abs).map_err(|source| ConfigError::Io {
            path: rel.to_string(),
            source,
        })?;
        if meta.len() > self.opts.max_doc_bytes as u64 {
            return Err(ConfigError::DocTooBig {
                path: rel.to_string(),
                size: meta.len(),
                limit: self.opts.max_doc_bytes,
            });
        }
        let bytes = std::fs::read(abs).map_err(|source| ConfigError::Io {
            path: rel.to_string(),
            source,
        })?;
        let sha256 = {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            format!("{:x}", hasher.finalize())
        };
        let doc = parse_strict_json(&bytes).map_err(|reason| ConfigError::Parse {
            path: rel.to_string(),
            reason,
        })?;
        if !doc.is_object() {
            return Err(ConfigError::NotAnObject {
                path: rel.to_string(),
            });
        }
        Ok((doc, sha256))
    }
}

/// Strict JSON decode: one value, no trailing data.
///
/// `serde_json::from_slice` already rejects trailing characters, which is
/// exactly the strictness the document contract requires.
fn parse_strict_json(bytes: &[u8]) -> Result<Value, String> {
    serde_json::from_slice(bytes).map_err(|e| e.to_string())
}

/// Reject any relative path that leaves its root lexically (before I/O).
fn clean_relative(rel: &str) -> Option<PathBuf> {
    let path = Path::new(rel);
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            // `..`, absolute prefixes, and root components all escape.
            _ => return None,
        }
    }
    Some(cleaned)
}

fn check_identifier(name: &str, what: &'static str) -> Result<(), ConfigError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_'));
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier {
            what,
            name: name.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Budget shared across one merge pass.
#[derive(Debug)]
pub struct MergeBudget {
    max_depth: usize,
    nodes_left: usize,
}

impl MergeBudget {
    /// Create a budget with the given depth and node allowances.
    #[must_use]
    pub fn new(max_depth: usize, max_nodes: usize) -> Self {
        Self {
            max_depth,
            nodes_left: max_nodes,
        }
    }
}

/// Deterministic deep merge of `overlay` into `base`.
///
/// Keys are visited in sorted order per level; map+map recurses, everything
/// else (arrays included) replaces. Budget breaches replace the subtree with
/// the overlay value and record a warning.
pub fn merge_values(
    base: &mut Value,
    overlay: &Value,
    budget: &mut MergeBudget,
    warnings: &mut Vec<ConfigWarning>,
) {
    merge_at(base, overlay, 0, "$", budget, warnings);
}

fn merge_at(
    base: &mut Value,
    overlay: &Value,
    depth: usize,
    path: &str,
    budget: &mut MergeBudget,
    warnings: &mut Vec<ConfigWarning>,
) {
    if budget.nodes_left == 0 {
        *base = overlay.clone();
        warnings.push(ConfigWarning::MergeNodesExceeded { path: path.into() });
        return;
    }
    budget.nodes_left -= 1;

    if depth >= budget.max_depth {
        *base = overlay.clone();
        warnings.push(ConfigWarning::MergeDepthExceeded { path: path.into() });
        return;
    }

    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            // serde_json's Map is key-sorted, so iteration order is the
            // deterministic visit order.
            for (key, overlay_value) in overlay_map {
                let child = format!("{path}.{key}");
                match base_map.get_mut(key) {
                    Some(base_value) => {
                        merge_at(base_value, overlay_value, depth + 1, &child, budget, warnings);
                    }
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base_slot, _) => {
            // Arrays and scalars replace wholesale.
            *base_slot = overlay.clone();
        }
    }
}

/// Merge many layers left to right into a fresh tree.
///
/// Equivalent to folding [`merge_values`] over the layers; used by tests to
/// assert associativity.
#[must_use]
pub fn merge_many(layers: &[Value], max_depth: usize, max_nodes: usize) -> (Value, Vec<ConfigWarning>) {
    let mut merged = Value::Object(serde_json::Map::new());
    let mut warnings = Vec::new();
    let mut budget = MergeBudget::new(max_depth, max_nodes);
    for layer in layers {
        merge_values(&mut merged, layer, &mut budget, &mut warnings);
    }
    (merged, warnings)
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply env-var overrides onto `merged` (strongest precedence).
///
/// Variables must start with `prefix`; the remainder splits on `delimiter`
/// into path segments which are lowercased and validated. Values that parse
/// as JSON are inserted as JSON; everything else is a string.
pub fn apply_env_overrides(
    merged: &mut Value,
    vars: &[(String, String)],
    prefix: &str,
    delimiter: &str,
    max_vars: usize,
    warnings: &mut Vec<ConfigWarning>,
) {
    let mut matching: Vec<(&str, &str)> = vars
        .iter()
        .filter_map(|(name, value)| {
            name.strip_prefix(prefix)
                .filter(|rest| !rest.is_empty())
                .map(|rest| (rest, value.as_str()))
        })
        .collect();
    matching.sort();

    if matching.len() > max_vars {
        warnings.push(ConfigWarning::EnvVarsTruncated { limit: max_vars });
        matching.truncate(max_vars);
    }

    'vars: for (rest, raw) in matching {
        let mut segments = Vec::new();
        for segment in rest.split(delimiter) {
            let segment = segment.to_lowercase();
            if !ENV_SEGMENT.is_match(&segment) {
                warnings.push(ConfigWarning::EnvVarIgnored {
                    name: format!("{prefix}{rest}"),
                    reason: format!("segment '{segment}' is not a valid path segment"),
                });
                continue 'vars;
            }
            segments.push(segment);
        }

        let value = match parse_strict_json(raw.as_bytes()) {
            Ok(v) => v,
            Err(_) => Value::String(raw.to_string()),
        };
        set_path(merged, &segments, value);
    }
}

/// Insert `value` at the dotted `segments` path, creating intermediate
/// objects and overwriting non-object intermediates (last write wins).
fn set_path(tree: &mut Value, segments: &[String], value: Value) {
    if segments.is_empty() {
        return;
    }
    if !tree.is_object() {
        *tree = Value::Object(serde_json::Map::new());
    }
    let Some(map) = tree.as_object_mut() else {
        return;
    };
    if segments.len() == 1 {
        map.insert(segments[0].clone(), value);
        return;
    }
    let slot = map
        .entry(segments[0].clone())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    set_path(slot, &segments[1..], value);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn loader(root: &Path, opts: LoaderOptions) -> Loader {
        Loader::open(root, opts).unwrap()
    }

    // -- 1. Base document loads and hashes -----------------------------------

    #[test]
    fn base_document_loads_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "api.json", r#"{"db":{"host":"x","port":1}}"#);

        let bundle = loader(dir.path(), LoaderOptions::default())
            .load_with_env("api", &[])
            .unwrap();
        assert_eq!(bundle.docs.len(), 1);
        assert_eq!(bundle.docs[0].path, "api.json");
        assert_eq!(bundle.docs[0].sha256.len(), 64);
        assert_eq!(bundle.merged["db"]["host"], "x");
    }

    // -- 2. Layer precedence: env layer overrides base -----------------------

    #[test]
    fn env_layer_overrides_base() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "base.json", r#"{"log":{"level":"info"},"db":{"host":"x","port":1}}"#);
        write(dir.path(), "env/dev/base.json", r#"{"db":{"host":"y"}}"#);

        let bundle = loader(
            dir.path(),
            LoaderOptions {
                env: Some("dev".into()),
                ..Default::default()
            },
        )
        .load_with_env("base", &[])
        .unwrap();

        assert_eq!(bundle.merged["db"]["host"], "y");
        assert_eq!(bundle.merged["db"]["port"], 1);
        assert_eq!(bundle.merged["log"]["level"], "info");
    }

    // -- 3. Env vars are the strongest layer ----------------------------------

    #[test]
    fn env_vars_override_documents() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "base.json", r#"{"db":{"host":"x","port":1}}"#);
        write(dir.path(), "env/dev/base.json", r#"{"db":{"host":"y"}}"#);

        let vars = vec![("BASE_DB__PORT".to_string(), "5432".to_string())];
        let bundle = loader(
            dir.path(),
            LoaderOptions {
                env: Some("dev".into()),
                ..Default::default()
            },
        )
        .load_with_env("base", &vars)
        .unwrap();

        assert_eq!(bundle.merged["db"]["host"], "y");
        assert_eq!(bundle.merged["db"]["port"], 5432);
    }

    // -- 4. Env values parse as JSON when clean, else string ------------------

    #[test]
    fn env_values_parse_as_json_or_string() {
        let mut merged = serde_json::json!({});
        let mut warnings = Vec::new();
        let vars = vec![
            ("FOO_A".to_string(), "true".to_string()),
            ("FOO_B".to_string(), "plain text".to_string()),
            ("FOO_C".to_string(), r#"{"k":1}"#.to_string()),
        ];
        apply_env_overrides(&mut merged, &vars, "FOO_", "__", 16, &mut warnings);
        assert_eq!(merged["a"], true);
        assert_eq!(merged["b"], "plain text");
        assert_eq!(merged["c"]["k"], 1);
        assert!(warnings.is_empty());
    }

    // -- 5. Invalid env segments are ignored with a warning -------------------

    #[test]
    fn invalid_env_segments_are_ignored() {
        let mut merged = serde_json::json!({});
        let mut warnings = Vec::new();
        let vars = vec![("FOO_BAD!SEG".to_string(), "1".to_string())];
        apply_env_overrides(&mut merged, &vars, "FOO_", "__", 16, &mut warnings);
        assert_eq!(merged, serde_json::json!({}));
        assert!(matches!(warnings[0], ConfigWarning::EnvVarIgnored { .. }));
    }

    // -- 6. Env var cap truncates deterministically ---------------------------

    #[test]
    fn env_var_cap_truncates() {
        let mut merged = serde_json::json!({});
        let mut warnings = Vec::new();
        let vars = vec![
            ("FOO_C".to_string(), "3".to_string()),
            ("FOO_A".to_string(), "1".to_string()),
            ("FOO_B".to_string(), "2".to_string()),
        ];
        apply_env_overrides(&mut merged, &vars, "FOO_", "__", 2, &mut warnings);
        // Sorted by name, so A and B survive the cap.
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
        assert!(merged.get("c").is_none());
        assert!(matches!(warnings[0], ConfigWarning::EnvVarsTruncated { limit: 2 }));
    }

    // -- 7. Path escape fails lexically, before I/O ---------------------------

    #[test]
    fn dotdot_path_escape_fails_without_io() {
        let dir = tempfile::tempdir().unwrap();
        let l = loader(dir.path(), LoaderOptions::default());
        let err = l.resolve("../outside.json").unwrap_err();
        assert!(matches!(err, ConfigError::PathEscape { .. }));
    }

    // -- 8. Symlinked document outside the root is rejected -------------------

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        write(outside.path(), "evil.json", r#"{"a":1}"#);

        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("evil.json"), dir.path().join("api.json"))
            .unwrap();

        let err = loader(dir.path(), LoaderOptions::default())
            .load_with_env("api", &[])
            .unwrap_err();
        assert!(matches!(err, ConfigError::PathEscape { .. }));
    }

    // -- 9. YAML extension accepted only when contents are JSON ---------------

    #[test]
    fn yaml_extension_must_contain_json() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "api.yaml", r#"{"a": 1}"#);
        let bundle = loader(dir.path(), LoaderOptions::default())
            .load_with_env("api", &[])
            .unwrap();
        assert_eq!(bundle.merged["a"], 1);

        let dir2 = tempfile::tempdir().unwrap();
        write(dir2.path(), "api.yaml", "a: 1\n");
        let err = loader(dir2.path(), LoaderOptions::default())
            .load_with_env("api", &[])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    // -- 10. Trailing data is rejected ----------------------------------------

    #[test]
    fn trailing_data_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "api.json", r#"{"a":1} {"b":2}"#);
        let err = loader(dir.path(), LoaderOptions::default())
            .load_with_env("api", &[])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    // -- 11. Non-object documents are rejected --------------------------------

    #[test]
    fn non_object_documents_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "api.json", "[1,2,3]");
        let err = loader(dir.path(), LoaderOptions::default())
            .load_with_env("api", &[])
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotAnObject { .. }));
    }

    // -- 12. Oversize documents are rejected ----------------------------------

    #[test]
    fn oversize_documents_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let big = format!(r#"{{"a":"{}"}}"#, "x".repeat(256));
        write(dir.path(), "api.json", &big);
        let err = loader(
            dir.path(),
            LoaderOptions {
                max_doc_bytes: 64,
                ..Default::default()
            },
        )
        .load_with_env("api", &[])
        .unwrap_err();
        assert!(matches!(err, ConfigError::DocTooBig { .. }));
    }

    // -- 13. Merge is associative under canonical bytes -----------------------

    #[test]
    fn merge_is_associative() {
        let a = serde_json::json!({"x": {"p": 1}, "y": [1, 2]});
        let b = serde_json::json!({"x": {"q": 2}, "y": [3]});
        let c = serde_json::json!({"x": {"p": 9}, "z": true});

        // Merge(Merge(a, b), c)
        let (ab, _) = merge_many(&[a.clone(), b.clone()], 32, 10_000);
        let (ab_c, _) = merge_many(&[ab, c.clone()], 32, 10_000);
        // MergeMany([a, b, c])
        let (abc, _) = merge_many(&[a, b, c], 32, 10_000);

        let canon = chartly_canonical::Canonicalizer::default();
        assert_eq!(canon.canonical_bytes(&ab_c).0, canon.canonical_bytes(&abc).0);
    }

    // -- 14. Arrays replace rather than merge ---------------------------------

    #[test]
    fn arrays_replace() {
        let (merged, _) = merge_many(
            &[serde_json::json!({"a": [1, 2, 3]}), serde_json::json!({"a": [9]})],
            32,
            10_000,
        );
        assert_eq!(merged["a"], serde_json::json!([9]));
    }

    // -- 15. Depth budget replaces subtree with a warning ---------------------

    #[test]
    fn depth_budget_replaces_subtree() {
        let base = serde_json::json!({"a": {"b": {"c": {"d": 1}}}});
        let overlay = serde_json::json!({"a": {"b": {"c": {"e": 2}}}});
        let (merged, warnings) = merge_many(&[base, overlay], 2, 10_000);
        // The overlay subtree replaced the base wholesale below the budget.
        assert_eq!(merged["a"]["b"]["c"]["e"], 2);
        assert!(merged["a"]["b"]["c"].get("d").is_none());
        assert!(
            warnings
                .iter()
                .any(|w| matches!(w, ConfigWarning::MergeDepthExceeded { .. }))
        );
    }

    // -- 16. Node budget replaces with a warning ------------------------------

    #[test]
    fn node_budget_replaces_with_warning() {
        let mut layers = Vec::new();
        for i in 0..4 {
            let mut obj = serde_json::Map::new();
            obj.insert(format!("k{i}"), serde_json::json!({ "x": i }));
            layers.push(Value::Object(obj));
        }
        let (_, warnings) = merge_many(&layers, 32, 3);
        assert!(
            warnings
                .iter()
                .any(|w| matches!(w, ConfigWarning::MergeNodesExceeded { .. }))
        );
    }

    // -- 17. Canonical emission is bounded ------------------------------------

    #[test]
    fn canonical_emission_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "api.json", &format!(r#"{{"a":"{}"}}"#, "x".repeat(100)));
        let bundle = loader(
            dir.path(),
            LoaderOptions {
                max_canonical_bytes: 16,
                ..Default::default()
            },
        )
        .load_with_env("api", &[])
        .unwrap();
        let err = bundle.canonical_json().unwrap_err();
        assert!(matches!(err, ConfigError::CanonicalTooBig { limit: 16 }));
    }

    // -- 18. Canonical bytes are deterministic --------------------------------

    #[test]
    fn canonical_bytes_are_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "api.json", r#"{"z":1,"a":{"n":2,"m":3}}"#);
        let l = loader(dir.path(), LoaderOptions::default());
        let one = l.load_with_env("api", &[]).unwrap().canonical_json().unwrap();
        let two = l.load_with_env("api", &[]).unwrap().canonical_json().unwrap();
        assert_eq!(one, two);
        assert_eq!(String::from_utf8(one).unwrap(), r#"{"a":{"m":3,"n":2},"z":1}"#);
    }

    // -- 19. Tenant layer is strongest document layer -------------------------

    #[test]
    fn tenant_layer_overrides_env_layer() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "api.json", r#"{"flag":"base"}"#);
        write(dir.path(), "env/dev/api.json", r#"{"flag":"env"}"#);
        write(dir.path(), "tenants/acme/api.json", r#"{"flag":"tenant"}"#);

        let bundle = loader(
            dir.path(),
            LoaderOptions {
                env: Some("dev".into()),
                tenant: Some("acme".into()),
                ..Default::default()
            },
        )
        .load_with_env("api", &[])
        .unwrap();
        assert_eq!(bundle.merged["flag"], "tenant");
        assert_eq!(bundle.docs.len(), 3);
    }

    // -- 20. Invalid service names are rejected -------------------------------

    #[test]
    fn invalid_service_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let l = loader(dir.path(), LoaderOptions::default());
        for bad in ["", "UPPER", "has space", "dot.dot", "../escape"] {
            let err = l.load_with_env(bad, &[]).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidIdentifier { .. }), "{bad}");
        }
    }

    // -- 21. Missing documents produce an empty merged object -----------------

    #[test]
    fn missing_documents_yield_empty_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = loader(dir.path(), LoaderOptions::default())
            .load_with_env("api", &[])
            .unwrap();
        assert!(bundle.docs.is_empty());
        assert_eq!(bundle.merged, serde_json::json!({}));
    }

    // -- 22. Env override creates intermediate maps ---------------------------

    #[test]
    fn env_override_creates_intermediate_maps() {
        let mut merged = serde_json::json!({"db": "not-a-map"});
        let mut warnings = Vec::new();
        let vars = vec![("FOO_DB__POOL__SIZE".to_string(), "8".to_string())];
        apply_env_overrides(&mut merged, &vars, "FOO_", "__", 16, &mut warnings);
        assert_eq!(merged["db"]["pool"]["size"], 8);
    }
}
