// SPDX-License-Identifier: MIT OR Apache-2.0

//! Schema document store: pinned-root loading and `$ref` compilation.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::SchemaError;

/// Knobs for the schema store.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Maximum number of files tolerated under the root.
    pub max_files: usize,
    /// Per-document size cap in bytes.
    pub max_file_bytes: usize,
    /// Maximum nested `$ref` resolution depth (cycles land here).
    pub max_ref_depth: usize,
    /// Maximum total `$ref`s resolved per compile.
    pub max_total_refs: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_files: 512,
            max_file_bytes: 1 << 20,
            max_ref_depth: 16,
            max_total_refs: 256,
        }
    }
}

/// One loaded schema document: root-relative path and content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedDoc {
    /// Path relative to the pinned root.
    pub path: String,
    /// SHA-256 of the raw document bytes.
    pub sha256: String,
}

/// The result of compiling a schema document: all refs inlined and the
/// canonical form hashed.
///
/// Invariant: `hash_sha256 == sha256(canonical_json)`.
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    /// Root document path the compile started from.
    pub root_path: String,
    /// Every document loaded during compilation, in first-load order.
    pub loaded_docs: Vec<LoadedDoc>,
    /// Canonical bytes of the compiled tree, as a string.
    pub canonical_json: String,
    /// SHA-256 of `canonical_json`.
    pub hash_sha256: String,
    /// The compiled tree with all refs inlined.
    pub json: Value,
}

/// Loads and compiles schema documents under a pinned root.
#[derive(Debug)]
pub struct SchemaStore {
    root: PathBuf,
    opts: StoreOptions,
}

impl SchemaStore {
    /// Pin `root` (resolving symlinks) and verify the walk caps.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Io`] if the root cannot be resolved, or
    /// [`SchemaError::TooManyFiles`] when the tree exceeds the file cap.
    pub fn open(root: impl AsRef<Path>, opts: StoreOptions) -> Result<Self, SchemaError> {
        let root = root.as_ref();
        let pinned = std::fs::canonicalize(root).map_err(|source| SchemaError::Io {
            path: root.display().to_string(),
            source,
        })?;
        let mut count = 0usize;
        walk_count(&pinned, &mut count, opts.max_files)?;
        Ok(Self { root: pinned, opts })
    }

    /// Compile the schema at root-relative `rel`, inlining every `$ref`.
    ///
    /// A `$ref` with sibling keys compiles to
    /// `{"allOf": [<target>, <siblings>]}`; a pure `$ref` object inlines the
    /// target directly.
    ///
    /// # Errors
    ///
    /// Propagates load failures and ref-resolution violations
    /// (`ref_not_allowed`, `ref_too_deep`, `too_many_refs`).
    pub fn compile(&self, rel: &str) -> Result<CompiledSchema, SchemaError> {
        let mut compiler = Compiler {
            store: self,
            docs: BTreeMap::new(),
            loaded: Vec::new(),
            refs_used: 0,
        };
        let root_doc = compiler.load_doc(rel)?;
        let json = compiler.resolve_node(&root_doc, rel, 0)?;

        let (bytes, _) = chartly_canonical::Canonicalizer::default().canonical_bytes(&json);
        let canonical_json = String::from_utf8_lossy(&bytes).into_owned();
        let hash_sha256 = chartly_canonical::sha256_hex(canonical_json.as_bytes());
        debug!(path = %rel, hash = %hash_sha256, docs = compiler.loaded.len(), "compiled schema");

        Ok(CompiledSchema {
            root_path: rel.to_string(),
            loaded_docs: compiler.loaded,
            canonical_json,
            hash_sha256,
            json,
        })
    }

    fn read_doc(&self, rel: &str) -> Result<(Value, String), SchemaError> {
        let cleaned = clean_relative(rel).ok_or_else(|| SchemaError::PathEscape {
            path: rel.to_string(),
        })?;
        let candidate = self.root.join(cleaned);
        if !candidate.exists() {
            return Err(SchemaError::NotFound {
                path: rel.to_string(),
            });
        }
        let resolved = std::fs::canonicalize(&candidate).map_err(|source| SchemaError::Io {
            path: rel.to_string(),
            source,
        })?;
        if !resolved.starts_with(&self.root) {
            return Err(SchemaError::PathEscape {
                path: rel.to_string(),
            });
        }
        let meta = std::fs::metadata(&resolved).map_err(|source| SchemaError::Io {
            path: rel.to_string(),
            source,
        })?;
        if meta.len() > self.opts.max_file_bytes as u64 {
            return Err(SchemaError::DocTooBig {
                path: rel.to_string(),
                size: meta.len(),
                limit: self.opts.max_file_bytes,
            });
        }
        let bytes = std::fs::read(&resolved).map_err(|source| SchemaError::Io {
            path: rel.to_string(),
            source,
        })?;
        let sha256 = {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            format!("{:x}", hasher.finalize())
        };
        let doc: Value = serde_json::from_slice(&bytes).map_err(|e| SchemaError::Parse {
            path: rel.to_string(),
            reason: e.to_string(),
        })?;
        Ok((doc, sha256))
    }
}

/// Count files under `dir`, failing as soon as the cap is crossed.
fn walk_count(dir: &Path, count: &mut usize, limit: usize) -> Result<(), SchemaError> {
    let entries = std::fs::read_dir(dir).map_err(|source| SchemaError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| SchemaError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            walk_count(&path, count, limit)?;
        } else {
            *count += 1;
            if *count > limit {
                return Err(SchemaError::TooManyFiles { limit });
            }
        }
    }
    Ok(())
}

/// Reject any relative path that leaves its root lexically.
fn clean_relative(rel: &str) -> Option<PathBuf> {
    let path = Path::new(rel);
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(cleaned)
}

struct Compiler<'a> {
    store: &'a SchemaStore,
    docs: BTreeMap<String, Value>,
    loaded: Vec<LoadedDoc>,
    refs_used: usize,
}

impl Compiler<'_> {
    fn load_doc(&mut self, rel: &str) -> Result<Value, SchemaError> {
        if let Some(doc) = self.docs.get(rel) {
            return Ok(doc.clone());
        }
        let (doc, sha256) = self.store.read_doc(rel)?;
        self.docs.insert(rel.to_string(), doc.clone());
        self.loaded.push(LoadedDoc {
            path: rel.to_string(),
            sha256,
        });
        Ok(doc)
    }

    fn resolve_node(
        &mut self,
        node: &Value,
        doc_rel: &str,
        depth: usize,
    ) -> Result<Value, SchemaError> {
        match node {
            Value::Object(map) => {
                if let Some(reference) = map.get("$ref") {
                    let Value::String(reference) = reference else {
                        return Err(SchemaError::RefNotAllowed {
                            reference: reference.to_string(),
                        });
                    };
                    return self.resolve_ref(reference, map, doc_rel, depth);
                }
                let mut out = Map::new();
                for (key, child) in map {
                    out.insert(key.clone(), self.resolve_node(child, doc_rel, depth)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.resolve_node(item, doc_rel, depth)?);
                }
                Ok(Value::Array(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_ref(
        &mut self,
        reference: &str,
        holder: &Map<String, Value>,
        doc_rel: &str,
        depth: usize,
    ) -> Result<Value, SchemaError> {
        if depth >= self.store.opts.max_ref_depth {
            return Err(SchemaError::RefTooDeep {
                limit: self.store.opts.max_ref_depth,
            });
        }
        self.refs_used += 1;
        if self.refs_used > self.store.opts.max_total_refs {
            return Err(SchemaError::TooManyRefs {
                limit: self.store.opts.max_total_refs,
            });
        }

        let (doc_part, pointer) = match reference.split_once('#') {
            Some((doc, ptr)) => (doc, ptr),
            None => (reference, ""),
        };

        if reference.contains("://") || doc_part.starts_with('/') || doc_part.contains("..") {
            return Err(SchemaError::RefNotAllowed {
                reference: reference.to_string(),
            });
        }

        let target_rel = if doc_part.is_empty() {
            doc_rel.to_string()
        } else {
            // Relative to the directory of the referencing document.
            match Path::new(doc_rel).parent() {
                Some(parent) if parent != Path::new("") => {
                    format!("{}/{doc_part}", parent.display())
                }
                _ => doc_part.to_string(),
            }
        };

        let target_doc = self.load_doc(&target_rel)?;
        let target_node =
            pointer_get(&target_doc, pointer).ok_or_else(|| SchemaError::PointerNotFound {
                pointer: pointer.to_string(),
                path: target_rel.clone(),
            })?;
        let resolved = self.resolve_node(&target_node, &target_rel, depth + 1)?;

        // Siblings wrap as allOf; a pure $ref inlines directly.
        let siblings: Map<String, Value> = holder
            .iter()
            .filter(|(k, _)| k.as_str() != "$ref")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if siblings.is_empty() {
            return Ok(resolved);
        }
        let mut sibling_obj = Map::new();
        for (key, child) in &siblings {
            sibling_obj.insert(key.clone(), self.resolve_node(child, doc_rel, depth)?);
        }
        let mut wrapper = Map::new();
        wrapper.insert(
            "allOf".to_string(),
            Value::Array(vec![resolved, Value::Object(sibling_obj)]),
        );
        Ok(Value::Object(wrapper))
    }
}

/// Navigate a JSON pointer (`/a/b/0`) within `doc`. An empty pointer
/// returns the document itself.
fn pointer_get(doc: &Value, pointer: &str) -> Option<Value> {
    if pointer.is_empty() {
        return Some(doc.clone());
    }
    let mut current = doc;
    for raw in pointer.split('/').skip(1) {
        let token = raw.replace("~1", "/").replace("~0", "~");
        current = match current {
            Value::Object(map) => map.get(&token)?,
            Value::Array(items) => items.get(token.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

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

    fn store(root: &Path) -> SchemaStore {
        SchemaStore::open(root, StoreOptions::default()).unwrap()
    }

    #[test]
    fn compile_hashes_canonical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json", r#"{"type":"object","required":["x"]}"#);
        let compiled = store(dir.path()).compile("a.json").unwrap();
        assert_eq!(
            compiled.hash_sha256,
            chartly_canonical::sha256_hex(compiled.canonical_json.as_bytes())
        );
        assert_eq!(compiled.loaded_docs.len(), 1);
        assert_eq!(compiled.root_path, "a.json");
    }

    #[test]
    fn in_document_ref_inlines() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.json",
            r##"{"properties":{"n":{"$ref":"#/defs/num"}},"defs":{"num":{"type":"number"}}}"##,
        );
        let compiled = store(dir.path()).compile("a.json").unwrap();
        assert_eq!(
            compiled.json["properties"]["n"],
            serde_json::json!({"type":"number"})
        );
    }

    #[test]
    fn ref_with_siblings_wraps_in_all_of() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.json",
            r##"{"root":{"$ref":"#/defs/a","title":"t"},"defs":{"a":{"type":"string"}}}"##,
        );
        let compiled = store(dir.path()).compile("a.json").unwrap();
        assert_eq!(
            compiled.json["root"],
            serde_json::json!({"allOf":[{"type":"string"},{"title":"t"}]})
        );
    }

    #[test]
    fn relative_document_ref_resolves_and_tracks_docs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "common.json", r#"{"defs":{"id":{"type":"string","minLength":1}}}"#);
        write(dir.path(), "a.json", r##"{"properties":{"id":{"$ref":"common.json#/defs/id"}}}"##);
        let compiled = store(dir.path()).compile("a.json").unwrap();
        assert_eq!(compiled.json["properties"]["id"]["minLength"], 1);
        let paths: Vec<&str> = compiled.loaded_docs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["a.json", "common.json"]);
    }

    #[test]
    fn sibling_directory_refs_resolve_relative_to_document() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "sub/common.json", r#"{"defs":{"x":{"type":"integer"}}}"#);
        write(dir.path(), "sub/a.json", r##"{"$ref":"common.json#/defs/x"}"##);
        let compiled = store(dir.path()).compile("sub/a.json").unwrap();
        assert_eq!(compiled.json, serde_json::json!({"type":"integer"}));
    }

    #[test]
    fn disallowed_ref_forms_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for reference in [
            "https://example.com/a.json#/x",
            "http://example.com/a.json",
            "file:///etc/passwd#/x",
            "/abs/path.json#/x",
            "../escape.json#/x",
        ] {
            write(
                dir.path(),
                "a.json",
                &format!(r#"{{"$ref":"{reference}"}}"#),
            );
            let err = store(dir.path()).compile("a.json").unwrap_err();
            assert!(
                matches!(err, SchemaError::RefNotAllowed { .. }),
                "{reference}: {err}"
            );
        }
    }

    #[test]
    fn ref_cycle_fails_ref_too_deep() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.json",
            r##"{"defs":{"a":{"$ref":"#/defs/b"},"b":{"$ref":"#/defs/a"}},"root":{"$ref":"#/defs/a"}}"##,
        );
        let err = store(dir.path()).compile("a.json").unwrap_err();
        assert!(matches!(err, SchemaError::RefTooDeep { .. }), "{err}");
    }

    #[test]
    fn missing_pointer_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json", r##"{"$ref":"#/defs/nope"}"##);
        let err = store(dir.path()).compile("a.json").unwrap_err();
        assert!(matches!(err, SchemaError::PointerNotFound { .. }));
    }

    #[test]
    fn file_count_cap_is_enforced_on_open() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            write(dir.path(), &format!("s{i}.json"), "{}");
        }
        let err = SchemaStore::open(
            dir.path(),
            StoreOptions {
                max_files: 2,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::TooManyFiles { limit: 2 }));
    }

    #[test]
    fn oversize_document_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.json", &format!(r#"{{"pad":"{}"}}"#, "x".repeat(256)));
        let s = SchemaStore::open(
            dir.path(),
            StoreOptions {
                max_file_bytes: 64,
                ..Default::default()
            },
        )
        .unwrap();
        let err = s.compile("a.json").unwrap_err();
        assert!(matches!(err, SchemaError::DocTooBig { .. }));
    }

    #[test]
    fn pointer_escapes_are_unescaped() {
        let doc = serde_json::json!({"a/b": {"~c": 1}});
        assert_eq!(pointer_get(&doc, "/a~1b/~0c"), Some(serde_json::json!(1)));
    }
}
