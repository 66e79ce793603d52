//! Loading rendered manifests from local files and directories.

use std::fs;
use std::path::{Path, PathBuf};

use kustodian_core::{Error, Resource, Result};
use serde::Deserialize;
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use tracing::debug;

fn max_file_bytes() -> usize {
    std::env::var("KUSTODIAN_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(10_000_000)
}

fn max_doc_nodes() -> usize {
    std::env::var("KUSTODIAN_MAX_MANIFEST_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Objects rendered from a set of inputs, plus one content digest per input file.
#[derive(Debug, Clone, Default)]
pub struct Manifests {
    pub objects: Vec<Resource>,
    pub digests: Vec<String>,
}

fn is_manifest_file(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml" | "json"))
}

fn collect_files(path: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let meta = fs::metadata(path).map_err(|e| Error::input(format!("{}: {}", path.display(), e)))?;
    if meta.is_file() {
        out.push(path.to_path_buf());
        return Ok(());
    }
    let mut entries: Vec<PathBuf> = fs::read_dir(path)
        .map_err(|e| Error::input(format!("{}: {}", path.display(), e)))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();
    for entry in entries {
        if entry.is_dir() {
            collect_files(&entry, out)?;
        } else if is_manifest_file(&entry) {
            out.push(entry);
        }
    }
    Ok(())
}

fn at(path: &Path, err: Error) -> Error {
    match err {
        Error::Input(msg) => Error::Input(format!("{}: {}", path.display(), msg)),
        other => other,
    }
}

/// `kind: List` and friends carry their objects under `items`.
fn flatten(doc: Json, out: &mut Vec<Json>) {
    let is_list = doc.get("kind").and_then(Json::as_str).map(|k| k.ends_with("List")).unwrap_or(false);
    match doc {
        Json::Object(mut map) if is_list && map.get("items").map(Json::is_array).unwrap_or(false) => {
            if let Some(Json::Array(items)) = map.remove("items") {
                for item in items {
                    flatten(item, out);
                }
            }
        }
        other => out.push(other),
    }
}

/// Parses a YAML (or JSON) stream into objects; empty documents are skipped.
pub fn parse_documents(text: &str) -> Result<Vec<Resource>> {
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(text) {
        let val = serde_yaml::Value::deserialize(de).map_err(|e| Error::input(format!("parsing YAML: {}", e)))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).map_err(|e| Error::input(format!("converting YAML to JSON: {}", e)))?;
        if json_node_budget_exceeded(&json, max_doc_nodes()) {
            return Err(Error::input(format!("document too complex (>{} nodes)", max_doc_nodes())));
        }
        flatten(json, &mut docs);
    }
    docs.into_iter().map(Resource::from_json).collect()
}

pub fn digest(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

/// Loads every manifest under `paths`. Directories are walked recursively in
/// path order; explicitly named files are read whatever their extension.
pub fn load(paths: &[PathBuf]) -> Result<Manifests> {
    if paths.is_empty() {
        return Err(Error::input("no manifest source given"));
    }
    let mut files = Vec::new();
    for p in paths {
        collect_files(p, &mut files)?;
    }
    let mut out = Manifests::default();
    for file in &files {
        let bytes = fs::read(file).map_err(|e| Error::input(format!("{}: {}", file.display(), e)))?;
        if bytes.len() > max_file_bytes() {
            return Err(Error::input(format!("{}: file too large (>{} bytes)", file.display(), max_file_bytes())));
        }
        let text = std::str::from_utf8(&bytes).map_err(|e| Error::input(format!("{}: {}", file.display(), e)))?;
        let objects = parse_documents(text).map_err(|e| at(file, e))?;
        debug!(file = %file.display(), objects = objects.len(), "manifest loaded");
        out.digests.push(digest(&bytes));
        out.objects.extend(objects);
    }
    if out.objects.is_empty() {
        let shown: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        return Err(Error::input(format!("no manifests found in {}", shown.join(", "))));
    }
    Ok(out)
}
