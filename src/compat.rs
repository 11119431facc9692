//! Structural patch for architecture blobs written by newer serializers.
//!
//! The walk visits every node of the JSON tree. Input layers get their
//! `batch_shape` renamed to `batch_input_shape`, and the precision fields of
//! every layer config are normalized away so the strict schema accepts them.

use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, info};

use crate::artifact::ModelArtifact;
use crate::model_loader::LoadError;

const PRECISION_FIELDS: [&str; 2] = ["dtype", "dtype_policy"];

/// Rewrites one precision field. Returns whether anything changed.
///
/// A `DTypePolicy` object collapses to `"float32"`; any other value is
/// dropped. A collapsed string is dropped on the following pass.
pub fn normalize_precision_field(config: &mut Map<String, Value>, key: &str) -> bool {
    let is_policy = match config.get(key) {
        None => return false,
        Some(Value::Object(obj)) => obj.get("class_name").and_then(Value::as_str) == Some("DTypePolicy"),
        Some(_) => false,
    };
    if is_policy {
        config.insert(key.to_string(), Value::String("float32".to_string()));
    } else {
        config.remove(key);
    }
    true
}

fn normalize_precision(config: &mut Map<String, Value>) -> bool {
    PRECISION_FIELDS
        .iter()
        .fold(false, |changed, key| normalize_precision_field(config, key) | changed)
}

/// `batch_shape` -> `batch_input_shape`, unless the legacy key already exists.
fn rename_batch_shape(config: &mut Map<String, Value>) -> bool {
    if config.contains_key("batch_input_shape") {
        return false;
    }
    match config.remove("batch_shape") {
        Some(shape) => {
            config.insert("batch_input_shape".to_string(), shape);
            true
        }
        None => false,
    }
}

fn visit(node: &mut Value) -> bool {
    let mut changed = false;
    match node {
        Value::Object(obj) => {
            let is_input = obj.get("class_name").and_then(Value::as_str) == Some("InputLayer");
            if let Some(Value::Object(config)) = obj.get_mut("config") {
                if is_input {
                    changed |= rename_batch_shape(config);
                }
                changed |= normalize_precision(config);
            }
            for child in obj.values_mut() {
                changed |= visit(child);
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                changed |= visit(child);
            }
        }
        _ => {}
    }
    changed
}

/// Runs the walk until a pass changes nothing. Returns whether any pass did.
pub fn normalize_config(root: &mut Value) -> bool {
    let mut changed = false;
    let mut passes = 0;
    while visit(root) {
        changed = true;
        passes += 1;
    }
    if changed {
        debug!("config normalized after {} pass(es)", passes);
    }
    changed
}

/// Patched blob, or `None` when the walk had nothing to do.
pub fn patch_blob(blob: &str) -> Result<Option<String>, LoadError> {
    let mut root: Value = serde_json::from_str(blob)?;
    if !normalize_config(&mut root) {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(&root)?))
}

/// Patches the artifact's architecture blob on disk. Returns whether the
/// blob was rewritten.
pub fn patch_artifact_in_place(path: &Path) -> Result<bool, LoadError> {
    let mut artifact = ModelArtifact::open(path)?;
    let blob = artifact
        .config_blob()?
        .ok_or_else(|| LoadError::MissingConfig(path.to_path_buf()))?;

    match patch_blob(&blob)? {
        Some(patched) => {
            artifact.rewrite_config(&patched)?;
            info!("patched model config in {}", path.display());
            Ok(true)
        }
        None => Ok(false),
    }
}
