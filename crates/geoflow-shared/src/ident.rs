//! # Deterministic Identity
//!
//! Job and task identifiers are derived by hashing canonical inputs, so
//! identical submissions map onto the same records no matter which worker
//! computes them. Canonical JSON sorts object keys recursively and uses
//! serde_json's number formatting, which is stable across platforms.

use std::fmt::Write as _;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Length of the job-id prefix embedded in task ids
const TASK_ID_JOB_PREFIX_LEN: usize = 16;

/// Render a JSON value canonically: object keys sorted recursively,
/// no insignificant whitespace.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json string rendering handles escaping
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Deterministic job identifier: SHA-256 over the job type and the
/// canonical form of the validated parameters, rendered as 64 hex chars.
#[must_use]
pub fn job_id(job_type: &str, parameters: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_type.as_bytes());
    hasher.update(canonical_json(parameters).as_bytes());
    let digest = hasher.finalize();

    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Deterministic task identifier:
/// `<first 16 hex of job_id>_s<stage>_<semantic_index>`.
///
/// The workflow is responsible for keeping `semantic_index` unique within
/// `(job_id, stage)`.
#[must_use]
pub fn task_id(job_id: &str, stage: i32, semantic_index: &str) -> String {
    let prefix = if job_id.len() >= TASK_ID_JOB_PREFIX_LEN {
        &job_id[..TASK_ID_JOB_PREFIX_LEN]
    } else {
        job_id
    };
    format!("{prefix}_s{stage}_{semantic_index}")
}
