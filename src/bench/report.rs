use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bench::tools::{Presence, ToolMetrics};
use crate::bench::BenchError;

pub const REPORT_VERSION: &str = "v0.9.1";

const REQUIRED_TOP: [&str; 5] = ["version", "preset", "generated_at_utc", "tools", "pairs"];
const REQUIRED_PAIR: [&str; 7] = ["id", "kind", "base", "target", "base_bytes", "target_bytes", "metrics"];

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Report {
    pub version: String,
    pub preset: String,
    pub generated_at_utc: String,
    pub tools: Vec<String>,
    pub env: Env,
    pub pairs: Vec<PairReport>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Env {
    pub os: String,
    pub arch: String,
    pub cpus: usize,
    pub tool_presence: BTreeMap<String, Presence>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PairReport {
    pub id: String,
    pub kind: String,
    pub base: String,
    pub target: String,
    pub base_bytes: u64,
    pub target_bytes: u64,
    pub metrics: BTreeMap<String, ToolMetrics>,
}

impl Report {
    pub fn to_json(&self) -> Result<Value, BenchError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Validates then writes the report as pretty JSON.
    ///
    /// The file is only replaced once the whole report has been written.
    pub fn write(&self, path: &Path) -> Result<(), BenchError> {
        let json = self.to_json()?;
        validate(&json)?;

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, &json)?;
        tmp.write_all(b"\n")?;
        tmp.persist(path).map_err(|e| BenchError::IO(e.error))?;
        Ok(())
    }
}

/// Checks the minimal required-field schema of a report.
pub fn validate(report: &Value) -> Result<(), BenchError> {
    let schema = |msg: String| Err(BenchError::Schema(msg));

    let Some(top) = report.as_object() else {
        return schema("not_an_object".to_string());
    };
    for key in REQUIRED_TOP {
        if !top.contains_key(key) {
            return schema(format!("missing_top_level:{}", key));
        }
    }

    let tools: Vec<&str> = match top["tools"].as_array() {
        Some(tools) if !tools.is_empty() => tools.iter().filter_map(Value::as_str).collect(),
        _ => return schema("bad_tools".to_string()),
    };
    if tools.len() != top["tools"].as_array().map_or(0, Vec::len) {
        return schema("bad_tools".to_string());
    }

    let Some(pairs) = top["pairs"].as_array() else {
        return schema("bad_pairs".to_string());
    };
    for pair in pairs {
        let id = pair.get("id").and_then(Value::as_str).unwrap_or("?");
        for key in REQUIRED_PAIR {
            if pair.get(key).is_none() {
                return schema(format!("missing_pair_field:{}:{}", id, key));
            }
        }

        let Some(metrics) = pair["metrics"].as_object() else {
            return schema(format!("bad_metrics:{}", id));
        };
        for tool in tools.iter() {
            let Some(entry) = metrics.get(*tool) else {
                return schema(format!("missing_tool_metrics:{}:{}", id, tool));
            };
            if !entry.is_object() {
                return schema(format!("bad_tool_metrics:{}:{}", id, tool));
            }
            if entry.get("status").is_none() {
                return schema(format!("missing_status:{}:{}", id, tool));
            }
        }
    }

    Ok(())
}
