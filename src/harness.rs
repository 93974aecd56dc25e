//! Input format of the `greeter` dev binary.
//!
//! Each stdin line is one commit: a single change object or an array of them.
//!
//! ```text
//! {"path": ".greeter", "data": {"name": "Bob"}}
//! [{"data": {"name": "Bob"}}, {"path": ".other", "operation": "delete", "data": {}}]
//! ```
//!
//! `data` is required and unknown keys are rejected, so a bare config object
//! such as `{"name": "Bob"}` is an error rather than a change. `path` defaults
//! to the agent's config path. Without an explicit `operation`, an empty `data`
//! object is a delete and anything else an update.

use serde::Deserialize;
use serde_json::Value;

use crate::ndk::{ConfigEvent, ConfigOperation};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Change {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    operation: Option<ConfigOperation>,
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Line {
    Many(Vec<Change>),
    One(Change),
}

/// Parses one input line into the events of a commit. Blank lines yield no
/// events.
pub fn parse_commit_line(line: &str, default_path: &str) -> serde_json::Result<Vec<ConfigEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }

    let changes = match serde_json::from_str::<Line>(line)? {
        Line::Many(changes) => changes,
        Line::One(change) => vec![change],
    };

    Ok(changes
        .into_iter()
        .map(|change| {
            let deletes = change.data.as_object().is_some_and(|o| o.is_empty());
            let operation = change.operation.unwrap_or(if deletes {
                ConfigOperation::Delete
            } else {
                ConfigOperation::Update
            });
            ConfigEvent::new(
                change.path.unwrap_or_else(|| default_path.to_string()),
                operation,
                change.data.to_string(),
            )
        })
        .collect())
}
