//! Applies a committed config transaction to the [`ConfigRecord`].

use thiserror::Error;
use tracing::{debug, error, info};

use super::state::{ConfigPatch, ConfigRecord};
use crate::ndk::{ConfigEvent, ConfigOperation};

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("Failed to decode config for {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type ApplyResult<T> = Result<T, ApplyError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Merged,
    Reset,
    /// The event belongs to another config path.
    Ignored,
}

/// Per-transaction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub merged: usize,
    pub reset: usize,
    pub ignored: usize,
    pub failed: usize,
}

impl ApplySummary {
    pub fn changed(&self) -> bool {
        self.merged + self.reset > 0
    }
}

pub struct ConfigApplier {
    config_path: String,
}

impl ConfigApplier {
    pub fn new(config_path: impl Into<String>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    pub fn config_path(&self) -> &str {
        &self.config_path
    }

    /// Applies every event of a transaction in order. A payload that fails
    /// to decode is logged and skipped; the remaining events still apply.
    pub fn apply(&self, record: &mut ConfigRecord, events: &[ConfigEvent]) -> ApplySummary {
        let mut summary = ApplySummary::default();
        for event in events {
            match self.apply_event(record, event) {
                Ok(ApplyOutcome::Merged) => summary.merged += 1,
                Ok(ApplyOutcome::Reset) => summary.reset += 1,
                Ok(ApplyOutcome::Ignored) => summary.ignored += 1,
                Err(e) => {
                    error!("{}", e);
                    summary.failed += 1;
                }
            }
        }
        debug!(?summary, "transaction applied");
        summary
    }

    pub fn apply_event(
        &self,
        record: &mut ConfigRecord,
        event: &ConfigEvent,
    ) -> ApplyResult<ApplyOutcome> {
        if event.path != self.config_path {
            debug!(path = %event.path, "ignoring config outside {}", self.config_path);
            return Ok(ApplyOutcome::Ignored);
        }

        if event.operation == ConfigOperation::Delete || is_empty_object(&event.payload) {
            info!(path = %event.path, "Handling deletion of the config tree");
            record.reset();
            return Ok(ApplyOutcome::Reset);
        }

        info!(
            path = %event.path,
            operation = %event.operation,
            "Handling create or update of the config tree"
        );
        let patch = decode_patch(&event.payload).map_err(|source| ApplyError::Decode {
            path: event.path.clone(),
            source,
        })?;
        record.merge(patch);
        Ok(ApplyOutcome::Merged)
    }
}

/// `{}` with any whitespace around or inside the braces.
fn is_empty_object(payload: &str) -> bool {
    payload
        .trim()
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .is_some_and(|inner| inner.trim().is_empty())
}

fn decode_patch(payload: &str) -> serde_json::Result<ConfigPatch> {
    // 配列など、オブジェクト以外はエラーにする
    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(payload)?;
    serde_json::from_value(serde_json::Value::Object(object))
}
