use serde::{Deserialize, Serialize};

/// Configuration and derived state of the greeter.
///
/// `name` comes from configuration; `greeting` is derived and published.
/// Empty fields are left out of the JSON form, so the empty record
/// serializes as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub greeting: String,
}

/// Fields present in a config payload. Absent or `null` fields keep the
/// current value when merged.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ConfigPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub greeting: Option<String>,
}

impl ConfigRecord {
    pub fn is_enabled(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn reset(&mut self) {
        *self = ConfigRecord::default();
    }

    pub(crate) fn merge(&mut self, patch: ConfigPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(greeting) = patch.greeting {
            self.greeting = greeting;
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_json_round_trip() {
        let record = ConfigRecord {
            name: "Alice".to_string(),
            greeting: "👋 Hi Alice, SR Linux was last booted 5s ago".to_string(),
        };
        let json = record.to_json().unwrap();
        let parsed: ConfigRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_empty_record_serializes_to_empty_object() {
        assert_eq!(ConfigRecord::default().to_json().unwrap(), "{}");
        let parsed: ConfigRecord = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, ConfigRecord::default());
    }

    #[test]
    fn test_merge_keeps_absent_fields() {
        let mut record = ConfigRecord {
            name: "Alice".to_string(),
            greeting: "hello".to_string(),
        };
        record.merge(ConfigPatch {
            name: Some("Bob".to_string()),
            greeting: None,
        });
        assert_eq!(record.name, "Bob");
        assert_eq!(record.greeting, "hello");
    }

    #[test]
    fn test_reset() {
        let mut record = ConfigRecord {
            name: "Alice".to_string(),
            greeting: "hello".to_string(),
        };
        assert!(record.is_enabled());
        record.reset();
        assert_eq!(record, ConfigRecord::default());
        assert!(!record.is_enabled());
    }
}
