//! Telemetry query client seam.
//!
//! The agent reads operational state (the last boot time) with a `get` call
//! shaped like a gNMI GetRequest: a path plus an encoding selector, answered by
//! notifications carrying typed updates.

pub mod jsonrpc;
pub mod static_value;

use std::sync::Arc;

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::{QueryBackend, QueryConfig};

pub use jsonrpc::JsonRpcQueryClient;
pub use static_value::StaticQueryClient;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Query {path} failed with code {code}: {message}")]
    Rpc {
        path: String,
        code: i64,
        message: String,
    },
    #[error("Empty response for {path}")]
    EmptyResponse { path: String },
    #[error("Value at {path} is not a string: {value}")]
    NotAString { path: String, value: String },
}

pub type QueryResult<T> = Result<T, QueryError>;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Encoding {
    #[default]
    Json,
    JsonIetf,
    Proto,
    Ascii,
    Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetRequest {
    pub path: String,
    pub encoding: Encoding,
}

impl GetRequest {
    pub fn new(path: impl Into<String>, encoding: Encoding) -> Self {
        Self {
            path: path.into(),
            encoding,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    String(String),
    Int(i64),
    Uint(u64),
    Bool(bool),
    Json(serde_json::Value),
}

impl TypedValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for TypedValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => TypedValue::String(s),
            serde_json::Value::Bool(b) => TypedValue::Bool(b),
            serde_json::Value::Number(n) if n.is_u64() => {
                TypedValue::Uint(n.as_u64().unwrap_or_default())
            }
            serde_json::Value::Number(n) if n.is_i64() => {
                TypedValue::Int(n.as_i64().unwrap_or_default())
            }
            other => TypedValue::Json(other),
        }
    }
}

impl std::fmt::Display for TypedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypedValue::String(s) => write!(f, "{}", s),
            TypedValue::Int(i) => write!(f, "{}", i),
            TypedValue::Uint(u) => write!(f, "{}", u),
            TypedValue::Bool(b) => write!(f, "{}", b),
            TypedValue::Json(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub path: String,
    pub value: TypedValue,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryNotification {
    /// Nanoseconds since the epoch.
    pub timestamp: i64,
    pub updates: Vec<Update>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GetResponse {
    pub notifications: Vec<QueryNotification>,
}

impl GetResponse {
    /// A response holding a single update.
    pub fn single(timestamp: i64, path: impl Into<String>, value: TypedValue) -> Self {
        Self {
            notifications: vec![QueryNotification {
                timestamp,
                updates: vec![Update {
                    path: path.into(),
                    value,
                }],
            }],
        }
    }

    /// The string held by the first update of the first notification.
    pub fn first_string_value(&self, path: &str) -> QueryResult<&str> {
        let update = self
            .notifications
            .first()
            .and_then(|n| n.updates.first())
            .ok_or_else(|| QueryError::EmptyResponse {
                path: path.to_string(),
            })?;
        update.value.as_str().ok_or_else(|| QueryError::NotAString {
            path: path.to_string(),
            value: update.value.to_string(),
        })
    }
}

#[automock]
#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn get(&self, request: &GetRequest) -> QueryResult<GetResponse>;

    /// Releases the connection to the query endpoint.
    async fn close(&self) -> QueryResult<()>;
}

/// Builds the client for the configured backend.
pub fn connect(config: &QueryConfig) -> QueryResult<Arc<dyn QueryClient>> {
    let client: Arc<dyn QueryClient> = match config.backend {
        QueryBackend::JsonRpc => {
            info!(url = %config.url, "using JSON-RPC query backend");
            Arc::new(JsonRpcQueryClient::new(config)?)
        }
        QueryBackend::Static => {
            info!("using static query backend");
            Arc::new(StaticQueryClient::new(config.static_value.clone()))
        }
    };
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_string_value() {
        let response = GetResponse::single(
            0,
            "/system/information/last-booted",
            TypedValue::String("2024-01-01T00:00:00Z".to_string()),
        );
        assert_eq!(
            response
                .first_string_value("/system/information/last-booted")
                .unwrap(),
            "2024-01-01T00:00:00Z"
        );
    }

    #[test]
    fn test_first_string_value_empty() {
        let response = GetResponse::default();
        assert!(matches!(
            response.first_string_value("/x"),
            Err(QueryError::EmptyResponse { .. })
        ));

        let response = GetResponse {
            notifications: vec![QueryNotification::default()],
        };
        assert!(matches!(
            response.first_string_value("/x"),
            Err(QueryError::EmptyResponse { .. })
        ));
    }

    #[test]
    fn test_first_string_value_wrong_type() {
        let response = GetResponse::single(0, "/x", TypedValue::Uint(7));
        let err = response.first_string_value("/x").unwrap_err();
        assert_eq!(err.to_string(), "Value at /x is not a string: 7");
    }

    #[test]
    fn test_typed_value_from_json() {
        assert_eq!(TypedValue::from(json!("a")), TypedValue::String("a".into()));
        assert_eq!(TypedValue::from(json!(3)), TypedValue::Uint(3));
        assert_eq!(TypedValue::from(json!(-3)), TypedValue::Int(-3));
        assert_eq!(TypedValue::from(json!(true)), TypedValue::Bool(true));
        assert_eq!(
            TypedValue::from(json!({"a": 1})),
            TypedValue::Json(json!({"a": 1}))
        );
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!(Encoding::JsonIetf.to_string(), "json_ietf");
        let encoding: Encoding = serde_json::from_str(r#""proto""#).unwrap();
        assert_eq!(encoding, Encoding::Proto);
    }

    #[tokio::test]
    async fn test_connect_static_backend() {
        let config = QueryConfig {
            backend: QueryBackend::Static,
            static_value: Some("2024-01-01T00:00:00Z".to_string()),
            ..QueryConfig::default()
        };
        let client = connect(&config).unwrap();
        let response = client
            .get(&GetRequest::new("/system/information/last-booted", Encoding::Json))
            .await
            .unwrap();
        assert_eq!(
            response
                .first_string_value("/system/information/last-booted")
                .unwrap(),
            "2024-01-01T00:00:00Z"
        );
    }
}
