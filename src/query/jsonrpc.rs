//! Query backend speaking the SR Linux JSON-RPC management API.
//!
//! A `get` is sent as a single command against the `state` datastore; the
//! first result value becomes the single update of the response.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Encoding, GetRequest, GetResponse, QueryClient, QueryError, QueryResult, TypedValue};
use crate::config::QueryConfig;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: JsonRpcParams<'a>,
}

#[derive(Debug, Serialize)]
struct JsonRpcParams<'a> {
    commands: Vec<JsonRpcCommand<'a>>,
}

#[derive(Debug, Serialize)]
struct JsonRpcCommand<'a> {
    path: &'a str,
    datastore: &'static str,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

pub struct JsonRpcQueryClient {
    client: Client,
    url: String,
    username: String,
    password: SecretString,
    next_id: AtomicU64,
}

impl JsonRpcQueryClient {
    pub fn new(config: &QueryConfig) -> QueryResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| QueryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: config.url.clone(),
            username: config.username.clone(),
            password: SecretString::from(config.password.clone()),
            next_id: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl QueryClient for JsonRpcQueryClient {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn get(&self, request: &GetRequest) -> QueryResult<GetResponse> {
        if !matches!(request.encoding, Encoding::Json | Encoding::JsonIetf) {
            debug!(
                "JSON-RPC always answers in JSON, ignoring encoding {}",
                request.encoding
            );
        }

        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            method: "get",
            params: JsonRpcParams {
                commands: vec![JsonRpcCommand {
                    path: &request.path,
                    datastore: "state",
                }],
            },
        };

        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .json(&body)
            .send()
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| QueryError::Transport(e.to_string()))?
            .json::<JsonRpcResponse>()
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;

        if let Some(error) = response.error {
            return Err(QueryError::Rpc {
                path: request.path.clone(),
                code: error.code,
                message: error.message,
            });
        }

        let value = response
            .result
            .and_then(|values| values.into_iter().next())
            .ok_or_else(|| QueryError::EmptyResponse {
                path: request.path.clone(),
            })?;

        let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Ok(GetResponse::single(
            timestamp,
            request.path.clone(),
            TypedValue::from(value),
        ))
    }

    async fn close(&self) -> QueryResult<()> {
        info!(url = %self.url, "closing JSON-RPC query client");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;
    use std::time::Duration;

    const LAST_BOOTED: &str = "/system/information/last-booted";

    fn config_for(url: String) -> QueryConfig {
        QueryConfig {
            url,
            timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_string_value() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/jsonrpc")
            .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
            .match_body(Matcher::PartialJson(json!({
                "method": "get",
                "params": { "commands": [{ "path": LAST_BOOTED, "datastore": "state" }] }
            })))
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":0,"result":["2024-01-01T00:00:00.000Z"]}"#)
            .create_async()
            .await;

        let client = JsonRpcQueryClient::new(&config_for(format!("{}/jsonrpc", server.url())))
            .unwrap();
        let response = client
            .get(&GetRequest::new(LAST_BOOTED, Encoding::Json))
            .await
            .unwrap();

        assert_eq!(
            response.first_string_value(LAST_BOOTED).unwrap(),
            "2024-01-01T00:00:00.000Z"
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_rpc_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/jsonrpc")
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":0,"error":{"code":-1,"message":"Path not valid"}}"#)
            .create_async()
            .await;

        let client = JsonRpcQueryClient::new(&config_for(format!("{}/jsonrpc", server.url())))
            .unwrap();
        let err = client
            .get(&GetRequest::new("/bogus", Encoding::Json))
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::Rpc { code: -1, .. }));
    }

    #[tokio::test]
    async fn test_get_empty_result() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/jsonrpc")
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":0,"result":[]}"#)
            .create_async()
            .await;

        let client = JsonRpcQueryClient::new(&config_for(format!("{}/jsonrpc", server.url())))
            .unwrap();
        let err = client
            .get(&GetRequest::new(LAST_BOOTED, Encoding::Proto))
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::EmptyResponse { .. }));
    }

    #[tokio::test]
    async fn test_get_http_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/jsonrpc")
            .with_status(401)
            .create_async()
            .await;

        let client = JsonRpcQueryClient::new(&config_for(format!("{}/jsonrpc", server.url())))
            .unwrap();
        let err = client
            .get(&GetRequest::new(LAST_BOOTED, Encoding::Json))
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::Transport(_)));
    }
}
