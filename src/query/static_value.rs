use async_trait::async_trait;
use tracing::debug;

use super::{GetRequest, GetResponse, QueryClient, QueryError, QueryResult, TypedValue};

/// Answers every `get` with the same string value. Used in labs without a
/// reachable management API and by the dev harness.
pub struct StaticQueryClient {
    value: Option<String>,
}

impl StaticQueryClient {
    pub fn new(value: Option<String>) -> Self {
        Self { value }
    }
}

#[async_trait]
impl QueryClient for StaticQueryClient {
    async fn get(&self, request: &GetRequest) -> QueryResult<GetResponse> {
        debug!(path = %request.path, "static query");
        match &self.value {
            Some(value) => Ok(GetResponse::single(
                0,
                request.path.clone(),
                TypedValue::String(value.clone()),
            )),
            None => Err(QueryError::EmptyResponse {
                path: request.path.clone(),
            }),
        }
    }

    async fn close(&self) -> QueryResult<()> {
        Ok(())
    }
}
