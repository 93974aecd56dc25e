//! Derives the greeting from the system uptime and publishes the
//! [`ConfigRecord`] as agent state.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::state::ConfigRecord;
use crate::config::DisabledStatePolicy;
use crate::ndk::{NdkError, TelemetryService};
use crate::query::{GetRequest, QueryClient, QueryError};
use crate::timestamp::{self, Clock};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to get uptime: {0}")]
    Query(#[from] QueryError),
    #[error("Invalid boot time {value:?}: {source}")]
    BootTime {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("Failed to marshal json data: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Could not update telemetry: {0}")]
    Telemetry(#[from] NdkError),
}

pub type PublishResult<T> = Result<T, PublishError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { json: String },
    /// No name configured; published state left untouched.
    Skipped,
    /// No name configured; published state deleted.
    Cleared,
}

/// The greeting shown for `name` after `uptime_secs` seconds.
pub fn greeting(name: &str, uptime_secs: u64) -> String {
    format!(
        "👋 Hi {}, SR Linux was last booted {} ago",
        name,
        timestamp::format_elapsed(uptime_secs)
    )
}

pub struct DerivedStatePublisher {
    query: Arc<dyn QueryClient>,
    telemetry: Arc<dyn TelemetryService>,
    clock: Arc<dyn Clock>,
    uptime_request: GetRequest,
    state_path: String,
    disabled_policy: DisabledStatePolicy,
}

impl DerivedStatePublisher {
    pub fn new(
        query: Arc<dyn QueryClient>,
        telemetry: Arc<dyn TelemetryService>,
        clock: Arc<dyn Clock>,
        uptime_request: GetRequest,
        state_path: impl Into<String>,
        disabled_policy: DisabledStatePolicy,
    ) -> Self {
        Self {
            query,
            telemetry,
            clock,
            uptime_request,
            state_path: state_path.into(),
            disabled_policy,
        }
    }

    pub fn state_path(&self) -> &str {
        &self.state_path
    }

    /// Runs one publish cycle. Any failure aborts the cycle; the next
    /// transaction starts over.
    #[tracing::instrument(skip(self, record), level = "debug")]
    pub async fn publish(&self, record: &mut ConfigRecord) -> PublishResult<PublishOutcome> {
        if !record.is_enabled() {
            return self.handle_disabled().await;
        }

        let uptime = self.uptime_secs().await?;
        record.greeting = greeting(&record.name, uptime);

        let json = record.to_json()?;
        info!(path = %self.state_path, "updating: {}", json);
        let response = self
            .telemetry
            .telemetry_add_or_update(&self.state_path, &json)
            .await?;
        info!(
            "Telemetry add/update status: {}, error_string: {:?}",
            response.status, response.error_str
        );
        response
            .status
            .ensure_success("TelemetryAddOrUpdate", &response.error_str)?;

        Ok(PublishOutcome::Published { json })
    }

    async fn handle_disabled(&self) -> PublishResult<PublishOutcome> {
        match self.disabled_policy {
            DisabledStatePolicy::Keep => {
                info!("No name configured, leaving published state as is");
                Ok(PublishOutcome::Skipped)
            }
            DisabledStatePolicy::Clear => {
                info!(path = %self.state_path, "No name configured, deleting state");
                let response = self.telemetry.telemetry_delete(&self.state_path).await?;
                response
                    .status
                    .ensure_success("TelemetryDelete", &response.error_str)?;
                Ok(PublishOutcome::Cleared)
            }
        }
    }

    async fn uptime_secs(&self) -> PublishResult<u64> {
        info!("Fetching SR Linux uptime value");
        let response = self.query.get(&self.uptime_request).await?;
        let value = response.first_string_value(&self.uptime_request.path)?;

        let booted = timestamp::parse_rfc3339(value).map_err(|source| PublishError::BootTime {
            value: value.to_string(),
            source,
        })?;
        let now = self.clock.now();
        if booted > now {
            warn!(%booted, %now, "boot time is in the future, reporting zero uptime");
        }
        Ok(timestamp::elapsed_secs(booted, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndk::{MockTelemetryService, SdkMgrStatus, TelemetryUpdateResponse};
    use crate::query::{Encoding, GetResponse, MockQueryClient, TypedValue};
    use crate::timestamp::FixedClock;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    const LAST_BOOTED: &str = "/system/information/last-booted";

    fn ok_response() -> TelemetryUpdateResponse {
        TelemetryUpdateResponse {
            status: SdkMgrStatus::Success,
            error_str: String::new(),
        }
    }

    fn query_returning(value: &'static str) -> MockQueryClient {
        let mut query = MockQueryClient::new();
        query.expect_get().returning(move |req| {
            Ok(GetResponse::single(
                0,
                req.path.clone(),
                TypedValue::String(value.to_string()),
            ))
        });
        query
    }

    fn publisher(
        query: MockQueryClient,
        telemetry: MockTelemetryService,
        policy: DisabledStatePolicy,
    ) -> DerivedStatePublisher {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 1, 2, 3).unwrap();
        DerivedStatePublisher::new(
            Arc::new(query),
            Arc::new(telemetry),
            Arc::new(FixedClock(now)),
            GetRequest::new(LAST_BOOTED, Encoding::Json),
            ".greeter",
            policy,
        )
    }

    #[test]
    fn test_greeting_format() {
        assert_eq!(
            greeting("Bob", 3723),
            "👋 Hi Bob, SR Linux was last booted 1h2m3s ago"
        );
    }

    #[tokio::test]
    async fn test_publish_greeting() {
        let mut telemetry = MockTelemetryService::new();
        telemetry
            .expect_telemetry_add_or_update()
            .withf(|path, json| {
                path.to_string() == ".greeter"
                    && json.to_string()
                        == r#"{"name":"Alice","greeting":"👋 Hi Alice, SR Linux was last booted 1h2m3s ago"}"#
            })
            .times(1)
            .returning(|_, _| Ok(ok_response()));

        let publisher = publisher(
            query_returning("2024-01-01T00:00:00Z"),
            telemetry,
            DisabledStatePolicy::Keep,
        );
        let mut record = ConfigRecord {
            name: "Alice".to_string(),
            greeting: String::new(),
        };

        let outcome = publisher.publish(&mut record).await.unwrap();

        assert!(matches!(outcome, PublishOutcome::Published { .. }));
        assert_eq!(
            record.greeting,
            "👋 Hi Alice, SR Linux was last booted 1h2m3s ago"
        );
    }

    #[tokio::test]
    async fn test_disabled_keep_publishes_nothing() {
        let mut query = MockQueryClient::new();
        query.expect_get().never();
        let mut telemetry = MockTelemetryService::new();
        telemetry.expect_telemetry_add_or_update().never();
        telemetry.expect_telemetry_delete().never();

        let publisher = publisher(query, telemetry, DisabledStatePolicy::Keep);
        let mut record = ConfigRecord::default();

        assert_eq!(
            publisher.publish(&mut record).await.unwrap(),
            PublishOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn test_disabled_clear_deletes_state() {
        let mut query = MockQueryClient::new();
        query.expect_get().never();
        let mut telemetry = MockTelemetryService::new();
        telemetry
            .expect_telemetry_delete()
            .withf(|path| path.to_string() == ".greeter")
            .times(1)
            .returning(|_| Ok(ok_response()));

        let publisher = publisher(query, telemetry, DisabledStatePolicy::Clear);
        let mut record = ConfigRecord::default();

        assert_eq!(
            publisher.publish(&mut record).await.unwrap(),
            PublishOutcome::Cleared
        );
    }

    #[tokio::test]
    async fn test_query_failure_aborts_cycle() {
        let mut query = MockQueryClient::new();
        query
            .expect_get()
            .returning(|_| Err(QueryError::Transport("connection refused".to_string())));
        let mut telemetry = MockTelemetryService::new();
        telemetry.expect_telemetry_add_or_update().never();

        let publisher = publisher(query, telemetry, DisabledStatePolicy::Keep);
        let mut record = ConfigRecord {
            name: "Alice".to_string(),
            greeting: "old".to_string(),
        };

        let err = publisher.publish(&mut record).await.unwrap_err();
        assert!(matches!(err, PublishError::Query(_)));
        assert_eq!(record.greeting, "old");
    }

    #[tokio::test]
    async fn test_invalid_boot_time() {
        let mut telemetry = MockTelemetryService::new();
        telemetry.expect_telemetry_add_or_update().never();

        let publisher = publisher(
            query_returning("last tuesday"),
            telemetry,
            DisabledStatePolicy::Keep,
        );
        let mut record = ConfigRecord {
            name: "Alice".to_string(),
            greeting: String::new(),
        };

        let err = publisher.publish(&mut record).await.unwrap_err();
        assert!(matches!(err, PublishError::BootTime { .. }));
    }

    #[tokio::test]
    async fn test_telemetry_failure_status() {
        let mut telemetry = MockTelemetryService::new();
        telemetry
            .expect_telemetry_add_or_update()
            .returning(|_, _| {
                Ok(TelemetryUpdateResponse {
                    status: SdkMgrStatus::Failed,
                    error_str: "no such path".to_string(),
                })
            });

        let publisher = publisher(
            query_returning("2024-01-01T00:00:00Z"),
            telemetry,
            DisabledStatePolicy::Keep,
        );
        let mut record = ConfigRecord {
            name: "Alice".to_string(),
            greeting: String::new(),
        };

        let err = publisher.publish(&mut record).await.unwrap_err();
        assert!(matches!(err, PublishError::Telemetry(NdkError::Status { .. })));
    }
}
