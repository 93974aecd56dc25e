//! # NDK Service Seam
//!
//! Client-side view of the three NDK manager services an agent talks to:
//!
//! - [`SdkMgrService`]: agent registration and notification subscriptions
//! - [`NotificationService`]: the server stream of notifications for a stream id
//! - [`TelemetryService`]: publishing agent state into the telemetry tree
//!
//! The RPC transport itself lives outside this crate. Each client is bound to
//! one agent name when it is built, so the traits only describe the request
//! and response payloads. [`loopback::LoopbackNdk`] is an in-memory manager
//! used by the dev harness and the tests.

pub mod loopback;

use async_trait::async_trait;
use futures::stream::BoxStream;
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NdkError {
    #[error("{operation} returned status {status}: {message}")]
    Status {
        operation: String,
        status: SdkMgrStatus,
        message: String,
    },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Notification stream {stream_id} closed")]
    StreamClosed { stream_id: u64 },
}

pub type NdkResult<T> = Result<T, NdkError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum SdkMgrStatus {
    #[strum(serialize = "kSdkMgrSuccess")]
    Success,
    #[strum(serialize = "kSdkMgrFailed")]
    Failed,
}

impl SdkMgrStatus {
    /// Turns a non-success status into an [`NdkError::Status`].
    pub fn ensure_success(self, operation: &str, message: &str) -> NdkResult<()> {
        match self {
            SdkMgrStatus::Success => Ok(()),
            status => Err(NdkError::Status {
                operation: operation.to_string(),
                status,
                message: message.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentRegistrationResponse {
    pub status: SdkMgrStatus,
    pub error_str: String,
    pub app_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RegisterOperation {
    Create,
    Delete,
    AddSubscription,
    DeleteSubscription,
}

/// Services a notification stream can be subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum SubscriptionType {
    #[strum(serialize = "config")]
    Config,
    #[strum(serialize = "app id")]
    AppId,
    #[strum(serialize = "route")]
    Route,
    #[strum(serialize = "bfd")]
    BfdSession,
    #[strum(serialize = "interface")]
    Interface,
    #[strum(serialize = "lldp")]
    LldpNeighbor,
    #[strum(serialize = "next-hop group")]
    NextHopGroup,
    #[strum(serialize = "network instance")]
    NetworkInstance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRegisterRequest {
    pub op: RegisterOperation,
    pub stream_id: u64,
    pub subscription: Option<SubscriptionType>,
}

impl NotificationRegisterRequest {
    /// Request for a new stream id.
    pub fn create() -> Self {
        Self {
            op: RegisterOperation::Create,
            stream_id: 0,
            subscription: None,
        }
    }

    /// Request adding a subscription to an existing stream.
    pub fn add_subscription(stream_id: u64, subscription: SubscriptionType) -> Self {
        Self {
            op: RegisterOperation::AddSubscription,
            stream_id,
            subscription: Some(subscription),
        }
    }

    /// Display name of the subscribed service, empty for stream creation.
    pub fn subscription_type_name(&self) -> String {
        self.subscription
            .map(|s| s.to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRegisterResponse {
    pub status: SdkMgrStatus,
    pub stream_id: u64,
    pub sub_id: u64,
    pub error_str: String,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConfigOperation {
    Create,
    Update,
    Delete,
}

/// One configuration change as delivered by the config subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEvent {
    pub path: String,
    pub operation: ConfigOperation,
    /// JSON document for the subtree at `path`.
    pub payload: String,
}

impl ConfigEvent {
    pub fn new(
        path: impl Into<String>,
        operation: ConfigOperation,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            operation,
            payload: payload.into(),
        }
    }

    /// The commit boundary marker for the given sentinel path.
    pub fn commit_end(path: impl Into<String>) -> Self {
        Self::new(path, ConfigOperation::Create, "{}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Config(ConfigEvent),
    /// Notifications of other services. The greeter never subscribes to
    /// them but a shared stream may still carry them.
    Other {
        subscription: SubscriptionType,
        sub_id: u64,
    },
}

impl Notification {
    pub fn config(&self) -> Option<&ConfigEvent> {
        match self {
            Notification::Config(event) => Some(event),
            Notification::Other { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NotificationStreamResponse {
    pub notifications: Vec<Notification>,
}

pub type NotificationStream = BoxStream<'static, NdkResult<NotificationStreamResponse>>;

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryUpdateResponse {
    pub status: SdkMgrStatus,
    pub error_str: String,
}

#[automock]
#[async_trait]
pub trait SdkMgrService: Send + Sync {
    async fn agent_register(&self) -> NdkResult<AgentRegistrationResponse>;

    async fn agent_unregister(&self) -> NdkResult<AgentRegistrationResponse>;

    async fn notification_register(
        &self,
        request: NotificationRegisterRequest,
    ) -> NdkResult<NotificationRegisterResponse>;
}

#[automock]
#[async_trait]
pub trait NotificationService: Send + Sync {
    /// Opens the server stream for a stream id obtained from
    /// [`SdkMgrService::notification_register`].
    async fn notification_stream(&self, stream_id: u64) -> NdkResult<NotificationStream>;
}

#[automock]
#[async_trait]
pub trait TelemetryService: Send + Sync {
    async fn telemetry_add_or_update(
        &self,
        path: &str,
        json_content: &str,
    ) -> NdkResult<TelemetryUpdateResponse>;

    async fn telemetry_delete(&self, path: &str) -> NdkResult<TelemetryUpdateResponse>;
}

/// The set of service clients an agent works with.
#[derive(Clone)]
pub struct NdkClients {
    pub sdk_mgr: Arc<dyn SdkMgrService>,
    pub notification: Arc<dyn NotificationService>,
    pub telemetry: Arc<dyn TelemetryService>,
}

impl NdkClients {
    /// Uses one value for all three services.
    pub fn from_shared<C>(client: Arc<C>) -> Self
    where
        C: SdkMgrService + NotificationService + TelemetryService + 'static,
    {
        Self {
            sdk_mgr: client.clone(),
            notification: client.clone(),
            telemetry: client,
        }
    }
}
