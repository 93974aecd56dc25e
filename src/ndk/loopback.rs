//! In-memory NDK manager.
//!
//! Plays the role of the management daemon for the dev harness and the tests:
//! it hands out app ids and stream ids, keeps track of subscriptions, delivers
//! config commits to open config streams and stores published telemetry.
//! Commits made while no config stream is open are queued and replayed when
//! the next stream opens.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use super::{
    AgentRegistrationResponse, ConfigEvent, NdkError, NdkResult, Notification,
    NotificationRegisterRequest, NotificationRegisterResponse, NotificationService,
    NotificationStream, NotificationStreamResponse, RegisterOperation, SdkMgrService,
    SdkMgrStatus, SubscriptionType, TelemetryService, TelemetryUpdateResponse,
};

const DEFAULT_COMMIT_END_PATH: &str = ".commit.end";

/// A change to the telemetry store. `json_content` is `None` for deletions.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryChange {
    pub agent_name: String,
    pub path: String,
    pub json_content: Option<String>,
}

type StreamSender = mpsc::UnboundedSender<NdkResult<NotificationStreamResponse>>;

struct StreamSlot {
    owner: String,
    subscriptions: Vec<SubscriptionType>,
    sender: Option<StreamSender>,
}

struct Inner {
    commit_end_path: String,
    next_app_id: AtomicU32,
    next_stream_id: AtomicU64,
    next_sub_id: AtomicU64,
    agents: DashMap<String, u32>,
    streams: DashMap<u64, StreamSlot>,
    pending: Mutex<Vec<NotificationStreamResponse>>,
    telemetry: DashMap<String, String>,
    telemetry_tx: broadcast::Sender<TelemetryChange>,
    failing_registrations: AtomicU32,
}

#[derive(Clone)]
pub struct LoopbackNdk {
    inner: Arc<Inner>,
}

impl Default for LoopbackNdk {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNdk {
    pub fn new() -> Self {
        Self::with_commit_end_path(DEFAULT_COMMIT_END_PATH)
    }

    pub fn with_commit_end_path(path: impl Into<String>) -> Self {
        let (telemetry_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                commit_end_path: path.into(),
                next_app_id: AtomicU32::new(1),
                next_stream_id: AtomicU64::new(1),
                next_sub_id: AtomicU64::new(1),
                agents: DashMap::new(),
                streams: DashMap::new(),
                pending: Mutex::new(Vec::new()),
                telemetry: DashMap::new(),
                telemetry_tx,
                failing_registrations: AtomicU32::new(0),
            }),
        }
    }

    /// A client connection identified by `agent_name`.
    pub fn client(&self, agent_name: impl Into<String>) -> LoopbackClient {
        LoopbackClient {
            agent_name: agent_name.into(),
            inner: self.inner.clone(),
        }
    }

    /// Delivers `events` followed by the commit end marker as one stream response.
    pub async fn commit(&self, events: Vec<ConfigEvent>) -> usize {
        let mut notifications: Vec<Notification> =
            events.into_iter().map(Notification::Config).collect();
        notifications.push(Notification::Config(ConfigEvent::commit_end(
            self.inner.commit_end_path.clone(),
        )));
        self.deliver(NotificationStreamResponse { notifications })
            .await
    }

    /// Sends a raw response to every open config stream. Returns the number
    /// of streams it reached; with none open the response is queued.
    pub async fn deliver(&self, response: NotificationStreamResponse) -> usize {
        let mut pending = self.inner.pending.lock().await;
        let delivered = self.inner.send_to_config_streams(&response);
        if delivered == 0 {
            debug!("no open config stream, queueing notification");
            pending.push(response);
        }
        delivered
    }

    /// Ends every open stream as if the manager went away.
    pub fn close_streams(&self) {
        for mut slot in self.inner.streams.iter_mut() {
            slot.sender = None;
        }
    }

    /// The next `count` notification registrations are answered with a failure.
    pub fn fail_next_registrations(&self, count: u32) {
        self.inner
            .failing_registrations
            .store(count, Ordering::SeqCst);
    }

    pub fn app_id(&self, agent_name: &str) -> Option<u32> {
        self.inner.agents.get(agent_name).map(|id| *id)
    }

    pub fn is_registered(&self, agent_name: &str) -> bool {
        self.inner.agents.contains_key(agent_name)
    }

    pub fn state(&self, path: &str) -> Option<String> {
        self.inner.telemetry.get(path).map(|v| v.clone())
    }

    pub fn open_stream_count(&self) -> usize {
        self.inner
            .streams
            .iter()
            .filter(|slot| slot.sender.as_ref().is_some_and(|s| !s.is_closed()))
            .count()
    }

    pub fn watch_telemetry(&self) -> broadcast::Receiver<TelemetryChange> {
        self.inner.telemetry_tx.subscribe()
    }
}

impl Inner {
    fn send_to_config_streams(&self, response: &NotificationStreamResponse) -> usize {
        let mut delivered = 0;
        for mut slot in self.streams.iter_mut() {
            if !slot.subscriptions.contains(&SubscriptionType::Config) {
                continue;
            }
            let Some(sender) = slot.sender.as_ref() else {
                continue;
            };
            if sender.send(Ok(response.clone())).is_ok() {
                delivered += 1;
            } else {
                // 受信側が既にdropされている
                slot.sender = None;
            }
        }
        delivered
    }

    fn ensure_registered(&self, agent_name: &str, operation: &str) -> NdkResult<()> {
        if self.agents.contains_key(agent_name) {
            Ok(())
        } else {
            Err(NdkError::Status {
                operation: operation.to_string(),
                status: SdkMgrStatus::Failed,
                message: format!("agent {} is not registered", agent_name),
            })
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_registrations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct LoopbackClient {
    agent_name: String,
    inner: Arc<Inner>,
}

impl LoopbackClient {
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    fn failed_registration(&self, message: impl Into<String>) -> NotificationRegisterResponse {
        NotificationRegisterResponse {
            status: SdkMgrStatus::Failed,
            stream_id: 0,
            sub_id: 0,
            error_str: message.into(),
        }
    }
}

#[async_trait]
impl SdkMgrService for LoopbackClient {
    async fn agent_register(&self) -> NdkResult<AgentRegistrationResponse> {
        if let Some(app_id) = self.inner.agents.get(&self.agent_name) {
            return Ok(AgentRegistrationResponse {
                status: SdkMgrStatus::Failed,
                error_str: format!("agent {} already registered", self.agent_name),
                app_id: *app_id,
            });
        }
        let app_id = self.inner.next_app_id.fetch_add(1, Ordering::SeqCst);
        self.inner.agents.insert(self.agent_name.clone(), app_id);
        info!(agent = %self.agent_name, app_id, "loopback: agent registered");
        Ok(AgentRegistrationResponse {
            status: SdkMgrStatus::Success,
            error_str: String::new(),
            app_id,
        })
    }

    async fn agent_unregister(&self) -> NdkResult<AgentRegistrationResponse> {
        match self.inner.agents.remove(&self.agent_name) {
            Some((_, app_id)) => {
                let agent_name = &self.agent_name;
                self.inner.streams.retain(|_, slot| &slot.owner != agent_name);
                info!(agent = %self.agent_name, app_id, "loopback: agent unregistered");
                Ok(AgentRegistrationResponse {
                    status: SdkMgrStatus::Success,
                    error_str: String::new(),
                    app_id,
                })
            }
            None => Ok(AgentRegistrationResponse {
                status: SdkMgrStatus::Failed,
                error_str: format!("agent {} is not registered", self.agent_name),
                app_id: 0,
            }),
        }
    }

    async fn notification_register(
        &self,
        request: NotificationRegisterRequest,
    ) -> NdkResult<NotificationRegisterResponse> {
        if self.inner.take_injected_failure() {
            return Ok(self.failed_registration("injected failure"));
        }
        if !self.inner.agents.contains_key(&self.agent_name) {
            return Ok(self.failed_registration(format!(
                "agent {} is not registered",
                self.agent_name
            )));
        }

        match request.op {
            RegisterOperation::Create => {
                let stream_id = self.inner.next_stream_id.fetch_add(1, Ordering::SeqCst);
                self.inner.streams.insert(
                    stream_id,
                    StreamSlot {
                        owner: self.agent_name.clone(),
                        subscriptions: Vec::new(),
                        sender: None,
                    },
                );
                Ok(NotificationRegisterResponse {
                    status: SdkMgrStatus::Success,
                    stream_id,
                    sub_id: 0,
                    error_str: String::new(),
                })
            }
            RegisterOperation::Delete => match self.inner.streams.remove(&request.stream_id) {
                Some(_) => Ok(NotificationRegisterResponse {
                    status: SdkMgrStatus::Success,
                    stream_id: request.stream_id,
                    sub_id: 0,
                    error_str: String::new(),
                }),
                None => Ok(self.failed_registration(format!(
                    "unknown stream {}",
                    request.stream_id
                ))),
            },
            RegisterOperation::AddSubscription | RegisterOperation::DeleteSubscription => {
                let Some(subscription) = request.subscription else {
                    return Ok(self.failed_registration("missing subscription type"));
                };
                let Some(mut slot) = self.inner.streams.get_mut(&request.stream_id) else {
                    return Ok(self.failed_registration(format!(
                        "unknown stream {}",
                        request.stream_id
                    )));
                };
                if request.op == RegisterOperation::AddSubscription {
                    if !slot.subscriptions.contains(&subscription) {
                        slot.subscriptions.push(subscription);
                    }
                } else {
                    slot.subscriptions.retain(|s| *s != subscription);
                }
                Ok(NotificationRegisterResponse {
                    status: SdkMgrStatus::Success,
                    stream_id: request.stream_id,
                    sub_id: self.inner.next_sub_id.fetch_add(1, Ordering::SeqCst),
                    error_str: String::new(),
                })
            }
        }
    }
}

#[async_trait]
impl NotificationService for LoopbackClient {
    async fn notification_stream(&self, stream_id: u64) -> NdkResult<NotificationStream> {
        self.inner
            .ensure_registered(&self.agent_name, "NotificationStream")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut pending = self.inner.pending.lock().await;
        {
            let Some(mut slot) = self.inner.streams.get_mut(&stream_id) else {
                return Err(NdkError::Status {
                    operation: "NotificationStream".to_string(),
                    status: SdkMgrStatus::Failed,
                    message: format!("unknown stream {}", stream_id),
                });
            };
            if slot.subscriptions.contains(&SubscriptionType::Config) {
                for response in pending.drain(..) {
                    // rxはまだ手元にあるので失敗しない
                    let _ = tx.send(Ok(response));
                }
            }
            slot.sender = Some(tx);
        }

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[async_trait]
impl TelemetryService for LoopbackClient {
    async fn telemetry_add_or_update(
        &self,
        path: &str,
        json_content: &str,
    ) -> NdkResult<TelemetryUpdateResponse> {
        self.inner
            .ensure_registered(&self.agent_name, "TelemetryAddOrUpdate")?;

        if let Err(e) = serde_json::from_str::<serde_json::Value>(json_content) {
            return Ok(TelemetryUpdateResponse {
                status: SdkMgrStatus::Failed,
                error_str: format!("invalid json content: {}", e),
            });
        }

        self.inner
            .telemetry
            .insert(path.to_string(), json_content.to_string());
        let _ = self.inner.telemetry_tx.send(TelemetryChange {
            agent_name: self.agent_name.clone(),
            path: path.to_string(),
            json_content: Some(json_content.to_string()),
        });
        Ok(TelemetryUpdateResponse {
            status: SdkMgrStatus::Success,
            error_str: String::new(),
        })
    }

    async fn telemetry_delete(&self, path: &str) -> NdkResult<TelemetryUpdateResponse> {
        self.inner
            .ensure_registered(&self.agent_name, "TelemetryDelete")?;

        self.inner.telemetry.remove(path);
        let _ = self.inner.telemetry_tx.send(TelemetryChange {
            agent_name: self.agent_name.clone(),
            path: path.to_string(),
            json_content: None,
        });
        Ok(TelemetryUpdateResponse {
            status: SdkMgrStatus::Success,
            error_str: String::new(),
        })
    }
}
