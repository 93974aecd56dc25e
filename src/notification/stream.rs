//! Config subscription with retry.
//!
//! Establishing the subscription takes three calls: create a stream id, add
//! the config subscription to it and open the server stream. Any failure in
//! that sequence, and the stream ending or erroring later, starts the
//! sequence over after the retry interval.

use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::aggregator::{ConfigAggregator, Transaction};
use crate::ndk::{
    NdkResult, NotificationRegisterRequest, NotificationService, NotificationStream,
    SdkMgrService, SubscriptionType,
};
use crate::retry::RetryPolicy;
use crate::shutdown::Shutdown;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Gave up on the config stream after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

pub type StreamResult<T> = Result<T, StreamError>;

pub struct ConfigStream {
    agent_name: String,
    sdk_mgr: Arc<dyn SdkMgrService>,
    notification: Arc<dyn NotificationService>,
    retry: RetryPolicy,
}

enum Exit {
    Shutdown,
    ConsumerGone,
    StreamEnded(String),
}

impl ConfigStream {
    pub fn new(
        agent_name: impl Into<String>,
        sdk_mgr: Arc<dyn SdkMgrService>,
        notification: Arc<dyn NotificationService>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            sdk_mgr,
            notification,
            retry,
        }
    }

    /// Receives config notifications until shutdown, feeding `aggregator` and
    /// sending every completed transaction to `transactions`.
    ///
    /// Returns `Ok(())` on shutdown or when the receiving side is dropped, and
    /// [`StreamError::RetriesExhausted`] once a bounded policy runs out.
    #[tracing::instrument(skip_all, fields(agent = %self.agent_name))]
    pub async fn run(
        self,
        mut aggregator: ConfigAggregator,
        transactions: mpsc::Sender<Transaction>,
        mut shutdown: Shutdown,
    ) -> StreamResult<()> {
        let mut failures: u32 = 0;
        loop {
            let (stream_id, stream) = tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    info!("Shutdown received, exiting config notification handler");
                    return Ok(());
                }
                established = self.establish(&mut failures) => established?,
            };
            failures = 0;

            match self
                .receive(stream_id, stream, &mut aggregator, &transactions, &mut shutdown)
                .await
            {
                Exit::Shutdown => {
                    info!("Shutdown received, exiting config notification handler");
                    return Ok(());
                }
                Exit::ConsumerGone => {
                    debug!("transaction receiver dropped, stopping config stream");
                    return Ok(());
                }
                Exit::StreamEnded(reason) => {
                    let dropped = aggregator.discard();
                    if dropped > 0 {
                        warn!(dropped, "dropping partially received commit");
                    }
                    failures += 1;
                    if !self.retry.should_retry(failures) {
                        return Err(StreamError::RetriesExhausted {
                            attempts: failures,
                            last_error: reason,
                        });
                    }
                    warn!(
                        stream_id,
                        "agent {} lost config stream ({}), retrying in {:?}",
                        self.agent_name,
                        reason,
                        self.retry.interval()
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.wait() => return Ok(()),
                        _ = self.retry.wait() => {}
                    }
                }
            }
        }
    }

    /// Runs the subscription sequence until it succeeds or the policy gives up.
    async fn establish(&self, failures: &mut u32) -> StreamResult<(u64, NotificationStream)> {
        loop {
            match self.try_establish().await {
                Ok(established) => return Ok(established),
                Err(e) => {
                    *failures += 1;
                    if !self.retry.should_retry(*failures) {
                        return Err(StreamError::RetriesExhausted {
                            attempts: *failures,
                            last_error: e.to_string(),
                        });
                    }
                    warn!(
                        "agent {} could not subscribe to config notifications: {}. \
                         retrying in {:?}",
                        self.agent_name,
                        e,
                        self.retry.interval()
                    );
                    self.retry.wait().await;
                }
            }
        }
    }

    async fn try_establish(&self) -> NdkResult<(u64, NotificationStream)> {
        let created = self
            .sdk_mgr
            .notification_register(NotificationRegisterRequest::create())
            .await?;
        created
            .status
            .ensure_success("NotificationRegister", &created.error_str)?;
        let stream_id = created.stream_id;
        info!(stream_id, "Notification stream created");

        let request =
            NotificationRegisterRequest::add_subscription(stream_id, SubscriptionType::Config);
        let subscription_type = request.subscription_type_name();
        let added = self.sdk_mgr.notification_register(request).await?;
        added
            .status
            .ensure_success("NotificationRegister", &added.error_str)?;

        let stream = self.notification.notification_stream(stream_id).await?;
        info!(
            stream_id,
            subscription_type = %subscription_type,
            "Starting streaming notifications"
        );
        Ok((stream_id, stream))
    }

    async fn receive(
        &self,
        stream_id: u64,
        mut stream: NotificationStream,
        aggregator: &mut ConfigAggregator,
        transactions: &mpsc::Sender<Transaction>,
        shutdown: &mut Shutdown,
    ) -> Exit {
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.wait() => return Exit::Shutdown,
                item = stream.next() => item,
            };

            let response = match item {
                Some(Ok(response)) => response,
                Some(Err(e)) => {
                    return Exit::StreamEnded(format!("failed to receive notification: {}", e))
                }
                None => {
                    return Exit::StreamEnded(format!("received EOF for stream {}", stream_id))
                }
            };
            debug!(stream_id, "Received notifications: {:?}", response);

            for transaction in aggregator.push_response(response) {
                if transactions.send(transaction).await.is_err() {
                    return Exit::ConsumerGone;
                }
            }
        }
    }
}
