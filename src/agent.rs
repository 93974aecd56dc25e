//! # Agent Lifecycle
//!
//! ```text
//! register ──▶ run ─┬─▶ transaction ─▶ apply ─▶ publish ─┐
//!                   │◀───────────────────────────────────┘
//!                   └─▶ shutdown ─▶ stop (unregister, close clients)
//! ```
//!
//! Registration is the only fatal step: without an app id the agent cannot
//! do anything. Once running, the config stream is owned by a background
//! task (see [`crate::notification`]) and every completed transaction is
//! processed by [`Agent::handle_transaction`] on the main loop, one at a time.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::greeter::{ConfigApplier, ConfigRecord, DerivedStatePublisher, PublishOutcome};
use crate::ndk::NdkClients;
use crate::notification::{ConfigAggregator, ConfigStream, Transaction};
use crate::query::{GetRequest, QueryClient};
use crate::retry::RetryPolicy;
use crate::shutdown::Shutdown;
use crate::timestamp::Clock;
use crate::InternalResult;

pub struct Agent {
    name: String,
    app_id: u32,
    config: AgentConfig,
    clients: NdkClients,
    query: Arc<dyn QueryClient>,
    record: ConfigRecord,
    applier: ConfigApplier,
    publisher: DerivedStatePublisher,
}

impl Agent {
    /// Registers with the NDK manager.
    #[tracing::instrument(skip_all, fields(agent = %config.app_name))]
    pub async fn register(
        config: AgentConfig,
        clients: NdkClients,
        query: Arc<dyn QueryClient>,
        clock: Arc<dyn Clock>,
    ) -> InternalResult<Self> {
        let response = clients.sdk_mgr.agent_register().await?;
        response
            .status
            .ensure_success("AgentRegister", &response.error_str)?;

        info!(
            app_id = response.app_id,
            name = %config.app_name,
            "Application registered successfully!"
        );

        let applier = ConfigApplier::new(config.config_path.clone());
        let publisher = DerivedStatePublisher::new(
            query.clone(),
            clients.telemetry.clone(),
            clock,
            GetRequest::new(config.query.uptime_path.clone(), config.query.encoding),
            config.state_path.clone(),
            config.disabled_state,
        );

        Ok(Self {
            name: config.app_name.clone(),
            app_id: response.app_id,
            config,
            clients,
            query,
            record: ConfigRecord::default(),
            applier,
            publisher,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn app_id(&self) -> u32 {
        self.app_id
    }

    pub fn record(&self) -> &ConfigRecord {
        &self.record
    }

    /// Processes config transactions until `shutdown` fires or the config
    /// stream gives up, then unregisters.
    #[tracing::instrument(skip_all, fields(agent = %self.name, app_id = self.app_id))]
    pub async fn run(&mut self, mut shutdown: Shutdown) -> InternalResult<()> {
        let (tx, mut rx) = mpsc::channel::<Transaction>(self.config.channel_capacity);
        let stream = ConfigStream::new(
            self.name.clone(),
            self.clients.sdk_mgr.clone(),
            self.clients.notification.clone(),
            RetryPolicy::from(&self.config.retry),
        );
        let mut stream_task = tokio::spawn(stream.run(
            ConfigAggregator::new(self.config.commit_end_path.clone()),
            tx,
            shutdown.clone(),
        ));

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    info!("Got a signal to exit");
                    break;
                }
                received = rx.recv() => match received {
                    Some(transaction) => {
                        self.handle_transaction(transaction).await;
                    }
                    None => {
                        warn!("config stream closed");
                        break;
                    }
                },
            }
        }

        // 受信側を閉じてストリームタスクの送信を止める
        drop(rx);
        match timeout(self.config.shutdown_timeout, &mut stream_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!("config stream failed: {}", e),
            Ok(Err(e)) => error!("config stream task panicked: {}", e),
            Err(_) => {
                warn!("config stream task did not stop in time, aborting it");
                stream_task.abort();
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Applies one committed transaction and republishes the derived state.
    pub async fn handle_transaction(
        &mut self,
        transaction: Transaction,
    ) -> Option<PublishOutcome> {
        info!(
            sequence = transaction.sequence,
            events = transaction.len(),
            "Received full config"
        );
        self.applier.apply(&mut self.record, &transaction.events);

        match self.publisher.publish(&mut self.record).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!("state update failed: {}", e);
                None
            }
        }
    }

    /// Unregisters and closes the clients. Each step is attempted even when
    /// an earlier one fails.
    #[tracing::instrument(skip_all, fields(agent = %self.name))]
    pub async fn stop(&self) {
        info!("unregistering {} agent, bye!", self.name);

        match timeout(
            self.config.shutdown_timeout,
            self.clients.sdk_mgr.agent_unregister(),
        )
        .await
        {
            Ok(Ok(response)) => match response
                .status
                .ensure_success("AgentUnRegister", &response.error_str)
            {
                Ok(()) => info!("{} unregistered successfully!", self.name),
                Err(e) => error!("Agent unregistration failed: {}", e),
            },
            Ok(Err(e)) => error!("Agent unregistration failed: {}", e),
            Err(_) => error!(
                "Agent unregistration timed out after {:?}",
                self.config.shutdown_timeout
            ),
        }

        if let Err(e) = self.query.close().await {
            error!("Closing query connection failed: {}", e);
        }
    }
}
