use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use ndk_greeter::{
    config::{AgentConfig, DisabledStatePolicy, RetryConfig},
    greeter::ConfigRecord,
    ndk::{
        loopback::{LoopbackNdk, TelemetryChange},
        ConfigEvent, ConfigOperation, NdkClients, SdkMgrService,
    },
    query::StaticQueryClient,
    shutdown::{self, ShutdownTrigger},
    timestamp::FixedClock,
    Agent,
};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    // テストの前に一度だけ実行したい処理
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

const BOB_STATE: &str =
    r#"{"name":"Bob","greeting":"👋 Hi Bob, SR Linux was last booted 1h2m3s ago"}"#;

struct Harness {
    ndk: LoopbackNdk,
    changes: broadcast::Receiver<TelemetryChange>,
    shutdown: ShutdownTrigger,
    task: JoinHandle<Agent>,
}

impl Harness {
    async fn start(config: AgentConfig) -> Self {
        let ndk = LoopbackNdk::with_commit_end_path(config.commit_end_path.clone());
        let changes = ndk.watch_telemetry();
        let clients = NdkClients::from_shared(Arc::new(ndk.client(config.app_name.clone())));
        let query = Arc::new(StaticQueryClient::new(Some(
            "2024-01-01T00:00:00Z".to_string(),
        )));
        let clock = Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2024, 1, 1, 1, 2, 3).unwrap(),
        ));

        let mut agent = Agent::register(config, clients, query, clock)
            .await
            .unwrap();
        let (shutdown, signal) = shutdown::channel();
        let task = tokio::spawn(async move {
            agent.run(signal).await.unwrap();
            agent
        });

        Self {
            ndk,
            changes,
            shutdown,
            task,
        }
    }

    async fn commit(&self, events: Vec<ConfigEvent>) {
        self.ndk.commit(events).await;
    }

    async fn next_change(&mut self) -> TelemetryChange {
        timeout(Duration::from_secs(5), self.changes.recv())
            .await
            .expect("no telemetry change within 5s")
            .unwrap()
    }

    async fn stop(self) -> (LoopbackNdk, Agent) {
        self.shutdown.raise();
        let agent = timeout(Duration::from_secs(5), self.task)
            .await
            .expect("agent did not stop within 5s")
            .unwrap();
        (self.ndk, agent)
    }
}

fn update(payload: &str) -> ConfigEvent {
    ConfigEvent::new(".greeter", ConfigOperation::Update, payload)
}

#[tokio::test]
async fn test_publishes_greeting_for_configured_name() {
    let mut harness = Harness::start(AgentConfig::default()).await;

    harness.commit(vec![update(r#"{"name": "Bob"}"#)]).await;

    let change = harness.next_change().await;
    assert_eq!(change.agent_name, "greeter");
    assert_eq!(change.path, ".greeter");
    assert_eq!(change.json_content.as_deref(), Some(BOB_STATE));
    assert_eq!(harness.ndk.state(".greeter").as_deref(), Some(BOB_STATE));

    let (ndk, agent) = harness.stop().await;
    assert_eq!(agent.record().name, "Bob");
    assert!(!ndk.is_registered("greeter"));
}

#[tokio::test]
async fn test_malformed_event_does_not_spoil_transaction() {
    let mut harness = Harness::start(AgentConfig::default()).await;

    harness
        .commit(vec![update(r#"{"name": "#), update(r#"{"name": "Bob"}"#)])
        .await;
    let change = harness.next_change().await;
    assert_eq!(change.json_content.as_deref(), Some(BOB_STATE));

    // 壊れたイベントだけのコミットでも前の状態は残る
    harness.commit(vec![update("not json")]).await;
    let change = harness.next_change().await;
    assert_eq!(change.json_content.as_deref(), Some(BOB_STATE));

    harness.stop().await;
}

#[tokio::test]
async fn test_deleting_config_with_keep_policy() {
    let mut harness = Harness::start(AgentConfig::default()).await;

    harness.commit(vec![update(r#"{"name": "Bob"}"#)]).await;
    harness.next_change().await;

    harness.commit(vec![update("{}")]).await;
    harness.commit(vec![update(r#"{"name": "Bob"}"#)]).await;

    // 削除は何も発行しないので次の変化は再設定分になる
    let change = harness.next_change().await;
    assert_eq!(change.json_content.as_deref(), Some(BOB_STATE));

    harness.stop().await;
}

#[tokio::test]
async fn test_deleting_config_with_clear_policy() {
    let config = AgentConfig {
        disabled_state: DisabledStatePolicy::Clear,
        ..AgentConfig::default()
    };
    let mut harness = Harness::start(config).await;

    harness.commit(vec![update(r#"{"name": "Bob"}"#)]).await;
    harness.next_change().await;

    harness
        .commit(vec![ConfigEvent::new(
            ".greeter",
            ConfigOperation::Delete,
            "{}",
        )])
        .await;
    let change = harness.next_change().await;
    assert_eq!(change.json_content, None);
    assert_eq!(harness.ndk.state(".greeter"), None);

    let (_, agent) = harness.stop().await;
    assert_eq!(agent.record(), &ConfigRecord::default());
}

#[tokio::test]
async fn test_gives_up_when_subscription_keeps_failing() {
    let config = AgentConfig {
        retry: RetryConfig {
            interval: Duration::ZERO,
            max_attempts: Some(2),
        },
        ..AgentConfig::default()
    };
    let ndk = LoopbackNdk::new();
    ndk.fail_next_registrations(10);
    let clients = NdkClients::from_shared(Arc::new(ndk.client("greeter")));

    let mut agent = Agent::register(
        config,
        clients,
        Arc::new(StaticQueryClient::new(None)),
        Arc::new(FixedClock(Utc::now())),
    )
    .await
    .unwrap();
    assert!(ndk.is_registered("greeter"));

    // シャットダウンを送らなくても終了する
    let (_trigger, signal) = shutdown::channel();
    timeout(Duration::from_secs(5), agent.run(signal))
        .await
        .expect("agent did not give up")
        .unwrap();

    assert!(!ndk.is_registered("greeter"));
}

#[tokio::test]
async fn test_recovers_after_stream_loss() {
    let config = AgentConfig {
        retry: RetryConfig {
            interval: Duration::from_millis(10),
            max_attempts: None,
        },
        ..AgentConfig::default()
    };
    let mut harness = Harness::start(config).await;

    harness.commit(vec![update(r#"{"name": "Alice"}"#)]).await;
    harness.next_change().await;

    harness.ndk.close_streams();
    harness.commit(vec![update(r#"{"name": "Bob"}"#)]).await;

    let change = harness.next_change().await;
    assert_eq!(change.json_content.as_deref(), Some(BOB_STATE));

    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_before_run_leaves_no_stream_behind() {
    let config = AgentConfig {
        shutdown_timeout: Duration::from_secs(5),
        ..AgentConfig::default()
    };
    let ndk = LoopbackNdk::new();
    let clients = NdkClients::from_shared(Arc::new(ndk.client("greeter")));
    let mut agent = Agent::register(
        config,
        clients,
        Arc::new(StaticQueryClient::new(None)),
        Arc::new(FixedClock(Utc::now())),
    )
    .await
    .unwrap();

    let (trigger, signal) = shutdown::channel();
    trigger.raise();
    timeout(Duration::from_secs(1), agent.run(signal))
        .await
        .expect("agent waited out the shutdown timeout")
        .unwrap();
    assert!(!ndk.is_registered("greeter"));

    // 同じ名前で再登録しても停止済みのエージェントは再接続しない
    let successor = ndk.client("greeter");
    successor.agent_register().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ndk.open_stream_count(), 0);
}
