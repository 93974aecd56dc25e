use std::sync::Arc;

use clap::Parser;
use ndk_greeter::{
    config::AgentConfig,
    harness, logging,
    ndk::{loopback::LoopbackNdk, NdkClients},
    query,
    shutdown::{self, ShutdownTrigger},
    timestamp::SystemClock,
    Agent, InternalResult,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(author, about, long_about = None, disable_version_flag = true)]
struct Cli {
    /// Print version and exit
    #[arg(long)]
    version: bool,
}

fn version() -> String {
    format!(
        "{}-{}",
        env!("CARGO_PKG_VERSION"),
        option_env!("GREETER_COMMIT").unwrap_or("dev")
    )
}

/// Raises the shutdown signal on SIGINT or SIGTERM.
fn spawn_signal_handler(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        trigger.raise();
    });
}

/// Turns stdin lines into commits on the loopback manager.
fn spawn_stdin_feeder(ndk: LoopbackNdk, config_path: String) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match harness::parse_commit_line(&line, &config_path) {
                    Ok(events) if events.is_empty() => {}
                    Ok(events) => {
                        let reached = ndk.commit(events).await;
                        debug!(streams = reached, "commit delivered");
                    }
                    Err(e) => eprintln!("invalid commit line: {}", e),
                },
                Ok(None) => {
                    debug!("stdin closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
}

fn spawn_state_printer(ndk: &LoopbackNdk) {
    let mut changes = ndk.watch_telemetry();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => match change.json_content {
                    Some(json) => println!("{} {}", change.path, json),
                    None => println!("{} <deleted>", change.path),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("state printer skipped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn run(config: AgentConfig) -> InternalResult<()> {
    info!(
        version = %version(),
        "starting {} against the loopback NDK manager",
        config.app_name
    );

    let ndk = LoopbackNdk::with_commit_end_path(config.commit_end_path.clone());
    let clients = NdkClients::from_shared(Arc::new(ndk.client(config.app_name.clone())));
    let query = query::connect(&config.query)?;

    let config_path = config.config_path.clone();
    let mut agent = Agent::register(config, clients, query, Arc::new(SystemClock)).await?;

    let (trigger, shutdown) = shutdown::channel();
    spawn_signal_handler(trigger);
    spawn_state_printer(&ndk);
    spawn_stdin_feeder(ndk, config_path);

    agent.run(shutdown).await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("{}", version());
        return;
    }

    let config = match AgentConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
