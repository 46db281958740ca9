use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use deck_core::{CommandKind, ServiceStatus, StatusMap, DEFAULT_LOG_LIMIT};
use deck_dashboard::{
    session::resolve_hub_url,
    ConnectionState, DashboardEvent, SessionConfig, SessionHandle,
};
use std::{io, time::Duration};
use tokio::{sync::broadcast, time::Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "deck-dashboard")]
#[command(about = "Watch and control workerdeck services", long_about = None)]
struct Cli {
    /// Hub websocket url (falls back to DECK_HUB_URL / DECK_HUB_ADDR).
    #[arg(long, global = true, default_value = "")]
    url: String,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    /// Seconds to wait for the hub handshake.
    #[arg(long, global = true, default_value_t = 5)]
    connect_timeout: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream status changes and log lines until interrupted
    Watch,
    /// Print one status snapshot
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Start a service category and wait for the outcome
    Start {
        category: String,
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// Stop a service category and wait for the outcome
    Stop {
        category: String,
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// Print recent log lines for a category
    Logs {
        category: String,
        #[arg(long, default_value_t = DEFAULT_LOG_LIMIT)]
        limit: usize,
        #[arg(long, default_value_t = false)]
        follow: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let url = resolve_hub_url(&cli.url)?;
    let mut config = SessionConfig::new(url.clone());
    if !matches!(cli.command, Commands::Watch) {
        config.max_retries = 1;
    }
    let (handle, task) = deck_dashboard::connect(config);
    let mut events = handle.subscribe();

    let connected = tokio::time::timeout(
        Duration::from_secs(cli.connect_timeout),
        handle.wait_for_state(ConnectionState::Connected),
    )
    .await;
    if !matches!(connected, Ok(true)) && !matches!(cli.command, Commands::Watch) {
        handle.disconnect();
        bail!("could not reach hub at {url}");
    }

    let result = match cli.command {
        Commands::Watch => watch(&handle, &mut events).await,
        Commands::Status { json } => status(&handle, &mut events, json).await,
        Commands::Start { category, wait } => {
            command(&handle, &mut events, CommandKind::Start, &category, wait).await
        }
        Commands::Stop { category, wait } => {
            command(&handle, &mut events, CommandKind::Stop, &category, wait).await
        }
        Commands::Logs {
            category,
            limit,
            follow,
        } => logs(&handle, &mut events, &category, limit, follow).await,
    };

    handle.disconnect();
    let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    result
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("DECK_LOG_LEVEL") {
        level
    } else {
        "warn".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

async fn next_event(events: &mut broadcast::Receiver<DashboardEvent>) -> Result<DashboardEvent> {
    loop {
        match events.recv().await {
            Ok(event) => return Ok(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(event = "events_lagged", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => bail!("session closed"),
        }
    }
}

/// Waits for the first snapshot of this connection.
async fn first_snapshot(
    handle: &SessionHandle,
    events: &mut broadcast::Receiver<DashboardEvent>,
) -> Result<StatusMap> {
    loop {
        match next_event(events).await? {
            DashboardEvent::StatusChanged => return Ok(handle.view().services),
            DashboardEvent::Disconnected => bail!("hub closed the connection"),
            _ => {}
        }
    }
}

async fn watch(handle: &SessionHandle, events: &mut broadcast::Receiver<DashboardEvent>) -> Result<()> {
    let mut state = handle.on_state_change();
    println!("[{}] {}", now(), state.borrow_and_update().as_str());
    let mut last = StatusMap::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            changed = state.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = *state.borrow_and_update();
                println!("[{}] {}", now(), current.as_str());
            }
            event = next_event(events) => match event? {
                DashboardEvent::StatusChanged => {
                    let services = handle.view().services;
                    if services != last {
                        print_status(&services);
                        last = services;
                    }
                }
                DashboardEvent::LogLine { category, service, line } => {
                    let service = service.unwrap_or_else(|| category.clone());
                    println!("{category} | {service} | {line}");
                }
                DashboardEvent::History { category, .. } => {
                    for line in handle.view().logs.get(&category).into_iter().flatten() {
                        println!("{category} | history | {line}");
                    }
                }
                DashboardEvent::Acked { kind, message } => println!("[{}] {kind} ack: {message}", now()),
                DashboardEvent::PendingExpired { category, kind } => {
                    println!("[{}] {kind} {category}: no confirmation within timeout", now());
                }
                DashboardEvent::HubError { code, message } => println!("[{}] hub error {code}: {message}", now()),
                DashboardEvent::Connected { .. }
                | DashboardEvent::Disconnected
                | DashboardEvent::CommandRejected { .. } => {}
            },
        }
    }
}

async fn status(
    handle: &SessionHandle,
    events: &mut broadcast::Receiver<DashboardEvent>,
    json: bool,
) -> Result<()> {
    let services = first_snapshot(handle, events).await?;
    if json {
        let text = serde_json::to_string_pretty(&services).context("encode status")?;
        println!("{text}");
    } else {
        print_status(&services);
    }
    Ok(())
}

async fn command(
    handle: &SessionHandle,
    events: &mut broadcast::Receiver<DashboardEvent>,
    kind: CommandKind,
    category: &str,
    wait: u64,
) -> Result<()> {
    first_snapshot(handle, events).await?;
    handle
        .dispatch(kind, category)
        .with_context(|| format!("{kind} {category}"))?;

    let deadline = Instant::now() + Duration::from_secs(wait);
    loop {
        let event = tokio::time::timeout_at(deadline, next_event(events))
            .await
            .map_err(|_| anyhow!("{kind} {category}: no outcome within {wait}s"))??;
        match event {
            DashboardEvent::HubError { code, message } => bail!("{kind} {category}: {code}: {message}"),
            DashboardEvent::CommandRejected { error, .. } => bail!("{kind} {category}: {error}"),
            DashboardEvent::Disconnected => bail!("{kind} {category}: hub connection lost"),
            DashboardEvent::PendingExpired { .. } => {
                bail!("{kind} {category}: hub did not confirm in time")
            }
            _ => {}
        }
        let view = handle.view();
        if view.pending.contains_key(category) {
            continue;
        }
        if let Some(status) = view.services.get(category) {
            if status.running == kind.expected_running() {
                println!("{}", format_status(category, status));
                return Ok(());
            }
        }
    }
}

async fn logs(
    handle: &SessionHandle,
    events: &mut broadcast::Receiver<DashboardEvent>,
    category: &str,
    limit: usize,
    follow: bool,
) -> Result<()> {
    first_snapshot(handle, events).await?;
    handle
        .request_history(category, limit)
        .with_context(|| format!("logs {category}"))?;
    loop {
        match next_event(events).await? {
            DashboardEvent::History { category: got, .. } if got == category => break,
            DashboardEvent::HubError { code, message } => bail!("logs {category}: {code}: {message}"),
            _ => {}
        }
    }
    let view = handle.view();
    for line in view.logs.get(category).into_iter().flatten() {
        println!("{line}");
    }
    if !follow {
        return Ok(());
    }
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = next_event(events) => match event? {
                DashboardEvent::LogLine { category: got, line, .. } if got == category => println!("{line}"),
                DashboardEvent::Disconnected => println!("[{}] disconnected, waiting for hub", now()),
                _ => {}
            },
        }
    }
}

fn print_status(services: &StatusMap) {
    if services.is_empty() {
        println!("(no services)");
        return;
    }
    for (category, status) in services {
        println!("{}", format_status(category, status));
    }
}

fn format_status(category: &str, status: &ServiceStatus) -> String {
    let pid = status
        .pid
        .map(|pid| pid.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{category:<16} {:<9} pid={pid:<8} processes={}",
        status.status, status.process_count
    )
}

fn now() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}
