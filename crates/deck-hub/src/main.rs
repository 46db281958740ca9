mod config;
mod hub;
mod registry;
mod supervisor;

use chrono::Local;
use clap::Parser;
use hub::{router, HubConfig, HubState};
use registry::Registry;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use supervisor::Supervisor;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_ADDR: &str = "127.0.0.1:7878";
const DEFAULT_SERVICES_FILE: &str = "services.toml";
const SUPERVISOR_QUEUE_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    services_path: PathBuf,
    log_dir: String,
    log_lines: usize,
    stop_timeout: Duration,
    hub: HubConfig,
}

#[derive(Parser, Debug)]
#[command(name = "deck-hub", about = "Service control hub for workerdeck")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    /// TOML file with `[services.<category>]` tables.
    #[arg(long, default_value = "")]
    services: String,
    #[arg(long, default_value_t = false)]
    allow_remote: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = deck_core::DEFAULT_LOG_LIMIT)]
    log_lines: usize,
    /// Seconds between unsolicited status broadcasts; 0 disables.
    #[arg(long, default_value_t = 5)]
    status_interval: u64,
    #[arg(long, default_value_t = 30)]
    stale_seconds: u64,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 5)]
    stop_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !config.hub.allow_remote && !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr, reason = "non-loopback bind requires --allow-remote");
        return;
    }

    let services = match config::load_services(&config.services_path) {
        Ok(value) => value.services,
        Err(err) => {
            error!(event = "config_error", error = %err);
            return;
        }
    };
    if services.is_empty() {
        info!(event = "no_services", path = %config.services_path.display());
    }

    let (event_tx, event_rx) = mpsc::channel(SUPERVISOR_QUEUE_CAPACITY);
    let registry = Registry::new(services.keys().cloned(), config.log_lines);
    let supervisor = Supervisor::new(services, event_tx, config.stop_timeout);
    let hub = Arc::new(HubState::new(config.hub.clone(), registry, supervisor));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(hub.clone().pump_supervisor_events(event_rx));
    hub.clone().start_status_ticker(shutdown_rx.clone());
    hub.clone().start_stale_reaper(shutdown_rx);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        services = %config.services_path.display(),
        categories = ?hub.supervisor().categories()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        router(hub.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "hub_error", error = %err);
    }

    let _ = shutdown_tx.send(true);
    hub.supervisor().stop_all().await;
    info!(event = "hub_stop");
}

fn load_config() -> Config {
    let args = Args::parse();
    let debug = args.debug || env_true("DECK_HUB_DEBUG");
    Config {
        addr: resolve_flag(&args.addr, "DECK_HUB_ADDR", DEFAULT_ADDR),
        services_path: PathBuf::from(resolve_flag(
            &args.services,
            "DECK_SERVICES",
            DEFAULT_SERVICES_FILE,
        )),
        log_dir: resolve_flag(&args.log_dir, "DECK_LOG_DIR", ".deck/logs"),
        log_lines: args.log_lines.max(1),
        stop_timeout: Duration::from_secs(args.stop_timeout),
        hub: HubConfig {
            debug,
            allow_remote: args.allow_remote,
            stale_after: (args.stale_seconds > 0).then(|| Duration::from_secs(args.stale_seconds)),
            ping_interval: Duration::from_secs(args.ping_interval),
            write_timeout: Duration::from_secs(args.write_timeout),
            status_interval: Duration::from_secs(args.status_interval),
        },
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.hub.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("DECK_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Tees every formatted event to stdout and the optional log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let stamp = Local::now().format("%Y%m%d");
    let path = dir.join(format!("deck-hub-{stamp}-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Flag wins, then a non-empty env var, then the default.
fn resolve_flag(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}
