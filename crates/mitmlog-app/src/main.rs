//! mitmlog - intercepting HTTP/HTTPS proxy that records every request.
//!
//! Runs the proxy in the foreground until Ctrl-C, or inspects the request
//! log and the root certificate.

use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use mitmlog_proxy::{CaManager, ProxyConfig, ProxyServer, UpstreamConfig, DEFAULT_PROXY_PORT};
use mitmlog_storage::{Database, LoggedRequest, DEFAULT_DB_PATH};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// mitmlog - intercepting proxy that logs every request it sees
#[derive(Parser, Debug)]
#[command(name = "mitmlog", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, global = true, default_value_t = default_addr())]
    addr: SocketAddr,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Also write daily-rotated log files to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Request log database
    #[arg(long, global = true, default_value = DEFAULT_DB_PATH)]
    db: PathBuf,

    /// Directory holding the root certificate and key
    #[arg(long, global = true)]
    ca_dir: Option<PathBuf>,

    /// Ignore HTTP_PROXY/HTTPS_PROXY when forwarding
    #[arg(long, global = true)]
    no_env_proxy: bool,

    /// Validate upstream server certificates
    #[arg(long, global = true)]
    verify_upstream: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Run the proxy (default)
    Serve,
    /// Print the most recent logged requests
    Requests {
        /// Number of rows to show
        #[arg(long, default_value_t = 20)]
        limit: i64,

        /// Print rows as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the root certificate for installation into a trust store
    CaCert,
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT))
}

impl Args {
    fn ca_manager(&self) -> anyhow::Result<CaManager> {
        match &self.ca_dir {
            Some(dir) => Ok(CaManager::new(dir)),
            None => CaManager::with_default_dir().context("Cannot locate the CA directory"),
        }
    }

    fn proxy_config(&self) -> anyhow::Result<ProxyConfig> {
        let upstream = UpstreamConfig::default()
            .with_env_proxy(!self.no_env_proxy)
            .with_certificate_validation(self.verify_upstream);

        Ok(ProxyConfig::with_ca_dir(self.ca_manager()?.ca_dir())
            .with_addr(self.addr)
            .with_upstream(upstream))
    }
}

/// Initialize console logging, plus rotated files when `--log-dir` is set.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.verbose { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mitmlog={},warn", log_level)));

    if let Some(log_dir) = &args.log_dir {
        let file_appender = std::fs::create_dir_all(log_dir).ok().and_then(|_| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("mitmlog")
                .filename_suffix("log")
                .build(log_dir)
                .ok()
        });

        if let Some(appender) = file_appender {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();

            tracing::info!("Logging to {:?}", log_dir);
            return Some(guard);
        }

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        tracing::warn!("Cannot write logs to {:?}, using console only", log_dir);
        return None;
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    let result = match args.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(&args).await,
        Command::Requests { limit, json } => print_requests(&args.db, limit, json),
        Command::CaCert => print_ca_cert(&args),
    };

    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }
    result
}

async fn serve(args: &Args) -> anyhow::Result<()> {
    let db = Database::with_path(&args.db)
        .with_context(|| format!("Failed to open request log {}", args.db.display()))?;

    let server = ProxyServer::new(args.proxy_config()?, db).context("Failed to create proxy")?;
    let ca_cert = server.ca_cert_path();
    let handle = server.start().await.context("Failed to start proxy")?;

    tracing::info!("Logging requests to {}", args.db.display());
    tracing::info!(
        "Proxy ready on {} (trust {} in clients)",
        handle.addr(),
        ca_cert.display()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down, waiting for open connections");
    handle.stop().await;
    Ok(())
}

fn print_requests(db_path: &Path, limit: i64, json: bool) -> anyhow::Result<()> {
    let db = Database::open_read_only(db_path)
        .with_context(|| format!("Failed to open request log {}", db_path.display()))?;
    let rows = db.get_recent_requests(limit, 0)?;

    let mut out = std::io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, &rows)?;
        writeln!(out)?;
    } else {
        for row in &rows {
            writeln!(out, "{}", format_row(row))?;
        }
    }
    Ok(())
}

fn format_row(row: &LoggedRequest) -> String {
    format!(
        "{:>6}  {}  {:<15}  {:<7} {} {}",
        row.id,
        row.created_at.format("%Y-%m-%d %H:%M:%S"),
        row.source_ip,
        row.method,
        row.host,
        row.url
    )
}

fn print_ca_cert(args: &Args) -> anyhow::Result<()> {
    let ca = args.ca_manager()?;
    ca.ensure_ca().context("Failed to load or generate the root CA")?;
    let pem = ca.read_cert_pem()?;

    eprintln!("{}", ca.cert_path().display());
    print!("{}", pem);
    Ok(())
}
