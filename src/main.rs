use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tetherd::{
    bridge::{Bridge, TOKEN_ENV},
    credentials::CredentialStore,
    provider::EchoProvider,
    BridgeConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tetherd",
    about = "Tether Host — local bridge daemon connecting a workstation to the control plane",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Control-plane WebSocket URL
    #[arg(long, env = "TETHERD_URL")]
    url: Option<String>,

    /// Data directory for config and credentials
    #[arg(long, env = "TETHERD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TETHERD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "TETHERD_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the control plane and serve dispatched work (default).
    ///
    /// Runs tetherd in the foreground until interrupted. Exit codes:
    /// 0 on clean shutdown, 1 on startup failure, 2 when the reconnect
    /// budget is exhausted.
    ///
    /// Examples:
    ///   tetherd serve
    ///   tetherd
    Serve,
    /// Run preflight checks on credentials and control-plane reachability.
    ///
    /// Verifies that credentials are present and not expired, and that the
    /// control-plane host answers HTTP on the session URL's host.
    ///
    /// Exit code 0 if all checks pass, 1 if any check fails.
    ///
    /// Examples:
    ///   tetherd check
    Check,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = BridgeConfig::new(args.url.clone(), args.data_dir.clone(), args.log.clone());
    let _log_guard = init_tracing(&config.log, args.log_file.as_deref());

    let code = match args.command.unwrap_or(Command::Serve) {
        Command::Serve => match serve(config).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("tetherd: {e:#}");
                1
            }
        },
        Command::Check => check(config).await,
    };
    std::process::exit(code);
}

async fn serve(config: BridgeConfig) -> Result<i32> {
    info!(
        url = %config.url,
        data_dir = %config.data_dir.display(),
        version = env!("CARGO_PKG_VERSION"),
        "starting tetherd"
    );
    let bridge =
        Bridge::build(config, Arc::new(EchoProvider)).context("failed to build bridge")?;
    let code = bridge.run().await.context("bridge startup failed")?;
    Ok(code)
}

/// Preflight: credentials present and valid, control plane reachable.
async fn check(config: BridgeConfig) -> i32 {
    let mut failed = false;

    // Credentials: env override or the credentials file.
    let env_token = std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty());
    if env_token.is_some() {
        println!("✓ access token supplied via {TOKEN_ENV}");
    } else {
        let store = CredentialStore::new(config.data_dir.join("credentials.json"));
        match store.load() {
            Ok(creds) if creds.is_valid() => {
                println!("✓ credentials file valid (expires {})", creds.expires_at);
            }
            Ok(creds) if !creds.refresh_token.is_empty() => {
                println!(
                    "✓ access token stale but refreshable (expired {})",
                    creds.expires_at
                );
            }
            Ok(_) => {
                println!("✗ credentials expired and no refresh token available");
                failed = true;
            }
            Err(e) => {
                println!("✗ credentials unreadable: {e}");
                failed = true;
            }
        }
    }

    // Control-plane reachability: probe the HTTP side of the session host.
    match probe_url(&config.url) {
        Ok(probe) => {
            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .unwrap_or_default();
            // Any HTTP answer counts — only a connection failure is fatal.
            match client.get(&probe).send().await {
                Ok(resp) => println!("✓ control plane reachable ({})", resp.status()),
                Err(e) => {
                    println!("✗ control plane unreachable: {e}");
                    failed = true;
                }
            }
        }
        Err(e) => {
            println!("✗ invalid session URL: {e}");
            failed = true;
        }
    }

    if failed {
        1
    } else {
        0
    }
}

fn probe_url(session_url: &str) -> Result<String, tetherd::AgentError> {
    let refresh = tetherd::credentials::refresher::TokenRefresher::refresh_url_from_session(
        session_url,
    )?;
    // Probe the host root rather than the refresh endpoint.
    let base = refresh
        .rsplit_once("/api/v1/agent/refresh")
        .map(|(base, _)| base.to_string())
        .unwrap_or(refresh);
    Ok(base)
}

fn init_tracing(
    filter: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "tetherd.log".to_string());
            let appender = tracing_appender::rolling::daily(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            None
        }
    }
}
